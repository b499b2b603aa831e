//! Peer store
//!
//! The single owner of peer state. Mutations are queued to one worker task
//! and run in arrival order through the same pipeline: validate, mutate a
//! working copy, persist, commit, apply to the live interface. Reads are
//! served from a snapshot the worker publishes after each commit, so they
//! never wait behind a slow sync.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::allocator::AddressAllocator;
use crate::config::{LegacyConfig, Settings};
use crate::error::{PeerGuardError, PersistenceError, Result, SyncError};
use crate::keys::KeyManager;
use crate::model::{parse_ipv4, InterfaceRecord, Peer, PeerCommand, PeerId, PeerName, PeerView};
use crate::persistence::{PersistedState, StateBackend};
use crate::render::{self, Interface};
use crate::sync::InterfaceSync;

/// Pending mutations before callers start waiting on `send`
const QUEUE_DEPTH: usize = 64;

/// Result of a [`PeerCommand`]
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// Carries the private key; the only time it leaves the store
    Created(Peer),
    Updated(PeerView),
    Deleted(PeerId),
}

/// Whether the live interface matches persisted state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub needs_sync: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct Snapshot {
    interface: InterfaceRecord,
    peers: Vec<Peer>,
    status: SyncStatus,
}

struct Shared {
    settings: Settings,
    live: Arc<dyn InterfaceSync>,
    snapshot: RwLock<Snapshot>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(|e| e.into_inner())
    }
}

enum Job {
    Execute {
        command: PeerCommand,
        reply: oneshot::Sender<Result<CommandOutcome>>,
    },
    Reconcile {
        reply: oneshot::Sender<Result<()>>,
    },
    BringUp {
        reply: oneshot::Sender<Result<()>>,
    },
    BringDown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the peer store. Cheap to clone; every clone feeds the same
/// worker.
#[derive(Clone)]
pub struct PeerStore {
    shared: Arc<Shared>,
    jobs: mpsc::Sender<Job>,
}

impl PeerStore {
    /// Load persisted state (or bootstrap it) and start the worker
    ///
    /// With no saved state, an existing wg-quick file at
    /// `settings.config_file()` is migrated; otherwise fresh interface keys
    /// are generated. Either way the result is saved before returning.
    pub async fn open(
        settings: Settings,
        keys: Arc<dyn KeyManager>,
        live: Arc<dyn InterfaceSync>,
        backend: Arc<dyn StateBackend>,
    ) -> Result<Self> {
        let state = match backend.load().await? {
            Some(state) => {
                tracing::info!("Loaded {} peers", state.peers.len());
                state
            }
            None => {
                let state = bootstrap(&settings, keys.as_ref()).await?;
                backend.save(&state).await?;
                state
            }
        };

        let allocator = rebuild_allocator(&settings, &state)?;

        let shared = Arc::new(Shared {
            settings,
            live,
            snapshot: RwLock::new(Snapshot {
                interface: state.interface.clone(),
                peers: state.peers.clone(),
                status: SyncStatus::default(),
            }),
        });

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let worker = Worker {
            shared: shared.clone(),
            state,
            allocator,
            keys,
            backend,
            up: false,
        };
        tokio::spawn(worker.run(rx));

        Ok(Self { shared, jobs: tx })
    }

    async fn request<T>(&self, job: impl FnOnce(oneshot::Sender<Result<T>>) -> Job) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(job(reply))
            .await
            .map_err(|_| PeerGuardError::internal("peer store worker has stopped"))?;
        rx.await
            .map_err(|_| PeerGuardError::internal("peer store worker dropped the request"))?
    }

    /// Queue a mutation and wait for it to finish
    pub async fn execute(&self, command: PeerCommand) -> Result<CommandOutcome> {
        self.request(|reply| Job::Execute { command, reply }).await
    }

    /// Create an enabled peer with fresh keys and the lowest free address
    pub async fn create(&self, name: &str) -> Result<Peer> {
        match self.execute(PeerCommand::create(name)?).await? {
            CommandOutcome::Created(peer) => Ok(peer),
            other => Err(unexpected("create", &other)),
        }
    }

    pub async fn delete(&self, id: PeerId) -> Result<()> {
        match self.execute(PeerCommand::Delete { id }).await? {
            CommandOutcome::Deleted(_) => Ok(()),
            other => Err(unexpected("delete", &other)),
        }
    }

    /// Setting the current value succeeds without touching anything
    pub async fn set_enabled(&self, id: PeerId, enabled: bool) -> Result<PeerView> {
        updated("set_enabled", self.execute(PeerCommand::SetEnabled { id, enabled }).await?)
    }

    pub async fn rename(&self, id: PeerId, name: &str) -> Result<PeerView> {
        let name = PeerName::new(name)?;
        updated("rename", self.execute(PeerCommand::Rename { id, name }).await?)
    }

    pub async fn readdress(&self, id: PeerId, address: &str) -> Result<PeerView> {
        let address = parse_ipv4(address)?;
        updated("readdress", self.execute(PeerCommand::Readdress { id, address }).await?)
    }

    pub fn get(&self, id: PeerId) -> Result<PeerView> {
        self.shared
            .read()
            .peers
            .iter()
            .find(|p| p.id == id)
            .map(Peer::view)
            .ok_or_else(|| not_found(id))
    }

    /// All peers in creation order
    pub fn list(&self) -> Vec<PeerView> {
        self.shared.read().peers.iter().map(Peer::view).collect()
    }

    /// Like [`list`](Self::list), with handshake and transfer counters from
    /// the live interface. A failed query degrades to plain views.
    pub async fn list_with_stats(&self) -> Vec<PeerView> {
        let views = self.list();
        match self.shared.live.current_stats().await {
            Ok(stats) => views
                .into_iter()
                .map(|view| match stats.get(&view.public_key) {
                    Some(s) => view.with_stats(s),
                    None => view,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Could not read interface statistics: {}", e);
                views
            }
        }
    }

    pub fn interface_public_key(&self) -> String {
        self.shared.read().interface.public_key.clone()
    }

    /// Full wg-quick file for the interface
    pub fn interface_config(&self) -> Result<String> {
        let snapshot = self.shared.read();
        render::render_quick_config(
            Interface::new(&snapshot.interface, &self.shared.settings),
            &snapshot.peers,
        )
    }

    /// Client configuration for one peer
    pub fn peer_config(&self, id: PeerId) -> Result<String> {
        let snapshot = self.shared.read();
        let peer = snapshot
            .peers
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| not_found(id))?;
        render::render_client_config(Interface::new(&snapshot.interface, &self.shared.settings), peer)
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.shared.read().status.clone()
    }

    /// Re-apply the full configuration to the live interface now
    pub async fn reconcile(&self) -> Result<()> {
        self.request(|reply| Job::Reconcile { reply }).await
    }

    /// Write the wg-quick file and start the interface
    pub async fn bring_up(&self) -> Result<()> {
        self.request(|reply| Job::BringUp { reply }).await
    }

    pub async fn bring_down(&self) -> Result<()> {
        self.request(|reply| Job::BringDown { reply }).await
    }
}

struct Worker {
    shared: Arc<Shared>,
    state: PersistedState,
    allocator: AddressAllocator,
    keys: Arc<dyn KeyManager>,
    backend: Arc<dyn StateBackend>,
    /// Periodic reconciliation only runs while the interface is up
    up: bool,
}

impl Worker {
    async fn run(mut self, mut jobs: mpsc::Receiver<Job>) {
        let mut ticker = self.shared.settings.reconcile_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => self.handle(job).await,
                    None => {
                        tracing::debug!("All store handles dropped, worker exiting");
                        break;
                    }
                },

                _ = next_tick(&mut ticker) => {
                    if self.up {
                        // Failures are logged and recorded by sync()
                        let _ = self.sync().await;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, job: Job) {
        // A caller that stopped waiting does not cancel the operation
        match job {
            Job::Execute { command, reply } => {
                let _ = reply.send(self.execute(command).await);
            }
            Job::Reconcile { reply } => {
                let _ = reply.send(self.sync().await);
            }
            Job::BringUp { reply } => {
                let _ = reply.send(self.bring_up().await);
            }
            Job::BringDown { reply } => {
                let _ = reply.send(self.bring_down().await);
            }
        }
    }

    async fn execute(&mut self, command: PeerCommand) -> Result<CommandOutcome> {
        let op = command.name();
        let mut state = self.state.clone();
        let mut allocator = self.allocator.clone();

        let (outcome, changed) = match self.mutate(&mut state, &mut allocator, command).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!("{} rejected: {}", op, e);
                return Err(e);
            }
        };
        if !changed {
            tracing::debug!("{}: nothing to change", op);
            return Ok(outcome);
        }

        // Dropping the working copy is the rollback
        if let Err(e) = self.backend.save(&state).await {
            tracing::error!("{}: persist failed, change discarded: {}", op, e);
            return Err(e.into());
        }

        self.state = state;
        self.allocator = allocator;
        self.shared.write().peers = self.state.peers.clone();

        self.sync().await?;
        Ok(outcome)
    }

    async fn mutate(
        &self,
        state: &mut PersistedState,
        allocator: &mut AddressAllocator,
        command: PeerCommand,
    ) -> Result<(CommandOutcome, bool)> {
        let now = Utc::now();

        match command {
            PeerCommand::Create { name } => {
                let id = fresh_id(state);
                let address = allocator.allocate(id)?;
                let pair = self.keys.generate_key_pair().await?;
                let preshared_key = self.keys.generate_preshared_key().await?;

                let peer = Peer {
                    id,
                    name,
                    address,
                    private_key: Some(pair.private_key),
                    public_key: pair.public_key,
                    preshared_key: Some(preshared_key),
                    enabled: true,
                    allowed_ips: None,
                    server_allowed_ips: None,
                    persistent_keepalive: self.shared.settings.persistent_keepalive,
                    extensions: None,
                    created_at: now,
                    updated_at: now,
                };
                tracing::info!("Creating peer {:?} ({}) at {}", peer.name.as_str(), id, address);
                state.peers.push(peer.clone());
                Ok((CommandOutcome::Created(peer), true))
            }

            PeerCommand::Delete { id } => {
                let index = state
                    .peers
                    .iter()
                    .position(|p| p.id == id)
                    .ok_or_else(|| not_found(id))?;
                let peer = state.peers.remove(index);
                allocator.release(peer.address);
                state.retired_ids.push(id);
                tracing::info!("Deleting peer {:?} ({})", peer.name.as_str(), id);
                Ok((CommandOutcome::Deleted(id), true))
            }

            PeerCommand::SetEnabled { id, enabled } => {
                let peer = find_mut(state, id)?;
                if peer.enabled == enabled {
                    return Ok((CommandOutcome::Updated(peer.view()), false));
                }
                peer.enabled = enabled;
                peer.updated_at = now;
                tracing::info!(
                    "{} peer {:?} ({})",
                    if enabled { "Enabling" } else { "Disabling" },
                    peer.name.as_str(),
                    id
                );
                Ok((CommandOutcome::Updated(peer.view()), true))
            }

            PeerCommand::Rename { id, name } => {
                let peer = find_mut(state, id)?;
                if peer.name == name {
                    return Ok((CommandOutcome::Updated(peer.view()), false));
                }
                tracing::info!("Renaming peer {} to {:?}", id, name.as_str());
                peer.name = name;
                peer.updated_at = now;
                Ok((CommandOutcome::Updated(peer.view()), true))
            }

            PeerCommand::Readdress { id, address } => {
                let current = find_mut(state, id)?.address;
                allocator.validate(address, id)?;
                if current == address {
                    let peer = find_mut(state, id)?;
                    return Ok((CommandOutcome::Updated(peer.view()), false));
                }

                allocator.release(current);
                allocator.assign(address, id)?;

                let peer = find_mut(state, id)?;
                peer.address = address;
                // Keep a migrated route override pointing at the new host
                if let Some(routes) = peer.server_allowed_ips.as_mut() {
                    for net in routes.iter_mut() {
                        if *net == host_route(current) {
                            *net = host_route(address);
                        }
                    }
                }
                peer.updated_at = now;
                tracing::info!("Moving peer {} from {} to {}", id, current, address);
                Ok((CommandOutcome::Updated(peer.view()), true))
            }
        }
    }

    /// Rewrite the wg-quick file and push the full configuration to the
    /// live interface. Both are retried on the next sync if either fails.
    async fn sync(&mut self) -> Result<()> {
        let iface = Interface::new(&self.state.interface, &self.shared.settings);
        let text = render::render_sync_config(iface, &self.state.peers)?;
        let quick = render::render_quick_config(iface, &self.state.peers)?;

        let live = &self.shared.live;
        let written = live.write_config(&quick).await;
        let result = written.and(live.apply(&text).await);
        self.record_sync(result.as_ref().err());
        result.map_err(|e| {
            tracing::warn!("Live sync failed, saved state will be re-applied: {}", e);
            e.into()
        })
    }

    fn record_sync(&self, error: Option<&SyncError>) {
        let mut snapshot = self.shared.write();
        match error {
            None => {
                snapshot.status = SyncStatus {
                    needs_sync: false,
                    last_synced_at: Some(Utc::now()),
                    last_error: None,
                }
            }
            Some(e) => {
                snapshot.status.needs_sync = true;
                snapshot.status.last_error = Some(e.to_string());
            }
        }
    }

    async fn bring_up(&mut self) -> Result<()> {
        let text = render::render_quick_config(
            Interface::new(&self.state.interface, &self.shared.settings),
            &self.state.peers,
        )?;
        self.shared.live.bring_up(&text).await?;
        self.up = true;
        self.record_sync(None);
        Ok(())
    }

    async fn bring_down(&mut self) -> Result<()> {
        self.up = false;
        self.shared.live.bring_down().await?;
        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// First-boot state: migrate a legacy file if there is one, else new keys
async fn bootstrap(settings: &Settings, keys: &dyn KeyManager) -> Result<PersistedState> {
    let legacy_path = settings.config_file();
    if tokio::fs::try_exists(&legacy_path).await.unwrap_or(false) {
        tracing::info!("Migrating existing configuration from {:?}", legacy_path);
        let legacy = LegacyConfig::from_file(&legacy_path).await?;
        return migrate(legacy, settings, keys).await;
    }

    tracing::info!("No saved state, generating interface keys");
    let pair = keys.generate_key_pair().await?;
    Ok(PersistedState::new(InterfaceRecord {
        private_key: pair.private_key,
        public_key: pair.public_key,
        address: settings.address_template.interface_address(),
    }))
}

/// Turn a parsed legacy file into persisted state
///
/// The interface private key is kept. Peers that cannot be placed in the
/// subnet are skipped with a warning.
async fn migrate(
    legacy: LegacyConfig,
    settings: &Settings,
    keys: &dyn KeyManager,
) -> Result<PersistedState> {
    let template = settings.address_template;
    let subnet = template.subnet();

    if let Some(address) = legacy.interface.address {
        if !subnet.contains(&address.addr()) {
            tracing::warn!(
                "Existing interface address {} is outside {}, using {}",
                address,
                subnet,
                template.interface_address()
            );
        }
    }

    // Port and MTU always come from settings
    if let Some(port) = legacy.interface.listen_port {
        if port != settings.listen_port {
            tracing::warn!(
                "Existing ListenPort {} differs from WG_PORT, using {}",
                port,
                settings.listen_port
            );
        }
    }
    if legacy.interface.mtu.is_some() && legacy.interface.mtu != settings.mtu {
        tracing::warn!(
            "Existing MTU {:?} differs from WG_MTU, using {:?}",
            legacy.interface.mtu,
            settings.mtu
        );
    }

    let public_key = keys.derive_public_key(&legacy.interface.private_key).await?;
    let mut state = PersistedState::new(InterfaceRecord {
        private_key: legacy.interface.private_key,
        public_key,
        address: template.interface_address(),
    });
    let mut allocator = AddressAllocator::new(template);
    let total = legacy.peers.len() + legacy.warnings.len();
    let now = Utc::now();

    for (index, old) in legacy.peers.into_iter().enumerate() {
        let Some(address) = old.host_address(&subnet) else {
            tracing::warn!(
                "Skipping peer at line {}: no host address inside {}",
                old.line,
                subnet
            );
            continue;
        };

        let id = match old.id.as_deref().map(str::parse::<PeerId>) {
            Some(Ok(id)) if !state.peers.iter().any(|p| p.id == id) => id,
            _ => fresh_id(&state),
        };

        if let Err(e) = allocator.validate(address, id) {
            tracing::warn!("Skipping peer at line {}: {}", old.line, e);
            continue;
        }
        allocator.assign(address, id)?;

        let name = match old.name.map(PeerName::new) {
            Some(Ok(name)) => name,
            _ => PeerName::new(format!("peer-{}", index + 1))?,
        };
        let server_allowed_ips =
            (old.allowed_ips != [host_route(address)]).then(|| old.allowed_ips.clone());
        let extensions = (!old.extensions.is_empty()).then(|| old.extensions.join("\n"));

        state.peers.push(Peer {
            id,
            name,
            address,
            private_key: None,
            public_key: old.public_key,
            preshared_key: old.preshared_key,
            enabled: true,
            allowed_ips: None,
            server_allowed_ips,
            persistent_keepalive: old.persistent_keepalive.unwrap_or(0),
            extensions,
            created_at: now,
            updated_at: now,
        });
    }

    tracing::info!("Migrated {} of {} peers", state.peers.len(), total);
    Ok(state)
}

fn rebuild_allocator(settings: &Settings, state: &PersistedState) -> Result<AddressAllocator> {
    let corrupt = |reason: String| PersistenceError::Corrupt {
        path: settings.state_file(),
        reason,
    };

    let mut allocator = AddressAllocator::new(settings.address_template);
    let mut ids = HashSet::new();
    for peer in &state.peers {
        if !ids.insert(peer.id) {
            return Err(corrupt(format!("peer id {} appears more than once", peer.id)).into());
        }
        if !settings.address_template.contains(peer.address) {
            tracing::warn!(
                "Peer {} has address {} outside {}",
                peer.id,
                peer.address,
                settings.address_template.subnet()
            );
        }
        allocator
            .assign(peer.address, peer.id)
            .map_err(|_| corrupt(format!("address {} is assigned to more than one peer", peer.address)))?;
    }
    tracing::debug!("{} peer addresses in use", allocator.assigned_count());
    Ok(allocator)
}

/// A random id not held by a live or deleted peer
fn fresh_id(state: &PersistedState) -> PeerId {
    let taken: HashSet<PeerId> = state
        .peers
        .iter()
        .map(|p| p.id)
        .chain(state.retired_ids.iter().copied())
        .collect();
    loop {
        let id = PeerId::random();
        if !taken.contains(&id) {
            return id;
        }
    }
}

fn find_mut(state: &mut PersistedState, id: PeerId) -> Result<&mut Peer> {
    state
        .peers
        .iter_mut()
        .find(|p| p.id == id)
        .ok_or_else(|| not_found(id))
}

fn host_route(address: Ipv4Addr) -> IpNet {
    IpNet::from(IpAddr::V4(address))
}

fn not_found(id: PeerId) -> PeerGuardError {
    PeerGuardError::NotFound { id: id.to_string() }
}

fn updated(op: &str, outcome: CommandOutcome) -> Result<PeerView> {
    match outcome {
        CommandOutcome::Updated(view) => Ok(view),
        other => Err(unexpected(op, &other)),
    }
}

fn unexpected(op: &str, outcome: &CommandOutcome) -> PeerGuardError {
    PeerGuardError::internal(format!("unexpected outcome for {}: {:?}", op, outcome))
}
