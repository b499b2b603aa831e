//! PeerGuard - WireGuard peer manager
//!
//! Owns the peer set of one WireGuard interface: allocates addresses,
//! generates keys, persists state and keeps the kernel interface in sync
//! with it. Client configuration is rendered on demand for provisioning.
//!
//! # Features
//!
//! - Serialized mutation queue with persist-then-apply pipeline
//! - Atomic JSON state file
//! - Full peer-set reconciliation via `wg syncconf`
//! - First-boot migration of an existing wg-quick file
//! - In-process or `wg`-tool key generation
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use peerguard::{JsonStateFile, NativeKeys, PeerStore, Settings, SystemRunner, WgQuickInterface};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), peerguard::PeerGuardError> {
//!     let settings = Settings::from_env()?;
//!     let runner = Arc::new(SystemRunner::new());
//!     let live = WgQuickInterface::new(runner, &settings.interface, settings.config_file());
//!     let state = JsonStateFile::new(settings.state_file(), settings.persist_timeout);
//!
//!     let store = PeerStore::open(settings, Arc::new(NativeKeys::new()), Arc::new(live), Arc::new(state)).await?;
//!     store.bring_up().await?;
//!     let alice = store.create("alice").await?;
//!     println!("{}", store.peer_config(alice.id)?);
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod command;
pub mod config;
pub mod error;
pub mod keys;
pub mod model;
pub mod persistence;
pub mod render;
pub mod store;
pub mod sync;

pub use allocator::{AddressAllocator, AddressTemplate};
pub use command::{CommandRunner, CommandSpec, SystemRunner};
pub use config::{KeyBackend, Settings};
pub use error::PeerGuardError;
pub use keys::{KeyManager, NativeKeys, WgToolKeys};
pub use model::{Peer, PeerCommand, PeerId, PeerView};
pub use persistence::{JsonStateFile, StateBackend};
pub use store::{CommandOutcome, PeerStore, SyncStatus};
pub use sync::{InterfaceSync, WgQuickInterface};
