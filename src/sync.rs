//! Live interface synchronization
//!
//! Applies rendered configuration to the kernel interface. `apply` uses
//! `wg syncconf`, which replaces the whole peer set, so peers dropped from
//! the configuration disappear from the interface too.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::command::{run_checked, CommandRunner, CommandSpec, DEFAULT_COMMAND_TIMEOUT};
use crate::error::{SyncError, ToolingError};
use crate::model::PeerStats;

/// Per-peer telemetry keyed by public key
pub type StatsMap = HashMap<String, PeerStats>;

/// The running network interface
#[async_trait]
pub trait InterfaceSync: Send + Sync {
    /// Replace the live peer set with the given `wg syncconf` text
    async fn apply(&self, config: &str) -> Result<(), SyncError>;

    /// Create the device and run the up hooks. `quick_config` is the full
    /// wg-quick file.
    async fn bring_up(&self, quick_config: &str) -> Result<(), SyncError>;

    /// Run the down hooks and destroy the device
    async fn bring_down(&self) -> Result<(), SyncError>;

    /// Replace the on-disk wg-quick file without touching the device
    async fn write_config(&self, quick_config: &str) -> Result<(), SyncError>;

    async fn current_stats(&self) -> Result<StatsMap, SyncError>;
}

/// `wg` / `wg-quick` backed interface
pub struct WgQuickInterface {
    runner: Arc<dyn CommandRunner>,
    interface: String,
    config_file: PathBuf,
    timeout: Duration,
}

impl WgQuickInterface {
    pub fn new(runner: Arc<dyn CommandRunner>, interface: &str, config_file: PathBuf) -> Self {
        Self {
            runner,
            interface: interface.to_string(),
            config_file,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn wg(&self) -> CommandSpec {
        CommandSpec::new("wg").timeout(self.timeout)
    }

    fn wg_quick(&self, action: &str) -> CommandSpec {
        CommandSpec::new("wg-quick")
            .args([action, self.interface.as_str()])
            .timeout(self.timeout)
    }

    async fn write_config_file(&self, contents: &str) -> Result<(), SyncError> {
        let err = |e: std::io::Error| SyncError::ConfigFile {
            path: self.config_file.clone(),
            reason: e.to_string(),
        };

        if let Some(parent) = self.config_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(err)?;
            }
        }

        let mut tmp_name = self.config_file.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.config_file.with_file_name(tmp_name);

        tokio::fs::write(&tmp, contents).await.map_err(err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(err)?;
        }
        tokio::fs::rename(&tmp, &self.config_file).await.map_err(err)?;

        tracing::debug!("Wrote {:?}", self.config_file);
        Ok(())
    }
}

#[async_trait]
impl InterfaceSync for WgQuickInterface {
    async fn apply(&self, config: &str) -> Result<(), SyncError> {
        let spec = self
            .wg()
            .args(["syncconf", self.interface.as_str(), "/dev/stdin"])
            .stdin(config);

        run_checked(self.runner.as_ref(), &spec)
            .await
            .map_err(|source| SyncError::Apply {
                interface: self.interface.clone(),
                source,
            })?;

        tracing::debug!("Applied configuration to {}", self.interface);
        Ok(())
    }

    async fn bring_up(&self, quick_config: &str) -> Result<(), SyncError> {
        self.write_config_file(quick_config).await?;

        // A leftover device from a previous run would make `up` fail
        match self.runner.run(&self.wg_quick("down")).await {
            Ok(out) if out.success() => {
                tracing::info!("Took down stale interface {}", self.interface)
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("wg-quick down before up: {}", e),
        }

        run_checked(self.runner.as_ref(), &self.wg_quick("up"))
            .await
            .map_err(|source| {
                if let ToolingError::Failed { stderr, .. } = &source {
                    if stderr.contains("Cannot find device") {
                        tracing::error!(
                            "WireGuard exited with the error: Cannot find device \"{}\". \
                             This usually means that your host's kernel does not support WireGuard.",
                            self.interface
                        );
                    }
                }
                SyncError::BringUp {
                    interface: self.interface.clone(),
                    source,
                }
            })?;

        tracing::info!("Interface {} is up", self.interface);
        Ok(())
    }

    async fn bring_down(&self) -> Result<(), SyncError> {
        run_checked(self.runner.as_ref(), &self.wg_quick("down"))
            .await
            .map_err(|source| SyncError::BringDown {
                interface: self.interface.clone(),
                source,
            })?;
        tracing::info!("Interface {} is down", self.interface);
        Ok(())
    }

    async fn write_config(&self, quick_config: &str) -> Result<(), SyncError> {
        self.write_config_file(quick_config).await
    }

    async fn current_stats(&self) -> Result<StatsMap, SyncError> {
        let spec = self.wg().args(["show", self.interface.as_str(), "dump"]);
        let output = run_checked(self.runner.as_ref(), &spec)
            .await
            .map_err(|source| SyncError::Stats {
                interface: self.interface.clone(),
                source,
            })?;
        Ok(parse_dump(&output.stdout))
    }
}

/// Parse `wg show <iface> dump`
///
/// The first line describes the interface and is skipped. Peer lines are
/// tab separated: public key, preshared key, endpoint, allowed ips, latest
/// handshake (unix seconds, 0 = never), rx bytes, tx bytes, keepalive.
pub fn parse_dump(dump: &str) -> StatsMap {
    let mut stats = StatsMap::new();

    for line in dump.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            tracing::debug!("Ignoring malformed dump line with {} fields", fields.len());
            continue;
        }

        let endpoint = fields[2].parse::<SocketAddr>().ok();
        let latest_handshake = fields[4]
            .parse::<i64>()
            .ok()
            .filter(|secs| *secs > 0)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        stats.insert(
            fields[0].to_string(),
            PeerStats {
                endpoint,
                latest_handshake,
                transfer_rx: fields[5].parse().unwrap_or(0),
                transfer_tx: fields[6].parse().unwrap_or(0),
            },
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, ScriptedRunner};

    fn interface(runner: Arc<ScriptedRunner>, dir: &std::path::Path) -> WgQuickInterface {
        WgQuickInterface::new(runner, "wg0", dir.join("wg0.conf"))
    }

    #[tokio::test]
    async fn test_apply_pipes_config_to_syncconf() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let iface = interface(runner.clone(), dir.path());

        iface.apply("[Interface]\nListenPort = 51820\n").await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "wg");
        assert_eq!(calls[0].args, vec!["syncconf", "wg0", "/dev/stdin"]);
        assert_eq!(calls[0].stdin.as_deref(), Some("[Interface]\nListenPort = 51820\n"));
    }

    #[tokio::test]
    async fn test_apply_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "wg",
            &["syncconf"],
            Ok(CommandOutput::failed(1, "Unable to access interface: No such device")),
        );
        let iface = interface(runner, dir.path());

        let err = iface.apply("[Interface]\n").await.unwrap_err();
        match err {
            SyncError::Apply { interface, source } => {
                assert_eq!(interface, "wg0");
                assert_eq!(
                    source,
                    ToolingError::Failed {
                        program: "wg".into(),
                        status: Some(1),
                        stderr: "Unable to access interface: No such device".into(),
                    }
                );
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bring_up_writes_file_then_cycles_device() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        // Nothing to take down
        runner.respond(
            "wg-quick",
            &["down"],
            Ok(CommandOutput::failed(1, "wg-quick: `wg0' is not a WireGuard interface")),
        );
        let iface = interface(runner.clone(), dir.path());

        iface.bring_up("[Interface]\nPrivateKey = x\n").await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert_eq!(written, "[Interface]\nPrivateKey = x\n");

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, vec!["down", "wg0"]);
        assert_eq!(calls[1].args, vec!["up", "wg0"]);
    }

    #[tokio::test]
    async fn test_write_config_replaces_file_only() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let iface = interface(runner.clone(), dir.path());

        iface.write_config("[Interface]\nPrivateKey = x\n").await.unwrap();
        iface.write_config("[Interface]\nPrivateKey = y\n").await.unwrap();

        let path = dir.path().join("wg0.conf");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[Interface]\nPrivateKey = y\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        assert!(!dir.path().join("wg0.conf.tmp").exists());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bring_up_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "wg-quick",
            &["up"],
            Ok(CommandOutput::failed(1, "Cannot find device \"wg0\"")),
        );
        let iface = interface(runner, dir.path());

        let err = iface.bring_up("[Interface]\n").await.unwrap_err();
        assert!(matches!(err, SyncError::BringUp { .. }));
    }

    #[tokio::test]
    async fn test_current_stats() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let dump = "PRIV=\tPUB=\t51820\toff\n\
                    ALICE=\t(none)\t203.0.113.7:40000\t10.8.0.2/32\t1700000000\t1024\t2048\t25\n\
                    BOB=\tPSK=\t(none)\t10.8.0.3/32\t0\t0\t0\toff\n";
        runner.respond("wg", &["show", "wg0", "dump"], Ok(CommandOutput::ok(dump)));
        let iface = interface(runner, dir.path());

        let stats = iface.current_stats().await.unwrap();
        assert_eq!(stats.len(), 2);

        let alice = &stats["ALICE="];
        assert_eq!(alice.endpoint, Some("203.0.113.7:40000".parse().unwrap()));
        assert_eq!(alice.latest_handshake.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(alice.transfer_rx, 1024);
        assert_eq!(alice.transfer_tx, 2048);

        let bob = &stats["BOB="];
        assert_eq!(bob.endpoint, None);
        assert_eq!(bob.latest_handshake, None);
    }

    #[test]
    fn test_parse_dump_skips_garbage() {
        let stats = parse_dump("iface line\nnot\tenough\tfields\n");
        assert!(stats.is_empty());
    }
}
