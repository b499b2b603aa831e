//! Durable peer state
//!
//! The state file is the source of truth for peers and the interface
//! identity. Every save goes to a temporary file that is fsynced and then
//! renamed over the target, so a reader only ever sees the old or the new
//! state.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::PersistenceError;
use crate::model::{InterfaceRecord, Peer, PeerId};

/// Current on-disk schema
pub const SCHEMA_VERSION: u32 = 1;

/// Everything that is persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Schema version for future migrations
    pub schema_version: u32,
    pub interface: InterfaceRecord,
    /// Insertion order
    pub peers: Vec<Peer>,
    /// Ids of deleted peers; never handed out again
    #[serde(default)]
    pub retired_ids: Vec<PeerId>,
}

impl PersistedState {
    pub fn new(interface: InterfaceRecord) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            interface,
            peers: Vec::new(),
            retired_ids: Vec::new(),
        }
    }
}

/// Where state is stored
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError>;

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError>;
}

/// JSON file with write-to-temp-then-rename
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
    timeout: Duration,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError {
        let path = path.to_path_buf();
        move |source| PersistenceError::Io { path, source }
    }

    async fn write_temp(&self, tmp: &Path, json: &[u8]) -> Result<(), PersistenceError> {
        if let Some(parent) = tmp.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(self.io_err(parent))?;
            }
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(tmp).await.map_err(self.io_err(tmp))?;
        file.write_all(json).await.map_err(self.io_err(tmp))?;
        file.sync_all().await.map_err(self.io_err(tmp))?;
        Ok(())
    }
}

#[async_trait]
impl StateBackend for JsonStateFile {
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No state file found at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => return Err(self.io_err(&self.path)(e)),
        };

        // A state file that exists but cannot be parsed is never replaced
        let state: PersistedState =
            serde_json::from_str(&json).map_err(|e| PersistenceError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if state.schema_version != SCHEMA_VERSION {
            return Err(PersistenceError::Corrupt {
                path: self.path.clone(),
                reason: format!("unsupported schema version {}", state.schema_version),
            });
        }

        tracing::debug!("Loaded {} peers from {:?}", state.peers.len(), self.path);
        Ok(Some(state))
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.temp_path();

        // Only the temp write is bounded: the rename is the commit point and
        // must not be abandoned halfway.
        match tokio::time::timeout(self.timeout, self.write_temp(&tmp, &json)).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(PersistenceError::Timeout {
                    path: self.path.clone(),
                    timeout: self.timeout,
                });
            }
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(self.io_err(&self.path))?;

        tracing::debug!("Saved state to {:?}", self.path);
        Ok(())
    }
}

/// In-memory backend with failure injection, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<Option<PersistedState>>,
    fail_next: Mutex<usize>,
    saves: Mutex<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    /// Make the next `count` saves fail
    pub fn fail_next_saves(&self, count: usize) {
        *self.fail_next.lock().unwrap_or_else(|e| e.into_inner()) = count;
    }

    /// Last successfully saved state
    pub fn snapshot(&self) -> Option<PersistedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        Ok(self.snapshot())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        {
            let mut fail = self.fail_next.lock().unwrap_or_else(|e| e.into_inner());
            if *fail > 0 {
                *fail -= 1;
                return Err(PersistenceError::Simulated("disk full".to_string()));
            }
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
