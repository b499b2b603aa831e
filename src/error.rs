//! Error types for the peer manager
//!
//! Every failure is attributable to one stage of the mutation pipeline:
//! validation, tooling, persistence or live sync.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for peerguard
#[derive(Error, Debug)]
pub enum PeerGuardError {
    /// Startup settings or legacy configuration text
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Bad user input, detected before anything is mutated
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Peer not found: {id}")]
    NotFound { id: String },

    #[error("No free address left in {subnet}")]
    AddressSpaceExhausted { subnet: String },

    #[error("Address {address} is already assigned to another peer")]
    AddressInUse { address: Ipv4Addr },

    /// Key generation or other external tooling
    #[error("Tooling error: {0}")]
    Tooling(#[from] ToolingError),

    /// Live interface apply failed; persisted state is retained
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Durable write failed; the in-memory mutation was rolled back
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Broken internal invariant (missing key while rendering, worker gone)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Input validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Name must not be empty")]
    EmptyName,

    #[error("Invalid peer id: {value}")]
    InvalidId { value: String },

    #[error("Invalid IPv4 address: {value}")]
    InvalidAddress { value: String },

    #[error("Address {address} is outside subnet {subnet}")]
    OutsideSubnet { address: Ipv4Addr, subnet: String },

    #[error("Address {address} is reserved")]
    ReservedAddress { address: Ipv4Addr },

    #[error("Peer {id} has no private key on this server")]
    NoPrivateKey { id: String },
}

/// Settings and configuration text errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Invalid interface name {value:?}: expected wg0, wg1, wg2, ...")]
    InvalidDeviceName { value: String },

    #[error("Invalid address template {value:?}: expected a.b.c.x")]
    InvalidTemplate { value: String },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// External command errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolingError {
    #[error("{program} is unavailable: {reason}")]
    Unavailable { program: String, reason: String },

    #[error("{program} exited with status {status:?}: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} produced unusable output: {reason}")]
    InvalidOutput { program: String, reason: String },
}

/// Live interface errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Applying configuration to {interface} failed: {source}")]
    Apply {
        interface: String,
        #[source]
        source: ToolingError,
    },

    #[error("Bringing {interface} up failed: {source}")]
    BringUp {
        interface: String,
        #[source]
        source: ToolingError,
    },

    #[error("Bringing {interface} down failed: {source}")]
    BringDown {
        interface: String,
        #[source]
        source: ToolingError,
    },

    #[error("Reading statistics of {interface} failed: {source}")]
    Stats {
        interface: String,
        #[source]
        source: ToolingError,
    },

    #[error("Writing {path}: {reason}")]
    ConfigFile { path: PathBuf, reason: String },
}

/// Durable state errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Write to {path} timed out after {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },

    /// Injected by the in-memory backend
    #[error("Simulated failure: {0}")]
    Simulated(String),
}

impl PeerGuardError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for failures caused by the caller's input (4xx semantics)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound { .. }
                | Self::AddressSpaceExhausted { .. }
                | Self::AddressInUse { .. }
        )
    }

    /// HTTP-equivalent status for the API layer
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::AddressInUse { .. } => 409,
            Self::AddressSpaceExhausted { .. } => 409,
            Self::Sync(_) => 502,
            Self::Tooling(_) => 503,
            Self::Config(_) | Self::Persistence(_) | Self::Internal { .. } => 500,
        }
    }

    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::InvalidDeviceName { value }) => {
                format!(
                    "WG_INTERFACE {:?} is not a valid interface name.\n  \
                    Use wg0, wg1, wg2, etc.",
                    value
                )
            }

            Self::Config(ConfigError::MissingField { field }) if field == "WG_HOST" => {
                "WG_HOST is not set.\n  \
                 Set it to the public hostname or IP clients connect to."
                    .to_string()
            }

            Self::Tooling(ToolingError::Unavailable { program, .. }) => {
                format!(
                    "{} could not be started.\n  \
                    Install wireguard-tools and make sure it is on PATH.",
                    program
                )
            }

            Self::Sync(SyncError::BringUp { interface, source }) => {
                format!(
                    "Could not bring up {}: {}\n  \
                    Check that the WireGuard kernel module is loaded and the process has CAP_NET_ADMIN.",
                    interface, source
                )
            }

            Self::Persistence(PersistenceError::Corrupt { path, .. }) => {
                format!(
                    "State file {} cannot be read.\n  \
                    Restore it from a backup or move it away to start fresh.",
                    path.display()
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Tooling(_) => 2,
            Self::Sync(_) => 3,
            Self::Persistence(_) => 4,
            _ => 255,
        }
    }
}

/// Result type alias for peerguard operations
pub type Result<T> = std::result::Result<T, PeerGuardError>;
