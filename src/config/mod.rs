//! Configuration inputs
//!
//! `settings` reads the process environment; `parser` reads a legacy
//! WireGuard `.conf` file for first-boot migration.

mod parser;
mod settings;

pub use parser::{LegacyConfig, LegacyInterface, LegacyPeer};
pub use settings::{validate_interface_name, KeyBackend, Settings};
