//! Key generation
//!
//! Keys are opaque base64 strings. Nothing here interprets their bytes beyond
//! checking they decode to 32 bytes; they pass verbatim into rendered
//! configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::command::{run_checked, CommandRunner, CommandSpec, DEFAULT_COMMAND_TIMEOUT};
use crate::error::ToolingError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// A private key and the public key derived from it
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Source of key material
#[async_trait]
pub trait KeyManager: Send + Sync {
    async fn generate_key_pair(&self) -> Result<KeyPair, ToolingError>;

    async fn generate_preshared_key(&self) -> Result<String, ToolingError>;

    /// Only used when validating or migrating existing keys
    async fn derive_public_key(&self, private_key: &str) -> Result<String, ToolingError>;
}

/// Keys from the platform `wg` tool
pub struct WgToolKeys {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl WgToolKeys {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn wg(&self, subcommand: &str, stdin: Option<&str>) -> Result<String, ToolingError> {
        let mut spec = CommandSpec::new("wg")
            .arg(subcommand)
            .timeout(self.timeout)
            .display(format!("wg {}", subcommand));
        if let Some(input) = stdin {
            spec = spec.stdin(input);
        }

        let output = run_checked(self.runner.as_ref(), &spec).await?;
        let key = output.stdout.trim().to_string();

        if !is_valid_key(&key) {
            return Err(ToolingError::InvalidOutput {
                program: format!("wg {}", subcommand),
                reason: "expected a 32-byte base64 key".to_string(),
            });
        }
        Ok(key)
    }
}

#[async_trait]
impl KeyManager for WgToolKeys {
    async fn generate_key_pair(&self) -> Result<KeyPair, ToolingError> {
        let private_key = self.wg("genkey", None).await?;
        let public_key = self.derive_public_key(&private_key).await?;
        Ok(KeyPair {
            private_key,
            public_key,
        })
    }

    async fn generate_preshared_key(&self) -> Result<String, ToolingError> {
        self.wg("genpsk", None).await
    }

    async fn derive_public_key(&self, private_key: &str) -> Result<String, ToolingError> {
        self.wg("pubkey", Some(private_key)).await
    }
}

/// In-process X25519 keys, for hosts without wireguard-tools
#[derive(Debug, Default, Clone)]
pub struct NativeKeys;

impl NativeKeys {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl KeyManager for NativeKeys {
    async fn generate_key_pair(&self) -> Result<KeyPair, ToolingError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Ok(KeyPair {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.to_bytes()),
        })
    }

    async fn generate_preshared_key(&self) -> Result<String, ToolingError> {
        let mut psk = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut psk);
        Ok(BASE64.encode(psk))
    }

    async fn derive_public_key(&self, private_key: &str) -> Result<String, ToolingError> {
        let bytes = decode_key(private_key).ok_or_else(|| ToolingError::InvalidOutput {
            program: "x25519".to_string(),
            reason: "private key is not a 32-byte base64 key".to_string(),
        })?;
        let secret = StaticSecret::from(bytes);
        Ok(BASE64.encode(PublicKey::from(&secret).to_bytes()))
    }
}

fn decode_key(value: &str) -> Option<[u8; KEY_LEN]> {
    let bytes = BASE64.decode(value.trim()).ok()?;
    bytes.try_into().ok()
}

/// True if `value` is base64 for exactly 32 bytes
pub fn is_valid_key(value: &str) -> bool {
    decode_key(value).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, ScriptedRunner};

    const PRIVATE: &str = "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=";
    const PUBLIC: &str = "ELSHH4/tGng4bXqLmzUVN2dSBrIQX3ELxn/S4NYwL3A=";

    #[tokio::test]
    async fn test_native_keypair_derivation() {
        let keys = NativeKeys::new();
        let pair = keys.generate_key_pair().await.unwrap();

        assert!(is_valid_key(&pair.private_key));
        assert!(is_valid_key(&pair.public_key));
        assert_ne!(pair.private_key, pair.public_key);

        // Derived public key should match
        let derived = keys.derive_public_key(&pair.private_key).await.unwrap();
        assert_eq!(derived, pair.public_key);
    }

    #[tokio::test]
    async fn test_native_derive_known_key() {
        let derived = NativeKeys::new().derive_public_key(PRIVATE).await.unwrap();
        assert_eq!(derived, PUBLIC);
    }

    #[tokio::test]
    async fn test_native_psk_is_random() {
        let keys = NativeKeys::new();
        let a = keys.generate_preshared_key().await.unwrap();
        let b = keys.generate_preshared_key().await.unwrap();
        assert!(is_valid_key(&a));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_wg_tool_keys_pipes_private_key() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("wg", &["genkey"], Ok(CommandOutput::ok(format!("{}\n", PRIVATE))));
        runner.respond("wg", &["pubkey"], Ok(CommandOutput::ok(format!("{}\n", PUBLIC))));

        let keys = WgToolKeys::new(runner.clone());
        let pair = keys.generate_key_pair().await.unwrap();
        assert_eq!(pair.private_key, PRIVATE);
        assert_eq!(pair.public_key, PUBLIC);

        let pubkey_calls = runner.calls_matching("wg", &["pubkey"]);
        assert_eq!(pubkey_calls.len(), 1);
        assert_eq!(pubkey_calls[0].stdin.as_deref(), Some(PRIVATE));
        // Key material never shows up in the logged command line
        assert_eq!(pubkey_calls[0].display.as_deref(), Some("wg pubkey"));
    }

    #[tokio::test]
    async fn test_wg_tool_keys_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "wg",
            &["genkey"],
            Err(ToolingError::Unavailable {
                program: "wg".into(),
                reason: "No such file or directory".into(),
            }),
        );
        let keys = WgToolKeys::new(runner);
        let err = keys.generate_key_pair().await.unwrap_err();
        assert!(matches!(err, ToolingError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_wg_tool_keys_rejects_garbage() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("wg", &["genpsk"], Ok(CommandOutput::ok("not a key")));
        let keys = WgToolKeys::new(runner);
        let err = keys.generate_preshared_key().await.unwrap_err();
        assert!(matches!(err, ToolingError::InvalidOutput { .. }));
    }

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key(PUBLIC));
        assert!(is_valid_key(&format!("  {}\n", PUBLIC)));
        assert!(!is_valid_key("dG9vIHNob3J0")); // "too short" in base64
        assert!(!is_valid_key("invalid-base64!"));
    }

    #[test]
    fn test_keypair_debug_redacts_private() {
        let pair = KeyPair {
            private_key: PRIVATE.into(),
            public_key: PUBLIC.into(),
        };
        let text = format!("{:?}", pair);
        assert!(!text.contains(PRIVATE));
        assert!(text.contains(PUBLIC));
    }
}
