//! Process settings read from the environment
//!
//! Read and validated once at startup. Variable names and defaults follow
//! the long-standing `WG_*` convention so existing deployments keep working.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;

use crate::allocator::AddressTemplate;
use crate::error::ConfigError;

/// Which [`KeyManager`](crate::keys::KeyManager) implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBackend {
    /// `wg genkey` / `wg pubkey` / `wg genpsk`
    WgTool,
    /// In-process x25519
    Native,
}

/// Everything the core consumes from configuration
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding `<iface>.conf` and `<iface>.json`
    pub wg_path: PathBuf,
    /// Interface name, `wg0`, `wg1`, ...
    pub interface: String,
    /// Uplink device used by the default NAT hooks
    pub device: String,
    /// Public host clients connect to
    pub host: String,
    pub listen_port: u16,
    /// Port advertised in client configs (differs behind port forwarding)
    pub config_port: u16,
    pub mtu: Option<u16>,
    pub persistent_keepalive: u16,
    pub address_template: AddressTemplate,
    pub dns: Vec<IpAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub pre_up: String,
    pub post_up: String,
    pub pre_down: String,
    pub post_down: String,
    pub command_timeout: Duration,
    pub persist_timeout: Duration,
    /// `None` disables periodic reconciliation
    pub reconcile_interval: Option<Duration>,
    pub key_backend: KeyBackend,
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read settings through an arbitrary lookup, e.g. a map in tests
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.is_empty());

        let interface = get("WG_INTERFACE").unwrap_or_else(|| "wg0".to_string());
        validate_interface_name(&interface)?;

        let device = get("WG_DEVICE").unwrap_or_else(|| "eth0".to_string());
        let host = get("WG_HOST").ok_or(ConfigError::MissingField {
            field: "WG_HOST".to_string(),
        })?;

        let listen_port: u16 = parse_var(&get, "WG_PORT")?.unwrap_or(51820);
        let config_port: u16 = parse_var(&get, "WG_CONFIG_PORT")?.unwrap_or(listen_port);
        let mtu: Option<u16> = parse_var(&get, "WG_MTU")?;
        let persistent_keepalive: u16 = parse_var(&get, "WG_PERSISTENT_KEEPALIVE")?.unwrap_or(0);

        let template_str = get("WG_DEFAULT_ADDRESS").unwrap_or_else(|| "10.8.0.x".to_string());
        let address_template: AddressTemplate = template_str.parse()?;

        // An explicitly empty WG_DEFAULT_DNS disables DNS
        let dns = match lookup("WG_DEFAULT_DNS") {
            Some(value) => parse_list(&value, "WG_DEFAULT_DNS")?,
            None => vec![IpAddr::from([1, 1, 1, 1])],
        };

        let allowed_ips = parse_list(
            &get("WG_ALLOWED_IPS").unwrap_or_else(|| "0.0.0.0/0, ::/0".to_string()),
            "WG_ALLOWED_IPS",
        )?;
        if allowed_ips.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "WG_ALLOWED_IPS".to_string(),
                value: String::new(),
            });
        }

        let subnet = address_template.subnet();
        let post_up = get("WG_POST_UP")
            .unwrap_or_else(|| default_nat_hook('A', &subnet.to_string(), &device, &interface, listen_port));
        let post_down = get("WG_POST_DOWN")
            .unwrap_or_else(|| default_nat_hook('D', &subnet.to_string(), &device, &interface, listen_port));

        let command_timeout = Duration::from_secs(parse_var(&get, "WG_COMMAND_TIMEOUT")?.unwrap_or(10));
        let persist_timeout = Duration::from_secs(parse_var(&get, "WG_PERSIST_TIMEOUT")?.unwrap_or(5));
        let reconcile_secs: u64 = parse_var(&get, "WG_RECONCILE_INTERVAL")?.unwrap_or(60);

        let key_backend = match get("WG_KEY_BACKEND").as_deref() {
            None | Some("wg") => KeyBackend::WgTool,
            Some("native") => KeyBackend::Native,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "WG_KEY_BACKEND".to_string(),
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            wg_path: PathBuf::from(get("WG_PATH").unwrap_or_else(|| "/etc/wireguard/".to_string())),
            interface,
            device,
            host,
            listen_port,
            config_port,
            mtu,
            persistent_keepalive,
            address_template,
            dns,
            allowed_ips,
            pre_up: get("WG_PRE_UP").unwrap_or_default(),
            post_up,
            pre_down: get("WG_PRE_DOWN").unwrap_or_default(),
            post_down,
            command_timeout,
            persist_timeout,
            reconcile_interval: (reconcile_secs > 0).then(|| Duration::from_secs(reconcile_secs)),
            key_backend,
        })
    }

    /// wg-quick configuration file
    pub fn config_file(&self) -> PathBuf {
        self.wg_path.join(format!("{}.conf", self.interface))
    }

    /// Managed state file
    pub fn state_file(&self) -> PathBuf {
        self.wg_path.join(format!("{}.json", self.interface))
    }

    /// `host:port` advertised to clients
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.config_port)
    }
}

/// Interface names must look like `wg0`, `wg1`, ...
pub fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    let valid = name
        .strip_prefix("wg")
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidDeviceName {
            value: name.to_string(),
        })
    }
}

fn parse_var<T, G>(get: &G, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

fn parse_list<T: FromStr>(value: &str, var: &str) -> Result<Vec<T>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value: s.to_string(),
            })
        })
        .collect()
}

/// NAT and forwarding rules; `op` is `A` to add, `D` to delete
fn default_nat_hook(op: char, subnet: &str, device: &str, interface: &str, port: u16) -> String {
    format!(
        "iptables -t nat -{op} POSTROUTING -s {subnet} -o {device} -j MASQUERADE; \
         iptables -{op} INPUT -p udp -m udp --dport {port} -j ACCEPT; \
         iptables -{op} FORWARD -i {interface} -j ACCEPT; \
         iptables -{op} FORWARD -o {interface} -j ACCEPT;"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[("WG_HOST", "vpn.example.com")]).unwrap();
        assert_eq!(s.interface, "wg0");
        assert_eq!(s.listen_port, 51820);
        assert_eq!(s.config_port, 51820);
        assert_eq!(s.mtu, None);
        assert_eq!(s.persistent_keepalive, 0);
        assert_eq!(s.address_template.to_string(), "10.8.0.x");
        assert_eq!(s.dns, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(s.allowed_ips.len(), 2);
        assert_eq!(s.endpoint(), "vpn.example.com:51820");
        assert_eq!(s.config_file(), PathBuf::from("/etc/wireguard/wg0.conf"));
        assert_eq!(s.state_file(), PathBuf::from("/etc/wireguard/wg0.json"));
        assert_eq!(s.reconcile_interval, Some(Duration::from_secs(60)));
        assert_eq!(s.key_backend, KeyBackend::WgTool);
        assert!(s.post_up.contains("-A POSTROUTING -s 10.8.0.0/24 -o eth0 -j MASQUERADE"));
        assert!(s.post_down.contains("-D FORWARD -o wg0 -j ACCEPT"));
        assert!(s.pre_up.is_empty());
    }

    #[test]
    fn test_missing_host() {
        assert!(matches!(
            settings(&[]),
            Err(ConfigError::MissingField { field }) if field == "WG_HOST"
        ));
    }

    #[test]
    fn test_interface_name_validation() {
        assert!(validate_interface_name("wg0").is_ok());
        assert!(validate_interface_name("wg12").is_ok());
        for bad in ["eth0", "wg", "wg0; rm -rf /", "wgX", "WG0"] {
            assert!(
                matches!(
                    validate_interface_name(bad),
                    Err(ConfigError::InvalidDeviceName { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
        assert!(settings(&[("WG_HOST", "h"), ("WG_INTERFACE", "tun0")]).is_err());
    }

    #[test]
    fn test_overrides() {
        let s = settings(&[
            ("WG_HOST", "1.2.3.4"),
            ("WG_PORT", "4000"),
            ("WG_CONFIG_PORT", "443"),
            ("WG_MTU", "1380"),
            ("WG_PERSISTENT_KEEPALIVE", "25"),
            ("WG_DEFAULT_ADDRESS", "10.6.0.x"),
            ("WG_DEFAULT_DNS", "9.9.9.9, 149.112.112.112"),
            ("WG_ALLOWED_IPS", "10.6.0.0/24"),
            ("WG_RECONCILE_INTERVAL", "0"),
            ("WG_KEY_BACKEND", "native"),
            ("WG_POST_UP", "echo up"),
        ])
        .unwrap();
        assert_eq!(s.listen_port, 4000);
        assert_eq!(s.endpoint(), "1.2.3.4:443");
        assert_eq!(s.mtu, Some(1380));
        assert_eq!(s.persistent_keepalive, 25);
        assert_eq!(s.address_template.interface_address().to_string(), "10.6.0.1");
        assert_eq!(s.dns.len(), 2);
        assert_eq!(s.allowed_ips, vec!["10.6.0.0/24".parse::<IpNet>().unwrap()]);
        assert_eq!(s.reconcile_interval, None);
        assert_eq!(s.key_backend, KeyBackend::Native);
        assert_eq!(s.post_up, "echo up");
    }

    #[test]
    fn test_empty_dns_disables() {
        let s = settings(&[("WG_HOST", "h"), ("WG_DEFAULT_DNS", "")]).unwrap();
        assert!(s.dns.is_empty());
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            settings(&[("WG_HOST", "h"), ("WG_PORT", "seventy")]),
            Err(ConfigError::InvalidValue { var, .. }) if var == "WG_PORT"
        ));
        assert!(matches!(
            settings(&[("WG_HOST", "h"), ("WG_DEFAULT_DNS", "1.1.1")]),
            Err(ConfigError::InvalidValue { var, .. }) if var == "WG_DEFAULT_DNS"
        ));
        assert!(matches!(
            settings(&[("WG_HOST", "h"), ("WG_DEFAULT_ADDRESS", "10.8.0.0/24")]),
            Err(ConfigError::InvalidTemplate { .. })
        ));
        assert!(settings(&[("WG_HOST", "h"), ("WG_KEY_BACKEND", "hsm")]).is_err());
    }
}
