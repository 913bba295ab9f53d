use std::net::IpAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{CouloirError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Domain whose wildcard DNS record points at the relay.
    pub domain: String,
    /// Listen port; defaults to 443 (or 80 in plain-HTTP mode).
    pub port: Option<u16>,
    /// Serve plain HTTP instead of TLS.
    pub http: bool,
    /// Shared password required to open a couloir.
    pub password: Option<String>,
    /// Contact email for the ACME account.
    pub email: Option<String>,
    pub certs_dir: String,
    pub header_timeout_secs: u64,
    pub max_preface_bytes: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            domain: String::new(),
            port: None,
            http: false,
            password: None,
            email: None,
            certs_dir: "~/.couloir.certs".to_string(),
            header_timeout_secs: 30,
            max_preface_bytes: 64 * 1024,
        }
    }
}

impl RelaySettings {
    pub fn bind_port(&self) -> u16 {
        self.port.unwrap_or(if self.http { 80 } else { 443 })
    }

    /// Expanded certificate cache directory.
    pub fn certs_dir(&self) -> PathBuf {
        expand_home(&self.certs_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExposeSettings {
    /// Port of the local HTTP server to expose.
    pub local_port: u16,
    /// Relay domain to open the couloir on.
    pub relay_host: String,
    /// Requested couloir name; a bare label is completed to
    /// `<name>.<relay_host>`.
    pub name: Option<String>,
    /// Relay port; defaults to 443 (or 80 in plain-HTTP mode).
    pub relay_port: Option<u16>,
    /// Dial this IP instead of resolving the relay host.
    pub relay_ip: Option<IpAddr>,
    pub local_host: String,
    /// Rewrite the Host header of forwarded requests.
    pub override_host: Option<String>,
    /// Talk to the relay over plain TCP instead of TLS.
    pub http: bool,
    pub password: Option<String>,
    /// Idle relay connections to keep joined.
    pub concurrency: usize,
}

impl Default for ExposeSettings {
    fn default() -> Self {
        Self {
            local_port: 0,
            relay_host: String::new(),
            name: None,
            relay_port: None,
            relay_ip: None,
            local_host: "127.0.0.1".to_string(),
            override_host: None,
            http: false,
            password: None,
            concurrency: 10,
        }
    }
}

impl ExposeSettings {
    pub fn relay_port(&self) -> u16 {
        self.relay_port.unwrap_or(if self.http { 80 } else { 443 })
    }

    /// Full host requested with `--as`, if any.
    pub fn requested_host(&self) -> Option<String> {
        self.name.as_ref().map(|name| {
            if name.contains('.') {
                name.clone()
            } else {
                format!("{name}.{}", self.relay_host)
            }
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub relay: RelaySettings,
    pub expose: ExposeSettings,
}

/// Expand `~` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}

impl Settings {
    /// Load settings from the TOML config file.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let path = match config_path {
            Some(p) => p.clone(),
            None => expand_home("~/.couloir/config.toml"),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| CouloirError::Config(format!("Failed to read config: {e}")))?;
            let settings: Settings = toml::from_str(&content)
                .map_err(|e| CouloirError::Config(format!("Failed to parse config: {e}")))?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[relay]
domain = "my.test"
port = 8443
password = "s3cret"
certs_dir = "/tmp/couloir-certs"
header_timeout_secs = 10

[expose]
local_port = 3000
relay_host = "my.test"
local_host = "0.0.0.0"
concurrency = 4
"#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.relay.domain, "my.test");
        assert_eq!(settings.relay.port, Some(8443));
        assert_eq!(settings.relay.password.as_deref(), Some("s3cret"));
        assert_eq!(settings.relay.certs_dir, "/tmp/couloir-certs");
        assert_eq!(settings.relay.header_timeout_secs, 10);
        assert_eq!(settings.expose.local_port, 3000);
        assert_eq!(settings.expose.local_host, "0.0.0.0");
        assert_eq!(settings.expose.concurrency, 4);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.relay.certs_dir, "~/.couloir.certs");
        assert_eq!(settings.relay.header_timeout_secs, 30);
        assert_eq!(settings.relay.max_preface_bytes, 64 * 1024);
        assert_eq!(settings.expose.local_host, "127.0.0.1");
        assert_eq!(settings.expose.concurrency, 10);
    }

    #[test]
    fn test_default_ports_follow_mode() {
        let mut relay = RelaySettings::default();
        assert_eq!(relay.bind_port(), 443);
        relay.http = true;
        assert_eq!(relay.bind_port(), 80);
        relay.port = Some(9000);
        assert_eq!(relay.bind_port(), 9000);

        let mut expose = ExposeSettings::default();
        assert_eq!(expose.relay_port(), 443);
        expose.http = true;
        assert_eq!(expose.relay_port(), 80);
    }

    #[test]
    fn test_requested_host_completion() {
        let mut expose = ExposeSettings {
            relay_host: "my.test".to_string(),
            ..Default::default()
        };
        assert_eq!(expose.requested_host(), None);
        expose.name = Some("demo".to_string());
        assert_eq!(expose.requested_host().as_deref(), Some("demo.my.test"));
        expose.name = Some("demo.other.test".to_string());
        assert_eq!(expose.requested_host().as_deref(), Some("demo.other.test"));
    }

    #[test]
    fn test_expand_home() {
        let path = expand_home("~/test");
        assert!(path.is_absolute());
        assert!(path.to_str().unwrap().ends_with("/test"));
    }

    #[test]
    fn test_invalid_toml() {
        let result = toml::from_str::<Settings>("{{invalid");
        assert!(result.is_err());
    }
}
