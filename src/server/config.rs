use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pptp: PptpConfig,

    #[serde(default)]
    pub qproxy: QproxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // listen address for the DOSBox UDP protocol: eg: 0.0.0.0:10000
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    // clients are disconnected after this long without a packet
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,

    // silent clients are pinged at this interval
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    // drop NetBIOS/SMB traffic between clients
    #[serde(default = "default_enable_netbios_filter")]
    pub enable_netbios_filter: bool,

    // uplink clients are admitted only when a password is set
    #[serde(default)]
    pub uplink_password: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:10000".to_string()
}

fn default_client_timeout_secs() -> u64 {
    600
}

fn default_keepalive_interval_secs() -> u64 {
    5
}

fn default_enable_netbios_filter() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: default_listen_addr(),
            client_timeout_secs: default_client_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            enable_netbios_filter: default_enable_netbios_filter(),
            uplink_password: None,
        }
    }
}

impl ServerConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PptpConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_pptp_listen_addr")]
    pub listen_addr: String,
}

fn default_pptp_listen_addr() -> String {
    "0.0.0.0:1723".to_string()
}

impl Default for PptpConfig {
    fn default() -> Self {
        PptpConfig {
            enabled: false,
            listen_addr: default_pptp_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QproxyConfig {
    // Quake servers to expose on the IPX network: eg: ["quake.example.com:26000"]
    #[serde(default)]
    pub servers: Vec<String>,

    #[serde(default = "default_qproxy_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_qproxy_idle_timeout_secs() -> u64 {
    600
}

impl Default for QproxyConfig {
    fn default() -> Self {
        QproxyConfig {
            servers: Vec::new(),
            idle_timeout_secs: default_qproxy_idle_timeout_secs(),
        }
    }
}

impl QproxyConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

pub fn load(path: &str) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:10000");
        assert_eq!(config.server.client_timeout_secs, 600);
        assert_eq!(config.server.keepalive_interval_secs, 5);
        assert!(config.server.enable_netbios_filter);
        assert!(config.server.uplink_password.is_none());
        assert!(!config.pptp.enabled);
        assert!(config.qproxy.servers.is_empty());
    }

    #[test]
    fn test_partial_override() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:213"
            uplink_password = "hunter2"

            [pptp]
            enabled = true

            [qproxy]
            servers = ["quake.example.com:26000"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:213");
        assert_eq!(config.server.uplink_password.as_deref(), Some("hunter2"));
        assert_eq!(config.server.client_timeout_secs, 600);
        assert!(config.pptp.enabled);
        assert_eq!(config.qproxy.servers.len(), 1);
    }
}
