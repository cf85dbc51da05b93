//! Typed configuration records for the JSON config file.
//!
//! The schema mirrors the documented file layout: `stun_server`,
//! `keep_alive`, `interval`, `open_port`, `forward_port`, `status_report`,
//! `logging` and the optional `enable_upnp` flag. Every section carries a
//! default so a partial file still loads.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NatterError, Result};

/// Ordered STUN server lists per transport. Entries are hostnames or IPs;
/// a `host:port` entry overrides the default port 3478.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StunServers {
    #[serde(default)]
    pub tcp: Vec<String>,
    #[serde(default)]
    pub udp: Vec<String>,
}

/// Open ports to monitor, as `IP:port` strings. The IP may be unspecified.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenPorts {
    #[serde(default)]
    pub tcp: Vec<String>,
    #[serde(default)]
    pub udp: Vec<String>,
}

/// Forward targets, as `host:port` strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardPorts {
    #[serde(default)]
    pub tcp: Vec<String>,
    #[serde(default)]
    pub udp: Vec<String>,
}

/// Status file path and optional hook command template.
///
/// The hook supports the `{inner}`, `{outer}` and `{protocol}` placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub hook: String,
    #[serde(default)]
    pub status_file: String,
}

/// Log level and optional log file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub log_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stun_server: StunServers,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,
    /// Polling and keep-alive interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: i64,
    #[serde(default)]
    pub open_port: OpenPorts,
    #[serde(default)]
    pub forward_port: ForwardPorts,
    #[serde(default)]
    pub status_report: StatusReport,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub enable_upnp: bool,
}

fn default_keep_alive() -> String {
    "www.qq.com".to_string()
}

fn default_interval() -> i64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stun_server: StunServers::default(),
            keep_alive: default_keep_alive(),
            interval: default_interval(),
            open_port: OpenPorts::default(),
            forward_port: ForwardPorts::default(),
            status_report: StatusReport::default(),
            logging: Logging::default(),
            enable_upnp: false,
        }
    }
}

impl Config {
    /// Load and parse a JSON config file. Any failure here is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            NatterError::Config(format!("cannot read config file {:?}: {}", path, e))
        })?;
        let cfg: Config = serde_json::from_slice(&data).map_err(|e| {
            NatterError::Config(format!("cannot parse config file {:?}: {}", path, e))
        })?;
        Ok(cfg)
    }

    /// Synthesize a config for `natter [host] <port>` invocations: one open
    /// TCP port, public STUN servers, no forwarders.
    pub fn port_mode(host: &str, port: u16) -> Self {
        Self {
            stun_server: StunServers {
                tcp: vec![
                    "fwa.lifesizecloud.com".to_string(),
                    "stun.isp.net.au".to_string(),
                    "stun.nextcloud.com".to_string(),
                ],
                udp: vec![
                    "stun.miwifi.com".to_string(),
                    "stun.qq.com".to_string(),
                ],
            },
            open_port: OpenPorts {
                tcp: vec![format!("{}:{}", host, port)],
                udp: Vec::new(),
            },
            status_report: StatusReport {
                hook: String::new(),
                status_file: "status.json".to_string(),
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let doc = r#"{
            "stun_server": {"tcp": ["stun.example.com"], "udp": ["stun.example.org"]},
            "keep_alive": "www.example.com",
            "interval": 15,
            "open_port": {"tcp": ["0.0.0.0:34567"], "udp": []},
            "forward_port": {"tcp": ["127.0.0.1:8080"], "udp": []},
            "status_report": {"hook": "echo {outer}", "status_file": "/tmp/natter.json"},
            "logging": {"level": "debug", "log_file": ""},
            "enable_upnp": true
        }"#;
        let cfg: Config = serde_json::from_str(doc).unwrap();
        assert_eq!(cfg.stun_server.tcp, vec!["stun.example.com"]);
        assert_eq!(cfg.interval, 15);
        assert_eq!(cfg.open_port.tcp, vec!["0.0.0.0:34567"]);
        assert_eq!(cfg.forward_port.tcp, vec!["127.0.0.1:8080"]);
        assert!(cfg.enable_upnp);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.keep_alive, "www.qq.com");
        assert_eq!(cfg.interval, 10);
        assert!(cfg.open_port.tcp.is_empty());
        assert!(!cfg.enable_upnp);
    }

    #[test]
    fn port_mode_opens_one_tcp_port() {
        let cfg = Config::port_mode("0.0.0.0", 2888);
        assert_eq!(cfg.open_port.tcp, vec!["0.0.0.0:2888"]);
        assert!(cfg.open_port.udp.is_empty());
        assert_eq!(cfg.status_report.status_file, "status.json");
        assert!(!cfg.stun_server.udp.is_empty());
    }
}
