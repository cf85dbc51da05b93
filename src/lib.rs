pub mod config;
pub mod error;
pub mod forward;
pub mod keepalive;
pub mod orchestrator;
pub mod socket;
pub mod status;
pub mod stun;
pub mod upnp;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub use config::Config;
pub use error::{NatterError, Result};
pub use orchestrator::Natter;
pub use status::UpdateEvent;
pub use stun::Mapping;

/// Transport protocol of a monitored endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored open port.
///
/// `bind` is the address the sockets actually bind (it may be unspecified);
/// `inner` is the address reported to the outside world, with an unspecified
/// bind IP replaced by the detected outbound IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub proto: Protocol,
    pub bind: SocketAddr,
    pub inner: SocketAddr,
}

impl Endpoint {
    /// Parse an `IP:port` string from the configuration into an endpoint,
    /// substituting `outbound_ip` into `inner` when the bind IP is
    /// unspecified. The socket itself still binds the configured address.
    pub fn resolve(proto: Protocol, raw: &str, outbound_ip: IpAddr) -> Result<Self> {
        let bind: SocketAddr = raw
            .parse()
            .map_err(|_| NatterError::Config(format!("invalid {} endpoint: {:?}", proto, raw)))?;
        if bind.port() == 0 {
            return Err(NatterError::Config(format!(
                "invalid {} endpoint {:?}: port must be non-zero",
                proto, raw
            )));
        }
        let inner = if bind.ip().is_unspecified() {
            SocketAddr::new(outbound_ip, bind.port())
        } else {
            bind
        };
        Ok(Endpoint { proto, bind, inner })
    }
}

/// Resolves once the shutdown flag flips to true or its sender is gone.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
}

/// Initialize the tracing subscriber.
///
/// `level` is the default directive ("debug", "info", ...); `log_file`
/// optionally adds a plain-text file writer next to stdout. A file that
/// cannot be opened falls back to stdout only.
pub fn init_logging(level: &str, log_file: Option<&str>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| NatterError::Config(format!("invalid log level {:?}: {}", level, e)))?;
    for directive in ["igd=warn", "tokio=warn", "runtime=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    let stdout_layer = fmt::layer().with_target(true);

    let file_layer = log_file.filter(|p| !p.is_empty()).and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(fmt::layer().with_ansi(false).with_writer(std::sync::Arc::new(f))),
            Err(e) => {
                eprintln!("cannot open log file {:?}: {}, logging to stdout only", path, e);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(filter)
        .init();
    Ok(())
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_substitutes_unspecified_bind_ip() {
        let out: IpAddr = "192.168.1.10".parse().unwrap();
        let ep = Endpoint::resolve(Protocol::Tcp, "0.0.0.0:34567", out).unwrap();
        assert!(ep.bind.ip().is_unspecified());
        assert_eq!(ep.inner.to_string(), "192.168.1.10:34567");
    }

    #[test]
    fn endpoint_keeps_explicit_bind_ip() {
        let out: IpAddr = "192.168.1.10".parse().unwrap();
        let ep = Endpoint::resolve(Protocol::Udp, "10.0.0.2:5000", out).unwrap();
        assert_eq!(ep.bind, ep.inner);
        assert_eq!(ep.inner.to_string(), "10.0.0.2:5000");
    }

    #[test]
    fn endpoint_rejects_garbage() {
        let out: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(Endpoint::resolve(Protocol::Tcp, "nonsense", out).is_err());
        assert!(Endpoint::resolve(Protocol::Tcp, "0.0.0.0:0", out).is_err());
    }
}
