//! STUN mapping probe.
//!
//! The probe binds its socket to the monitored local port through the
//! reusable-bind factory so the NAT reports the mapping that is actually in
//! use, then walks the configured server list in order and returns on the
//! first success.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::lookup_host;
use tracing::debug;

use crate::error::{NatterError, Result, StunError};
use crate::socket;
use crate::stun::proto::{self, TransactionId, HEADER_SIZE};
use crate::{Endpoint, Protocol};

/// Default per-server probe deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default STUN port, appended to server entries without an explicit port.
const STUN_PORT: u16 = 3478;

/// An observed NAT mapping for one monitored endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub protocol: Protocol,
    /// Local side of the mapping: the probe's source port and the
    /// endpoint's effective bind IP.
    pub inner: SocketAddr,
    /// Public side, from the XOR-MAPPED-ADDRESS attribute.
    pub outer: SocketAddr,
}

/// Probe client over an ordered server list per transport.
#[derive(Debug, Clone)]
pub struct Client {
    tcp_servers: Vec<String>,
    udp_servers: Vec<String>,
    timeout: Duration,
}

impl Client {
    pub fn new(tcp_servers: Vec<String>, udp_servers: Vec<String>, timeout: Duration) -> Self {
        Self {
            tcp_servers,
            udp_servers,
            timeout,
        }
    }

    /// Current mapping for `endpoint`, probing from its own local port.
    ///
    /// Servers are tried in configured order; a transport or protocol error
    /// moves on to the next server, and exhausting the list yields a single
    /// "all servers failed" error. Failures are transient: the control loop
    /// logs and retries on its next tick.
    pub async fn get_mapping(&self, endpoint: &Endpoint) -> Result<Mapping> {
        let outer = match endpoint.proto {
            Protocol::Tcp => self.probe_list(endpoint, &self.tcp_servers, "tcp").await?,
            Protocol::Udp => self.probe_list(endpoint, &self.udp_servers, "udp").await?,
        };
        Ok(Mapping {
            protocol: endpoint.proto,
            inner: endpoint.inner,
            outer,
        })
    }

    async fn probe_list(
        &self,
        endpoint: &Endpoint,
        servers: &[String],
        transport: &'static str,
    ) -> Result<SocketAddr> {
        for server in servers {
            let res = match endpoint.proto {
                Protocol::Tcp => self.tcp_probe(server, endpoint.bind).await,
                Protocol::Udp => self.udp_probe(server, endpoint.bind).await,
            };
            match res {
                Ok(outer) => return Ok(outer),
                Err(e) => {
                    debug!(server = %server, transport, error = %e, "STUN probe failed");
                }
            }
        }
        Err(StunError::AllServersFailed(transport).into())
    }

    /// Resolve a server entry to an IPv4 address, appending the default
    /// port when the entry does not carry one.
    async fn resolve(server: &str, timeout: Duration) -> Result<SocketAddr> {
        let target = if server.contains(':') {
            server.to_string()
        } else {
            format!("{}:{}", server, STUN_PORT)
        };
        let mut addrs = tokio::time::timeout(timeout, lookup_host(target.clone()))
            .await
            .map_err(|_| NatterError::Timeout(timeout))??;
        addrs.find(SocketAddr::is_ipv4).ok_or_else(|| {
            NatterError::Config(format!("no IPv4 address for STUN server {:?}", target))
        })
    }

    async fn udp_probe(&self, server: &str, bind: SocketAddr) -> Result<SocketAddr> {
        let raddr = Self::resolve(server, self.timeout).await?;
        let sock = socket::udp_socket(bind)?;
        sock.connect(raddr).await?;

        let tid = TransactionId::new();
        let request = proto::encode_binding_request(&tid);

        tokio::time::timeout(self.timeout, async {
            sock.send(&request).await?;
            let mut buf = [0u8; 1500];
            let n = sock.recv(&mut buf).await?;
            let outer = proto::decode_binding_response(&buf[..n], &tid)?;
            Ok(outer)
        })
        .await
        .map_err(|_| NatterError::Timeout(self.timeout))?
    }

    async fn tcp_probe(&self, server: &str, bind: SocketAddr) -> Result<SocketAddr> {
        let raddr = Self::resolve(server, self.timeout).await?;
        let mut stream = socket::tcp_dial(bind, raddr, self.timeout).await?;

        let tid = TransactionId::new();
        let request = proto::encode_binding_request(&tid);

        tokio::time::timeout(self.timeout, async {
            stream.write_all(&request).await?;
            let mut header = [0u8; HEADER_SIZE];
            stream.read_exact(&mut header).await?;
            let total = proto::frame_len(&header).ok_or(StunError::InvalidMessage(
                "not a STUN response header".to_string(),
            ))?;
            let mut msg = vec![0u8; total];
            msg[..HEADER_SIZE].copy_from_slice(&header);
            stream.read_exact(&mut msg[HEADER_SIZE..]).await?;
            let outer = proto::decode_binding_response(&msg, &tid)?;
            Ok(outer)
        })
        .await
        .map_err(|_| NatterError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoint(proto: Protocol, port: u16) -> Endpoint {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        Endpoint {
            proto,
            bind,
            inner: bind,
        }
    }

    #[tokio::test]
    async fn empty_server_list_fails_cleanly() {
        let client = Client::new(Vec::new(), Vec::new(), DEFAULT_TIMEOUT);
        let err = client.get_mapping(&endpoint(Protocol::Udp, 1)).await;
        assert!(matches!(
            err,
            Err(NatterError::Stun(StunError::AllServersFailed("udp")))
        ));
    }

    #[tokio::test]
    async fn udp_probe_against_local_responder() {
        // Local responder that answers any binding request with a fixed
        // XOR-MAPPED-ADDRESS.
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let tid = tid_of(&buf[..n]);
            let resp =
                proto::encode_binding_response(&tid, "203.0.113.4:51900".parse().unwrap());
            server.send_to(&resp, from).await.unwrap();
        });

        let client = Client::new(
            Vec::new(),
            vec![server_addr.to_string()],
            DEFAULT_TIMEOUT,
        );
        let probe = socket::udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mapping = client.get_mapping(&endpoint(Protocol::Udp, port)).await.unwrap();
        assert_eq!(mapping.protocol, Protocol::Udp);
        assert_eq!(mapping.inner.port(), port);
        assert_eq!(mapping.outer.to_string(), "203.0.113.4:51900");
    }

    fn tid_of(request: &[u8]) -> TransactionId {
        let mut raw = [0u8; 12];
        raw.copy_from_slice(&request[8..20]);
        TransactionId::from_bytes(raw)
    }
}
