//! One-shot UPnP IGD port mapping.
//!
//! Tried once at startup when enabled; every failure is a warning, never
//! fatal. The gateway keeps the mapping permanently (lease 0).

use std::net::{IpAddr, SocketAddrV4};
use std::time::Duration;

use igd::aio::{search_gateway, Gateway};
use igd::{PortMappingProtocol, SearchOptions};
use tracing::{info, warn};

use crate::error::{NatterError, Result};
use crate::{Endpoint, Protocol};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const ADD_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a discovered IGDv1 WANIPConnection service.
pub struct UpnpClient {
    gateway: Gateway,
}

impl UpnpClient {
    /// Discover the first IGD on the local network, best-effort.
    pub async fn discover() -> Result<Self> {
        let options = SearchOptions {
            timeout: Some(DISCOVERY_TIMEOUT),
            ..Default::default()
        };
        let gateway = search_gateway(options)
            .await
            .map_err(|e| NatterError::Upnp(format!("discovery failed: {}", e)))?;
        info!(gateway = %gateway.addr, "UPnP IGD found");
        Ok(Self { gateway })
    }

    /// Add a permanent mapping `external = endpoint.port` to the endpoint's
    /// resolved inner address.
    pub async fn add_mapping(&self, endpoint: &Endpoint) -> Result<()> {
        let proto = match endpoint.proto {
            Protocol::Tcp => PortMappingProtocol::TCP,
            Protocol::Udp => PortMappingProtocol::UDP,
        };
        let internal = match endpoint.inner.ip() {
            IpAddr::V4(ip) => SocketAddrV4::new(ip, endpoint.inner.port()),
            IpAddr::V6(_) => {
                return Err(NatterError::Upnp(format!(
                    "cannot map IPv6 internal address {}",
                    endpoint.inner
                )))
            }
        };

        tokio::time::timeout(
            ADD_TIMEOUT,
            self.gateway
                .add_port(proto, endpoint.inner.port(), internal, 0, "natter"),
        )
        .await
        .map_err(|_| NatterError::Timeout(ADD_TIMEOUT))?
        .map_err(|e| {
            NatterError::Upnp(format!(
                "add mapping {} {} failed: {}",
                endpoint.proto, endpoint.inner, e
            ))
        })?;

        info!(protocol = %endpoint.proto, inner = %endpoint.inner, "UPnP port mapping added");
        Ok(())
    }
}

/// Map every open endpoint, logging failures as warnings.
pub async fn map_endpoints(endpoints: &[Endpoint]) {
    let client = match UpnpClient::discover().await {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "UPnP unavailable");
            return;
        }
    };
    for endpoint in endpoints {
        if let Err(e) = client.add_mapping(endpoint).await {
            warn!(error = %e, "UPnP mapping failed");
        }
    }
}
