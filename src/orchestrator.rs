//! The orchestrator wires every subsystem together: it detects the outbound
//! IP, resolves the monitored endpoints, starts the status manager and the
//! forwarders, and drives one keep-alive loop plus one mapping control loop
//! per open port until the shutdown signal fires.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::forward::{TcpForwarder, UdpForwarder};
use crate::status::{StatusManager, UpdateEvent};
use crate::{cancelled, keepalive, socket, stun, upnp};
use crate::{Endpoint, Protocol};

/// External IPv4 host used as a routing-table probe. Connecting a UDP
/// socket sends no packets; it only asks the OS which source address it
/// would pick for a public destination.
const OUTBOUND_PROBE: &str = "119.29.29.29:53";

pub struct Natter {
    cfg: Config,
    interval: Duration,
    outbound_ip: IpAddr,
    stun: stun::Client,
    status: Option<StatusManager>,
    updates: mpsc::Sender<UpdateEvent>,
    tcp_open: Vec<Endpoint>,
    udp_open: Vec<Endpoint>,
    tcp_fwds: Vec<TcpForwarder>,
    udp_fwds: Vec<UdpForwarder>,
}

impl Natter {
    pub fn new(cfg: Config) -> Result<Self> {
        let outbound_ip = detect_outbound_ip();
        info!(ip = %outbound_ip, "outbound IP detected");

        let interval = Duration::from_secs(cfg.interval.max(0) as u64);

        let mut tcp_open = Vec::new();
        for raw in &cfg.open_port.tcp {
            tcp_open.push(Endpoint::resolve(Protocol::Tcp, raw, outbound_ip)?);
        }
        let mut udp_open = Vec::new();
        for raw in &cfg.open_port.udp {
            udp_open.push(Endpoint::resolve(Protocol::Udp, raw, outbound_ip)?);
        }

        let stun = stun::Client::new(
            cfg.stun_server.tcp.clone(),
            cfg.stun_server.udp.clone(),
            stun::DEFAULT_TIMEOUT,
        );

        let status = StatusManager::new(
            status_file_path(&cfg),
            &cfg.status_report.hook,
        )?;
        let updates = status.sender();

        let fwd_interval = keepalive::min_interval(interval);
        let tcp_fwds = pair_forwarders(&tcp_open, &cfg.forward_port.tcp)
            .into_iter()
            .map(|(listen, target)| TcpForwarder::new(listen, target))
            .collect();
        let udp_fwds = pair_forwarders(&udp_open, &cfg.forward_port.udp)
            .into_iter()
            .map(|(listen, target)| UdpForwarder::new(listen, target, fwd_interval))
            .collect();

        Ok(Self {
            cfg,
            interval,
            outbound_ip,
            stun,
            status: Some(status),
            updates,
            tcp_open,
            udp_open,
            tcp_fwds,
            udp_fwds,
        })
    }

    pub fn outbound_ip(&self) -> IpAddr {
        self.outbound_ip
    }

    /// Run every subsystem until `cancel` fires, then join all of them.
    pub async fn run(mut self, cancel: watch::Receiver<bool>) {
        if self.cfg.enable_upnp {
            let endpoints: Vec<Endpoint> = self
                .tcp_open
                .iter()
                .chain(self.udp_open.iter())
                .copied()
                .collect();
            upnp::map_endpoints(&endpoints).await;
        }

        let mut tasks: JoinSet<()> = JoinSet::new();

        if let Some(status) = self.status.take() {
            tasks.spawn(status.run(cancel.clone()));
        }

        for fwd in &mut self.tcp_fwds {
            if let Err(e) = fwd.start(cancel.clone()) {
                warn!(error = %e, "TCP forwarder start failed");
            }
        }
        for fwd in &mut self.udp_fwds {
            if let Err(e) = fwd.start(cancel.clone()) {
                warn!(error = %e, "UDP forwarder start failed");
            }
        }

        for endpoint in self.tcp_open.iter().copied() {
            tasks.spawn(keepalive::tcp_keep_alive(
                cancel.clone(),
                SocketAddr::new(self.outbound_ip, endpoint.bind.port()),
                self.cfg.keep_alive.clone(),
                self.interval,
            ));
            tasks.spawn(control_loop(
                self.stun.clone(),
                endpoint,
                self.interval,
                self.updates.clone(),
                cancel.clone(),
            ));
        }

        for endpoint in self.udp_open.iter().copied() {
            // the keep-alive shares the monitored port through a
            // reusable-bind packet socket
            match socket::udp_socket(endpoint.bind) {
                Ok(sock) => {
                    tasks.spawn(keepalive::udp_keep_alive(
                        cancel.clone(),
                        Arc::new(sock),
                        self.cfg.keep_alive.clone(),
                        endpoint.bind.port(),
                        self.interval,
                    ));
                }
                Err(e) => {
                    warn!(addr = %endpoint.bind, error = %e, "UDP bind failed for keepalive");
                }
            }
            tasks.spawn(control_loop(
                self.stun.clone(),
                endpoint,
                self.interval,
                self.updates.clone(),
                cancel.clone(),
            ));
        }

        let mut wait = cancel.clone();
        cancelled(&mut wait).await;
        info!("natter shutting down");

        for fwd in &mut self.tcp_fwds {
            fwd.stop().await;
        }
        for fwd in &mut self.udp_fwds {
            fwd.stop().await;
        }
        while tasks.join_next().await.is_some() {}
    }
}

/// Periodic mapping rediscovery for one endpoint. Probes are serialised:
/// at most one is in flight per endpoint, and an update is enqueued only
/// when the observed outer address changed.
async fn control_loop(
    stun: stun::Client,
    endpoint: Endpoint,
    interval: Duration,
    updates: mpsc::Sender<UpdateEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let interval = keepalive::min_interval(interval);
    let inner = endpoint.inner.to_string();
    let mut last_outer: Option<String> = None;

    loop {
        match stun.get_mapping(&endpoint).await {
            Ok(mapping) => {
                let outer = mapping.outer.to_string();
                if last_outer.as_deref() != Some(outer.as_str()) {
                    let ev = UpdateEvent {
                        protocol: endpoint.proto,
                        inner: inner.clone(),
                        outer: outer.clone(),
                    };
                    match updates.try_send(ev) {
                        Ok(()) => last_outer = Some(outer),
                        // a full queue re-observes on the next poll
                        Err(e) => debug!(error = %e, "update event dropped"),
                    }
                }
            }
            Err(e) => {
                debug!(protocol = %endpoint.proto, port = endpoint.bind.port(), error = %e, "mapping probe failed");
            }
        }

        tokio::select! {
            _ = cancelled(&mut cancel) => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Pair forwarder listen addresses with targets.
///
/// When the open-port list and the target list have equal length they are
/// paired by index and the forwarder listens on the open endpoint itself;
/// otherwise each target gets a listener on the unspecified address at the
/// target's own port. Targets without a parseable port are skipped with a
/// warning.
fn pair_forwarders(open: &[Endpoint], targets: &[String]) -> Vec<(SocketAddr, String)> {
    if !targets.is_empty() && open.len() == targets.len() {
        return open
            .iter()
            .zip(targets)
            .map(|(ep, target)| (ep.bind, target.clone()))
            .collect();
    }
    targets
        .iter()
        .filter_map(|target| match port_of(target) {
            Some(port) => Some((
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                target.clone(),
            )),
            None => {
                warn!(target = %target, "forward target has no valid port, skipping");
                None
            }
        })
        .collect()
}

fn port_of(target: &str) -> Option<u16> {
    let (_, port) = target.rsplit_once(':')?;
    port.parse().ok().filter(|p| *p > 0)
}

fn status_file_path(cfg: &Config) -> String {
    if cfg.status_report.status_file.is_empty() {
        "status.json".to_string()
    } else {
        cfg.status_report.status_file.clone()
    }
}

/// Ask the routing table which source IP reaches the public Internet.
/// No packets are sent. Falls back to loopback when there is no route.
fn detect_outbound_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let sock = std::net::UdpSocket::bind("0.0.0.0:0")?;
        sock.connect(OUTBOUND_PROBE)?;
        Ok(sock.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(raw: &str) -> Endpoint {
        Endpoint::resolve(Protocol::Tcp, raw, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))).unwrap()
    }

    #[test]
    fn equal_length_lists_pair_by_index() {
        let open = vec![ep("0.0.0.0:34567"), ep("0.0.0.0:34568")];
        let targets = vec!["127.0.0.1:8080".to_string(), "127.0.0.1:9090".to_string()];
        let pairs = pair_forwarders(&open, &targets);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.port(), 34567);
        assert_eq!(pairs[0].1, "127.0.0.1:8080");
        assert_eq!(pairs[1].0.port(), 34568);
    }

    #[test]
    fn unequal_lists_listen_on_target_ports() {
        let open = vec![ep("0.0.0.0:34567")];
        let targets = vec!["127.0.0.1:8080".to_string(), "10.0.0.9:9090".to_string()];
        let pairs = pair_forwarders(&open, &targets);
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].0.ip().is_unspecified());
        assert_eq!(pairs[0].0.port(), 8080);
        assert_eq!(pairs[1].0.port(), 9090);
    }

    #[test]
    fn invalid_targets_are_skipped() {
        let pairs = pair_forwarders(&[], &["no-port-here".to_string()]);
        assert!(pairs.is_empty());
        assert_eq!(port_of("host:8080"), Some(8080));
        assert_eq!(port_of("host:0"), None);
        assert_eq!(port_of("host"), None);
    }

    #[test]
    fn outbound_ip_detection_never_panics() {
        let ip = detect_outbound_ip();
        assert!(ip.is_ipv4());
    }
}
