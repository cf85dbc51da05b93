//! Keep-alive traffic generators.
//!
//! A NAT tracks the five-tuple of a live flow, so the keep-alive must share
//! its local `(IP, port)` with everything else on the monitored port. The
//! TCP variant holds one persistent connection and redials with exponential
//! backoff; the UDP variant sends a minimal DNS query on the shared packet
//! socket every tick.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::debug;

use crate::cancelled;
use crate::socket;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const READ_DEADLINE: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// A non-positive interval is clamped to 5 seconds.
pub fn min_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        Duration::from_secs(5)
    } else {
        interval
    }
}

/// Next redial delay while disconnected: doubled, capped at 60 seconds.
pub(crate) fn next_backoff(backoff: Duration) -> Duration {
    (backoff * 2).min(BACKOFF_CEILING)
}

/// Persistent TCP keep-alive bound to `local`.
///
/// Dials `host:80`, then writes one HEAD request per tick and drains any
/// response bytes under a short read deadline. A dead connection is redialed
/// from the same local address with exponential backoff.
pub async fn tcp_keep_alive(
    mut cancel: watch::Receiver<bool>,
    local: SocketAddr,
    host: String,
    interval: Duration,
) {
    let interval = min_interval(interval);
    let mut backoff = interval;
    let mut conn: Option<TcpStream> = None;

    loop {
        if conn.is_none() {
            match dial(local, &host).await {
                Ok(c) => {
                    debug!(host = %host, local = %local, "TCP keepalive connection established");
                    conn = Some(c);
                    backoff = interval;
                }
                Err(e) => {
                    debug!(host = %host, error = %e, "TCP keepalive dial failed");
                    tokio::select! {
                        _ = cancelled(&mut cancel) => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            }
        }

        if let Some(c) = conn.as_mut() {
            if !tick(c, &host).await {
                conn = None;
                continue;
            }
            debug!(host = %host, "TCP keepalive ok");
        }

        tokio::select! {
            _ = cancelled(&mut cancel) => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn dial(local: SocketAddr, host: &str) -> std::io::Result<TcpStream> {
    let mut addrs = lookup_host((host, 80)).await?;
    let remote = addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no IPv4 address"))?;
    let stream = socket::tcp_dial(local, remote, DIAL_TIMEOUT).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// One keep-alive round: write the HEAD request, drain replies until the
/// read deadline. Returns false when the connection must be redialed.
async fn tick(conn: &mut TcpStream, host: &str) -> bool {
    let request = format!(
        "HEAD /natter-keep-alive HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\n\r\n",
        host
    );
    if let Err(e) = conn.write_all(request.as_bytes()).await {
        debug!(error = %e, "TCP keepalive write failed");
        return false;
    }

    let deadline = tokio::time::Instant::now() + READ_DEADLINE;
    let mut buf = [0u8; 512];
    loop {
        match tokio::time::timeout_at(deadline, conn.read(&mut buf)).await {
            // deadline elapsed: expected, the response has been drained
            Err(_) => return true,
            Ok(Ok(0)) => {
                debug!("TCP keepalive peer closed connection");
                return false;
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => {
                debug!(error = %e, "TCP keepalive read failed");
                return false;
            }
        }
    }
}

/// DNS-query keep-alive on the shared packet socket.
///
/// `host` is re-resolved every tick to tolerate dynamic DNS; failures are
/// logged and retried on the next tick.
pub async fn udp_keep_alive(
    mut cancel: watch::Receiver<bool>,
    sock: Arc<UdpSocket>,
    host: String,
    port: u16,
    interval: Duration,
) {
    let interval = min_interval(interval);

    loop {
        match resolve_udp(&host, port).await {
            Some(raddr) => {
                let frame = dns_query_frame();
                match sock.send_to(&frame, raddr).await {
                    Ok(_) => debug!(to = %raddr, "UDP keepalive sent"),
                    Err(e) => debug!(error = %e, "UDP keepalive send failed"),
                }
            }
            None => debug!(host = %host, "UDP keepalive resolve failed"),
        }

        tokio::select! {
            _ = cancelled(&mut cancel) => {
                debug!("UDP keepalive exiting");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn resolve_udp(host: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }
    match lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
        Err(_) => None,
    }
}

/// Minimal DNS query: random transaction ID, standard-query flags, one
/// A/IN question for `keepalive.natter`, no additional sections.
pub(crate) fn dns_query_frame() -> Vec<u8> {
    let txid: u16 = rand::thread_rng().gen();
    let mut frame = Vec::with_capacity(34);
    frame.extend_from_slice(&txid.to_be_bytes());
    frame.extend_from_slice(&[0x01, 0x00]); // flags: standard query, RD
    frame.extend_from_slice(&[0x00, 0x01]); // QDCOUNT = 1
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]); // AN/NS/AR
    frame.push(9);
    frame.extend_from_slice(b"keepalive");
    frame.push(6);
    frame.extend_from_slice(b"natter");
    frame.push(0);
    frame.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // QTYPE A, QCLASS IN
    frame
}
