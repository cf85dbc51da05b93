//! UDP forwarder with per-source sessions.
//!
//! One listening socket relays datagrams to the target through a connected
//! sub-socket per observed source address. A reverse pump copies replies
//! back until the target stays silent past the idle timeout, then the
//! session is dropped. The next datagram from that source allocates a
//! fresh session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::BUF_SIZE;
use crate::cancelled;
use crate::error::Result;
use crate::socket;

type Sessions = Arc<Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>>;

pub struct UdpForwarder {
    listen: SocketAddr,
    target: String,
    timeout: Duration,
    sessions: Sessions,
    local_addr: Option<SocketAddr>,
    main_task: Option<JoinHandle<()>>,
}

impl UdpForwarder {
    /// `timeout` bounds target silence per session; the orchestrator passes
    /// the polling interval.
    pub fn new(listen: SocketAddr, target: String, timeout: Duration) -> Self {
        Self {
            listen,
            target,
            timeout,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            local_addr: None,
            main_task: None,
        }
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Live session count, for observability.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn start(&mut self, cancel: watch::Receiver<bool>) -> Result<()> {
        let sock = Arc::new(socket::udp_socket(self.listen)?);
        self.local_addr = sock.local_addr().ok();
        info!(listen = %self.listen, target = %self.target, "UDP forwarder listening");

        let target = self.target.clone();
        let timeout = self.timeout;
        let sessions = Arc::clone(&self.sessions);
        self.main_task = Some(tokio::spawn(relay_loop(
            sock, target, timeout, sessions, cancel,
        )));
        Ok(())
    }

    /// Waits for the relay loop and every reverse pump to finish.
    pub async fn stop(&mut self) {
        if let Some(task) = self.main_task.take() {
            let _ = task.await;
        }
        info!(listen = %self.listen, "UDP forwarder stopped");
    }
}

async fn relay_loop(
    sock: Arc<UdpSocket>,
    target: String,
    timeout: Duration,
    sessions: Sessions,
    cancel: watch::Receiver<bool>,
) {
    let mut pumps: JoinSet<()> = JoinSet::new();
    let mut recv_cancel = cancel.clone();
    let mut buf = [0u8; BUF_SIZE];

    loop {
        let (n, client) = tokio::select! {
            _ = cancelled(&mut recv_cancel) => break,
            received = sock.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "UDP read error");
                    continue;
                }
            }
        };

        // the map is only held to read or install a session, never across I/O
        let existing = sessions.lock().get(&client).cloned();
        let session = match existing {
            Some(s) => s,
            None => match open_session(&target).await {
                Ok(s) => {
                    sessions.lock().insert(client, Arc::clone(&s));
                    debug!(client = %client, "UDP session opened");
                    pumps.spawn(reverse_pump(
                        Arc::clone(&sock),
                        Arc::clone(&s),
                        client,
                        timeout,
                        Arc::clone(&sessions),
                        cancel.clone(),
                    ));
                    s
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "UDP dial to target failed");
                    continue;
                }
            },
        };

        if let Err(e) = session.send(&buf[..n]).await {
            debug!(error = %e, "UDP write to target failed");
        }
    }

    while pumps.join_next().await.is_some() {}
}

/// Connected sub-socket to the target, on an ephemeral local port.
async fn open_session(target: &str) -> std::io::Result<Arc<UdpSocket>> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.connect(target).await?;
    Ok(Arc::new(sock))
}

/// Copy target replies back to `client` until the idle deadline passes
/// without a read, then tear the session down.
async fn reverse_pump(
    listener: Arc<UdpSocket>,
    session: Arc<UdpSocket>,
    client: SocketAddr,
    timeout: Duration,
    sessions: Sessions,
    mut cancel: watch::Receiver<bool>,
) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancelled(&mut cancel) => break,
            read = tokio::time::timeout(timeout, session.recv(&mut buf)) => read,
        };
        match read {
            Err(_) => {
                debug!(client = %client, "UDP session idle, closing");
                break;
            }
            Ok(Err(e)) => {
                debug!(client = %client, error = %e, "UDP session read closed");
                break;
            }
            Ok(Ok(n)) => {
                if let Err(e) = listener.send_to(&buf[..n], client).await {
                    debug!(client = %client, error = %e, "UDP write back to client failed");
                }
            }
        }
    }
    sessions.lock().remove(&client);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_are_garbage_collected_after_idle() {
        // backend that echoes exactly one datagram per source
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; BUF_SIZE];
            loop {
                let (n, from) = backend.recv_from(&mut buf).await.unwrap();
                backend.send_to(&buf[..n], from).await.unwrap();
            }
        });

        let (tx, rx) = watch::channel(false);
        let mut fwd = UdpForwarder::new(
            "127.0.0.1:0".parse().unwrap(),
            backend_addr.to_string(),
            Duration::from_millis(200),
        );
        fwd.start(rx).unwrap();
        let listen = fwd.local_addr().unwrap();

        let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_a.send_to(b"a", listen).await.unwrap();
        client_b.send_to(b"b", listen).await.unwrap();

        let mut buf = [0u8; 8];
        let (n, _) = client_a.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"a");
        let (n, _) = client_b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"b");
        assert_eq!(fwd.session_count(), 2);

        // silence beyond the idle timeout reaps both sessions
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fwd.session_count(), 0);

        // a new datagram from A allocates a fresh session
        client_a.send_to(b"again", listen).await.unwrap();
        let (n, _) = client_a.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"again");
        assert_eq!(fwd.session_count(), 1);

        tx.send(true).unwrap();
        fwd.stop().await;
    }

    #[tokio::test]
    async fn at_most_one_session_per_source() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; BUF_SIZE];
            loop {
                let (n, from) = backend.recv_from(&mut buf).await.unwrap();
                backend.send_to(&buf[..n], from).await.unwrap();
            }
        });

        let (tx, rx) = watch::channel(false);
        let mut fwd = UdpForwarder::new(
            "127.0.0.1:0".parse().unwrap(),
            backend_addr.to_string(),
            Duration::from_secs(5),
        );
        fwd.start(rx).unwrap();
        let listen = fwd.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 8];
        for _ in 0..3 {
            client.send_to(b"x", listen).await.unwrap();
            let _ = client.recv_from(&mut buf).await.unwrap();
        }
        assert_eq!(fwd.session_count(), 1);

        tx.send(true).unwrap();
        fwd.stop().await;
    }
}
