//! TCP accept-and-splice forwarder.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cancelled;
use crate::error::Result;
use crate::socket;

/// Accepts connections on `listen` and splices each to `target`.
///
/// The listener comes from the reusable-bind factory so the forwarder can
/// share the monitored port with the STUN probe and the keep-alive flow.
pub struct TcpForwarder {
    listen: SocketAddr,
    target: String,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpForwarder {
    pub fn new(listen: SocketAddr, target: String) -> Self {
        Self {
            listen,
            target,
            local_addr: None,
            accept_task: None,
        }
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and spawn the accept loop. A bind failure aborts
    /// only this forwarder; the caller logs and carries on.
    pub fn start(&mut self, cancel: watch::Receiver<bool>) -> Result<()> {
        let listener = socket::tcp_listener(self.listen)?;
        self.local_addr = listener.local_addr().ok();
        info!(listen = %self.listen, target = %self.target, "TCP forwarder listening");

        let target = self.target.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, target, cancel)));
        Ok(())
    }

    /// Waits for the accept loop and every in-flight splice to finish.
    /// Call after the shutdown signal has fired.
    pub async fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        info!(listen = %self.listen, "TCP forwarder stopped");
    }
}

async fn accept_loop(listener: TcpListener, target: String, cancel: watch::Receiver<bool>) {
    let mut conns: JoinSet<()> = JoinSet::new();
    let mut accept_cancel = cancel.clone();
    loop {
        tokio::select! {
            _ = cancelled(&mut accept_cancel) => break,
            accepted = listener.accept() => match accepted {
                Ok((src, peer)) => {
                    debug!(client = %peer, "accepted TCP client");
                    let target = target.clone();
                    let cancel = cancel.clone();
                    conns.spawn(handle_connection(src, target, cancel));
                }
                Err(e) => {
                    debug!(error = %e, "TCP accept error");
                    break;
                }
            }
        }
    }
    while conns.join_next().await.is_some() {}
}

/// Dial the target and splice both directions until either side closes.
/// No read or write deadlines apply to the splice itself.
async fn handle_connection(mut src: TcpStream, target: String, mut cancel: watch::Receiver<bool>) {
    let mut dst = match TcpStream::connect(&target).await {
        Ok(dst) => dst,
        Err(e) => {
            warn!(target = %target, error = %e, "TCP dial to target failed");
            return;
        }
    };

    tokio::select! {
        _ = cancelled(&mut cancel) => {}
        res = tokio::io::copy_bidirectional(&mut src, &mut dst) => {
            if let Err(e) = res {
                debug!(error = %e, "TCP splice ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relays_both_directions() {
        // echo backend
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = s.read(&mut buf).await.unwrap();
            s.write_all(&buf[..n]).await.unwrap();
        });

        let (tx, rx) = watch::channel(false);
        let mut fwd = TcpForwarder::new(
            "127.0.0.1:0".parse().unwrap(),
            backend_addr.to_string(),
        );
        fwd.start(rx).unwrap();
        let listen = fwd.local_addr().unwrap();

        let mut client = TcpStream::connect(listen).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        tx.send(true).unwrap();
        fwd.stop().await;
    }

    #[tokio::test]
    async fn unreachable_target_closes_client() {
        let (tx, rx) = watch::channel(false);
        let mut fwd = TcpForwarder::new(
            "127.0.0.1:0".parse().unwrap(),
            // reserved port with nothing listening
            "127.0.0.1:1".to_string(),
        );
        fwd.start(rx).unwrap();
        let listen = fwd.local_addr().unwrap();

        let mut client = TcpStream::connect(listen).await.unwrap();
        let mut buf = [0u8; 1];
        // the forwarder closes our side once the target dial fails
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        tx.send(true).unwrap();
        fwd.stop().await;
    }
}
