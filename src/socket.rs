//! Reusable-bind socket factory.
//!
//! Every socket that touches a monitored local port comes from here: the
//! STUN probe, the keep-alive dialer, the forwarder listener and the shared
//! UDP packet socket all bind the same `(IP, port)` and rely on the kernel
//! de-multiplexing by five-tuple. On Unix this takes `SO_REUSEADDR` together
//! with `SO_REUSEPORT`, set before bind. On Windows only `SO_REUSEADDR` is
//! available and there is no packet steering, so a TCP listener and a bound
//! TCP dial cannot share a port there: the port has a single owner at a time
//! and the second bind reports the error to its own subsystem.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

fn reusable(addr: &SocketAddr, ty: Type, proto: Protocol) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, ty, Some(proto))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// TCP listener on `bind` that tolerates other sockets on the same port.
pub fn tcp_listener(bind: SocketAddr) -> io::Result<TcpListener> {
    let socket = reusable(&bind, Type::STREAM, Protocol::TCP)?;
    socket.bind(&bind.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}

/// Outbound TCP connection dialed from a fixed local address.
pub async fn tcp_dial(
    local: SocketAddr,
    remote: SocketAddr,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = reusable(&local, Type::STREAM, Protocol::TCP)?;
    socket.bind(&local.into())?;
    let socket = TcpSocket::from_std_stream(socket.into());
    match tokio::time::timeout(timeout, socket.connect(remote)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out", remote),
        )),
    }
}

/// UDP socket bound to `local` alongside any other socket on that port.
pub fn udp_socket(local: SocketAddr) -> io::Result<UdpSocket> {
    let socket = reusable(&local, Type::DGRAM, Protocol::UDP)?;
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}
