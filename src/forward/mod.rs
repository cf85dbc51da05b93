//! Blind L4 relays from a monitored local port to a backend service.

pub mod tcp;
pub mod udp;

pub use tcp::TcpForwarder;
pub use udp::UdpForwarder;

/// Datagram and splice buffer size.
pub const BUF_SIZE: usize = 2048;
