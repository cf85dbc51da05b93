//! STUN (RFC 5389) Binding subset used to discover NAT mappings.

pub mod client;
pub mod proto;

pub use client::{Client, Mapping, DEFAULT_TIMEOUT};
pub use proto::{TransactionId, HEADER_SIZE, MAGIC_COOKIE};
