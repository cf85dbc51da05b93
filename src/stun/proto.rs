//! RFC 5389 wire format, reduced to what the mapping probe speaks: a
//! Binding Request carrying FINGERPRINT, and a Binding Response carrying
//! XOR-MAPPED-ADDRESS. Classic MAPPED-ADDRESS is ignored, as is every
//! comprehension-optional attribute we do not understand.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;

use crate::error::StunError;

/// STUN magic cookie.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size.
pub const HEADER_SIZE: usize = 20;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;
pub const BINDING_ERROR: u16 = 0x0111;

const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_FINGERPRINT: u16 = 0x8028;

/// XOR applied to the CRC-32 of the message, per RFC 5389 §15.5.
const FINGERPRINT_MAGIC: u32 = 0x5354_554E;

/// Random 96-bit transaction ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Encode a Binding Request with the given transaction ID and a trailing
/// FINGERPRINT attribute. The message length field covers the fingerprint.
pub fn encode_binding_request(tid: &TransactionId) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 8);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(8); // one FINGERPRINT attribute
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(tid.as_bytes());

    let crc = crc32fast::hash(&buf) ^ FINGERPRINT_MAGIC;
    buf.put_u16(ATTR_FINGERPRINT);
    buf.put_u16(4);
    buf.put_u32(crc);
    buf.to_vec()
}

/// Encode a Binding Response mapping `tid` to `mapped` via
/// XOR-MAPPED-ADDRESS. Used by the local responders in the test suite.
pub fn encode_binding_response(tid: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
    let ip = match mapped.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 12);
    buf.put_u16(BINDING_RESPONSE);
    buf.put_u16(12); // one IPv4 XOR-MAPPED-ADDRESS attribute
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(tid.as_bytes());

    buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
    buf.put_u16(8);
    buf.put_u8(0);
    buf.put_u8(0x01); // IPv4
    buf.put_u16(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16);
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut octets = ip.octets();
    for (o, c) in octets.iter_mut().zip(cookie) {
        *o ^= c;
    }
    buf.put_slice(&octets);
    buf.to_vec()
}

/// Total message size announced by a STUN header, or `None` if the first
/// bytes are not a plausible header. Used to frame responses on TCP.
pub fn frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_SIZE {
        return None;
    }
    let cookie = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if cookie != MAGIC_COOKIE {
        return None;
    }
    let body = u16::from_be_bytes([header[2], header[3]]) as usize;
    Some(HEADER_SIZE + body)
}

/// Decode a Binding Response and extract XOR-MAPPED-ADDRESS.
///
/// The transaction ID must match the request; a Binding Error response is
/// surfaced with its ERROR-CODE.
pub fn decode_binding_response(
    data: &[u8],
    tid: &TransactionId,
) -> Result<SocketAddr, StunError> {
    if data.len() < HEADER_SIZE {
        return Err(StunError::InvalidMessage(format!(
            "message too short: {} bytes",
            data.len()
        )));
    }

    let mut buf = BytesMut::from(data);
    let msg_type = buf.get_u16();
    let msg_len = buf.get_u16() as usize;
    let cookie = buf.get_u32();
    if cookie != MAGIC_COOKIE {
        return Err(StunError::InvalidMessage(format!(
            "bad magic cookie: {:#010x}",
            cookie
        )));
    }
    let mut got_tid = [0u8; 12];
    buf.copy_to_slice(&mut got_tid);
    if &got_tid != tid.as_bytes() {
        return Err(StunError::TransactionMismatch);
    }
    if buf.remaining() < msg_len {
        return Err(StunError::InvalidMessage(format!(
            "truncated message: header says {} body bytes, got {}",
            msg_len,
            buf.remaining()
        )));
    }
    buf.truncate(msg_len);

    match msg_type {
        BINDING_RESPONSE => {}
        BINDING_ERROR => return Err(decode_error_code(&mut buf)),
        other => {
            return Err(StunError::InvalidMessage(format!(
                "unexpected message type: {:#06x}",
                other
            )))
        }
    }

    while buf.remaining() >= 4 {
        let attr_type = buf.get_u16();
        let attr_len = buf.get_u16() as usize;
        if buf.remaining() < attr_len {
            return Err(StunError::InvalidMessage(format!(
                "truncated attribute {:#06x}",
                attr_type
            )));
        }
        let mut value = buf.split_to(attr_len);
        // attributes are padded to a 4-byte boundary
        let padding = (4 - attr_len % 4) % 4;
        buf.advance(padding.min(buf.remaining()));

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            return decode_xor_address(&mut value, tid);
        }
    }

    Err(StunError::MissingAttribute("XOR-MAPPED-ADDRESS"))
}

fn decode_xor_address(
    buf: &mut BytesMut,
    _tid: &TransactionId,
) -> Result<SocketAddr, StunError> {
    if buf.remaining() < 8 {
        return Err(StunError::InvalidMessage(
            "XOR-MAPPED-ADDRESS too short".to_string(),
        ));
    }
    buf.advance(1); // reserved
    let family = buf.get_u8();
    if family != 0x01 {
        // the probe is IPv4-only
        return Err(StunError::InvalidMessage(format!(
            "unsupported address family: {:#04x}",
            family
        )));
    }
    let port = buf.get_u16() ^ (MAGIC_COOKIE >> 16) as u16;
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    for (o, c) in octets.iter_mut().zip(cookie) {
        *o ^= c;
    }
    Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
}

fn decode_error_code(buf: &mut BytesMut) -> StunError {
    while buf.remaining() >= 4 {
        let attr_type = buf.get_u16();
        let attr_len = buf.get_u16() as usize;
        if buf.remaining() < attr_len {
            break;
        }
        let mut value = buf.split_to(attr_len);
        let padding = (4 - attr_len % 4) % 4;
        buf.advance(padding.min(buf.remaining()));

        if attr_type == ATTR_ERROR_CODE && value.remaining() >= 4 {
            value.advance(2); // reserved
            let class = value.get_u8() as u16;
            let number = value.get_u8() as u16;
            let reason = String::from_utf8_lossy(&value).into_owned();
            return StunError::ErrorResponse {
                code: class * 100 + number,
                reason,
            };
        }
    }
    StunError::ErrorResponse {
        code: 0,
        reason: "error response without ERROR-CODE".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_layout() {
        let tid = TransactionId::new();
        let msg = encode_binding_request(&tid);
        assert_eq!(msg.len(), HEADER_SIZE + 8);
        assert_eq!(u16::from_be_bytes([msg[0], msg[1]]), BINDING_REQUEST);
        assert_eq!(u16::from_be_bytes([msg[2], msg[3]]), 8);
        assert_eq!(&msg[8..20], tid.as_bytes());
        assert_eq!(frame_len(&msg), Some(msg.len()));
    }

    #[test]
    fn fingerprint_matches_rfc_computation() {
        let tid = TransactionId::new();
        let msg = encode_binding_request(&tid);
        let crc = crc32fast::hash(&msg[..HEADER_SIZE]) ^ FINGERPRINT_MAGIC;
        assert_eq!(u32::from_be_bytes([msg[24], msg[25], msg[26], msg[27]]), crc);
    }

    #[test]
    fn response_round_trip() {
        let tid = TransactionId::new();
        let mapped: SocketAddr = "203.0.113.4:51900".parse().unwrap();
        let msg = encode_binding_response(&tid, mapped);
        let got = decode_binding_response(&msg, &tid).unwrap();
        assert_eq!(got, mapped);
    }

    #[test]
    fn xor_decode_known_vector() {
        // 192.0.2.1:32853 xored with the magic cookie, RFC 5769-style.
        let tid = TransactionId::new();
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&12u16.to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(tid.as_bytes());
        msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&8u16.to_be_bytes());
        msg.push(0);
        msg.push(0x01);
        msg.extend_from_slice(&(32853u16 ^ 0x2112).to_be_bytes());
        for (o, c) in [192u8, 0, 2, 1].iter().zip(MAGIC_COOKIE.to_be_bytes()) {
            msg.push(o ^ c);
        }
        let got = decode_binding_response(&msg, &tid).unwrap();
        assert_eq!(got, "192.0.2.1:32853".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn transaction_mismatch_is_rejected() {
        let tid = TransactionId::new();
        let other = TransactionId::new();
        let msg = encode_binding_response(&tid, "1.2.3.4:5".parse().unwrap());
        match decode_binding_response(&msg, &other) {
            Err(StunError::TransactionMismatch) => {}
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn error_response_is_surfaced() {
        let tid = TransactionId::new();
        let reason = b"Bad Request";
        let attr_len = 4 + reason.len();
        let padded = attr_len + (4 - attr_len % 4) % 4;
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_ERROR.to_be_bytes());
        msg.extend_from_slice(&((4 + padded) as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(tid.as_bytes());
        msg.extend_from_slice(&ATTR_ERROR_CODE.to_be_bytes());
        msg.extend_from_slice(&(attr_len as u16).to_be_bytes());
        msg.extend_from_slice(&[0, 0, 4, 0]); // class 4, number 0
        msg.extend_from_slice(reason);
        msg.resize(HEADER_SIZE + 4 + padded, 0);
        match decode_binding_response(&msg, &tid) {
            Err(StunError::ErrorResponse { code: 400, reason }) => {
                assert!(reason.starts_with("Bad Request"));
            }
            other => panic!("expected error response, got {:?}", other),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        let tid = TransactionId::new();
        assert!(decode_binding_response(&[0u8; 8], &tid).is_err());
        assert!(frame_len(&[0u8; 20]).is_none());
    }
}
