//! Minimal STUN (RFC 5389) binding request/response handling.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Reliable public STUN servers used when none are configured
pub const STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

/// Build a STUN Binding Request message (RFC 5389)
pub fn build_binding_request(tx_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    // No attributes
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE);
    msg.extend_from_slice(tx_id);
    msg
}

/// Extract the mapped IPv4 endpoint from a Binding Success Response.
///
/// Prefers XOR-MAPPED-ADDRESS and falls back to the legacy MAPPED-ADDRESS.
/// Returns `None` if `tx_id` does not match or no IPv4 mapping is present.
pub fn parse_binding_response(buf: &[u8], tx_id: &[u8; 12]) -> Option<SocketAddr> {
    if buf.len() < 20 {
        return None;
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != BINDING_SUCCESS {
        return None;
    }
    if buf[4..8] != MAGIC_COOKIE || buf[8..20] != tx_id[..] {
        return None;
    }

    let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let end = (20 + declared).min(buf.len());

    let mut mapped = None;
    let mut offset = 20;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            break;
        }
        let value = &buf[value_start..value_end];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_ipv4(value, true) {
                    return Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => mapped = mapped.or_else(|| decode_ipv4(value, false)),
            _ => {}
        }

        // Attributes are padded to 4-byte boundaries
        offset = value_start + attr_len.div_ceil(4) * 4;
    }

    mapped
}

fn decode_ipv4(value: &[u8], xor: bool) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return None;
    }
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut octets = [value[4], value[5], value[6], value[7]];
    if xor {
        port ^= u16::from_be_bytes([MAGIC_COOKIE[0], MAGIC_COOKIE[1]]);
        for (o, m) in octets.iter_mut().zip(MAGIC_COOKIE.iter()) {
            *o ^= m;
        }
    }
    Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TX: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    fn response_with(attr_type: u16, value: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        msg.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE);
        msg.extend_from_slice(&TX);
        msg.extend_from_slice(&attr_type.to_be_bytes());
        msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
        msg.extend_from_slice(value);
        msg
    }

    #[test]
    fn test_build_binding_request() {
        let request = build_binding_request(&TX);

        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE);
        assert_eq!(&request[8..20], &TX);
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        // 203.0.113.5:40000 XOR'd with the magic cookie
        let port = 40000u16 ^ 0x2112;
        let ip = [203 ^ 0x21, 0 ^ 0x12, 113 ^ 0xA4, 5 ^ 0x42];
        let mut value = vec![0x00, FAMILY_IPV4];
        value.extend_from_slice(&port.to_be_bytes());
        value.extend_from_slice(&ip);

        let msg = response_with(ATTR_XOR_MAPPED_ADDRESS, &value);
        assert_eq!(
            parse_binding_response(&msg, &TX),
            Some("203.0.113.5:40000".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_legacy_mapped_address() {
        let mut value = vec![0x00, FAMILY_IPV4];
        value.extend_from_slice(&5000u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 7]);

        let msg = response_with(ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(
            parse_binding_response(&msg, &TX),
            Some("198.51.100.7:5000".parse().unwrap())
        );
    }

    #[test]
    fn test_rejects_wrong_transaction() {
        let mut value = vec![0x00, FAMILY_IPV4];
        value.extend_from_slice(&5000u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 7]);
        let msg = response_with(ATTR_MAPPED_ADDRESS, &value);

        assert_eq!(parse_binding_response(&msg, &[0u8; 12]), None);
        assert_eq!(parse_binding_response(&msg[..12], &TX), None);
    }
}
