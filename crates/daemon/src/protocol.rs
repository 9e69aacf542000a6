//! Datagrams exchanged over a punched socket.
//!
//! Every datagram is one type byte followed by a CBOR payload:
//! - `HELLO` is the keepalive. It announces the sender and carries a nonce.
//! - `ACK` echoes a HELLO's nonce back, proving the reverse path works.
//!
//! Anything else is treated as opaque application data.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Keepalive / punch probe
pub const MSG_HELLO: u8 = 0x1A;
/// Reply to a HELLO, echoing its nonce
pub const MSG_ACK: u8 = 0x1C;

/// Sent every keepalive interval while a session is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub sender_id: String,
    /// Address the sender registered under ("ip:port")
    pub sender_addr: String,
    /// Fixed for the lifetime of one session
    pub nonce: [u8; 12],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub nonce: [u8; 12],
    /// Where the HELLO appeared to come from
    pub observed_addr: String,
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PunchMessage {
    Hello(Hello),
    Ack(Ack),
    /// Not one of ours, e.g. a plain-text greeting
    Raw(Vec<u8>),
}

impl PunchMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (msg_type, payload) = match self {
            PunchMessage::Hello(hello) => (
                MSG_HELLO,
                serde_cbor::to_vec(hello).context("Failed to encode Hello")?,
            ),
            PunchMessage::Ack(ack) => (
                MSG_ACK,
                serde_cbor::to_vec(ack).context("Failed to encode Ack")?,
            ),
            PunchMessage::Raw(bytes) => return Ok(bytes.clone()),
        };

        let mut data = Vec::with_capacity(1 + payload.len());
        data.push(msg_type);
        data.extend(payload);
        Ok(data)
    }

    /// Never fails: undecodable input comes back as `Raw`.
    pub fn decode(buf: &[u8]) -> Self {
        let decoded = match buf.first() {
            Some(&MSG_HELLO) => serde_cbor::from_slice(&buf[1..]).ok().map(PunchMessage::Hello),
            Some(&MSG_ACK) => serde_cbor::from_slice(&buf[1..]).ok().map(PunchMessage::Ack),
            _ => None,
        };
        decoded.unwrap_or_else(|| PunchMessage::Raw(buf.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_wire_format() {
        let hello = Hello {
            sender_id: "alice".into(),
            sender_addr: "203.0.113.5:40000".into(),
            nonce: [7u8; 12],
        };
        let data = PunchMessage::Hello(hello.clone()).encode().unwrap();

        assert_eq!(data[0], MSG_HELLO);
        assert_eq!(PunchMessage::decode(&data), PunchMessage::Hello(hello));
    }

    #[test]
    fn test_plain_text_is_raw() {
        let data = b"Hello from 0.0.0.0:40000";
        assert_eq!(
            PunchMessage::decode(data),
            PunchMessage::Raw(data.to_vec())
        );
    }

    #[test]
    fn test_truncated_ack_is_raw() {
        let ack = PunchMessage::Ack(Ack {
            nonce: [1u8; 12],
            observed_addr: "127.0.0.1:1".into(),
        });
        let data = ack.encode().unwrap();
        let truncated = &data[..data.len() / 2];

        assert_eq!(
            PunchMessage::decode(truncated),
            PunchMessage::Raw(truncated.to_vec())
        );
        assert_eq!(PunchMessage::decode(&[]), PunchMessage::Raw(Vec::new()));
    }
}
