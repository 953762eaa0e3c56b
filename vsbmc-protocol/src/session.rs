//! IPMI session headers: v1.5 legacy and v2.0/RMCP+.
//!
//! A v1.5 header is 10 bytes plus a 1-byte payload length (16 more when an
//! auth code is present). A v2.0 header is recognized by auth-type 0x06 and
//! carries a payload type, 4-byte session ID, 4-byte sequence number, and a
//! 2-byte payload length; multibyte fields are little-endian.

use crate::rmcp;
use crate::ProtocolError;

/// Auth-type byte for a legacy session header without an auth code.
pub const AUTH_TYPE_NONE: u8 = 0x00;

/// Auth-type byte marking an RMCP+ (IPMI v2.0) header.
pub const AUTH_TYPE_RMCP_PLUS: u8 = 0x06;

/// RMCP+ payload types.
pub mod payload_type {
    pub const IPMI: u8 = 0x00;
    pub const SOL: u8 = 0x01;
    pub const OPEN_SESSION_REQUEST: u8 = 0x10;
    pub const OPEN_SESSION_RESPONSE: u8 = 0x11;
    pub const RAKP1: u8 = 0x12;
    pub const RAKP2: u8 = 0x13;
    pub const RAKP3: u8 = 0x14;
    pub const RAKP4: u8 = 0x15;

    /// Payload-type flag: payload is encrypted.
    pub const ENCRYPTED: u8 = 0x80;
    /// Payload-type flag: packet carries an integrity trailer.
    pub const AUTHENTICATED: u8 = 0x40;
    /// Mask selecting the payload type proper.
    pub const TYPE_MASK: u8 = 0x3F;
}

/// Parsed RMCP+ session header.
#[derive(Debug, Clone, Copy)]
pub struct V2Header {
    pub payload_type: u8,
    pub encrypted: bool,
    pub authenticated: bool,
    pub session_id: u32,
    pub sequence: u32,
    pub payload_len: u16,
}

/// Byte length of the v2.0 session header, counted from the auth-type byte.
pub const V2_HEADER_LEN: usize = 12;

impl V2Header {
    /// Parse a v2.0 session header from the bytes following the RMCP
    /// header. Returns the header and the payload slice (which still
    /// includes any integrity trailer; the session layer strips that,
    /// since trailer length depends on the negotiated algorithm).
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if data.len() < V2_HEADER_LEN {
            return Err(ProtocolError::Truncated("RMCP+ session header"));
        }
        if data[0] != AUTH_TYPE_RMCP_PLUS {
            return Err(ProtocolError::InvalidField("auth type", data[0]));
        }
        let payload_len = u16::from_le_bytes([data[10], data[11]]);
        let header = V2Header {
            payload_type: data[1] & payload_type::TYPE_MASK,
            encrypted: data[1] & payload_type::ENCRYPTED != 0,
            authenticated: data[1] & payload_type::AUTHENTICATED != 0,
            session_id: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
            sequence: u32::from_le_bytes([data[6], data[7], data[8], data[9]]),
            payload_len,
        };
        let rest = &data[V2_HEADER_LEN..];
        if rest.len() < payload_len as usize {
            return Err(ProtocolError::Truncated("RMCP+ payload"));
        }
        Ok((header, rest))
    }

    /// Encode the RMCP header plus this session header. The caller appends
    /// the payload and, for authenticated packets, the integrity trailer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(rmcp::HEADER_LEN + V2_HEADER_LEN);
        out.extend_from_slice(
            &rmcp::Header {
                sequence: rmcp::SEQ_NO_ACK,
                class: rmcp::Class::Ipmi,
            }
            .encode(),
        );
        let mut ptype = self.payload_type;
        if self.encrypted {
            ptype |= payload_type::ENCRYPTED;
        }
        if self.authenticated {
            ptype |= payload_type::AUTHENTICATED;
        }
        out.push(AUTH_TYPE_RMCP_PLUS);
        out.push(ptype);
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
        out
    }
}

/// Encode a complete sessionless v2.0 datagram (session ID and sequence
/// zero, no integrity trailer). Used for the pre-session negotiation
/// replies and the open-session/RAKP exchange.
pub fn encode_v2_sessionless(payload_type: u8, payload: &[u8]) -> Vec<u8> {
    let header = V2Header {
        payload_type,
        encrypted: false,
        authenticated: false,
        session_id: 0,
        sequence: 0,
        payload_len: payload.len() as u16,
    };
    let mut out = header.encode();
    out.extend_from_slice(payload);
    out
}

/// Parse a v1.5 session header, accepting only auth-type 0 (the listener
/// never negotiates v1.5 sessions, so an auth code is never valid here).
/// Returns `(session_id, payload)`.
pub fn parse_v15(data: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if data.len() < 10 {
        return Err(ProtocolError::Truncated("v1.5 session header"));
    }
    if data[0] != AUTH_TYPE_NONE {
        return Err(ProtocolError::InvalidField("v1.5 auth type", data[0]));
    }
    let session_id = u32::from_le_bytes([data[5], data[6], data[7], data[8]]);
    let payload_len = data[9] as usize;
    let rest = &data[10..];
    if rest.len() < payload_len {
        return Err(ProtocolError::Truncated("v1.5 payload"));
    }
    Ok((session_id, &rest[..payload_len]))
}

/// Encode a complete sessionless v1.5 datagram.
pub fn encode_v15_sessionless(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rmcp::HEADER_LEN + 10 + payload.len());
    out.extend_from_slice(
        &rmcp::Header {
            sequence: rmcp::SEQ_NO_ACK,
            class: rmcp::Class::Ipmi,
        }
        .encode(),
    );
    out.push(AUTH_TYPE_NONE);
    out.extend_from_slice(&[0u8; 8]); // sequence + session id
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out
}

/// Integrity pad length for an authenticated payload: pads so that
/// payload + pad + pad-length byte + next-header byte is a multiple of 4.
pub fn integrity_pad_len(payload_len: usize) -> usize {
    (4 - ((payload_len + 2) % 4)) % 4
}
