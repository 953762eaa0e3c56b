//! RMCP+ open-session and RAKP message payloads (IPMI 2.0 §13).
//!
//! These are the payload bodies only; the session header around them is
//! handled by [`crate::session`]. Key derivation and HMAC verification
//! live with the session state in the main crate.

use crate::ProtocolError;

/// Authentication algorithm numbers from the open-session request.
pub mod auth_alg {
    pub const RAKP_NONE: u8 = 0x00;
    pub const RAKP_HMAC_SHA1: u8 = 0x01;
    pub const RAKP_HMAC_MD5: u8 = 0x02;
    pub const RAKP_HMAC_SHA256: u8 = 0x03;
}

/// Integrity algorithm numbers.
pub mod integrity_alg {
    pub const NONE: u8 = 0x00;
    pub const HMAC_SHA1_96: u8 = 0x01;
    pub const HMAC_MD5_128: u8 = 0x02;
    pub const MD5_128: u8 = 0x03;
    pub const HMAC_SHA256_128: u8 = 0x04;
}

/// Confidentiality algorithm numbers.
pub mod confidentiality_alg {
    pub const NONE: u8 = 0x00;
    pub const AES_CBC_128: u8 = 0x01;
}

/// RMCP+ status codes (open-session response and RAKP 2/4).
pub mod status {
    pub const NO_ERRORS: u8 = 0x00;
    pub const INSUFFICIENT_RESOURCES: u8 = 0x01;
    pub const INVALID_SESSION_ID: u8 = 0x02;
    pub const INVALID_PAYLOAD_TYPE: u8 = 0x03;
    pub const INVALID_AUTH_ALGORITHM: u8 = 0x04;
    pub const INVALID_INTEGRITY_ALGORITHM: u8 = 0x05;
    pub const INACTIVE_SESSION_ID: u8 = 0x08;
    pub const INVALID_ROLE: u8 = 0x09;
    pub const UNAUTHORIZED_NAME: u8 = 0x0D;
    pub const INVALID_INTEGRITY_CHECK_VALUE: u8 = 0x0F;
    pub const INVALID_CONFIDENTIALITY_ALGORITHM: u8 = 0x10;
    pub const NO_CIPHER_SUITE_MATCH: u8 = 0x11;
    pub const ILLEGAL_PARAMETER: u8 = 0x12;
}

/// Algorithm payload tags inside the open-session request/response.
const PAYLOAD_TAG_AUTH: u8 = 0x00;
const PAYLOAD_TAG_INTEGRITY: u8 = 0x01;
const PAYLOAD_TAG_CONFIDENTIALITY: u8 = 0x02;

// ---------------------------------------------------------------------------
// Open Session
// ---------------------------------------------------------------------------

/// Parsed RMCP+ Open Session Request.
#[derive(Debug, Clone, Copy)]
pub struct OpenSessionRequest {
    pub message_tag: u8,
    pub max_privilege: u8,
    pub remote_session_id: u32,
    pub auth_alg: u8,
    pub integrity_alg: u8,
    pub confidentiality_alg: u8,
}

impl OpenSessionRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 32 {
            return Err(ProtocolError::Truncated("open session request"));
        }
        let mut req = OpenSessionRequest {
            message_tag: payload[0],
            max_privilege: payload[1] & 0x0F,
            remote_session_id: u32::from_le_bytes([
                payload[4], payload[5], payload[6], payload[7],
            ]),
            auth_alg: auth_alg::RAKP_NONE,
            integrity_alg: integrity_alg::NONE,
            confidentiality_alg: confidentiality_alg::NONE,
        };
        // Three 8-byte algorithm payloads, in any order.
        for chunk in payload[8..32].chunks_exact(8) {
            let alg = chunk[4] & 0x3F;
            match chunk[0] {
                PAYLOAD_TAG_AUTH => req.auth_alg = alg,
                PAYLOAD_TAG_INTEGRITY => req.integrity_alg = alg,
                PAYLOAD_TAG_CONFIDENTIALITY => req.confidentiality_alg = alg,
                other => return Err(ProtocolError::InvalidField("algorithm payload tag", other)),
            }
        }
        Ok(req)
    }
}

/// Build an Open Session Response payload.
///
/// On a non-zero status only the leading 8 bytes are meaningful; the
/// algorithm payloads are omitted.
pub fn open_session_response(
    req: &OpenSessionRequest,
    status_code: u8,
    max_privilege: u8,
    local_session_id: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(36);
    out.push(req.message_tag);
    out.push(status_code);
    out.push(max_privilege);
    out.push(0);
    out.extend_from_slice(&req.remote_session_id.to_le_bytes());
    if status_code != status::NO_ERRORS {
        return out;
    }
    out.extend_from_slice(&local_session_id.to_le_bytes());
    for (tag, alg) in [
        (PAYLOAD_TAG_AUTH, req.auth_alg),
        (PAYLOAD_TAG_INTEGRITY, req.integrity_alg),
        (PAYLOAD_TAG_CONFIDENTIALITY, req.confidentiality_alg),
    ] {
        out.extend_from_slice(&[tag, 0, 0, 0x08, alg, 0, 0, 0]);
    }
    out
}

// ---------------------------------------------------------------------------
// RAKP messages
// ---------------------------------------------------------------------------

/// Parsed RAKP Message 1.
#[derive(Debug, Clone)]
pub struct Rakp1 {
    pub message_tag: u8,
    pub local_session_id: u32,
    pub remote_random: [u8; 16],
    pub role: u8,
    pub username: Vec<u8>,
}

impl Rakp1 {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 28 {
            return Err(ProtocolError::Truncated("RAKP message 1"));
        }
        let username_len = payload[27] as usize;
        if username_len > 16 || payload.len() < 28 + username_len {
            return Err(ProtocolError::Truncated("RAKP message 1 username"));
        }
        let mut remote_random = [0u8; 16];
        remote_random.copy_from_slice(&payload[8..24]);
        Ok(Rakp1 {
            message_tag: payload[0],
            local_session_id: u32::from_le_bytes([
                payload[4], payload[5], payload[6], payload[7],
            ]),
            remote_random,
            role: payload[24],
            username: payload[28..28 + username_len].to_vec(),
        })
    }
}

/// Build a RAKP Message 2 payload. `auth_code` is empty for RAKP-none.
pub fn rakp2(
    message_tag: u8,
    status_code: u8,
    remote_session_id: u32,
    local_random: &[u8; 16],
    guid: &[u8; 16],
    auth_code: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(40 + auth_code.len());
    out.push(message_tag);
    out.push(status_code);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&remote_session_id.to_le_bytes());
    if status_code != status::NO_ERRORS {
        return out;
    }
    out.extend_from_slice(local_random);
    out.extend_from_slice(guid);
    out.extend_from_slice(auth_code);
    out
}

/// Parsed RAKP Message 3.
#[derive(Debug, Clone)]
pub struct Rakp3 {
    pub message_tag: u8,
    pub status_code: u8,
    pub local_session_id: u32,
    pub key_exchange_auth_code: Vec<u8>,
}

impl Rakp3 {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 8 {
            return Err(ProtocolError::Truncated("RAKP message 3"));
        }
        Ok(Rakp3 {
            message_tag: payload[0],
            status_code: payload[1],
            local_session_id: u32::from_le_bytes([
                payload[4], payload[5], payload[6], payload[7],
            ]),
            key_exchange_auth_code: payload[8..].to_vec(),
        })
    }
}

/// Build a RAKP Message 4 payload. `integrity_check` is empty for
/// RAKP-none.
pub fn rakp4(
    message_tag: u8,
    status_code: u8,
    remote_session_id: u32,
    integrity_check: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + integrity_check.len());
    out.push(message_tag);
    out.push(status_code);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&remote_session_id.to_le_bytes());
    if status_code == status::NO_ERRORS {
        out.extend_from_slice(integrity_check);
    }
    out
}

// ---------------------------------------------------------------------------
// Cipher suite records (Get Channel Cipher Suites)
// ---------------------------------------------------------------------------

/// Cipher suite records advertised by the listener: suites 0 (no auth),
/// 2 (HMAC-SHA1 + SHA1-96 integrity), and 17 (HMAC-SHA256 + SHA256-128
/// integrity), all with confidentiality "none". Record layout: 0xC0
/// start-of-record, suite ID, auth algorithm, integrity algorithm
/// (tag bit 6), confidentiality algorithm (tag bit 7).
pub const CIPHER_SUITE_RECORDS: [u8; 15] = [
    0xC0, 0x00, 0x00, 0x40, 0x80, //
    0xC0, 0x02, 0x01, 0x41, 0x80, //
    0xC0, 0x11, 0x03, 0x44, 0x80,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn open_session_payload(auth: u8, integ: u8, conf: u8) -> Vec<u8> {
        let mut p = vec![0x21, 0x00, 0x00, 0x00, 0xEF, 0xBE, 0xAD, 0xDE];
        p.extend_from_slice(&[0x00, 0, 0, 0x08, auth, 0, 0, 0]);
        p.extend_from_slice(&[0x01, 0, 0, 0x08, integ, 0, 0, 0]);
        p.extend_from_slice(&[0x02, 0, 0, 0x08, conf, 0, 0, 0]);
        p
    }

    #[test]
    fn open_session_request_parse() {
        let payload = open_session_payload(
            auth_alg::RAKP_HMAC_SHA1,
            integrity_alg::HMAC_SHA1_96,
            confidentiality_alg::NONE,
        );
        let req = OpenSessionRequest::parse(&payload).unwrap();
        assert_eq!(req.message_tag, 0x21);
        assert_eq!(req.remote_session_id, 0xDEAD_BEEF);
        assert_eq!(req.auth_alg, auth_alg::RAKP_HMAC_SHA1);
        assert_eq!(req.integrity_alg, integrity_alg::HMAC_SHA1_96);
        assert_eq!(req.confidentiality_alg, confidentiality_alg::NONE);
    }

    #[test]
    fn open_session_response_success_layout() {
        let payload = open_session_payload(
            auth_alg::RAKP_HMAC_SHA256,
            integrity_alg::HMAC_SHA256_128,
            confidentiality_alg::NONE,
        );
        let req = OpenSessionRequest::parse(&payload).unwrap();
        let resp = open_session_response(&req, status::NO_ERRORS, 0x04, 0x0000_1234);
        assert_eq!(resp.len(), 36);
        assert_eq!(resp[0], 0x21);
        assert_eq!(resp[1], status::NO_ERRORS);
        assert_eq!(&resp[4..8], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&resp[8..12], &0x0000_1234u32.to_le_bytes());
        assert_eq!(resp[12], 0x00); // auth payload tag
        assert_eq!(resp[16], auth_alg::RAKP_HMAC_SHA256);
    }

    #[test]
    fn open_session_response_error_is_short() {
        let payload = open_session_payload(
            auth_alg::RAKP_NONE,
            integrity_alg::NONE,
            confidentiality_alg::AES_CBC_128,
        );
        let req = OpenSessionRequest::parse(&payload).unwrap();
        let resp = open_session_response(
            &req,
            status::INVALID_CONFIDENTIALITY_ALGORITHM,
            0x04,
            0,
        );
        assert_eq!(resp.len(), 8);
        assert_eq!(resp[1], status::INVALID_CONFIDENTIALITY_ALGORITHM);
    }

    #[test]
    fn rakp1_parse() {
        let mut payload = vec![0x22, 0, 0, 0];
        payload.extend_from_slice(&0x0000_1234u32.to_le_bytes());
        payload.extend_from_slice(&[0xAB; 16]);
        payload.push(0x04); // administrator
        payload.extend_from_slice(&[0, 0]);
        payload.push(5);
        payload.extend_from_slice(b"admin");

        let r1 = Rakp1::parse(&payload).unwrap();
        assert_eq!(r1.message_tag, 0x22);
        assert_eq!(r1.local_session_id, 0x1234);
        assert_eq!(r1.remote_random, [0xAB; 16]);
        assert_eq!(r1.role, 0x04);
        assert_eq!(r1.username, b"admin");
    }

    #[test]
    fn rakp1_rejects_oversized_username() {
        let mut payload = vec![0x22, 0, 0, 0];
        payload.extend_from_slice(&[0; 4]);
        payload.extend_from_slice(&[0; 16]);
        payload.extend_from_slice(&[0x04, 0, 0]);
        payload.push(17);
        payload.extend_from_slice(&[b'a'; 17]);
        assert!(Rakp1::parse(&payload).is_err());
    }

    #[test]
    fn rakp2_and_rakp4_layouts() {
        let r2 = rakp2(0x22, status::NO_ERRORS, 0xDEAD_BEEF, &[1; 16], &[2; 16], &[3; 20]);
        assert_eq!(r2.len(), 60);
        assert_eq!(&r2[4..8], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&r2[8..24], &[1; 16]);
        assert_eq!(&r2[24..40], &[2; 16]);

        let r4 = rakp4(0x23, status::NO_ERRORS, 0xDEAD_BEEF, &[9; 12]);
        assert_eq!(r4.len(), 20);

        let r4_err = rakp4(0x23, status::INVALID_INTEGRITY_CHECK_VALUE, 0xDEAD_BEEF, &[9; 12]);
        assert_eq!(r4_err.len(), 8);
    }
}
