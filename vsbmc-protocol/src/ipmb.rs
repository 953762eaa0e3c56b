//! IPMB-shaped command messages carried inside IPMI session payloads.
//!
//! Layout of a request:
//!
//! ```text
//! ┌────────┬─────────────┬─────┬────────┬─────────────┬─────┬──────┬─────┐
//! │ rsAddr │ netfn|rsLun │ ck1 │ rqAddr │ rqSeq|rqLun │ cmd │ data │ ck2 │
//! └────────┴─────────────┴─────┴────────┴─────────────┴─────┴──────┴─────┘
//! ```
//!
//! `ck1` covers the first two bytes, `ck2` covers `rqAddr` through the end
//! of `data`. Responses swap the addresses and use `netfn | 1`.

use crate::ProtocolError;

/// Two's-complement 8-bit checksum: the byte that zeroes the sum.
pub fn checksum8(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)))
}

/// A parsed IPMB request.
#[derive(Debug, Clone)]
pub struct Request {
    pub rs_addr: u8,
    pub netfn: u8,
    pub rs_lun: u8,
    pub rq_addr: u8,
    pub rq_seq: u8,
    pub rq_lun: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
}

impl Request {
    /// Parse an IPMB request from a session payload, verifying both
    /// checksums.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 7 {
            return Err(ProtocolError::Truncated("IPMB message"));
        }
        if checksum8(&payload[..2]) != payload[2] {
            return Err(ProtocolError::BadChecksum);
        }
        let body = &payload[3..payload.len() - 1];
        if checksum8(body) != payload[payload.len() - 1] {
            return Err(ProtocolError::BadChecksum);
        }
        Ok(Request {
            rs_addr: payload[0],
            netfn: payload[1] >> 2,
            rs_lun: payload[1] & 0b11,
            rq_addr: payload[3],
            rq_seq: payload[4] >> 2,
            rq_lun: payload[4] & 0b11,
            cmd: payload[5],
            data: payload[6..payload.len() - 1].to_vec(),
        })
    }

    /// Encode the matching response message with the given completion code
    /// and data bytes.
    pub fn response(&self, completion: u8, data: &[u8]) -> Vec<u8> {
        encode_response(
            self.rq_addr,
            self.rq_lun,
            self.rs_addr,
            self.rs_lun,
            self.rq_seq,
            self.netfn | 1,
            self.cmd,
            completion,
            data,
        )
    }
}

/// Encode a response message from its raw fields.
///
/// Split out of [`Request::response`] because the sessionless
/// auth-capabilities path builds responses without a parsed request.
#[allow(clippy::too_many_arguments)]
pub fn encode_response(
    rq_addr: u8,
    rq_lun: u8,
    rs_addr: u8,
    rs_lun: u8,
    rq_seq: u8,
    netfn: u8,
    cmd: u8,
    completion: u8,
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.push(rq_addr);
    out.push((netfn << 2) | rq_lun);
    out.push(checksum8(&out));
    let body_start = out.len();
    out.push(rs_addr);
    out.push((rq_seq << 2) | rs_lun);
    out.push(cmd);
    out.push(completion);
    out.extend_from_slice(data);
    let body_cksum = checksum8(&out[body_start..]);
    out.push(body_cksum);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_request(netfn: u8, cmd: u8, data: &[u8]) -> Vec<u8> {
        let mut msg = vec![0x20, netfn << 2];
        msg.push(checksum8(&msg));
        let body_start = msg.len();
        msg.push(0x81);
        msg.push(0x04 << 2);
        msg.push(cmd);
        msg.extend_from_slice(data);
        let cksum = checksum8(&msg[body_start..]);
        msg.push(cksum);
        msg
    }

    #[test]
    fn parse_request_fields() {
        let raw = raw_request(0x06, 0x38, &[0x8E, 0x04]);
        let req = Request::parse(&raw).unwrap();
        assert_eq!(req.rs_addr, 0x20);
        assert_eq!(req.netfn, 0x06);
        assert_eq!(req.rq_addr, 0x81);
        assert_eq!(req.rq_seq, 0x04);
        assert_eq!(req.cmd, 0x38);
        assert_eq!(req.data, vec![0x8E, 0x04]);
    }

    #[test]
    fn parse_rejects_bad_header_checksum() {
        let mut raw = raw_request(0x06, 0x01, &[]);
        raw[2] ^= 0xFF;
        assert!(matches!(
            Request::parse(&raw),
            Err(ProtocolError::BadChecksum)
        ));
    }

    #[test]
    fn parse_rejects_bad_body_checksum() {
        let mut raw = raw_request(0x06, 0x01, &[]);
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(matches!(
            Request::parse(&raw),
            Err(ProtocolError::BadChecksum)
        ));
    }

    #[test]
    fn response_checksums_verify() {
        let raw = raw_request(0x00, 0x01, &[]);
        let req = Request::parse(&raw).unwrap();
        let resp = req.response(0x00, &[0x01, 0x00, 0x00]);

        // Response addressed back to the requester with netfn | 1.
        assert_eq!(resp[0], 0x81);
        assert_eq!(resp[1] >> 2, 0x01);
        assert_eq!(resp[5], 0x01);
        assert_eq!(resp[6], 0x00);
        assert_eq!(checksum8(&resp[..2]), resp[2]);
        assert_eq!(checksum8(&resp[3..resp.len() - 1]), resp[resp.len() - 1]);
    }
}
