//! RMCP+ session state: the RAKP exchange, key derivation, and the
//! integrity wrapping of in-session messages.
//!
//! A session walks `Opening → Auth1 → Auth3 → Active` and ends in
//! `Closed` or `Expired`. All key material is zeroed when the session
//! leaves `Active`.

use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::debug;

use vsbmc_protocol::rakp::{self, auth_alg, confidentiality_alg, integrity_alg, status};
use vsbmc_protocol::session::{integrity_pad_len, payload_type, V2Header};
use vsbmc_protocol::ProtocolError;

use crate::{Error, Result};

/// Privilege level granted when the console asks for "highest available".
pub const PRIV_ADMINISTRATOR: u8 = 0x04;

/// Sliding acceptance window for inbound sequence numbers.
const SEQ_WINDOW: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Opening,
    Auth1,
    Auth3,
    Active,
    Closed,
    Expired,
}

/// One RMCP+ session with a remote console.
pub struct Session {
    phase: Phase,
    /// Session ID the console assigned to itself (SIDm).
    remote_session_id: u32,
    /// Session ID we assigned (SIDc); the console addresses us with it.
    local_session_id: u32,
    auth_alg: u8,
    integrity_alg: u8,
    max_privilege: u8,
    privilege: u8,
    remote_random: [u8; 16],
    local_random: [u8; 16],
    role: u8,
    username: Vec<u8>,
    kuid: Vec<u8>,
    sik: Vec<u8>,
    k1: Vec<u8>,
    outbound_seq: u32,
    inbound_high: u32,
    last_activity: Instant,
}

impl Session {
    /// Validate an open-session request and either create the session or
    /// return the RMCP+ status code to reject it with.
    pub fn open(
        req: &rakp::OpenSessionRequest,
        local_session_id: u32,
    ) -> std::result::Result<Session, u8> {
        if !matches!(
            req.auth_alg,
            auth_alg::RAKP_NONE | auth_alg::RAKP_HMAC_SHA1 | auth_alg::RAKP_HMAC_SHA256
        ) {
            return Err(status::INVALID_AUTH_ALGORITHM);
        }
        if !matches!(
            req.integrity_alg,
            integrity_alg::NONE | integrity_alg::HMAC_SHA1_96 | integrity_alg::HMAC_SHA256_128
        ) {
            return Err(status::INVALID_INTEGRITY_ALGORITHM);
        }
        // No block cipher is offered; consoles renegotiate an unencrypted
        // suite on this status.
        if req.confidentiality_alg != confidentiality_alg::NONE {
            return Err(status::INVALID_CONFIDENTIALITY_ALGORITHM);
        }

        let max_privilege = if req.max_privilege == 0 {
            PRIV_ADMINISTRATOR
        } else {
            req.max_privilege
        };

        Ok(Session {
            phase: Phase::Opening,
            remote_session_id: req.remote_session_id,
            local_session_id,
            auth_alg: req.auth_alg,
            integrity_alg: req.integrity_alg,
            max_privilege,
            privilege: max_privilege,
            remote_random: [0; 16],
            local_random: [0; 16],
            role: 0,
            username: Vec::new(),
            kuid: Vec::new(),
            sik: Vec::new(),
            k1: Vec::new(),
            outbound_seq: 1,
            inbound_high: 0,
            last_activity: Instant::now(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn local_session_id(&self) -> u32 {
        self.local_session_id
    }

    pub fn max_privilege(&self) -> u8 {
        self.max_privilege
    }

    pub fn privilege(&self) -> u8 {
        self.privilege
    }

    pub fn set_privilege(&mut self, privilege: u8) {
        self.privilege = privilege;
    }

    /// Process RAKP message 1 and produce the RAKP 2 payload. `password`
    /// is `None` when the username does not match any configured user.
    pub fn handle_rakp1(
        &mut self,
        r1: &rakp::Rakp1,
        password: Option<&[u8]>,
        guid: &[u8; 16],
    ) -> Vec<u8> {
        if self.phase != Phase::Opening {
            debug!("RAKP1 in phase {:?}, closing session", self.phase);
            self.close(Phase::Closed);
            return rakp::rakp2(
                r1.message_tag,
                status::INACTIVE_SESSION_ID,
                self.remote_session_id,
                &[0; 16],
                guid,
                &[],
            );
        }

        let Some(password) = password else {
            self.close(Phase::Closed);
            return rakp::rakp2(
                r1.message_tag,
                status::UNAUTHORIZED_NAME,
                self.remote_session_id,
                &[0; 16],
                guid,
                &[],
            );
        };

        self.remote_random = r1.remote_random;
        self.role = r1.role;
        self.username = r1.username.clone();
        self.kuid = password.to_vec();
        let _ = getrandom::fill(&mut self.local_random);

        // RAKP2 auth code: HMAC(Kuid, SIDm | SIDc | Rm | Rc | GUIDc |
        // Role | ULen | UName).
        let mut data = Vec::with_capacity(58 + self.username.len());
        data.extend_from_slice(&self.remote_session_id.to_le_bytes());
        data.extend_from_slice(&self.local_session_id.to_le_bytes());
        data.extend_from_slice(&self.remote_random);
        data.extend_from_slice(&self.local_random);
        data.extend_from_slice(guid);
        data.push(self.role);
        data.push(self.username.len() as u8);
        data.extend_from_slice(&self.username);
        let auth_code = hmac_by_alg(self.auth_alg, &self.kuid, &data);

        self.phase = Phase::Auth1;
        self.touch();
        rakp::rakp2(
            r1.message_tag,
            status::NO_ERRORS,
            self.remote_session_id,
            &self.local_random,
            guid,
            &auth_code,
        )
    }

    /// Process RAKP message 3. Returns the RAKP 4 payload (empty when the
    /// console aborted and no reply is owed) and whether the session
    /// reached `Active`.
    pub fn handle_rakp3(
        &mut self,
        r3: &rakp::Rakp3,
        kg: Option<&[u8]>,
        guid: &[u8; 16],
    ) -> (Vec<u8>, bool) {
        if self.phase != Phase::Auth1 {
            self.close(Phase::Closed);
            return (Vec::new(), false);
        }
        if r3.status_code != status::NO_ERRORS {
            // The console rejected our RAKP2; tear the session down.
            debug!("console aborted RAKP with status {:#04x}", r3.status_code);
            self.close(Phase::Closed);
            return (Vec::new(), false);
        }

        // RAKP3 auth code: HMAC(Kuid, Rc | SIDm | Role | ULen | UName).
        let mut data = Vec::with_capacity(22 + self.username.len());
        data.extend_from_slice(&self.local_random);
        data.extend_from_slice(&self.remote_session_id.to_le_bytes());
        data.push(self.role);
        data.push(self.username.len() as u8);
        data.extend_from_slice(&self.username);
        let expected = hmac_by_alg(self.auth_alg, &self.kuid, &data);

        if expected != r3.key_exchange_auth_code {
            let reply = rakp::rakp4(
                r3.message_tag,
                status::INVALID_INTEGRITY_CHECK_VALUE,
                self.remote_session_id,
                &[],
            );
            self.close(Phase::Closed);
            return (reply, false);
        }
        self.phase = Phase::Auth3;

        // SIK: HMAC(KG or Kuid, Rm | Rc | Role | ULen | UName), then the
        // additional keying material K1 = HMAC(SIK, 20 x 0x01).
        let mut data = Vec::with_capacity(34 + self.username.len());
        data.extend_from_slice(&self.remote_random);
        data.extend_from_slice(&self.local_random);
        data.push(self.role);
        data.push(self.username.len() as u8);
        data.extend_from_slice(&self.username);
        self.sik = hmac_by_alg(self.auth_alg, kg.unwrap_or(&self.kuid), &data);
        self.k1 = hmac_by_alg(self.auth_alg, &self.sik, &[0x01; 20]);

        // RAKP4 integrity check: HMAC(SIK, Rm | SIDc | GUIDc), truncated
        // per the auth algorithm.
        let mut data = Vec::with_capacity(36);
        data.extend_from_slice(&self.remote_random);
        data.extend_from_slice(&self.local_session_id.to_le_bytes());
        data.extend_from_slice(guid);
        let mut icv = hmac_by_alg(self.auth_alg, &self.sik, &data);
        icv.truncate(rakp4_icv_len(self.auth_alg));

        let reply = rakp::rakp4(
            r3.message_tag,
            status::NO_ERRORS,
            self.remote_session_id,
            &icv,
        );
        self.phase = Phase::Active;
        self.touch();
        (reply, true)
    }

    /// Wrap an IPMB response payload into a complete outbound datagram,
    /// applying the negotiated integrity algorithm.
    pub fn wrap(&mut self, payload: &[u8]) -> Vec<u8> {
        let authenticated = self.integrity_alg != integrity_alg::NONE;
        let header = V2Header {
            payload_type: payload_type::IPMI,
            encrypted: false,
            authenticated,
            session_id: self.remote_session_id,
            sequence: self.outbound_seq,
            payload_len: payload.len() as u16,
        };
        self.outbound_seq = self.outbound_seq.wrapping_add(1);

        let mut out = header.encode();
        out.extend_from_slice(payload);
        if authenticated {
            let pad = integrity_pad_len(payload.len());
            out.extend(std::iter::repeat(0xFFu8).take(pad));
            out.push(pad as u8);
            out.push(0x07); // next header, per spec always 0x07
            let code = self.integrity_code(&out[4..]);
            out.extend_from_slice(&code);
        }
        out
    }

    /// Validate an inbound in-session packet and return its payload.
    /// `datagram` is the whole UDP datagram; `after_header` the bytes
    /// following the 12-byte session header.
    pub fn unwrap<'a>(
        &mut self,
        header: &V2Header,
        after_header: &'a [u8],
        datagram: &'a [u8],
    ) -> Result<&'a [u8]> {
        if self.phase != Phase::Active {
            return Err(Error::Session("session not active".into()));
        }
        if header.encrypted {
            return Err(ProtocolError::InvalidField("payload type", 0x80).into());
        }

        if self.integrity_alg != integrity_alg::NONE {
            if !header.authenticated {
                return Err(ProtocolError::InvalidField("payload type", 0x00).into());
            }
            let code_len = integrity_code_len(self.integrity_alg);
            if datagram.len() < code_len + 2 {
                return Err(ProtocolError::Truncated("integrity trailer").into());
            }
            let covered = &datagram[4..datagram.len() - code_len];
            let received = &datagram[datagram.len() - code_len..];
            let computed = self.integrity_code(covered);
            if computed != received {
                return Err(ProtocolError::BadChecksum.into());
            }
        }

        // Sliding-window sequence acceptance.
        if header.sequence.saturating_add(SEQ_WINDOW) <= self.inbound_high {
            return Err(Error::Session("stale sequence number".into()));
        }
        if header.sequence > self.inbound_high {
            self.inbound_high = header.sequence;
        }

        self.touch();
        after_header
            .get(..header.payload_len as usize)
            .ok_or_else(|| ProtocolError::Truncated("session payload").into())
    }

    fn integrity_code(&self, covered: &[u8]) -> Vec<u8> {
        let mut code = match self.integrity_alg {
            integrity_alg::HMAC_SHA1_96 => hmac_by_alg(auth_alg::RAKP_HMAC_SHA1, &self.k1, covered),
            integrity_alg::HMAC_SHA256_128 => {
                hmac_by_alg(auth_alg::RAKP_HMAC_SHA256, &self.k1, covered)
            }
            _ => Vec::new(),
        };
        code.truncate(integrity_code_len(self.integrity_alg));
        code
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() >= timeout
    }

    /// Zero all key material and mark the session `Closed` or `Expired`.
    pub fn close(&mut self, phase: Phase) {
        debug_assert!(matches!(phase, Phase::Closed | Phase::Expired));
        for key in [&mut self.kuid, &mut self.sik, &mut self.k1] {
            key.iter_mut().for_each(|b| *b = 0);
            key.clear();
        }
        self.local_random = [0; 16];
        self.remote_random = [0; 16];
        self.username.clear();
        self.phase = phase;
    }
}

// ---------------------------------------------------------------------------
// HMAC helpers
// ---------------------------------------------------------------------------

/// HMAC keyed by the RAKP authentication algorithm. RAKP-none produces an
/// empty code.
pub(crate) fn hmac_by_alg(alg: u8, key: &[u8], data: &[u8]) -> Vec<u8> {
    match alg {
        auth_alg::RAKP_HMAC_SHA1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        auth_alg::RAKP_HMAC_SHA256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        _ => Vec::new(),
    }
}

fn rakp4_icv_len(auth: u8) -> usize {
    match auth {
        auth_alg::RAKP_HMAC_SHA1 => 12,
        auth_alg::RAKP_HMAC_SHA256 => 16,
        _ => 0,
    }
}

fn integrity_code_len(integrity: u8) -> usize {
    match integrity {
        integrity_alg::HMAC_SHA1_96 => 12,
        integrity_alg::HMAC_SHA256_128 => 16,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_request(auth: u8, integ: u8, conf: u8) -> rakp::OpenSessionRequest {
        let mut payload = vec![0x10, 0x00, 0x00, 0x00];
        payload.extend_from_slice(&0xCAFE_F00Du32.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0, 0, 0x08, auth, 0, 0, 0]);
        payload.extend_from_slice(&[0x01, 0, 0, 0x08, integ, 0, 0, 0]);
        payload.extend_from_slice(&[0x02, 0, 0, 0x08, conf, 0, 0, 0]);
        rakp::OpenSessionRequest::parse(&payload).unwrap()
    }

    fn rakp1_for(session: &Session, username: &[u8]) -> rakp::Rakp1 {
        rakp::Rakp1 {
            message_tag: 0x42,
            local_session_id: session.local_session_id(),
            remote_random: [0x5A; 16],
            role: PRIV_ADMINISTRATOR,
            username: username.to_vec(),
        }
    }

    /// Drive the console side of RAKP3 with the same primitives.
    fn console_rakp3_code(session: &Session, password: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&session.local_random);
        data.extend_from_slice(&session.remote_session_id.to_le_bytes());
        data.push(session.role);
        data.push(session.username.len() as u8);
        data.extend_from_slice(&session.username);
        hmac_by_alg(session.auth_alg, password, &data)
    }

    #[test]
    fn open_rejects_aes_confidentiality() {
        let req = open_request(
            auth_alg::RAKP_HMAC_SHA1,
            integrity_alg::HMAC_SHA1_96,
            confidentiality_alg::AES_CBC_128,
        );
        assert_eq!(
            Session::open(&req, 1).err(),
            Some(status::INVALID_CONFIDENTIALITY_ALGORITHM)
        );
    }

    #[test]
    fn open_rejects_unknown_auth_algorithm() {
        let req = open_request(auth_alg::RAKP_HMAC_MD5, 0, 0);
        assert_eq!(
            Session::open(&req, 1).err(),
            Some(status::INVALID_AUTH_ALGORITHM)
        );
    }

    #[test]
    fn full_rakp_exchange_reaches_active() {
        let req = open_request(
            auth_alg::RAKP_HMAC_SHA1,
            integrity_alg::HMAC_SHA1_96,
            confidentiality_alg::NONE,
        );
        let mut session = Session::open(&req, 0x1000_0001).unwrap();
        assert_eq!(session.phase(), Phase::Opening);

        let guid = [7u8; 16];
        let r1 = rakp1_for(&session, b"admin");
        let r2 = session.handle_rakp1(&r1, Some(b"password"), &guid);
        assert_eq!(session.phase(), Phase::Auth1);
        assert_eq!(r2[1], status::NO_ERRORS);
        // tag, status, reserved, SIDm, Rc, GUIDc, HMAC-SHA1
        assert_eq!(r2.len(), 8 + 16 + 16 + 20);

        let r3 = rakp::Rakp3 {
            message_tag: 0x43,
            status_code: status::NO_ERRORS,
            local_session_id: session.local_session_id(),
            key_exchange_auth_code: console_rakp3_code(&session, b"password"),
        };
        let (r4, active) = session.handle_rakp3(&r3, None, &guid);
        assert!(active);
        assert_eq!(session.phase(), Phase::Active);
        assert_eq!(r4[1], status::NO_ERRORS);
        assert_eq!(r4.len(), 8 + 12); // SHA1 ICV is truncated to 96 bits
    }

    #[test]
    fn rakp3_with_wrong_password_is_rejected() {
        let req = open_request(
            auth_alg::RAKP_HMAC_SHA256,
            integrity_alg::HMAC_SHA256_128,
            confidentiality_alg::NONE,
        );
        let mut session = Session::open(&req, 2).unwrap();
        let guid = [1u8; 16];
        let r1 = rakp1_for(&session, b"admin");
        session.handle_rakp1(&r1, Some(b"password"), &guid);

        let r3 = rakp::Rakp3 {
            message_tag: 0x43,
            status_code: status::NO_ERRORS,
            local_session_id: session.local_session_id(),
            key_exchange_auth_code: console_rakp3_code(&session, b"wrong"),
        };
        let (r4, active) = session.handle_rakp3(&r3, None, &guid);
        assert!(!active);
        assert_eq!(r4[1], status::INVALID_INTEGRITY_CHECK_VALUE);
        assert_eq!(session.phase(), Phase::Closed);
    }

    #[test]
    fn unknown_user_gets_unauthorized_name() {
        let req = open_request(
            auth_alg::RAKP_HMAC_SHA1,
            integrity_alg::HMAC_SHA1_96,
            confidentiality_alg::NONE,
        );
        let mut session = Session::open(&req, 3).unwrap();
        let r1 = rakp1_for(&session, b"intruder");
        let r2 = session.handle_rakp1(&r1, None, &[0; 16]);
        assert_eq!(r2[1], status::UNAUTHORIZED_NAME);
        assert_eq!(session.phase(), Phase::Closed);
    }

    #[test]
    fn wrap_unwrap_round_trip_with_integrity() {
        let mut session = active_session(auth_alg::RAKP_HMAC_SHA1, integrity_alg::HMAC_SHA1_96);

        // Both directions share K1, so the session can verify a packet it
        // wrapped itself.
        let payload = [0x20, 0x18, 0xC8, 0x81, 0x04, 0x01, 0x76];
        let datagram = session.wrap(&payload);
        let (header, after) = V2Header::parse(&datagram[4..]).unwrap();
        let got = session
            .unwrap(&header, after, &datagram)
            .expect("integrity verifies");
        assert_eq!(got, payload);
    }

    #[test]
    fn unwrap_rejects_tampered_packet() {
        let mut session = active_session(auth_alg::RAKP_HMAC_SHA1, integrity_alg::HMAC_SHA1_96);
        let mut datagram = session.wrap(&[0x01, 0x02, 0x03]);
        let len = datagram.len();
        datagram[len - 1] ^= 0xFF;
        let (header, after) = V2Header::parse(&datagram[4..]).unwrap();
        // Clone the slices to sidestep the borrow of datagram.
        let after = after.to_vec();
        assert!(session.unwrap(&header, &after, &datagram).is_err());
    }

    #[test]
    fn close_zeroes_key_material() {
        let mut session = active_session(auth_alg::RAKP_HMAC_SHA256, integrity_alg::HMAC_SHA256_128);
        assert!(!session.sik.is_empty());
        session.close(Phase::Expired);
        assert_eq!(session.phase(), Phase::Expired);
        assert!(session.sik.is_empty());
        assert!(session.k1.is_empty());
        assert!(session.kuid.is_empty());
    }

    fn active_session(auth: u8, integ: u8) -> Session {
        let req = open_request(auth, integ, confidentiality_alg::NONE);
        let mut session = Session::open(&req, 0xABCD_0001).unwrap();
        let guid = [9u8; 16];
        let r1 = rakp1_for(&session, b"admin");
        session.handle_rakp1(&r1, Some(b"password"), &guid);
        let r3 = rakp::Rakp3 {
            message_tag: 0x43,
            status_code: status::NO_ERRORS,
            local_session_id: session.local_session_id(),
            key_exchange_auth_code: console_rakp3_code(&session, b"password"),
        };
        let (_, active) = session.handle_rakp3(&r3, None, &guid);
        assert!(active);
        session
    }
}
