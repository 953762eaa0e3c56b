//! ASF 1.0 Presence Ping/Pong.
//!
//! vCenter classifies an endpoint as a network-attached BMC by pinging it
//! before any IPMI session exists, so this path must work sessionlessly.

/// IANA Enterprise Number 4542 (ASF), big-endian on the wire.
pub const ASF_IANA: [u8; 4] = [0x00, 0x00, 0x11, 0xBE];

/// ASF message type: Presence Ping.
pub const PRESENCE_PING: u8 = 0x80;

/// ASF message type: Presence Pong.
pub const PRESENCE_PONG: u8 = 0x40;

/// Minimum ping length: RMCP header + IANA + type + tag + reserved + len.
pub const PING_LEN: usize = 12;

/// Supported-entities byte advertising IPMI support.
const ENTITY_IPMI: u8 = 0x81;

/// Whether a raw datagram is an ASF Presence Ping.
///
/// Checked before the minimum-IPMI-length cut so that short pings still
/// get answered.
pub fn is_presence_ping(datagram: &[u8]) -> bool {
    datagram.len() >= PING_LEN
        && datagram[0] == crate::rmcp::VERSION
        && datagram[3] & 0x0F == 0x06
        && datagram[4..8] == ASF_IANA
        && datagram[8] == PRESENCE_PING
}

/// Build the 28-byte Presence Pong for a ping, echoing its message tag.
pub fn presence_pong(ping: &[u8]) -> [u8; 28] {
    let tag = ping.get(9).copied().unwrap_or(0);
    let mut pong = [0u8; 28];
    pong[0] = crate::rmcp::VERSION;
    pong[2] = crate::rmcp::SEQ_NO_ACK;
    pong[3] = 0x06;
    pong[4..8].copy_from_slice(&ASF_IANA);
    pong[8] = PRESENCE_PONG;
    pong[9] = tag;
    pong[11] = 0x10; // data length
    pong[12..16].copy_from_slice(&ASF_IANA); // OEM IANA: ASF
    // bytes 16..20: OEM defined, zero
    pong[20] = ENTITY_IPMI;
    // byte 21: supported interactions, zero; 22..28 reserved
    pong
}
