//! Wire-format types for IPMI-over-LAN as spoken by the vsbmc listener.
//!
//! This crate is the single source of truth for every byte layout the
//! listener parses or emits: RMCP framing, the ASF Presence Ping/Pong
//! discovery exchange, IPMB-shaped command messages, IPMI v1.5 and
//! v2.0/RMCP+ session headers, and the RMCP+ open-session/RAKP payloads.
//! It is pure parse/encode: no sockets, no crypto, no policy. Key
//! material and dispatch live in the `vsbmc` crate.
//!
//! ## Datagram layout
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ RMCP (4 B)   │ class 0x06: ASF message                      │
//! │              │ class 0x07: IPMI session header + payload    │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```

use std::fmt;

pub mod asf;
pub mod ipmb;
pub mod rakp;
pub mod rmcp;
pub mod session;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors raised while parsing inbound datagrams.
#[derive(Debug)]
pub enum ProtocolError {
    /// Datagram or payload shorter than its header demands.
    Truncated(&'static str),
    /// A field holds a value the protocol does not allow here.
    InvalidField(&'static str, u8),
    /// An IPMB checksum did not verify.
    BadChecksum,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Truncated(what) => write!(f, "truncated {}", what),
            ProtocolError::InvalidField(what, value) => {
                write!(f, "invalid {}: {:#04x}", what, value)
            }
            ProtocolError::BadChecksum => write!(f, "IPMB checksum mismatch"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ---------------------------------------------------------------------------
// Shared constants
// ---------------------------------------------------------------------------

/// IPMI completion codes used by the listener.
pub mod completion {
    /// Command completed normally.
    pub const OK: u8 = 0x00;
    /// Parameter not supported (LAN configuration parameter revision reply).
    pub const PARAMETER_NOT_SUPPORTED: u8 = 0x80;
    /// Node busy; the command failed but the client may retry.
    pub const NODE_BUSY: u8 = 0xC0;
    /// Invalid or unsupported command.
    pub const COMMAND_NOT_SUPPORTED: u8 = 0xC1;
    /// Invalid data field in request.
    pub const INVALID_DATA_FIELD: u8 = 0xCC;
    /// Unspecified error.
    pub const UNSPECIFIED: u8 = 0xFF;
}

/// IPMI network function codes (request values; responses are `netfn | 1`).
pub mod netfn {
    pub const CHASSIS: u8 = 0x00;
    pub const APP: u8 = 0x06;
    pub const TRANSPORT: u8 = 0x0C;
}

/// Application (NetFn 0x06) command codes the listener recognizes.
pub mod app_cmd {
    pub const GET_DEVICE_ID: u8 = 0x01;
    pub const COLD_RESET: u8 = 0x02;
    pub const GET_CHANNEL_AUTH_CAPABILITIES: u8 = 0x38;
    pub const SET_SESSION_PRIVILEGE_LEVEL: u8 = 0x3B;
    pub const CLOSE_SESSION: u8 = 0x3C;
    pub const GET_CHANNEL_ACCESS: u8 = 0x41;
    pub const GET_CHANNEL_INFO: u8 = 0x42;
    pub const ACTIVATE_PAYLOAD: u8 = 0x48;
    pub const DEACTIVATE_PAYLOAD: u8 = 0x49;
    pub const GET_CHANNEL_CIPHER_SUITES: u8 = 0x54;
}

/// Chassis (NetFn 0x00) command codes.
pub mod chassis_cmd {
    pub const GET_CHASSIS_STATUS: u8 = 0x01;
    pub const CHASSIS_CONTROL: u8 = 0x02;
    pub const SET_SYSTEM_BOOT_OPTIONS: u8 = 0x08;
    pub const GET_SYSTEM_BOOT_OPTIONS: u8 = 0x09;
}

/// Transport (NetFn 0x0C) command codes.
pub mod transport_cmd {
    pub const GET_LAN_CONFIGURATION_PARAMETERS: u8 = 0x02;
}
