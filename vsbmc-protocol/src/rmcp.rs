//! RMCP 1.0 framing: the 4-byte header in front of every datagram.

use crate::ProtocolError;

/// RMCP protocol version carried in byte 0.
pub const VERSION: u8 = 0x06;

/// Sequence number meaning "no RMCP ACK requested".
pub const SEQ_NO_ACK: u8 = 0xFF;

/// Header length in bytes.
pub const HEADER_LEN: usize = 4;

/// RMCP message class (byte 3, low nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Asf,
    Ipmi,
}

impl Class {
    pub fn as_u8(self) -> u8 {
        match self {
            Class::Asf => 0x06,
            Class::Ipmi => 0x07,
        }
    }
}

/// Parsed RMCP header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub sequence: u8,
    pub class: Class,
}

impl Header {
    /// Parse the header and return it with the remaining bytes.
    ///
    /// Unknown classes are an error; the listener drops such datagrams
    /// silently.
    pub fn parse(datagram: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if datagram.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated("RMCP header"));
        }
        if datagram[0] != VERSION {
            return Err(ProtocolError::InvalidField("RMCP version", datagram[0]));
        }
        let class = match datagram[3] & 0x0F {
            0x06 => Class::Asf,
            0x07 => Class::Ipmi,
            other => return Err(ProtocolError::InvalidField("RMCP class", other)),
        };
        let header = Header {
            sequence: datagram[2],
            class,
        };
        Ok((header, &datagram[HEADER_LEN..]))
    }

    /// Encode the 4-byte header.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        [VERSION, 0x00, self.sequence, self.class.as_u8()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipmi_class() {
        let (header, rest) = Header::parse(&[0x06, 0x00, 0xFF, 0x07, 0xAA, 0xBB]).unwrap();
        assert_eq!(header.sequence, 0xFF);
        assert_eq!(header.class, Class::Ipmi);
        assert_eq!(rest, &[0xAA, 0xBB]);
    }

    #[test]
    fn parse_rejects_unknown_class() {
        assert!(Header::parse(&[0x06, 0x00, 0xFF, 0x08]).is_err());
    }

    #[test]
    fn parse_rejects_short_datagram() {
        assert!(Header::parse(&[0x06, 0x00]).is_err());
    }

    #[test]
    fn encode_round_trip() {
        let header = Header {
            sequence: 0xFF,
            class: Class::Asf,
        };
        let bytes = header.encode();
        let (decoded, _) = Header::parse(&bytes).unwrap();
        assert_eq!(decoded.sequence, 0xFF);
        assert_eq!(decoded.class, Class::Asf);
    }
}
