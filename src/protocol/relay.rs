//! Inner framing of RELAY cells
//!
//! A RELAY (or RELAY_EARLY) cell's 509-byte payload carries its own header:
//! relay command, recognized, stream id, digest, and payload length, then
//! up to 498 bytes of command-specific data, zero-padded to fill. The
//! digest and recognized fields belong to the onion engine; this module
//! only frames them.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

use super::cell::{MAX_PAYLOAD_LEN, NTOR_HLEN, NTOR_REPLY_HLEN};

/// Size of the relay header inside the cell payload.
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum command-specific data per relay cell.
pub const MAX_RPAYLOAD_LEN: usize = MAX_PAYLOAD_LEN - RELAY_HEADER_LEN;

/// Stream END reason: connection closed normally.
pub const END_REASON_DONE: u8 = 6;

/// Stream END reason: catch-all.
pub const END_REASON_MISC: u8 = 1;

/// Stream END reason: the exit refused the connection.
pub const END_REASON_CONNECT_REFUSED: u8 = 3;

/// Stream END reason: the exit's policy forbids the target.
pub const END_REASON_EXIT_POLICY: u8 = 4;

/// Stream END reason: the circuit is being torn down.
pub const END_REASON_DESTROY: u8 = 5;

/// Stream END reason: the connection attempt timed out.
pub const END_REASON_TIMEOUT: u8 = 7;

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open a stream
    Begin = 1,
    /// DATA - stream payload
    Data = 2,
    /// END - close a stream
    End = 3,
    /// CONNECTED - stream established
    Connected = 4,
    /// SENDME - flow control credit
    Sendme = 5,
    /// EXTEND - extend circuit (legacy)
    Extend = 6,
    /// EXTENDED - circuit extended (legacy)
    Extended = 7,
    /// TRUNCATE - remove hops past the recipient
    Truncate = 8,
    /// TRUNCATED - hops were removed
    Truncated = 9,
    /// DROP - long-range padding, ignored
    Drop = 10,
    /// RESOLVE - remote hostname lookup
    Resolve = 11,
    /// RESOLVED - lookup answer
    Resolved = 12,
    /// BEGIN_DIR - open a directory stream to the relay itself
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// One link specifier in an EXTEND2 cell, identifying the next hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSpecifier {
    /// IPv4 address and OR port.
    Ipv4 { addr: Ipv4Addr, port: u16 },
    /// IPv6 address and OR port.
    Ipv6 { addr: Ipv6Addr, port: u16 },
    /// Legacy RSA identity fingerprint.
    LegacyId([u8; 20]),
    /// Ed25519 identity key.
    Ed25519Id([u8; 32]),
}

impl LinkSpecifier {
    fn type_and_body_len(&self) -> (u8, usize) {
        match self {
            LinkSpecifier::Ipv4 { .. } => (0, 6),
            LinkSpecifier::Ipv6 { .. } => (1, 18),
            LinkSpecifier::LegacyId(_) => (2, 20),
            LinkSpecifier::Ed25519Id(_) => (3, 32),
        }
    }

    /// Encoded size including the type and length prefix bytes.
    pub fn encoded_len(&self) -> usize {
        2 + self.type_and_body_len().1
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let (lstype, body_len) = self.type_and_body_len();
        out.push(lstype);
        out.push(body_len as u8);
        match self {
            LinkSpecifier::Ipv4 { addr, port } => {
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::Ipv6 { addr, port } => {
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::LegacyId(id) => out.extend_from_slice(id),
            LinkSpecifier::Ed25519Id(id) => out.extend_from_slice(id),
        }
    }
}

/// The parsed inner structure of a RELAY cell.
///
/// `recognized` and `digest` are zero on construction; the onion engine
/// stamps the digest during encryption and verifies it during decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    pub command: RelayCommand,
    pub recognized: u16,
    pub stream_id: u16,
    pub digest: [u8; 4],
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Create a relay cell with zeroed recognized and digest fields.
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_RPAYLOAD_LEN {
            return Err(Error::BadPayloadData(format!(
                "relay payload is {} bytes, max is {}",
                data.len(),
                MAX_RPAYLOAD_LEN
            )));
        }
        Ok(Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        })
    }

    /// BEGIN cell: "host:port" NUL-terminated.
    pub fn begin(stream_id: u16, host: &str, port: u16) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::BadPayloadData(
                "BEGIN cells require a nonzero stream id".into(),
            ));
        }
        let target = format!("{}:{}\0", host, port);
        Self::new(RelayCommand::Begin, stream_id, target.into_bytes())
    }

    /// BEGIN_DIR cell: directory stream to the relay itself, no target.
    pub fn begin_dir(stream_id: u16) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::BadPayloadData(
                "BEGIN_DIR cells require a nonzero stream id".into(),
            ));
        }
        Self::new(RelayCommand::BeginDir, stream_id, Vec::new())
    }

    /// DATA cell carrying up to 498 bytes of stream payload.
    pub fn data(stream_id: u16, bytes: Vec<u8>) -> Result<Self> {
        Self::new(RelayCommand::Data, stream_id, bytes)
    }

    /// END cell with a reason byte.
    pub fn end(stream_id: u16, reason: u8) -> Result<Self> {
        Self::new(RelayCommand::End, stream_id, vec![reason])
    }

    /// SENDME cell. Stream id zero for circuit-level credit.
    pub fn sendme(stream_id: u16) -> Result<Self> {
        Self::new(RelayCommand::Sendme, stream_id, Vec::new())
    }

    /// Circuit-level DROP (long-range padding).
    pub fn drop_cell() -> Result<Self> {
        Self::new(RelayCommand::Drop, 0, Vec::new())
    }

    /// EXTEND2 cell addressed to the current last hop.
    ///
    /// Refuses an empty link-specifier list and any onion skin that is not
    /// an 84-byte NTor skin. EXTEND2 is circuit-level, so the stream id is
    /// always zero.
    pub fn extend2(lspecs: &[LinkSpecifier], hdata: Vec<u8>) -> Result<Self> {
        if lspecs.is_empty() {
            return Err(Error::BadPayloadData(
                "at least one link specifier is required".into(),
            ));
        }
        if hdata.len() != NTOR_HLEN as usize {
            return Err(Error::BadPayloadData(format!(
                "EXTEND2 onion skin is {} bytes, expected {}",
                hdata.len(),
                NTOR_HLEN
            )));
        }

        let specs_len: usize = lspecs.iter().map(|l| l.encoded_len()).sum();
        let mut payload = Vec::with_capacity(1 + specs_len + 4 + hdata.len());
        payload.push(lspecs.len() as u8);
        for lspec in lspecs {
            lspec.encode(&mut payload);
        }
        payload.extend_from_slice(&super::cell::NTOR_HTYPE.to_be_bytes());
        payload.extend_from_slice(&NTOR_HLEN.to_be_bytes());
        payload.extend_from_slice(&hdata);

        Self::new(RelayCommand::Extend2, 0, payload)
    }

    /// Extract the handshake reply from an EXTENDED2 cell:
    /// hlen (2 bytes) then exactly hlen bytes of NTor reply.
    pub fn parse_extended2(&self) -> Result<&[u8]> {
        if self.command != RelayCommand::Extended2 {
            return Err(Error::BadPayloadData(format!(
                "expected EXTENDED2, got {:?}",
                self.command
            )));
        }
        if self.data.len() < 2 {
            return Err(Error::BadPayloadData("EXTENDED2 reply too short".into()));
        }
        let hlen = u16::from_be_bytes([self.data[0], self.data[1]]);
        if hlen != NTOR_REPLY_HLEN {
            return Err(Error::BadPayloadData(format!(
                "EXTENDED2 hlen was {}, expected {}",
                hlen, NTOR_REPLY_HLEN
            )));
        }
        if self.data.len() < 2 + hlen as usize {
            return Err(Error::BadPayloadData("EXTENDED2 reply truncated".into()));
        }
        Ok(&self.data[2..2 + hlen as usize])
    }

    /// END reason carried by this cell, if it is an END.
    pub fn end_reason(&self) -> Option<u8> {
        if self.command == RelayCommand::End {
            Some(self.data.first().copied().unwrap_or(END_REASON_MISC))
        } else {
            None
        }
    }

    /// Serialize to the fixed 509-byte relay-cell body, zero-padded.
    pub fn encode_body(&self) -> [u8; MAX_PAYLOAD_LEN] {
        let mut body = [0u8; MAX_PAYLOAD_LEN];
        body[0] = self.command as u8;
        body[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        body[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        body[5..9].copy_from_slice(&self.digest);
        body[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        body[RELAY_HEADER_LEN..RELAY_HEADER_LEN + self.data.len()].copy_from_slice(&self.data);
        body
    }

    /// Parse a plaintext relay-cell body.
    pub fn parse_body(body: &[u8]) -> Result<Self> {
        if body.len() < RELAY_HEADER_LEN {
            return Err(Error::BadPayloadData(format!(
                "relay body is {} bytes, header needs {}",
                body.len(),
                RELAY_HEADER_LEN
            )));
        }
        let command =
            RelayCommand::from_u8(body[0]).ok_or(Error::UnknownRelayCommand(body[0]))?;
        let recognized = u16::from_be_bytes([body[1], body[2]]);
        let stream_id = u16::from_be_bytes([body[3], body[4]]);
        let digest = [body[5], body[6], body[7], body[8]];
        let length = u16::from_be_bytes([body[9], body[10]]) as usize;

        if length > MAX_RPAYLOAD_LEN || RELAY_HEADER_LEN + length > body.len() {
            return Err(Error::BadPayloadData(format!(
                "relay payload length {} exceeds cell bounds",
                length
            )));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: body[RELAY_HEADER_LEN..RELAY_HEADER_LEN + length].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_body_round_trip() {
        let cell = RelayCell::begin(100, "example.com", 443).unwrap();
        let body = cell.encode_body();
        assert_eq!(body.len(), MAX_PAYLOAD_LEN);

        let parsed = RelayCell::parse_body(&body).unwrap();
        assert_eq!(parsed, cell);
        assert_eq!(parsed.data, b"example.com:443\0");
    }

    #[test]
    fn test_relay_body_layout() {
        let cell = RelayCell::data(0x0102, vec![0xab; 5]).unwrap();
        let body = cell.encode_body();
        assert_eq!(body[0], RelayCommand::Data as u8);
        assert_eq!(&body[1..3], &[0, 0]); // recognized
        assert_eq!(&body[3..5], &[0x01, 0x02]); // stream id
        assert_eq!(&body[5..9], &[0, 0, 0, 0]); // digest
        assert_eq!(&body[9..11], &[0, 5]); // length
        assert_eq!(&body[11..16], &[0xab; 5]);
        assert!(body[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_data_size_limit() {
        assert!(RelayCell::data(1, vec![0; MAX_RPAYLOAD_LEN]).is_ok());
        assert!(RelayCell::data(1, vec![0; MAX_RPAYLOAD_LEN + 1]).is_err());
    }

    #[test]
    fn test_extend2_layout() {
        let lspecs = [
            LinkSpecifier::Ipv4 {
                addr: Ipv4Addr::new(10, 0, 0, 1),
                port: 9001,
            },
            LinkSpecifier::LegacyId([0x22; 20]),
        ];
        let cell = RelayCell::extend2(&lspecs, vec![0x33; 84]).unwrap();

        assert_eq!(cell.command, RelayCommand::Extend2);
        assert_eq!(cell.stream_id, 0);
        // 1 + (2+6) + (2+20) + 2 + 2 + 84
        assert_eq!(cell.data.len(), 119);
        assert_eq!(cell.data[0], 2); // nspec
        assert_eq!(&cell.data[1..3], &[0, 6]); // ipv4 spec prefix
        assert_eq!(&cell.data[9..11], &[2, 20]); // legacy id prefix
        assert_eq!(&cell.data[31..33], &[0, 2]); // htype
        assert_eq!(&cell.data[33..35], &[0, 84]); // hlen
    }

    #[test]
    fn test_extend2_requires_link_specifiers() {
        let err = RelayCell::extend2(&[], vec![0; 84]).unwrap_err();
        assert!(matches!(err, Error::BadPayloadData(_)));
    }

    #[test]
    fn test_extend2_requires_ntor_skin() {
        let lspecs = [LinkSpecifier::LegacyId([0; 20])];
        assert!(RelayCell::extend2(&lspecs, vec![0; 83]).is_err());
        assert!(RelayCell::extend2(&lspecs, vec![0; 84]).is_ok());
    }

    #[test]
    fn test_parse_extended2() {
        let mut reply = vec![0x00, 0x40];
        reply.extend_from_slice(&[0x44; 64]);
        let cell = RelayCell::new(RelayCommand::Extended2, 0, reply).unwrap();
        assert_eq!(cell.parse_extended2().unwrap(), &[0x44; 64][..]);

        let bad = RelayCell::new(RelayCommand::Extended2, 0, vec![0x00, 0x3f]).unwrap();
        assert!(bad.parse_extended2().is_err());
    }

    #[test]
    fn test_unknown_relay_command() {
        let mut body = [0u8; MAX_PAYLOAD_LEN];
        body[0] = 200;
        assert_eq!(
            RelayCell::parse_body(&body),
            Err(Error::UnknownRelayCommand(200))
        );
    }

    #[test]
    fn test_bad_length_field() {
        let mut body = RelayCell::sendme(0).unwrap().encode_body();
        body[9..11].copy_from_slice(&499u16.to_be_bytes());
        assert!(matches!(
            RelayCell::parse_body(&body),
            Err(Error::BadPayloadData(_))
        ));
    }
}
