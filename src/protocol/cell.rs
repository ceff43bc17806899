//! Cell codec for the link protocol
//!
//! Cells are the basic framed unit on a link. Fixed-length cells occupy
//! exactly 512 bytes under link protocol v3 and below, 514 bytes under v4.
//! Variable-length cells carry a 2-byte big-endian length after the header.
//! The circuit id is 2 bytes wide for v3 and below, 4 bytes for v4;
//! VERSIONS cells always use the 2-byte form.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

use super::certs::CertsCell;
use super::relay::RelayCell;

/// Total wire size of a fixed-length cell, link protocol v3 and below.
pub const FIXED_LEN_V3: usize = 512;

/// Total wire size of a fixed-length cell, link protocol v4.
pub const FIXED_LEN_V4: usize = 514;

/// Payload size of a fixed-length cell (identical for both header widths).
pub const MAX_PAYLOAD_LEN: usize = 509;

/// Header size of a VERSIONS cell: 2-byte circuit id plus command byte,
/// regardless of negotiated link version.
pub const VERSIONS_HEADER_LEN: usize = 3;

/// NTor handshake type code used in CREATE2/EXTEND2.
pub const NTOR_HTYPE: u16 = 2;

/// NTor onion-skin length: node id (20) + onion key (32) + client X (32).
pub const NTOR_HLEN: u16 = 84;

/// NTor reply length in CREATED2/EXTENDED2: server Y (32) + auth (32).
pub const NTOR_REPLY_HLEN: u16 = 64;

/// DESTROY reason sent by clients regardless of the actual cause, to avoid
/// leaking version information.
pub const DESTROY_REASON_NONE: u8 = 0;

/// Highest DESTROY/TRUNCATED reason code in the published set.
const DESTROY_REASON_MAX: u8 = 12;

/// Maximum number of this-or-address entries in a NETINFO cell.
const MAX_NETINFO_ADDRESSES: usize = 5;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - link-level padding
    Padding = 0,
    /// CREATE - create a circuit (legacy TAP, never originated)
    Create = 1,
    /// CREATED - circuit created (legacy)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation (legacy)
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created (legacy)
    CreatedFast = 6,
    /// VERSIONS - negotiate link protocol versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell permitted during circuit construction
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - responder authentication
    Authenticate = 131,
    /// AUTHORIZE - reserved
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether this command uses the variable-length cell layout. The
    /// choice is fixed by the protocol, not by the sender.
    pub fn is_variable_length(self) -> bool {
        matches!(
            self,
            CellCommand::Versions
                | CellCommand::Vpadding
                | CellCommand::Certs
                | CellCommand::AuthChallenge
                | CellCommand::Authenticate
                | CellCommand::Authorize
        )
    }
}

/// Width in bytes of the circuit id field for a link version.
pub fn circ_id_len(link_version: u8) -> usize {
    if link_version <= 3 {
        2
    } else {
        4
    }
}

/// Total wire size of a fixed-length cell for a link version.
pub fn fixed_cell_len(link_version: u8) -> usize {
    if link_version <= 3 {
        FIXED_LEN_V3
    } else {
        FIXED_LEN_V4
    }
}

fn check_link_version(link_version: u8) -> Result<()> {
    if (1..=4).contains(&link_version) {
        Ok(())
    } else {
        Err(Error::BadCellHeader(format!(
            "link version must be 1..=4, found {}",
            link_version
        )))
    }
}

/// Circuit id and link version shared by every cell type. The command is
/// implied by the typed cell carrying the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellHeader {
    pub circ_id: u32,
    pub link_version: u8,
}

impl CellHeader {
    pub fn new(circ_id: u32, link_version: u8) -> Self {
        Self {
            circ_id,
            link_version,
        }
    }

    fn encode(&self, cmd: CellCommand, out: &mut Vec<u8>) {
        if cmd == CellCommand::Versions || self.link_version <= 3 {
            out.extend_from_slice(&(self.circ_id as u16).to_be_bytes());
        } else {
            out.extend_from_slice(&self.circ_id.to_be_bytes());
        }
        out.push(cmd as u8);
    }

    fn len(&self, cmd: CellCommand) -> usize {
        if cmd == CellCommand::Versions {
            VERSIONS_HEADER_LEN
        } else {
            circ_id_len(self.link_version) + 1
        }
    }
}

/// A parsed cell, tagged by command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Padding(PaddingCell),
    Create2(Create2Cell),
    Created2(Created2Cell),
    Destroy(DestroyCell),
    Netinfo(NetinfoCell),
    /// RELAY or RELAY_EARLY whose payload is still onion-encrypted (or has
    /// been onion-encrypted for sending).
    Encrypted(EncryptedCell),
    /// RELAY or RELAY_EARLY in the clear, with the inner structure parsed.
    Relay(RelayEnvelope),
    /// Legacy CREATE/CREATED/CREATE_FAST/CREATED_FAST. Recognized but
    /// carried opaque; this client never originates them.
    LegacyCreate(LegacyCreateCell),
    Versions(VersionsCell),
    Vpadding(VpaddingCell),
    Certs(CertsCell),
    AuthChallenge(AuthChallengeCell),
    Authenticate(AuthenticateCell),
    Authorize(AuthorizeCell),
}

impl Cell {
    /// Command of this cell.
    pub fn command(&self) -> CellCommand {
        match self {
            Cell::Padding(_) => CellCommand::Padding,
            Cell::Create2(_) => CellCommand::Create2,
            Cell::Created2(_) => CellCommand::Created2,
            Cell::Destroy(_) => CellCommand::Destroy,
            Cell::Netinfo(_) => CellCommand::Netinfo,
            Cell::Encrypted(c) => c.command(),
            Cell::Relay(c) => c.command(),
            Cell::LegacyCreate(c) => c.cmd,
            Cell::Versions(_) => CellCommand::Versions,
            Cell::Vpadding(_) => CellCommand::Vpadding,
            Cell::Certs(_) => CellCommand::Certs,
            Cell::AuthChallenge(_) => CellCommand::AuthChallenge,
            Cell::Authenticate(_) => CellCommand::Authenticate,
            Cell::Authorize(_) => CellCommand::Authorize,
        }
    }

    /// Header (circuit id and link version) of this cell.
    pub fn header(&self) -> CellHeader {
        match self {
            Cell::Padding(c) => c.header,
            Cell::Create2(c) => c.header,
            Cell::Created2(c) => c.header,
            Cell::Destroy(c) => c.header,
            Cell::Netinfo(c) => c.header,
            Cell::Encrypted(c) => c.header,
            Cell::Relay(c) => c.header,
            Cell::LegacyCreate(c) => c.header,
            Cell::Versions(c) => c.header,
            Cell::Vpadding(c) => c.header,
            Cell::Certs(c) => c.header,
            Cell::AuthChallenge(c) => c.header,
            Cell::Authenticate(c) => c.header,
            Cell::Authorize(c) => c.header,
        }
    }

    pub fn circ_id(&self) -> u32 {
        self.header().circ_id
    }

    /// Parse one cell from the front of `data` and return it with the
    /// number of bytes consumed.
    ///
    /// With `encrypted` set, RELAY and RELAY_EARLY payloads are returned
    /// opaque as [`EncryptedCell`] instead of parsing the inner relay
    /// structure.
    pub fn parse_prefix(data: &[u8], link_version: u8, encrypted: bool) -> Result<(Cell, usize)> {
        check_link_version(link_version)?;

        // A VERSIONS cell keeps the 2-byte circuit id even after a wider
        // id width has been negotiated. VERSIONS always travels on circuit
        // zero, which no initiator-allocated id collides with.
        let versions_layout = data.len() >= VERSIONS_HEADER_LEN
            && data[2] == CellCommand::Versions as u8
            && (link_version <= 3 || data[..2] == [0, 0]);

        let header_len = if versions_layout {
            VERSIONS_HEADER_LEN
        } else {
            circ_id_len(link_version) + 1
        };
        if data.len() < header_len {
            return Err(Error::NotEnoughBytes {
                needed: header_len,
                found: data.len(),
            });
        }

        let (circ_id, cmd_byte) = if versions_layout || link_version <= 3 {
            (u16::from_be_bytes([data[0], data[1]]) as u32, data[2])
        } else {
            (
                u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                data[4],
            )
        };
        let cmd = CellCommand::from_u8(cmd_byte).ok_or(Error::UnknownCellCommand(cmd_byte))?;
        let header = CellHeader::new(circ_id, link_version);

        if cmd.is_variable_length() {
            if data.len() < header_len + 2 {
                return Err(Error::NotEnoughBytes {
                    needed: header_len + 2,
                    found: data.len(),
                });
            }
            let body_len =
                u16::from_be_bytes([data[header_len], data[header_len + 1]]) as usize;
            let total = header_len + 2 + body_len;
            if data.len() < total {
                return Err(Error::NotEnoughBytes {
                    needed: total,
                    found: data.len(),
                });
            }
            let body = &data[header_len + 2..total];
            let cell = Self::parse_varlen_body(header, cmd, body)?;
            Ok((cell, total))
        } else {
            let total = fixed_cell_len(link_version);
            if data.len() < total {
                return Err(Error::NotEnoughBytes {
                    needed: total,
                    found: data.len(),
                });
            }
            let payload = &data[header_len..total];
            let cell = Self::parse_fixed_payload(header, cmd, payload, encrypted)?;
            Ok((cell, total))
        }
    }

    /// Parse one cell from the front of `data`.
    pub fn parse(data: &[u8], link_version: u8, encrypted: bool) -> Result<Cell> {
        Self::parse_prefix(data, link_version, encrypted).map(|(cell, _)| cell)
    }

    /// Peek at the header only and report whether `data` holds a complete
    /// cell. Returns `false` rather than failing while the header itself is
    /// short; an unrecognized command byte is still an error.
    pub fn enough_bytes_for_cell(data: &[u8], link_version: u8) -> Result<bool> {
        check_link_version(link_version)?;

        let versions_layout = data.len() >= VERSIONS_HEADER_LEN
            && data[2] == CellCommand::Versions as u8
            && (link_version <= 3 || data[..2] == [0, 0]);

        let header_len = if versions_layout {
            VERSIONS_HEADER_LEN
        } else {
            circ_id_len(link_version) + 1
        };
        if data.len() < header_len {
            return Ok(false);
        }

        let cmd_byte = data[header_len - 1];
        let cmd = CellCommand::from_u8(cmd_byte).ok_or(Error::UnknownCellCommand(cmd_byte))?;

        if cmd.is_variable_length() {
            if data.len() < header_len + 2 {
                return Ok(false);
            }
            let body_len =
                u16::from_be_bytes([data[header_len], data[header_len + 1]]) as usize;
            Ok(data.len() >= header_len + 2 + body_len)
        } else {
            Ok(data.len() >= fixed_cell_len(link_version))
        }
    }

    fn parse_fixed_payload(
        header: CellHeader,
        cmd: CellCommand,
        payload: &[u8],
        encrypted: bool,
    ) -> Result<Cell> {
        match cmd {
            CellCommand::Padding => Ok(Cell::Padding(PaddingCell { header })),
            CellCommand::Create2 => Create2Cell::parse_payload(header, payload).map(Cell::Create2),
            CellCommand::Created2 => {
                Created2Cell::parse_payload(header, payload).map(Cell::Created2)
            }
            CellCommand::Destroy => DestroyCell::parse_payload(header, payload).map(Cell::Destroy),
            CellCommand::Netinfo => NetinfoCell::parse_payload(header, payload).map(Cell::Netinfo),
            CellCommand::Relay | CellCommand::RelayEarly => {
                let early = cmd == CellCommand::RelayEarly;
                if encrypted {
                    EncryptedCell::make(header.circ_id, payload.to_vec(), header.link_version, early)
                        .map(Cell::Encrypted)
                } else {
                    let relay = RelayCell::parse_body(payload)?;
                    Ok(Cell::Relay(RelayEnvelope {
                        header,
                        early,
                        relay,
                    }))
                }
            }
            CellCommand::Create
            | CellCommand::Created
            | CellCommand::CreateFast
            | CellCommand::CreatedFast => Ok(Cell::LegacyCreate(LegacyCreateCell {
                header,
                cmd,
                payload: payload.to_vec(),
            })),
            _ => Err(Error::BadCellHeader(format!(
                "command {:?} is not fixed-length",
                cmd
            ))),
        }
    }

    fn parse_varlen_body(header: CellHeader, cmd: CellCommand, body: &[u8]) -> Result<Cell> {
        match cmd {
            CellCommand::Versions => VersionsCell::parse_body(header, body).map(Cell::Versions),
            CellCommand::Vpadding => Ok(Cell::Vpadding(VpaddingCell {
                header,
                payload: body.to_vec(),
            })),
            CellCommand::Certs => CertsCell::parse_body(header, body).map(Cell::Certs),
            CellCommand::AuthChallenge => {
                AuthChallengeCell::parse_body(header, body).map(Cell::AuthChallenge)
            }
            CellCommand::Authenticate => Ok(Cell::Authenticate(AuthenticateCell {
                header,
                payload: body.to_vec(),
            })),
            CellCommand::Authorize => Ok(Cell::Authorize(AuthorizeCell {
                header,
                payload: body.to_vec(),
            })),
            _ => Err(Error::BadCellHeader(format!(
                "command {:?} is not variable-length",
                cmd
            ))),
        }
    }

    /// Serialize to wire bytes. Fixed-length cells are zero-padded to the
    /// full link-version size; padding is never omitted on the wire.
    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_inner(false)
    }

    /// Serialize without the trailing zero padding of fixed-length cells.
    /// Used by tests and digest-input computations only.
    pub fn serialize_trimmed(&self) -> Vec<u8> {
        self.serialize_inner(true)
    }

    fn serialize_inner(&self, trimmed: bool) -> Vec<u8> {
        let cmd = self.command();
        let header = self.header();
        let mut out = Vec::with_capacity(fixed_cell_len(header.link_version));
        header.encode(cmd, &mut out);

        if cmd.is_variable_length() {
            let body = self.encode_body();
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
            out.extend_from_slice(&body);
            return out;
        }

        out.extend_from_slice(&self.encode_body());
        if !trimmed {
            out.resize(fixed_cell_len(header.link_version), 0);
        }
        out
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Cell::Padding(_) => Vec::new(),
            Cell::Create2(c) => c.encode_payload(),
            Cell::Created2(c) => c.encode_payload(),
            Cell::Destroy(c) => vec![c.reason],
            Cell::Netinfo(c) => c.encode_payload(),
            Cell::Encrypted(c) => c.payload.clone(),
            Cell::Relay(c) => c.relay.encode_body().to_vec(),
            Cell::LegacyCreate(c) => c.payload.clone(),
            Cell::Versions(c) => c.encode_body(),
            Cell::Vpadding(c) => c.payload.clone(),
            Cell::Certs(c) => c.encode_body(),
            Cell::AuthChallenge(c) => c.encode_body(),
            Cell::Authenticate(c) => c.payload.clone(),
            Cell::Authorize(c) => c.payload.clone(),
        }
    }
}

/// PADDING cell. No payload fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingCell {
    pub header: CellHeader,
}

impl PaddingCell {
    pub fn make(circ_id: u32, link_version: u8) -> Self {
        Self {
            header: CellHeader::new(circ_id, link_version),
        }
    }
}

/// CREATE2 cell: handshake type, length, and onion skin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create2Cell {
    pub header: CellHeader,
    pub htype: u16,
    pub hlen: u16,
    pub hdata: Vec<u8>,
}

impl Create2Cell {
    /// Build a CREATE2, refusing anything but a well-formed NTor onion
    /// skin.
    pub fn make(circ_id: u32, htype: u16, hlen: u16, hdata: Vec<u8>, link_version: u8) -> Result<Self> {
        if htype != NTOR_HTYPE {
            return Err(Error::BadPayloadData(format!(
                "CREATE2 htype was {}, only {} (NTor) is supported",
                htype, NTOR_HTYPE
            )));
        }
        if hlen != NTOR_HLEN {
            return Err(Error::BadPayloadData(format!(
                "CREATE2 hlen was {}, expected {}",
                hlen, NTOR_HLEN
            )));
        }
        if hlen as usize != hdata.len() {
            return Err(Error::BadPayloadData(format!(
                "CREATE2 hlen was {} but hdata is {} bytes",
                hlen,
                hdata.len()
            )));
        }
        Ok(Self {
            header: CellHeader::new(circ_id, link_version),
            htype,
            hlen,
            hdata,
        })
    }

    fn parse_payload(header: CellHeader, payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::BadPayloadData(
                "CREATE2 payload too short for htype and hlen".into(),
            ));
        }
        let htype = u16::from_be_bytes([payload[0], payload[1]]);
        if htype != NTOR_HTYPE {
            return Err(Error::BadPayloadData(format!(
                "CREATE2 htype was {}, only {} (NTor) is supported",
                htype, NTOR_HTYPE
            )));
        }
        let hlen = u16::from_be_bytes([payload[2], payload[3]]);
        if hlen != NTOR_HLEN {
            return Err(Error::BadPayloadData(format!(
                "CREATE2 hlen was {}, expected {}",
                hlen, NTOR_HLEN
            )));
        }
        if payload.len() < 4 + hlen as usize {
            return Err(Error::BadPayloadData(format!(
                "CREATE2 hlen was {} but only {} payload bytes remain",
                hlen,
                payload.len() - 4
            )));
        }
        Ok(Self {
            header,
            htype,
            hlen,
            hdata: payload[4..4 + hlen as usize].to_vec(),
        })
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.hdata.len());
        out.extend_from_slice(&self.htype.to_be_bytes());
        out.extend_from_slice(&self.hlen.to_be_bytes());
        out.extend_from_slice(&self.hdata);
        out
    }
}

/// CREATED2 cell: handshake reply length and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created2Cell {
    pub header: CellHeader,
    pub hlen: u16,
    pub hdata: Vec<u8>,
}

impl Created2Cell {
    pub fn make(circ_id: u32, hlen: u16, hdata: Vec<u8>, link_version: u8) -> Result<Self> {
        if hlen != NTOR_REPLY_HLEN {
            return Err(Error::BadPayloadData(format!(
                "CREATED2 hlen was {}, expected {}",
                hlen, NTOR_REPLY_HLEN
            )));
        }
        if hlen as usize != hdata.len() {
            return Err(Error::BadPayloadData(format!(
                "CREATED2 hlen was {} but hdata is {} bytes",
                hlen,
                hdata.len()
            )));
        }
        Ok(Self {
            header: CellHeader::new(circ_id, link_version),
            hlen,
            hdata,
        })
    }

    fn parse_payload(header: CellHeader, payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(Error::BadPayloadData("CREATED2 payload too short".into()));
        }
        let hlen = u16::from_be_bytes([payload[0], payload[1]]);
        if hlen != NTOR_REPLY_HLEN {
            return Err(Error::BadPayloadData(format!(
                "CREATED2 hlen was {}, expected {}",
                hlen, NTOR_REPLY_HLEN
            )));
        }
        if payload.len() < 2 + hlen as usize {
            return Err(Error::BadPayloadData(format!(
                "CREATED2 hlen was {} but only {} payload bytes remain",
                hlen,
                payload.len() - 2
            )));
        }
        Ok(Self {
            header,
            hlen,
            hdata: payload[2..2 + hlen as usize].to_vec(),
        })
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.hdata.len());
        out.extend_from_slice(&self.hlen.to_be_bytes());
        out.extend_from_slice(&self.hdata);
        out
    }
}

/// DESTROY cell: single reason byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyCell {
    pub header: CellHeader,
    pub reason: u8,
}

impl DestroyCell {
    // Reason NONE is always sent forward to avoid leaking version
    // information; other reasons are only ever accepted inbound.
    pub fn make(circ_id: u32, reason: u8, link_version: u8) -> Result<Self> {
        if reason > DESTROY_REASON_MAX {
            return Err(Error::BadPayloadData(format!(
                "unrecognized DESTROY reason: {}",
                reason
            )));
        }
        Ok(Self {
            header: CellHeader::new(circ_id, link_version),
            reason,
        })
    }

    fn parse_payload(header: CellHeader, payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::BadPayloadData("DESTROY payload empty".into()));
        }
        let reason = payload[0];
        if reason > DESTROY_REASON_MAX {
            return Err(Error::BadPayloadData(format!(
                "unrecognized DESTROY reason: {}",
                reason
            )));
        }
        Ok(Self { header, reason })
    }
}

/// One type/length/value address as carried in NETINFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvAddress {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl TlvAddress {
    const TYPE_IPV4: u8 = 4;
    const TYPE_IPV6: u8 = 6;

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            TlvAddress::Ipv4(a) => {
                out.push(Self::TYPE_IPV4);
                out.push(4);
                out.extend_from_slice(&a.octets());
            }
            TlvAddress::Ipv6(a) => {
                out.push(Self::TYPE_IPV6);
                out.push(16);
                out.extend_from_slice(&a.octets());
            }
        }
    }

    /// Parse one TLV triple, returning it with the bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(Error::BadPayloadData("TLV address truncated".into()));
        }
        let (atype, alen) = (data[0], data[1] as usize);
        if data.len() < 2 + alen {
            return Err(Error::BadPayloadData("TLV address value truncated".into()));
        }
        match (atype, alen) {
            (Self::TYPE_IPV4, 4) => {
                let mut o = [0u8; 4];
                o.copy_from_slice(&data[2..6]);
                Ok((TlvAddress::Ipv4(Ipv4Addr::from(o)), 6))
            }
            (Self::TYPE_IPV6, 16) => {
                let mut o = [0u8; 16];
                o.copy_from_slice(&data[2..18]);
                Ok((TlvAddress::Ipv6(Ipv6Addr::from(o)), 18))
            }
            _ => Err(Error::BadPayloadData(format!(
                "unsupported TLV address type {} with length {}",
                atype, alen
            ))),
        }
    }
}

/// NETINFO cell: timestamp, the peer's address as we see it, and our own
/// advertised addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetinfoCell {
    pub header: CellHeader,
    pub timestamp: u32,
    pub other_address: TlvAddress,
    pub this_addresses: Vec<TlvAddress>,
}

impl NetinfoCell {
    pub fn make(
        circ_id: u32,
        timestamp: u32,
        other_address: TlvAddress,
        this_addresses: Vec<TlvAddress>,
        link_version: u8,
    ) -> Result<Self> {
        if this_addresses.len() > MAX_NETINFO_ADDRESSES {
            return Err(Error::BadPayloadData(format!(
                "NETINFO carries at most {} this-or-addresses, got {}",
                MAX_NETINFO_ADDRESSES,
                this_addresses.len()
            )));
        }
        Ok(Self {
            header: CellHeader::new(circ_id, link_version),
            timestamp,
            other_address,
            this_addresses,
        })
    }

    fn parse_payload(header: CellHeader, payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::BadPayloadData("NETINFO payload too short".into()));
        }
        let timestamp = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let mut offset = 4;
        let (other_address, used) = TlvAddress::parse(&payload[offset..])?;
        offset += used;

        if payload.len() <= offset {
            return Err(Error::BadPayloadData("NETINFO address count missing".into()));
        }
        let num_addresses = payload[offset] as usize;
        offset += 1;
        if num_addresses > MAX_NETINFO_ADDRESSES {
            return Err(Error::BadPayloadData(format!(
                "NETINFO carries at most {} this-or-addresses, got {}",
                MAX_NETINFO_ADDRESSES, num_addresses
            )));
        }

        let mut this_addresses = Vec::with_capacity(num_addresses);
        for _ in 0..num_addresses {
            let (addr, used) = TlvAddress::parse(&payload[offset..])?;
            this_addresses.push(addr);
            offset += used;
        }

        Ok(Self {
            header,
            timestamp,
            other_address,
            this_addresses,
        })
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        self.other_address.encode(&mut out);
        out.push(self.this_addresses.len() as u8);
        for addr in &self.this_addresses {
            addr.encode(&mut out);
        }
        out
    }
}

/// A RELAY or RELAY_EARLY cell whose 509-byte payload is onion ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedCell {
    pub header: CellHeader,
    pub early: bool,
    pub payload: Vec<u8>,
}

impl EncryptedCell {
    /// Wrap an onion-encrypted relay payload. The payload must already be
    /// padded to the full relay-cell size.
    pub fn make(circ_id: u32, payload: Vec<u8>, link_version: u8, early: bool) -> Result<Self> {
        if payload.len() != MAX_PAYLOAD_LEN {
            return Err(Error::BadPayloadData(format!(
                "encrypted relay payload must be {} bytes, got {}",
                MAX_PAYLOAD_LEN,
                payload.len()
            )));
        }
        Ok(Self {
            header: CellHeader::new(circ_id, link_version),
            early,
            payload,
        })
    }

    pub fn command(&self) -> CellCommand {
        if self.early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        }
    }
}

/// A RELAY or RELAY_EARLY cell in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEnvelope {
    pub header: CellHeader,
    pub early: bool,
    pub relay: RelayCell,
}

impl RelayEnvelope {
    pub fn command(&self) -> CellCommand {
        if self.early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        }
    }
}

/// Legacy CREATE-family cell, carried opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyCreateCell {
    pub header: CellHeader,
    pub cmd: CellCommand,
    pub payload: Vec<u8>,
}

/// VERSIONS cell: the versions the sender speaks, two bytes each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionsCell {
    pub header: CellHeader,
    pub versions: Vec<u16>,
}

impl VersionsCell {
    pub fn make(versions: Vec<u16>) -> Self {
        // VERSIONS is connection-level: circuit id zero, pre-negotiation
        // header layout.
        Self {
            header: CellHeader::new(0, 3),
            versions,
        }
    }

    fn parse_body(header: CellHeader, body: &[u8]) -> Result<Self> {
        if body.len() % 2 != 0 {
            return Err(Error::BadPayloadData(format!(
                "VERSIONS body length {} is not a multiple of 2",
                body.len()
            )));
        }
        let versions = body
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { header, versions })
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.versions.len() * 2);
        for v in &self.versions {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }
}

/// VPADDING cell: ignored filler of arbitrary length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpaddingCell {
    pub header: CellHeader,
    pub payload: Vec<u8>,
}

/// AUTH_CHALLENGE cell: 32-byte challenge plus accepted auth methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallengeCell {
    pub header: CellHeader,
    pub challenge: [u8; 32],
    pub methods: Vec<u16>,
}

impl AuthChallengeCell {
    fn parse_body(header: CellHeader, body: &[u8]) -> Result<Self> {
        if body.len() < 34 {
            return Err(Error::BadPayloadData(
                "AUTH_CHALLENGE body too short".into(),
            ));
        }
        let mut challenge = [0u8; 32];
        challenge.copy_from_slice(&body[..32]);
        let n_methods = u16::from_be_bytes([body[32], body[33]]) as usize;
        if body.len() < 34 + n_methods * 2 {
            return Err(Error::BadPayloadData(
                "AUTH_CHALLENGE method list truncated".into(),
            ));
        }
        let methods = body[34..34 + n_methods * 2]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self {
            header,
            challenge,
            methods,
        })
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34 + self.methods.len() * 2);
        out.extend_from_slice(&self.challenge);
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for m in &self.methods {
            out.extend_from_slice(&m.to_be_bytes());
        }
        out
    }
}

/// AUTHENTICATE cell. Clients never originate one; the body is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateCell {
    pub header: CellHeader,
    pub payload: Vec<u8>,
}

/// AUTHORIZE cell, reserved by the protocol. Opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeCell {
    pub header: CellHeader,
    pub payload: Vec<u8>,
}
