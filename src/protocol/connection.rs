//! Link connection plumbing
//!
//! [`CellStream`] turns the raw byte stream of a TLS transport into typed
//! cells and back. [`Connection`] drives the link handshake over it, owns
//! the per-link circuit-id allocator, and serializes every outbound cell
//! into a single write queue, since the link is shared by all circuits.

use std::collections::HashSet;

use crate::error::{Error, Result};

use super::cell::{circ_id_len, Cell};
use super::handshake::LinkHandshake;

/// Incremental cell framer over a byte stream.
///
/// `feed` buffers transport bytes; `poll_cell` yields complete cells and
/// leaves partial ones buffered. RELAY and RELAY_EARLY payloads coming off
/// the wire are always still onion-encrypted, so they parse opaque.
pub struct CellStream {
    buffer: Vec<u8>,
    link_version: u8,
}

impl CellStream {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            // Pre-negotiation framing is the v3 layout.
            link_version: 3,
        }
    }

    pub fn link_version(&self) -> u8 {
        self.link_version
    }

    /// Switch header layout after version negotiation.
    pub fn set_link_version(&mut self, link_version: u8) {
        self.link_version = link_version;
    }

    /// Append transport bytes to the parse buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Parse the next complete cell, if the buffer holds one.
    pub fn poll_cell(&mut self) -> Result<Option<Cell>> {
        match Cell::parse_prefix(&self.buffer, self.link_version, true) {
            Ok((cell, used)) => {
                self.buffer.drain(..used);
                Ok(Some(cell))
            }
            Err(Error::NotEnoughBytes { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bytes buffered but not yet parsed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for CellStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates circuit ids unique to one link.
///
/// As the initiating side of a v4 link we must set the id's most
/// significant bit; v3 ids are 16 bits and merely need to be nonzero and
/// unused.
pub struct CircIdAllocator {
    link_version: u8,
    in_use: HashSet<u32>,
}

impl CircIdAllocator {
    pub fn new(link_version: u8) -> Self {
        Self {
            link_version,
            in_use: HashSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Result<u32> {
        let width = circ_id_len(self.link_version);
        for _ in 0..64 {
            let id = if width == 2 {
                (rand::random::<u16>() as u32) | 0x8000
            } else {
                rand::random::<u32>() | 0x8000_0000
            };
            if id != 0 && !self.in_use.contains(&id) {
                self.in_use.insert(id);
                return Ok(id);
            }
        }
        Err(Error::ResourceExhausted(
            "could not allocate a circuit id".into(),
        ))
    }

    pub fn release(&mut self, id: u32) {
        self.in_use.remove(&id);
    }
}

/// What a connection reports back to its driver after consuming bytes.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The link handshake finished at this link version.
    HandshakeComplete { link_version: u8 },
    /// A post-handshake cell for the circuit layer.
    Cell(Cell),
}

/// One TLS link to a relay: handshake, framing, id allocation, and the
/// serialized outbound byte queue.
pub struct Connection {
    cell_stream: CellStream,
    handshake: Option<LinkHandshake>,
    allocator: Option<CircIdAllocator>,
    peer_certs: Option<super::certs::CertsCell>,
    outbound: Vec<u8>,
    closed: bool,
}

impl Connection {
    /// Start a connection; the handshake's VERSIONS cell is queued for
    /// writing immediately.
    pub fn new(handshake: LinkHandshake) -> Self {
        let mut conn = Self {
            cell_stream: CellStream::new(),
            handshake: Some(handshake),
            allocator: None,
            peer_certs: None,
            outbound: Vec::new(),
            closed: false,
        };
        conn.pump_handshake();
        conn
    }

    pub fn is_ready(&self) -> bool {
        self.allocator.is_some() && !self.closed
    }

    pub fn link_version(&self) -> u8 {
        self.cell_stream.link_version()
    }

    /// Consume transport bytes, driving the handshake first and then
    /// handing circuit-layer cells up.
    pub fn feed(&mut self, bytes: &[u8], netinfo_timestamp: u32) -> Result<Vec<ConnectionEvent>> {
        if self.closed {
            return Err(Error::PeerClosed);
        }
        self.cell_stream.feed(bytes);

        let mut events = Vec::new();
        loop {
            let cell = match self.cell_stream.poll_cell() {
                Ok(Some(cell)) => cell,
                Ok(None) => break,
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            };

            if let Some(handshake) = self.handshake.as_mut() {
                handshake.handle_cell(cell, netinfo_timestamp)?;
                // Everything after the VERSIONS exchange, CERTS included,
                // already uses the negotiated header width.
                let link_version = handshake.link_version();
                self.cell_stream.set_link_version(link_version);
                let complete = handshake.is_complete();
                if complete {
                    self.allocator = Some(CircIdAllocator::new(link_version));
                    events.push(ConnectionEvent::HandshakeComplete { link_version });
                }
                self.pump_handshake();
                if complete {
                    if let Some(hs) = self.handshake.take() {
                        self.peer_certs = hs.peer_certs().cloned();
                    }
                }
            } else {
                events.push(ConnectionEvent::Cell(cell));
            }
        }
        Ok(events)
    }

    /// The peer's CERTS cell, available once the handshake has seen it.
    pub fn peer_certs(&self) -> Option<&super::certs::CertsCell> {
        self.peer_certs
            .as_ref()
            .or_else(|| self.handshake.as_ref().and_then(|h| h.peer_certs()))
    }

    /// Allocate a circuit id on this link.
    pub fn allocate_circ_id(&mut self) -> Result<u32> {
        match self.allocator.as_mut() {
            Some(alloc) => alloc.allocate(),
            None => Err(Error::InvalidState(
                "link handshake has not completed".into(),
            )),
        }
    }

    /// Return a circuit id to the pool once its circuit is gone.
    pub fn release_circ_id(&mut self, id: u32) {
        if let Some(alloc) = self.allocator.as_mut() {
            alloc.release(id);
        }
    }

    /// Queue one cell for the transport. Writes from all circuits funnel
    /// through here, keeping them serialized.
    pub fn send_cell(&mut self, cell: &Cell) -> Result<()> {
        if self.closed {
            return Err(Error::PeerClosed);
        }
        self.outbound.extend_from_slice(&cell.serialize());
        Ok(())
    }

    /// Drain bytes ready for the transport writer.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// The transport reported EOF or a fatal error.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn pump_handshake(&mut self) {
        if let Some(handshake) = self.handshake.as_mut() {
            for cell in handshake.take_outbound() {
                self.outbound.extend_from_slice(&cell.serialize());
            }
        }
    }
}
