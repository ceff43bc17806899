//! Circuit state machine
//!
//! A circuit is built hop by hop: CREATE2 to the guard, then EXTEND2 relay
//! cells (RELAY_EARLY on the wire) through the partial circuit to each
//! following hop. Every completed NTor exchange installs a fresh
//! [`RelayCrypto`](super::crypto::RelayCrypto) state, and once the last hop
//! answers, the circuit opens for streams.
//!
//! All methods run on the owning connection's cooperative loop; cells are
//! delivered in wire order and no two cells of one circuit are ever
//! processed concurrently, so the cipher and digest states need no
//! locking.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use x25519_dalek::PublicKey;

use crate::config::Config;
use crate::error::{Error, Result};

use super::cell::{Cell, Create2Cell, DestroyCell, EncryptedCell, DESTROY_REASON_NONE, NTOR_HLEN, NTOR_HTYPE};
use super::crypto::CircuitPath;
use super::exitrequest::{ExitPolicy, ExitRequest};
use super::flow_control::CircuitFlowControl;
use super::ntor::NtorHandshake;
use super::relay::{
    LinkSpecifier, RelayCell, RelayCommand, END_REASON_DESTROY, END_REASON_TIMEOUT,
    MAX_RPAYLOAD_LEN,
};
use super::stream::{StreamId, StreamMap, StreamState};

/// RELAY_EARLY cells permitted per circuit.
const RELAY_EARLY_BUDGET: u8 = 8;

/// One planned hop of a circuit.
#[derive(Clone)]
pub struct HopSpec {
    /// The relay's RSA identity fingerprint.
    pub node_id: [u8; 20],

    /// The relay's ntor onion key.
    pub onion_key: PublicKey,

    /// How the previous hop reaches this relay. Unused for the first hop,
    /// required for every extension.
    pub link_specifiers: Vec<LinkSpecifier>,

    /// The relay's published exit policy; only consulted on the last hop.
    pub exit_policy: Option<ExitPolicy>,
}

/// Circuit lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Created, not yet started on a link.
    Pending,
    /// Mid-build, waiting for hop `hop`'s handshake reply.
    Building { hop: usize },
    /// Carrying streams.
    Open,
    /// Write side congested; refusing new requests.
    Buffering,
    /// Terminal.
    Destroyed,
}

/// What a circuit tells its owner after processing input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    /// The last hop completed; streams may attach.
    Opened,
    /// A stream saw CONNECTED.
    StreamConnected { stream_id: StreamId },
    /// Stream payload arrived.
    StreamData { stream_id: StreamId, data: Vec<u8> },
    /// A stream ended (peer END, timeout, or circuit death).
    StreamEnded { stream_id: StreamId, reason: u8 },
    /// The circuit reached its terminal state.
    Destroyed { reason: u8, by_peer: bool },
}

/// Client circuit over one link connection.
pub struct Circuit {
    id: u32,
    link_version: u8,
    state: CircuitState,
    config: Config,

    /// Planned path, guard first.
    hops: Vec<HopSpec>,

    /// Installed per-hop crypto, guard first.
    path: CircuitPath,

    /// The single NTor exchange in flight, if any.
    pending_handshake: Option<NtorHandshake>,

    relay_early_remaining: u8,
    streams: StreamMap,
    flow: CircuitFlowControl,

    /// Relay cells queued while the circuit is still building.
    pending_cells: VecDeque<RelayCell>,

    /// Cells ready for the link writer.
    outbound: VecDeque<Cell>,

    build_deadline: Option<Instant>,
    hop_deadline: Option<Instant>,
}

impl Circuit {
    /// Create a circuit in `Pending` state over an already-handshaken
    /// link.
    pub fn new(id: u32, link_version: u8, hops: Vec<HopSpec>, config: Config) -> Result<Self> {
        if hops.is_empty() || hops.len() > super::crypto::MAX_HOPS {
            return Err(Error::InvalidState(format!(
                "a circuit needs 1 to {} hops, got {}",
                super::crypto::MAX_HOPS,
                hops.len()
            )));
        }
        let max_streams = config.max_streams_per_circuit;
        Ok(Self {
            id,
            link_version,
            state: CircuitState::Pending,
            config,
            hops,
            path: CircuitPath::new(),
            pending_handshake: None,
            relay_early_remaining: RELAY_EARLY_BUDGET,
            streams: StreamMap::new(max_streams),
            flow: CircuitFlowControl::new(),
            pending_cells: VecDeque::new(),
            outbound: VecDeque::new(),
            build_deadline: None,
            hop_deadline: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn hop_count(&self) -> usize {
        self.path.len()
    }

    /// Begin building: CREATE2 to the first hop.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != CircuitState::Pending {
            return Err(Error::InvalidState(format!(
                "cannot start a circuit in state {:?}",
                self.state
            )));
        }

        let first = &self.hops[0];
        let handshake = NtorHandshake::new(first.node_id, first.onion_key);
        let create2 = Create2Cell::make(
            self.id,
            NTOR_HTYPE,
            NTOR_HLEN,
            handshake.onion_skin(),
            self.link_version,
        )?;

        self.pending_handshake = Some(handshake);
        self.outbound.push_back(Cell::Create2(create2));
        self.state = CircuitState::Building { hop: 0 };
        self.build_deadline = Some(now + self.config.circuit_build_timeout);
        self.hop_deadline = Some(now + self.config.hop_extend_timeout);
        log::debug!("circuit {}: CREATE2 sent to hop 0", self.id);
        Ok(())
    }

    /// Feed one inbound cell addressed to this circuit.
    pub fn deliver_cell(&mut self, cell: Cell, now: Instant) -> Result<Vec<CircuitEvent>> {
        if self.state == CircuitState::Destroyed {
            return Ok(Vec::new());
        }

        match cell {
            Cell::Created2(created) => {
                let mut events = Vec::new();
                match self.state {
                    CircuitState::Building { hop: 0 } => {
                        self.advance_build(&created.hdata, now, &mut events)?;
                    }
                    _ => self.protocol_violation("unexpected CREATED2", &mut events),
                }
                Ok(events)
            }
            Cell::Encrypted(enc) => self.deliver_encrypted(enc, now),
            Cell::Destroy(destroy) => {
                let mut events = Vec::new();
                log::debug!(
                    "circuit {}: peer sent DESTROY (reason {})",
                    self.id,
                    destroy.reason
                );
                self.teardown(destroy.reason, true, &mut events);
                Ok(events)
            }
            Cell::Padding(_) | Cell::Vpadding(_) => Ok(Vec::new()),
            other => {
                let mut events = Vec::new();
                log::debug!(
                    "circuit {}: unexpected {:?} cell",
                    self.id,
                    other.command()
                );
                self.protocol_violation("unexpected cell command on circuit", &mut events);
                Ok(events)
            }
        }
    }

    fn deliver_encrypted(
        &mut self,
        enc: EncryptedCell,
        now: Instant,
    ) -> Result<Vec<CircuitEvent>> {
        let mut events = Vec::new();

        if self.path.is_empty() {
            self.protocol_violation("RELAY cell before any hop is installed", &mut events);
            return Ok(events);
        }

        let (relay, origin) = match self.path.decrypt_until_recognized(&enc) {
            Ok(decoded) => decoded,
            Err(Error::UnrecognizedCell) => {
                if matches!(self.state, CircuitState::Building { .. }) {
                    // During the build every inbound cell must come from
                    // the path; anything else is a broken handshake.
                    self.teardown_local(&mut events);
                }
                // Once open: dropped silently, never echoed, content never
                // logged.
                return Ok(events);
            }
            Err(_) => {
                self.protocol_violation("undecodable relay cell", &mut events);
                return Ok(events);
            }
        };

        self.dispatch_relay(relay, origin, now, &mut events)?;
        Ok(events)
    }

    fn dispatch_relay(
        &mut self,
        relay: RelayCell,
        origin: usize,
        now: Instant,
        events: &mut Vec<CircuitEvent>,
    ) -> Result<()> {
        let exit_index = self.path.len().saturating_sub(1);

        match relay.command {
            RelayCommand::Extended2 => {
                let building_hop = match self.state {
                    CircuitState::Building { hop } if hop > 0 => hop,
                    _ => {
                        self.protocol_violation("unexpected EXTENDED2", events);
                        return Ok(());
                    }
                };
                if origin != exit_index {
                    self.protocol_violation("EXTENDED2 from a non-terminal hop", events);
                    return Ok(());
                }
                log::debug!(
                    "circuit {}: EXTENDED2 from hop {} for hop {}",
                    self.id,
                    origin,
                    building_hop
                );
                let reply = match relay.parse_extended2() {
                    Ok(r) => r.to_vec(),
                    Err(_) => {
                        self.teardown_local(events);
                        return Ok(());
                    }
                };
                self.advance_build(&reply, now, events)?;
            }

            RelayCommand::Data => {
                if !self.stream_known(relay.stream_id) {
                    self.unknown_stream(relay.stream_id, origin, exit_index, events);
                    return Ok(());
                }
                let stream_sendme = self
                    .streams
                    .get_mut(relay.stream_id)
                    .map(|e| e.flow.on_receive())
                    .unwrap_or(false);
                let circuit_sendme = self.flow.on_receive();

                if stream_sendme {
                    self.queue_relay_cell(RelayCell::sendme(relay.stream_id)?, false)?;
                }
                if circuit_sendme {
                    self.queue_relay_cell(RelayCell::sendme(0)?, false)?;
                }
                events.push(CircuitEvent::StreamData {
                    stream_id: relay.stream_id,
                    data: relay.data,
                });
            }

            RelayCommand::Connected => {
                if !self.stream_known(relay.stream_id) {
                    self.unknown_stream(relay.stream_id, origin, exit_index, events);
                    return Ok(());
                }
                match self.streams.mark_connected(relay.stream_id) {
                    Ok(()) => events.push(CircuitEvent::StreamConnected {
                        stream_id: relay.stream_id,
                    }),
                    Err(_) => self.protocol_violation("CONNECTED for a non-opening stream", events),
                }
            }

            RelayCommand::End => {
                if self.streams.mark_remote_end(relay.stream_id) {
                    events.push(CircuitEvent::StreamEnded {
                        stream_id: relay.stream_id,
                        reason: relay.end_reason().unwrap_or(0),
                    });
                } else {
                    self.unknown_stream(relay.stream_id, origin, exit_index, events);
                }
            }

            RelayCommand::Sendme => {
                if relay.stream_id == 0 {
                    self.flow.on_sendme_received();
                } else if let Some(entry) = self.streams.get_mut(relay.stream_id) {
                    entry.flow.on_sendme_received();
                }
                // A SENDME for a stream that died recently is ignored.
            }

            RelayCommand::Truncated => {
                let reason = relay.data.first().copied().unwrap_or(DESTROY_REASON_NONE);
                log::debug!("circuit {}: TRUNCATED (reason {})", self.id, reason);
                self.teardown(reason, true, events);
            }

            RelayCommand::Drop => {
                // Long-range padding; nothing to do.
            }

            _ => {
                self.protocol_violation("unexpected relay command", events);
            }
        }
        Ok(())
    }

    /// Complete the pending NTor exchange with `reply` and either extend
    /// to the next hop or open the circuit.
    fn advance_build(
        &mut self,
        reply: &[u8],
        now: Instant,
        events: &mut Vec<CircuitEvent>,
    ) -> Result<()> {
        let handshake = match self.pending_handshake.take() {
            Some(h) => h,
            None => {
                self.protocol_violation("handshake reply with no handshake in flight", events);
                return Ok(());
            }
        };

        let keys = match handshake.complete(reply) {
            Ok(k) => k,
            Err(e) => {
                log::debug!("circuit {}: handshake failed: {}", self.id, e);
                self.teardown_local(events);
                return Ok(());
            }
        };
        self.path.add_hop(&keys)?;

        if self.path.len() == self.hops.len() {
            self.state = CircuitState::Open;
            self.build_deadline = None;
            self.hop_deadline = None;
            log::debug!("circuit {}: open with {} hops", self.id, self.path.len());
            events.push(CircuitEvent::Opened);
            self.flush_pending_cells()?;
            return Ok(());
        }

        // Extend to the next hop through the hops built so far.
        let next_index = self.path.len();
        let next = self.hops[next_index].clone();
        if next.link_specifiers.is_empty() {
            log::debug!(
                "circuit {}: hop {} has no link specifiers",
                self.id,
                next_index
            );
            self.teardown_local(events);
            return Ok(());
        }

        let handshake = NtorHandshake::new(next.node_id, next.onion_key);
        let extend2 = RelayCell::extend2(&next.link_specifiers, handshake.onion_skin())?;
        self.pending_handshake = Some(handshake);
        // Circuit extension must ride RELAY_EARLY.
        self.queue_relay_cell(extend2, true)?;

        self.state = CircuitState::Building { hop: next_index };
        self.hop_deadline = Some(now + self.config.hop_extend_timeout);
        log::debug!(
            "circuit {}: EXTEND2 sent for hop {}",
            self.id,
            next_index
        );
        Ok(())
    }

    /// Whether this circuit could carry `request`, per its state and the
    /// exit hop's policy.
    pub fn can_handle_request(&self, request: &ExitRequest) -> bool {
        match self.state {
            CircuitState::Buffering | CircuitState::Destroyed => false,
            CircuitState::Pending | CircuitState::Building { .. } => {
                if request.is_host() {
                    true
                } else {
                    self.planned_exit_admits_addr(request.is_ipv6())
                }
            }
            CircuitState::Open => match self.exit_policy() {
                Some(policy) => {
                    if request.is_host() || self.planned_exit_admits_addr(request.is_ipv6()) {
                        policy.allows(request)
                    } else {
                        false
                    }
                }
                None => false,
            },
        }
    }

    /// Attach a stream for `request`. While the circuit is still building
    /// the BEGIN is parked and flushed on open.
    pub fn attach_stream(&mut self, request: ExitRequest, now: Instant) -> Result<StreamId> {
        match self.state {
            CircuitState::Destroyed => {
                return Err(Error::InvalidState("circuit is destroyed".into()))
            }
            CircuitState::Buffering => {
                return Err(Error::ResourceExhausted("circuit is buffering".into()))
            }
            CircuitState::Open => {
                if !self.can_handle_request(&request) {
                    return Err(Error::PolicyRejected);
                }
            }
            CircuitState::Pending | CircuitState::Building { .. } => {
                if !self.can_handle_request(&request) {
                    return Err(Error::PolicyRejected);
                }
            }
        }

        let deadline = now + self.config.stream_connect_timeout;
        let (host, port) = request.begin_target();
        let stream_id = self.streams.allocate(request, Some(deadline))?;
        let begin = RelayCell::begin(stream_id, &host, port)?;
        self.queue_or_park(begin)?;
        log::debug!(
            "circuit {}: stream {} BEGIN to {}:{}",
            self.id,
            stream_id,
            host,
            port
        );
        Ok(stream_id)
    }

    /// Send stream bytes, chunked into DATA cells.
    pub fn stream_send(&mut self, stream_id: StreamId, bytes: &[u8]) -> Result<()> {
        let state = self
            .streams
            .get(stream_id)
            .map(|e| e.state)
            .ok_or_else(|| Error::Stream(format!("unknown stream id {}", stream_id)))?;
        if !matches!(state, StreamState::Opening | StreamState::Open) {
            return Err(Error::Stream(format!(
                "stream {} is {:?}",
                stream_id, state
            )));
        }

        for chunk in bytes.chunks(MAX_RPAYLOAD_LEN) {
            if let Some(entry) = self.streams.get_mut(stream_id) {
                entry.flow.on_send()?;
            }
            self.flow.on_send()?;
            let cell = RelayCell::data(stream_id, chunk.to_vec())?;
            self.queue_or_park(cell)?;
        }
        Ok(())
    }

    /// Half-close a stream with an END cell.
    pub fn stream_end(&mut self, stream_id: StreamId, reason: u8) -> Result<()> {
        if !self.streams.contains(stream_id) {
            return Err(Error::Stream(format!("unknown stream id {}", stream_id)));
        }
        let end = RelayCell::end(stream_id, reason)?;
        self.queue_or_park(end)?;
        self.streams.mark_local_end(stream_id);
        Ok(())
    }

    /// Enforce deadlines. Returns the events produced by expiries.
    pub fn tick(&mut self, now: Instant) -> Vec<CircuitEvent> {
        let mut events = Vec::new();
        if self.state == CircuitState::Destroyed {
            return events;
        }

        if matches!(self.state, CircuitState::Building { .. } | CircuitState::Pending) {
            let hop_expired = self.hop_deadline.map(|d| now >= d).unwrap_or(false);
            let build_expired = self.build_deadline.map(|d| now >= d).unwrap_or(false);
            if hop_expired || build_expired {
                log::debug!("circuit {}: build timed out", self.id);
                self.teardown_local(&mut events);
                return events;
            }
        }

        for stream_id in self.streams.expired_connects(now) {
            log::debug!(
                "circuit {}: stream {} connect timed out",
                self.id,
                stream_id
            );
            if let Ok(end) = RelayCell::end(stream_id, END_REASON_TIMEOUT) {
                let _ = self.queue_or_park(end);
            }
            self.streams.mark_remote_end(stream_id);
            events.push(CircuitEvent::StreamEnded {
                stream_id,
                reason: END_REASON_TIMEOUT,
            });
        }
        events
    }

    /// Close locally: DESTROY upstream with reason NONE, fail streams.
    pub fn close(&mut self) -> Vec<CircuitEvent> {
        let mut events = Vec::new();
        if self.state != CircuitState::Destroyed {
            self.teardown_local(&mut events);
        }
        events
    }

    /// The link's write side is (un)congested.
    pub fn set_buffering(&mut self, buffering: bool) {
        self.state = match (self.state, buffering) {
            (CircuitState::Open, true) => CircuitState::Buffering,
            (CircuitState::Buffering, false) => CircuitState::Open,
            (s, _) => s,
        };
    }

    /// The link itself died; fail everything without sending DESTROY.
    pub fn on_peer_closed(&mut self) -> Vec<CircuitEvent> {
        let mut events = Vec::new();
        if self.state != CircuitState::Destroyed {
            self.teardown(DESTROY_REASON_NONE, true, &mut events);
        }
        events
    }

    /// Drain cells ready for the link writer.
    pub fn take_outbound(&mut self) -> Vec<Cell> {
        self.outbound.drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn exit_policy(&self) -> Option<&ExitPolicy> {
        self.hops.last().and_then(|h| h.exit_policy.as_ref())
    }

    /// Whether the planned exit plausibly speaks the request's address
    /// family, judged from its link specifiers.
    fn planned_exit_admits_addr(&self, want_v6: bool) -> bool {
        let exit = match self.hops.last() {
            Some(h) => h,
            None => return false,
        };
        if exit.link_specifiers.is_empty() {
            // No addressing information recorded; assume v4.
            return !want_v6;
        }
        let has_v4 = exit
            .link_specifiers
            .iter()
            .any(|l| matches!(l, LinkSpecifier::Ipv4 { .. }));
        let has_v6 = exit
            .link_specifiers
            .iter()
            .any(|l| matches!(l, LinkSpecifier::Ipv6 { .. }));
        if want_v6 {
            has_v6
        } else {
            has_v4 || !has_v6
        }
    }

    fn stream_known(&self, stream_id: StreamId) -> bool {
        stream_id != 0 && self.streams.contains(stream_id)
    }

    /// Unknown stream id: from the exit this may be residue of a closed
    /// stream and is ignored; from any other hop it is a violation.
    fn unknown_stream(
        &mut self,
        stream_id: StreamId,
        origin: usize,
        exit_index: usize,
        events: &mut Vec<CircuitEvent>,
    ) {
        if origin == exit_index {
            log::debug!(
                "circuit {}: dropping cell for unknown stream {}",
                self.id,
                stream_id
            );
        } else {
            self.protocol_violation("cell for unknown stream from inner hop", events);
        }
    }

    /// Queue a relay cell, or park it until the circuit opens.
    fn queue_or_park(&mut self, cell: RelayCell) -> Result<()> {
        match self.state {
            CircuitState::Open | CircuitState::Buffering => self.queue_relay_cell(cell, false),
            CircuitState::Pending | CircuitState::Building { .. } => {
                if self.pending_cells.len() >= self.config.max_queued_cells {
                    return Err(Error::ResourceExhausted(
                        "too many cells queued while building".into(),
                    ));
                }
                self.pending_cells.push_back(cell);
                Ok(())
            }
            CircuitState::Destroyed => Err(Error::InvalidState("circuit is destroyed".into())),
        }
    }

    fn flush_pending_cells(&mut self) -> Result<()> {
        while let Some(cell) = self.pending_cells.pop_front() {
            self.queue_relay_cell(cell, false)?;
        }
        Ok(())
    }

    /// Onion-encrypt `cell` to the last installed hop and queue it.
    fn queue_relay_cell(&mut self, cell: RelayCell, early: bool) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::InvalidState(
                "no hops installed to encrypt toward".into(),
            ));
        }
        if early {
            if self.relay_early_remaining == 0 {
                return Err(Error::ResourceExhausted(
                    "RELAY_EARLY budget exhausted".into(),
                ));
            }
            self.relay_early_remaining -= 1;
        }
        let target = self.path.len() - 1;
        let enc = self
            .path
            .encrypt_to_target(&cell, self.id, self.link_version, target, early)?;
        self.outbound.push_back(Cell::Encrypted(enc));
        Ok(())
    }

    /// A protocol violation destroys the circuit with reason NONE.
    fn protocol_violation(&mut self, what: &str, events: &mut Vec<CircuitEvent>) {
        log::debug!("circuit {}: {}", self.id, what);
        self.teardown_local(events);
    }

    fn teardown_local(&mut self, events: &mut Vec<CircuitEvent>) {
        self.teardown(DESTROY_REASON_NONE, false, events);
    }

    fn teardown(&mut self, reason: u8, by_peer: bool, events: &mut Vec<CircuitEvent>) {
        self.state = CircuitState::Destroyed;
        self.pending_handshake = None;
        self.pending_cells.clear();
        self.outbound.clear();
        self.build_deadline = None;
        self.hop_deadline = None;

        for stream_id in self.streams.drain_all() {
            events.push(CircuitEvent::StreamEnded {
                stream_id,
                reason: END_REASON_DESTROY,
            });
        }

        if !by_peer {
            // Always reason NONE on the wire, whatever actually happened.
            if let Ok(destroy) = DestroyCell::make(self.id, DESTROY_REASON_NONE, self.link_version)
            {
                self.outbound.push_back(Cell::Destroy(destroy));
            }
        }
        events.push(CircuitEvent::Destroyed { reason, by_peer });
        log::debug!(
            "circuit {}: destroyed (reason {}, by_peer: {})",
            self.id,
            reason,
            by_peer
        );
    }
}

/// Tables of the circuits multiplexed on one link, keyed by circuit id.
#[derive(Default)]
pub struct CircuitManager {
    circuits: HashMap<u32, Circuit>,
}

impl CircuitManager {
    pub fn new() -> Self {
        Self {
            circuits: HashMap::new(),
        }
    }

    pub fn insert(&mut self, circuit: Circuit) {
        self.circuits.insert(circuit.id(), circuit);
    }

    pub fn get_mut(&mut self, circ_id: u32) -> Option<&mut Circuit> {
        self.circuits.get_mut(&circ_id)
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    /// Route one inbound cell to its circuit. Cells for unknown circuit
    /// ids are dropped.
    pub fn deliver(&mut self, cell: Cell, now: Instant) -> Result<Vec<(u32, CircuitEvent)>> {
        let circ_id = cell.circ_id();
        match self.circuits.get_mut(&circ_id) {
            Some(circuit) => {
                let events = circuit.deliver_cell(cell, now)?;
                Ok(events.into_iter().map(|e| (circ_id, e)).collect())
            }
            None => {
                log::debug!("dropping cell for unknown circuit {}", circ_id);
                Ok(Vec::new())
            }
        }
    }

    /// First circuit able to carry `request`, preferring open circuits
    /// over ones still building.
    pub fn find_circuit_for(&self, request: &ExitRequest) -> Option<u32> {
        let open = self
            .circuits
            .values()
            .find(|c| c.state() == CircuitState::Open && c.can_handle_request(request));
        if let Some(c) = open {
            return Some(c.id());
        }
        self.circuits
            .values()
            .find(|c| c.can_handle_request(request))
            .map(|c| c.id())
    }

    /// Enforce deadlines on every circuit.
    pub fn tick(&mut self, now: Instant) -> Vec<(u32, CircuitEvent)> {
        let mut events = Vec::new();
        for (id, circuit) in self.circuits.iter_mut() {
            for event in circuit.tick(now) {
                events.push((*id, event));
            }
        }
        events
    }

    /// The link died underneath us.
    pub fn on_peer_closed(&mut self) -> Vec<(u32, CircuitEvent)> {
        let mut events = Vec::new();
        for (id, circuit) in self.circuits.iter_mut() {
            for event in circuit.on_peer_closed() {
                events.push((*id, event));
            }
        }
        events
    }

    /// Drain outbound cells across circuits, per-circuit order preserved.
    pub fn take_outbound(&mut self) -> Vec<Cell> {
        let mut cells = Vec::new();
        for circuit in self.circuits.values_mut() {
            cells.extend(circuit.take_outbound());
        }
        cells
    }

    /// Drop circuits that reached their terminal state.
    pub fn reap_destroyed(&mut self) -> Vec<u32> {
        let dead: Vec<u32> = self
            .circuits
            .iter()
            .filter(|(_, c)| c.state() == CircuitState::Destroyed && !c.has_outbound())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.circuits.remove(id);
        }
        dead
    }
}
