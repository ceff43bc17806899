//! End-to-end tests driving the public protocol stack against a
//! relay-side counterpart built from the same primitives: link handshake,
//! three-hop circuit build, stream traffic, and the failure paths.

use std::net::Ipv4Addr;
use std::time::Instant;

use aes::Aes128;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use onion_core::protocol::{
    Cell, CellCommand, CellHeader, CellStream, Circuit, CircuitEvent, CircuitManager,
    CircuitState, Connection, ConnectionEvent, Created2Cell, EncryptedCell, ExitPolicy,
    ExitRequest, HopSpec, LinkHandshake, LinkSpecifier, NetinfoCell, RelayCell, RelayCommand,
    TlvAddress, VersionsCell,
};
use onion_core::protocol::certs::{CertsCell, RawCert};
use onion_core::Config;

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

fn hmac256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Relay-side crypto state for one hop, mirroring what the client derives.
struct HopCrypto {
    fwd_cipher: Aes128Ctr,
    back_cipher: Aes128Ctr,
    fwd_digest: Sha1,
    back_digest: Sha1,
}

impl HopCrypto {
    fn from_key_seed(key_seed: &[u8; 32]) -> Self {
        let hk = Hkdf::<Sha256>::from_prk(key_seed).unwrap();
        let mut okm = [0u8; 72];
        hk.expand(M_EXPAND, &mut okm).unwrap();

        let zero_iv = [0u8; 16];
        let kf: [u8; 16] = okm[40..56].try_into().unwrap();
        let kb: [u8; 16] = okm[56..72].try_into().unwrap();
        Self {
            fwd_cipher: Aes128Ctr::new((&kf).into(), (&zero_iv).into()),
            back_cipher: Aes128Ctr::new((&kb).into(), (&zero_iv).into()),
            fwd_digest: Sha1::new_with_prefix(&okm[0..20]),
            back_digest: Sha1::new_with_prefix(&okm[20..40]),
        }
    }

    fn peel_forward(&mut self, body: &mut [u8]) {
        self.fwd_cipher.apply_keystream(body);
    }

    /// Verify and parse an outbound cell addressed to this hop.
    fn accept_forward(&mut self, body: &[u8; 509]) -> RelayCell {
        let mut zeroed = *body;
        zeroed[5..9].fill(0);
        self.fwd_digest.update(zeroed);
        let tag = self.fwd_digest.clone().finalize();
        assert_eq!(&body[5..9], &tag[..4], "forward digest mismatch");
        RelayCell::parse_body(body).unwrap()
    }

    /// Originate a relay cell toward the client.
    fn originate_backward(&mut self, cell: &RelayCell) -> [u8; 509] {
        let mut body = cell.encode_body();
        body[5..9].fill(0);
        self.back_digest.update(body);
        let tag = self.back_digest.clone().finalize();
        body[5..9].copy_from_slice(&tag[..4]);
        self.back_cipher.apply_keystream(&mut body);
        body
    }

    fn wrap_backward(&mut self, body: &mut [u8]) {
        self.back_cipher.apply_keystream(body);
    }
}

/// One simulated relay.
struct TestRelay {
    node_id: [u8; 20],
    onion_secret: StaticSecret,
    crypto: Option<HopCrypto>,
}

impl TestRelay {
    fn new(tag: u8) -> Self {
        Self {
            node_id: [tag; 20],
            onion_secret: StaticSecret::random_from_rng(OsRng),
            crypto: None,
        }
    }

    fn onion_key(&self) -> PublicKey {
        PublicKey::from(&self.onion_secret)
    }

    fn hop_spec(&self, policy: Option<&str>) -> HopSpec {
        HopSpec {
            node_id: self.node_id,
            onion_key: self.onion_key(),
            link_specifiers: vec![
                LinkSpecifier::Ipv4 {
                    addr: Ipv4Addr::new(10, 0, 0, self.node_id[0]),
                    port: 9001,
                },
                LinkSpecifier::LegacyId(self.node_id),
            ],
            exit_policy: policy.map(|p| ExitPolicy::parse(p).unwrap()),
        }
    }

    /// Answer an NTor onion skin: install our crypto and produce the
    /// 64-byte reply.
    fn answer_skin(&mut self, skin: &[u8]) -> Vec<u8> {
        assert_eq!(skin.len(), 84);
        assert_eq!(&skin[0..20], &self.node_id, "skin names the wrong relay");
        let b_public = self.onion_key();
        assert_eq!(&skin[20..52], b_public.as_bytes());

        let mut x_bytes = [0u8; 32];
        x_bytes.copy_from_slice(&skin[52..84]);
        let client_public = PublicKey::from(x_bytes);

        let y_secret = StaticSecret::random_from_rng(OsRng);
        let y_public = PublicKey::from(&y_secret);

        let shared_xy = y_secret.diffie_hellman(&client_public);
        let shared_xb = self.onion_secret.diffie_hellman(&client_public);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(shared_xy.as_bytes());
        secret_input.extend_from_slice(shared_xb.as_bytes());
        secret_input.extend_from_slice(&self.node_id);
        secret_input.extend_from_slice(b_public.as_bytes());
        secret_input.extend_from_slice(client_public.as_bytes());
        secret_input.extend_from_slice(y_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac256(T_KEY, &secret_input);
        let verify = hmac256(T_VERIFY, &secret_input);

        let mut auth_input = Vec::new();
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.node_id);
        auth_input.extend_from_slice(b_public.as_bytes());
        auth_input.extend_from_slice(y_public.as_bytes());
        auth_input.extend_from_slice(client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");
        let auth = hmac256(T_MAC, &auth_input);

        self.crypto = Some(HopCrypto::from_key_seed(&key_seed));

        let mut reply = Vec::with_capacity(64);
        reply.extend_from_slice(y_public.as_bytes());
        reply.extend_from_slice(&auth);
        reply
    }
}

/// The responder half of the link handshake, as cell wire bytes.
fn responder_handshake_bytes(link_version: u8) -> Vec<u8> {
    let signer = SigningKey::from_bytes(&[11u8; 32]);
    let mut cert_body = vec![0x01, 4];
    cert_body.extend_from_slice(&u32::MAX.to_be_bytes());
    cert_body.push(0x01);
    cert_body.extend_from_slice(&signer.verifying_key().to_bytes());
    cert_body.push(0);
    let sig = signer.sign(&cert_body);
    cert_body.extend_from_slice(&sig.to_bytes());

    let certs = CertsCell {
        header: CellHeader::new(0, link_version),
        certs: vec![RawCert {
            cert_type: 4,
            data: cert_body,
        }],
    };
    let netinfo = NetinfoCell::make(
        0,
        0,
        TlvAddress::Ipv4(Ipv4Addr::new(203, 0, 113, 9)),
        vec![TlvAddress::Ipv4(Ipv4Addr::new(198, 51, 100, 7))],
        link_version,
    )
    .unwrap();

    let mut wire = Cell::Versions(VersionsCell::make(vec![3, 4, 5])).serialize();
    wire.extend_from_slice(&Cell::Certs(certs).serialize());
    wire.extend_from_slice(&Cell::Netinfo(netinfo).serialize());
    wire
}

/// Bring a [`Connection`] through the link handshake. Returns it ready
/// for circuits.
fn handshaken_connection() -> Connection {
    let peer = TlvAddress::Ipv4(Ipv4Addr::new(198, 51, 100, 7));
    let mut conn = Connection::new(LinkHandshake::new(peer));

    // The client speaks first with VERSIONS.
    let bytes = conn.take_outbound();
    let first = Cell::parse(&bytes, 3, true).unwrap();
    assert_eq!(first.command(), CellCommand::Versions);

    let events = conn.feed(&responder_handshake_bytes(4), 0).unwrap();
    assert!(matches!(
        events[..],
        [ConnectionEvent::HandshakeComplete { link_version: 4 }]
    ));
    assert!(conn.is_ready());

    // NETINFO reply drains to the transport.
    let reply = conn.take_outbound();
    assert_eq!(
        Cell::parse(&reply, 4, true).unwrap().command(),
        CellCommand::Netinfo
    );
    conn
}

/// Process the client's wire bytes at the relay chain and produce the
/// chain's response bytes.
fn relay_chain_respond(
    relays: &mut [TestRelay],
    wire: &[u8],
    link_version: u8,
    expect_early: bool,
) -> Vec<u8> {
    let mut stream = CellStream::new();
    stream.set_link_version(link_version);
    stream.feed(wire);

    let mut response = Vec::new();
    while let Some(cell) = stream.poll_cell().unwrap() {
        match cell {
            Cell::Create2(create) => {
                let circ_id = create.header.circ_id;
                let reply = relays[0].answer_skin(&create.hdata);
                let created = Created2Cell::make(circ_id, 64, reply, link_version).unwrap();
                response.extend_from_slice(&Cell::Created2(created).serialize());
            }
            Cell::Encrypted(enc) => {
                let circ_id = enc.header.circ_id;
                if expect_early {
                    assert_eq!(enc.command(), CellCommand::RelayEarly);
                }
                // Peel until some built hop recognizes the cell.
                let mut body = [0u8; 509];
                body.copy_from_slice(&enc.payload);
                let built = relays.iter().filter(|r| r.crypto.is_some()).count();
                let owner = built - 1;
                for relay in relays[..built].iter_mut() {
                    relay.crypto.as_mut().unwrap().peel_forward(&mut body);
                }
                let relay_cell = relays[owner].crypto.as_mut().unwrap().accept_forward(&body);

                match relay_cell.command {
                    RelayCommand::Extend2 => {
                        let skin = &relay_cell.data[relay_cell.data.len() - 84..];
                        let (fwd, target) = relays.split_at_mut(owner + 1);
                        let reply = target[0].answer_skin(skin);

                        let mut extended = vec![0x00, 0x40];
                        extended.extend_from_slice(&reply);
                        let cell =
                            RelayCell::new(RelayCommand::Extended2, 0, extended).unwrap();
                        let mut body =
                            fwd[owner].crypto.as_mut().unwrap().originate_backward(&cell);
                        for relay in fwd[..owner].iter_mut().rev() {
                            relay.crypto.as_mut().unwrap().wrap_backward(&mut body);
                        }
                        let enc =
                            EncryptedCell::make(circ_id, body.to_vec(), link_version, false)
                                .unwrap();
                        response.extend_from_slice(&Cell::Encrypted(enc).serialize());
                    }
                    RelayCommand::Begin => {
                        let cell =
                            RelayCell::new(RelayCommand::Connected, relay_cell.stream_id, vec![])
                                .unwrap();
                        let last = relays.len() - 1;
                        let mut body =
                            relays[last].crypto.as_mut().unwrap().originate_backward(&cell);
                        for relay in relays[..last].iter_mut().rev() {
                            relay.crypto.as_mut().unwrap().wrap_backward(&mut body);
                        }
                        let enc =
                            EncryptedCell::make(circ_id, body.to_vec(), link_version, false)
                                .unwrap();
                        response.extend_from_slice(&Cell::Encrypted(enc).serialize());
                    }
                    RelayCommand::Data => {
                        // Echo the payload back on the same stream.
                        let cell =
                            RelayCell::data(relay_cell.stream_id, relay_cell.data.clone())
                                .unwrap();
                        let last = relays.len() - 1;
                        let mut body =
                            relays[last].crypto.as_mut().unwrap().originate_backward(&cell);
                        for relay in relays[..last].iter_mut().rev() {
                            relay.crypto.as_mut().unwrap().wrap_backward(&mut body);
                        }
                        let enc =
                            EncryptedCell::make(circ_id, body.to_vec(), link_version, false)
                                .unwrap();
                        response.extend_from_slice(&Cell::Encrypted(enc).serialize());
                    }
                    RelayCommand::End => {}
                    other => panic!("relay chain got unexpected {:?}", other),
                }
            }
            Cell::Destroy(_) => {}
            other => panic!("relay chain got unexpected {:?}", other.command()),
        }
    }
    response
}

/// Pump client outbound cells through the relay chain and feed the
/// responses back, until the link goes quiet. Returns all circuit events.
fn pump(
    conn: &mut Connection,
    manager: &mut CircuitManager,
    relays: &mut [TestRelay],
    now: Instant,
    expect_early: bool,
) -> Vec<(u32, CircuitEvent)> {
    let mut events = Vec::new();
    loop {
        for cell in manager.take_outbound() {
            conn.send_cell(&cell).unwrap();
        }
        if !conn.has_outbound() {
            break;
        }
        let wire = conn.take_outbound();
        let response = relay_chain_respond(relays, &wire, conn.link_version(), expect_early);
        if response.is_empty() {
            break;
        }
        for event in conn.feed(&response, 0).unwrap() {
            match event {
                ConnectionEvent::Cell(cell) => {
                    events.extend(manager.deliver(cell, now).unwrap());
                }
                ConnectionEvent::HandshakeComplete { .. } => unreachable!(),
            }
        }
    }
    events
}

fn build_circuit(
    conn: &mut Connection,
    manager: &mut CircuitManager,
    relays: &mut [TestRelay],
    now: Instant,
) -> u32 {
    let hops: Vec<HopSpec> = relays
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let policy = (i == relays.len() - 1)
                .then_some("accept *:80\naccept *:443\nreject *:*");
            r.hop_spec(policy)
        })
        .collect();

    let circ_id = conn.allocate_circ_id().unwrap();
    let mut circuit = Circuit::new(circ_id, conn.link_version(), hops, Config::default()).unwrap();
    circuit.start(now).unwrap();
    manager.insert(circuit);

    let events = pump(conn, manager, relays, now, true);
    assert!(
        events.contains(&(circ_id, CircuitEvent::Opened)),
        "circuit never opened: {:?}",
        events
    );
    circ_id
}

#[test]
fn test_link_handshake_completes() {
    let conn = handshaken_connection();
    assert_eq!(conn.link_version(), 4);
    assert!(conn.peer_certs().is_some());
}

#[test]
fn test_three_hop_build_and_policy() {
    let mut conn = handshaken_connection();
    let mut manager = CircuitManager::new();
    let mut relays = vec![TestRelay::new(1), TestRelay::new(2), TestRelay::new(3)];
    let now = Instant::now();

    let circ_id = build_circuit(&mut conn, &mut manager, &mut relays, now);
    let circuit = manager.get_mut(circ_id).unwrap();
    assert_eq!(circuit.state(), CircuitState::Open);
    assert_eq!(circuit.hop_count(), 3);

    // Open circuits consult the exit policy.
    assert!(circuit.can_handle_request(&ExitRequest::host("example.com", 443)));
    assert!(!circuit.can_handle_request(&ExitRequest::host("example.com", 25)));
    assert_eq!(
        manager.find_circuit_for(&ExitRequest::host("example.com", 443)),
        Some(circ_id)
    );
    assert_eq!(
        manager.find_circuit_for(&ExitRequest::host("example.com", 25)),
        None
    );
}

#[test]
fn test_stream_through_circuit() {
    let mut conn = handshaken_connection();
    let mut manager = CircuitManager::new();
    let mut relays = vec![TestRelay::new(1), TestRelay::new(2), TestRelay::new(3)];
    let now = Instant::now();

    let circ_id = build_circuit(&mut conn, &mut manager, &mut relays, now);

    // Attach a stream; the exit answers CONNECTED.
    let stream_id = manager
        .get_mut(circ_id)
        .unwrap()
        .attach_stream(ExitRequest::host("example.com", 80), now)
        .unwrap();
    let events = pump(&mut conn, &mut manager, &mut relays, now, false);
    assert!(events.contains(&(circ_id, CircuitEvent::StreamConnected { stream_id })));

    // Send data; the fake exit echoes it.
    manager
        .get_mut(circ_id)
        .unwrap()
        .stream_send(stream_id, b"ping")
        .unwrap();
    let events = pump(&mut conn, &mut manager, &mut relays, now, false);
    assert!(events.contains(&(
        circ_id,
        CircuitEvent::StreamData {
            stream_id,
            data: b"ping".to_vec(),
        }
    )));
}

#[test]
fn test_large_write_chunks_into_cells() {
    let mut conn = handshaken_connection();
    let mut manager = CircuitManager::new();
    let mut relays = vec![TestRelay::new(1), TestRelay::new(2), TestRelay::new(3)];
    let now = Instant::now();

    let circ_id = build_circuit(&mut conn, &mut manager, &mut relays, now);
    let stream_id = manager
        .get_mut(circ_id)
        .unwrap()
        .attach_stream(ExitRequest::host("example.com", 80), now)
        .unwrap();
    pump(&mut conn, &mut manager, &mut relays, now, false);

    // 1000 bytes does not fit one 498-byte relay payload.
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    manager
        .get_mut(circ_id)
        .unwrap()
        .stream_send(stream_id, &payload)
        .unwrap();
    let events = pump(&mut conn, &mut manager, &mut relays, now, false);

    let mut echoed = Vec::new();
    for (_, event) in events {
        if let CircuitEvent::StreamData { data, .. } = event {
            echoed.extend_from_slice(&data);
        }
    }
    assert_eq!(echoed, payload);
}

#[test]
fn test_tampered_relay_cell_is_dropped_silently() {
    let mut conn = handshaken_connection();
    let mut manager = CircuitManager::new();
    let mut relays = vec![TestRelay::new(1), TestRelay::new(2), TestRelay::new(3)];
    let now = Instant::now();

    let circ_id = build_circuit(&mut conn, &mut manager, &mut relays, now);

    // A garbage RELAY cell must neither kill the circuit nor produce
    // output: no DESTROY, no error, nothing echoed to the network.
    let enc = EncryptedCell::make(circ_id, vec![0x99; 509], 4, false).unwrap();
    let events = manager.deliver(Cell::Encrypted(enc), now).unwrap();
    assert!(events.is_empty());
    let circuit = manager.get_mut(circ_id).unwrap();
    assert_eq!(circuit.state(), CircuitState::Open);
    assert!(manager.take_outbound().is_empty());
}

#[test]
fn test_peer_destroy_tears_circuit_down() {
    let mut conn = handshaken_connection();
    let mut manager = CircuitManager::new();
    let mut relays = vec![TestRelay::new(1), TestRelay::new(2), TestRelay::new(3)];
    let now = Instant::now();

    let circ_id = build_circuit(&mut conn, &mut manager, &mut relays, now);

    let destroy =
        onion_core::protocol::DestroyCell::make(circ_id, 3, conn.link_version()).unwrap();
    let events = manager.deliver(Cell::Destroy(destroy), now).unwrap();
    assert!(events.contains(&(
        circ_id,
        CircuitEvent::Destroyed {
            reason: 3,
            by_peer: true,
        }
    )));
    assert_eq!(manager.reap_destroyed(), vec![circ_id]);
    conn.release_circ_id(circ_id);
}
