//! Link-layer handshake (version 3 in-protocol handshake)
//!
//! After TLS comes up, both sides exchange VERSIONS cells and settle on
//! the highest link protocol version in common. The responder then sends
//! CERTS, AUTH_CHALLENGE, and NETINFO; a client answers with its own
//! NETINFO and the link is open for circuit traffic. Certificate trust is
//! decided by the transport's [`CertificateValidator`]; this state machine
//! only sequences the cells and performs the structural checks.

use crate::config::SUPPORTED_LINK_VERSIONS;
use crate::error::{Error, Result};

use super::cell::{Cell, NetinfoCell, TlvAddress, VersionsCell};
use super::certs::CertsCell;

/// Where the handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitVersions,
    AwaitCerts,
    AwaitAuthChallenge,
    AwaitNetinfo,
    Complete,
}

/// Client side of the in-protocol link handshake.
pub struct LinkHandshake {
    state: HandshakeState,
    /// Negotiated link version; 3 until the peer's VERSIONS arrives.
    link_version: u8,
    /// The address we reached the peer at, echoed in our NETINFO.
    peer_address: TlvAddress,
    peer_certs: Option<CertsCell>,
    peer_netinfo: Option<NetinfoCell>,
    outbound: Vec<Cell>,
}

impl LinkHandshake {
    /// Start a handshake; our VERSIONS cell is queued immediately.
    pub fn new(peer_address: TlvAddress) -> Self {
        let versions = VersionsCell::make(SUPPORTED_LINK_VERSIONS.to_vec());
        Self {
            state: HandshakeState::AwaitVersions,
            link_version: 3,
            peer_address,
            peer_certs: None,
            peer_netinfo: None,
            outbound: vec![Cell::Versions(versions)],
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    /// The negotiated link version. Meaningful once past `AwaitVersions`.
    pub fn link_version(&self) -> u8 {
        self.link_version
    }

    /// The peer's CERTS cell, for the transport's validator.
    pub fn peer_certs(&self) -> Option<&CertsCell> {
        self.peer_certs.as_ref()
    }

    /// The peer's NETINFO, which carries our public address as they see
    /// it.
    pub fn peer_netinfo(&self) -> Option<&NetinfoCell> {
        self.peer_netinfo.as_ref()
    }

    /// Cells ready to be written to the transport.
    pub fn take_outbound(&mut self) -> Vec<Cell> {
        std::mem::take(&mut self.outbound)
    }

    /// Feed one inbound cell. `netinfo_timestamp` is the seconds-since-
    /// epoch value stamped into our NETINFO reply; pass zero to avoid
    /// advertising a clock.
    pub fn handle_cell(&mut self, cell: Cell, netinfo_timestamp: u32) -> Result<()> {
        // Variable-length padding may appear at any point and is ignored.
        if let Cell::Vpadding(_) = cell {
            return Ok(());
        }

        match (self.state, cell) {
            (HandshakeState::AwaitVersions, Cell::Versions(versions)) => {
                self.link_version = Self::negotiate(&versions.versions)?;
                log::debug!("negotiated link protocol v{}", self.link_version);
                self.state = HandshakeState::AwaitCerts;
                Ok(())
            }
            (HandshakeState::AwaitCerts, Cell::Certs(certs)) => {
                certs.quick_check()?;
                self.peer_certs = Some(certs);
                self.state = HandshakeState::AwaitAuthChallenge;
                Ok(())
            }
            (HandshakeState::AwaitAuthChallenge, Cell::AuthChallenge(_)) => {
                // Clients connect anonymously and never answer the
                // challenge.
                self.state = HandshakeState::AwaitNetinfo;
                Ok(())
            }
            // A responder that wants no authentication may go straight to
            // NETINFO.
            (HandshakeState::AwaitAuthChallenge, Cell::Netinfo(netinfo))
            | (HandshakeState::AwaitNetinfo, Cell::Netinfo(netinfo)) => {
                self.finish(netinfo, netinfo_timestamp)
            }
            (state, cell) => Err(Error::HandshakeFailed(format!(
                "unexpected {:?} cell in handshake state {:?}",
                cell.command(),
                state
            ))),
        }
    }

    fn finish(&mut self, netinfo: NetinfoCell, timestamp: u32) -> Result<()> {
        self.peer_netinfo = Some(netinfo);

        let reply = NetinfoCell::make(
            0,
            timestamp,
            self.peer_address,
            Vec::new(),
            self.link_version,
        )?;
        self.outbound.push(Cell::Netinfo(reply));
        self.state = HandshakeState::Complete;
        log::debug!("link handshake complete");
        Ok(())
    }

    /// Pick the highest version both sides speak.
    fn negotiate(peer_versions: &[u16]) -> Result<u8> {
        let best = SUPPORTED_LINK_VERSIONS
            .iter()
            .copied()
            .filter(|v| peer_versions.contains(v))
            .max();
        match best {
            Some(v) => Ok(v as u8),
            None => Err(Error::HandshakeFailed(format!(
                "no link version in common (peer offers {:?})",
                peer_versions
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::{AuthChallengeCell, CellCommand, CellHeader};
    use crate::protocol::certs::RawCert;
    use ed25519_dalek::{Signer, SigningKey};
    use std::net::Ipv4Addr;

    fn peer_addr() -> TlvAddress {
        TlvAddress::Ipv4(Ipv4Addr::new(198, 51, 100, 7))
    }

    fn signed_cert(cert_type: u8) -> RawCert {
        let signer = SigningKey::from_bytes(&[5u8; 32]);
        let mut body = vec![0x01, cert_type];
        body.extend_from_slice(&u32::MAX.to_be_bytes());
        body.push(0x01);
        body.extend_from_slice(&signer.verifying_key().to_bytes());
        body.push(0);
        let sig = signer.sign(&body);
        body.extend_from_slice(&sig.to_bytes());
        RawCert {
            cert_type,
            data: body,
        }
    }

    fn certs_cell(link_version: u8) -> CertsCell {
        CertsCell {
            header: CellHeader::new(0, link_version),
            certs: vec![signed_cert(4), signed_cert(7)],
        }
    }

    fn netinfo_cell(link_version: u8) -> NetinfoCell {
        NetinfoCell::make(
            0,
            1_700_000_000,
            TlvAddress::Ipv4(Ipv4Addr::new(203, 0, 113, 9)),
            vec![TlvAddress::Ipv4(Ipv4Addr::new(198, 51, 100, 7))],
            link_version,
        )
        .unwrap()
    }

    #[test]
    fn test_versions_sent_first() {
        let mut hs = LinkHandshake::new(peer_addr());
        let out = hs.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].command(), CellCommand::Versions);
        assert!(hs.take_outbound().is_empty());
    }

    #[test]
    fn test_full_handshake_sequence() {
        let mut hs = LinkHandshake::new(peer_addr());
        hs.take_outbound();

        hs.handle_cell(Cell::Versions(VersionsCell::make(vec![3, 4, 5])), 0)
            .unwrap();
        assert_eq!(hs.link_version(), 4);
        assert_eq!(hs.state(), HandshakeState::AwaitCerts);

        hs.handle_cell(Cell::Certs(certs_cell(4)), 0).unwrap();
        assert_eq!(hs.state(), HandshakeState::AwaitAuthChallenge);

        let challenge = AuthChallengeCell {
            header: CellHeader::new(0, 4),
            challenge: [0xaa; 32],
            methods: vec![1, 3],
        };
        hs.handle_cell(Cell::AuthChallenge(challenge), 0).unwrap();
        assert_eq!(hs.state(), HandshakeState::AwaitNetinfo);

        hs.handle_cell(Cell::Netinfo(netinfo_cell(4)), 0).unwrap();
        assert!(hs.is_complete());
        assert!(hs.peer_certs().is_some());
        assert!(hs.peer_netinfo().is_some());

        // Our NETINFO reply is queued, echoing the peer's address with no
        // advertised addresses of our own.
        let out = hs.take_outbound();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Cell::Netinfo(n) => {
                assert_eq!(n.timestamp, 0);
                assert_eq!(n.other_address, peer_addr());
                assert!(n.this_addresses.is_empty());
            }
            other => panic!("expected NETINFO, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiates_highest_common() {
        let mut hs = LinkHandshake::new(peer_addr());
        hs.handle_cell(Cell::Versions(VersionsCell::make(vec![1, 2, 3])), 0)
            .unwrap();
        assert_eq!(hs.link_version(), 3);
    }

    #[test]
    fn test_no_common_version_fails() {
        let mut hs = LinkHandshake::new(peer_addr());
        let err = hs
            .handle_cell(Cell::Versions(VersionsCell::make(vec![1, 2])), 0)
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(_)));
    }

    #[test]
    fn test_netinfo_may_skip_auth_challenge() {
        let mut hs = LinkHandshake::new(peer_addr());
        hs.handle_cell(Cell::Versions(VersionsCell::make(vec![3])), 0)
            .unwrap();
        hs.handle_cell(Cell::Certs(certs_cell(3)), 0).unwrap();
        hs.handle_cell(Cell::Netinfo(netinfo_cell(3)), 0).unwrap();
        assert!(hs.is_complete());
    }

    #[test]
    fn test_out_of_order_cell_fails() {
        let mut hs = LinkHandshake::new(peer_addr());
        let err = hs
            .handle_cell(Cell::Netinfo(netinfo_cell(3)), 0)
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(_)));
    }
}
