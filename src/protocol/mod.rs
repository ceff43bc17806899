//! The onion-routing protocol stack
//!
//! Bottom to top: cell framing, the inner relay-cell codec, per-hop
//! cryptography and the onion engine, the NTor key agreement, the link
//! handshake and connection plumbing, and the circuit and stream layer.

pub mod cell;
pub mod certs;
pub mod circuit;
pub mod completion;
pub mod connection;
pub mod crypto;
pub mod exitrequest;
pub mod flow_control;
pub mod handshake;
pub mod ntor;
pub mod relay;
pub mod stream;

pub use cell::{Cell, CellCommand, CellHeader, Create2Cell, Created2Cell, DestroyCell,
    EncryptedCell, NetinfoCell, TlvAddress, VersionsCell};
pub use certs::{CertificateValidator, CertsCell, Ed25519Cert, StructuralValidator};
pub use circuit::{Circuit, CircuitEvent, CircuitManager, CircuitState, HopSpec};
pub use completion::CompletionRouter;
pub use connection::{CellStream, CircIdAllocator, Connection, ConnectionEvent};
pub use crypto::{CircuitKeys, CircuitPath, RelayCrypto};
pub use exitrequest::{ExitPolicy, ExitRequest, PolicyRule};
pub use flow_control::{CircuitFlowControl, StreamFlowControl};
pub use handshake::{HandshakeState, LinkHandshake};
pub use ntor::{onion_key_from_base64, NtorHandshake};
pub use relay::{LinkSpecifier, RelayCell, RelayCommand};
pub use stream::{StreamId, StreamMap, StreamState};
