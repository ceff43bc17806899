//! Client-side cell and circuit data plane for the onion-routing link
//! protocol.
//!
//! This crate implements the cryptographic core of an onion-routing
//! client: framing cells over a TLS transport (link protocol versions 3
//! and 4), the in-protocol link handshake, building multi-hop circuits
//! with NTor key exchanges, the per-hop onion encryption engine with its
//! running digests, and stream multiplexing with SENDME flow control.
//!
//! The crate is transport-agnostic and runs on a single cooperative loop:
//! collaborators feed transport bytes into a [`protocol::Connection`],
//! route the resulting cells through a [`protocol::CircuitManager`], and
//! write the drained outbound bytes back to the transport. The SOCKS
//! front-end, directory client, TLS layer, and process supervision live
//! outside this crate and program against those interfaces.
//!
//! ```no_run
//! use onion_core::protocol::{Connection, LinkHandshake, TlvAddress};
//! use std::net::Ipv4Addr;
//!
//! let peer = TlvAddress::Ipv4(Ipv4Addr::new(198, 51, 100, 7));
//! let mut conn = Connection::new(LinkHandshake::new(peer));
//! let to_write = conn.take_outbound(); // VERSIONS cell for the transport
//! # let _ = to_write;
//! ```

pub mod config;
pub mod error;
pub mod protocol;

pub use config::Config;
pub use error::{Error, Result};
