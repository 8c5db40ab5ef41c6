//! Tor protocol implementation
//!
//! This module implements the circuit side of the Tor protocol:
//! - Cell framing for every link version
//! - Link handshake and certificate verification
//! - NTOR and HS-NTOR key agreement, onion layer crypto
//! - Circuit building, extension, truncation and dispatch
//! - Onion service introduction and rendezvous cells

pub mod cell;
pub mod codec;
pub mod relay;
pub mod extend;
pub mod crypto;
pub mod ntor;
pub mod hs_ntor;
pub mod certs;
pub mod handshake;
mod dispatch;
mod circuit;
mod circuit_builder;
pub mod onion_service;

pub use cell::{Cell, CellBody, CellCommand, CertEntry, Netinfo, RelayCell, RelayCommand};
pub use codec::{decode_cell, encode_cell, CellReader, CellWriter};
pub use relay::{LinkSpecifier, Relay, RelayDescriptor, RelayFlags};
pub use crypto::{CircuitKeys, HandshakeRole, HopCrypto, LayerFlavor};
pub use ntor::NtorHandshake;
pub use hs_ntor::HsNtorClient;
pub use certs::{CertType, CertsCell, Ed25519Certificate, VerifiedRelay};
pub use handshake::{LinkCredentials, LinkInfo};
pub use dispatch::RelayMessage;
pub use circuit::{Circuit, CircuitContext, CircuitStatus};
pub use circuit_builder::{next_circuit_id, CircuitBuilder};
pub use onion_service::{Introduce2, IntroPointKeys, IntroduceRequest, ReplayCache};
