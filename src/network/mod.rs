//! Link layer transport
//!
//! The circuit engine only sees [`LinkStream`]s handed out by a
//! [`RelayConnector`]. [`TlsRelayConnector`] is the real one;
//! [`MemoryLink`] runs the engine against an in-process peer.

mod memory;
mod tls;

pub use memory::{memory_link_pair, MemoryLink};
pub use tls::{LinkStream, RelayConnector, TlsLink, TlsRelayConnector, TLS_EXPORTER_LABEL};
