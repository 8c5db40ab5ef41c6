//! # Tor Embedded
//!
//! The circuit engine of a minimal Tor client for embedded and
//! resource-constrained targets, with enough of the onion service protocol
//! to run an introduction point and answer rendezvous requests.
//!
//! ## Architecture
//!
//! ```text
//! CircuitPool / onion service logic
//!   ↓
//! CircuitBuilder  ──  RelayDirectory (guards, relay snapshot)
//!   ↓
//! Circuit  ──  dispatch task (one per circuit, owns the read half)
//!   ↓
//! Link handshake + cell codec
//!   ↓
//! RelayConnector (TLS over TCP, or in-memory)
//! ```
//!
//! ## Features
//!
//! - **Typed cells**: every cell is a tagged [`protocol::CellBody`]
//! - **No requeueing**: handshake replies go to per-operation reply slots,
//!   everything else to a bounded per-circuit mailbox
//! - **Scrub on drop**: hop keys and digests are wiped when a hop goes away
//! - **Injected collaborators**: relay lookup, transport and link
//!   credentials are traits
//!
//! The crate logs through the `log` facade and installs no logger.

use std::sync::Arc;

pub mod circuit_pool;
pub mod config;
pub mod directory;
mod error;
pub mod network;
pub mod protocol;


pub use circuit_pool::{CircuitPool, CircuitPoolStats};
pub use config::EngineConfig;
pub use directory::{GuardSet, RelayDirectory, StaticDirectory};
pub use error::{destroy_reason_name, ErrorCode, ErrorKind, Result, TorError};
pub use network::{LinkStream, RelayConnector, TlsRelayConnector};
pub use protocol::{
    Circuit, CircuitBuilder, CircuitContext, CircuitStatus, IntroPointKeys, IntroduceRequest,
    LinkCredentials, Relay, RelayCell, RelayCommand, RelayMessage, ReplayCache,
};

/// Engine over real TLS links with the given relay directory
pub fn tls_engine(
    config: EngineConfig,
    directory: Arc<dyn RelayDirectory>,
) -> Result<CircuitBuilder> {
    config.validate()?;
    let connector = TlsRelayConnector::new(config.connect_timeout())?;
    let ctx = CircuitContext::new(config, Arc::new(connector), directory);
    log::info!("Tor embedded engine initialized");
    Ok(CircuitBuilder::new(Arc::new(ctx)))
}
