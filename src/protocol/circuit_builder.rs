//! Circuit builder
//!
//! Picks paths from the [`RelayDirectory`] and hands out prepared
//! [`Circuit`]s with fresh circuit ids. Building is left to the caller, or
//! done in one go with [`CircuitBuilder::build_circuit`].

use super::circuit::{Circuit, CircuitContext};
use super::relay::Relay;
use crate::directory::with_directory_retry;
use crate::error::{Result, TorError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// High bit marks ids chosen by the initiator of the link
const CIRC_ID_INITIATOR_BIT: u32 = 0x8000_0000;

static CIRC_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Next process-wide circuit id: `0x8000_0000 | n`, never with `n == 0`
pub fn next_circuit_id() -> u32 {
    loop {
        let n = CIRC_ID_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & !CIRC_ID_INITIATOR_BIT;
        if n != 0 {
            return CIRC_ID_INITIATOR_BIT | n;
        }
    }
}

/// Prepares circuits over one set of collaborators
#[derive(Clone)]
pub struct CircuitBuilder {
    ctx: Arc<CircuitContext>,
}

impl CircuitBuilder {
    pub fn new(ctx: Arc<CircuitContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<CircuitContext> {
        &self.ctx
    }

    /// Random path of `length` distinct relays, optionally avoiding one.
    /// The first hop is recorded as a guard.
    pub fn prepare_circuit(&self, length: usize, exclude: Option<&[u8; 20]>) -> Result<Circuit> {
        check_length(length)?;
        let exclude: Vec<[u8; 20]> = exclude.into_iter().copied().collect();
        let path = with_directory_retry(self.ctx.config.directory_retries, || {
            self.ctx.directory.get_suitable_relays(length, &exclude)
        })?;
        if path.len() != length {
            return Err(TorError::NoRelaysAvailable(format!(
                "directory returned {} of {} relays",
                path.len(),
                length
            )));
        }
        let guard = path.first().map(|r| r.identity);
        Ok(self.prepared(path, guard))
    }

    /// Like [`Self::prepare_circuit`], but hop 0 is the least recently used
    /// known guard.
    pub fn prepare_guarded(&self, length: usize, exclude: Option<&[u8; 20]>) -> Result<Circuit> {
        check_length(length)?;
        let guard = with_directory_retry(self.ctx.config.directory_retries, || {
            self.ctx.directory.get_guard()
        })?;

        let mut avoid = vec![guard.identity];
        avoid.extend(exclude.copied());
        let rest = with_directory_retry(self.ctx.config.directory_retries, || {
            self.ctx.directory.get_extra_relays(length - 1, &avoid)
        });
        let rest = match rest {
            Ok(rest) => rest,
            Err(e) => {
                self.ctx.directory.release_guard(&guard.identity);
                return Err(e);
            }
        };

        let guard_id = guard.identity;
        let mut path = Vec::with_capacity(length);
        path.push(guard);
        path.extend(rest);
        Ok(self.prepared(path, Some(guard_id)))
    }

    /// `length - 1` random relays followed by `destination`
    pub fn prepare_to(&self, length: usize, destination: Arc<Relay>) -> Result<Circuit> {
        check_length(length)?;
        if length == 1 {
            return Ok(self.prepared(vec![destination], None));
        }
        let exclude = [destination.identity];
        let mut path = with_directory_retry(self.ctx.config.directory_retries, || {
            self.ctx.directory.get_suitable_relays(length - 1, &exclude)
        })?;
        let guard = path.first().map(|r| r.identity);
        path.push(destination);
        Ok(self.prepared(path, guard))
    }

    /// Prepare and build a random circuit
    pub async fn build_circuit(&self, length: usize, exclude: Option<&[u8; 20]>) -> Result<Circuit> {
        let circuit = self.prepare_circuit(length, exclude)?;
        circuit.build().await?;
        Ok(circuit)
    }

    /// Prepare and build a circuit ending at `destination`
    pub async fn build_to(&self, length: usize, destination: Arc<Relay>) -> Result<Circuit> {
        let circuit = self.prepare_to(length, destination)?;
        circuit.build().await?;
        Ok(circuit)
    }

    fn prepared(&self, path: Vec<Arc<Relay>>, guard: Option<[u8; 20]>) -> Circuit {
        let id = next_circuit_id();
        log::debug!("📋 Prepared circuit {:#x} with {} hops", id, path.len());
        Circuit::new(id, path, guard, self.ctx.clone())
    }
}

fn check_length(length: usize) -> Result<()> {
    if length == 0 {
        return Err(TorError::InvalidState("a circuit needs at least one hop".into()));
    }
    Ok(())
}
