//! Standby circuit pool
//!
//! Keeps built circuits ready so introduction and rendezvous work does not
//! wait on a full build.
//!
//! - A build that fails at one hop (transport, protocol or crypto) is
//!   retried with a fresh path
//! - Running out of relays stops filling at once
//! - Pooled circuits get periodic PADDING; dead ones are evicted

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{ErrorKind, Result, TorError};
use crate::protocol::{Circuit, CircuitBuilder, CircuitStatus};
use tokio::task::JoinHandle;

/// Attempts per circuit before `fill` gives up on it
const BUILD_ATTEMPTS: usize = 3;

struct PooledCircuit {
    circuit: Arc<Circuit>,
    built_at: Instant,
}

/// Statistics about circuit pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitPoolStats {
    /// Total circuits built
    pub circuits_built: u64,
    /// Builds that failed and were retried or abandoned
    pub build_failures: u64,
    /// Circuits served from the pool
    pub pool_hits: u64,
    /// Circuits built on demand because the pool was empty
    pub pool_misses: u64,
    /// Circuits dropped by keepalive
    pub circuits_evicted: u64,
    pub current_pool_size: usize,
}

/// Pool of standby circuits
pub struct CircuitPool {
    builder: CircuitBuilder,
    available: Mutex<VecDeque<PooledCircuit>>,
    stats: Mutex<CircuitPoolStats>,
}

impl CircuitPool {
    pub fn new(builder: CircuitBuilder) -> Self {
        Self {
            builder,
            available: Mutex::new(VecDeque::new()),
            stats: Mutex::new(CircuitPoolStats::default()),
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut CircuitPoolStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Build circuits of the default length until `count` are pooled.
    ///
    /// Returns how many were built. Resource exhaustion and usage errors
    /// end the fill with that error.
    pub async fn fill(&self, count: usize) -> Result<usize> {
        let length = self.builder.context().config.default_circuit_length;
        let mut built = 0;

        while self.size() < count {
            log::info!("🔥 Filling circuit pool ({}/{})", self.size(), count);
            let circuit = self.build_with_retry(length).await?;
            self.push(circuit)?;
            built += 1;
        }

        log::info!("✅ Circuit pool ready ({} circuits)", self.size());
        Ok(built)
    }

    /// Fill to the configured number of standby circuits
    pub async fn fill_standby(&self) -> Result<usize> {
        self.fill(self.builder.context().config.standby_circuits).await
    }

    async fn build_with_retry(&self, length: usize) -> Result<Circuit> {
        let mut last_err = None;
        for attempt in 1..=BUILD_ATTEMPTS {
            match self.builder.build_circuit(length, None).await {
                Ok(circuit) => {
                    self.update_stats(|s| s.circuits_built += 1);
                    return Ok(circuit);
                }
                Err(e) => {
                    self.update_stats(|s| s.build_failures += 1);
                    match e.kind() {
                        ErrorKind::ResourceExhausted | ErrorKind::Usage => return Err(e),
                        _ => {
                            log::warn!(
                                "⚠️ Circuit build failed (attempt {}/{}): {}",
                                attempt,
                                BUILD_ATTEMPTS,
                                e
                            );
                            last_err = Some(e);
                        }
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TorError::Internal("no build attempts made".into())))
    }

    fn push(&self, circuit: Circuit) -> Result<()> {
        let mut available = self.available.lock()?;
        available.push_back(PooledCircuit {
            circuit: Arc::new(circuit),
            built_at: Instant::now(),
        });
        let size = available.len();
        drop(available);
        self.update_stats(|s| s.current_pool_size = size);
        Ok(())
    }

    /// Hand out a pooled circuit, skipping any that died while waiting
    pub async fn take(&self) -> Option<Arc<Circuit>> {
        loop {
            let pooled = self.available.lock().ok()?.pop_front()?;
            let size = self.size();
            self.update_stats(|s| s.current_pool_size = size);

            if pooled.circuit.status() == CircuitStatus::Standby && !pooled.circuit.is_poisoned() {
                log::info!(
                    "♻️ Using pooled circuit {:#x} (age: {}ms)",
                    pooled.circuit.id(),
                    pooled.built_at.elapsed().as_millis()
                );
                self.update_stats(|s| s.pool_hits += 1);
                return Some(pooled.circuit);
            }
            if let Err(e) = pooled.circuit.destroy().await {
                log::debug!("Destroying dead pooled circuit: {}", e);
            }
            self.update_stats(|s| s.circuits_evicted += 1);
        }
    }

    /// A pooled circuit, or a freshly built one when the pool is empty
    pub async fn get_circuit(&self) -> Result<Arc<Circuit>> {
        if let Some(circuit) = self.take().await {
            return Ok(circuit);
        }
        log::info!("🔨 Building new circuit (pool empty)");
        self.update_stats(|s| s.pool_misses += 1);
        let length = self.builder.context().config.default_circuit_length;
        Ok(Arc::new(self.build_with_retry(length).await?))
    }

    /// Send PADDING on every pooled circuit and evict the ones that fail.
    /// Returns the number evicted.
    pub async fn keepalive_once(&self) -> usize {
        let snapshot: Vec<Arc<Circuit>> = match self.available.lock() {
            Ok(available) => available.iter().map(|p| p.circuit.clone()).collect(),
            Err(_) => return 0,
        };

        let mut dead = Vec::new();
        for circuit in snapshot {
            if let Err(e) = circuit.send_padding().await {
                log::warn!("⚠️ Keepalive failed on circuit {:#x}: {}", circuit.id(), e);
                if let Err(e) = circuit.destroy().await {
                    log::debug!("Destroying circuit {:#x}: {}", circuit.id(), e);
                }
                dead.push(circuit.id());
            }
        }

        if !dead.is_empty() {
            if let Ok(mut available) = self.available.lock() {
                available.retain(|p| !dead.contains(&p.circuit.id()));
            }
            let size = self.size();
            self.update_stats(|s| {
                s.circuits_evicted += dead.len() as u64;
                s.current_pool_size = size;
            });
            log::info!("🗑️ Evicted {} dead circuits from pool", dead.len());
        }
        dead.len()
    }

    /// Run [`Self::keepalive_once`] every `keepalive_interval_ms`
    pub fn spawn_keepalive(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let period = self.builder.context().config.keepalive_interval();
        if period.is_zero() {
            return Err(TorError::Config("keepalive_interval_ms must be non-zero".into()));
        }
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.keepalive_once().await;
            }
        }))
    }

    pub fn get_stats(&self) -> CircuitPoolStats {
        let size = self.size();
        let stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        CircuitPoolStats {
            current_pool_size: size,
            ..stats
        }
    }

    pub fn size(&self) -> usize {
        self.available.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn has_available(&self) -> bool {
        self.size() > 0
    }

    /// Destroy every pooled circuit
    pub async fn clear(&self) {
        let drained: Vec<PooledCircuit> = match self.available.lock() {
            Ok(mut available) => available.drain(..).collect(),
            Err(_) => return,
        };
        for pooled in drained {
            if let Err(e) = pooled.circuit.destroy().await {
                log::debug!("Destroying pooled circuit: {}", e);
            }
        }
        self.update_stats(|s| s.current_pool_size = 0);
        log::info!("Circuit pool cleared");
    }
}
