//! Per-circuit cell dispatch
//!
//! One task per built circuit owns the read half of its link. Each decoded
//! cell goes to exactly one place:
//!
//! - PADDING / VPADDING, relay DROP: discarded
//! - CREATED2, EXTENDED2, TRUNCATED, INTRO_ESTABLISHED: the reply slot of
//!   the operation waiting for it
//! - any other recognized relay cell: the circuit's bounded mailbox
//! - DESTROY, digest mismatch, link failure: the error goes to the waiting
//!   operation (if any) and the mailbox, and the task ends
//!
//! Nothing is ever requeued.

use super::cell::{Cell, CellBody, RelayCell, RelayCommand, CELL_BODY_LEN};
use super::codec::CellReader;
use super::crypto::{originate, recognize, HopCrypto};
use super::relay::Relay;
use crate::error::{Result, TorError};
use crate::network::LinkStream;
use futures::io::ReadHalf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// A relay cell delivered to the mailbox, with the layer that recognized it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// Index into the hop list; equal to the built length for the
    /// end-to-end layer
    pub hop: usize,
    pub cell: RelayCell,
}

pub(crate) type MailboxItem = Result<RelayMessage>;

/// Control replies an operation can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    Created2,
    Extended2,
    Truncated,
    IntroEstablished,
}

#[derive(Debug)]
pub(crate) enum Reply {
    Created2(Vec<u8>),
    Relay(RelayMessage),
}

struct PendingReply {
    expect: Expect,
    tx: oneshot::Sender<Result<Reply>>,
}

pub(crate) struct Hop {
    pub relay: Arc<Relay>,
    pub crypto: Option<HopCrypto>,
}

/// Ordered hops of one circuit. Hops below `built_length` carry crypto
/// state, hops at or above it carry none.
pub(crate) struct HopList {
    pub hops: Vec<Hop>,
    pub built_length: usize,
    /// Onion-service end-to-end layer, peeled after every relay hop
    pub e2e: Option<HopCrypto>,
}

impl HopList {
    pub fn new(path: Vec<Arc<Relay>>) -> Self {
        Self {
            hops: path
                .into_iter()
                .map(|relay| Hop {
                    relay,
                    crypto: None,
                })
                .collect(),
            built_length: 0,
            e2e: None,
        }
    }

    fn layers(&mut self, upto: usize, with_e2e: bool) -> Result<Vec<&mut HopCrypto>> {
        if upto > self.built_length {
            return Err(TorError::InvalidState(format!(
                "hop {} is not built (built length {})",
                upto, self.built_length
            )));
        }
        let mut layers = Vec::with_capacity(upto + 1);
        for hop in self.hops[..upto].iter_mut() {
            let crypto = hop
                .crypto
                .as_mut()
                .ok_or_else(|| TorError::Internal("built hop without crypto".into()))?;
            layers.push(crypto);
        }
        if with_e2e {
            if let Some(e2e) = self.e2e.as_mut() {
                layers.push(e2e);
            }
        }
        Ok(layers)
    }

    /// Encrypt a body addressed to hop `upto - 1`
    pub fn originate_to(&mut self, upto: usize, payload: &mut [u8; CELL_BODY_LEN]) -> Result<()> {
        let mut layers = self.layers(upto, false)?;
        originate(&mut layers, payload)
    }

    /// Encrypt a body addressed to the far end: the end-to-end layer when
    /// one is installed, otherwise the last built hop
    pub fn originate_to_end(&mut self, payload: &mut [u8; CELL_BODY_LEN]) -> Result<()> {
        let built = self.built_length;
        let mut layers = self.layers(built, true)?;
        originate(&mut layers, payload)
    }

    pub fn recognize(&mut self, payload: &mut [u8; CELL_BODY_LEN]) -> Result<usize> {
        let built = self.built_length;
        let mut layers = self.layers(built, true)?;
        recognize(&mut layers, payload)
    }

    /// Drop every hop from `len` on, scrubbing its crypto state
    pub fn shrink_to(&mut self, len: usize) {
        self.e2e = None;
        self.hops.truncate(len);
        self.built_length = self.built_length.min(len);
        log::trace!("🧹 Hop state beyond {} scrubbed", len);
    }

    pub fn clear(&mut self) {
        self.e2e = None;
        for hop in self.hops.iter_mut() {
            hop.crypto = None;
        }
        self.built_length = 0;
        log::trace!("🧹 All hop state scrubbed");
    }

    /// Built hops have crypto, the rest do not
    pub fn invariants_hold(&self) -> bool {
        self.built_length <= self.hops.len()
            && self
                .hops
                .iter()
                .enumerate()
                .all(|(i, h)| h.crypto.is_some() == (i < self.built_length))
    }
}

/// State shared between a circuit and its dispatch task
pub(crate) struct Shared {
    pub circ_id: u32,
    pub hops: Mutex<HopList>,
    pending: Mutex<Option<PendingReply>>,
    mailbox: Mutex<Option<mpsc::Sender<MailboxItem>>>,
    poisoned: AtomicBool,
    remote_destroy: Mutex<Option<u8>>,
}

impl Shared {
    pub fn new(circ_id: u32, path: Vec<Arc<Relay>>) -> Self {
        Self {
            circ_id,
            hops: Mutex::new(HopList::new(path)),
            pending: Mutex::new(None),
            mailbox: Mutex::new(None),
            poisoned: AtomicBool::new(false),
            remote_destroy: Mutex::new(None),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn remote_destroy_reason(&self) -> Option<u8> {
        self.remote_destroy.lock().ok().and_then(|r| *r)
    }

    pub fn set_mailbox(&self, tx: Option<mpsc::Sender<MailboxItem>>) -> Result<()> {
        *self.mailbox.lock()? = tx;
        Ok(())
    }

    /// Open a reply slot. Only one control operation may wait at a time.
    pub fn expect(&self, expect: Expect) -> Result<oneshot::Receiver<Result<Reply>>> {
        let mut pending = self.pending.lock()?;
        if pending.is_some() {
            return Err(TorError::InvalidState(
                "another operation is waiting for a reply".into(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        *pending = Some(PendingReply { expect, tx });
        Ok(rx)
    }

    pub fn cancel_expect(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
    }

    /// Hand a reply to the waiting operation if it asked for this kind.
    /// Gives the reply back otherwise.
    fn resolve(&self, kind: Expect, reply: Reply) -> Option<Reply> {
        let slot = match self.pending.lock() {
            Ok(mut pending) => {
                if pending.as_ref().map_or(false, |p| p.expect == kind) {
                    pending.take()
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        match slot {
            Some(p) => {
                if p.tx.send(Ok(reply)).is_err() {
                    log::debug!("Reply for {:?} arrived after its waiter gave up", kind);
                }
                None
            }
            None => Some(reply),
        }
    }

    /// Fail the waiting operation, if any, and the mailbox
    async fn fail(&self, err: TorError) {
        let slot = self.pending.lock().ok().and_then(|mut p| p.take());
        if let Some(p) = slot {
            let _ = p.tx.send(Err(err.clone()));
        }
        let mailbox = self.mailbox.lock().ok().and_then(|m| m.clone());
        if let Some(tx) = mailbox {
            let _ = tx.send(Err(err)).await;
        }
    }

    async fn deliver(&self, message: RelayMessage) {
        let mailbox = self.mailbox.lock().ok().and_then(|m| m.clone());
        match mailbox {
            Some(tx) => {
                if tx.send(Ok(message)).await.is_err() {
                    log::debug!("Mailbox of circuit {:#x} closed, cell discarded", self.circ_id);
                }
            }
            None => log::debug!(
                "No mailbox on circuit {:#x}, {:?} discarded",
                self.circ_id,
                message.cell.command
            ),
        }
    }
}

/// Read loop of one circuit; ends on DESTROY, protocol failure or link loss
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut read: ReadHalf<Box<dyn LinkStream>>,
    mut reader: CellReader,
) {
    loop {
        let cell = match reader.read_cell(&mut read).await {
            Ok(cell) => cell,
            Err(e) => {
                log::warn!("⚠️ Link of circuit {:#x} failed: {}", shared.circ_id, e);
                shared.poison();
                shared.fail(e).await;
                break;
            }
        };

        if !step(&shared, cell).await {
            break;
        }
    }
    shared.set_mailbox(None).ok();
    log::debug!("Dispatch for circuit {:#x} stopped", shared.circ_id);
}

/// Route one cell. Returns false when the circuit is finished.
async fn step(shared: &Shared, cell: Cell) -> bool {
    if matches!(cell.body, CellBody::Padding | CellBody::Vpadding(_)) {
        return true;
    }
    if cell.circ_id != shared.circ_id {
        log::warn!(
            "⚠️ Dropping {} for foreign circuit {:#x}",
            cell.body.name(),
            cell.circ_id
        );
        return true;
    }

    match cell.body {
        CellBody::Created2 { handshake } => {
            if shared.resolve(Expect::Created2, Reply::Created2(handshake)).is_some() {
                log::warn!("⚠️ Unsolicited CREATED2 on circuit {:#x}", shared.circ_id);
            }
            true
        }
        CellBody::Relay(payload) | CellBody::RelayEarly(payload) => handle_relay(shared, payload).await,
        CellBody::Destroy { reason } => {
            log::info!(
                "💥 Circuit {:#x} destroyed by relay ({})",
                shared.circ_id,
                crate::error::destroy_reason_name(reason)
            );
            if let Ok(mut r) = shared.remote_destroy.lock() {
                *r = Some(reason);
            }
            shared.poison();
            shared.fail(TorError::circuit_destroyed(reason)).await;
            false
        }
        other => {
            shared.poison();
            shared
                .fail(TorError::UnexpectedCell {
                    expected: "RELAY, CREATED2 or DESTROY".into(),
                    got: other.name(),
                })
                .await;
            false
        }
    }
}

async fn handle_relay(shared: &Shared, mut payload: Box<[u8; CELL_BODY_LEN]>) -> bool {
    let recognized = match shared.hops.lock() {
        Ok(mut hops) => hops.recognize(&mut payload),
        Err(e) => Err(TorError::from(e)),
    };

    let hop = match recognized {
        Ok(hop) => hop,
        Err(e) => {
            log::warn!("⚠️ Unrecognized relay cell on circuit {:#x}: {}", shared.circ_id, e);
            shared.poison();
            shared.fail(e).await;
            return false;
        }
    };

    // The running digest already covers this cell, so a bad body cannot be skipped
    let cell = match RelayCell::from_payload(&payload) {
        Ok(cell) => cell,
        Err(e) => {
            log::warn!("⚠️ Malformed relay cell from hop {} on circuit {:#x}: {}", hop, shared.circ_id, e);
            shared.poison();
            shared.fail(e).await;
            return false;
        }
    };
    log::debug!("📥 {:?} from hop {} ({} bytes)", cell.command, hop, cell.data.len());

    let kind = match cell.command {
        RelayCommand::Drop => return true,
        RelayCommand::Extended2 => Some(Expect::Extended2),
        RelayCommand::Truncated => Some(Expect::Truncated),
        RelayCommand::IntroEstablished => Some(Expect::IntroEstablished),
        _ => None,
    };

    let message = RelayMessage { hop, cell };
    let unclaimed = match kind {
        Some(kind) => match shared.resolve(kind, Reply::Relay(message)) {
            Some(Reply::Relay(m)) => Some(m),
            _ => None,
        },
        None => Some(message),
    };
    if let Some(message) = unclaimed {
        shared.deliver(message).await;
    }
    true
}
