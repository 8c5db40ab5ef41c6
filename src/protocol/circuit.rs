//! Circuit state machine
//!
//! A [`Circuit`] owns one link to its first hop. Building it runs the link
//! handshake, splits the link, and starts the dispatch task (see
//! [`super::dispatch`]) on the read half. Everything else goes through the
//! write half, which is serialized by a mutex so cells are never interleaved.
//!
//! ```text
//! Preparing -> Building -> Standby -> {Introducing | Rendezvous} -> Destroyed
//!                            ^   |
//!                            +- Truncating
//! ```
//!
//! Any protocol or crypto failure poisons the circuit. The next operation
//! tears it down and reports [`TorError::CircuitClosed`].

use super::cell::{Cell, CellBody, RelayCell, RelayCommand};
use super::codec::CellWriter;
use super::crypto::{HandshakeRole, HopCrypto};
use super::dispatch::{self, Expect, Hop, MailboxItem, RelayMessage, Reply, Shared};
use super::extend::{decode_extended2, Extend2};
use super::handshake::{handshake, LinkCredentials, LinkInfo};
use super::hs_ntor::service_rendezvous;
use super::ntor::{NtorHandshake, NTOR_HANDSHAKE_TYPE};
use super::onion_service::{
    establish_intro_body, rendezvous1_body, IntroPointKeys, IntroduceRequest,
};
use super::relay::Relay;
use crate::config::EngineConfig;
use crate::directory::{with_directory_retry, RelayDirectory};
use crate::error::{destroy_reason_name, ErrorKind, Result, TorError};
use crate::network::{LinkStream, RelayConnector};
use futures::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// DESTROY reason we send for a local protocol failure
const DESTROY_REASON_PROTOCOL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitStatus {
    Preparing,
    Building,
    Standby,
    Introducing,
    Rendezvous,
    Truncating,
    Destroyed,
}

/// Collaborators shared by every circuit of one engine
pub struct CircuitContext {
    pub config: EngineConfig,
    pub connector: Arc<dyn RelayConnector>,
    pub directory: Arc<dyn RelayDirectory>,
    pub credentials: Option<Arc<dyn LinkCredentials>>,
}

impl CircuitContext {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn RelayConnector>,
        directory: Arc<dyn RelayDirectory>,
    ) -> Self {
        Self {
            config,
            connector,
            directory,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn LinkCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

struct LinkWriter {
    half: WriteHalf<Box<dyn LinkStream>>,
    framing: CellWriter,
}

/// One circuit and its link
pub struct Circuit {
    id: u32,
    ctx: Arc<CircuitContext>,
    shared: Arc<Shared>,
    status: Mutex<CircuitStatus>,
    link: tokio::sync::Mutex<Option<LinkWriter>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    mailbox: tokio::sync::Mutex<Option<mpsc::Receiver<MailboxItem>>>,
    /// Serializes build / extend / truncate / intro / rendezvous
    control: tokio::sync::Mutex<()>,
    relay_early_left: AtomicU8,
    link_info: Mutex<Option<LinkInfo>>,
    /// First hop, when it was taken from the guard set
    guard: Option<[u8; 20]>,
    guard_released: AtomicBool,
}

impl Circuit {
    pub(crate) fn new(
        id: u32,
        path: Vec<Arc<Relay>>,
        guard: Option<[u8; 20]>,
        ctx: Arc<CircuitContext>,
    ) -> Self {
        let relay_early = ctx.config.max_relay_early;
        Self {
            id,
            shared: Arc::new(Shared::new(id, path)),
            ctx,
            status: Mutex::new(CircuitStatus::Preparing),
            link: tokio::sync::Mutex::new(None),
            dispatch: Mutex::new(None),
            mailbox: tokio::sync::Mutex::new(None),
            control: tokio::sync::Mutex::new(()),
            relay_early_left: AtomicU8::new(relay_early),
            link_info: Mutex::new(None),
            guard,
            guard_released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn status(&self) -> CircuitStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(CircuitStatus::Destroyed)
    }

    fn set_status(&self, status: CircuitStatus) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
    }

    /// Hops with completed handshakes
    pub fn built_length(&self) -> usize {
        self.shared
            .hops
            .lock()
            .map(|h| h.built_length)
            .unwrap_or(0)
    }

    /// Hops in the path, built or not
    pub fn length(&self) -> usize {
        self.shared.hops.lock().map(|h| h.hops.len()).unwrap_or(0)
    }

    pub fn path(&self) -> Vec<Arc<Relay>> {
        self.shared
            .hops
            .lock()
            .map(|h| h.hops.iter().map(|hop| hop.relay.clone()).collect())
            .unwrap_or_default()
    }

    pub fn link_info(&self) -> Option<LinkInfo> {
        self.link_info.lock().ok().and_then(|i| i.clone())
    }

    pub fn relay_early_remaining(&self) -> u8 {
        self.relay_early_left.load(Ordering::Acquire)
    }

    pub fn is_poisoned(&self) -> bool {
        self.shared.is_poisoned()
    }

    pub fn has_end_to_end_layer(&self) -> bool {
        self.shared
            .hops
            .lock()
            .map(|h| h.e2e.is_some())
            .unwrap_or(false)
    }

    /// `built_length <= length`, and exactly the built hops carry crypto
    pub fn check_invariants(&self) -> bool {
        self.shared
            .hops
            .lock()
            .map(|h| h.invariants_hold())
            .unwrap_or(false)
    }

    fn require_status(&self, allowed: &[CircuitStatus], operation: &str) -> Result<()> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(())
        } else {
            Err(TorError::InvalidState(format!(
                "cannot {} circuit {:#x} in state {:?}",
                operation, self.id, status
            )))
        }
    }

    /// Tear down a poisoned circuit and refuse a destroyed one
    async fn ensure_usable(&self) -> Result<()> {
        if self.status() == CircuitStatus::Destroyed {
            return Err(TorError::CircuitClosed(format!(
                "circuit {:#x} is destroyed",
                self.id
            )));
        }
        if self.shared.is_poisoned() {
            self.teardown(self.destroy_reason(DESTROY_REASON_PROTOCOL)).await;
            return Err(TorError::CircuitClosed(format!(
                "circuit {:#x} failed and was torn down",
                self.id
            )));
        }
        Ok(())
    }

    // ===== build =====

    /// Connect to the first hop, run the link handshake, then CREATE2 and
    /// EXTEND2 through the whole path.
    pub async fn build(&self) -> Result<()> {
        let _control = self.control.lock().await;
        self.require_status(&[CircuitStatus::Preparing], "build")?;
        self.set_status(CircuitStatus::Building);

        let path = self.path();
        let names: Vec<&str> = path.iter().map(|r| r.nickname.as_str()).collect();
        log::info!("🔨 Building circuit {:#x}: {}", self.id, names.join(" → "));

        match self.build_inner(&path).await {
            Ok(()) => {
                self.set_status(CircuitStatus::Standby);
                log::info!("✅ Circuit {:#x} built ({} hops)", self.id, path.len());
                Ok(())
            }
            Err(e) => {
                log::warn!("⚠️ Circuit {:#x} build failed: {}", self.id, e);
                self.teardown(self.destroy_reason(0)).await;
                Err(e)
            }
        }
    }

    async fn build_inner(&self, path: &[Arc<Relay>]) -> Result<()> {
        let first = path
            .first()
            .ok_or_else(|| TorError::InvalidState("circuit has an empty path".into()))?;

        let mut link = self.ctx.connector.connect(first).await?;
        let (info, reader, framing) = tokio::time::timeout(
            self.ctx.config.handshake_timeout(),
            handshake(
                link.as_mut(),
                first,
                &self.ctx.config,
                self.ctx.credentials.as_deref(),
            ),
        )
        .await
        .map_err(|_| TorError::Timeout(format!("link handshake with {}", first.nickname)))??;
        *self.link_info.lock()? = Some(info);

        let (read, write) = link.split();
        *self.link.lock().await = Some(LinkWriter {
            half: write,
            framing,
        });

        let (tx, rx) = mpsc::channel(self.ctx.config.mailbox_capacity);
        self.shared.set_mailbox(Some(tx))?;
        *self.mailbox.lock().await = Some(rx);
        let task = tokio::spawn(dispatch::run(self.shared.clone(), read, reader));
        *self.dispatch.lock()? = Some(task);

        self.create_first_hop(first).await?;
        for index in 1..path.len() {
            self.extend_hop(index).await?;
        }
        Ok(())
    }

    async fn create_first_hop(&self, relay: &Relay) -> Result<()> {
        let ntor = NtorHandshake::new(&relay.identity, &relay.ntor_onion_key);
        let create = Cell::new(
            self.id,
            CellBody::Create2 {
                handshake_type: NTOR_HANDSHAKE_TYPE,
                handshake: ntor.onionskin(),
            },
        );
        let reply = self
            .exchange(Expect::Created2, "CREATED2", self.write_cell(create))
            .await?;
        let handshake = match reply {
            Reply::Created2(handshake) => handshake,
            Reply::Relay(m) => {
                return Err(TorError::UnexpectedCell {
                    expected: "CREATED2".into(),
                    got: format!("RELAY {:?}", m.cell.command),
                })
            }
        };
        let keys = ntor.complete(&handshake)?;
        self.install_hop(0, HopCrypto::new(&keys, HandshakeRole::Initiator)?)?;
        log::debug!("🔑 Hop 0 ({}) keyed", relay.nickname);
        Ok(())
    }

    /// EXTEND2 to the unbuilt hop at `index`, through hop `index - 1`
    async fn extend_hop(&self, index: usize) -> Result<()> {
        let relay = {
            let hops = self.shared.hops.lock()?;
            if hops.built_length != index {
                return Err(TorError::Internal(format!(
                    "extending hop {} with built length {}",
                    index, hops.built_length
                )));
            }
            hops.hops
                .get(index)
                .map(|h| h.relay.clone())
                .ok_or_else(|| TorError::Internal(format!("no hop {} in path", index)))?
        };
        self.take_relay_early()?;

        let ntor = NtorHandshake::new(&relay.identity, &relay.ntor_onion_key);
        let body = Extend2 {
            link_specifiers: relay.link_specifiers(),
            handshake_type: NTOR_HANDSHAKE_TYPE,
            handshake: ntor.onionskin(),
        }
        .encode()?;
        let cell = RelayCell::new(RelayCommand::Extend2, 0, body);

        let reply = self
            .exchange(
                Expect::Extended2,
                "EXTENDED2",
                self.send_relay_to(Some(index), &cell, true),
            )
            .await?;
        let message = relay_reply(reply, index - 1, "EXTENDED2")?;
        let handshake = decode_extended2(&message.cell.data)?;
        let keys = ntor.complete(&handshake)?;
        self.install_hop(index, HopCrypto::new(&keys, HandshakeRole::Initiator)?)?;
        log::info!("📡 Circuit {:#x} extended to {} (hop {})", self.id, relay.nickname, index);
        Ok(())
    }

    fn take_relay_early(&self) -> Result<()> {
        self.relay_early_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| {
                TorError::InvalidState(format!(
                    "circuit {:#x} has no RELAY_EARLY cells left for EXTEND2",
                    self.id
                ))
            })
    }

    fn install_hop(&self, index: usize, crypto: HopCrypto) -> Result<()> {
        let mut hops = self.shared.hops.lock()?;
        if hops.built_length != index {
            return Err(TorError::Internal(format!(
                "installing hop {} with built length {}",
                index, hops.built_length
            )));
        }
        let hop = hops
            .hops
            .get_mut(index)
            .ok_or_else(|| TorError::Internal(format!("no hop {} in path", index)))?;
        hop.crypto = Some(crypto);
        hops.built_length = index + 1;
        Ok(())
    }

    // ===== extend / truncate =====

    /// Append one hop to a built circuit
    pub async fn extend_to(&self, relay: Arc<Relay>) -> Result<()> {
        self.ensure_usable().await?;
        let _control = self.control.lock().await;
        self.require_status(&[CircuitStatus::Standby], "extend")?;

        let index = {
            let mut hops = self.shared.hops.lock()?;
            if hops.built_length == 0 || hops.hops.len() != hops.built_length {
                return Err(TorError::InvalidState(
                    "extend needs a fully built circuit".into(),
                ));
            }
            hops.hops.push(Hop {
                relay,
                crypto: None,
            });
            hops.built_length
        };
        self.extend_pending(index).await
    }

    /// Fill the path with random relays up to `length - 1` hops, then extend
    /// to `destination` as the final hop.
    pub async fn extend_path_to(&self, length: usize, destination: Arc<Relay>) -> Result<()> {
        self.ensure_usable().await?;
        let _control = self.control.lock().await;
        self.require_status(&[CircuitStatus::Standby], "extend")?;

        let (first_new, exclude) = {
            let hops = self.shared.hops.lock()?;
            if hops.built_length == 0 || hops.hops.len() != hops.built_length {
                return Err(TorError::InvalidState(
                    "extend needs a fully built circuit".into(),
                ));
            }
            let mut exclude: Vec<[u8; 20]> = hops.hops.iter().map(|h| h.relay.identity).collect();
            exclude.push(destination.identity);
            (hops.built_length, exclude)
        };

        let fill = length.saturating_sub(1).saturating_sub(first_new);
        let extra = if fill > 0 {
            with_directory_retry(self.ctx.config.directory_retries, || {
                self.ctx.directory.get_extra_relays(fill, &exclude)
            })?
        } else {
            Vec::new()
        };

        {
            let mut hops = self.shared.hops.lock()?;
            for relay in extra.into_iter().chain(std::iter::once(destination)) {
                hops.hops.push(Hop {
                    relay,
                    crypto: None,
                });
            }
        }
        self.extend_pending(first_new).await
    }

    /// Extend every unbuilt hop from `first` on, dropping them all on failure
    async fn extend_pending(&self, first: usize) -> Result<()> {
        let total = self.length();
        for index in first..total {
            if let Err(e) = self.extend_hop(index).await {
                let built = {
                    let mut hops = self.shared.hops.lock()?;
                    let built = hops.built_length;
                    hops.shrink_to(built);
                    built
                };
                if e.kind() != ErrorKind::Usage {
                    self.shared.poison();
                }
                log::warn!(
                    "⚠️ Extending circuit {:#x} past hop {} failed: {}",
                    self.id,
                    built,
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Cut the circuit back to its first `new_length` hops.
    ///
    /// Works from any built state. The truncated circuit is back in
    /// `Standby`: an intro point or rendezvous role lived on the dropped
    /// tail, and any end-to-end layer is discarded with it.
    pub async fn truncate(&self, new_length: usize) -> Result<()> {
        self.ensure_usable().await?;
        let _control = self.control.lock().await;
        self.require_status(
            &[
                CircuitStatus::Standby,
                CircuitStatus::Introducing,
                CircuitStatus::Rendezvous,
            ],
            "truncate",
        )?;
        let previous = self.status();

        let built = self.built_length();
        if new_length == 0 || new_length >= built {
            return Err(TorError::InvalidState(format!(
                "cannot truncate a {}-hop circuit to {} hops",
                built, new_length
            )));
        }

        self.set_status(CircuitStatus::Truncating);
        let cell = RelayCell::new(RelayCommand::Truncate, 0, Vec::new());
        let result = self
            .exchange(
                Expect::Truncated,
                "TRUNCATED",
                self.send_relay_to(Some(new_length), &cell, false),
            )
            .await
            .and_then(|reply| relay_reply(reply, new_length - 1, "TRUNCATED"));

        match result {
            Ok(message) => {
                if let Some(reason) = message.cell.data.first() {
                    log::debug!("TRUNCATED reason: {}", destroy_reason_name(*reason));
                }
                self.shared.hops.lock()?.shrink_to(new_length);
                self.set_status(CircuitStatus::Standby);
                log::info!("✂️ Circuit {:#x} truncated to {} hops", self.id, new_length);
                Ok(())
            }
            Err(e) => {
                self.set_status(previous);
                if e.kind() != ErrorKind::Usage {
                    self.shared.poison();
                }
                Err(e)
            }
        }
    }

    // ===== teardown =====

    /// Send DESTROY, stop dispatch, scrub every hop and close the link.
    /// Destroying a destroyed circuit does nothing.
    pub async fn destroy(&self) -> Result<()> {
        self.teardown(self.destroy_reason(0)).await;
        Ok(())
    }

    /// No DESTROY goes back to a relay that already destroyed the circuit
    fn destroy_reason(&self, reason: u8) -> Option<u8> {
        match self.shared.remote_destroy_reason() {
            Some(_) => None,
            None => Some(reason),
        }
    }

    /// `reason` is the DESTROY reason to send, `None` to send nothing
    async fn teardown(&self, reason: Option<u8>) {
        let previous = match self.status.lock() {
            Ok(mut status) => std::mem::replace(&mut *status, CircuitStatus::Destroyed),
            Err(_) => CircuitStatus::Destroyed,
        };
        if previous == CircuitStatus::Destroyed {
            return;
        }

        // Dispatch must stop before hop state is scrubbed
        let task = self.dispatch.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.shared.cancel_expect();
        if let Err(e) = self.shared.set_mailbox(None) {
            log::warn!("⚠️ Could not close mailbox of circuit {:#x}: {}", self.id, e);
        }
        if let Ok(mut hops) = self.shared.hops.lock() {
            hops.clear();
        }

        let writer = self.link.lock().await.take();
        if let Some(mut writer) = writer {
            if let Some(reason) = reason {
                let destroy = Cell::new(self.id, CellBody::Destroy { reason });
                if let Err(e) = writer.framing.write_cell(&mut writer.half, &destroy).await {
                    log::debug!("DESTROY for circuit {:#x} not sent: {}", self.id, e);
                }
            }
            if let Err(e) = writer.half.close().await {
                log::debug!("Closing link of circuit {:#x}: {}", self.id, e);
            }
        }

        self.release_guard();
        log::info!("🗑️ Circuit {:#x} destroyed", self.id);
    }

    fn release_guard(&self) {
        if let Some(guard) = self.guard {
            if !self.guard_released.swap(true, Ordering::AcqRel) {
                self.ctx.directory.release_guard(&guard);
            }
        }
    }

    // ===== relay traffic =====

    /// Send a relay cell to the far end of the circuit
    pub async fn send_relay(&self, stream_id: u16, command: RelayCommand, data: &[u8]) -> Result<()> {
        self.ensure_usable().await?;
        if data.len() > RelayCell::MAX_DATA_SIZE {
            return Err(TorError::InvalidState(format!(
                "relay data is {} bytes, limit is {}",
                data.len(),
                RelayCell::MAX_DATA_SIZE
            )));
        }
        if self.built_length() == 0 {
            return Err(TorError::InvalidState(format!(
                "circuit {:#x} has no built hops",
                self.id
            )));
        }
        let cell = RelayCell::new(command, stream_id, data.to_vec());
        self.send_relay_to(None, &cell, false).await?;
        log::debug!("📤 {:?} on stream {} ({} bytes)", command, stream_id, data.len());
        Ok(())
    }

    /// Next relay cell from the mailbox
    pub async fn recv_relay(&self) -> Result<RelayCell> {
        self.recv_relay_with_hop().await.map(|m| m.cell)
    }

    /// Next relay cell from the mailbox, with the hop that sent it
    pub async fn recv_relay_with_hop(&self) -> Result<RelayMessage> {
        if self.status() == CircuitStatus::Destroyed {
            return Err(TorError::CircuitClosed(format!(
                "circuit {:#x} is destroyed",
                self.id
            )));
        }

        let item = {
            let mut mailbox = self.mailbox.lock().await;
            match mailbox.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            }
        };

        match item {
            Some(item) => item,
            None => {
                self.teardown(self.destroy_reason(0)).await;
                Err(TorError::CircuitClosed(format!(
                    "mailbox of circuit {:#x} is closed",
                    self.id
                )))
            }
        }
    }

    /// Link-level PADDING, keeps the connection alive
    pub async fn send_padding(&self) -> Result<()> {
        self.ensure_usable().await?;
        self.write_cell(Cell::new(0, CellBody::Padding)).await?;
        log::trace!("Padding sent on circuit {:#x}", self.id);
        Ok(())
    }

    // ===== onion service =====

    /// Turn the last hop into an introduction point for `keys`
    pub async fn establish_intro(&self, keys: &IntroPointKeys) -> Result<()> {
        self.ensure_usable().await?;
        let _control = self.control.lock().await;
        self.require_status(&[CircuitStatus::Standby], "establish intro on")?;

        let (nonce, last) = {
            let hops = self.shared.hops.lock()?;
            let last = hops
                .built_length
                .checked_sub(1)
                .ok_or_else(|| TorError::InvalidState("circuit has no built hops".into()))?;
            let nonce = hops.hops[last]
                .crypto
                .as_ref()
                .and_then(|c| c.nonce())
                .copied()
                .ok_or_else(|| TorError::InvalidState("last hop has no handshake nonce".into()))?;
            (nonce, last)
        };

        let cell = RelayCell::new(
            RelayCommand::EstablishIntro,
            0,
            establish_intro_body(keys, &nonce),
        );
        let result = self
            .exchange(
                Expect::IntroEstablished,
                "INTRO_ESTABLISHED",
                self.send_relay_to(None, &cell, false),
            )
            .await
            .and_then(|reply| relay_reply(reply, last, "INTRO_ESTABLISHED"));

        match result {
            Ok(_) => {
                self.set_status(CircuitStatus::Introducing);
                log::info!(
                    "🛡️ Introduction point established on circuit {:#x}",
                    self.id
                );
                Ok(())
            }
            Err(e) => {
                if e.kind() != ErrorKind::Usage {
                    self.shared.poison();
                }
                Err(e)
            }
        }
    }

    /// Answer an introduction: the last hop must be the requested
    /// rendezvous point. Sends RENDEZVOUS1 and installs the end-to-end layer.
    pub async fn join_rendezvous(
        &self,
        request: &IntroduceRequest,
        keys: &IntroPointKeys,
    ) -> Result<()> {
        self.ensure_usable().await?;
        let _control = self.control.lock().await;
        self.require_status(&[CircuitStatus::Standby], "join rendezvous on")?;

        let built = {
            let hops = self.shared.hops.lock()?;
            let last = hops
                .built_length
                .checked_sub(1)
                .and_then(|i| hops.hops.get(i))
                .ok_or_else(|| TorError::InvalidState("circuit has no built hops".into()))?;
            if last.relay.identity != request.rendezvous_point.identity {
                return Err(TorError::InvalidState(format!(
                    "last hop {} is not the rendezvous point {}",
                    last.relay.fingerprint(),
                    request.rendezvous_point.fingerprint()
                )));
            }
            hops.built_length
        };

        let (service_public, rendezvous) =
            service_rendezvous(keys.enc_secret(), &keys.auth_public(), &request.client_public)?;
        let e2e = HopCrypto::new(&rendezvous.keys, HandshakeRole::Responder)?;
        self.shared.hops.lock()?.e2e = Some(e2e);

        let cell = RelayCell::new(
            RelayCommand::Rendezvous1,
            0,
            rendezvous1_body(
                &request.rendezvous_cookie,
                service_public.as_bytes(),
                &rendezvous.auth_input_mac,
            ),
        );
        if let Err(e) = self.send_relay_to(Some(built), &cell, false).await {
            self.shared.poison();
            return Err(e);
        }

        self.set_status(CircuitStatus::Rendezvous);
        log::info!(
            "🤝 Circuit {:#x} joined rendezvous at {}",
            self.id,
            request.rendezvous_point.nickname
        );
        Ok(())
    }

    // ===== link plumbing =====

    async fn write_cell(&self, cell: Cell) -> Result<()> {
        let mut link = self.link.lock().await;
        let writer = link
            .as_mut()
            .ok_or_else(|| TorError::CircuitClosed(format!("circuit {:#x} has no link", self.id)))?;
        let result = writer.framing.write_cell(&mut writer.half, &cell).await;
        if result.is_err() {
            self.shared.poison();
        }
        result
    }

    /// Encrypt and send a relay cell to hop `upto - 1`, or to the far end
    /// (end-to-end layer included) when `upto` is `None`
    async fn send_relay_to(&self, upto: Option<usize>, cell: &RelayCell, early: bool) -> Result<()> {
        let mut payload = cell.to_payload()?;

        let mut link = self.link.lock().await;
        let writer = link
            .as_mut()
            .ok_or_else(|| TorError::CircuitClosed(format!("circuit {:#x} has no link", self.id)))?;
        {
            let mut hops = self.shared.hops.lock()?;
            match upto {
                Some(n) => hops.originate_to(n, &mut payload)?,
                None => hops.originate_to_end(&mut payload)?,
            }
        }

        let body = if early {
            CellBody::RelayEarly(payload)
        } else {
            CellBody::Relay(payload)
        };
        let result = writer
            .framing
            .write_cell(&mut writer.half, &Cell::new(self.id, body))
            .await;
        if result.is_err() {
            // forward digest already advanced
            self.shared.poison();
        }
        result
    }

    /// Open a reply slot, send, and wait for the reply within the
    /// handshake timeout
    async fn exchange<F>(&self, expect: Expect, what: &str, send: F) -> Result<Reply>
    where
        F: Future<Output = Result<()>>,
    {
        let rx = self.shared.expect(expect)?;
        if let Err(e) = send.await {
            self.shared.cancel_expect();
            return Err(e);
        }
        self.await_reply(rx, what).await
    }

    async fn await_reply(&self, rx: oneshot::Receiver<Result<Reply>>, what: &str) -> Result<Reply> {
        match tokio::time::timeout(self.ctx.config.handshake_timeout(), rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TorError::CircuitClosed(format!(
                "circuit {:#x} stopped while waiting for {}",
                self.id, what
            ))),
            Err(_) => {
                self.shared.cancel_expect();
                Err(TorError::Timeout(format!("waiting for {}", what)))
            }
        }
    }
}

/// A relay reply that must come from hop `from`
fn relay_reply(reply: Reply, from: usize, what: &str) -> Result<RelayMessage> {
    match reply {
        Reply::Relay(message) if message.hop == from => Ok(message),
        Reply::Relay(message) => Err(TorError::ProtocolError(format!(
            "{} came from hop {}, expected hop {}",
            what, message.hop, from
        ))),
        Reply::Created2(_) => Err(TorError::UnexpectedCell {
            expected: what.to_string(),
            got: "CREATED2".into(),
        }),
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        if let Ok(mut task) = self.dispatch.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        self.shared.set_mailbox(None).ok();
        self.release_guard();
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &format_args!("{:#x}", self.id))
            .field("status", &self.status())
            .field("built_length", &self.built_length())
            .field("length", &self.length())
            .finish_non_exhaustive()
    }
}
