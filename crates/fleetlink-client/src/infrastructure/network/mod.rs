//! Network infrastructure: the transport session.
//!
//! [`TransportSession`] owns one physical link at a time and everything that
//! lives and dies with it:
//!
//! - the **pending-command map**, correlation id → waiting caller;
//! - the **reconnect state**, attempt counter + backoff schedule;
//! - the **validator**, through which every inbound frame passes first.
//!
//! Architecture:
//!
//! ```text
//!            connect()/send()/disconnect()          SessionEvent (mpsc, in order)
//! caller ──────────────────────────────► TransportSession ─────────────────────► dispatch loop
//!                                           │        ▲
//!                         LinkCommand::Text │        │ LinkEvent::Frame / Closed
//!                                           ▼        │
//!                                         Connector link (WebSocket or in-memory)
//! ```
//!
//! # Inbound routing
//!
//! Each frame is validated, then classified:
//!
//! - `version` → state `NegotiatingSchema`, [`SessionEvent::Version`];
//! - `event`   → [`SessionEvent::Event`];
//! - otherwise → the pending command with that `messageId` is resolved (or
//!   rejected with the gateway's error code).  Unknown ids are dropped.
//!
//! # Closure handling
//!
//! Every closure clears the pending map (each waiter gets
//! [`CommandError::ConnectionClosed`]) and reports the transport as down.  An
//! abnormal closure additionally schedules a reconnect after the backoff
//! delay, unless one is already scheduled or the attempt ceiling is reached.
//! A normal closure, including an explicit [`disconnect`](TransportSession::disconnect),
//! never reconnects and cancels a scheduled reconnect.
//!
//! Each opened link gets a generation number; closures reported for an older
//! generation (e.g. the echo of our own close) are ignored.
//!
//! # Locking
//!
//! All mutable session state sits behind one `std::sync::Mutex`, which is
//! never held across an `.await` or while calling out of this module.

pub mod link;
pub mod mock;
pub mod websocket;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fleetlink_core::protocol::messages::{InboundFrame, OutboundCommand};
use fleetlink_core::{
    ExponentialBackoff, FrameError, MessageValidator, ReconnectState, RejectReason,
    ValidationOutcome, ValidatorConfig, ValidatorStats,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::listeners::lock;
use crate::application::session::{
    CloseKind, CommandError, GatewaySession, SessionEvent, TransportError,
};
use crate::application::track_connection::ConnectionStateMachine;

pub use link::{Connector, Link, LinkCommand, LinkEvent};
pub use mock::{ChannelConnector, GatewayPeer};
pub use websocket::WsConnector;

/// Settings for one [`TransportSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Gateway URL, e.g. `ws://127.0.0.1:3000`.
    pub url: String,
    /// How long `send` waits for the correlated response.
    pub request_timeout: Duration,
    /// Delay schedule between reconnect attempts.
    pub reconnect_backoff: ExponentialBackoff,
    /// Reconnect attempts after a loss before giving up.
    pub max_reconnect_attempts: u32,
    pub validator: ValidatorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000".to_string(),
            request_timeout: Duration::from_secs(30),
            reconnect_backoff: ExponentialBackoff::reconnect(),
            max_reconnect_attempts: 10,
            validator: ValidatorConfig::default(),
        }
    }
}

type Responder = oneshot::Sender<Result<Value, CommandError>>;

struct ActiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<LinkCommand>,
}

struct Inner {
    link: Option<ActiveLink>,
    generation: u64,
    pending: HashMap<String, Responder>,
    reconnect: ReconnectState,
    reconnect_task: Option<JoinHandle<()>>,
    /// Set by `disconnect`, cleared by `connect`.  Stops reconnects.
    closing: bool,
}

/// One logical connection to the gateway, surviving link losses.
pub struct TransportSession {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state: Arc<ConnectionStateMachine>,
    events: mpsc::UnboundedSender<SessionEvent>,
    inner: Mutex<Inner>,
    validator: Mutex<MessageValidator>,
    this: Weak<TransportSession>,
}

impl TransportSession {
    /// Creates a disconnected session.
    ///
    /// Returns the session and the receiver of its [`SessionEvent`]s.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        state: Arc<ConnectionStateMachine>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|this| Self {
            validator: Mutex::new(MessageValidator::new(config.validator.clone())),
            inner: Mutex::new(Inner {
                link: None,
                generation: 0,
                pending: HashMap::new(),
                reconnect: ReconnectState::new(
                    config.reconnect_backoff,
                    config.max_reconnect_attempts,
                ),
                reconnect_task: None,
                closing: false,
            }),
            config,
            connector,
            state,
            events,
            this: this.clone(),
        });
        (session, rx)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner().reconnect.attempts()
    }

    /// Number of commands waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner().pending.len()
    }

    pub fn is_reconnect_scheduled(&self) -> bool {
        self.inner().reconnect_task.is_some()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("session event dropped: no receiver");
        }
    }

    // ── Opening ───────────────────────────────────────────────────────────────

    /// Opens a link.  A no-op when already connected.
    ///
    /// A failure here is returned to the caller and does not start the
    /// reconnect loop; the loop only follows the loss of an open link.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut inner = self.inner();
            if inner.link.is_some() {
                return Ok(());
            }
            inner.closing = false;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
        }

        info!("connecting to {}", self.config.url);
        self.state.set_connecting();
        match self.connector.connect(&self.config.url).await {
            Ok(link) => {
                self.install(link);
                Ok(())
            }
            Err(err) => {
                warn!("{err}");
                self.state.set_transport_connected(false);
                self.emit(SessionEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Adopts a freshly opened link.
    fn install(&self, link: Link) {
        let generation = {
            let mut inner = self.inner();
            if inner.closing {
                drop(inner);
                debug!("link opened after disconnect; closing it");
                let _ = link.outbound.send(LinkCommand::Close);
                return;
            }
            if let Some(active) = &inner.link {
                let current = active.generation;
                drop(inner);
                debug!("link {current} already open; closing the duplicate");
                let _ = link.outbound.send(LinkCommand::Close);
                return;
            }
            inner.generation += 1;
            inner.link = Some(ActiveLink {
                generation: inner.generation,
                outbound: link.outbound,
            });
            inner.reconnect.reset();
            inner.generation
        };

        info!("gateway link {generation} open");
        self.state.set_transport_connected(true);
        self.emit(SessionEvent::Connected);

        tokio::spawn(read_loop(self.this.clone(), generation, link.inbound));
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    fn handle_frame(&self, raw: &[u8]) {
        let outcome = lock(&self.validator).process(raw);
        let value = match outcome {
            ValidationOutcome::Accepted(value) => value,
            ValidationOutcome::Rejected(RejectReason::RateLimited) => {
                debug!("inbound frame dropped: rate limit exceeded");
                return;
            }
            ValidationOutcome::Rejected(reason) => {
                warn!("inbound frame dropped: {reason}");
                return;
            }
        };

        let message_id = value
            .get("messageId")
            .and_then(Value::as_str)
            .map(str::to_string);

        match InboundFrame::classify(value) {
            Ok(InboundFrame::Version(version)) => {
                self.state.set_negotiating();
                self.emit(SessionEvent::Version(version));
            }
            Ok(InboundFrame::Event(event)) => self.emit(SessionEvent::Event(event)),
            Ok(InboundFrame::Result(result)) => {
                let id = result.message_id.clone();
                let outcome = result
                    .into_outcome()
                    .map_err(|error_code| CommandError::Rejected { error_code });
                self.resolve(&id, outcome);
            }
            Err(FrameError::Malformed { frame_type, source }) => match message_id {
                Some(id) => self.resolve(
                    &id,
                    Err(CommandError::MalformedResponse(format!("{frame_type}: {source}"))),
                ),
                None => warn!("malformed {frame_type} frame dropped: {source}"),
            },
            Err(err) => warn!("inbound frame dropped: {err}"),
        }
    }

    fn resolve(&self, message_id: &str, outcome: Result<Value, CommandError>) {
        let responder = self.inner().pending.remove(message_id);
        match responder {
            Some(tx) => {
                // The caller may have given up already; nothing to do then.
                let _ = tx.send(outcome);
            }
            None => debug!(message_id, "response for unknown or expired command ignored"),
        }
    }

    // ── Closing ───────────────────────────────────────────────────────────────

    fn handle_close(&self, generation: u64, kind: CloseKind) {
        let pending = {
            let mut inner = self.inner();
            match &inner.link {
                Some(active) if active.generation == generation => {}
                _ => {
                    debug!(generation, "close of a stale link ignored");
                    return;
                }
            }
            inner.link = None;
            let pending = std::mem::take(&mut inner.pending);
            if !kind.is_normal() && !inner.closing {
                self.schedule_reconnect(&mut inner);
            }
            pending
        };

        match &kind {
            CloseKind::Normal => info!("gateway link {generation} closed normally"),
            CloseKind::Abnormal { code, reason } => {
                warn!(?code, "gateway link {generation} lost: {reason}")
            }
        }
        reject_all(pending);
        self.state.set_transport_connected(false);
        self.emit(SessionEvent::Disconnected(kind));
    }

    /// Schedules one reconnect attempt, if allowed.  Caller holds the lock.
    fn schedule_reconnect(&self, inner: &mut Inner) {
        if inner.reconnect_task.is_some() {
            debug!("reconnect already scheduled");
            return;
        }
        let Some(delay) = inner.reconnect.next_delay() else {
            warn!(
                "giving up after {} reconnect attempts",
                inner.reconnect.attempts()
            );
            return;
        };
        info!(
            attempt = inner.reconnect.attempts(),
            max = inner.reconnect.max_attempts(),
            "reconnecting in {delay:?}"
        );

        let this = self.this.clone();
        inner.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = this.upgrade() {
                session.reconnect().await;
            }
        }));
    }

    async fn reconnect(&self) {
        {
            let mut inner = self.inner();
            inner.reconnect_task = None;
            if inner.closing || inner.link.is_some() {
                return;
            }
        }

        self.state.set_connecting();
        match self.connector.connect(&self.config.url).await {
            Ok(link) => self.install(link),
            Err(err) => {
                warn!("reconnect failed: {err}");
                self.state.set_transport_connected(false);
                self.emit(SessionEvent::Error(err.to_string()));
                let mut inner = self.inner();
                if !inner.closing && inner.link.is_none() {
                    self.schedule_reconnect(&mut inner);
                }
            }
        }
    }

    /// Closes the link normally, cancels any scheduled reconnect and rejects
    /// every pending command.
    pub async fn disconnect(&self) {
        let (link, pending, task) = {
            let mut inner = self.inner();
            inner.closing = true;
            (
                inner.link.take(),
                std::mem::take(&mut inner.pending),
                inner.reconnect_task.take(),
            )
        };

        if let Some(task) = task {
            debug!("scheduled reconnect cancelled");
            task.abort();
        }
        reject_all(pending);
        self.state.set_transport_connected(false);

        if let Some(link) = link {
            info!("closing gateway link {}", link.generation);
            let _ = link.outbound.send(LinkCommand::Close);
            self.emit(SessionEvent::Disconnected(CloseKind::Normal));
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Sends `command` and waits for the response with the same id.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotConnected`] without a link; nothing is registered.
    /// - [`CommandError::DuplicateId`] when the id is already in flight.
    /// - [`CommandError::Timeout`] after `request_timeout`.
    /// - [`CommandError::ConnectionClosed`] when the link goes away first.
    /// - [`CommandError::Rejected`] when the gateway reports failure.
    pub async fn send(&self, command: OutboundCommand) -> Result<Value, CommandError> {
        let text = command
            .to_json()
            .map_err(|e| CommandError::Encode(e.to_string()))?;
        let message_id = command.message_id;

        let rx = {
            let mut inner = self.inner();
            let Some(link) = &inner.link else {
                return Err(CommandError::NotConnected);
            };
            let outbound = link.outbound.clone();
            if inner.pending.contains_key(&message_id) {
                return Err(CommandError::DuplicateId(message_id));
            }
            let (tx, rx) = oneshot::channel();
            inner.pending.insert(message_id.clone(), tx);
            if outbound.send(LinkCommand::Text(text)).is_err() {
                inner.pending.remove(&message_id);
                return Err(CommandError::ConnectionClosed);
            }
            rx
        };

        let _guard = PendingGuard {
            session: self,
            message_id: &message_id,
        };
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CommandError::ConnectionClosed),
            Err(_) => {
                warn!(%message_id, "command timed out after {:?}", self.config.request_timeout);
                Err(CommandError::Timeout {
                    message_id: message_id.clone(),
                    after: self.config.request_timeout,
                })
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner().link.is_some()
    }

    pub fn validator_stats(&self) -> ValidatorStats {
        lock(&self.validator).stats()
    }

    pub fn reset_validator_stats(&self) {
        lock(&self.validator).reset_stats();
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        let inner = lock(&self.inner);
        if let Some(task) = &inner.reconnect_task {
            task.abort();
        }
        if let Some(link) = &inner.link {
            let _ = link.outbound.send(LinkCommand::Close);
        }
    }
}

#[async_trait]
impl GatewaySession for TransportSession {
    async fn connect(&self) -> Result<(), TransportError> {
        TransportSession::connect(self).await
    }

    async fn disconnect(&self) {
        TransportSession::disconnect(self).await
    }

    async fn send(&self, command: OutboundCommand) -> Result<Value, CommandError> {
        TransportSession::send(self, command).await
    }

    fn is_connected(&self) -> bool {
        TransportSession::is_connected(self)
    }

    fn validator_stats(&self) -> ValidatorStats {
        TransportSession::validator_stats(self)
    }

    fn reset_validator_stats(&self) {
        TransportSession::reset_validator_stats(self)
    }
}

/// Removes a pending entry when its `send` future ends for any reason,
/// including being dropped by the caller.
struct PendingGuard<'a> {
    session: &'a TransportSession,
    message_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.inner().pending.remove(self.message_id);
    }
}

fn reject_all(pending: HashMap<String, Responder>) {
    if !pending.is_empty() {
        debug!(count = pending.len(), "rejecting pending commands");
    }
    for (_, tx) in pending {
        let _ = tx.send(Err(CommandError::ConnectionClosed));
    }
}

/// Pumps one link's inbound channel into the session.
async fn read_loop(
    session: Weak<TransportSession>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = inbound.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        match event {
            LinkEvent::Frame(bytes) => session.handle_frame(&bytes),
            LinkEvent::Closed(kind) => {
                session.handle_close(generation, kind);
                return;
            }
        }
    }
    if let Some(session) = session.upgrade() {
        session.handle_close(
            generation,
            CloseKind::Abnormal {
                code: None,
                reason: "link dropped without a close".to_string(),
            },
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
