//! The client façade.
//!
//! [`GatewayClient`] is what consumers hold.  It owns the event registry and
//! the error channel, runs commands through the [`CommandExecutor`], and
//! drives a background *dispatch loop* that consumes [`SessionEvent`]s one at
//! a time, in arrival order:
//!
//! ```text
//! SessionEvent::Version(v)      → spawn schema negotiation (replacing any running one)
//! SessionEvent::Event(e)        → update driver flag → EventRegistry::dispatch
//! SessionEvent::Disconnected(_) → cancel a running negotiation
//! SessionEvent::Connected/Error → log only (state is already updated by the session)
//! ```
//!
//! Negotiation runs in its own task so that a slow `set_api_schema` round
//! trip never holds up the frames queued behind the version frame.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetlink_core::protocol::messages::{driver_event, event_source, START_LISTENING};
use fleetlink_core::{
    ClientSchema, ConnectionSnapshot, ConnectionState, GatewayEvent, SchemaCompatibilityInfo, ValidatorStats,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::dispatch_events::{EventRegistry, SubscriptionFilter};
use crate::application::error::ClientError;
use crate::application::execute_command::{CommandExecutor, RetryPolicy};
use crate::application::listeners::{lock, ListenerHandle, ListenerSet};
use crate::application::negotiate_schema::SchemaNegotiator;
use crate::application::session::{CloseKind, GatewaySession, SessionEvent};
use crate::application::track_connection::ConnectionStateMachine;

/// Façade settings that do not belong to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClientOptions {
    pub schema: ClientSchema,
    pub retry: RetryPolicy,
}

/// Entry point for consumers: connect, send commands, subscribe to events.
pub struct GatewayClient {
    session: Arc<dyn GatewaySession>,
    state: Arc<ConnectionStateMachine>,
    executor: Arc<CommandExecutor>,
    events: Arc<EventRegistry>,
    errors: Arc<ListenerSet<ClientError>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayClient {
    /// Wires the façade on top of `session` and starts the dispatch loop.
    ///
    /// `session_events` must be the receiver paired with `session`, and
    /// `state` the machine `session` reports to.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(
        options: ClientOptions,
        state: Arc<ConnectionStateMachine>,
        session: Arc<dyn GatewaySession>,
        session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&session),
            Arc::clone(&state),
            options.retry,
        ));
        let negotiator = Arc::new(SchemaNegotiator::new(
            options.schema,
            Arc::clone(&state),
            Arc::clone(&executor),
        ));
        let events = Arc::new(EventRegistry::new());
        let errors = Arc::new(ListenerSet::new("error handler"));

        let dispatcher = Dispatcher {
            state: Arc::clone(&state),
            negotiator,
            events: Arc::clone(&events),
            errors: Arc::clone(&errors),
            negotiation: None,
        };
        let handle = tokio::spawn(dispatcher.run(session_events));

        Self {
            session,
            state,
            executor,
            events,
            errors,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Opens the transport.  Readiness follows once negotiation completes;
    /// see [`wait_until_ready`](Self::wait_until_ready).
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.session.connect().await.map_err(ClientError::from)
    }

    /// Closes the transport normally.  No reconnect follows; `connect` may
    /// be called again later.
    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// Disconnects and stops the dispatch loop.  The client is inert afterwards.
    pub async fn shutdown(&self) {
        self.session.disconnect().await;
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        info!("gateway client shut down");
    }

    /// Waits until the connection is `Ready`, or until it enters `Error`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::IncompatibleSchema`] when negotiation found no
    ///   common version.
    /// - [`ClientError::Faulted`] for any other fault recorded on the state
    ///   machine.
    /// - [`ClientError::ReadyTimeout`] when `timeout` elapses first.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.state.watch();
        let settled = rx.wait_for(|s| s.is_ready() || s.state == ConnectionState::Error);
        let outcome = tokio::time::timeout(timeout, settled)
            .await
            .map(|changed| changed.map(|snapshot| snapshot.clone()));
        match outcome {
            Ok(Ok(snapshot)) if snapshot.is_ready() => Ok(()),
            Ok(Ok(snapshot)) => Err(fault_of(snapshot)),
            Ok(Err(_)) | Err(_) => Err(ClientError::ReadyTimeout(timeout)),
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Sends `command` with `params` (a JSON object, or `null` for none).
    ///
    /// # Errors
    ///
    /// [`ClientError::NotReady`] before negotiation completes,
    /// [`ClientError::InvalidParams`] for non-object params, and
    /// [`ClientError::CommandFailed`] once retries are exhausted.
    pub async fn send_command(&self, command: &str, params: Value) -> Result<Value, ClientError> {
        self.executor.execute_value(command, params).await
    }

    /// Asks the gateway to start pushing events and returns its state dump.
    ///
    /// The driver flag is taken from `state.driver.connected` when present.
    pub async fn start_listening(&self) -> Result<Value, ClientError> {
        let result = self.send_command(START_LISTENING, Value::Null).await?;
        if let Some(connected) = result
            .pointer("/state/driver/connected")
            .and_then(Value::as_bool)
        {
            self.state.set_driver_connected(connected);
        }
        Ok(result)
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Subscribes to gateway events named `event_type`.
    pub fn add_event_listener(
        &self,
        event_type: impl Into<String>,
        filter: SubscriptionFilter,
        callback: impl Fn(&GatewayEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.events.add(event_type, filter, callback)
    }

    pub fn remove_event_listeners_by_type(&self, event_type: &str) -> usize {
        self.events.remove_by_event_type(event_type)
    }

    pub fn remove_event_listeners_by_types(&self, event_types: &[&str]) -> usize {
        self.events.remove_by_event_types(event_types)
    }

    pub fn remove_event_listeners_by_serial_number(&self, serial_number: &str) -> usize {
        self.events.remove_by_serial_number(serial_number)
    }

    pub fn event_listener_count(&self) -> usize {
        self.events.subscriber_count()
    }

    // ── State & diagnostics ───────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionSnapshot {
        self.state.snapshot()
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.watch()
    }

    /// Subscribes to every state change.
    pub fn on_state_change(
        &self,
        callback: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.state.subscribe(callback)
    }

    /// Subscribes to user-visible errors: incompatible gateway schema and
    /// failed schema selection.
    pub fn on_error(
        &self,
        handler: impl Fn(&ClientError) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.errors.add(handler)
    }

    /// Schema comparison for the current connection, if a version frame has
    /// been received since the last disconnect.
    pub fn schema_info(&self) -> Option<SchemaCompatibilityInfo> {
        self.state.schema_info()
    }

    pub fn validator_stats(&self) -> ValidatorStats {
        self.session.validator_stats()
    }

    pub fn reset_validator_stats(&self) {
        self.session.reset_validator_stats();
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
    }
}

/// The error a snapshot in `Error` stands for.
fn fault_of(snapshot: ConnectionSnapshot) -> ClientError {
    match snapshot.schema {
        Some(info) if !info.is_compatible => ClientError::incompatible(&info),
        _ => ClientError::Faulted(
            snapshot
                .last_error
                .unwrap_or_else(|| "unknown connection error".to_string()),
        ),
    }
}

// ── Dispatch loop ─────────────────────────────────────────────────────────────

struct Dispatcher {
    state: Arc<ConnectionStateMachine>,
    negotiator: Arc<SchemaNegotiator>,
    events: Arc<EventRegistry>,
    errors: Arc<ListenerSet<ClientError>>,
    negotiation: Option<JoinHandle<()>>,
}

impl Dispatcher {
    async fn run(mut self, mut session_events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = session_events.recv().await {
            self.handle(event);
        }
        debug!("session event stream ended");
        self.cancel_negotiation();
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => info!("gateway transport open, waiting for version"),
            SessionEvent::Disconnected(kind) => {
                self.cancel_negotiation();
                match kind {
                    CloseKind::Normal => info!("gateway transport closed"),
                    CloseKind::Abnormal { code, reason } => {
                        warn!(?code, "gateway transport lost: {reason}")
                    }
                }
            }
            SessionEvent::Version(frame) => {
                self.cancel_negotiation();
                let negotiator = Arc::clone(&self.negotiator);
                let errors = Arc::clone(&self.errors);
                self.negotiation = Some(tokio::spawn(async move {
                    if let Err(err) = negotiator.negotiate(&frame).await {
                        errors.notify(&err);
                    }
                }));
            }
            SessionEvent::Event(event) => {
                self.track_driver(&event);
                self.events.dispatch(&event);
            }
            SessionEvent::Error(message) => warn!("transport fault: {message}"),
        }
    }

    fn track_driver(&self, event: &GatewayEvent) {
        if event.source != event_source::DRIVER {
            return;
        }
        match event.event.as_str() {
            driver_event::CONNECTED => self.state.set_driver_connected(true),
            driver_event::DISCONNECTED => self.state.set_driver_connected(false),
            _ => {}
        }
    }

    fn cancel_negotiation(&mut self) {
        if let Some(handle) = self.negotiation.take() {
            handle.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::session::MockGatewaySession;
    use fleetlink_core::protocol::messages::VersionFrame;
    use fleetlink_core::ConnectionState;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client_with(
        session: MockGatewaySession,
    ) -> (GatewayClient, Arc<ConnectionStateMachine>, mpsc::UnboundedSender<SessionEvent>) {
        let state = Arc::new(ConnectionStateMachine::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let client = GatewayClient::new(ClientOptions::default(), Arc::clone(&state), Arc::new(session), rx);
        (client, state, tx)
    }

    fn driver_event(name: &str) -> GatewayEvent {
        GatewayEvent {
            source: "driver".into(),
            event: name.into(),
            fields: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_driver_events_update_the_driver_flag() {
        // Arrange
        let (client, state, tx) = client_with(MockGatewaySession::new());
        state.set_transport_connected(true);
        let mut rx = client.state_watch();

        // Act
        tx.send(SessionEvent::Event(driver_event("connected"))).unwrap();
        rx.wait_for(|s| s.driver_connected).await.unwrap();
        tx.send(SessionEvent::Event(driver_event("disconnected"))).unwrap();
        rx.wait_for(|s| !s.driver_connected).await.unwrap();

        // Assert
        assert!(!client.state().driver_connected);
    }

    #[tokio::test]
    async fn test_events_reach_listeners_through_the_loop() {
        let (client, _state, tx) = client_with(MockGatewaySession::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let _h = client.add_event_listener("connected", SubscriptionFilter::default(), move |e| {
            let _ = seen_tx.send(e.source.clone());
        });

        tx.send(SessionEvent::Event(driver_event("connected"))).unwrap();

        assert_eq!(seen_rx.recv().await.as_deref(), Some("driver"));
        assert_eq!(client.event_listener_count(), 1);
    }

    #[tokio::test]
    async fn test_incompatible_version_reaches_error_handlers() {
        // Arrange
        let (client, state, tx) = client_with(MockGatewaySession::new());
        state.set_transport_connected(true);
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let _h = client.on_error(move |e| {
            let _ = err_tx.send(e.clone());
        });

        // Act
        tx.send(SessionEvent::Version(VersionFrame {
            driver_version: "1".into(),
            server_version: "1".into(),
            min_schema_version: 10,
            max_schema_version: 12,
        }))
        .unwrap();

        // Assert
        let err = err_rx.recv().await.expect("error reported");
        assert!(err.is_fatal());
        assert_eq!(client.state().state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_start_listening_records_driver_state() {
        let mut session = MockGatewaySession::new();
        session
            .expect_send()
            .withf(|cmd| cmd.command == START_LISTENING)
            .returning(|_| Ok(json!({"state": {"driver": {"connected": true}}})));
        let (client, state, _tx) = client_with(session);
        state.set_transport_connected(true);
        state.set_schema_complete(true);

        client.start_listening().await.unwrap();

        assert!(client.state().driver_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_fails_fast_on_incompatible_gateway() {
        // Arrange
        let (client, state, tx) = client_with(MockGatewaySession::new());
        state.set_transport_connected(true);
        let waiter = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let result = client.wait_until_ready(Duration::from_secs(30)).await;
            (result, started.elapsed())
        });

        // Act
        tx.send(SessionEvent::Version(VersionFrame {
            driver_version: "1".into(),
            server_version: "1".into(),
            min_schema_version: 10,
            max_schema_version: 12,
        }))
        .unwrap();
        let (result, waited) = waiter.await.unwrap();

        // Assert
        assert_eq!(
            result,
            Err(ClientError::IncompatibleSchema {
                client_min: 13,
                server_min: 10,
                server_max: 12,
            })
        );
        assert!(waited < Duration::from_secs(30), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_wait_until_ready_reports_other_faults() {
        let (client, state, _tx) = client_with(MockGatewaySession::new());
        state.set_transport_connected(true);
        state.set_error("set_api_schema rejected");

        let err = client.wait_until_ready(Duration::from_secs(5)).await.unwrap_err();

        assert_eq!(err, ClientError::Faulted("set_api_schema rejected".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_times_out() {
        let (client, _state, _tx) = client_with(MockGatewaySession::new());

        let err = client.wait_until_ready(Duration::from_secs(5)).await.unwrap_err();

        assert_eq!(err, ClientError::ReadyTimeout(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_state_change_callbacks_fire() {
        let (client, state, _tx) = client_with(MockGatewaySession::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = client.on_state_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        state.set_transport_connected(true);
        assert!(handle.remove());
        state.set_transport_connected(false);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validator_stats_come_from_the_session() {
        let mut session = MockGatewaySession::new();
        session.expect_validator_stats().returning(|| ValidatorStats {
            processed: 4,
            rejected: 1,
            rate_limited: 0,
        });
        session.expect_reset_validator_stats().times(1).return_const(());
        let (client, _state, _tx) = client_with(session);

        assert_eq!(client.validator_stats().processed, 4);
        client.reset_validator_stats();
    }
}
