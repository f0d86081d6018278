//! fleetlink-client library entry point.
//!
//! Exposes the module tree to the binary and to the integration tests in
//! `tests/`, and provides [`build_client`], which wires the layers together:
//!
//! ```text
//! ConnectionStateMachine ◄──── TransportSession ◄──── Connector (WebSocket / in-memory)
//!          ▲                        │ SessionEvent
//!          │                        ▼
//!          └────────────────── GatewayClient ──► EventRegistry / CommandExecutor / SchemaNegotiator
//! ```
//!
//! The application layer only knows the session through the
//! [`GatewaySession`](application::session::GatewaySession) trait, so this
//! function is the one place where a concrete transport meets the façade.

pub mod application;
pub mod infrastructure;

use std::sync::Arc;

use tracing::debug;

pub use application::client::{ClientOptions, GatewayClient};
pub use application::dispatch_events::SubscriptionFilter;
pub use application::error::ClientError;
pub use application::listeners::ListenerHandle;
pub use application::session::{CloseKind, CommandError, TransportError};
pub use infrastructure::network::{ChannelConnector, Connector, GatewayPeer, SessionConfig, WsConnector};

use application::track_connection::ConnectionStateMachine;
use infrastructure::network::TransportSession;

/// Builds a client talking to `settings.url` through `connector`.
///
/// Nothing is opened until [`GatewayClient::connect`] is called.
///
/// # Panics
///
/// Panics when called outside a tokio runtime.
pub fn build_client(
    settings: SessionConfig,
    options: ClientOptions,
    connector: Arc<dyn Connector>,
) -> GatewayClient {
    debug!(url = %settings.url, "building gateway client");
    let state = Arc::new(ConnectionStateMachine::new());
    let (session, session_events) = TransportSession::new(settings, connector, Arc::clone(&state));
    GatewayClient::new(options, state, session, session_events)
}
