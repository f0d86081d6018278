//! Connection lifecycle vocabulary.
//!
//! These are plain data types.  The state machine that mutates them lives in
//! the client crate (`application::track_connection`); everything else only
//! ever sees a [`ConnectionSnapshot`].
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► NegotiatingSchema ─► Ready
//!       ▲                                                          │
//!       └──────────── transport loss / explicit disconnect ◄───────┘
//!                  (Error reachable from any state on a fault)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport, and no attempt in progress.
    Disconnected,
    /// Transport open in progress.
    Connecting,
    /// Transport open; the gateway has not announced its version yet.
    Connected,
    /// Version frame received; schema selection in flight.
    NegotiatingSchema,
    /// Transport open and schema negotiated.  Commands are allowed.
    Ready,
    /// A fault was recorded.  See [`ConnectionSnapshot::last_error`].
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::NegotiatingSchema => "negotiating_schema",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Outcome of comparing the client's schema range with the gateway's.
///
/// Created once per connection attempt when the version frame arrives and
/// cleared again on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCompatibilityInfo {
    pub client_min: u32,
    pub client_preferred: u32,
    pub server_min: u32,
    pub server_max: u32,
    /// Selected version, `None` when incompatible.
    pub negotiated: Option<u32>,
    pub is_compatible: bool,
}

/// Read-only view of the connection state handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub transport_connected: bool,
    pub schema_complete: bool,
    /// Whether the gateway reports its own device driver as connected.
    pub driver_connected: bool,
    pub last_error: Option<String>,
    pub schema: Option<SchemaCompatibilityInfo>,
    /// Number of registered state-change subscribers.
    pub subscriber_count: usize,
}

impl ConnectionSnapshot {
    /// `Ready` state with both underlying flags set.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready && self.transport_connected && self.schema_complete
    }
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transport_connected: false,
            schema_complete: false,
            driver_connected: false,
            last_error: None,
            schema: None,
            subscriber_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot_is_disconnected_and_not_ready() {
        let snapshot = ConnectionSnapshot::default();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(!snapshot.is_ready());
    }

    #[test]
    fn test_ready_state_without_flags_is_not_ready() {
        let snapshot = ConnectionSnapshot {
            state: ConnectionState::Ready,
            transport_connected: true,
            ..ConnectionSnapshot::default()
        };
        assert!(!snapshot.is_ready());
    }

    #[test]
    fn test_state_display_is_snake_case() {
        assert_eq!(ConnectionState::NegotiatingSchema.to_string(), "negotiating_schema");
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
    }
}
