//! The seam between the application layer and the transport.
//!
//! The application layer never touches sockets.  It talks to a
//! [`GatewaySession`] (implemented by
//! `infrastructure::network::TransportSession`) and consumes the
//! [`SessionEvent`]s that session emits, strictly in arrival order.

use std::time::Duration;

use async_trait::async_trait;
use fleetlink_core::protocol::messages::{GatewayEvent, OutboundCommand, VersionFrame};
use fleetlink_core::ValidatorStats;
use serde_json::Value;
use thiserror::Error;

/// How a transport link ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseKind {
    /// Close code 1000, or an explicit [`GatewaySession::disconnect`].
    Normal,
    /// Any other close code, a socket error, or the stream simply ending.
    Abnormal { code: Option<u16>, reason: String },
}

impl CloseKind {
    /// WebSocket close code for a normal closure.
    pub const NORMAL_CODE: u16 = 1000;

    /// Classifies a close code.
    pub fn from_code(code: u16, reason: impl Into<String>) -> Self {
        if code == Self::NORMAL_CODE {
            CloseKind::Normal
        } else {
            CloseKind::Abnormal {
                code: Some(code),
                reason: reason.into(),
            }
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, CloseKind::Normal)
    }
}

/// Notifications emitted by a session, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport opened.
    Connected,
    /// The transport closed; pending commands have already been rejected.
    Disconnected(CloseKind),
    /// The gateway announced its versions.
    Version(VersionFrame),
    /// The gateway pushed an event.
    Event(GatewayEvent),
    /// A transport fault that did not produce a `Disconnected` (e.g. a
    /// refused reconnect attempt).
    Error(String),
}

/// Failure of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid gateway url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
}

/// Failure of one command attempt at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// No transport link; nothing was sent.
    #[error("not connected to the gateway")]
    NotConnected,

    /// The link closed before the response arrived.
    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// No response within the request timeout.  A late response is ignored.
    #[error("no response to {message_id} within {after:?}")]
    Timeout { message_id: String, after: Duration },

    /// The gateway answered `success: false`.
    #[error("gateway rejected the command: {error_code}")]
    Rejected { error_code: String },

    /// Another in-flight command already uses this correlation id.
    #[error("correlation id {0} is already in flight")]
    DuplicateId(String),

    /// The command could not be serialized.
    #[error("failed to encode command: {0}")]
    Encode(String),

    /// A response carried our correlation id but not the result shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl CommandError {
    /// Whether another attempt with a fresh correlation id can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CommandError::Encode(_) | CommandError::DuplicateId(_))
    }
}

/// What the application layer needs from a transport session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewaySession: Send + Sync {
    /// Opens the transport.  Resolves once it is open.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Closes the transport normally.  No reconnect follows.
    async fn disconnect(&self);

    /// Sends one command and waits for its correlated response.
    async fn send(&self, command: OutboundCommand) -> Result<Value, CommandError>;

    fn is_connected(&self) -> bool;

    fn validator_stats(&self) -> ValidatorStats;

    fn reset_validator_stats(&self);
}
