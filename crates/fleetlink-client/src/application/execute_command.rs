//! Use case: execute one gateway command.
//!
//! # Readiness gate
//!
//! Commands are refused with [`ClientError::NotReady`] until the connection
//! is `Ready`.  The one exception is `set_api_schema`, which is how the
//! connection *becomes* ready.
//!
//! # Retry
//!
//! Each attempt gets a fresh UUID correlation id.  A failed attempt `k` is
//! followed by a `250 ms · 2^(k-1)` pause (+ up to 10 % jitter) and a new
//! attempt, up to three attempts in total.  Failures that another attempt
//! cannot fix ([`CommandError::is_retryable`]) are returned immediately.

use std::sync::Arc;

use fleetlink_core::protocol::messages::{OutboundCommand, SET_API_SCHEMA};
use fleetlink_core::ExponentialBackoff;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::error::ClientError;
use crate::application::session::GatewaySession;
use crate::application::track_connection::ConnectionStateMachine;

/// How often and how patiently a failed command is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.  Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: ExponentialBackoff::command_retry(),
        }
    }
}

/// Sends commands through a [`GatewaySession`] with gating and retry.
pub struct CommandExecutor {
    session: Arc<dyn GatewaySession>,
    state: Arc<ConnectionStateMachine>,
    retry: RetryPolicy,
}

impl CommandExecutor {
    pub fn new(
        session: Arc<dyn GatewaySession>,
        state: Arc<ConnectionStateMachine>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            session,
            state,
            retry,
        }
    }

    /// Runs `command` with `params` flattened into the envelope.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotReady`] when gated.
    /// - [`ClientError::CommandFailed`] carrying the last attempt's error.
    pub async fn execute(
        &self,
        command: &str,
        params: Map<String, Value>,
    ) -> Result<Value, ClientError> {
        if command != SET_API_SCHEMA && !self.state.is_ready() {
            return Err(ClientError::NotReady {
                state: self.state.state(),
            });
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let message_id = Uuid::new_v4().to_string();
            debug!(command, %message_id, attempt, "sending command");
            let envelope = OutboundCommand::new(message_id, command, params.clone());

            match self.session.send(envelope).await {
                Ok(result) => return Ok(result),
                Err(source) if !source.is_retryable() || attempt >= max_attempts => {
                    warn!(command, attempt, "command failed: {source}");
                    return Err(ClientError::CommandFailed {
                        command: command.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(source) => {
                    let delay = self.retry.backoff.delay(attempt);
                    debug!(command, attempt, ?delay, "command attempt failed, retrying: {source}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Like [`execute`](Self::execute), taking parameters as any JSON value.
    ///
    /// `null` means "no parameters"; anything but an object is rejected with
    /// [`ClientError::InvalidParams`].
    pub async fn execute_value(&self, command: &str, params: Value) -> Result<Value, ClientError> {
        let params = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            _ => return Err(ClientError::InvalidParams),
        };
        self.execute(command, params).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
