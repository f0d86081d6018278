//! Errors surfaced to callers of the client façade.

use std::time::Duration;

use fleetlink_core::{ConnectionState, SchemaCompatibilityInfo};
use thiserror::Error;

use crate::application::session::{CommandError, TransportError};

/// Error returned by [`GatewayClient`](crate::application::client::GatewayClient)
/// operations and delivered to `on_error` handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// A command other than schema selection was issued before `Ready`.
    #[error("gateway client is not ready (state: {state})")]
    NotReady { state: ConnectionState },

    /// Every attempt failed, or a non-retryable failure happened.
    #[error("command {command} failed after {attempts} attempt(s): {source}")]
    CommandFailed {
        command: String,
        attempts: u32,
        #[source]
        source: CommandError,
    },

    /// The gateway's schema range does not overlap what this client speaks.
    #[error(
        "incompatible schema: client needs at least {client_min}, gateway speaks {server_min}..={server_max}"
    )]
    IncompatibleSchema {
        client_min: u32,
        server_min: u32,
        server_max: u32,
    },

    /// Command parameters were not a JSON object.
    #[error("command parameters must be a JSON object")]
    InvalidParams,

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connection entered `Error` for a reason other than the schema.
    #[error("connection failed: {0}")]
    Faulted(String),

    /// `wait_until_ready` gave up.
    #[error("client did not become ready within {0:?}")]
    ReadyTimeout(Duration),
}

impl ClientError {
    pub(crate) fn incompatible(info: &SchemaCompatibilityInfo) -> Self {
        ClientError::IncompatibleSchema {
            client_min: info.client_min,
            server_min: info.server_min,
            server_max: info.server_max,
        }
    }

    /// `true` when retrying cannot help: the caller has to change something
    /// (the gateway version, or the request itself).
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::IncompatibleSchema { .. } | ClientError::InvalidParams => true,
            ClientError::CommandFailed { source, .. } => !source.is_retryable(),
            _ => false,
        }
    }
}
