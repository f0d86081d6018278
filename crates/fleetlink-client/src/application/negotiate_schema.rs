//! Use case: agree on a schema version after the gateway says hello.
//!
//! Runs once per connection, triggered by the version frame:
//!
//! 1. compare ranges with [`fleetlink_core::negotiate_schema`] and record the
//!    outcome on the state machine;
//! 2. if incompatible, put the connection in `Error` and stop: nothing is
//!    sent, and the caller reports the failure to error handlers;
//! 3. otherwise send `set_api_schema` with the chosen version (exempt from
//!    the readiness gate) and, once the gateway accepts it, mark the schema
//!    complete, which makes the connection `Ready`.

use std::sync::Arc;

use fleetlink_core::protocol::messages::{VersionFrame, SET_API_SCHEMA};
use fleetlink_core::{negotiate_schema, ClientSchema};
use serde_json::{json, Map};
use tracing::{info, warn};

use crate::application::error::ClientError;
use crate::application::execute_command::CommandExecutor;
use crate::application::session::CommandError;
use crate::application::track_connection::ConnectionStateMachine;

/// Parameter name of the negotiated version in `set_api_schema`.
pub const SCHEMA_VERSION_PARAM: &str = "schemaVersion";

pub struct SchemaNegotiator {
    client: ClientSchema,
    state: Arc<ConnectionStateMachine>,
    executor: Arc<CommandExecutor>,
}

impl SchemaNegotiator {
    pub fn new(
        client: ClientSchema,
        state: Arc<ConnectionStateMachine>,
        executor: Arc<CommandExecutor>,
    ) -> Self {
        Self {
            client,
            state,
            executor,
        }
    }

    pub fn client_schema(&self) -> ClientSchema {
        self.client
    }

    /// Negotiates against `version`.  Returns the activated schema version.
    ///
    /// # Errors
    ///
    /// - [`ClientError::IncompatibleSchema`] when the ranges do not overlap.
    /// - [`ClientError::CommandFailed`] when the gateway never accepted the
    ///   selected version.
    ///
    /// In both cases the state machine is already in `Error`.
    pub async fn negotiate(&self, version: &VersionFrame) -> Result<u32, ClientError> {
        info!(
            driver = %version.driver_version,
            server = %version.server_version,
            "gateway speaks schema {}..={}",
            version.min_schema_version,
            version.max_schema_version
        );

        let epoch = self.state.connection_epoch();
        let info = negotiate_schema(
            self.client,
            version.min_schema_version,
            version.max_schema_version,
        );
        self.state.set_schema_info(info);

        let Some(selected) = info.negotiated else {
            let err = ClientError::incompatible(&info);
            self.state.set_error(err.to_string());
            return Err(err);
        };

        let mut params = Map::new();
        params.insert(SCHEMA_VERSION_PARAM.to_string(), json!(selected));
        if let Err(err) = self.executor.execute(SET_API_SCHEMA, params).await {
            warn!("schema {selected} was not accepted: {err}");
            self.state.set_error(err.to_string());
            return Err(err);
        }

        if !self.state.complete_schema(epoch) {
            warn!("link {epoch} went away before schema {selected} could be activated");
            return Err(ClientError::CommandFailed {
                command: SET_API_SCHEMA.to_string(),
                attempts: 1,
                source: CommandError::ConnectionClosed,
            });
        }

        info!("schema {selected} active");
        Ok(selected)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
