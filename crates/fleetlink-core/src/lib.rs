//! # fleetlink-core
//!
//! Shared library for FleetLink containing the gateway wire frames, the
//! inbound frame validator, and the pure connection-domain types that the
//! client runtime builds on.
//!
//! This crate has zero dependencies on async runtimes or network sockets, so
//! everything in it can be unit-tested without a gateway.
//!
//! # Architecture overview
//!
//! FleetLink talks to a remote command/event gateway that controls a fleet of
//! devices.  The gateway speaks JSON text frames over a WebSocket:
//!
//! - a **version** frame announcing which schema versions the gateway accepts,
//! - **result** frames answering commands by correlation id,
//! - **event** frames pushed whenever something happens on a device.
//!
//! This crate defines:
//!
//! - **`protocol`** – The frame shapes (`messages`) and the defensive
//!   validator every raw inbound frame passes through before it is trusted.
//!
//! - **`domain`** – Connection lifecycle state, the schema negotiation rule,
//!   and the exponential backoff arithmetic used for reconnects and retries.

pub mod domain;
pub mod protocol;

pub use domain::backoff::{ExponentialBackoff, ReconnectState};
pub use domain::connection::{ConnectionSnapshot, ConnectionState, SchemaCompatibilityInfo};
pub use domain::schema::{negotiate_schema, ClientSchema};
pub use protocol::messages::{
    EventFrame, FrameError, GatewayEvent, InboundFrame, OutboundCommand, ResultFrame,
    VersionFrame,
};
pub use protocol::validator::{
    MessageValidator, RejectReason, ValidationOutcome, ValidatorConfig, ValidatorStats,
};
