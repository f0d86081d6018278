//! Infrastructure layer for the gateway client.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `fleetlink_core`, but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`network`** – the transport session (pending commands, reconnect
//!   loop, inbound validation), the `Connector` seam, the WebSocket
//!   connector and an in-memory connector for tests.
//!
//! - **`storage`** – the TOML configuration file.

pub mod network;
pub mod storage;
