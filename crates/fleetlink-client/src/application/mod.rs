//! Application layer use cases for the gateway client.
//!
//! # What use cases does the client have?
//!
//! - **`track_connection`** – the connection state machine.  Single owner of
//!   the lifecycle state; notifies subscribers on every change.
//!
//! - **`negotiate_schema`** – reacts to the gateway's version frame by
//!   selecting and activating a schema version.
//!
//! - **`execute_command`** – sends one command through the session with the
//!   readiness gate and the retry policy applied.
//!
//! - **`dispatch_events`** – the filtered event subscription registry.
//!
//! - **`client`** – [`GatewayClient`](client::GatewayClient), the façade that
//!   wires the use cases together and runs the session-event dispatch loop.
//!
//! `session` defines the seam to the transport ([`session::GatewaySession`])
//! and `listeners` the panic-isolating observer plumbing used throughout.
//!
//! **Dependency rule**: nothing in here imports `crate::infrastructure`.

pub mod client;
pub mod dispatch_events;
pub mod error;
pub mod execute_command;
pub mod listeners;
pub mod negotiate_schema;
pub mod session;
pub mod track_connection;
