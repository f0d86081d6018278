//! Domain entities for FleetLink.
//!
//! Pure connection logic with no I/O: the lifecycle state vocabulary, the
//! schema version selection rule, and backoff arithmetic.  Code in the client
//! crate's application and infrastructure layers depends on these types, but
//! this module never depends on them.

pub mod backoff;
pub mod connection;
pub mod schema;
