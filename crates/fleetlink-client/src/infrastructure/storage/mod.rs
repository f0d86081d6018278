//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML file from an explicit path or the
//! platform config directory, fills in defaults for anything missing, and
//! converts the result into the runtime settings the session and the façade
//! are built from.

pub mod config;
