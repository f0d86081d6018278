//! Protocol module containing the gateway frame types and the inbound validator.

pub mod messages;
pub mod validator;

pub use messages::*;
pub use validator::{MessageValidator, RejectReason, ValidationOutcome, ValidatorConfig};
