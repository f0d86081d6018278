//! A transport link as a pair of channels.
//!
//! The session does not care whether frames travel over a WebSocket or an
//! in-memory pipe.  A [`Connector`] opens a [`Link`]: an outbound channel of
//! [`LinkCommand`]s and an inbound channel of [`LinkEvent`]s.  The connector
//! owns whatever tasks pump the real socket.
//!
//! Invariants every connector upholds:
//!
//! - `connect` returns only once the link is open;
//! - the inbound channel yields frames in arrival order and ends with at
//!   most one [`LinkEvent::Closed`];
//! - after [`LinkCommand::Close`] the link closes with [`CloseKind::Normal`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::application::session::{CloseKind, TransportError};

/// Client → link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Send one text frame.
    Text(String),
    /// Close normally.
    Close,
}

/// Link → client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One raw inbound frame, not yet validated.
    Frame(Vec<u8>),
    /// The link is gone.
    Closed(CloseKind),
}

/// An open link.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<LinkCommand>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to a gateway URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link, TransportError>;
}
