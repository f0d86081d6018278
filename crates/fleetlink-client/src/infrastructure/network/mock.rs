//! In-memory connector for tests and embedders.
//!
//! [`ChannelConnector`] hands out [`Link`]s backed by plain channels.  For
//! every link it opens, the other end is delivered as a [`GatewayPeer`] that
//! plays the gateway: it reads the client's commands and writes version,
//! result and event frames back.
//!
//! ```ignore
//! let (connector, mut peers) = ChannelConnector::new();
//! let client = build_client(settings, options, Arc::new(connector.clone()));
//! client.connect().await?;
//! let mut gateway = peers.recv().await.unwrap();
//! gateway.send_version(13, 21);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::link::{Connector, Link, LinkCommand, LinkEvent};
use crate::application::listeners::lock;
use crate::application::session::{CloseKind, TransportError};

#[derive(Debug, Default)]
struct ConnectorState {
    /// Scripted outcomes for upcoming attempts; `true` refuses the attempt.
    script: VecDeque<bool>,
    refuse_all: bool,
    attempts: Vec<Instant>,
}

/// A [`Connector`] whose links are in-memory channels.
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    state: Arc<Mutex<ConnectorState>>,
    peers: mpsc::UnboundedSender<GatewayPeer>,
}

impl ChannelConnector {
    /// Creates a connector and the receiver that yields one [`GatewayPeer`]
    /// per successfully opened link.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(ConnectorState::default())),
                peers,
            },
            rx,
        )
    }

    /// Refuses the next `count` attempts, then accepts again.
    pub fn refuse_next(&self, count: usize) {
        lock(&self.state).script.extend(std::iter::repeat(true).take(count));
    }

    /// Refuses every attempt until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        lock(&self.state).refuse_all = refuse;
    }

    /// Number of `connect` calls so far, successful or not.
    pub fn attempts(&self) -> usize {
        lock(&self.state).attempts.len()
    }

    /// When each `connect` call happened, on tokio's clock.
    pub fn attempt_times(&self) -> Vec<Instant> {
        lock(&self.state).attempts.clone()
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        let refused = {
            let mut state = lock(&self.state);
            state.attempts.push(Instant::now());
            let scripted = state.script.pop_front().unwrap_or(false);
            scripted || state.refuse_all
        };
        if refused {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = GatewayPeer {
            to_client: in_tx,
            from_client: out_rx,
        };
        if self.peers.send(peer).is_err() {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "no gateway is listening".to_string(),
            });
        }
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ── GatewayPeer ───────────────────────────────────────────────────────────────

/// The gateway end of one in-memory link.
#[derive(Debug)]
pub struct GatewayPeer {
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<LinkCommand>,
}

impl GatewayPeer {
    /// Sends raw bytes as one frame.  Returns `false` if the client is gone.
    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.to_client.send(LinkEvent::Frame(bytes.into())).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_raw(value.to_string())
    }

    pub fn send_version(&self, min_schema: u32, max_schema: u32) -> bool {
        self.send_json(&json!({
            "type": "version",
            "driverVersion": "3.1.0",
            "serverVersion": "1.9.0",
            "minSchemaVersion": min_schema,
            "maxSchemaVersion": max_schema,
        }))
    }

    pub fn send_success(&self, message_id: &str, result: Value) -> bool {
        self.send_json(&json!({
            "type": "result",
            "messageId": message_id,
            "success": true,
            "result": result,
        }))
    }

    pub fn send_failure(&self, message_id: &str, error_code: &str) -> bool {
        self.send_json(&json!({
            "type": "result",
            "messageId": message_id,
            "success": false,
            "errorCode": error_code,
        }))
    }

    /// Sends an event frame; `fields` are merged into the event object.
    pub fn send_event(&self, source: &str, event: &str, fields: Value) -> bool {
        let mut body = Map::new();
        body.insert("source".to_string(), json!(source));
        body.insert("event".to_string(), json!(event));
        if let Value::Object(extra) = fields {
            body.extend(extra);
        }
        self.send_json(&json!({ "type": "event", "event": body }))
    }

    /// Closes the link from the gateway side.
    pub fn close(&self, kind: CloseKind) {
        let _ = self.to_client.send(LinkEvent::Closed(kind));
    }

    /// Waits for the next command the client sent, parsed as JSON.
    ///
    /// Returns `None` once the client closed the link.
    pub async fn next_command(&mut self) -> Option<Value> {
        match self.from_client.recv().await? {
            LinkCommand::Text(text) => serde_json::from_str(&text).ok(),
            LinkCommand::Close => None,
        }
    }

    /// Like [`next_command`](Self::next_command) but never waits.
    pub fn try_next_command(&mut self) -> Option<Value> {
        match self.from_client.try_recv().ok()? {
            LinkCommand::Text(text) => serde_json::from_str(&text).ok(),
            LinkCommand::Close => None,
        }
    }

    /// `true` once the client asked to close or dropped its end.
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match self.from_client.recv().await {
                Some(LinkCommand::Close) | None => return true,
                Some(LinkCommand::Text(_)) => {}
            }
        }
    }
}
