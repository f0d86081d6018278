//! WebSocket connector built on `tokio-tungstenite`.
//!
//! After the handshake the stream is split into a sink and a stream, each
//! driven by its own task:
//!
//! ```text
//!  LinkCommand ──► writer task ──► SplitSink   ──► gateway
//!  LinkEvent   ◄── reader task ◄── SplitStream ◄── gateway
//! ```
//!
//! The reader turns whatever ends the stream into a single
//! [`LinkEvent::Closed`]: a close frame with code 1000 is normal, any other
//! code, a close frame without a code (1005), a socket error or a bare EOF
//! is abnormal.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, trace};

use super::link::{Connector, Link, LinkCommand, LinkEvent};
use crate::application::session::{CloseKind, TransportError};

/// Close code reported when the peer's close frame carried no status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Opens `ws://` / `wss://` links.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| match e {
                WsError::Url(reason) => TransportError::InvalidUrl {
                    url: url.to_string(),
                    reason: reason.to_string(),
                },
                other => TransportError::Connect {
                    url: url.to_string(),
                    reason: other.to_string(),
                },
            })?;
        info!("websocket open to {url}");

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<LinkCommand>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        // ── Writer task ───────────────────────────────────────────────────────
        tokio::spawn(async move {
            while let Some(command) = out_rx.recv().await {
                match command {
                    LinkCommand::Text(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            debug!("websocket send failed: {e}");
                            break;
                        }
                    }
                    LinkCommand::Close => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        };
                        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                            debug!("websocket close failed: {e}");
                        }
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        // ── Reader task ───────────────────────────────────────────────────────
        tokio::spawn(async move {
            let kind = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if in_tx.send(LinkEvent::Frame(text.into_bytes())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        if in_tx.send(LinkEvent::Frame(bytes)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => break close_kind(frame),
                    // Pings are answered by tungstenite itself.
                    Some(Ok(other)) => trace!("ignoring websocket control frame: {other:?}"),
                    Some(Err(e)) => {
                        break CloseKind::Abnormal {
                            code: None,
                            reason: e.to_string(),
                        }
                    }
                    None => {
                        break CloseKind::Abnormal {
                            code: None,
                            reason: "stream ended without a close frame".to_string(),
                        }
                    }
                }
            };
            let _ = in_tx.send(LinkEvent::Closed(kind));
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn close_kind(frame: Option<CloseFrame<'_>>) -> CloseKind {
    match frame {
        Some(frame) => CloseKind::from_code(u16::from(frame.code), frame.reason.to_string()),
        None => CloseKind::Abnormal {
            code: Some(NO_STATUS_RECEIVED),
            reason: "close frame without status".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_close_frame_is_normal() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert_eq!(close_kind(Some(frame)), CloseKind::Normal);
    }

    #[test]
    fn test_going_away_is_abnormal_with_code() {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "restart".into(),
        };
        assert_eq!(
            close_kind(Some(frame)),
            CloseKind::Abnormal {
                code: Some(1001),
                reason: "restart".to_string()
            }
        );
    }

    #[test]
    fn test_missing_close_frame_is_abnormal() {
        assert!(matches!(
            close_kind(None),
            CloseKind::Abnormal { code: Some(1005), .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_with_connect_error() {
        // Port 1 is privileged and not listening in test environments.
        let result = WsConnector.connect("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_malformed_url_is_rejected() {
        let result = WsConnector.connect("not a url").await;
        assert!(result.is_err());
    }
}
