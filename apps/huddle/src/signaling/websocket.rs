use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{ClientMessage, Reconnect, ServerMessage, SignalingChannel, TaskGuard};
use crate::error::{MeshError, MeshResult};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalises `http(s)` relay URLs to `ws(s)`.
fn websocket_url(signaling_url: &str) -> MeshResult<Url> {
    let mut url = Url::parse(signaling_url).map_err(|err| {
        MeshError::Signaling(format!("invalid signaling url {signaling_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(MeshError::Signaling(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| MeshError::Signaling("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}

fn parse_frame(message: Message) -> Option<ServerMessage> {
    let text = match message {
        Message::Text(text) => text,
        Message::Binary(data) => String::from_utf8(data).ok()?,
        _ => return None,
    };
    match serde_json::from_str::<ServerMessage>(&text) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::debug!(
                target = "signaling",
                error = %err,
                len = text.len(),
                "ignoring unrecognised relay frame"
            );
            None
        }
    }
}

/// Dials the same relay URL again after a drop.
#[derive(Debug, Clone)]
pub struct WebSocketReconnect {
    signaling_url: String,
}

impl WebSocketReconnect {
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
        }
    }
}

#[async_trait]
impl Reconnect for WebSocketReconnect {
    async fn reconnect(&self) -> MeshResult<SignalingChannel> {
        connect(&self.signaling_url).await
    }
}

/// Connects to a websocket relay and waits for it to assign our peer id.
pub async fn connect(signaling_url: &str) -> MeshResult<SignalingChannel> {
    let url = websocket_url(signaling_url)?;
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| MeshError::Signaling(format!("websocket connect failed: {err}")))?;
    tracing::debug!(target = "signaling", url = %url, "signaling websocket connected");
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let local_id = timeout(WELCOME_TIMEOUT, async {
        while let Some(frame) = ws_read.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    return Err(MeshError::Signaling(format!("websocket read failed: {err}")));
                }
            };
            if let Some(ServerMessage::Welcome { peer_id }) = parse_frame(frame) {
                return Ok(peer_id);
            }
        }
        Err(MeshError::Signaling(
            "relay closed before assigning a peer id".into(),
        ))
    })
    .await
    .map_err(|_| MeshError::Signaling("relay did not assign a peer id".into()))??;

    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (recv_tx, recv_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut tasks = TaskGuard::default();

    tasks.push(tokio::spawn(async move {
        while let Some(message) = send_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(target = "signaling", error = %err, "failed to encode message");
                    continue;
                }
            };
            tracing::trace!(
                target = "signaling",
                event = "ws_out",
                kind = message.kind(),
                target_id = ?message.target()
            );
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    }));

    tasks.push(tokio::spawn(async move {
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Close(_)) => break,
                Ok(frame) => {
                    if let Some(message) = parse_frame(frame) {
                        if recv_tx.send(message).is_err() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(target = "signaling", error = %err, "websocket read failed");
                    break;
                }
            }
        }
        tracing::debug!(target = "signaling", "signaling websocket closed");
    }));

    Ok(SignalingChannel {
        local_id,
        outbound: send_tx,
        inbound: recv_rx,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_become_websocket_urls() {
        assert_eq!(
            websocket_url("https://relay.example.com/ws#x")
                .expect("url")
                .as_str(),
            "wss://relay.example.com/ws"
        );
        assert_eq!(
            websocket_url("ws://127.0.0.1:8080/ws").expect("url").as_str(),
            "ws://127.0.0.1:8080/ws"
        );
    }

    #[test]
    fn non_web_schemes_are_rejected() {
        assert!(matches!(
            websocket_url("ftp://relay.example.com"),
            Err(MeshError::Signaling(_))
        ));
    }

    #[test]
    fn frames_parse_from_text_and_binary() {
        let text = r#"{"type":"peer-disconnected","peerId":"a"}"#;
        assert_eq!(
            parse_frame(Message::Text(text.into())),
            Some(ServerMessage::PeerDisconnected {
                peer_id: "a".into()
            })
        );
        assert!(parse_frame(Message::Binary(text.as_bytes().to_vec())).is_some());
        assert_eq!(parse_frame(Message::Text("{\"type\":\"bogus\"}".into())), None);
    }
}
