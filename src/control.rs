//! Long-lived WebSocket control channel to the controller.
//!
//! The session is duplex: a heartbeat carrying the local target-set
//! version goes out every few seconds, and UPDATE signals come back when
//! the controller has a newer set for us. Any session or dial error
//! tears the connection down and the outer loop re-dials with
//! exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::VoyagerConfig;
use crate::targets::TargetManager;

const WS_PATH: &str = "/ws/ping/";

/// Heartbeat cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Both heartbeat and UPDATE frames share this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub message: String,
    pub version: u64,
}

/// Dial, run a session, repeat forever. Consecutive dial failures double
/// the retry delay (clamped); a successful dial resets it.
pub async fn run(manager: Arc<TargetManager>, config: VoyagerConfig) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match connect(&config).await {
            Ok(stream) => {
                info!(server = %config.server, "websocket dial successful");
                backoff = INITIAL_BACKOFF;
                if let Err(err) = session(stream, &manager).await {
                    warn!(%err, "websocket session ended");
                }
            }
            Err(err) => {
                warn!(%err, delay = ?backoff, "websocket dial failed");
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        }
        tokio::time::sleep(backoff).await;
    }
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

async fn connect(config: &VoyagerConfig) -> anyhow::Result<WsStream> {
    let url = format!("ws://{}{}", config.server, WS_PATH);
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Token {}", config.token))
            .context("token is not a valid header value")?,
    );

    let (stream, response) = connect_async(request).await?;
    debug!(status = %response.status(), "websocket handshake complete");
    Ok(stream)
}

/// One connected session: heartbeats out, signals in. Returns when either
/// direction fails or the server closes.
async fn session(stream: WsStream, manager: &Arc<TargetManager>) -> anyhow::Result<()> {
    let (mut write, mut read) = stream.split();
    let mut heartbeat = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let ping = ControlMessage {
                    message: "PING".to_string(),
                    version: manager.version(),
                };
                let payload = serde_json::to_string(&ping)?;
                debug!(version = ping.version, "sending heartbeat");
                write.send(Message::Text(payload.into())).await?;
            }
            frame = read.next() => {
                let frame = frame.ok_or_else(|| anyhow!("connection closed"))??;
                match frame {
                    Message::Text(text) => handle_signal(&text, manager),
                    Message::Close(_) => return Err(anyhow!("server closed control channel")),
                    _ => {}
                }
            }
        }
    }
}

fn handle_signal(text: &str, manager: &Arc<TargetManager>) {
    debug!(%text, "websocket recv");
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(signal) if signal.message == "UPDATE" => {
            info!(version = signal.version, "update signal received");
            // reconcile off the session loop so heartbeats keep flowing
            // while the fetch runs
            let manager = Arc::clone(manager);
            tokio::spawn(async move {
                manager.reconcile(signal.version).await;
            });
        }
        Ok(signal) => debug!(message = %signal.message, "ignoring control message"),
        Err(err) => warn!(%err, "undecodable control frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_clamps() {
        let mut delay = INITIAL_BACKOFF;
        let mut observed = Vec::new();
        for _ in 0..4 {
            observed.push(delay.as_secs());
            delay = next_backoff(delay);
        }
        assert_eq!(observed, vec![1, 2, 4, 8]);

        let clamped = next_backoff(Duration::from_secs(45));
        assert_eq!(clamped, MAX_BACKOFF);
        assert_eq!(next_backoff(MAX_BACKOFF), MAX_BACKOFF);
    }

    #[test]
    fn test_control_message_wire_format() {
        let ping = ControlMessage {
            message: "PING".to_string(),
            version: 7,
        };
        assert_eq!(
            serde_json::to_string(&ping).unwrap(),
            r#"{"message":"PING","version":7}"#
        );

        let signal: ControlMessage =
            serde_json::from_str(r#"{"message":"UPDATE","version":12}"#).unwrap();
        assert_eq!(signal.message, "UPDATE");
        assert_eq!(signal.version, 12);
    }
}
