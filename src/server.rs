//! WebSocket feed server
//!
//! Accepts feed connections, registers each with the [`Broadcaster`] and
//! runs one writer loop per connection. Clients may scope their feed to a
//! single user by connecting with a `?user_id=` query parameter; without
//! it the connection observes every signal.
//!
//! Liveness is ping-driven: a ping goes out every keepalive interval and a
//! connection that lets two pings go unanswered is closed.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::{Broadcaster, ConnectionId, SignalReceiver};
use crate::common::errors::TransportError;
use crate::common::types::Signal;
use crate::config::types::BroadcastConfig;

const MISSED_PONG_LIMIT: u32 = 2;

/// Accept loop plus per-connection writer tasks
pub struct FeedServer {
    broadcaster: Arc<Broadcaster>,
    config: BroadcastConfig,
}

impl FeedServer {
    pub fn new(broadcaster: Arc<Broadcaster>, config: BroadcastConfig) -> Self {
        Self {
            broadcaster,
            config,
        }
    }

    /// Bind and serve until the task is cancelled.
    pub async fn run(self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener. Split from [`run`](Self::run) so
    /// callers can bind to an ephemeral port first.
    pub async fn serve(self, listener: TcpListener) -> Result<(), TransportError> {
        info!(addr = ?listener.local_addr(), "feed server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "incoming feed connection");

            let broadcaster = self.broadcaster.clone();
            let keepalive = self.config.keepalive_interval_seconds;
            tokio::spawn(async move {
                if let Err(err) = serve_connection(stream, broadcaster, keepalive).await {
                    debug!(%peer, error = %err, "feed connection ended with error");
                }
            });
        }
    }
}

/// Pull the `user_id` query parameter out of the request path, if present.
fn user_id_from_path(path: &str) -> Option<String> {
    let query = path.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "user_id" && !value.is_empty()).then(|| value.to_string())
    })
}

/// Wire format for one delivered signal
fn feed_frame(signal: &Signal) -> Result<String, TransportError> {
    let frame = serde_json::json!({
        "type": "signal",
        "data": signal,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    serde_json::to_string(&frame).map_err(|e| TransportError::Communication(e.to_string()))
}

async fn serve_connection(
    stream: TcpStream,
    broadcaster: Arc<Broadcaster>,
    keepalive_interval_seconds: u64,
) -> Result<(), TransportError> {
    let mut user_id: Option<String> = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        user_id = user_id_from_path(request.uri().path_and_query().map_or("", |pq| pq.as_str()));
        Ok(response)
    })
    .await
    .map_err(|e| TransportError::Connection(e.to_string()))?;

    let (id, receiver) = broadcaster.register(user_id);
    let result = connection_loop(ws, id, receiver, keepalive_interval_seconds).await;
    broadcaster.unregister(id);
    result
}

#[instrument(skip(ws, receiver), fields(connection = %id))]
async fn connection_loop(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    id: ConnectionId,
    mut receiver: SignalReceiver,
    keepalive_interval_seconds: u64,
) -> Result<(), TransportError> {
    let (mut sink, mut source) = ws.split();
    let mut keepalive = tokio::time::interval(std::time::Duration::from_secs(
        keepalive_interval_seconds.max(1),
    ));
    // The first tick fires immediately; consume it so the first ping waits
    // a full interval.
    keepalive.tick().await;

    let mut unanswered_pings: u32 = 0;

    loop {
        tokio::select! {
            signal = receiver.recv() => {
                match signal {
                    Some(signal) => {
                        sink.send(Message::Text(feed_frame(&signal)?)).await?;
                    }
                    // Broadcaster closed us (shutdown or forced disconnect).
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
            _ = keepalive.tick() => {
                if unanswered_pings >= MISSED_PONG_LIMIT {
                    warn!(connection = %id, "closing unresponsive feed connection");
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                sink.send(Message::Ping(Vec::new())).await?;
                unanswered_pings += 1;
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => unanswered_pings = 0,
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %id, "client closed feed connection");
                        return Ok(());
                    }
                    // The feed is write-only; client frames are ignored.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Exchange, SignalType};
    use chrono::Utc;

    #[test]
    fn test_user_id_extraction() {
        assert_eq!(user_id_from_path("/feed?user_id=alice"), Some("alice".to_string()));
        assert_eq!(
            user_id_from_path("/feed?foo=1&user_id=bob"),
            Some("bob".to_string())
        );
        assert_eq!(user_id_from_path("/feed"), None);
        assert_eq!(user_id_from_path("/feed?user_id="), None);
    }

    #[test]
    fn test_feed_frame_shape() {
        let signal = Signal {
            user_id: "u1".to_string(),
            exchange: Exchange::Okx,
            symbol: "BTCUSDT".to_string(),
            interval: "1h".to_string(),
            signal_type: SignalType::Sell,
            ema_fast: 1.0,
            ema_slow: 2.0,
            price: 43000.0,
            detected_at: Utc::now(),
        };

        let frame: serde_json::Value =
            serde_json::from_str(&feed_frame(&signal).unwrap()).unwrap();
        assert_eq!(frame["type"], "signal");
        assert_eq!(frame["data"]["signal_type"], "SELL");
        assert_eq!(frame["data"]["exchange"], "okx");
        assert!(frame["timestamp"].is_string());
    }
}
