//! Realtime change feed over the backend's websocket channel protocol.
//!
//! Each [`Subscription`] owns one websocket: it joins a single topic with a
//! `postgres_changes` filter, keeps the socket alive with heartbeats, and
//! forwards "a row in scope changed" to the subscriber. When the socket drops
//! the subscription ends and the caller resubscribes under its own retry
//! policy.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, instrument, warn};

use super::{ChangeEvent, ChangeKind, ChannelScope, GatewayError, Subscription};
use crate::config::SupabaseConfig;

const JOIN_REF: &str = "1";
const EVENT_BUFFER: usize = 32;

/// Opens realtime channels.
#[derive(Debug, Clone)]
pub struct RealtimeClient {
    socket_url: String,
    heartbeat: Duration,
    join_timeout: Duration,
}

impl RealtimeClient {
    /// Create a client for the configured project.
    #[must_use]
    pub fn new(config: &SupabaseConfig) -> Self {
        let base = config.url.as_str().trim_end_matches('/');
        let ws_base = base
            .strip_prefix("https://")
            .map(|rest| format!("wss://{rest}"))
            .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
            .unwrap_or_else(|| base.to_owned());

        Self {
            socket_url: format!(
                "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
                config.anon_key.expose_secret()
            ),
            heartbeat: config.realtime_heartbeat,
            join_timeout: config.request_timeout,
        }
    }

    /// Connect, join the scope's topic and start forwarding changes.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Channel`] if the socket cannot be opened or
    /// the join is refused or times out.
    #[instrument(skip(self, access_token), fields(topic = %scope.topic()))]
    pub async fn subscribe(
        &self,
        scope: &ChannelScope,
        access_token: &SecretString,
    ) -> Result<Subscription, GatewayError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.socket_url.as_str())
            .await
            .map_err(|e| GatewayError::Channel(format!("connect failed: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        let topic = scope.topic();
        sink.send(Message::text(join_message(scope, access_token).to_string()))
            .await
            .map_err(|e| GatewayError::Channel(format!("join send failed: {e}")))?;

        timeout(self.join_timeout, await_join_reply(&mut stream, &topic))
            .await
            .map_err(|_| GatewayError::Channel("join timed out".to_owned()))??;
        debug!("Realtime channel joined");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let heartbeat = self.heartbeat;

        let pump = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut next_ref: u64 = 2;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let beat = json!({
                            "topic": "phoenix",
                            "event": "heartbeat",
                            "payload": {},
                            "ref": next_ref.to_string(),
                        });
                        next_ref += 1;
                        if sink.send(Message::text(beat.to_string())).await.is_err() {
                            break;
                        }
                    }
                    frame = stream.next() => {
                        let Some(Ok(frame)) = frame else { break };
                        match frame {
                            Message::Text(text) => match decode_frame(text.as_str()) {
                                Frame::Change(event) => {
                                    // A full buffer already holds a pending refetch trigger.
                                    let _ = tx.try_send(event);
                                }
                                Frame::Closed => break,
                                Frame::Other => {}
                            },
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    () = tx.closed() => break,
                }
            }
            warn!(topic = %topic, "Realtime channel closed");
        });

        Ok(Subscription::new(rx, Some(pump)))
    }
}

fn join_message(scope: &ChannelScope, access_token: &SecretString) -> Value {
    let mut change = json!({
        "event": "*",
        "schema": "public",
        "table": scope.table,
    });
    if let Some(filter) = scope.filter_clause() {
        change["filter"] = Value::String(filter);
    }

    json!({
        "topic": scope.topic(),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token.expose_secret(),
        },
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
}

async fn await_join_reply<S>(stream: &mut S, topic: &str) -> Result<(), GatewayError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| GatewayError::Channel(e.to_string()))?;
        let Message::Text(text) = frame else { continue };
        let Ok(message) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        if message["event"] != "phx_reply" || message["topic"] != topic {
            continue;
        }
        return if message["payload"]["status"] == "ok" {
            Ok(())
        } else {
            Err(GatewayError::Channel(format!(
                "join refused: {}",
                message["payload"]["response"]
            )))
        };
    }
    Err(GatewayError::Channel("socket closed during join".to_owned()))
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Change(ChangeEvent),
    Closed,
    Other,
}

fn decode_frame(text: &str) -> Frame {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return Frame::Other;
    };
    match message["event"].as_str() {
        Some("postgres_changes") => {
            let data = &message["payload"]["data"];
            let kind = data["type"].as_str().and_then(ChangeKind::parse);
            let table = data["table"].as_str();
            match (kind, table) {
                (Some(kind), Some(table)) => Frame::Change(ChangeEvent {
                    table: table.to_owned(),
                    kind,
                }),
                _ => Frame::Other,
            }
        }
        Some("phx_error" | "phx_close") => Frame::Closed,
        _ => Frame::Other,
    }
}
