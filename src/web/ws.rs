//! Live event socket.
//!
//! Client frames: `{"type": "subscribe" | "unsubscribe" | "ping", "topic"?: ..}`.
//! Server frames are hub events, `backpressure` notices, and replies.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::api::ApiError;
use super::AppState;
use crate::config::HubConfig;
use crate::hub::{Observer, Outbound, Topic};

#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    topic: Option<String>,
}

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let observer = match state.hub.register().await {
        Ok(observer) => observer,
        Err(e) => {
            warn!("Refusing socket: {e:#}");
            return ApiError::service_unavailable("Broadcast hub is not running").into_response();
        }
    };
    let config = state.config.hub.clone();
    ws.on_upgrade(move |socket| session(socket, observer, config))
}

async fn session(socket: WebSocket, observer: Observer, config: HubConfig) {
    let id = observer.id();
    let (mut sink, mut stream) = socket.split();
    let mut topics: Option<HashSet<Topic>> = None;
    let pong_timeout = Duration::from_secs(config.pong_timeout_secs);
    let mut ping = tokio::time::interval(Duration::from_secs(config.ping_interval_secs.max(1)));
    ping.tick().await;
    let mut last_seen = Instant::now();
    info!(observer = id, "Live socket opened");

    loop {
        tokio::select! {
            outbound = observer.recv() => {
                let Some(outbound) = outbound else {
                    debug!(observer = id, "Hub closed observer");
                    break;
                };
                let frame = match outbound {
                    Outbound::Event(event) => serde_json::to_string(&*event).unwrap_or_default(),
                    Outbound::Backpressure { dropped } => {
                        json!({ "type": "backpressure", "payload": { "dropped": dropped } }).to_string()
                    }
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(observer = id, "Socket read failed: {e}");
                        break;
                    }
                    None => break,
                };
                last_seen = Instant::now();
                match message {
                    Message::Text(text) => {
                        let reply = match handle_frame(&text, &mut topics) {
                            Ok(FrameAction::Resubscribe(reply)) => {
                                observer.subscribe(topics.clone()).await;
                                reply
                            }
                            Ok(FrameAction::Reply(reply)) => reply,
                            Err(message) => json!({ "type": "error", "payload": { "message": message } }),
                        };
                        if sink.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > pong_timeout {
                    info!(observer = id, "Live socket timed out waiting for pong");
                    break;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    info!(observer = id, "Live socket closed");
}

#[derive(Debug, PartialEq)]
enum FrameAction {
    Resubscribe(serde_json::Value),
    Reply(serde_json::Value),
}

fn handle_frame(text: &str, topics: &mut Option<HashSet<Topic>>) -> Result<FrameAction, String> {
    let frame: ClientFrame = serde_json::from_str(text).map_err(|e| format!("invalid frame: {e}"))?;
    let topic = match frame.topic.as_deref() {
        None | Some("" | "all") => None,
        Some(raw) => Some(Topic::from_str(raw).ok_or_else(|| format!("unknown topic '{raw}'"))?),
    };

    match frame.kind.as_str() {
        "ping" => Ok(FrameAction::Reply(json!({ "type": "pong" }))),
        "subscribe" => {
            // Subscribing from "everything" narrows to the named topic
            *topics = topic.map(|t| {
                let mut set = topics.take().unwrap_or_default();
                set.insert(t);
                set
            });
            Ok(FrameAction::Resubscribe(subscribed(topics)))
        }
        "unsubscribe" => {
            *topics = match topic {
                None => Some(HashSet::new()),
                Some(t) => {
                    let mut set = topics.take().unwrap_or_else(all_topics);
                    set.remove(&t);
                    Some(set)
                }
            };
            Ok(FrameAction::Resubscribe(subscribed(topics)))
        }
        other => Err(format!("unknown frame type '{other}'")),
    }
}

fn all_topics() -> HashSet<Topic> {
    HashSet::from([Topic::Activity, Topic::Job, Topic::Verification, Topic::Scrape])
}

fn subscribed(topics: &Option<HashSet<Topic>>) -> serde_json::Value {
    let mut names: Vec<Topic> = topics.clone().unwrap_or_else(all_topics).into_iter().collect();
    names.sort_by_key(|t| format!("{t:?}"));
    json!({ "type": "subscribed", "payload": { "topics": names } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_frame() {
        let mut topics = None;
        assert_eq!(
            handle_frame(r#"{"type":"ping"}"#, &mut topics),
            Ok(FrameAction::Reply(json!({ "type": "pong" })))
        );
    }

    #[test]
    fn test_subscribe_narrows_then_widens() {
        let mut topics = None;
        handle_frame(r#"{"type":"subscribe","topic":"scrape"}"#, &mut topics).unwrap();
        assert_eq!(topics, Some(HashSet::from([Topic::Scrape])));
        handle_frame(r#"{"type":"subscribe","topic":"job"}"#, &mut topics).unwrap();
        assert_eq!(topics, Some(HashSet::from([Topic::Scrape, Topic::Job])));
        handle_frame(r#"{"type":"subscribe"}"#, &mut topics).unwrap();
        assert_eq!(topics, None);
    }

    #[test]
    fn test_unsubscribe_from_all() {
        let mut topics = None;
        handle_frame(r#"{"type":"unsubscribe","topic":"verification"}"#, &mut topics).unwrap();
        let set = topics.unwrap();
        assert_eq!(set.len(), 3);
        assert!(!set.contains(&Topic::Verification));
    }

    #[test]
    fn test_bad_frames() {
        let mut topics = None;
        assert!(handle_frame("not json", &mut topics).is_err());
        assert!(handle_frame(r#"{"type":"subscribe","topic":"weather"}"#, &mut topics).is_err());
        assert!(handle_frame(r#"{"type":"shout"}"#, &mut topics).is_err());
    }
}
