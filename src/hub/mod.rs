//! In-process broadcast hub for live progress events.
//!
//! A single task owns the observer registry and is driven by one command
//! queue. Each observer has its own bounded [`Outbox`]; a slow observer loses
//! its oldest messages (and is told so) instead of slowing anyone else down.
//!
//! Producers:
//!   hub.publish(Event::new(Topic::Scrape, "scrape:progress", json!({"current": 2})));
//!
//! Consumers (socket sessions):
//!   let observer = hub.register().await?;
//!   while let Some(message) = observer.recv().await { ... }

mod outbox;

pub use outbox::{Outbound, Outbox, PushOutcome};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HubConfig;

/// Inbound command queue capacity.
const COMMAND_QUEUE: usize = 1024;

/// Event category; observers can subscribe to a subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Activity,
    Job,
    Verification,
    Scrape,
}

impl Topic {
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "activity" => Some(Self::Activity),
            "job" => Some(Self::Job),
            "verification" => Some(Self::Verification),
            "scrape" => Some(Self::Scrape),
            _ => None,
        }
    }
}

/// A published event, serialized as a socket frame.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

impl Event {
    pub fn new(topic: Topic, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            topic,
            payload,
            timestamp: crate::db::now_timestamp(),
        }
    }
}

pub type ObserverId = u64;

enum Command {
    Register {
        id: ObserverId,
        outbox: Arc<Outbox>,
    },
    Unregister(ObserverId),
    Subscribe {
        id: ObserverId,
        topics: Option<HashSet<Topic>>,
    },
    Publish(Arc<Event>),
    Count(oneshot::Sender<usize>),
}

struct Registration {
    outbox: Arc<Outbox>,
    /// `None` receives every topic.
    topics: Option<HashSet<Topic>>,
}

/// Cloneable handle to the hub task.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    next_id: Arc<AtomicU64>,
    queue_depth: usize,
    max_dropped: usize,
}

impl Hub {
    /// Spawn the hub loop. It exits when `cancel` fires or every handle is dropped.
    #[must_use]
    pub fn start(config: &HubConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = tokio::spawn(run_loop(rx, cancel));
        let hub = Self {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            queue_depth: config.queue_depth,
            max_dropped: config.max_dropped,
        };
        (hub, handle)
    }

    /// Register a new observer that receives all topics.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub loop has stopped.
    pub async fn register(&self) -> Result<Observer> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(Outbox::new(self.queue_depth, self.max_dropped));
        self.commands
            .send(Command::Register {
                id,
                outbox: Arc::clone(&outbox),
            })
            .await
            .ok()
            .context("Broadcast hub is not running")?;
        Ok(Observer {
            id,
            outbox,
            hub: self.clone(),
        })
    }

    /// Publish an event. Best effort: never blocks the caller.
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.commands.try_send(Command::Publish(Arc::new(event))) {
            warn!("Dropping hub event: {e}");
        }
    }

    /// Number of registered observers.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub loop has stopped.
    pub async fn observer_count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Count(tx))
            .await
            .ok()
            .context("Broadcast hub is not running")?;
        rx.await.context("Broadcast hub dropped the reply")
    }
}

/// A live observer. Unregisters itself when dropped.
pub struct Observer {
    id: ObserverId,
    outbox: Arc<Outbox>,
    hub: Hub,
}

impl Observer {
    #[must_use]
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Wait for the next message; `None` once the hub has closed this observer.
    pub async fn recv(&self) -> Option<Outbound> {
        self.outbox.recv().await
    }

    /// Restrict delivery to `topics`; `None` restores every topic.
    pub async fn subscribe(&self, topics: Option<HashSet<Topic>>) {
        let _ = self
            .hub
            .commands
            .send(Command::Subscribe {
                id: self.id,
                topics,
            })
            .await;
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.outbox.close();
        let _ = self.hub.commands.try_send(Command::Unregister(self.id));
    }
}

async fn run_loop(mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
    let mut observers: HashMap<ObserverId, Registration> = HashMap::new();

    loop {
        let command = tokio::select! {
            () = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(c) => c,
                None => break,
            },
        };

        match command {
            Command::Register { id, outbox } => {
                debug!(observer = id, "Observer registered");
                observers.insert(
                    id,
                    Registration {
                        outbox,
                        topics: None,
                    },
                );
            }
            Command::Unregister(id) => {
                if let Some(registration) = observers.remove(&id) {
                    registration.outbox.close();
                    debug!(observer = id, "Observer unregistered");
                }
            }
            Command::Subscribe { id, topics } => {
                if let Some(registration) = observers.get_mut(&id) {
                    registration.topics = topics;
                }
            }
            Command::Publish(event) => {
                observers.retain(|id, registration| {
                    if let Some(topics) = &registration.topics {
                        if !topics.contains(&event.topic) {
                            return true;
                        }
                    }
                    match registration.outbox.push(Arc::clone(&event)) {
                        PushOutcome::Queued => true,
                        PushOutcome::Overflowed => {
                            debug!(observer = id, "Observer queue overflowed");
                            true
                        }
                        PushOutcome::Closed => {
                            warn!(observer = id, "Closing slow observer");
                            false
                        }
                    }
                });
            }
            Command::Count(reply) => {
                let _ = reply.send(observers.len());
            }
        }
    }

    for registration in observers.values() {
        registration.outbox.close();
    }
    debug!("Broadcast hub stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn start_hub(depth: usize, max_dropped: usize) -> Hub {
        let config = HubConfig {
            queue_depth: depth,
            max_dropped,
            ..HubConfig::default()
        };
        Hub::start(&config, CancellationToken::new()).0
    }

    async fn next_event(observer: &Observer) -> Arc<Event> {
        match tokio::time::timeout(Duration::from_secs(1), observer.recv()).await {
            Ok(Some(Outbound::Event(e))) => e,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_observers() {
        let hub = start_hub(16, 16);
        let a = hub.register().await.unwrap();
        let b = hub.register().await.unwrap();

        hub.publish(Event::new(Topic::Job, "job:started", serde_json::json!({"id": 1})));

        assert_eq!(next_event(&a).await.kind, "job:started");
        assert_eq!(next_event(&b).await.kind, "job:started");
    }

    #[tokio::test]
    async fn test_topic_filter() {
        let hub = start_hub(16, 16);
        let observer = hub.register().await.unwrap();
        observer
            .subscribe(Some(HashSet::from([Topic::Scrape])))
            .await;

        hub.publish(Event::new(Topic::Job, "job:started", serde_json::Value::Null));
        hub.publish(Event::new(Topic::Scrape, "scrape:started", serde_json::Value::Null));

        assert_eq!(next_event(&observer).await.kind, "scrape:started");
    }

    #[tokio::test]
    async fn test_order_preserved_per_topic() {
        let hub = start_hub(64, 64);
        let observer = hub.register().await.unwrap();
        for n in 0..20 {
            hub.publish(Event::new(Topic::Scrape, "scrape:progress", serde_json::json!({"n": n})));
        }
        for n in 0..20 {
            assert_eq!(next_event(&observer).await.payload["n"], n);
        }
    }

    #[tokio::test]
    async fn test_slow_observer_is_closed_and_removed() {
        let hub = start_hub(2, 3);
        let slow = hub.register().await.unwrap();
        let fast = hub.register().await.unwrap();

        for n in 0..10 {
            hub.publish(Event::new(Topic::Job, "job:tick", serde_json::json!({"n": n})));
            // Keep the fast observer drained
            let _ = next_event(&fast).await;
        }

        assert!(slow.outbox.is_closed());
        assert_eq!(hub.observer_count().await.unwrap(), 1);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_observer_gets_marker_then_is_closed() {
        let hub = start_hub(2, 3);
        let slow = hub.register().await.unwrap();
        let fast = hub.register().await.unwrap();
        let publish = |n: i64| {
            hub.publish(Event::new(Topic::Job, "job:tick", serde_json::json!({"n": n})));
        };

        for n in 0..4 {
            publish(n);
            let _ = next_event(&fast).await;
        }
        // Two dropped: the marker stands in for them, then the newest two
        match slow.recv().await {
            Some(Outbound::Backpressure { dropped }) => assert_eq!(dropped, 2),
            other => panic!("expected backpressure marker, got {other:?}"),
        }
        assert_eq!(next_event(&slow).await.payload["n"], 2);
        assert_eq!(next_event(&slow).await.payload["n"], 3);
        assert!(!slow.outbox.is_closed());

        // Caught up, so the drop budget starts over
        for n in 4..10 {
            publish(n);
            let _ = next_event(&fast).await;
        }
        assert!(slow.outbox.is_closed());
        assert!(slow.recv().await.is_none());
        assert_eq!(hub.observer_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let hub = start_hub(4, 4);
        let observer = hub.register().await.unwrap();
        assert_eq!(hub.observer_count().await.unwrap(), 1);
        drop(observer);
        // Unregister is queued before the count request
        assert_eq!(hub.observer_count().await.unwrap(), 0);
    }
}
