use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    Hit(KeyEvent),
    Miss(KeyEvent),
    StaleServed(KeyEvent),
    Stored(StoredEvent),
    Evicted(KeyEvent),
    Invalidated(KeyEvent),
    GroupInvalidated(GroupInvalidatedEvent),
    Cleared(ClearedEvent),
}

impl CacheEvent {
    pub fn namespace(&self) -> &str {
        match self {
            CacheEvent::Hit(e)
            | CacheEvent::Miss(e)
            | CacheEvent::StaleServed(e)
            | CacheEvent::Evicted(e)
            | CacheEvent::Invalidated(e) => &e.namespace,
            CacheEvent::Stored(e) => &e.namespace,
            CacheEvent::GroupInvalidated(e) => &e.namespace,
            CacheEvent::Cleared(e) => &e.namespace,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Hit(e)
            | CacheEvent::Miss(e)
            | CacheEvent::StaleServed(e)
            | CacheEvent::Evicted(e)
            | CacheEvent::Invalidated(e) => Some(&e.key),
            CacheEvent::Stored(e) => Some(&e.key),
            CacheEvent::GroupInvalidated(_) | CacheEvent::Cleared(_) => None,
        }
    }

    pub fn hit(namespace: &str, key: &str) -> Self {
        CacheEvent::Hit(KeyEvent::new(namespace, key))
    }

    pub fn miss(namespace: &str, key: &str) -> Self {
        CacheEvent::Miss(KeyEvent::new(namespace, key))
    }

    pub fn stale_served(namespace: &str, key: &str) -> Self {
        CacheEvent::StaleServed(KeyEvent::new(namespace, key))
    }

    pub fn evicted(namespace: &str, key: &str) -> Self {
        CacheEvent::Evicted(KeyEvent::new(namespace, key))
    }

    pub fn invalidated(namespace: &str, key: &str) -> Self {
        CacheEvent::Invalidated(KeyEvent::new(namespace, key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub namespace: String,
    pub key: String,
    pub timestamp: i64,
}

impl KeyEvent {
    fn new(namespace: &str, key: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            key: key.to_string(),
            timestamp: now_timestamp_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub namespace: String,
    pub key: String,
    pub ttl_ms: u64,
    pub group: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvalidatedEvent {
    pub namespace: String,
    pub group: String,
    pub invalidated: usize,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearedEvent {
    pub namespace: String,
    pub cleared: usize,
    pub timestamp: i64,
}

/// Wall-clock milliseconds since the UNIX epoch
pub fn now_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Optional fan-out of cache events; a missing channel or no subscribers is not an error
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    sender: Option<broadcast::Sender<CacheEvent>>,
}

impl EventSink {
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender: Some(sender),
        }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<CacheEvent>> {
        self.sender.as_ref().map(|s| s.subscribe())
    }

    pub fn emit(&self, event: CacheEvent) {
        if let Some(ref sender) = self.sender {
            match sender.send(event) {
                Ok(subscriber_count) => {
                    tracing::trace!("Broadcasted cache event to {} subscriber(s)", subscriber_count);
                }
                Err(broadcast::error::SendError(event)) => {
                    tracing::trace!(
                        "No subscribers for cache event in namespace '{}'",
                        event.namespace()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CacheEvent::hit("slots", "slots:1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "hit");
        assert_eq!(json["namespace"], "slots");
        assert_eq!(json["key"], "slots:1");
    }

    #[tokio::test]
    async fn test_sink_delivers_to_subscribers() {
        let sink = EventSink::with_capacity(8);
        let mut rx = sink.subscribe().unwrap();

        sink.emit(CacheEvent::miss("slots", "slots:2"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key(), Some("slots:2"));
        assert!(matches!(event, CacheEvent::Miss(_)));
    }

    #[test]
    fn test_disabled_sink_ignores_events() {
        let sink = EventSink::disabled();
        assert!(sink.subscribe().is_none());
        sink.emit(CacheEvent::invalidated("slots", "slots:3"));
    }
}
