/// Cluster notifications delivered to subscribers over channels
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Everything the connection manager and monitor report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// A node's pool reported a connection-level failure
    NodeError { node: String, message: String },
    /// A node answered its liveness probe again
    NodeRecovered { node: String, attempts: u32 },
    /// Backoff recovery gave up on a node
    RecoveryFailed { node: String, attempts: u32 },
    /// A replica became the primary
    Promoted { node: String, previous: String },
    /// Neither the primary nor any replica can take writes
    NoHealthyConnection { message: String },
    /// A replica exceeded the lag alert threshold
    HighLag { replica: String, lag_ms: u64 },
    /// Over half of the replicas are unhealthy
    CriticalHealth { unhealthy: usize, total: usize },
    /// A monitor cycle finished
    CheckCompleted { healthy: usize, unhealthy: usize },
    MonitorStarted,
    MonitorStopped,
}

/// Fan-out of [`ClusterEvent`]s.
///
/// Each subscriber owns an unbounded queue, so emitting never blocks and
/// no subscriber misses an event while it is subscribed.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ClusterEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Deliver to every live subscriber, dropping closed ones
    pub fn emit(&self, event: ClusterEvent) {
        tracing::trace!("Emitting cluster event: {:?}", event);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ClusterEvent::MonitorStarted);

        assert_eq!(a.recv().await, Some(ClusterEvent::MonitorStarted));
        assert_eq!(b.recv().await, Some(ClusterEvent::MonitorStarted));
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_dropped() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        drop(a);

        bus.emit(ClusterEvent::MonitorStopped);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = ClusterEvent::HighLag {
            replica: "replica-1".to_string(),
            lag_ms: 6000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"high_lag\""));
        assert!(json.contains("6000"));
    }
}
