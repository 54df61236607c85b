//! Typed resilience events for observability consumers.
//!
//! Components publish onto a shared [`EventBus`]; dashboards, audit logs or
//! tests subscribe and receive every event published after they subscribed.
//! Publishing never blocks and never fails: without subscribers events are
//! dropped, and a lagging subscriber loses the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::health::HealthStatus;
use crate::resilience::circuit_breaker::{BreakerStats, CircuitState};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    Success {
        service: String,
        latency_ms: u64,
        stats: BreakerStats,
    },
    Failure {
        service: String,
        latency_ms: u64,
        error: String,
        stats: BreakerStats,
    },
    Blocked {
        service: String,
        state: CircuitState,
        stats: BreakerStats,
    },
    StateChanged {
        service: String,
        from: CircuitState,
        to: CircuitState,
    },
    RateLimited {
        scope: String,
        blacklisted: bool,
    },
    Blacklisted {
        scope: String,
        duration_ms: u64,
    },
    HealthChanged {
        service: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    FallbackServed {
        service: String,
    },
}

impl ResilienceEvent {
    /// The service or scope the event is about.
    pub fn subject(&self) -> &str {
        match self {
            ResilienceEvent::Success { service, .. }
            | ResilienceEvent::Failure { service, .. }
            | ResilienceEvent::Blocked { service, .. }
            | ResilienceEvent::StateChanged { service, .. }
            | ResilienceEvent::HealthChanged { service, .. }
            | ResilienceEvent::FallbackServed { service } => service,
            ResilienceEvent::RateLimited { scope, .. } | ResilienceEvent::Blacklisted { scope, .. } => {
                scope
            }
        }
    }
}

/// Broadcast channel shared by every component of one gateway.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ResilienceEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(ResilienceEvent::FallbackServed {
            service: "jobs".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.subject(), "jobs");
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(ResilienceEvent::RateLimited {
            scope: "ip:1.2.3.4".into(),
            blacklisted: false,
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(ResilienceEvent::StateChanged {
            service: "payments".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        })
        .unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["to"], "OPEN");
    }
}
