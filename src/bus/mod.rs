//! Crew message bus for in/out subscriptions.
//!
//! Every message a crew receives is published as an [`Direction::Inbound`]
//! event, and every message a machine emits as an [`Direction::Outbound`]
//! event. Transports (sockets, brokers, HTTP) subscribe here to feed crews
//! and to carry their output away.
//!
//! Subscribers register interest per crew id, or in [`ALL_CREWS`].

use crate::types::{CrewId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Topic matching every crew.
pub const ALL_CREWS: &str = "*";

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// A message arriving at a crew.
    Inbound,
    /// A message a machine emitted.
    Outbound,
}

/// A message passing into or out of a crew.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub direction: Direction,
    pub crew_id: CrewId,
    pub message: Value,
    pub timestamp_ms: i64,
    /// Machine that emitted an outbound message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl BusEvent {
    pub fn inbound(crew_id: CrewId, message: Value) -> Self {
        Self {
            direction: Direction::Inbound,
            crew_id,
            message,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            source: None,
        }
    }

    pub fn outbound(crew_id: CrewId, source: impl Into<String>, message: Value) -> Self {
        Self {
            direction: Direction::Outbound,
            crew_id,
            message,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            source: Some(source.into()),
        }
    }
}

// =============================================================================
// Subscriber Management
// =============================================================================

#[derive(Debug)]
struct Subscriber {
    id: String,
    directions: Vec<Direction>,
    tx: mpsc::UnboundedSender<BusEvent>,
}

/// Subscription receipt for managing subscriptions.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub topics: Vec<String>,
}

// =============================================================================
// MessageBus
// =============================================================================

/// In-memory fan-out of crew traffic.
#[derive(Debug, Clone)]
pub struct MessageBus {
    /// topic (crew id or `*`) -> subscribers
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,

    stats: Arc<RwLock<BusStats>>,
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub inbound_published: u64,
    pub outbound_published: u64,
    pub delivered: u64,
    pub active_subscribers: usize,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(BusStats::default())),
        }
    }

    /// Publish an event to every subscriber of its crew and of [`ALL_CREWS`]
    /// that wants its direction. Returns the number of deliveries.
    pub async fn publish(&self, event: BusEvent) -> Result<usize> {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for topic in [event.crew_id.as_str(), ALL_CREWS] {
                let Some(subs) = subscribers.get(topic) else {
                    continue;
                };
                for subscriber in subs.iter().filter(|s| s.directions.contains(&event.direction)) {
                    if subscriber.tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        closed.push(subscriber.id.clone());
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for subs in subscribers.values_mut() {
                subs.retain(|s| !closed.contains(&s.id));
            }
            self.stats.write().await.active_subscribers = count(&subscribers);
        }

        let mut stats = self.stats.write().await;
        match event.direction {
            Direction::Inbound => stats.inbound_published += 1,
            Direction::Outbound => stats.outbound_published += 1,
        }
        stats.delivered += delivered as u64;

        tracing::debug!(
            "Published {:?} event crew={} to {} subscribers",
            event.direction,
            event.crew_id,
            delivered
        );

        Ok(delivered)
    }

    /// Subscribe to crews' traffic in the given directions.
    ///
    /// Returns (subscription handle, receiver channel) for receiving events.
    pub async fn subscribe(
        &self,
        subscriber_id: String,
        topics: Vec<String>,
        directions: Vec<Direction>,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<BusEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = self.subscribers.write().await;
        for topic in &topics {
            subscribers.entry(topic.clone()).or_default().push(Subscriber {
                id: subscriber_id.clone(),
                directions: directions.clone(),
                tx: tx.clone(),
            });
        }

        self.stats.write().await.active_subscribers = count(&subscribers);

        tracing::debug!("Subscriber {} registered for crews: {:?}", subscriber_id, topics);

        Ok((
            Subscription {
                id: subscriber_id,
                topics,
            },
            rx,
        ))
    }

    /// Unsubscribe from events.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let mut subscribers = self.subscribers.write().await;

        for topic in &subscription.topics {
            if let Some(subs) = subscribers.get_mut(topic) {
                subs.retain(|s| s.id != subscription.id);
            }
        }

        self.stats.write().await.active_subscribers = count(&subscribers);

        tracing::debug!("Unsubscribed: {}", subscription.id);

        Ok(())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Get current bus statistics.
    pub async fn get_stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }

    /// Reset statistics counters.
    pub async fn reset_stats(&self) {
        let mut stats = self.stats.write().await;
        stats.inbound_published = 0;
        stats.outbound_published = 0;
        stats.delivered = 0;
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

fn count(subscribers: &HashMap<String, Vec<Subscriber>>) -> usize {
    subscribers.values().map(Vec::len).sum()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BOTH: [Direction; 2] = [Direction::Inbound, Direction::Outbound];

    #[tokio::test]
    async fn test_publish_to_zero_subscribers() {
        let bus = MessageBus::new();
        let delivered = bus
            .publish(BusEvent::inbound(CrewId::from("c1"), json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(delivered, 0);

        let stats = bus.get_stats().await;
        assert_eq!(stats.inbound_published, 1);
    }

    #[tokio::test]
    async fn test_crew_topic_and_wildcard() {
        let bus = MessageBus::new();
        let (_s1, mut rx_crew) = bus
            .subscribe("crew-only".into(), vec!["c1".into()], BOTH.to_vec())
            .await
            .unwrap();
        let (_s2, mut rx_all) = bus
            .subscribe("everything".into(), vec![ALL_CREWS.into()], BOTH.to_vec())
            .await
            .unwrap();

        let delivered = bus
            .publish(BusEvent::outbound(CrewId::from("c1"), "m1", json!({"hi": 1})))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(rx_crew.recv().await.unwrap().source.as_deref(), Some("m1"));
        assert_eq!(rx_all.recv().await.unwrap().direction, Direction::Outbound);

        let delivered = bus
            .publish(BusEvent::inbound(CrewId::from("c2"), json!({})))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_direction_filter() {
        let bus = MessageBus::new();
        let (_sub, mut rx) = bus
            .subscribe("out".into(), vec!["c1".into()], vec![Direction::Outbound])
            .await
            .unwrap();
        bus.publish(BusEvent::inbound(CrewId::from("c1"), json!(1))).await.unwrap();
        bus.publish(BusEvent::outbound(CrewId::from("c1"), "m", json!(2))).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().message, json!(2));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = MessageBus::new();
        let (subscription, _rx) = bus
            .subscribe("sub1".into(), vec!["c1".into()], BOTH.to_vec())
            .await
            .unwrap();
        assert_eq!(bus.get_stats().await.active_subscribers, 1);

        bus.unsubscribe(&subscription).await.unwrap();
        assert_eq!(bus.get_stats().await.active_subscribers, 0);

        let delivered = bus
            .publish(BusEvent::inbound(CrewId::from("c1"), json!({})))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_closed_subscribers_pruned() {
        let bus = MessageBus::new();
        let (_sub, rx) = bus
            .subscribe("gone".into(), vec!["c1".into()], BOTH.to_vec())
            .await
            .unwrap();
        drop(rx);
        let delivered = bus
            .publish(BusEvent::inbound(CrewId::from("c1"), json!({})))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(bus.get_stats().await.active_subscribers, 0);
    }
}
