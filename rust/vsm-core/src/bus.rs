//! # Event Bus - Topic-Keyed Pub/Sub
//!
//! Every published event is stamped by the process-wide HLC and fanned out
//! to the subscribers of its topic plus the `:all` wildcard. Delivery is
//! asynchronous with per-topic FIFO per subscriber; there is no ordering
//! guarantee across topics (consumers that need causality sort by HLC).
//!
//! Backpressure: each subscriber owns a bounded queue (default 4096) with
//! drop-oldest on overflow; an overflow emits a `bus_overflow` event to
//! `:all`. Subscribers that stay unreachable for K consecutive deliveries
//! are removed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vsm_core::{bus::EventBus, hlc::HybridLogicalClock, metrics::MetricsRegistry};
//!
//! # async fn example() -> vsm_core::Result<()> {
//! let clock = Arc::new(HybridLogicalClock::new("node-a"));
//! let metrics = Arc::new(MetricsRegistry::new());
//! let bus = EventBus::new(clock, metrics);
//!
//! let mut sub = bus.subscribe("s1_health")?;
//! bus.publish("s1_health", "s1", serde_json::json!({ "health": 0.9 }))?;
//! let event = sub.recv().await.unwrap();
//! assert_eq!(event.event_type, "s1_health");
//! # Ok(())
//! # }
//! ```

use crate::error::{CoreError, Result};
use crate::event::{topics, Event};
use crate::hlc::HybridLogicalClock;
use crate::metrics::MetricsRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default per-subscriber queue bound
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Consecutive delivery errors before a subscriber is removed
pub const DEFAULT_MAX_DELIVERY_ERRORS: u32 = 5;

struct SubscriberSlot {
    id: Uuid,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    consecutive_errors: AtomicU32,
    dropped: AtomicU64,
}

impl SubscriberSlot {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

/// Handle held by a subscriber; dropping it unsubscribes
pub struct Subscription {
    /// Topic this subscription listens on
    pub topic: String,
    id: Uuid,
    slot: Arc<SubscriberSlot>,
}

impl Subscription {
    /// Subscription id, unique per subscriber
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next event in topic order
    ///
    /// Returns `None` once the bus has removed this subscriber.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.slot.queue.lock().pop_front() {
                return Some(event);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return None;
            }
            self.slot.notify.notified().await;
        }
    }

    /// Pop the next event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.slot.queue.lock().pop_front()
    }

    /// Events dropped from this subscriber's queue since subscribing
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.closed.store(true, Ordering::Release);
    }
}

/// Per-topic counters reported by [`EventBus::topic_stats`]
#[derive(Debug, Clone, serde::Serialize)]
pub struct TopicStats {
    /// Topic name
    pub topic: String,
    /// Live subscriber count
    pub subscribers: usize,
    /// Events dropped across all subscriber queues of this topic
    pub dropped: u64,
}

/// Topic-keyed publish/subscribe bus
pub struct EventBus {
    clock: Arc<HybridLogicalClock>,
    metrics: Arc<MetricsRegistry>,
    subscribers: DashMap<String, Vec<Arc<SubscriberSlot>>>,
    queue_capacity: usize,
    max_delivery_errors: u32,
}

impl EventBus {
    /// Create a bus with default bounds
    pub fn new(clock: Arc<HybridLogicalClock>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            clock,
            metrics,
            subscribers: DashMap::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_delivery_errors: DEFAULT_MAX_DELIVERY_ERRORS,
        }
    }

    /// Set the per-subscriber queue bound
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the consecutive-error budget before a subscriber is removed
    pub fn with_max_delivery_errors(mut self, max: u32) -> Self {
        self.max_delivery_errors = max.max(1);
        self
    }

    /// The clock stamping events published here
    pub fn clock(&self) -> &Arc<HybridLogicalClock> {
        &self.clock
    }

    /// The metrics registry this bus records into
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Subscribe to a topic (use [`topics::ALL`] for the wildcard)
    pub fn subscribe(&self, topic: &str) -> Result<Subscription> {
        Self::validate_topic(topic)?;

        let slot = Arc::new(SubscriberSlot::new(Uuid::new_v4()));
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Arc::clone(&slot));

        debug!(topic, subscriber = %slot.id, "subscribed");
        Ok(Subscription {
            topic: topic.to_string(),
            id: slot.id,
            slot,
        })
    }

    /// Remove a subscription eagerly instead of waiting for sweep
    pub fn unsubscribe(&self, sub: Subscription) {
        sub.slot.closed.store(true, Ordering::Release);
        if let Some(mut slots) = self.subscribers.get_mut(&sub.topic) {
            slots.retain(|s| s.id != sub.id);
        }
        debug!(topic = %sub.topic, subscriber = %sub.id, "unsubscribed");
    }

    /// Publish an event, stamping it with a fresh HLC timestamp
    ///
    /// Fails with `InvalidTopic` on an empty topic and `HlcUnavailable`
    /// when the clock cannot be reached; non-critical callers are expected
    /// to surface the latter rather than fall back.
    pub fn publish(
        &self,
        topic: &str,
        subsystem: &str,
        data: serde_json::Value,
    ) -> Result<Event> {
        Self::validate_topic(topic)?;
        let ts = self.clock.tick()?;
        let event = Event::new(topic, subsystem, data, ts);
        self.fan_out(topic, &event);
        Ok(event)
    }

    /// Publish on the critical path, never failing on clock contention
    ///
    /// Emergency signals must go out even when the HLC is unavailable, so
    /// this path stamps a fallback timestamp instead of returning an error.
    pub fn publish_critical(
        &self,
        topic: &str,
        subsystem: &str,
        data: serde_json::Value,
    ) -> Result<Event> {
        Self::validate_topic(topic)?;
        let ts = self.clock.tick_or_fallback();
        let event = Event::new(topic, subsystem, data, ts);
        self.fan_out(topic, &event);
        Ok(event)
    }

    /// Subscriber counts and drop counters per topic
    pub fn topic_stats(&self) -> Vec<TopicStats> {
        self.subscribers
            .iter()
            .map(|entry| TopicStats {
                topic: entry.key().clone(),
                subscribers: entry
                    .value()
                    .iter()
                    .filter(|s| !s.closed.load(Ordering::Acquire))
                    .count(),
                dropped: entry
                    .value()
                    .iter()
                    .map(|s| s.dropped.load(Ordering::Relaxed))
                    .sum(),
            })
            .collect()
    }

    /// Live subscriber count for one topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .get(topic)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|s| !s.closed.load(Ordering::Acquire))
                    .count()
            })
            .unwrap_or(0)
    }

    fn validate_topic(topic: &str) -> Result<()> {
        if topic.trim().is_empty() {
            return Err(CoreError::InvalidTopic(topic.to_string()));
        }
        Ok(())
    }

    fn fan_out(&self, topic: &str, event: &Event) {
        self.metrics.incr("bus.published");
        let mut overflowed = false;

        overflowed |= self.deliver_to(topic, event);
        if topic != topics::ALL {
            overflowed |= self.deliver_to(topics::ALL, event);
        }

        if overflowed && topic != topics::BUS_OVERFLOW {
            // Reentrant depth is one: an overflow of bus_overflow itself is
            // only counted, never re-announced.
            let ts = self.clock.tick_or_fallback();
            let overflow_event = Event::new(
                topics::BUS_OVERFLOW,
                "event_bus",
                serde_json::json!({ "topic": topic }),
                ts,
            );
            self.deliver_to(topics::ALL, &overflow_event);
            self.metrics.incr("bus.overflow_events");
        }
    }

    /// Deliver to every live subscriber of `key`; returns true if any
    /// queue overflowed
    fn deliver_to(&self, key: &str, event: &Event) -> bool {
        let Some(mut slots) = self.subscribers.get_mut(key) else {
            return false;
        };

        let mut overflowed = false;
        let mut removed = 0usize;

        slots.retain(|slot| {
            if slot.closed.load(Ordering::Acquire) {
                removed += 1;
                return false;
            }

            let errors = slot.consecutive_errors.load(Ordering::Relaxed);
            if errors >= self.max_delivery_errors {
                warn!(
                    subscriber = %slot.id,
                    errors,
                    "removing unreachable subscriber"
                );
                slot.closed.store(true, Ordering::Release);
                slot.notify.notify_one();
                removed += 1;
                return false;
            }

            let mut queue = slot.queue.lock();
            if queue.len() >= self.queue_capacity {
                queue.pop_front();
                slot.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr("bus.dropped");
                overflowed = true;
                // A queue that never drains counts as a failing subscriber
                slot.consecutive_errors.fetch_add(1, Ordering::Relaxed);
            } else {
                slot.consecutive_errors.store(0, Ordering::Relaxed);
            }
            queue.push_back(event.clone());
            drop(queue);

            slot.notify.notify_one();
            self.metrics.incr("bus.delivered");
            true
        });

        if removed > 0 {
            trace!(topic = key, removed, "swept dead subscribers");
        }
        overflowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus() -> EventBus {
        let clock = Arc::new(HybridLogicalClock::new("bus-test"));
        let metrics = Arc::new(MetricsRegistry::new());
        EventBus::new(clock, metrics)
    }

    #[tokio::test]
    async fn test_publish_and_receive_in_order() {
        let bus = test_bus();
        let mut sub = bus.subscribe("s1_health").unwrap();

        for i in 0..10 {
            bus.publish("s1_health", "s1", serde_json::json!({ "seq": i }))
                .unwrap();
        }

        let mut prev = None;
        for i in 0..10 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.data["seq"], i);
            if let Some(prev_ts) = prev {
                assert!(event.timestamp > prev_ts);
            }
            prev = Some(event.timestamp);
        }
    }

    #[tokio::test]
    async fn test_wildcard_receives_every_topic() {
        let bus = test_bus();
        let mut all = bus.subscribe(topics::ALL).unwrap();

        bus.publish("s1_health", "s1", serde_json::json!({})).unwrap();
        bus.publish("s3_control", "s3", serde_json::json!({})).unwrap();

        assert_eq!(all.recv().await.unwrap().event_type, "s1_health");
        assert_eq!(all.recv().await.unwrap().event_type, "s3_control");
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let bus = test_bus();
        assert!(matches!(
            bus.publish("", "s1", serde_json::json!({})),
            Err(CoreError::InvalidTopic(_))
        ));
        assert!(matches!(
            bus.subscribe("  "),
            Err(CoreError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_announces() {
        let bus = test_bus().with_queue_capacity(4);
        let mut sub = bus.subscribe("flood").unwrap();
        let mut watcher = bus.subscribe(topics::ALL).unwrap();

        for i in 0..6 {
            bus.publish("flood", "s1", serde_json::json!({ "seq": i }))
                .unwrap();
        }

        // Oldest two were dropped; first delivered is seq=2
        let first = sub.recv().await.unwrap();
        assert_eq!(first.data["seq"], 2);
        assert_eq!(sub.dropped(), 2);

        // Watcher observes a bus_overflow announcement among the flood
        let mut saw_overflow = false;
        while let Some(event) = watcher.try_recv() {
            if event.event_type == topics::BUS_OVERFLOW {
                saw_overflow = true;
                assert_eq!(event.data["topic"], "flood");
            }
        }
        assert!(saw_overflow);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_swept() {
        let bus = test_bus();
        let sub = bus.subscribe("sweep").unwrap();
        assert_eq!(bus.subscriber_count("sweep"), 1);

        drop(sub);
        bus.publish("sweep", "s1", serde_json::json!({})).unwrap();
        assert_eq!(bus.subscriber_count("sweep"), 0);
    }

    #[tokio::test]
    async fn test_publish_critical_survives_contended_clock() {
        let bus = test_bus();
        let mut sub = bus.subscribe(topics::EMERGENCY_ALGEDONIC).unwrap();

        let event = bus
            .publish_critical(
                topics::EMERGENCY_ALGEDONIC,
                "algedonic",
                serde_json::json!({ "reason": "test" }),
            )
            .unwrap();
        assert_eq!(event.event_type, topics::EMERGENCY_ALGEDONIC);

        let received = sub.recv().await.unwrap();
        assert_eq!(received.id, event.id);
    }
}
