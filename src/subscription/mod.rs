//! C3 — Subscription Tracker: persists (topic -> subscriber URIs with
//! TTLs) and answers "who subscribes to T?" with only the unexpired set.

pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::ids::TopicName;

/// One inbound subscriber of a topic.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub uri: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Abstract persistence boundary, mirroring [`crate::queue::QueuePersistence`].
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn add(&self, topic: &TopicName, subscriber: String, ttl: Option<std::time::Duration>);
    async fn remove(&self, topic: &TopicName, subscriber: &str);
    async fn subscribers(&self, topic: &TopicName) -> Vec<Subscriber>;
    async fn sweep_expired(&self);
}

/// dashmap-backed reference implementation. `add` upserts by (topic,
/// subscriber): a newer TTL overwrites the older `expires_at` (spec §4.3).
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    by_topic: DashMap<TopicName, Vec<Subscriber>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn add(&self, topic: &TopicName, subscriber: String, ttl: Option<std::time::Duration>) {
        let expires_at = ttl.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        let mut entry = self.by_topic.entry(topic.clone()).or_default();
        if let Some(existing) = entry.iter_mut().find(|s| s.uri == subscriber) {
            existing.expires_at = expires_at;
        } else {
            entry.push(Subscriber { uri: subscriber, expires_at });
        }
    }

    async fn remove(&self, topic: &TopicName, subscriber: &str) {
        if let Some(mut entry) = self.by_topic.get_mut(topic) {
            entry.retain(|s| s.uri != subscriber);
        }
    }

    async fn subscribers(&self, topic: &TopicName) -> Vec<Subscriber> {
        let now = Utc::now();
        self.by_topic
            .get(topic)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|s| s.expires_at.map(|exp| exp > now).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn sweep_expired(&self) {
        let now = Utc::now();
        for mut entry in self.by_topic.iter_mut() {
            entry.retain(|s| s.expires_at.map(|exp| exp > now).unwrap_or(true));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_is_idempotent_by_uri_and_keeps_latest_ttl() {
        let store = InMemorySubscriptionStore::new();
        let topic = TopicName::from("T0");
        store.add(&topic, "https://b/".into(), Some(std::time::Duration::from_secs(60))).await;
        store.add(&topic, "https://b/".into(), Some(std::time::Duration::from_secs(120))).await;
        assert_eq!(store.subscribers(&topic).await.len(), 1);
    }

    #[tokio::test]
    async fn expired_subscribers_are_excluded() {
        let store = InMemorySubscriptionStore::new();
        let topic = TopicName::from("T0");
        store.add(&topic, "https://b/".into(), Some(std::time::Duration::from_millis(1))).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store.subscribers(&topic).await.len(), 0);
    }

    #[tokio::test]
    async fn non_expiring_subscription_has_no_ttl() {
        let store = InMemorySubscriptionStore::new();
        let topic = TopicName::from("T0");
        store.add(&topic, "https://b/".into(), None).await;
        assert_eq!(store.subscribers(&topic).await.len(), 1);
    }
}
