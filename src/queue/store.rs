//! The abstract persistence boundary for the queue engine (spec §9 "Backend
//! swap"). `InMemoryQueueStore` is the bundled reference implementation;
//! production deployments are expected to supply a durable one (filesystem,
//! SQL) — that stays outside core scope per spec §1.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::ids::{MessageId, QueueName};
use crate::message::Message;

/// A persistent record of one message's journey through a queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub message: Message,
    pub sender_principal: Option<String>,
    pub attempts: u32,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    pub fn is_terminal(&self) -> bool {
        self.acknowledged_at.is_some() || self.abandoned_at.is_some()
    }
}

/// Abstract durable backend a [`super::engine::QueueEngine`] drives. Each
/// operation is required to be a single ACID-ish unit (spec §4.2
/// "Durability contract").
#[async_trait]
pub trait QueuePersistence: Send + Sync {
    async fn insert(&self, queue: &QueueName, entry: QueuedMessage) -> Result<(), String>;

    async fn load_non_terminal(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, String>;

    async fn record_attempt(&self, queue: &QueueName, id: MessageId, attempts: u32) -> Result<(), String>;

    async fn acknowledge(&self, queue: &QueueName, id: MessageId, attempts: u32) -> Result<(), String>;

    async fn abandon(&self, queue: &QueueName, id: MessageId, attempts: u32) -> Result<(), String>;
}

/// Reference in-memory backend. Crash recovery is a no-op (process memory
/// does not survive a crash) but the API contract — insert-by-id,
/// select-non-terminal-by-queue, update-terminal-by-id — is upheld exactly
/// as a durable backend would implement it.
#[derive(Default)]
pub struct InMemoryQueueStore {
    queues: DashMap<QueueName, Mutex<VecDeque<QueuedMessage>>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &QueueName) -> dashmap::mapref::one::Ref<'_, QueueName, Mutex<VecDeque<QueuedMessage>>> {
        self.queues.entry(name.clone()).or_default();
        self.queues.get(name).unwrap()
    }
}

#[async_trait]
impl QueuePersistence for InMemoryQueueStore {
    async fn insert(&self, queue: &QueueName, entry: QueuedMessage) -> Result<(), String> {
        let q = self.queue(queue);
        q.lock().unwrap().push_back(entry);
        Ok(())
    }

    async fn load_non_terminal(&self, queue: &QueueName) -> Result<Vec<QueuedMessage>, String> {
        let q = self.queue(queue);
        let guard = q.lock().unwrap();
        Ok(guard.iter().filter(|m| !m.is_terminal()).cloned().collect())
    }

    async fn record_attempt(&self, queue: &QueueName, id: MessageId, attempts: u32) -> Result<(), String> {
        let q = self.queue(queue);
        let mut guard = q.lock().unwrap();
        if let Some(entry) = guard.iter_mut().find(|m| m.id == id) {
            entry.attempts = attempts;
        }
        Ok(())
    }

    async fn acknowledge(&self, queue: &QueueName, id: MessageId, attempts: u32) -> Result<(), String> {
        let q = self.queue(queue);
        let mut guard = q.lock().unwrap();
        if let Some(entry) = guard.iter_mut().find(|m| m.id == id) {
            entry.attempts = attempts;
            entry.acknowledged_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn abandon(&self, queue: &QueueName, id: MessageId, attempts: u32) -> Result<(), String> {
        let q = self.queue(queue);
        let mut guard = q.lock().unwrap();
        if let Some(entry) = guard.iter_mut().find(|m| m.id == id) {
            entry.attempts = attempts;
            entry.abandoned_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Headers;

    fn sample(id: MessageId) -> QueuedMessage {
        QueuedMessage {
            id,
            message: Message::new(Headers::new(), vec![]),
            sender_principal: None,
            attempts: 0,
            acknowledged_at: None,
            abandoned_at: None,
        }
    }

    #[tokio::test]
    async fn acknowledge_removes_from_non_terminal_set() {
        let store = InMemoryQueueStore::new();
        let q = QueueName::from("outbound");
        let id = MessageId::generate();
        store.insert(&q, sample(id)).await.unwrap();
        assert_eq!(store.load_non_terminal(&q).await.unwrap().len(), 1);

        store.acknowledge(&q, id, 1).await.unwrap();
        assert_eq!(store.load_non_terminal(&q).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn abandon_requires_separate_queue_tracking() {
        let store = InMemoryQueueStore::new();
        let q = QueueName::from("outbound");
        let id = MessageId::generate();
        store.insert(&q, sample(id)).await.unwrap();
        store.abandon(&q, id, 10).await.unwrap();
        assert_eq!(store.load_non_terminal(&q).await.unwrap().len(), 0);
    }
}
