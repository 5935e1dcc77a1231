//! C2 — Queue Engine: durable FIFO queues with listener dispatch, bounded
//! concurrency, retry, expiration, and acknowledgement.

pub mod engine;
pub mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::message::{Headers, Message};

pub use engine::QueueEngine;
pub use store::{InMemoryQueueStore, QueuePersistence, QueuedMessage};

/// Options for [`QueueEngine::create_queue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub concurrency_limit: usize,
    pub auto_acknowledge: bool,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            auto_acknowledge: false,
            max_attempts: 10,
            retry_delay: Duration::ZERO,
        }
    }
}

/// Handed to a listener alongside the message; `acknowledge()` is how the
/// listener signals the terminal-success branch of the state machine.
pub struct QueuedMessageContext {
    headers: Headers,
    sender_principal: Option<String>,
    acknowledged: AtomicBool,
}

impl QueuedMessageContext {
    pub fn new(headers: Headers, sender_principal: Option<String>) -> Self {
        Self {
            headers,
            sender_principal,
            acknowledged: AtomicBool::new(false),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn sender_principal(&self) -> Option<&str> {
        self.sender_principal.as_deref()
    }

    pub fn acknowledge(&self) {
        self.acknowledged.store(true, Ordering::SeqCst);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

/// A queue's dispatch target. Handler errors are treated identically to a
/// listener that returned without acknowledging (spec §4.2: "listener
/// throws -> treat as unack").
#[async_trait]
pub trait QueueListener: Send + Sync {
    async fn handle(&self, message: &Message, ctx: &QueuedMessageContext) -> Result<(), String>;
}
