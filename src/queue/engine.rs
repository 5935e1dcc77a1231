//! The dispatcher: one pull loop + semaphore-bounded process tasks per
//! queue, implementing the per-message state machine from spec §4.2.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::ids::QueueName;

use super::{QueueListener, QueueOptions, QueuePersistence, QueuedMessage, QueuedMessageContext};

/// Buffer depth of each queue's in-memory channel. Enqueue suspends once
/// this is saturated (spec §5 "Backpressure"); sized generously so steady
/// state flow is not blocked by ordinary bursts.
const CHANNEL_BUFFER: usize = 4096;

struct QueueHandle {
    tx: mpsc::Sender<QueuedMessage>,
    options: QueueOptions,
}

/// Owns every queue created on this bus and the shared durable backend.
pub struct QueueEngine {
    persistence: Arc<dyn QueuePersistence>,
    queues: DashMap<QueueName, QueueHandle>,
    cancel: CancellationToken,
}

impl QueueEngine {
    pub fn new(persistence: Arc<dyn QueuePersistence>, cancel: CancellationToken) -> Self {
        Self {
            persistence,
            queues: DashMap::new(),
            cancel,
        }
    }

    /// Creates the queue if absent, replays any non-terminal persisted
    /// messages, and starts its pull loop. Fails with `QueueExists` if this
    /// process already created a queue of this name.
    pub async fn create_queue(
        &self,
        name: QueueName,
        listener: Arc<dyn QueueListener>,
        options: QueueOptions,
    ) -> Result<(), BusError> {
        if self.queues.contains_key(&name) {
            return Err(BusError::QueueExists(name));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        self.queues.insert(
            name.clone(),
            QueueHandle {
                tx: tx.clone(),
                options: options.clone(),
            },
        );

        let replay = self
            .persistence
            .load_non_terminal(&name)
            .await
            .map_err(|e| BusError::Transport(crate::error::TransportError::Transport(e)))?;

        let persistence = self.persistence.clone();
        let cancel = self.cancel.clone();
        let queue_name = name.clone();
        tokio::spawn(async move {
            for entry in replay {
                if tx.send(entry).await.is_err() {
                    return;
                }
            }
            run_pull_loop(queue_name, rx, listener, persistence, options, cancel).await;
        });

        Ok(())
    }

    /// Persists `message` and hands it to the queue's dispatcher. Suspends
    /// if the in-memory buffer is saturated.
    pub async fn enqueue_message(
        &self,
        name: &QueueName,
        message: crate::message::Message,
        sender_principal: Option<String>,
    ) -> Result<(), BusError> {
        let tx = {
            let handle = self
                .queues
                .get(name)
                .ok_or_else(|| BusError::QueueNotFound(name.clone()))?;
            handle.tx.clone()
        };

        let id = message
            .id()
            .ok_or_else(|| BusError::Serialization("message has no MessageId header".into()))?;
        let entry = QueuedMessage {
            id,
            message,
            sender_principal,
            attempts: 0,
            acknowledged_at: None,
            abandoned_at: None,
        };

        self.persistence
            .insert(name, entry.clone())
            .await
            .map_err(|e| BusError::Transport(crate::error::TransportError::Transport(e)))?;

        tx.send(entry)
            .await
            .map_err(|_| BusError::QueueNotFound(name.clone()))
    }
}

async fn run_pull_loop(
    name: QueueName,
    mut rx: mpsc::Receiver<QueuedMessage>,
    listener: Arc<dyn QueueListener>,
    persistence: Arc<dyn QueuePersistence>,
    options: QueueOptions,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(options.concurrency_limit.max(1)));
    loop {
        let entry = tokio::select! {
            e = rx.recv() => match e {
                Some(e) => e,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let listener = listener.clone();
        let persistence = persistence.clone();
        let options = options.clone();
        let name = name.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let _permit = permit;
            process_message(name, entry, listener, persistence, options, cancel).await;
        });
    }
}

async fn process_message(
    name: QueueName,
    mut entry: QueuedMessage,
    listener: Arc<dyn QueueListener>,
    persistence: Arc<dyn QueuePersistence>,
    options: QueueOptions,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        if entry.message.headers().is_expired(Utc::now()) {
            debug!(queue = %name, message_id = %entry.id, "skip-and-ack: message expired before dispatch");
            let _ = persistence.acknowledge(&name, entry.id, entry.attempts).await;
            return;
        }

        entry.attempts += 1;
        let ctx = QueuedMessageContext::new(entry.message.headers().clone(), entry.sender_principal.clone());
        let outcome = listener.handle(&entry.message, &ctx).await;

        let acked = ctx.is_acknowledged() || options.auto_acknowledge;
        match outcome {
            Ok(()) if acked => {
                debug!(queue = %name, message_id = %entry.id, attempts = entry.attempts, "acknowledged");
                let _ = persistence.acknowledge(&name, entry.id, entry.attempts).await;
                return;
            }
            Ok(()) => {
                debug!(queue = %name, message_id = %entry.id, attempts = entry.attempts, "listener returned without acknowledging");
            }
            Err(e) => {
                warn!(queue = %name, message_id = %entry.id, attempts = entry.attempts, error = %e, "listener error, treated as unacknowledged");
            }
        }

        if entry.attempts >= options.max_attempts {
            warn!(queue = %name, message_id = %entry.id, attempts = entry.attempts, "abandoning after max attempts");
            let _ = persistence.abandon(&name, entry.id, entry.attempts).await;
            return;
        }

        let _ = persistence.record_attempt(&name, entry.id, entry.attempts).await;
        if !options.retry_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(options.retry_delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
        // In-place retry: re-dispatch within this same task rather than
        // re-enqueueing at the channel's tail. Preserves the invariant that
        // a perpetually-failing message never starves later arrivals when
        // concurrency_limit > 1; at concurrency_limit == 1 this accepts
        // head-of-line blocking, as spec §4.2 explicitly permits.
    }
}
