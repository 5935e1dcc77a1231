//! C4 — Reply Hub: correlates inbound reply messages to the originating
//! outbound message and exposes a lazy, multi-consumer reply stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tracing::debug;

use crate::error::BusError;
use crate::ids::MessageId;

/// Default idle eviction window for a registered [`SentMessage`] whose
/// stream nobody has touched recently.
pub const DEFAULT_REPLY_TTL: Duration = Duration::from_secs(5 * 60);

const CHANNEL_CAPACITY: usize = 64;

/// One decoded reply payload plus the content type it arrived with.
#[derive(Debug, Clone)]
pub struct ReplyPayload {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
enum ReplyEvent {
    Payload(ReplyPayload),
    Done,
}

struct ReplySlot {
    sender: broadcast::Sender<ReplyEvent>,
    last_seen: std::sync::Mutex<Instant>,
}

impl ReplySlot {
    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }
}

/// Correlates replies (by the `RelatedTo` header) to the [`SentMessage`]
/// handle a `Send` call returned.
pub struct ReplyHub {
    slots: DashMap<MessageId, Arc<ReplySlot>>,
    reply_ttl: Duration,
}

impl ReplyHub {
    pub fn new(reply_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            reply_ttl,
        })
    }

    /// Registers a stream for `message_id`. Must be called before the
    /// outbound transport is started (spec §4.4 "Concurrency contract") so
    /// `observe_replies` is safe to call the instant `Send` returns.
    pub fn create_sent_message(self: &Arc<Self>, message_id: MessageId) -> SentMessage {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        self.slots.insert(
            message_id,
            Arc::new(ReplySlot {
                sender: tx,
                last_seen: std::sync::Mutex::new(Instant::now()),
            }),
        );
        SentMessage {
            id: message_id,
            hub: self.clone(),
        }
    }

    /// Appends a decoded reply payload to `related_to`'s stream, if a slot
    /// is still registered for it.
    pub fn reply_received(&self, related_to: MessageId, payload: ReplyPayload) {
        if let Some(slot) = self.slots.get(&related_to) {
            slot.touch();
            let _ = slot.sender.send(ReplyEvent::Payload(payload));
        } else {
            debug!(message_id = %related_to, "reply arrived for unknown/evicted SentMessage");
        }
    }

    /// Terminates `related_to`'s stream: subsequent `observe_replies`
    /// consumers see completion rather than waiting indefinitely.
    pub fn notify_last_reply_received(&self, related_to: MessageId) {
        if let Some(slot) = self.slots.get(&related_to) {
            slot.touch();
            let _ = slot.sender.send(ReplyEvent::Done);
        }
    }

    /// Sweeps slots idle past `reply_ttl`. Intended to run on a periodic
    /// background task for the bus's lifetime.
    pub fn evict_idle(&self) {
        self.slots.retain(|_, slot| slot.idle_for() < self.reply_ttl);
    }

    fn subscribe(&self, id: MessageId) -> Result<broadcast::Receiver<ReplyEvent>, BusError> {
        self.slots
            .get(&id)
            .map(|slot| slot.sender.subscribe())
            .ok_or(BusError::UnknownSentMessage(id))
    }
}

/// Handle returned by `Bus::send`. Owns a lazy, multi-consumer stream of
/// decoded replies keyed by this message's id.
pub struct SentMessage {
    id: MessageId,
    hub: Arc<ReplyHub>,
}

impl SentMessage {
    pub fn message_id(&self) -> MessageId {
        self.id
    }

    /// A stream of reply payloads. Terminates when `NotifyLastReplyReceived`
    /// fires for this message, or the underlying slot is evicted after the
    /// idle TTL. Late subscribers only see subsequent replies — streams are
    /// not replayable (spec §4.4).
    pub fn observe_replies(&self) -> Result<impl Stream<Item = ReplyPayload>, BusError> {
        let rx = self.hub.subscribe(self.id)?;
        let stream = BroadcastStream::new(rx).take_while(Result::is_ok).filter_map(|evt| match evt {
            Ok(ReplyEvent::Payload(p)) => Some(p),
            Ok(ReplyEvent::Done) | Err(_) => None,
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn single_reply_is_observed() {
        let hub = ReplyHub::new(DEFAULT_REPLY_TTL);
        let id = MessageId::generate();
        let sent = hub.create_sent_message(id);
        let mut stream = Box::pin(sent.observe_replies().unwrap());

        hub.reply_received(
            id,
            ReplyPayload {
                content_type: "application/json".into(),
                bytes: b"{}".to_vec(),
            },
        );
        hub.notify_last_reply_received(id);

        let first = stream.next().await.unwrap();
        assert_eq!(first.bytes, b"{}");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_message_id_errors() {
        let hub = ReplyHub::new(DEFAULT_REPLY_TTL);
        let err = hub.subscribe(MessageId::generate()).unwrap_err();
        assert!(matches!(err, BusError::UnknownSentMessage(_)));
    }

    #[tokio::test]
    async fn multiple_subscribers_see_the_same_sequence() {
        let hub = ReplyHub::new(DEFAULT_REPLY_TTL);
        let id = MessageId::generate();
        let sent = hub.create_sent_message(id);
        let mut s1 = Box::pin(sent.observe_replies().unwrap());
        let mut s2 = Box::pin(sent.observe_replies().unwrap());

        hub.reply_received(
            id,
            ReplyPayload {
                content_type: "application/json".into(),
                bytes: b"42".to_vec(),
            },
        );
        hub.notify_last_reply_received(id);

        assert_eq!(s1.next().await.unwrap().bytes, b"42");
        assert_eq!(s2.next().await.unwrap().bytes, b"42");
    }
}
