//! Handler registration and the context handed to a
//! [`MessageHandler`]/[`crate::queue::QueueListener`] invocation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::MessageSpecification;
use crate::error::BusError;
use crate::ids::QueueName;
use crate::message::Headers;
use crate::naming::NameRegistry;
use crate::serialization::SerializerRegistry;

/// A user-registered handler for inbound messages matching a
/// [`HandlingRule`]'s [`MessageSpecification`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &MessageContext) -> Result<(), String>;
}

/// Routes inbound messages matching `spec` to `handler`. `queue` names the
/// queue used when the message's `Importance` requires queueing (spec
/// §4.6); multiple rules may target the same queue, fanning out to every
/// matching handler for each delivered message.
pub struct HandlingRule {
    pub spec: MessageSpecification,
    pub handler: Arc<dyn MessageHandler>,
    pub queue: QueueName,
}

/// Exposed to a handler while it processes one inbound message. Mirrors
/// [`crate::queue::QueuedMessageContext`]'s acknowledge semantics, plus the
/// ability to reply to the sender.
pub struct MessageContext {
    headers: Headers,
    content: Vec<u8>,
    sender_principal: Option<String>,
    acknowledged: std::sync::atomic::AtomicBool,
    reply: Arc<dyn ReplySender>,
    serializers: Arc<SerializerRegistry>,
    name_registry: Arc<NameRegistry>,
}

/// Sends a reply on behalf of a [`MessageContext`]; implemented by
/// [`crate::bus::Bus`] so `handler.rs` doesn't need to depend on it.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send_reply(
        &self,
        related_to: &Headers,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BusError>;
}

impl MessageContext {
    pub fn new(
        headers: Headers,
        content: Vec<u8>,
        sender_principal: Option<String>,
        reply: Arc<dyn ReplySender>,
        serializers: Arc<SerializerRegistry>,
        name_registry: Arc<NameRegistry>,
    ) -> Self {
        Self {
            headers,
            content,
            sender_principal,
            acknowledged: std::sync::atomic::AtomicBool::new(false),
            reply,
            serializers,
            name_registry,
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw wire bytes, undecoded. Most handlers should prefer
    /// [`MessageContext::decode`]; this stays available for
    /// `application/octet-stream` payloads the registry passes through.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Decodes the message content via [`crate::serialization::SerializerRegistry`]
    /// keyed on the `ContentType` header. If the wire `MessageName` was
    /// registered with [`crate::bus::Bus::register_type`], the registered
    /// type must match `T` or decoding fails — the same id-consistency
    /// check `mbus-api`'s `ReceivedMessage` does before handing a payload to
    /// a handler.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        if let Some(name) = self.headers.message_name() {
            if self.name_registry.is_registered(&name) {
                let expected = self.name_registry.type_for_name(&name)?;
                let actual = std::any::type_name::<T>();
                if expected != actual {
                    return Err(BusError::UnknownMessage(format!(
                        "message '{name}' is registered as '{expected}', not '{actual}'"
                    )));
                }
            }
        }
        self.serializers.deserialize(self.headers.content_type(), &self.content)
    }

    pub fn sender_principal(&self) -> Option<&str> {
        self.sender_principal.as_deref()
    }

    pub fn acknowledge(&self) {
        self.acknowledged.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Transports a new message with `RelatedTo` set to this message's id
    /// and `Destination` set to its origination (spec §4.6 "Reply path").
    pub async fn send_reply(&self, content: Vec<u8>, content_type: &str) -> Result<(), BusError> {
        self.reply.send_reply(&self.headers, content, content_type).await
    }
}
