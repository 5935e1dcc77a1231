//! C7 — Inbound Handler Listener: the [`crate::queue::QueueListener`] used
//! for handler queues. Fans out to every [`HandlingRule`] targeting this
//! queue whose [`MessageSpecification`] matches, awaits them all, then
//! acknowledges iff any handler acknowledged.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use crate::config::MessageSpecification;
use crate::handler::{HandlingRule, MessageContext, ReplySender};
use crate::ids::MessageName;
use crate::message::Message;
use crate::naming::NameRegistry;
use crate::queue::{QueueListener, QueuedMessageContext};
use crate::serialization::SerializerRegistry;

/// One rule's `(spec, handler)` pair, pre-filtered to a single queue.
struct RoutedHandler {
    spec: MessageSpecification,
    handler: Arc<dyn crate::handler::MessageHandler>,
}

pub struct InboundHandlerListener {
    handlers: Vec<RoutedHandler>,
    reply: Arc<dyn ReplySender>,
    serializers: Arc<SerializerRegistry>,
    name_registry: Arc<NameRegistry>,
}

impl InboundHandlerListener {
    /// Builds the listener for one queue from every [`HandlingRule`] that
    /// targets it.
    pub fn for_queue(
        rules: &[HandlingRule],
        queue: &crate::ids::QueueName,
        reply: Arc<dyn ReplySender>,
        serializers: Arc<SerializerRegistry>,
        name_registry: Arc<NameRegistry>,
    ) -> Self {
        let handlers = rules
            .iter()
            .filter(|r| &r.queue == queue)
            .map(|r| RoutedHandler {
                spec: r.spec.clone(),
                handler: r.handler.clone(),
            })
            .collect();
        Self { handlers, reply, serializers, name_registry }
    }
}

#[async_trait]
impl QueueListener for InboundHandlerListener {
    async fn handle(&self, message: &Message, ctx: &QueuedMessageContext) -> Result<(), String> {
        let name = message
            .headers()
            .message_name()
            .unwrap_or_else(|| MessageName::from(""));

        let matching: Vec<&RoutedHandler> = self
            .handlers
            .iter()
            .filter(|h| h.spec.matches(&name).unwrap_or(false))
            .collect();

        if matching.is_empty() {
            warn!(message_name = %name, "no handling rule matched a message delivered to this queue");
            return Ok(());
        }

        let msg_ctx = Arc::new(MessageContext::new(
            message.headers().clone(),
            message.content().to_vec(),
            ctx.sender_principal().map(str::to_string),
            self.reply.clone(),
            self.serializers.clone(),
            self.name_registry.clone(),
        ));

        let futures = matching.iter().map(|h| {
            let msg_ctx = msg_ctx.clone();
            let handler = h.handler.clone();
            async move { handler.handle(&msg_ctx).await }
        });

        let results = join_all(futures).await;
        for result in &results {
            if let Err(e) = result {
                warn!(message_name = %name, error = %e, "handler returned an error");
            }
        }

        if msg_ctx.is_acknowledged() {
            ctx.acknowledge();
        }

        if results.iter().any(Result::is_err) {
            return Err("one or more handlers failed".to_string());
        }
        Ok(())
    }
}
