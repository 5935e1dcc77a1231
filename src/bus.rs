//! C6 — Bus Core: composes the transport, queue engine, subscription
//! tracker, reply hub, and naming/serialization registries into the public
//! API (`send`, `publish`, handler dispatch, reply sending, lifecycle).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BusConfig, Credentials, EndpointConfig, MessageSpecification};
use crate::error::{BusError, ConfigError, TransportError};
use crate::handler::{HandlingRule, MessageHandler, ReplySender};
use crate::ids::{EndpointName, MessageId, QueueName, TopicName};
use crate::inbound::InboundHandlerListener;
use crate::message::{Headers, Importance, Message};
use crate::naming::NameRegistry;
use crate::queue::{InMemoryQueueStore, QueueEngine, QueueListener, QueueOptions, QueuePersistence, QueuedMessageContext};
use crate::reply_hub::{ReplyHub, ReplyPayload, SentMessage};
use crate::serialization::SerializerRegistry;
use crate::subscription::worker::{self, SubscriptionWorkerConfig};
use crate::subscription::{InMemorySubscriptionStore, SubscriptionStore};
use crate::transport::{HttpTransport, InboundObserver, SubscriptionKind, Transport};

const OUTBOUND_QUEUE: &str = "peerbus.outbound";
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Per-call send options (spec §4.6 "SendOptions").
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub use_durable_transport: bool,
    pub importance: Importance,
    pub content_type: String,
    pub ttl: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            use_durable_transport: false,
            importance: Importance::Low,
            content_type: "application/json".to_string(),
            ttl: None,
        }
    }
}

struct EndpointTable {
    by_name: HashMap<EndpointName, EndpointConfig>,
    by_address: HashMap<String, EndpointConfig>,
}

impl EndpointTable {
    fn new(endpoints: Vec<EndpointConfig>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_address = HashMap::new();
        for e in endpoints {
            by_address.insert(e.address.clone(), e.clone());
            by_name.insert(e.name.clone(), e);
        }
        Self { by_name, by_address }
    }

    fn credentials_for_address(&self, address: &str) -> Option<Credentials> {
        self.by_address.get(address).map(|e| e.credentials.clone())
    }
}

/// Builds an immutable [`Bus`]. Mirrors spec §5: endpoints, topics, send
/// rules, and the subscription list are assembled here and frozen once
/// [`BusBuilder::build`] returns.
pub struct BusBuilder {
    config: BusConfig,
    handling_rules: Vec<HandlingRule>,
    queue_options: HashMap<QueueName, QueueOptions>,
    outbound_queue_options: QueueOptions,
    transport: Option<Arc<dyn Transport>>,
    queue_store: Option<Arc<dyn QueuePersistence>>,
    subscription_store: Option<Arc<dyn SubscriptionStore>>,
    reply_ttl: Duration,
}

impl BusBuilder {
    pub fn new(config: BusConfig) -> Self {
        let reply_ttl = config.reply_timeout();
        Self {
            config,
            handling_rules: Vec::new(),
            queue_options: HashMap::new(),
            outbound_queue_options: QueueOptions::default(),
            transport: None,
            queue_store: None,
            subscription_store: None,
            reply_ttl,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_queue_store(mut self, store: Arc<dyn QueuePersistence>) -> Self {
        self.queue_store = Some(store);
        self
    }

    pub fn with_subscription_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscription_store = Some(store);
        self
    }

    pub fn with_reply_ttl(mut self, ttl: Duration) -> Self {
        self.reply_ttl = ttl;
        self
    }

    /// Overrides the retry policy of the durable outbound queue (spec §4.6
    /// "durable send"). Defaults to [`QueueOptions::default`].
    pub fn with_outbound_queue_options(mut self, options: QueueOptions) -> Self {
        self.outbound_queue_options = options;
        self
    }

    /// Registers a handling rule. `spec` matches inbound `MessageName`;
    /// messages whose `Importance` requires queueing are dispatched via
    /// `queue`, which is created (if not already) with `options`.
    pub fn add_handling_rule(
        mut self,
        spec: MessageSpecification,
        handler: Arc<dyn MessageHandler>,
        queue: QueueName,
        options: QueueOptions,
    ) -> Self {
        self.queue_options.entry(queue.clone()).or_insert(options);
        self.handling_rules.push(HandlingRule { spec, handler, queue });
        self
    }

    pub async fn build(self) -> Result<Arc<Bus>, BusError> {
        if !(self.config.base_uri.starts_with("http://") || self.config.base_uri.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUri(self.config.base_uri.clone()).into());
        }

        let endpoints = EndpointTable::new(self.config.endpoints.clone());
        for rule in &self.config.send_rules {
            if !endpoints.by_name.contains_key(&rule.endpoint) {
                return Err(ConfigError::UnknownEndpoint(rule.endpoint.to_string()).into());
            }
        }
        for sub in &self.config.subscriptions {
            if !endpoints.by_name.contains_key(&sub.endpoint) {
                return Err(ConfigError::UnknownEndpoint(sub.endpoint.to_string()).into());
            }
        }

        let cancel = CancellationToken::new();
        let transport = self.transport.unwrap_or_else(|| Arc::new(HttpTransport::new()));
        let queue_store = self.queue_store.unwrap_or_else(|| Arc::new(InMemoryQueueStore::new()));
        let subscription_store = self
            .subscription_store
            .unwrap_or_else(|| Arc::new(InMemorySubscriptionStore::new()));
        let reply_hub = ReplyHub::new(self.reply_ttl);
        let name_registry = Arc::new(NameRegistry::new());
        let serializers = Arc::new(SerializerRegistry::new());
        let queue_engine = Arc::new(QueueEngine::new(queue_store, cancel.clone()));
        let outbound_queue_options = self.outbound_queue_options.clone();

        let bus = Arc::new_cyclic(|weak| Bus {
            config: self.config,
            endpoints,
            topics: Default::default(),
            transport,
            queue_engine,
            subscription_store,
            reply_hub,
            name_registry,
            serializers,
            handling_rules: self.handling_rules,
            cancel,
            self_weak: weak.clone(),
        });

        bus.topics_init();

        bus.queue_engine
            .create_queue(
                QueueName::from(OUTBOUND_QUEUE),
                Arc::new(OutboundQueueListener { bus: Arc::downgrade(&bus) }),
                outbound_queue_options,
            )
            .await?;

        let mut created_queues = std::collections::HashSet::new();
        for rule in &bus.handling_rules {
            if created_queues.insert(rule.queue.clone()) {
                let options = self
                    .queue_options
                    .get(&rule.queue)
                    .cloned()
                    .unwrap_or_default();
                let reply_sender: Arc<dyn ReplySender> = bus.clone();
                let listener = Arc::new(InboundHandlerListener::for_queue(
                    &bus.handling_rules,
                    &rule.queue,
                    reply_sender,
                    bus.serializers.clone(),
                    bus.name_registry.clone(),
                ));
                bus.queue_engine.create_queue(rule.queue.clone(), listener, options).await?;
            }
        }

        for sub in &bus.config.subscriptions {
            let endpoint = bus.endpoints.by_name.get(&sub.endpoint).expect("validated above");
            let worker_config = SubscriptionWorkerConfig {
                publisher_uri: endpoint.address.clone(),
                credentials: Some(endpoint.credentials.clone()),
                topic: sub.topic.clone(),
                subscriber_uri: bus.config.base_uri.clone(),
                ttl: if sub.ttl.is_zero() { None } else { Some(sub.ttl) },
            };
            let transport = bus.transport.clone();
            let cancel = bus.cancel.clone();
            tokio::spawn(worker::run(transport, worker_config, cancel));
        }

        bus.spawn_sweep_tasks();

        Ok(bus)
    }
}

/// The composed bus instance. Construct via [`BusBuilder`].
pub struct Bus {
    config: BusConfig,
    endpoints: EndpointTable,
    topics: dashmap::DashSet<TopicName>,
    transport: Arc<dyn Transport>,
    queue_engine: Arc<QueueEngine>,
    subscription_store: Arc<dyn SubscriptionStore>,
    reply_hub: Arc<ReplyHub>,
    name_registry: Arc<NameRegistry>,
    serializers: Arc<SerializerRegistry>,
    handling_rules: Vec<HandlingRule>,
    cancel: CancellationToken,
    self_weak: std::sync::Weak<Bus>,
}

impl Bus {
    fn topics_init(self: &Arc<Self>) {
        for t in &self.config.topics {
            self.topics.insert(t.name.clone());
        }
    }

    fn spawn_sweep_tasks(self: &Arc<Self>) {
        let reply_hub = self.reply_hub.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => reply_hub.evict_idle(),
                    _ = cancel.cancelled() => return,
                }
            }
        });

        let subs = self.subscription_store.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => subs.sweep_expired().await,
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    /// Register a type under a stable `MessageName` for C5 lookups. Call
    /// once per payload type before first use.
    pub fn register_type(&self, name: impl Into<crate::ids::MessageName>, rust_type_name: &'static str) {
        self.name_registry.register(name.into(), rust_type_name);
    }

    fn check_disposed(&self) -> Result<(), BusError> {
        if self.cancel.is_cancelled() {
            Err(BusError::Disposed)
        } else {
            Ok(())
        }
    }

    fn build_message<T: Serialize>(
        &self,
        message_name: &str,
        payload: &T,
        options: &SendOptions,
        origination: &str,
    ) -> Result<Message, BusError> {
        let bytes = self.serializers.serialize(&options.content_type, payload)?;
        let mut headers = Headers::new();
        headers.insert("MessageId", MessageId::generate().to_string());
        headers.insert("MessageName", message_name.to_string());
        headers.insert("Origination", origination.to_string());
        headers.insert("ContentType", options.content_type.clone());
        headers.insert("Importance", match options.importance {
            Importance::Critical => "Critical",
            Importance::Low => "Low",
        });
        if let Some(ttl) = options.ttl {
            headers.insert("Expires", (Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()).to_rfc3339());
        }
        Ok(Message::new(headers, bytes))
    }

    async fn dispatch_outbound(
        &self,
        destination: EndpointConfig,
        message: Message,
        durable: bool,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        if durable {
            let mut message = message;
            message.headers_mut().insert("Destination", destination.address.clone());
            self.queue_engine
                .enqueue_message(&QueueName::from(OUTBOUND_QUEUE), message, None)
                .await
        } else {
            self.transport
                .send_message(&destination.address, &message, Some(&destination.credentials), cancel)
                .await
                .map_err(BusError::from)
        }
    }

    /// Resolves endpoints via every [`crate::config::SendRuleConfig`] whose
    /// pattern matches `message_name`, sends one copy to each, and returns a
    /// [`SentMessage`] registered *before* any transport begins (spec §4.4
    /// "Concurrency contract").
    pub async fn send<T: Serialize>(
        &self,
        message_name: &str,
        payload: &T,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> Result<SentMessage, BusError> {
        let name = crate::ids::MessageName::from(message_name);
        let mut targets = Vec::new();
        for rule in &self.config.send_rules {
            if rule.name_pattern.matches(&name)? {
                if let Some(ep) = self.endpoints.by_name.get(&rule.endpoint) {
                    targets.push(ep.clone());
                }
            }
        }
        if targets.is_empty() {
            return Err(BusError::NoEndpoints);
        }
        self.send_to(message_name, payload, targets, options, cancel).await
    }

    pub async fn send_to_endpoint<T: Serialize>(
        &self,
        endpoint: &EndpointName,
        message_name: &str,
        payload: &T,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> Result<SentMessage, BusError> {
        let ep = self
            .endpoints
            .by_name
            .get(endpoint)
            .cloned()
            .ok_or_else(|| BusError::EndpointNotFound(endpoint.clone()))?;
        self.send_to(message_name, payload, vec![ep], options, cancel).await
    }

    pub async fn send_to_uri<T: Serialize>(
        &self,
        uri: &str,
        credentials: Option<Credentials>,
        message_name: &str,
        payload: &T,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> Result<SentMessage, BusError> {
        let ep = EndpointConfig {
            name: EndpointName::from(uri),
            address: uri.to_string(),
            credentials: credentials.unwrap_or(Credentials::None),
        };
        self.send_to(message_name, payload, vec![ep], options, cancel).await
    }

    async fn send_to<T: Serialize>(
        &self,
        message_name: &str,
        payload: &T,
        targets: Vec<EndpointConfig>,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> Result<SentMessage, BusError> {
        self.check_disposed()?;
        let message = self.build_message(message_name, payload, &options, &self.config.base_uri)?;
        let id = message.id().expect("build_message always sets MessageId");
        let sent = self.reply_hub.create_sent_message(id);

        let mut handles = Vec::new();
        for target in targets {
            let message = message.clone();
            let durable = options.use_durable_transport;
            let cancel = cancel.clone();
            handles.push(self.dispatch_outbound(target, message, durable, &cancel));
        }
        let results = futures::future::join_all(handles).await;
        for r in results {
            r?;
        }
        Ok(sent)
    }

    /// Fans out `payload` to every current subscriber of `topic` over
    /// non-durable transport (spec §4.6 "Publish"). `message_name` is
    /// carried the same way `send` carries it, so a subscriber's handling
    /// rules can route on it exactly as they would a point-to-point send.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        message_name: &str,
        payload: &T,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        self.check_disposed()?;
        let topic = TopicName::from(topic);
        if !self.topics.contains(&topic) {
            return Err(BusError::TopicNotFound(topic));
        }

        let content_type = "application/json";
        let bytes = self.serializers.serialize(content_type, payload)?;
        let mut headers = Headers::new();
        headers.insert("MessageId", MessageId::generate().to_string());
        headers.insert("MessageName", message_name.to_string());
        headers.insert("Origination", self.config.base_uri.clone());
        headers.insert("ContentType", content_type);
        headers.insert("Topic", topic.to_string());
        headers.insert("Published", Utc::now().to_rfc3339());

        let subscribers = self.subscription_store.subscribers(&topic).await;
        let mut futs = Vec::new();
        for sub in subscribers {
            let message = Message::new(headers.clone(), bytes.clone());
            let cancel = cancel.clone();
            futs.push(async move {
                self.transport.send_message(&sub.uri, &message, None, &cancel).await
            });
        }
        let results = futures::future::join_all(futs).await;
        for r in results {
            if let Err(e) = r {
                warn!(topic = %topic, error = %e, "publish delivery to a subscriber failed");
            }
        }
        Ok(())
    }

    /// Cancels the bus-wide signal; spawned workers observe it at their next
    /// suspension point and exit, and the reply hub stops accepting new work.
    pub fn dispose(&self) {
        info!("disposing bus");
        self.cancel.cancel();
    }
}

#[async_trait]
impl ReplySender for Bus {
    async fn send_reply(&self, related_to: &Headers, content: Vec<u8>, content_type: &str) -> Result<(), BusError> {
        self.check_disposed()?;
        let destination = related_to
            .reply_address()
            .ok_or_else(|| BusError::EndpointNotFound(EndpointName::from("<unknown>")))?
            .to_string();
        let credentials = self.endpoints.credentials_for_address(&destination);

        let mut headers = Headers::new();
        headers.insert("MessageId", MessageId::generate().to_string());
        headers.insert("Origination", self.config.base_uri.clone());
        headers.insert("ContentType", content_type.to_string());
        if let Some(related) = related_to.message_id() {
            headers.insert("RelatedTo", related.to_string());
        }
        headers.insert("Destination", destination.clone());

        let message = Message::new(headers, content);
        let cancel = self.cancel.clone();
        self.transport
            .send_message(&destination, &message, credentials.as_ref(), &cancel)
            .await
            .map_err(BusError::from)
    }
}

/// Listener for [`OUTBOUND_QUEUE`]: the C2 dispatcher for durable sends.
/// Holds only a [`std::sync::Weak`] reference to the bus so the queue
/// engine (owned by the bus) doesn't keep it alive past `dispose`.
struct OutboundQueueListener {
    bus: std::sync::Weak<Bus>,
}

#[async_trait]
impl QueueListener for OutboundQueueListener {
    async fn handle(&self, message: &Message, ctx: &QueuedMessageContext) -> Result<(), String> {
        let Some(bus) = self.bus.upgrade() else {
            return Err("bus has been dropped".to_string());
        };
        let destination = message
            .headers()
            .destination()
            .ok_or_else(|| "queued outbound message has no Destination header".to_string())?
            .to_string();
        let credentials = bus.endpoints.credentials_for_address(&destination);
        let cancel = bus.cancel.clone();

        match bus
            .transport
            .send_message(&destination, message, credentials.as_ref(), &cancel)
            .await
        {
            Ok(()) => {
                ctx.acknowledge();
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl InboundObserver for Bus {
    async fn accept_message(&self, message: Message, sender_identity: Option<String>) -> Result<(), TransportError> {
        if message.headers().is_expired(Utc::now()) {
            return Ok(());
        }

        if let Some(related) = message.headers().related_to() {
            let content_type = message.headers().content_type().to_string();
            self.reply_hub.reply_received(
                related,
                ReplyPayload {
                    content_type,
                    bytes: message.content().to_vec(),
                },
            );
            self.reply_hub.notify_last_reply_received(related);
            return Ok(());
        }

        let name = message
            .headers()
            .message_name()
            .unwrap_or_else(|| crate::ids::MessageName::from(""));
        let importance = message.headers().importance();

        let matching_queues: std::collections::HashSet<&QueueName> = self
            .handling_rules
            .iter()
            .filter(|r| r.spec.matches(&name).unwrap_or(false))
            .map(|r| &r.queue)
            .collect();

        if matching_queues.is_empty() {
            return Ok(());
        }

        if importance.requires_queueing() {
            for queue in matching_queues {
                self.queue_engine
                    .enqueue_message(queue, message.clone(), sender_identity.clone())
                    .await
                    .map_err(|_| TransportError::InvalidRequest(format!("unknown queue '{queue}'")))?;
            }
            Ok(())
        } else {
            let reply_sender: Arc<dyn ReplySender> = self
                .self_weak
                .upgrade()
                .ok_or_else(|| TransportError::InvalidRequest("bus is shutting down".to_string()))?;
            let ctx = crate::handler::MessageContext::new(
                message.headers().clone(),
                message.content().to_vec(),
                sender_identity,
                reply_sender,
                self.serializers.clone(),
                self.name_registry.clone(),
            );
            for rule in self.handling_rules.iter().filter(|r| r.spec.matches(&name).unwrap_or(false)) {
                if let Err(e) = rule.handler.handle(&ctx).await {
                    warn!(message_name = %name, error = %e, "inline handler error");
                }
            }
            if ctx.is_acknowledged() {
                Ok(())
            } else {
                Err(TransportError::NotAcknowledged)
            }
        }
    }

    async fn accept_subscription_request(
        &self,
        kind: SubscriptionKind,
        topic: TopicName,
        subscriber_uri: String,
        ttl: Option<Duration>,
        _sender_identity: Option<String>,
    ) -> Result<(), TransportError> {
        if !self.topics.contains(&topic) {
            return Err(TransportError::InvalidRequest(format!("topic '{topic}' is not declared")));
        }
        match kind {
            SubscriptionKind::Add => self.subscription_store.add(&topic, subscriber_uri, ttl).await,
            SubscriptionKind::Remove => self.subscription_store.remove(&topic, &subscriber_uri).await,
        }
        Ok(())
    }
}
