//! C1 — Transport: moves serialized messages and subscription requests
//! to/from a peer URI, and raises inbound events for the bus core.

pub mod client;
pub mod server;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Credentials;
use crate::error::TransportError;
use crate::ids::TopicName;
use crate::message::Message;

pub use client::HttpTransport;

/// Add or remove a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Add,
    Remove,
}

/// Outbound half of C1: send a message or subscription request to a peer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(
        &self,
        destination: &str,
        message: &Message,
        credentials: Option<&Credentials>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    async fn send_subscription_request(
        &self,
        kind: SubscriptionKind,
        publisher: &str,
        credentials: Option<&Credentials>,
        topic: &TopicName,
        subscriber_uri: &str,
        ttl: Option<std::time::Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;
}

/// Inbound half of C1: observers the bus core registers to be notified of
/// messages and subscription requests arriving from the HTTP front-end.
#[async_trait]
pub trait InboundObserver: Send + Sync {
    async fn accept_message(&self, message: Message, sender_identity: Option<String>) -> Result<(), TransportError>;

    async fn accept_subscription_request(
        &self,
        kind: SubscriptionKind,
        topic: TopicName,
        subscriber_uri: String,
        ttl: Option<std::time::Duration>,
        sender_identity: Option<String>,
    ) -> Result<(), TransportError>;
}
