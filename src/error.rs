//! The closed error taxonomy surfaced across the public API. Every fallible
//! operation returns [`BusError`]; transport-layer failures are normalized
//! into it so upper layers never need to inspect HTTP status codes.

use thiserror::Error;

use crate::ids::{EndpointName, MessageId, QueueName, TopicName};

/// Errors raised while moving a message or subscription request over the
/// wire. Kept separate from [`BusError`] so transport implementations don't
/// need to depend on the rest of the crate, but every variant has a
/// corresponding `BusError` arm.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("destination name could not be resolved")]
    NameResolution,
    #[error("connection to the destination was refused")]
    ConnectionRefused,
    #[error("remote rejected the request as unauthorized")]
    Unauthorized,
    #[error("remote did not acknowledge the message")]
    NotAcknowledged,
    #[error("remote rejected the request as invalid: {0}")]
    InvalidRequest(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation was cancelled")]
    Cancelled,
}

/// The full closed set of error kinds the core surfaces.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    #[error(transparent)]
    Transport(TransportError),

    #[error("no endpoint named '{0}' is configured")]
    EndpointNotFound(EndpointName),

    #[error("topic '{0}' is not declared on this bus")]
    TopicNotFound(TopicName),

    #[error("queue '{0}' already exists")]
    QueueExists(QueueName),

    #[error("queue '{0}' does not exist")]
    QueueNotFound(QueueName),

    #[error("no message type is registered under the name '{0}'")]
    UnknownMessage(String),

    #[error("no send rule or explicit endpoint matched this message")]
    NoEndpoints,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("the bus has been disposed")]
    Disposed,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("message {0} is unknown to the reply hub")]
    UnknownSentMessage(MessageId),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised assembling a [`crate::bus::Bus`] from configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("endpoint '{0}' referenced but not defined")]
    UnknownEndpoint(String),

    #[error("invalid message name pattern '{0}': {1}")]
    InvalidPattern(String, regex::Error),

    #[error("base URI is invalid: {0}")]
    InvalidBaseUri(String),
}

impl From<TransportError> for BusError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => BusError::Cancelled,
            other => BusError::Transport(other),
        }
    }
}

pub type BusResult<T> = Result<T, BusError>;
