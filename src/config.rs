//! Configuration surface (spec §6). File/env parsing is an external
//! collaborator — `peerbus` only defines the shapes a loader (e.g. the
//! `config` crate) deserializes into, plus [`crate::bus::BusBuilder`] which
//! assembles them into an immutable runtime.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ids::{EndpointName, MessageName, TopicName};

/// Endpoint credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "credentialType")]
pub enum Credentials {
    None,
    Basic { username: String, password: String },
    DefaultHostIdentity,
}

/// A named, addressable remote bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: EndpointName,
    pub address: String,
    #[serde(default = "default_credentials")]
    pub credentials: Credentials,
}

fn default_credentials() -> Credentials {
    Credentials::None
}

/// A topic this bus declares and accepts publishes/subscriptions for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: TopicName,
}

/// Matches an outbound message's `MessageName` against either an exact
/// string or a regular expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageSpecification {
    Exact(String),
    Pattern { pattern: String },
}

impl MessageSpecification {
    pub fn matches(&self, name: &MessageName) -> Result<bool, ConfigError> {
        match self {
            MessageSpecification::Exact(s) => Ok(s == name.as_str()),
            MessageSpecification::Pattern { pattern } => {
                let re = Regex::new(pattern)
                    .map_err(|e| ConfigError::InvalidPattern(pattern.clone(), e))?;
                Ok(re.is_match(name.as_str()))
            }
        }
    }
}

/// Routes outbound messages matching `name_pattern` to `endpoint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRuleConfig {
    pub name_pattern: MessageSpecification,
    pub endpoint: EndpointName,
}

/// An outbound subscription this bus maintains against a remote publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub endpoint: EndpointName,
    pub topic: TopicName,
    #[serde(with = "humantime_secs", default)]
    pub ttl: Duration,
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Top-level bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub base_uri: String,
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
    #[serde(default)]
    pub send_rules: Vec<SendRuleConfig>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

fn default_reply_timeout_secs() -> u64 {
    30
}

impl BusConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_specification_pattern_matches() {
        let spec = MessageSpecification::Pattern {
            pattern: "^Order.*".to_string(),
        };
        assert!(spec.matches(&MessageName::from("OrderCreated")).unwrap());
        assert!(!spec.matches(&MessageName::from("UserCreated")).unwrap());
    }

    #[test]
    fn message_specification_exact_matches() {
        let spec = MessageSpecification::Exact("Ping".to_string());
        assert!(spec.matches(&MessageName::from("Ping")).unwrap());
        assert!(!spec.matches(&MessageName::from("Pong")).unwrap());
    }
}
