//! The wire-level data model: an immutable `(Headers, Content)` pair plus
//! the recognized header fields listed in spec §3.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{HeaderName, MessageId, MessageName};

/// Severity tag influencing whether the receiver queues or dispatches the
/// message in-line (spec §4.6, "Importance semantics on receive").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Importance {
    /// Dispatch in-line; if no handler acknowledges, the inbound request
    /// fails with `NotAcknowledged`.
    Low,
    /// Enqueue into every queue reached by a matching handling rule.
    Critical,
}

impl Importance {
    /// Whether this importance level requires queueing on receipt.
    pub fn requires_queueing(self) -> bool {
        matches!(self, Importance::Critical)
    }
}

impl Default for Importance {
    fn default() -> Self {
        Importance::Low
    }
}

/// Case-insensitive header map. Preserves the casing of the first insertion
/// of a given name; lookups ignore case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Headers(HashMap<HeaderName, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&HeaderName::new(name)).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<HeaderName>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &String)> {
        self.0.iter()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.get("MessageId").and_then(|s| s.parse().ok())
    }

    pub fn message_name(&self) -> Option<MessageName> {
        self.get("MessageName").map(MessageName::from)
    }

    pub fn origination(&self) -> Option<&str> {
        self.get("Origination")
    }

    pub fn destination(&self) -> Option<&str> {
        self.get("Destination")
    }

    /// `ReplyTo` if present, else falls back to `Origination`.
    pub fn reply_address(&self) -> Option<&str> {
        self.get("ReplyTo").or_else(|| self.origination())
    }

    pub fn related_to(&self) -> Option<MessageId> {
        self.get("RelatedTo").and_then(|s| s.parse().ok())
    }

    pub fn topic(&self) -> Option<&str> {
        self.get("Topic")
    }

    pub fn content_type(&self) -> &str {
        self.get("ContentType").unwrap_or("application/json")
    }

    pub fn importance(&self) -> Importance {
        match self.get("Importance") {
            Some("Critical") => Importance::Critical,
            _ => Importance::Low,
        }
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.get("Expires")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires().map(|exp| exp < now).unwrap_or(false)
    }
}

impl From<&HashMap<String, String>> for Headers {
    fn from(map: &HashMap<String, String>) -> Self {
        let mut headers = Headers::new();
        for (k, v) in map {
            headers.insert(k.as_str(), v.clone());
        }
        headers
    }
}

/// An immutable `(Headers, Content)` pair. `Content` is an opaque byte
/// sequence already serialized by [`crate::serialization`].
#[derive(Debug, Clone)]
pub struct Message {
    headers: Headers,
    content: Vec<u8>,
}

impl Message {
    pub fn new(headers: Headers, content: Vec<u8>) -> Self {
        Self { headers, content }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_parts(self) -> (Headers, Vec<u8>) {
        (self.headers, self.content)
    }

    pub fn id(&self) -> Option<MessageId> {
        self.headers.message_id()
    }
}
