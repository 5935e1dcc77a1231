//! C5 — serialization half: `Serializer`/`Deserializer` keyed by content
//! type, matched case-insensitively and ignoring any `;charset=` parameter.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::BusError;

/// A registered codec for one media type. Works over `serde_json::Value` as
/// a common intermediate representation so the registry can hold
/// heterogeneous codecs behind a single object-safe trait.
pub trait Serializer: Send + Sync {
    fn serialize_value(&self, value: serde_json::Value) -> Result<Vec<u8>, BusError>;
    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value, BusError>;
}

/// JSON codec, the default content type (`application/json`).
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize_value(&self, value: serde_json::Value) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(&value).map_err(|e| BusError::Serialization(e.to_string()))
    }

    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Serialization(e.to_string()))
    }
}

/// XML codec (`application/xml`), backed by `quick-xml`'s serde support.
pub struct XmlSerializer;

impl Serializer for XmlSerializer {
    fn serialize_value(&self, value: serde_json::Value) -> Result<Vec<u8>, BusError> {
        quick_xml::se::to_string(&value)
            .map(String::into_bytes)
            .map_err(|e| BusError::Serialization(e.to_string()))
    }

    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value, BusError> {
        let text = std::str::from_utf8(bytes).map_err(|e| BusError::Serialization(e.to_string()))?;
        quick_xml::de::from_str(text).map_err(|e| BusError::Serialization(e.to_string()))
    }
}

/// Passes bytes through unchanged (`application/octet-stream`).
pub struct RawSerializer;

impl Serializer for RawSerializer {
    fn serialize_value(&self, _value: serde_json::Value) -> Result<Vec<u8>, BusError> {
        Err(BusError::Serialization(
            "application/octet-stream does not support structured serialization".into(),
        ))
    }

    fn deserialize_value(&self, _bytes: &[u8]) -> Result<serde_json::Value, BusError> {
        Err(BusError::Serialization(
            "application/octet-stream does not support structured deserialization".into(),
        ))
    }
}

fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// Registry of codecs keyed by (normalized) content type.
pub struct SerializerRegistry {
    codecs: HashMap<String, Box<dyn Serializer>>,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        let mut codecs: HashMap<String, Box<dyn Serializer>> = HashMap::new();
        codecs.insert("application/json".into(), Box::new(JsonSerializer));
        codecs.insert("application/xml".into(), Box::new(XmlSerializer));
        codecs.insert("application/octet-stream".into(), Box::new(RawSerializer));
        Self { codecs }
    }
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, content_type: impl Into<String>, codec: Box<dyn Serializer>) {
        self.codecs.insert(normalize(&content_type.into()), codec);
    }

    pub fn get(&self, content_type: &str) -> Option<&dyn Serializer> {
        self.codecs.get(&normalize(content_type)).map(|b| b.as_ref())
    }

    pub fn serialize<T: Serialize>(&self, content_type: &str, value: &T) -> Result<Vec<u8>, BusError> {
        let codec = self
            .get(content_type)
            .ok_or_else(|| BusError::Serialization(format!("no serializer for '{content_type}'")))?;
        let json = serde_json::to_value(value).map_err(|e| BusError::Serialization(e.to_string()))?;
        codec.serialize_value(json)
    }

    pub fn deserialize<T: DeserializeOwned>(&self, content_type: &str, bytes: &[u8]) -> Result<T, BusError> {
        let codec = self
            .get(content_type)
            .ok_or_else(|| BusError::Serialization(format!("no serializer for '{content_type}'")))?;
        let json = codec.deserialize_value(bytes)?;
        serde_json::from_value(json).map_err(|e| BusError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        a: i32,
        b: String,
    }

    #[test]
    fn json_round_trip() {
        let reg = SerializerRegistry::new();
        let s = Sample { a: 1, b: "x".into() };
        let bytes = reg.serialize("application/json", &s).unwrap();
        let back: Sample = reg.deserialize("application/json", &bytes).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn content_type_matching_ignores_case_and_params() {
        let reg = SerializerRegistry::new();
        assert!(reg.get("Application/JSON; charset=utf-8").is_some());
    }

    #[test]
    fn unknown_content_type_errors() {
        let reg = SerializerRegistry::new();
        assert!(reg.get("application/does-not-exist").is_none());
    }
}
