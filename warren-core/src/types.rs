// warren-core/src/types.rs
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::WarrenError;

/// Scalar value carried in message headers and queue/binding arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            FieldValue::Str(value) => value.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Message headers. Retry attempts travel in the `attempts` header.
pub type Headers = Fields;

/// Anything that can be published through a [`Handler`](crate::Handler).
///
/// The routing key excludes the environment prefix, which is applied by the
/// handler at publish time.
pub trait Message: Send + Sync {
    fn routing_key(&self) -> &str;

    fn payload(&self) -> &[u8];

    fn headers(&self) -> Headers {
        Headers::new()
    }
}

/// Routing key, payload and headers bundled together.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl SimpleMessage {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Serializes `payload` as JSON.
    pub fn json<T: Serialize>(routing_key: impl Into<String>, payload: &T) -> Result<Self, WarrenError> {
        Ok(Self::new(routing_key, serde_json::to_vec(payload)?))
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl Message for SimpleMessage {
    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn headers(&self) -> Headers {
        self.headers.clone()
    }
}

/// A message as delivered by the broker: delivery metadata, properties and
/// payload. Lives until the delivery is acknowledged or rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(delivery_tag: u64, routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            exchange: String::new(),
            routing_key: routing_key.into(),
            redelivered: false,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}
