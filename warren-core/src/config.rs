//! Consumer topology configuration.
//!
//! Loaded once from YAML (by default `config/warren_consumers.yml`), keyed by
//! consumer name:
//!
//! ```yaml
//! name:
//!   desc: Example consumer
//!   subscribed_class: Example
//!   queue:
//!     name: queue_name
//!     options:
//!       durable: true
//!       arguments:
//!         x-dead-letter-exchange: name.dead-letters
//!     bindings:
//!       - exchange:
//!           name: exchange_name
//!           options: { type: topic, durable: true }
//!         options:
//!           routing_key: "%{routing_key_prefix}.c"
//!   dead_letters:
//!     name: name.dead-letters
//!     bindings:
//!       - exchange:
//!           name: name.dead-letters
//!           options: { type: fanout, durable: true }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::routing::RoutingKeyTemplate;
use crate::types::{FieldValue, Fields};
use crate::WarrenError;

pub const DEFAULT_CONSUMERS_PATH: &str = "config/warren_consumers.yml";

fn default_true() -> bool {
    true
}

fn default_worker_count() -> u16 {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    #[serde(alias = "header")]
    Headers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOptions {
    #[serde(rename = "type", default)]
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::default(),
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default)]
    pub options: ExchangeOptions,
}

impl ExchangeConfig {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            options: ExchangeOptions {
                kind,
                ..ExchangeOptions::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub arguments: Fields,
}

impl BindingOptions {
    pub fn routing_key(key: impl Into<String>) -> Self {
        Self {
            routing_key: Some(key.into()),
            arguments: Fields::new(),
        }
    }

    /// Expands `%{routing_key_prefix}` in the routing key and in any string
    /// arguments.
    pub fn expand(&self, template: &RoutingKeyTemplate) -> BindingOptions {
        BindingOptions {
            routing_key: self.routing_key.as_deref().map(|key| template.expand(key)),
            arguments: self
                .arguments
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        FieldValue::Str(s) => FieldValue::Str(template.expand(s)),
                        other => other.clone(),
                    };
                    (key.clone(), value)
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub options: BindingOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: Fields,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Fields::new(),
        }
    }
}

impl QueueOptions {
    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: QueueOptions,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn bind(mut self, exchange: ExchangeConfig, options: BindingOptions) -> Self {
        self.bindings.push(BindingConfig { exchange, options });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayBinding {
    pub queue: QueueConfig,
    #[serde(default)]
    pub options: BindingOptions,
}

/// Delay-retry topology. Without an exchange the delay is disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default)]
    pub exchange: Option<ExchangeConfig>,
    #[serde(default)]
    pub bindings: Vec<DelayBinding>,
}

impl DelayConfig {
    /// A fanout exchange feeding one queue whose messages expire after
    /// `ttl_ms` and are dead-lettered, through the default exchange, back onto
    /// `original_queue`.
    pub fn standard(
        exchange: impl Into<String>,
        delay_queue: impl Into<String>,
        original_queue: &str,
        ttl_ms: i64,
    ) -> Self {
        let options = QueueOptions::default()
            .with_argument("x-dead-letter-exchange", "")
            .with_argument("x-dead-letter-routing-key", original_queue)
            .with_argument("x-message-ttl", ttl_ms);
        Self {
            exchange: Some(ExchangeConfig::new(exchange, ExchangeKind::Fanout)),
            bindings: vec![DelayBinding {
                queue: QueueConfig::new(delay_queue).with_options(options),
                options: BindingOptions::default(),
            }],
        }
    }

    pub fn is_configured(&self) -> bool {
        self.exchange.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub desc: String,
    pub queue: QueueConfig,
    #[serde(default)]
    pub dead_letters: Option<QueueConfig>,
    #[serde(default)]
    pub delay: Option<DelayConfig>,
    /// Key into the [`SubscriberRegistry`](crate::SubscriberRegistry).
    pub subscribed_class: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: u16,
}

/// Read-only store of every configured consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Consumers {
    consumers: BTreeMap<String, ConsumerConfig>,
}

impl Consumers {
    /// Loads `path`. A missing file yields an empty store.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WarrenError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(yaml) => Self::from_yaml_str(&yaml),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(WarrenError::Settings(format!(
                "could not read {}: {err}",
                path.display()
            ))),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, WarrenError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn insert(&mut self, name: impl Into<String>, config: ConsumerConfig) {
        self.consumers.insert(name.into(), config);
    }

    pub fn consumer(&self, name: &str) -> Result<&ConsumerConfig, WarrenError> {
        self.consumers
            .get(name)
            .ok_or_else(|| WarrenError::UnknownConsumer(name.to_string()))
    }

    pub fn consumer_exists(&self, name: &str) -> bool {
        self.consumers.contains_key(name)
    }

    pub fn all_consumers(&self) -> Vec<String> {
        self.consumers.keys().cloned().collect()
    }
}
