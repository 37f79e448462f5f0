//! Handler settings, one block per environment (by default `config/warren.yml`):
//!
//! ```yaml
//! development:
//!   type: log
//!   config:
//!     server:
//!       host: localhost
//!       port: 5672
//!       username: guest
//!       password: guest
//!       vhost: /
//!       heartbeat: 30
//!     exchange: my_exchange
//!     routing_key_prefix: development
//! test:
//!   type: test
//! ```
//!
//! `WARREN_TYPE` overrides the handler type and `WARREN_RABBITMQ_URL` the
//! broker URI, so deployments can switch without editing the file.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::WarrenError;

pub const DEFAULT_SETTINGS_PATH: &str = "config/warren.yml";
pub const WARREN_TYPE: &str = "WARREN_TYPE";
pub const WARREN_RABBITMQ_URL: &str = "WARREN_RABBITMQ_URL";
pub const DEFAULT_POOL_SIZE: usize = 14;

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerType {
    /// Records messages in memory for assertions.
    Test,
    /// Writes messages to the log instead of a broker.
    Log,
    /// Publishes to and consumes from RabbitMQ.
    Broadcast,
}

impl FromStr for HandlerType {
    type Err = WarrenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" => Ok(HandlerType::Test),
            "log" => Ok(HandlerType::Log),
            "broadcast" => Ok(HandlerType::Broadcast),
            other => Err(WarrenError::Settings(format!("unknown handler type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Full AMQP URI. Takes precedence over the individual fields.
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    #[serde(default = "ServerConfig::default_credential")]
    pub username: String,
    #[serde(default = "ServerConfig::default_credential")]
    pub password: String,
    #[serde(default = "ServerConfig::default_vhost")]
    pub vhost: String,
    #[serde(default)]
    pub heartbeat: Option<u16>,
}

impl ServerConfig {
    fn default_host() -> String {
        "localhost".into()
    }

    fn default_port() -> u16 {
        5672
    }

    fn default_credential() -> String {
        "guest".into()
    }

    fn default_vhost() -> String {
        "/".into()
    }

    pub fn uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }
        let vhost = self.vhost.replace('/', "%2f");
        let mut uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        );
        if let Some(heartbeat) = self.heartbeat {
            uri.push_str(&format!("?heartbeat={heartbeat}"));
        }
        uri
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            uri: None,
            host: Self::default_host(),
            port: Self::default_port(),
            username: Self::default_credential(),
            password: Self::default_credential(),
            vhost: Self::default_vhost(),
            heartbeat: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HandlerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub routing_key_prefix: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            exchange: None,
            routing_key_prefix: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    #[serde(rename = "type")]
    pub handler_type: HandlerType,
    #[serde(default)]
    pub config: HandlerConfig,
}

impl Settings {
    /// Loads the block for `environment` from `path` and applies environment
    /// variable overrides.
    pub fn load(path: impl AsRef<Path>, environment: &str) -> Result<Self, WarrenError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|err| {
            WarrenError::Settings(format!("could not read {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&yaml, environment)?.apply_env_overrides()
    }

    pub fn from_yaml_str(yaml: &str, environment: &str) -> Result<Self, WarrenError> {
        let mut environments: BTreeMap<String, Settings> = serde_yaml::from_str(yaml)?;
        environments.remove(environment).ok_or_else(|| {
            WarrenError::Settings(format!("no settings for environment '{environment}'"))
        })
    }

    pub fn apply_env_overrides(mut self) -> Result<Self, WarrenError> {
        if let Ok(handler_type) = env::var(WARREN_TYPE) {
            self.handler_type = handler_type.parse()?;
        }
        if let Ok(uri) = env::var(WARREN_RABBITMQ_URL) {
            self.config.server.uri = Some(uri);
        }
        Ok(self)
    }
}
