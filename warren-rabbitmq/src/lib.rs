mod broadcast;
mod channel;
mod options;

use std::sync::Arc;

use warren_core::settings::{HandlerType, Settings};
use warren_core::{Handler, LogHandler, TestHandler};

pub use broadcast::Broadcast;
pub use channel::AmqpChannel;
pub use options::RabbitMqOptions;

/// Builds the process-wide handler selected by `settings`.
pub fn build_handler(settings: &Settings) -> Arc<dyn Handler> {
    let config = &settings.config;
    match settings.handler_type {
        HandlerType::Test => {
            let mut handler = TestHandler::new();
            if let Some(exchange) = &config.exchange {
                handler = handler.with_exchange(exchange.as_str());
            }
            if let Some(prefix) = &config.routing_key_prefix {
                handler = handler.with_routing_key_prefix(prefix);
            }
            Arc::new(handler)
        }
        HandlerType::Log => Arc::new(LogHandler::new(
            config.exchange.as_deref(),
            config.routing_key_prefix.as_deref(),
        )),
        HandlerType::Broadcast => Arc::new(Broadcast::new(RabbitMqOptions::from_settings(config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_core::types::SimpleMessage;
    use warren_core::WarrenError;

    const SETTINGS: &str = r#"
test:
  type: test
  config:
    exchange: ex
    routing_key_prefix: test
development:
  type: log
"#;

    #[tokio::test]
    async fn in_process_handlers_need_no_broker() {
        for env in ["test", "development"] {
            let settings = Settings::from_yaml_str(SETTINGS, env).unwrap();
            let handler = build_handler(&settings);
            handler.connect().await.unwrap();
            handler.publish(&SimpleMessage::new("k", "Hello")).await.unwrap();
            handler.disconnect().await.unwrap();
        }
    }

    #[tokio::test]
    async fn broadcast_is_selected_for_rabbitmq() {
        let settings = Settings::from_yaml_str("production:\n  type: broadcast\n", "production").unwrap();
        let handler = build_handler(&settings);

        let err = handler.publish(&SimpleMessage::new("k", "Hello")).await.unwrap_err();
        assert!(matches!(err, WarrenError::Configuration(_)));
    }
}
