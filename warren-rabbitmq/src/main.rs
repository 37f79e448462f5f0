use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use warren_core::config::DEFAULT_CONSUMERS_PATH;
use warren_core::settings::DEFAULT_SETTINGS_PATH;
use warren_core::telemetry::{init_tracing, LogFormat};
use warren_core::{
    Client, Consumers, DefaultAdaptor, Delivery, DenSpawner, FrameworkAdaptor, ProcessError,
    Settings, Subscriber, SubscriberRegistry,
};
use warren_rabbitmq::build_handler;

/// Runs warren consumers until SIGTERM or Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "warren-consumer", version)]
struct Cli {
    /// Consumer configuration.
    #[arg(long, default_value = DEFAULT_CONSUMERS_PATH)]
    config: PathBuf,

    /// Handler settings, one block per environment.
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    #[arg(long, env = "WARREN_ENV", default_value = "development")]
    env: String,

    /// Consumer to run. Repeat for several; all configured consumers run
    /// when none is given.
    #[arg(long = "consumer", short = 'c')]
    consumers: Vec<String>,
}

/// Logs every message it receives. Registered as `log`.
struct LogSubscriber;

#[async_trait]
impl Subscriber for LogSubscriber {
    async fn process(&self, delivery: &mut Delivery) -> Result<(), ProcessError> {
        let payload = match serde_json::from_slice::<serde_json::Value>(delivery.payload()) {
            Ok(json) => json.to_string(),
            Err(_) => delivery.payload_str().into_owned(),
        };
        info!(
            routing_key = delivery.routing_key(),
            attempt = delivery.attempt(),
            %payload,
            "Received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_tracing(LogFormat::from_env());
    let cli = Cli::parse();

    let settings = Settings::load(&cli.settings, &cli.env)?;
    let consumers = Arc::new(Consumers::load(&cli.config)?);
    let handler = build_handler(&settings);
    let adaptor: Arc<dyn FrameworkAdaptor> = Arc::new(DefaultAdaptor::new(cli.env.as_str()));
    let registry = Arc::new(SubscriberRegistry::new().with("log", || Box::new(LogSubscriber)));

    info!(env = %cli.env, handler = ?settings.handler_type, "Starting consumers");
    let spawner = Arc::new(DenSpawner::new(
        consumers,
        Arc::clone(&handler),
        Arc::clone(&adaptor),
        registry,
    ));
    let client = Arc::new(Client::new(spawner, handler, adaptor).with_consumers(cli.consumers));
    client.run().await?;
    Ok(())
}
