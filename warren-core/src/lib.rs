pub mod adaptor;
pub mod channel;
pub mod client;
pub mod config;
pub mod delay_exchange;
pub mod den;
pub mod error;
pub mod fox;
pub mod handler;
pub mod log_handler;
pub mod pool;
pub mod routing;
pub mod settings;
pub mod state;
pub mod subscriber;
pub mod subscription;
pub mod telemetry;
pub mod test_handler;
pub mod types;

pub use adaptor::{DefaultAdaptor, FrameworkAdaptor, ProbeAdaptor, Work};
pub use channel::{BrokerChannel, ConsumerHandle, DeliveryCallback};
pub use client::Client;
pub use config::{ConsumerConfig, Consumers, DelayConfig, ExchangeConfig, ExchangeKind, QueueConfig};
pub use delay_exchange::DelayExchange;
pub use den::{Den, DenSpawner, Spawner};
pub use error::{ProcessError, WarrenError};
pub use fox::{Consumer, Fox};
pub use handler::{with_channel, Handler};
pub use log_handler::LogHandler;
pub use pool::{ChannelFactory, ChannelLease, ChannelPool};
pub use routing::RoutingKeyTemplate;
pub use settings::{HandlerType, Settings};
pub use state::{State, StateMachine};
pub use subscriber::{Delivery, Subscriber, SubscriberRegistry};
pub use subscription::Subscription;
pub use test_handler::TestHandler;
pub use types::{Envelope, FieldValue, Headers, Message, SimpleMessage};
