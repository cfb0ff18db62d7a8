pub mod mqtt;
pub mod notifier;
pub mod postgres;

pub use mqtt::{MqttAdapter, TransportHealth};
pub use notifier::MqttAlertNotifier;
pub use postgres::PostgresRepository;
