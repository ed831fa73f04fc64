//! MQTT 5 consumer-group backend
//!
//! Consumer groups are realised with MQTT 5 shared subscriptions. The module
//! separates pure configuration from the I/O side:
//!
//! - [`connection`] - option building, share filters, backoff and SubAck interpretation
//! - [`client`] - the event loop task and the [`Subscription`](crate::broker::Subscription) it feeds
//!
//! # Usage
//!
//! ```rust,no_run
//! use silk_engine::broker::{ConsumerClient, MqttBroker, Subscription};
//! use silk_engine::config::BrokerSection;
//!
//! # tokio_test::block_on(async {
//! let config = BrokerSection {
//!     url: "mqtt://localhost:1883".to_string(),
//!     ..BrokerSection::default()
//! };
//!
//! let broker = MqttBroker::new(config);
//! let mut subscription = broker.subscribe("orders", "silk-engine").await?;
//! while let Some(record) = subscription.next_record().await? {
//!     println!("{}", record.position());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;

pub use client::{publish_to_record, MqttBroker, MqttSubscription, KEY_PROPERTY};
pub use connection::{
    configure_mqtt_options, shared_subscription_filter, subscribe_outcome, ReconnectConfig,
};
