//! # event-bus
//!
//! Broker abstraction, message envelope, connection pooling, retry
//! backoff, and metrics surface for the platform's reliable event
//! messaging library.
//!
//! ## Why This Lives in Tier 1
//!
//! The event bus is a **shared runtime capability** that every module
//! depends on. Placing it in `platform/` allows:
//! - Modules to depend on platform crates without circular dependencies
//! - Config-driven swap between AMQP (production) and in-memory (dev/test)
//!
//! ## Implementations
//!
//! - [`AmqpBus`]: production implementation over `lapin`
//! - [`InMemoryBus`]: test/dev implementation using a broadcast channel
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{BrokerConfig, ConnectionPool, AmqpBus, EventBus, Envelope};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::from_env()?;
//! let pool = Arc::new(ConnectionPool::new(config.connection_uri(), config.prefetch));
//! let bus: Arc<dyn EventBus> = Arc::new(AmqpBus::new(pool));
//!
//! let envelope = Envelope::new("order.created")?;
//! bus.publish("acme.orders", "order.created", envelope.to_bytes()?, Default::default()).await?;
//! # Ok(())
//! # }
//! ```

mod amqp_bus;
mod bus;
pub mod config;
pub mod consumer_retry;
pub mod envelope;
pub mod error;
mod inmemory_bus;
pub mod metrics;
pub mod pool;

pub use amqp_bus::AmqpBus;
pub use bus::{
    Acker, BusResult, Delivery, EventBus, HeaderValue, Headers, PublishOptions, Topology,
};
pub use config::BrokerConfig;
pub use consumer_retry::{retry_with_backoff, BackoffPolicy, RetryConfig, MAX_DELAY_MS};
pub use envelope::{
    validate_event_name, Envelope, EnvelopeStatus, EnvelopeSystem, MAX_ENVELOPE_BYTES,
    WARN_ENVELOPE_BYTES,
};
pub use error::{classify_by_message, classify_lapin_error, ErrorClass, MessagingError};
pub use inmemory_bus::InMemoryBus;
pub use metrics::{
    MetricsSink, NoopMetricsSink, RecordedMetric, RecordingMetricsSink, SharedMetrics, StatsdSink,
    Tags,
};
pub use pool::ConnectionPool;
