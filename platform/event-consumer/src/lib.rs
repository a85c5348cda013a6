//! # event-consumer
//!
//! Consumer-side dispatch built on `event-bus`: the handler registry, the
//! outbox/inbox repository, the hybrid publisher, and the consumer state
//! machine that ties them together against a live queue.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_consumer::{ConsumerConfig, Consumer, DbConfig, HandlerRegistry, Repository};
//! use event_bus::{AmqpBus, BrokerConfig, ConnectionPool, EventBus, NoopMetricsSink};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = BrokerConfig::from_env()?;
//! let db = DbConfig::from_env()?;
//! let consumer_config = ConsumerConfig::from_env()?;
//!
//! let pool = Arc::new(ConnectionPool::new(broker.connection_uri(), broker.prefetch));
//! let bus: Arc<dyn EventBus> = Arc::new(AmqpBus::new(pool));
//! let repository = Arc::new(
//!     Repository::connect(&db.connection_uri(), &db.schema, db.max_connections, db.statement_timeout_ms)
//!         .await?,
//! );
//!
//! let registry = HandlerRegistry::new();
//! let metrics = Arc::new(NoopMetricsSink);
//! let consumer = Consumer::new(bus.clone(), repository.clone(), consumer_config, metrics, registry);
//! consumer.ensure_topology().await?;
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod publisher;
pub mod repository;

pub use config::{BackoffSetting, ConsumerConfig, DbConfig};
pub use consumer::{Consumer, RetryBucket, RunOutcome};
pub use error::{ConsumerError, RepositoryError};
pub use handler::{invoke, FnHandler, Handler, HandlerRegistry, HandlerResult};
pub use publisher::{falls_through_to_outbox, Publisher};
pub use repository::{
    ClaimOutcome, InboxRow, InboxStatus, OutboxRow, OutboxStatus, Repository, DEFAULT_RETENTION,
};
