//! Example host process wiring `event-bus` + `event-consumer` together.
//!
//! Construction order follows `identity-auth/src/main.rs`: tracing init,
//! config, DB pool (migrations assumed already applied per SPEC_FULL.md
//! §6.3), broker connect, topology ensure, handlers, then run. Not part
//! of the library's public surface — a demonstration of how a service
//! would use it.

mod dispatcher;
mod order_handler;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use event_bus::{AmqpBus, BrokerConfig, ConnectionPool, EventBus, NoopMetricsSink, SharedMetrics, StatsdSink};
use event_consumer::{Consumer, ConsumerConfig, DbConfig, HandlerRegistry, Repository, RunOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatcher::OutboxDispatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,order_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let broker_cfg = BrokerConfig::from_env()?;
    let db_cfg = DbConfig::from_env()?;

    let metrics: SharedMetrics = if broker_cfg.statsd_enabled {
        let host = broker_cfg
            .statsd_host
            .clone()
            .ok_or("STATSD_ENABLED=true but STATSD_HOST is unset")?;
        Arc::new(StatsdSink::new(
            &host,
            broker_cfg.statsd_port,
            &broker_cfg.statsd_namespace,
            &broker_cfg.service_name,
            &broker_cfg.env,
        )?)
    } else {
        Arc::new(NoopMetricsSink)
    };

    // DB (fail-fast). Migrations are out of this library's scope
    // (SPEC_FULL.md §6.3) — the tables are assumed to already exist.
    let repository = Arc::new(
        Repository::connect(
            &db_cfg.connection_uri(),
            &db_cfg.schema,
            db_cfg.max_connections,
            db_cfg.statement_timeout_ms,
        )
        .await?,
    );
    tracing::info!("database connection established");

    // Broker (fail-fast).
    let pool = Arc::new(ConnectionPool::with_metrics(
        broker_cfg.connection_uri(),
        broker_cfg.prefetch,
        metrics.clone(),
    ));
    let bus: Arc<dyn EventBus> = Arc::new(AmqpBus::new(pool));

    let exchange = format!("{}.{}", broker_cfg.project, broker_cfg.service_name);

    let mut registry = HandlerRegistry::new();
    registry.register("order.created", order_handler::OrderCreatedHandler);

    let dispatcher_shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let dispatcher = OutboxDispatcher::new(bus.clone(), repository.clone(), &exchange, broker_cfg.app_id());
    let dispatcher_handle = {
        let shutdown = dispatcher_shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };

    let cleanup_shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let cleanup_handle = {
        let repository = repository.clone();
        let shutdown = cleanup_shutdown.clone();
        tokio::spawn(async move {
            repository
                .run_cleanup_loop(
                    event_consumer::DEFAULT_RETENTION,
                    std::time::Duration::from_secs(6 * 60 * 60),
                    shutdown,
                )
                .await
        })
    };

    loop {
        let consumer_config = ConsumerConfig::from_env()?;
        let consumer = Consumer::new(
            bus.clone(),
            repository.clone(),
            consumer_config,
            metrics.clone(),
            registry.clone(),
        );

        consumer.ensure_topology().await?;

        let shutdown = consumer.shutdown_handle();
        let ctrl_c_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                ctrl_c_shutdown.store(true, Ordering::Relaxed);
            }
        });

        match consumer.run().await? {
            RunOutcome::ShutdownRequested => break,
            RunOutcome::Recycle => {
                tracing::info!("recycling consumer connection");
                continue;
            }
        }
    }

    dispatcher_shutdown.store(true, Ordering::Relaxed);
    dispatcher_handle.abort();
    cleanup_shutdown.store(true, Ordering::Relaxed);
    cleanup_handle.abort();

    Ok(())
}
