//! Process-wide connection/channel pool (§4.3, §9 "process-global static
//! pool" redesign flag).
//!
//! At most one broker connection and one channel are held per process,
//! shared by every publisher/consumer instance that process constructs.
//! Unlike a module-level `static`, the pool is an explicit value the host
//! owns and passes around — there is no hidden global mutable state.

use std::sync::Arc;
use std::time::Duration;

use lapin::options::{BasicQosOptions, ConfirmSelectOptions};
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::MessagingError;
use crate::metrics::{MetricsSink, NoopMetricsSink, SharedMetrics};

const HEARTBEAT_SECS: u16 = 180;

/// Lazily-constructed, mutex-guarded broker connection and shared channel.
///
/// The "check, then create" sequence for both the connection and the
/// channel is covered by a single lock, so concurrent callers racing to
/// establish the first connection cannot both win.
pub struct ConnectionPool {
    uri: String,
    prefetch: u16,
    inner: Mutex<Option<PooledState>>,
    metrics: SharedMetrics,
}

struct PooledState {
    connection: Connection,
    channel: Channel,
}

impl ConnectionPool {
    pub fn new(uri: impl Into<String>, prefetch: u16) -> Self {
        Self::with_metrics(uri, prefetch, Arc::new(NoopMetricsSink))
    }

    /// As [`Self::new`], but wires `rmq_connection_active`/
    /// `rmq_channel_active` gauges and `rmq_connection_errors_total`/
    /// `rmq_channel_errors_total` counters (§4.6) into the pool's
    /// connect/reconnect/shutdown paths.
    pub fn with_metrics(uri: impl Into<String>, prefetch: u16, metrics: SharedMetrics) -> Self {
        Self {
            uri: uri.into(),
            prefetch,
            inner: Mutex::new(None),
            metrics,
        }
    }

    /// Return the shared channel, creating the connection and/or channel
    /// if either is missing or the channel is no longer open.
    pub async fn get_channel(&self) -> Result<Channel, MessagingError> {
        let mut guard = self.inner.lock().await;

        if let Some(state) = guard.as_ref() {
            if state.channel.status().connected() {
                return Ok(state.channel.clone());
            }
            warn!("pooled channel no longer connected, recreating");
        }

        let needs_connection = match guard.as_ref() {
            Some(state) => !state.connection.status().connected(),
            None => true,
        };

        if needs_connection {
            let connection = self.connect().await?;
            let channel = self.open_channel(&connection).await?;
            *guard = Some(PooledState { connection, channel: channel.clone() });
            self.metrics.gauge("rmq_connection_active", 1, &[]);
            self.metrics.gauge("rmq_channel_active", 1, &[]);
            return Ok(channel);
        }

        // Connection is alive but the channel died: open a fresh one on it.
        let state = guard.as_ref().expect("checked above");
        let channel = self.open_channel(&state.connection).await?;
        let connection = guard.take().expect("checked above").connection;
        *guard = Some(PooledState { connection, channel: channel.clone() });
        self.metrics.gauge("rmq_channel_active", 1, &[]);
        Ok(channel)
    }

    async fn connect(&self) -> Result<Connection, MessagingError> {
        let props = ConnectionProperties::default()
            .with_connection_name("event-bus".into())
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(&self.uri, props).await.map_err(|e| {
            let err = MessagingError::from_lapin(e);
            self.metrics.counter(
                "rmq_connection_errors_total",
                1,
                &[("error_type", err.class().tag())],
                1.0,
            );
            err
        })?;

        info!(heartbeat_secs = HEARTBEAT_SECS, "broker connection established");
        Ok(connection)
    }

    async fn open_channel(&self, connection: &Connection) -> Result<Channel, MessagingError> {
        let channel = connection.create_channel().await.map_err(|e| self.channel_error(e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| self.channel_error(e))?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| self.channel_error(e))?;

        Ok(channel)
    }

    fn channel_error(&self, e: lapin::Error) -> MessagingError {
        let err = MessagingError::from_lapin(e);
        self.metrics.counter(
            "rmq_channel_errors_total",
            1,
            &[("error_type", err.class().tag())],
            1.0,
        );
        err
    }

    /// True only if the connection reports connected AND a lightweight
    /// channel-open probe succeeds (§4.3 `isHealthy`).
    pub async fn is_healthy(&self) -> bool {
        let guard = self.inner.lock().await;
        match guard.as_ref() {
            Some(state) => {
                state.connection.status().connected() && state.channel.status().connected()
            }
            None => false,
        }
    }

    /// Close channel then connection. A failure in either step does not
    /// prevent the other from being attempted.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(state) = guard.take() {
            if let Err(e) = state.channel.close(200, "shutdown").await {
                warn!(error = %e, "error closing channel during shutdown");
            }
            if let Err(e) = state.connection.close(200, "shutdown").await {
                warn!(error = %e, "error closing connection during shutdown");
            }
        }
        self.metrics.gauge("rmq_connection_active", 0, &[]);
        self.metrics.gauge("rmq_channel_active", 0, &[]);
    }

    pub fn heartbeat() -> Duration {
        Duration::from_secs(HEARTBEAT_SECS as u64)
    }
}
