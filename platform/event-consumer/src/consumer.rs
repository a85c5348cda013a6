//! Consumer state machine (§4.2), the hardest subsystem in the library:
//! per-delivery lifecycle, the inbox claim protocol, retry/DLX routing,
//! the outage circuit breaker, and connection-lifecycle recycling.
//!
//! Topology-ensure-on-startup is grounded on `identity-auth`'s
//! `jetstream_setup::ensure_streams` (idempotent get-or-create), translated
//! from JetStream streams to AMQP exchange/queue/DLX declarations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use event_bus::{
    BackoffPolicy, Delivery, Envelope, EventBus, PublishOptions, SharedMetrics, Topology,
    MAX_ENVELOPE_BYTES,
};
use futures::StreamExt;
use tracing::{error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::handler::{invoke, Handler, HandlerRegistry};
use crate::repository::{ClaimOutcome, Repository};

/// Result of one [`Consumer::run`] pass. `Recycle` is returned once
/// `max_jobs_per_connection` deliveries have been processed; the host
/// process is expected to drop this `Consumer` (and its connection pool)
/// and construct a fresh one, per §4.2.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    ShutdownRequested,
    Recycle,
}

/// Which attempt bucket a delivery falls into for the `event_started_count`
/// / `event_processed_duration` `retry` tag (§4.6, §8 scenario 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBucket {
    First,
    Retry,
    Last,
}

impl RetryBucket {
    pub fn tag(self) -> &'static str {
        match self {
            RetryBucket::First => "first",
            RetryBucket::Retry => "retry",
            RetryBucket::Last => "last",
        }
    }

    pub fn classify(attempt: u32, tries: u32) -> Self {
        if attempt >= tries {
            RetryBucket::Last
        } else if attempt <= 1 {
            RetryBucket::First
        } else {
            RetryBucket::Retry
        }
    }
}

pub struct Consumer {
    bus: Arc<dyn EventBus>,
    repository: Arc<Repository>,
    config: ConsumerConfig,
    metrics: SharedMetrics,
    registry: HandlerRegistry,
    backoff: BackoffPolicy,
    consumer_service: String,
    jobs_processed: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl Consumer {
    pub fn new(
        bus: Arc<dyn EventBus>,
        repository: Arc<Repository>,
        config: ConsumerConfig,
        metrics: SharedMetrics,
        registry: HandlerRegistry,
    ) -> Self {
        let consumer_service = format!("{}.{}", config.project, config.service_name);
        let backoff = config.backoff.clone().into_policy();
        Self {
            bus,
            repository,
            config,
            metrics,
            registry,
            backoff,
            consumer_service,
            jobs_processed: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip the shutdown flag. Call from a SIGTERM/SIGINT handler; outage
    /// sleeps and the main consume loop both observe this within one
    /// second (§5 "Cancellation").
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn event_names(&self) -> Vec<String> {
        // binding pattern `#` (match all) unless the host narrows it by
        // constructing its own `Topology` — the registry itself does not
        // constrain routing, per §4.2.5's handler-resolution-not-routing
        // split.
        vec!["#".to_string()]
    }

    pub async fn ensure_topology(&self) -> Result<(), ConsumerError> {
        let topology = Topology::for_service(&self.config.project, &self.config.service_name, self.event_names());
        self.bus.ensure_topology(&topology).await?;
        Ok(())
    }

    /// §4.2.7: sleep in outage mode until both the broker and the database
    /// report healthy, checking the shutdown flag at least once per second.
    async fn ensure_healthy_or_sleep(&self) -> bool {
        let mut in_outage = false;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return false;
            }

            let broker_ok = self.bus.is_healthy().await;
            let db_ok = self.repository.is_healthy().await;

            if broker_ok && db_ok {
                if in_outage {
                    info!(consumer_service = %self.consumer_service, "outage exited, resuming consumption");
                }
                return true;
            }

            if !in_outage {
                warn!(
                    consumer_service = %self.consumer_service,
                    broker_healthy = broker_ok,
                    db_healthy = db_ok,
                    "outage entered, entering circuit-breaker sleep loop"
                );
                in_outage = true;
            }

            let sleep_secs = self.config.outage_sleep_sec.max(1);
            for _ in 0..sleep_secs {
                if self.shutdown.load(Ordering::Relaxed) {
                    return false;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    /// Main loop: outage-check, pull deliveries, process each to
    /// completion, stop after `max_jobs_per_connection` (if set) or on
    /// shutdown.
    pub async fn run(&self) -> Result<RunOutcome, ConsumerError> {
        loop {
            if !self.ensure_healthy_or_sleep().await {
                return Ok(RunOutcome::ShutdownRequested);
            }

            let queue = format!("{}.{}", self.config.project, self.config.service_name);
            let mut stream = self.bus.consume(&queue).await?;

            while let Some(delivery) = stream.next().await {
                if self.shutdown.load(Ordering::Relaxed) {
                    return Ok(RunOutcome::ShutdownRequested);
                }

                if let Err(e) = self.handle_delivery(delivery).await {
                    error!(error = %e, "unrecoverable error processing delivery");
                }

                if let Some(max_jobs) = self.config.max_jobs_per_connection {
                    let processed = self.jobs_processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if processed >= max_jobs {
                        info!(processed, max_jobs, "max_jobs_per_connection reached, recycling connection");
                        return Ok(RunOutcome::Recycle);
                    }
                }

                if !self.bus.is_healthy().await || !self.repository.is_healthy().await {
                    break; // drop back to ensure_healthy_or_sleep
                }
            }
        }
    }

    /// One full pass through the §4.2.2 state machine for a single
    /// delivery.
    async fn handle_delivery(&self, delivery: Delivery) -> Result<(), ConsumerError> {
        // Received -> envelope validity check.
        if delivery.payload.len() > MAX_ENVELOPE_BYTES {
            return self.dead_letter_invalid(&delivery, "oversized", "oversized envelope").await;
        }

        let envelope = match Envelope::from_bytes(&delivery.payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "poison message, routing to dead-letter");
                return self.dead_letter_invalid(&delivery, "encoding", &e.to_string()).await;
            }
        };

        let attempt = delivery.retry_count() as u32 + 1;
        let retry_bucket = RetryBucket::classify(attempt, self.config.tries);
        self.metrics.counter(
            "event_started_count",
            1,
            &[("event_name", &envelope.event), ("retry", retry_bucket.tag())],
            1.0,
        );

        // Received -> Claimed | Acked(rejected)
        let worker_id = self.config.worker_identity();
        let stale_threshold = Duration::from_secs(self.config.inbox_lock_stale_threshold_sec.max(0) as u64);
        let claim = self
            .repository
            .try_claim_inbox(
                &envelope.message_id.to_string(),
                &self.consumer_service,
                &envelope.event,
                &worker_id,
                stale_threshold,
            )
            .await?;

        if claim == ClaimOutcome::Rejected {
            self.ack(&delivery, &envelope.event).await;
            return Ok(());
        }

        // Claimed -> Handling
        let start = Instant::now();
        let handler = self.registry.resolve(&envelope);
        let outcome = match handler {
            Some(handler) => self.invoke_handler_guarded(handler, envelope.clone()).await,
            None => Err(format!("no handler registered for event {:?}", envelope.event)),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.repository
                    .mark_inbox_processed(&envelope.message_id.to_string(), &self.consumer_service)
                    .await?;
                let tags: &[(&str, &str)] =
                    &[("event_name", &envelope.event), ("retry", retry_bucket.tag()), ("status", "success")];
                self.metrics.timing("event_processed_duration", duration_ms, tags);
                self.metrics.gauge("event_processed_memory_bytes", delivery.payload.len() as u64, tags);
                info!(
                    event = %envelope.event,
                    message_id = %envelope.message_id,
                    retry = retry_bucket.tag(),
                    duration_ms,
                    "handler succeeded"
                );
                self.ack(&delivery, &envelope.event).await;
                Ok(())
            }
            Err(reason) => {
                self.metrics.timing(
                    "event_processed_duration",
                    duration_ms,
                    &[("event_name", &envelope.event), ("retry", retry_bucket.tag()), ("status", "failure")],
                );
                self.on_handler_failure(&delivery, &envelope, attempt, &reason).await
            }
        }
    }

    /// Runs the handler on its own task so a panic inside it (§4.2.5: "any
    /// fatal language-level error, not just ordinary exceptions, must be
    /// converted to a handler failure") is caught by `JoinHandle` rather
    /// than unwinding into the consumer loop. `AbortHandle` is taken before
    /// awaiting because dropping the `JoinHandle` on timeout would leave
    /// the task running in the background instead of cancelling it.
    async fn invoke_handler_guarded(
        &self,
        handler: Arc<dyn Handler>,
        envelope: Envelope,
    ) -> Result<(), String> {
        let timeout = Duration::from_secs(self.config.handler_timeout_sec);
        let task = tokio::spawn(async move { invoke(handler.as_ref(), &envelope).await });
        let abort_handle = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(format!("handler panicked: {join_err}"))
            }
            Ok(Err(join_err)) => Err(format!("handler task failed: {join_err}")),
            Err(_) => {
                abort_handle.abort();
                Err(format!("handler timed out after {timeout:?}"))
            }
        }
    }

    async fn on_handler_failure(
        &self,
        delivery: &Delivery,
        envelope: &Envelope,
        attempt: u32,
        reason: &str,
    ) -> Result<(), ConsumerError> {
        let mut envelope = envelope.clone();
        envelope.set_consumer_error(Some(reason.to_string()));

        let oversized = envelope.size_hint() > MAX_ENVELOPE_BYTES;
        let exhausted = attempt >= self.config.tries;

        if oversized {
            return self.dead_letter_failed(delivery, &envelope, "oversized", reason).await;
        }
        if exhausted {
            return self.dead_letter_failed(delivery, &envelope, "retries_exhausted", reason).await;
        }

        // RetryScheduled
        let delay = self.backoff.delay_for_attempt(attempt);
        let payload = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(_) => return self.dead_letter_failed(delivery, &envelope, "encoding", reason).await,
        };

        let opts = PublishOptions {
            delay_ms: Some(delay.as_millis() as i64),
            retry_count: Some(attempt as i32),
            ..Default::default()
        };

        let exchange = format!("{}.{}", self.config.project, self.config.service_name);
        match self.bus.publish(&exchange, &envelope.event, payload, opts).await {
            Ok(()) => {
                self.repository
                    .mark_inbox_failed(&envelope.message_id.to_string(), &self.consumer_service, reason)
                    .await?;
                warn!(
                    event = %envelope.event,
                    message_id = %envelope.message_id,
                    attempt,
                    delay_ms = delay.as_millis(),
                    reason,
                    "handler failed, retry scheduled"
                );
                self.ack(delivery, &envelope.event).await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to publish retry, falling back to dead-letter");
                self.dead_letter_failed(delivery, &envelope, "retry_publish_failed", reason).await
            }
        }
    }

    /// `reason_code` is the bounded `rmq_consumer_dlx_total{reason}` tag
    /// value (§4.6); `detail` is the free-text failure message carried in
    /// the `x-error-message` header and log line.
    async fn dead_letter_failed(
        &self,
        delivery: &Delivery,
        envelope: &Envelope,
        reason_code: &str,
        detail: &str,
    ) -> Result<(), ConsumerError> {
        self.repository
            .mark_inbox_failed(&envelope.message_id.to_string(), &self.consumer_service, detail)
            .await?;
        self.publish_dead_letter(
            delivery,
            envelope.to_bytes().unwrap_or_else(|_| delivery.payload.clone()),
            &envelope.event,
            reason_code,
            detail,
        )
        .await
    }

    async fn dead_letter_invalid(
        &self,
        delivery: &Delivery,
        reason_code: &str,
        detail: &str,
    ) -> Result<(), ConsumerError> {
        let event_name = delivery.routing_key.clone();
        self.publish_dead_letter(delivery, delivery.payload.clone(), &event_name, reason_code, detail).await
    }

    /// Publish to the failed queue. Must succeed before ack (§4.2.6); on
    /// failure, logged at error severity and the delivery is nack'd
    /// without requeue, leaving the broker's own redelivery as last resort.
    async fn publish_dead_letter(
        &self,
        delivery: &Delivery,
        payload: Vec<u8>,
        event_name: &str,
        reason_code: &str,
        detail: &str,
    ) -> Result<(), ConsumerError> {
        let failed_queue = format!("{}.{}.failed", self.config.project, self.config.service_name);
        let opts = PublishOptions {
            error_message: Some(detail.to_string()),
            ..Default::default()
        };

        match self.bus.publish(&failed_queue, &delivery.routing_key, payload, opts).await {
            Ok(()) => {
                self.metrics.counter(
                    "rmq_consumer_dlx_total",
                    1,
                    &[("event_name", event_name), ("reason", reason_code)],
                    1.0,
                );
                self.ack(delivery, event_name).await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, detail, "dead-letter publish failed, nacking without requeue");
                if let Err(nack_err) = delivery.nack(false).await {
                    error!(error = %nack_err, "nack also failed after dead-letter publish failure");
                }
                Err(ConsumerError::Messaging(e))
            }
        }
    }

    /// Ack exactly once (§4.2.6). Failures are logged and swallowed — the
    /// broker will redeliver and the inbox claim makes that safe.
    async fn ack(&self, delivery: &Delivery, event_name: &str) {
        if let Err(e) = delivery.ack().await {
            self.metrics.counter(
                "rmq_consumer_ack_failed_total",
                1,
                &[("event_name", event_name)],
                1.0,
            );
            error!(error = %e, "ack failed, relying on broker redelivery + inbox idempotency");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_bucket_classifies_first_middle_last() {
        assert_eq!(RetryBucket::classify(1, 3), RetryBucket::First);
        assert_eq!(RetryBucket::classify(2, 3), RetryBucket::Retry);
        assert_eq!(RetryBucket::classify(3, 3), RetryBucket::Last);
    }

    #[test]
    fn retry_bucket_handles_tries_of_one() {
        assert_eq!(RetryBucket::classify(1, 1), RetryBucket::Last);
    }
}
