//! Hybrid publisher pipeline (§4.1).
//!
//! Broker-first, falling through to the outbox on any non-encoding
//! failure; `publish_to_broker` is the direct-only variant used by an
//! outbox-dispatcher relaying already-persisted rows (DESIGN.md open
//! question 1: no outbox fallback there, to avoid re-persisting a row
//! that is already durable).

use std::sync::Arc;
use std::time::Instant;

use event_bus::{ErrorClass, Envelope, EventBus, MessagingError, PublishOptions};
use serde_json::Map;
use tracing::{error, info};

use crate::error::RepositoryError;
use crate::repository::Repository;

pub struct Publisher {
    bus: Arc<dyn EventBus>,
    repository: Arc<Repository>,
    exchange: String,
    app_id: String,
    service_name: String,
    metrics: event_bus::SharedMetrics,
    sample_ok: f64,
    envelope: Option<Envelope>,
    pending_meta: Map<String, serde_json::Value>,
    delay_ms: Option<i64>,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn EventBus>,
        repository: Arc<Repository>,
        exchange: impl Into<String>,
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        metrics: event_bus::SharedMetrics,
        sample_ok: f64,
    ) -> Self {
        Self {
            bus,
            repository,
            exchange: exchange.into(),
            app_id: app_id.into(),
            service_name: service_name.into(),
            metrics,
            sample_ok,
            envelope: None,
            pending_meta: Map::new(),
            delay_ms: None,
        }
    }

    /// `setMessage(envelope)` — store a reference for the next publish.
    pub fn set_message(&mut self, envelope: Envelope) -> &mut Self {
        self.envelope = Some(envelope);
        self
    }

    /// `setMeta(map)` — merged into the envelope just before send.
    pub fn set_meta(&mut self, meta: Map<String, serde_json::Value>) -> &mut Self {
        for (k, v) in meta {
            self.pending_meta.insert(k, v);
        }
        self
    }

    /// `delay(ms)` — schedule delayed delivery via the delayed exchange.
    /// Ignored by `publish_outbox` (durability-first has no broker hop to
    /// delay).
    pub fn delay(&mut self, ms: i64) -> &mut Self {
        self.delay_ms = Some(ms);
        self
    }

    fn take_prepared_envelope(&mut self, event_name: &str) -> Result<Envelope, MessagingError> {
        let mut envelope = self
            .envelope
            .take()
            .unwrap_or(Envelope::new(event_name)?);
        envelope.set_event(event_name)?;
        if !self.pending_meta.is_empty() {
            envelope.merge_meta(std::mem::take(&mut self.pending_meta));
        }
        Ok(envelope)
    }

    fn sampled(&self) -> bool {
        self.sample_ok >= 1.0 || rand::random::<f64>() < self.sample_ok
    }

    /// Hybrid publish (§4.1 "Broker publish algorithm" + "Outbox publish
    /// algorithm"): attempt the broker first; any non-encoding failure
    /// falls through to the outbox and still returns `Ok`.
    pub async fn publish(&mut self, event_name: &str) -> Result<(), MessagingError> {
        let envelope = self.take_prepared_envelope(event_name)?;
        let payload = envelope.to_bytes()?; // ValidationError surfaces here, not swallowed.

        let delay_ms = self.delay_ms.take();
        let size = payload.len();

        self.metrics.counter(
            "rmq_publish_total",
            1,
            &[("event_name", event_name)],
            self.sample_ok,
        );

        let start = Instant::now();
        let opts = PublishOptions {
            app_id: Some(self.app_id.clone()),
            delay_ms,
            ..Default::default()
        };

        match self
            .bus
            .publish(&self.exchange, event_name, payload.clone(), opts)
            .await
        {
            Ok(()) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                self.metrics.counter(
                    "rmq_publish_success_total",
                    1,
                    &[("event_name", event_name)],
                    self.sample_ok,
                );
                if self.sampled() {
                    self.metrics
                        .timing("rmq_publish_duration_ms", elapsed_ms, &[("event_name", event_name)]);
                    self.metrics.histogram(
                        "rmq_payload_bytes",
                        size as f64,
                        &[("event_name", event_name)],
                    );
                }
                info!(event = event_name, bytes = size, duration_ms = elapsed_ms, "published to broker");
                Ok(())
            }
            Err(e) => {
                self.metrics.counter(
                    "rmq_publish_error_total",
                    1,
                    &[("event_name", event_name), ("error_type", e.class().tag())],
                    1.0,
                );
                error!(event = event_name, error = %e, error_class = e.class().tag(), "broker publish failed");

                self.insert_outbox_fallback(event_name, &envelope).await
            }
        }
    }

    /// Direct publish only — no outbox fallback (DESIGN.md open question 1).
    pub async fn publish_to_broker(&mut self, event_name: &str) -> Result<(), MessagingError> {
        let envelope = self.take_prepared_envelope(event_name)?;
        let payload = envelope.to_bytes()?;
        let delay_ms = self.delay_ms.take();

        let opts = PublishOptions {
            app_id: Some(self.app_id.clone()),
            delay_ms,
            ..Default::default()
        };

        self.bus
            .publish(&self.exchange, event_name, payload, opts)
            .await
    }

    async fn insert_outbox_fallback(
        &self,
        event_name: &str,
        envelope: &Envelope,
    ) -> Result<(), MessagingError> {
        let body = serde_json::to_value(envelope).map_err(MessagingError::from_json)?;
        let partition_key = envelope.meta.get("partition_key").and_then(|v| v.as_str());

        match self
            .repository
            .insert_outbox(&self.service_name, event_name, &body, partition_key)
            .await
        {
            Ok(_) => Ok(()),
            Err(RepositoryError::Messaging(e)) => Err(e),
            Err(RepositoryError::Sqlx(e)) => Err(MessagingError::Storage(e.to_string())),
            Err(RepositoryError::Inbox(e)) => Err(MessagingError::Inbox(e.to_string())),
        }
    }
}

/// True if `class` is one the publisher falls through to the outbox for
/// (everything except `Encoding`, per §4.1's "on any non-encoding
/// failure"). `Validation` never reaches this check in practice —
/// `Envelope::to_bytes` fails before the broker is ever called — but the
/// policy is total over `ErrorClass` so callers don't need a catch-all.
pub fn falls_through_to_outbox(class: ErrorClass) -> bool {
    !matches!(class, ErrorClass::Encoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_encoding_does_not_fall_through() {
        assert!(!falls_through_to_outbox(ErrorClass::Encoding));
        assert!(falls_through_to_outbox(ErrorClass::Validation));
        assert!(falls_through_to_outbox(ErrorClass::Connection));
        assert!(falls_through_to_outbox(ErrorClass::Storage));
    }
}
