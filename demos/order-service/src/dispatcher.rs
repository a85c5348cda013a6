//! Outbox dispatcher: relays `pending` outbox rows to the broker.
//!
//! Grounded on spec.md's "outbox dispatcher workers relaying persisted
//! rows" (§4.1) and `event_bus::consumer_retry`'s polling-loop idiom;
//! respects `fetch_pending_outbox_ordered`'s per-`partition_key` ordering
//! (DESIGN.md open question 2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use event_bus::{EventBus, PublishOptions};
use event_consumer::Repository;
use tracing::{error, info, warn};

pub struct OutboxDispatcher {
    bus: Arc<dyn EventBus>,
    repository: Arc<Repository>,
    exchange: String,
    app_id: String,
    batch_size: i64,
    poll_interval: Duration,
}

impl OutboxDispatcher {
    pub fn new(
        bus: Arc<dyn EventBus>,
        repository: Arc<Repository>,
        exchange: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            repository,
            exchange: exchange.into(),
            app_id: app_id.into(),
            batch_size: 50,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Poll until `shutdown` flips, relaying one batch per tick.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.relay_batch().await {
                error!(error = %e, "outbox dispatch batch failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn relay_batch(&self) -> Result<(), event_consumer::RepositoryError> {
        let rows = self.repository.fetch_pending_outbox_ordered(self.batch_size).await?;
        if rows.is_empty() {
            return Ok(());
        }

        for row in rows {
            let payload = match serde_json::to_vec(&row.message_body) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(outbox_id = row.id, error = %e, "outbox row body not encodable, marking failed");
                    self.repository.mark_outbox_failed(row.id, &e.to_string()).await?;
                    continue;
                }
            };

            let opts = PublishOptions {
                app_id: Some(self.app_id.clone()),
                ..Default::default()
            };

            match self.bus.publish(&self.exchange, &row.event_type, payload, opts).await {
                Ok(()) => {
                    self.repository.mark_outbox_processed(row.id).await?;
                    info!(outbox_id = row.id, event = %row.event_type, "outbox row relayed");
                }
                Err(e) => {
                    warn!(outbox_id = row.id, error = %e, "outbox relay failed, retrying next tick");
                }
            }
        }

        Ok(())
    }
}
