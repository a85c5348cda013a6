//! Example handler registered for the `order.created` event.

use async_trait::async_trait;
use event_bus::Envelope;
use event_consumer::{Handler, HandlerResult};
use tracing::info;

pub struct OrderCreatedHandler;

#[async_trait]
impl Handler for OrderCreatedHandler {
    async fn handle(&self, envelope: &Envelope) -> HandlerResult {
        let order_id = envelope
            .payload
            .get("order_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "order.created payload missing order_id".to_string())?;

        info!(order_id, message_id = %envelope.message_id, "order created");
        Ok(())
    }
}
