//! In-memory [`EventBus`] for tests and local development.
//!
//! Keeps the teacher's broadcast-channel design and exchange/routing-key
//! topic-matching wildcards, adapted to the new ack-aware trait shape: a
//! `publish` fans out to every active `consume` stream matching the
//! routing key, and every delivered message carries a no-op-always-succeeds
//! [`Acker`] since there is no broker to actually ack against.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;

use crate::bus::{Acker, BusResult, Delivery, EventBus, Headers, PublishOptions, Topology};

#[derive(Clone)]
struct Envelope {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    headers: Headers,
    app_id: Option<String>,
}

/// `EventBus` backed by a single broadcast channel, filtered per-subscriber
/// by topic-style routing key matching (`*` one token, `#` zero-or-more).
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<Envelope>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// AMQP topic-exchange wildcard matching: `*` matches exactly one
    /// token, `#` matches zero or more tokens.
    fn matches_pattern(routing_key: &str, pattern: &str) -> bool {
        let key_tokens: Vec<&str> = routing_key.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();
        Self::match_tokens(&key_tokens, &pattern_tokens)
    }

    fn match_tokens(key: &[&str], pattern: &[&str]) -> bool {
        match pattern.first() {
            None => key.is_empty(),
            Some(&"#") => {
                if pattern.len() == 1 {
                    return true;
                }
                (0..=key.len()).any(|i| Self::match_tokens(&key[i..], &pattern[1..]))
            }
            Some(&"*") => {
                !key.is_empty() && Self::match_tokens(&key[1..], &pattern[1..])
            }
            Some(token) => {
                !key.is_empty() && key[0] == *token && Self::match_tokens(&key[1..], &pattern[1..])
            }
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> BusResult<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> BusResult<()> {
        Ok(())
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        opts: PublishOptions,
    ) -> BusResult<()> {
        let _ = self.sender.send(Envelope {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            headers: opts.headers(),
            app_id: opts.app_id.clone(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<BoxStream<'static, Delivery>> {
        let mut receiver = self.sender.subscribe();
        let pattern = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if Self::matches_pattern(&envelope.routing_key, &pattern) {
                            yield Delivery::new(
                                envelope.exchange,
                                envelope.routing_key,
                                envelope.payload,
                                false,
                                envelope.headers,
                                envelope.app_id,
                                Box::new(NoopAcker),
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "in-memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn ensure_topology(&self, _topology: &Topology) -> BusResult<()> {
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matching_follows_topic_exchange_rules() {
        assert!(InMemoryBus::matches_pattern("auth.user.created", "auth.user.created"));
        assert!(InMemoryBus::matches_pattern("auth.user.created", "auth.*.created"));
        assert!(!InMemoryBus::matches_pattern("auth.user.created", "auth.*"));
        assert!(InMemoryBus::matches_pattern("auth.user.created", "auth.#"));
        assert!(InMemoryBus::matches_pattern("auth.user.created", "#"));
        assert!(!InMemoryBus::matches_pattern("billing.paid", "auth.#"));
    }

    #[tokio::test]
    async fn publish_is_delivered_to_matching_consumer() {
        let bus = InMemoryBus::new();
        let mut stream = bus.consume("order.*").await.unwrap();

        bus.publish("orders", "order.created", b"hi".to_vec(), PublishOptions::default())
            .await
            .unwrap();

        let delivery = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");

        assert_eq!(delivery.routing_key, "order.created");
        assert_eq!(delivery.payload, b"hi".to_vec());
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn non_matching_routing_key_is_not_delivered() {
        let bus = InMemoryBus::new();
        let mut stream = bus.consume("order.*").await.unwrap();

        bus.publish("orders", "user.created", b"x".to_vec(), PublishOptions::default())
            .await
            .unwrap();
        bus.publish("orders", "order.created", b"y".to_vec(), PublishOptions::default())
            .await
            .unwrap();

        let delivery = tokio::time::timeout(std::time::Duration::from_millis(200), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(delivery.routing_key, "order.created");
    }

    #[tokio::test]
    async fn headers_round_trip_through_publish_options() {
        let bus = InMemoryBus::new();
        let mut stream = bus.consume("#").await.unwrap();

        let opts = PublishOptions {
            retry_count: Some(2),
            ..Default::default()
        };
        bus.publish("orders", "order.retry", vec![], opts).await.unwrap();

        let delivery = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.retry_count(), 2);
    }
}
