//! Core broker abstraction.
//!
//! Generalized from the teacher's NATS-subject `EventBus` trait: instead
//! of a passive publish/subscribe pair over bare subjects, this trait
//! speaks AMQP 0-9-1's exchange/routing-key/queue vocabulary and yields
//! acknowledgeable [`Delivery`] values, since durable redelivery (and thus
//! explicit ack/nack) is central to the inbox protocol in a way it never
//! was for NATS core pub/sub.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::MessagingError;

pub type BusResult<T> = Result<T, MessagingError>;

/// A single AMQP header value. Deliberately narrower than
/// `lapin::types::AMQPValue` — only the shapes this library's headers
/// actually use (`x-delay`, `x-retry-count`, `x-error-message`, `app_id`).
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
}

pub type Headers = HashMap<String, HeaderValue>;

/// Options attached to a single publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// AMQP `app_id` property — always `project.service` (§4.1 step 1).
    pub app_id: Option<String>,
    /// `x-delay` header in milliseconds, present only on delayed-exchange
    /// publishes (retry scheduling).
    pub delay_ms: Option<i64>,
    /// `x-retry-count` header.
    pub retry_count: Option<i32>,
    /// `x-error-message` header, set only on dead-letter publishes.
    pub error_message: Option<String>,
    pub correlation_id: Option<String>,
}

impl PublishOptions {
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        if let Some(delay) = self.delay_ms {
            headers.insert("x-delay".to_string(), HeaderValue::Int(delay));
        }
        if let Some(count) = self.retry_count {
            headers.insert("x-retry-count".to_string(), HeaderValue::Int(count as i64));
        }
        if let Some(msg) = &self.error_message {
            headers.insert("x-error-message".to_string(), HeaderValue::Str(msg.clone()));
        }
        headers
    }
}

/// An inbound message plus the means to finalize it exactly once.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub headers: Headers,
    pub app_id: Option<String>,
    acker: Box<dyn Acker>,
    /// §4.2.6: "the consumer tracks an acked flag per delivery to forbid
    /// double-ack." Lives on the delivery itself rather than as caller-side
    /// bookkeeping so the invariant holds regardless of which code path
    /// finalizes the delivery.
    acked: AtomicBool,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("bytes", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

impl Delivery {
    pub fn new(
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        redelivered: bool,
        headers: Headers,
        app_id: Option<String>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            exchange,
            routing_key,
            payload,
            redelivered,
            headers,
            app_id,
            acker,
            acked: AtomicBool::new(false),
        }
    }

    /// `x-retry-count` carried on this delivery, `0` if absent (first attempt).
    pub fn retry_count(&self) -> i32 {
        match self.headers.get("x-retry-count") {
            Some(HeaderValue::Int(n)) => *n as i32,
            _ => 0,
        }
    }

    /// Ack exactly once (§4.2.6, §8). A second call — from any code path —
    /// is a no-op that returns `Ok(())` without touching the broker again.
    pub async fn ack(&self) -> BusResult<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.acker.ack().await
    }

    /// Nack also counts as finalizing the delivery exactly once (§4.2.6):
    /// the dead-letter-publish-failure path nacks without requeue as a last
    /// resort, and that must not be followed by a later ack attempt either.
    pub async fn nack(&self, requeue: bool) -> BusResult<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.acker.nack(requeue).await
    }

    /// Whether this delivery has already been acked or nacked.
    pub fn is_finalized(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }
}

/// Finalization capability for a single delivery. Implemented per-broker
/// (AMQP acker wraps a `lapin::acker::Acker`; the in-memory bus's acker is
/// a no-op that always succeeds).
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BusResult<()>;
    async fn nack(&self, requeue: bool) -> BusResult<()>;
}

/// Declarative description of the queue topology a consumer needs (§4.2.1).
#[derive(Debug, Clone)]
pub struct Topology {
    pub main_exchange: String,
    pub delayed_exchange: String,
    pub main_queue: String,
    pub failed_queue: String,
    /// Event-name binding patterns for the main queue, e.g. `"user.*"`.
    pub binding_patterns: Vec<String>,
    pub failed_queue_ttl_ms: i64,
    pub failed_queue_max_length: i64,
    pub prefetch: u16,
}

impl Topology {
    pub fn for_service(project: &str, service: &str, binding_patterns: Vec<String>) -> Self {
        Self {
            main_exchange: format!("{project}.{service}"),
            delayed_exchange: format!("{project}.{service}"),
            main_queue: format!("{project}.{service}"),
            failed_queue: format!("{project}.{service}.failed"),
            binding_patterns,
            failed_queue_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            failed_queue_max_length: 100_000,
            prefetch: 1,
        }
    }
}

/// Core broker abstraction: publish, consume, declare topology, probe health.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        opts: PublishOptions,
    ) -> BusResult<()>;

    async fn consume(&self, queue: &str) -> BusResult<BoxStream<'static, Delivery>>;

    /// Idempotently declare the exchanges/queues a consumer needs.
    /// Brokers without a concept of topology (the in-memory test double)
    /// accept any `Topology` as a no-op.
    async fn ensure_topology(&self, _topology: &Topology) -> BusResult<()> {
        Ok(())
    }

    /// True only if the underlying transport reports connected AND a
    /// lightweight probe succeeds (§4.3 `isHealthy`).
    async fn is_healthy(&self) -> bool;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct CountingAcker {
        acks: Arc<AtomicU32>,
        nacks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Acker for CountingAcker {
        async fn ack(&self) -> BusResult<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self, _requeue: bool) -> BusResult<()> {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn delivery_with(acks: Arc<AtomicU32>, nacks: Arc<AtomicU32>) -> Delivery {
        Delivery::new(
            "orders".to_string(),
            "order.created".to_string(),
            vec![],
            false,
            Headers::new(),
            None,
            Box::new(CountingAcker { acks, nacks }),
        )
    }

    #[tokio::test]
    async fn second_ack_is_a_silent_no_op() {
        let acks = Arc::new(AtomicU32::new(0));
        let nacks = Arc::new(AtomicU32::new(0));
        let delivery = delivery_with(acks.clone(), nacks.clone());

        delivery.ack().await.unwrap();
        delivery.ack().await.unwrap();
        delivery.ack().await.unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
        assert!(delivery.is_finalized());
    }

    #[tokio::test]
    async fn nack_after_ack_does_not_reach_the_acker() {
        let acks = Arc::new(AtomicU32::new(0));
        let nacks = Arc::new(AtomicU32::new(0));
        let delivery = delivery_with(acks.clone(), nacks.clone());

        delivery.ack().await.unwrap();
        delivery.nack(false).await.unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
        assert!(delivery.is_finalized());
    }
}
