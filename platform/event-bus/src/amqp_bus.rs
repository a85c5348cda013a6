//! AMQP 0-9-1 implementation of [`EventBus`], backed by `lapin`.
//!
//! Structurally this mirrors the teacher's `nats_bus.rs` (a thin wrapper
//! translating client calls into the trait's vocabulary), but the wire
//! semantics are grounded on `other_examples`' lapin reference code: the
//! exchange/routing-key/`BasicProperties`/delivery-mode shape from the
//! `amqp-lapin-helper` reference, and the ack-on-success /
//! reject-on-failure discipline from the same.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, ExchangeKind};
use tracing::{debug, warn};

use crate::bus::{
    Acker, BusResult, Delivery, EventBus, HeaderValue, Headers, PublishOptions, Topology,
};
use crate::error::MessagingError;
use crate::pool::ConnectionPool;

pub struct AmqpBus {
    pool: Arc<ConnectionPool>,
}

impl AmqpBus {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    fn properties_for(opts: &PublishOptions) -> BasicProperties {
        let mut props = BasicProperties::default()
            // §3.1: delivery_mode on the wire is always "persistent".
            .with_delivery_mode(2);

        if let Some(app_id) = &opts.app_id {
            props = props.with_app_id(ShortString::from(app_id.as_str()));
        }
        if let Some(correlation_id) = &opts.correlation_id {
            props = props.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }

        let mut table = FieldTable::default();
        for (key, value) in opts.headers() {
            let amqp_value = match value {
                HeaderValue::Int(n) => AMQPValue::LongLongInt(n),
                HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s)),
            };
            table.insert(key.into(), amqp_value);
        }
        if !table.is_empty() || !opts.headers().is_empty() {
            props = props.with_headers(table);
        }

        props
    }

    fn headers_from_table(table: &Option<FieldTable>) -> Headers {
        let mut headers = Headers::new();
        let Some(table) = table else {
            return headers;
        };
        for (key, value) in table.inner() {
            let converted = match value {
                AMQPValue::LongLongInt(n) => Some(HeaderValue::Int(*n)),
                AMQPValue::LongInt(n) => Some(HeaderValue::Int(*n as i64)),
                AMQPValue::ShortInt(n) => Some(HeaderValue::Int(*n as i64)),
                AMQPValue::LongString(s) => Some(HeaderValue::Str(s.to_string())),
                AMQPValue::ShortString(s) => Some(HeaderValue::Str(s.to_string())),
                _ => None,
            };
            if let Some(v) = converted {
                headers.insert(key.to_string(), v);
            }
        }
        headers
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> BusResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(MessagingError::from_lapin)
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(MessagingError::from_lapin)
    }
}

#[async_trait]
impl EventBus for AmqpBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        opts: PublishOptions,
    ) -> BusResult<()> {
        let channel = self.pool.get_channel().await?;
        let properties = Self::properties_for(&opts);

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(MessagingError::from_lapin)?;

        confirm
            .await
            .map_err(MessagingError::from_lapin)?
            .ok();

        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<BoxStream<'static, Delivery>> {
        let channel = self.pool.get_channel().await?;
        let consumer_tag = format!("consumer-{queue}");

        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(MessagingError::from_lapin)?;

        let stream = consumer.filter_map(|delivery| async move {
            match delivery {
                Ok(delivery) => {
                    let headers = Self::headers_from_table(&delivery.properties.headers().clone());
                    let app_id = delivery
                        .properties
                        .app_id()
                        .as_ref()
                        .map(|s| s.to_string());
                    Some(Delivery::new(
                        delivery.exchange.to_string(),
                        delivery.routing_key.to_string(),
                        delivery.data.clone(),
                        delivery.redelivered,
                        headers,
                        app_id,
                        Box::new(LapinAcker {
                            acker: delivery.acker.clone(),
                        }),
                    ))
                }
                Err(e) => {
                    warn!(error = %e, "error receiving delivery from broker");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn ensure_topology(&self, topology: &Topology) -> BusResult<()> {
        let channel = self.pool.get_channel().await?;
        declare_topology(&channel, topology).await
    }

    async fn is_healthy(&self) -> bool {
        self.pool.is_healthy().await
    }
}

/// Idempotently declare the main topic exchange, the `x-delayed-message`
/// retry exchange, the main queue (DLX-routed to the delayed exchange),
/// and the terminal failed queue (§4.2.1).
async fn declare_topology(channel: &Channel, topology: &Topology) -> BusResult<()> {
    channel
        .exchange_declare(
            &topology.main_exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(MessagingError::from_lapin)?;

    let mut delayed_args = FieldTable::default();
    delayed_args.insert(
        "x-delayed-type".into(),
        AMQPValue::LongString(LongString::from("topic")),
    );
    channel
        .exchange_declare(
            &topology.delayed_exchange,
            ExchangeKind::Custom("x-delayed-message".to_string()),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            delayed_args,
        )
        .await
        .map_err(MessagingError::from_lapin)?;

    let mut main_queue_args = FieldTable::default();
    main_queue_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(LongString::from(topology.delayed_exchange.as_str())),
    );
    channel
        .queue_declare(
            &topology.main_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            main_queue_args,
        )
        .await
        .map_err(MessagingError::from_lapin)?;

    for pattern in &topology.binding_patterns {
        channel
            .queue_bind(
                &topology.main_queue,
                &topology.main_exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(MessagingError::from_lapin)?;

        channel
            .queue_bind(
                &topology.main_queue,
                &topology.delayed_exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(MessagingError::from_lapin)?;
    }

    let mut failed_args = FieldTable::default();
    failed_args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(topology.failed_queue_ttl_ms),
    );
    failed_args.insert(
        "x-max-length".into(),
        AMQPValue::LongLongInt(topology.failed_queue_max_length),
    );
    failed_args.insert(
        "x-overflow".into(),
        AMQPValue::LongString(LongString::from("drop-head")),
    );
    channel
        .queue_declare(
            &topology.failed_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            failed_args,
        )
        .await
        .map_err(MessagingError::from_lapin)?;

    debug!(
        exchange = %topology.main_exchange,
        failed_queue = %topology.failed_queue,
        "queue topology ensured"
    );
    Ok(())
}
