// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Transport
//!
//! Production implementation of the transport seam on top of `lapin`. Connections are
//! named after the configured connection name plus a random suffix, messages are
//! published as persistent with a fresh message id, and lapin's error callbacks are
//! forwarded to the registered observers.

use crate::{
    config::AmqpConfig,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        ConsumeOptions, DeliverySink, HeaderValue, Headers, ObserverId, Observer, Observers,
        RawDelivery, Transport, TransportChannel, TransportConnection, TransportError,
        TransportEvent,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{AMQPValue, ByteArray, FieldTable, LongInt, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens connections with lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        config: &AmqpConfig,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        let options = ConnectionProperties::default().with_connection_name(LongString::from(
            format!("{}-{}", config.connection_name, Uuid::new_v4()),
        ));

        let uri = with_heartbeat(&config.uri, config.heartbeat_secs);
        let conn = tokio::time::timeout(config.connect_timeout(), Connection::connect(&uri, options))
            .await
            .map_err(|_| {
                TransportError::new(format!(
                    "connect timed out after {}ms",
                    config.connect_timeout_ms
                ))
            })?
            .map_err(|err| lapin_error(&err))?;

        let observers = Arc::new(Observers::default());
        let notify = observers.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            notify.emit(&TransportEvent::Error(lapin_error(&err)));
        });

        Ok(Arc::new(LapinConnection { conn, observers }))
    }
}

struct LapinConnection {
    conn: Connection,
    observers: Arc<Observers>,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn create_channel(
        &self,
        confirm: bool,
    ) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|err| lapin_error(&err))?;

        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| lapin_error(&err))?;
        }

        let observers = Arc::new(Observers::default());
        let notify = observers.clone();
        channel.on_error(move |err| {
            warn!(error = err.to_string(), "amqp channel error");
            notify.emit(&TransportEvent::Error(lapin_error(&err)));
        });

        Ok(Arc::new(LapinChannel {
            channel,
            confirm,
            observers,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| lapin_error(&err))
    }

    fn observe(&self, observer: Observer) -> ObserverId {
        self.observers.add(observer)
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(id)
    }
}

struct LapinChannel {
    channel: Channel,
    confirm: bool,
    observers: Arc<Observers>,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    fn is_confirm(&self) -> bool {
        self.confirm
    }

    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| lapin_error(&err))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), TransportError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(to_field_table(headers));

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|err| lapin_error(&err))
    }

    async fn wait_for_confirms(&self) -> Result<(), TransportError> {
        let returned = self
            .channel
            .wait_for_confirms()
            .await
            .map_err(|err| lapin_error(&err))?;

        if !returned.is_empty() {
            warn!(count = returned.len(), "messages returned by the broker");
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        sink: DeliverySink,
    ) -> Result<String, TransportError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                options.consumer_tag.as_deref().unwrap_or_default(),
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: false,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| lapin_error(&err))?;

        let tag = consumer.tag().as_str().to_owned();
        let queue = queue.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => sink(Some(RawDelivery {
                        exchange: delivery.exchange.as_str().to_owned(),
                        routing_key: delivery.routing_key.as_str().to_owned(),
                        delivery_tag: delivery.delivery_tag,
                        redelivered: delivery.redelivered,
                        headers: delivery
                            .properties
                            .headers()
                            .as_ref()
                            .map(from_field_table)
                            .unwrap_or_default(),
                        body: delivery.data,
                    })),
                    Err(err) => error!(error = err.to_string(), queue = queue.as_str(), "errors consume msg"),
                }
            }

            debug!(queue = queue.as_str(), "consumer stream ended");
            sink(None);
        });

        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| lapin_error(&err))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| lapin_error(&err))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| lapin_error(&err))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_args(def),
            )
            .await
            .map_err(|err| lapin_error(&err))?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| lapin_error(&err))
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|err| lapin_error(&err))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| lapin_error(&err))
    }

    fn observe(&self, observer: Observer) -> ObserverId {
        self.observers.add(observer)
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(id)
    }
}

fn lapin_error(err: &lapin::Error) -> TransportError {
    TransportError::with_trace(err.to_string(), format!("{err:?}"))
}

fn with_heartbeat(uri: &str, heartbeat_secs: u16) -> String {
    if heartbeat_secs == 0 || uri.contains("heartbeat=") {
        return uri.to_owned();
    }

    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{uri}{separator}heartbeat={heartbeat_secs}")
}

fn queue_args(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    FieldTable::from(args)
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => {
                    HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
                AMQPValue::ByteArray(v) => HeaderValue::Bytes(v.as_slice().to_vec()),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}
