// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests. Records every transport call in order and
//! can be told to fail or hang individual calls.

use crate::{
    config::AmqpConfig,
    errors::HandlerError,
    handler::MessageHandler,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        ConsumeOptions, DeliverySink, HeaderValue, Headers, Observer, ObserverId, Observers,
        RawDelivery, Transport, TransportChannel, TransportConnection, TransportError,
        TransportEvent,
    },
};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    log: Mutex<Vec<String>>,
    pub fail_connect: AtomicBool,
    pub fail_declare: AtomicBool,
    pub fail_bind: AtomicBool,
    pub fail_ack: AtomicBool,
    pub fail_cancel: AtomicBool,
    pub hang_connection_close: AtomicBool,
    pub hang_channel_close: AtomicBool,
    pub hang_cancel: AtomicBool,
    pub hang_confirms: AtomicBool,
    /// Holds `consume` after recording it until `consume_gate` is notified.
    pub hold_consume: AtomicBool,
    pub consume_gate: Notify,
    /// Delays `ack` by this many milliseconds before it succeeds or fails.
    pub ack_delay_ms: AtomicU64,
    /// Handed to the sink from inside `consume`, before the tag is returned.
    pub early_delivery: Mutex<Option<RawDelivery>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    sinks: Mutex<BTreeMap<String, DeliverySink>>,
    published: Mutex<Vec<Published>>,
    next_channel: AtomicU64,
    next_tag: AtomicU64,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeBroker::default())
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Indexes of the log entries starting with `prefix`.
    pub fn positions(&self, prefix: &str) -> Vec<usize> {
        self.log()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.starts_with(prefix))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn deliver(&self, consumer_tag: &str, delivery: RawDelivery) {
        let sink = self.sinks.lock().unwrap().get(consumer_tag).cloned();
        if let Some(sink) = sink {
            sink(Some(delivery));
        }
    }

    pub fn cancel_from_broker(&self, consumer_tag: &str) {
        let sink = self.sinks.lock().unwrap().get(consumer_tag).cloned();
        if let Some(sink) = sink {
            sink(None);
        }
    }

    pub fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn channel(&self, index: usize) -> Arc<FakeChannel> {
        self.channels.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Transport for Arc<FakeBroker> {
    async fn connect(
        &self,
        config: &AmqpConfig,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::with_trace(
                "connection refused",
                "IOError(ConnectionRefused)",
            ));
        }
        self.record(format!("connect {}", config.uri));
        let conn = Arc::new(FakeConnection {
            broker: self.clone(),
            observers: Observers::default(),
        });
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

pub(crate) struct FakeConnection {
    broker: Arc<FakeBroker>,
    pub observers: Observers,
}

impl FakeConnection {
    pub fn emit(&self, event: TransportEvent) {
        self.observers.emit(&event);
    }
}

#[async_trait]
impl TransportConnection for FakeConnection {
    async fn create_channel(
        &self,
        confirm: bool,
    ) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let id = self.broker.next_channel.fetch_add(1, Ordering::SeqCst);
        self.broker
            .record(format!("channel.open {id} confirm={confirm}"));
        let channel = Arc::new(FakeChannel {
            id,
            confirm,
            broker: self.broker.clone(),
            observers: Observers::default(),
        });
        self.broker.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.record("connection.close".to_owned());
        if self.broker.hang_connection_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn observe(&self, observer: Observer) -> ObserverId {
        self.observers.add(observer)
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(id)
    }
}

pub(crate) struct FakeChannel {
    id: u64,
    confirm: bool,
    broker: Arc<FakeBroker>,
    pub observers: Observers,
}

impl FakeChannel {
    pub fn emit(&self, event: TransportEvent) {
        self.observers.emit(&event);
    }
}

#[async_trait]
impl TransportChannel for FakeChannel {
    fn is_confirm(&self) -> bool {
        self.confirm
    }

    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.broker.record(format!("prefetch {} {count}", self.id));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), TransportError> {
        self.broker
            .record(format!("publish {} {exchange} {routing_key}", self.id));
        self.broker.published.lock().unwrap().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            headers: headers.clone(),
        });
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<(), TransportError> {
        self.broker.record(format!("confirms {}", self.id));
        if self.broker.hang_confirms.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        sink: DeliverySink,
    ) -> Result<String, TransportError> {
        let tag = options.consumer_tag.clone().unwrap_or_else(|| {
            format!("ctag-{}", self.broker.next_tag.fetch_add(1, Ordering::SeqCst))
        });
        self.broker
            .record(format!("consume {} {queue} {tag}", self.id));

        if self.broker.hold_consume.load(Ordering::SeqCst) {
            self.broker.consume_gate.notified().await;
        }

        let early = self.broker.early_delivery.lock().unwrap().take();
        if let Some(delivery) = early {
            sink(Some(delivery));
        }

        self.broker.sinks.lock().unwrap().insert(tag.clone(), sink);
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.broker.record(format!("cancel {consumer_tag}"));
        if self.broker.hang_cancel.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.broker.fail_cancel.load(Ordering::SeqCst) {
            return Err(TransportError::new("unknown consumer tag"));
        }
        self.broker.sinks.lock().unwrap().remove(consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let delay = self.broker.ack_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.broker.fail_ack.load(Ordering::SeqCst) {
            return Err(TransportError::new("channel is closing"));
        }
        self.broker.record(format!("ack {delivery_tag}"));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.broker
            .record(format!("reject {delivery_tag} requeue={requeue}"));
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, TransportError> {
        if self.broker.fail_declare.load(Ordering::SeqCst) {
            return Err(TransportError::new("access refused"));
        }
        let name = if def.name().is_empty() {
            "amq.gen-reply".to_owned()
        } else {
            def.name().to_owned()
        };
        self.broker.record(format!(
            "declare {name} exclusive={} auto_delete={}",
            def.is_exclusive(),
            def.is_auto_delete()
        ));
        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), TransportError> {
        if self.broker.fail_bind.load(Ordering::SeqCst) {
            return Err(TransportError::new("exchange not found"));
        }
        self.broker.record(format!(
            "bind {} {} {}",
            binding.queue_name(),
            binding.exchange_name(),
            binding.key()
        ));
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.broker.record(format!("delete {queue}"));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.record(format!("channel.close {}", self.id));
        if self.broker.hang_channel_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn observe(&self, observer: Observer) -> ObserverId {
        self.observers.add(observer)
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(id)
    }
}

pub(crate) fn config() -> AmqpConfig {
    AmqpConfig::new("amqp://fake:5672")
}

pub(crate) fn delivery(delivery_tag: u64) -> RawDelivery {
    RawDelivery {
        exchange: "events".to_owned(),
        routing_key: "user.created".to_owned(),
        delivery_tag,
        redelivered: false,
        headers: Headers::new(),
        body: b"{\"id\":1}".to_vec(),
    }
}

pub(crate) fn delivery_with_count(delivery_tag: u64, count: &str) -> RawDelivery {
    let mut raw = delivery(delivery_tag);
    raw.headers.insert(
        crate::message::REDELIVERED_COUNT_HEADER.to_owned(),
        HeaderValue::String(count.to_owned()),
    );
    raw
}

/// A handler that forwards every message it receives and succeeds.
pub(crate) fn capture() -> (impl MessageHandler, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            Ok::<(), HandlerError>(())
        }
    };
    (handler, rx)
}
