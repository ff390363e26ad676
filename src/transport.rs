// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! The lifecycle layer never speaks the AMQP wire protocol itself. Everything it needs
//! from the broker goes through the traits in this module: [`Transport`] opens
//! connections, [`TransportConnection`] opens channels and [`TransportChannel`] carries
//! the per-channel primitives (publish, consume, ack, queue management).
//!
//! Connections and channels report broker-initiated close and error notifications to
//! the observers registered through `observe`. The production implementation lives in
//! [`crate::lapin_transport`].

use crate::{
    config::AmqpConfig,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use thiserror::Error;

/// Message header map.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A header value carried by a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// Reads the value as an integer, parsing string values.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::String(v) => v.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::String(v) => f.write_str(v),
            HeaderValue::Int(v) => write!(f, "{v}"),
            HeaderValue::Bool(v) => write!(f, "{v}"),
            HeaderValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// A failure reported by the transport, with the transport's own diagnostic rendering
/// when one was captured.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    message: String,
    trace: Option<String>,
}

impl TransportError {
    /// Creates an error without a diagnostic trace.
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
            trace: None,
        }
    }

    /// Creates an error carrying the transport's own rendering of the failure.
    pub fn with_trace(message: impl Into<String>, trace: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
            trace: Some(trace.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}

/// A message as delivered by the broker.
#[derive(Debug, Clone, Default)]
pub struct RawDelivery {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Receives every delivery of one subscription; `None` signals that the broker
/// canceled the subscription.
pub type DeliverySink = Arc<dyn Fn(Option<RawDelivery>) + Send + Sync>;

/// Options for a queue subscription.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub consumer_tag: Option<String>,
    pub exclusive: bool,
    pub no_local: bool,
}

/// Notification emitted by a connection or channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Closed { had_error: bool },
    Error(TransportError),
}

pub type Observer = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// Registry of event observers shared by transport implementations.
#[derive(Default)]
pub struct Observers {
    next: AtomicU64,
    entries: Mutex<BTreeMap<ObserverId, Observer>>,
}

impl Observers {
    /// Registers `observer` and returns the id to remove it with.
    pub fn add(&self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id, observer);
        }
        id
    }

    pub fn remove(&self, id: ObserverId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every registered observer. Observers run outside the registry lock, so
    /// they may add or remove observers themselves.
    pub fn emit(&self, event: &TransportEvent) {
        let snapshot: Vec<Observer> = match self.entries.lock() {
            Ok(entries) => entries.values().cloned().collect(),
            Err(_) => return,
        };
        for observer in snapshot {
            observer(event);
        }
    }
}

/// Opens broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        config: &AmqpConfig,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}

/// A live broker connection.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self, confirm: bool)
        -> Result<Arc<dyn TransportChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn observe(&self, observer: Observer) -> ObserverId;

    fn unobserve(&self, id: ObserverId);
}

/// A live channel on a broker connection.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Whether the channel was opened in confirm mode.
    fn is_confirm(&self) -> bool;

    async fn prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Sends a persistent message. Does not wait for the broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), TransportError>;

    /// Waits until every outstanding publish on the channel is confirmed.
    async fn wait_for_confirms(&self) -> Result<(), TransportError>;

    /// Starts a subscription and returns the broker-issued consumer tag. Deliveries
    /// may reach `sink` before this call returns.
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        sink: DeliverySink,
    ) -> Result<String, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Declares a queue and returns its name, which the broker generates when the
    /// definition's name is empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, TransportError>;

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), TransportError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn observe(&self, observer: Observer) -> ObserverId;

    fn unobserve(&self, id: ObserverId);
}

/// Removes a channel observer when dropped.
pub(crate) struct ObserverGuard {
    channel: Arc<dyn TransportChannel>,
    id: ObserverId,
}

impl ObserverGuard {
    pub(crate) fn new(channel: Arc<dyn TransportChannel>, observer: Observer) -> Self {
        let id = channel.observe(observer);
        ObserverGuard { channel, id }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.channel.unobserve(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn removed_observers_stop_receiving_events() {
        let observers = Observers::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let id = observers.add(Arc::new(move |_: &TransportEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        observers.emit(&TransportEvent::Closed { had_error: false });
        observers.remove(id);
        observers.emit(&TransportEvent::Closed { had_error: false });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn header_counts_parse_from_strings() {
        assert_eq!(HeaderValue::String("3".into()).as_int(), Some(3));
        assert_eq!(HeaderValue::Int(7).as_int(), Some(7));
        assert_eq!(HeaderValue::String("x".into()).as_int(), None);
        assert_eq!(HeaderValue::Bool(true).as_int(), None);
    }
}
