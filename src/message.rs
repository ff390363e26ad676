// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivered Messages
//!
//! A [`Message`] wraps one delivery together with the consumer it arrived on. Its
//! status starts as [`MessageStatus::NonAcked`] and exactly one of `ack`, `dequeue` or
//! `requeue` may move it to a terminal status; any later attempt fails with
//! [`AmqpError::InvalidState`].
//!
//! `redeliver` republishes a copy with the `x-redelivered-count` header incremented and
//! leaves the status alone. The usual retry pattern is `redeliver()` followed by
//! `ack()` while the count is below a maximum, `dequeue()` afterwards (see
//! [`Retrying`](crate::retry::Retrying)).

use crate::{
    consumer::Consumer,
    errors::{AmqpError, Level},
    transport::{HeaderValue, Headers, RawDelivery},
};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Header carrying how many times a message was redelivered through
/// [`Message::redeliver`].
pub const REDELIVERED_COUNT_HEADER: &str = "x-redelivered-count";

/// Settlement status of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    NonAcked,
    Acked,
    Dequeued,
    Requeued,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageStatus::NonAcked => "non-acked",
            MessageStatus::Acked => "acked",
            MessageStatus::Dequeued => "dequeued",
            MessageStatus::Requeued => "requeued",
        };
        f.write_str(name)
    }
}

/// A message delivered to a [`Consumer`].
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

struct MessageInner {
    delivery: RawDelivery,
    consumer: Consumer,
    status: Mutex<MessageStatus>,
    // held across the transport call so settlements run one at a time
    settling: AsyncMutex<()>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("exchange", &self.exchange())
            .field("routing_key", &self.routing_key())
            .field("delivery_tag", &self.delivery_tag())
            .field("status", &self.status())
            .finish()
    }
}

impl Message {
    pub(crate) fn new(delivery: RawDelivery, consumer: Consumer) -> Self {
        Message {
            inner: Arc::new(MessageInner {
                delivery,
                consumer,
                status: Mutex::new(MessageStatus::NonAcked),
                settling: AsyncMutex::new(()),
            }),
        }
    }

    /// Exchange the message was published to.
    pub fn exchange(&self) -> &str {
        &self.inner.delivery.exchange
    }

    /// Routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.inner.delivery.routing_key
    }

    /// Broker-assigned tag identifying this delivery on its channel.
    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery.delivery_tag
    }

    /// Headers the message was published with.
    pub fn headers(&self) -> &Headers {
        &self.inner.delivery.headers
    }

    /// Opaque payload of the message.
    pub fn body(&self) -> &[u8] {
        &self.inner.delivery.body
    }

    /// The broker's own redelivery flag.
    pub fn redelivered(&self) -> bool {
        self.inner.delivery.redelivered
    }

    /// Number of times this message went through [`Message::redeliver`], read from the
    /// `x-redelivered-count` header. Defaults to 0.
    pub fn redelivered_count(&self) -> u32 {
        self.headers()
            .get(REDELIVERED_COUNT_HEADER)
            .and_then(HeaderValue::as_int)
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or(0)
    }

    /// The consumer this message was delivered to.
    pub fn consumer(&self) -> &Consumer {
        &self.inner.consumer
    }

    /// Current settlement status.
    pub fn status(&self) -> MessageStatus {
        *self.slot()
    }

    fn slot(&self) -> MutexGuard<'_, MessageStatus> {
        self.inner.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acknowledges the message.
    ///
    /// Settlements are serialized: a call made while another one is talking to the
    /// broker waits for it and then sees its final status. A failed transport call
    /// leaves the message `NonAcked`, so it can be settled again.
    ///
    /// # Returns
    /// `AmqpError::InvalidState` when the message was already settled, or the
    /// transport failure
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.settle("ack", MessageStatus::Acked).await
    }

    /// Rejects the message without requeue, dropping it from the queue.
    ///
    /// Follows the same settlement rules as [`Message::ack`].
    pub async fn dequeue(&self) -> Result<(), AmqpError> {
        self.settle("dequeue", MessageStatus::Dequeued).await
    }

    /// Rejects the message with requeue, returning it to the queue.
    ///
    /// Follows the same settlement rules as [`Message::ack`].
    pub async fn requeue(&self) -> Result<(), AmqpError> {
        self.settle("requeue", MessageStatus::Requeued).await
    }

    /// Requeues the message unless it was already settled.
    pub async fn try_requeue(&self) -> Result<(), AmqpError> {
        match self.requeue().await {
            Err(AmqpError::InvalidState { .. }) => Ok(()),
            result => result,
        }
    }

    /// Publishes a copy of this message to its original exchange and routing key with
    /// the redelivered count incremented, waiting for the broker confirmation on
    /// confirm channels. The status of this message is not changed.
    pub async fn redeliver(&self) -> Result<(), AmqpError> {
        let channel = self
            .inner
            .consumer
            .channel()
            .ok_or(AmqpError::ChannelDropped)?;

        let count = self.redelivered_count() + 1;
        let mut headers = self.headers().clone();
        headers.insert(
            REDELIVERED_COUNT_HEADER.to_owned(),
            HeaderValue::String(count.to_string()),
        );

        debug!(
            exchange = self.exchange(),
            routing_key = self.routing_key(),
            count,
            "redelivering message"
        );
        channel
            .publish(self.exchange(), self.routing_key(), self.body(), headers)
            .await
    }

    async fn settle(&self, operation: &'static str, next: MessageStatus) -> Result<(), AmqpError> {
        let _settling = self.inner.settling.lock().await;
        {
            let mut status = self.slot();
            if *status != MessageStatus::NonAcked {
                return Err(AmqpError::InvalidState {
                    operation,
                    status: *status,
                });
            }
            *status = next;
        }

        let transport = self.inner.consumer.transport();
        let delivery_tag = self.delivery_tag();
        let result = match next {
            MessageStatus::Acked => transport.ack(delivery_tag).await,
            MessageStatus::Dequeued => transport.reject(delivery_tag, false).await,
            MessageStatus::Requeued => transport.reject(delivery_tag, true).await,
            MessageStatus::NonAcked => Ok(()),
        };

        if let Err(err) = result {
            *self.slot() = MessageStatus::NonAcked;
            return Err(AmqpError::transport(Level::Message, operation, err));
        }

        Ok(())
    }
}
