// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! A [`Consumer`] owns one queue subscription on one channel. Every delivery is wrapped
//! as a [`Message`] and handed to the consumer's handler on its own task; the set of
//! in-flight handler invocations is tracked so that cancellation can wait for them.
//!
//! The consumer moves `open → cancelling → closed`. Dispatch is fail-fast: a handler
//! error rejects its message without requeue and cancels the whole consumer.

use crate::{
    channel::{Channel, ChannelInner},
    completion::{outcome_from, Lifecycle},
    config::ShutdownTimeouts,
    errors::AmqpError,
    handler::MessageHandler,
    message::Message,
    otel,
    transport::{RawDelivery, TransportChannel},
};
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
};
use std::{
    borrow::Cow,
    collections::BTreeSet,
    fmt,
    sync::{Arc, Weak},
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, error, info, warn};

/// A standing subscription delivering messages from one queue to a handler.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    queue: String,
    channel: Weak<ChannelInner>,
    transport: Arc<dyn TransportChannel>,
    handler: Arc<dyn MessageHandler>,
    tag: watch::Sender<Option<String>>,
    pending: watch::Sender<BTreeSet<u64>>,
    lifecycle: Lifecycle,
    timeouts: ShutdownTimeouts,
    runtime: Handle,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.inner.queue)
            .field("tag", &self.tag())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Consumer {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        transport: Arc<dyn TransportChannel>,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        timeouts: ShutdownTimeouts,
    ) -> Self {
        let (tag, _) = watch::channel(None);
        let (pending, _) = watch::channel(BTreeSet::new());
        Consumer {
            inner: Arc::new(ConsumerInner {
                queue: queue.to_owned(),
                channel,
                transport,
                handler,
                tag,
                pending,
                lifecycle: Lifecycle::new(),
                timeouts,
                runtime: Handle::current(),
            }),
        }
    }

    /// Name of the queue this consumer subscribes to.
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// The broker-issued consumer tag, unset until the subscription is acknowledged.
    pub fn tag(&self) -> Option<String> {
        self.inner.tag.borrow().clone()
    }

    /// Reports whether the consumer still dispatches deliveries.
    ///
    /// # Returns
    /// `false` once a cancel started, from the caller, a handler failure, the broker
    /// or a closing parent
    pub fn is_open(&self) -> bool {
        self.inner.lifecycle.is_open()
    }

    /// Number of handler invocations still running.
    pub fn pending(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// The channel this consumer was started on, while it is still alive.
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade().map(Channel::from_inner)
    }

    /// Waits until the consumer has been cancelled and returns how it ended.
    ///
    /// # Returns
    /// `Ok(())` for a plain cancel, otherwise the cancel reason or the deadline that
    /// settled it
    pub async fn closed(&self) -> Result<(), AmqpError> {
        self.inner.lifecycle.wait().await
    }

    /// Cancels the consumer: waits (bounded) for in-flight handlers, cancels the
    /// broker subscription (bounded), then settles with `reason` or success.
    ///
    /// Idempotent. Never fails; the outcome is available from [`Consumer::closed`].
    ///
    /// # Parameters
    /// * `reason` - Failure to settle with instead of success
    pub async fn cancel(&self, reason: Option<AmqpError>) {
        otel::timed("consumer.cancel", async {
            if self.inner.lifecycle.begin_shutdown() {
                info!(queue = self.inner.queue, tag = self.tag(), "cancelling consumer");
                let consumer = self.clone();
                self.inner
                    .runtime
                    .spawn(async move { consumer.shutdown(reason).await });
            }

            if let Err(err) = self.inner.lifecycle.wait().await {
                debug!(queue = self.inner.queue, error = err.to_string(), "consumer closed with failure");
            }
        })
        .await
    }

    async fn shutdown(self, reason: Option<AmqpError>) {
        let drain = self.inner.timeouts.handler_drain();
        let mut pending = self.inner.pending.subscribe();
        if tokio::time::timeout(drain, pending.wait_for(|set| set.is_empty()))
            .await
            .is_err()
        {
            warn!(
                queue = self.inner.queue,
                pending = self.pending(),
                "handlers still running after the drain deadline"
            );
        }

        let deadline = self.inner.timeouts.consumer_cancel();
        self.inner
            .lifecycle
            .arm_deadline(deadline, AmqpError::CancelTimeout(deadline));

        let mut tag_rx = self.inner.tag.subscribe();
        let tag = match tokio::time::timeout(deadline, tag_rx.wait_for(Option::is_some)).await {
            Ok(Ok(tag)) => (*tag).clone(),
            _ => None,
        };

        match tag {
            Some(tag) => {
                if let Err(err) = self.inner.transport.cancel(&tag).await {
                    warn!(
                        error = err.to_string(),
                        queue = self.inner.queue,
                        tag,
                        "failure to cancel broker subscription"
                    );
                }
            }
            None => warn!(queue = self.inner.queue, "no consumer tag assigned, skipping broker cancel"),
        }

        if self.inner.lifecycle.settle(outcome_from(reason)) {
            debug!(queue = self.inner.queue, "consumer cancelled");
        }
    }

    pub(crate) fn set_tag(&self, tag: String) {
        debug!(queue = self.inner.queue, tag, "consumer subscribed");
        self.inner.tag.send_replace(Some(tag));
    }

    /// Settles a consumer whose subscription never started.
    pub(crate) fn abandon(&self, err: AmqpError) {
        self.inner.lifecycle.mark_dying();
        self.inner.lifecycle.settle(Err(err));
    }

    pub(crate) fn transport(&self) -> Arc<dyn TransportChannel> {
        self.inner.transport.clone()
    }

    /// Entry point for the transport's delivery callback. `None` means the broker
    /// canceled the subscription.
    pub(crate) fn deliver(&self, delivery: Option<RawDelivery>) {
        if self.inner.tag.borrow().is_none() {
            if self.inner.lifecycle.completion().is_settled() {
                warn!(queue = self.inner.queue, "dropping delivery for a consumer that never subscribed");
                return;
            }
            // the subscribe-ok has not been processed yet, try again on the next turn
            let consumer = self.clone();
            self.inner.runtime.spawn(async move {
                tokio::task::yield_now().await;
                consumer.deliver(delivery);
            });
            return;
        }

        let Some(delivery) = delivery else {
            warn!(queue = self.inner.queue, tag = self.tag(), "consumer canceled by broker");
            let consumer = self.clone();
            let reason = AmqpError::ConsumerCanceled(self.inner.queue.clone());
            self.inner
                .runtime
                .spawn(async move { consumer.cancel(Some(reason)).await });
            return;
        };

        self.dispatch(delivery);
    }

    fn dispatch(&self, delivery: RawDelivery) {
        let delivery_tag = delivery.delivery_tag;
        self.inner.pending.send_modify(|set| {
            set.insert(delivery_tag);
        });

        let message = Message::new(delivery, self.clone());
        let consumer = self.clone();
        self.inner
            .runtime
            .spawn(async move { consumer.run_handler(message).await });
    }

    async fn run_handler(self, message: Message) {
        debug!(
            queue = self.inner.queue,
            exchange = message.exchange(),
            routing_key = message.routing_key(),
            "received message"
        );

        let tracer = global::tracer("amqp consumer");
        let (ctx, span) = otel::new_span(message.headers(), &tracer, &self.inner.queue);
        let cx = ctx.with_span(span);

        let result = self.inner.handler.handle(message.clone()).await;

        self.inner.pending.send_modify(|set| {
            set.remove(&message.delivery_tag());
        });

        match result {
            Ok(()) => cx.span().set_status(Status::Ok),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.inner.queue,
                    delivery_tag = message.delivery_tag(),
                    "handler failure, cancelling consumer"
                );
                cx.span().record_error(&*err);
                cx.span().set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });

                if let Err(reject_err) = message.dequeue().await {
                    warn!(error = reject_err.to_string(), "failure to reject message");
                }

                let reason = AmqpError::handler(&self.inner.queue, err);
                self.cancel(Some(reason)).await;
            }
        }
        cx.span().end();
    }
}
