// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! A [`Channel`] wraps one transport channel. It publishes messages (waiting for the
//! broker confirmation in confirm mode), starts [`Consumer`]s, sets up RPC reply queues
//! whose lifetime is tied to their consumer, and closes gracefully by cancelling its
//! consumers before closing the transport channel.

use crate::{
    completion::{outcome_from, Lifecycle},
    config::ShutdownTimeouts,
    connection::{Connection, ConnectionInner},
    consumer::Consumer,
    errors::{AmqpError, Level},
    handler::MessageHandler,
    otel,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        ConsumeOptions, DeliverySink, Headers, ObserverGuard, TransportChannel, TransportError,
        TransportEvent,
    },
};
use futures_util::future::join_all;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
};
use tokio::{runtime::Handle, sync::oneshot};
use tracing::{debug, error, info, warn};

/// A logical session on a connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    connection: Weak<ConnectionInner>,
    transport: Arc<dyn TransportChannel>,
    consumers: Mutex<Vec<Consumer>>,
    lifecycle: Lifecycle,
    timeouts: ShutdownTimeouts,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("confirm", &self.is_confirm())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        connection: Weak<ConnectionInner>,
        transport: Arc<dyn TransportChannel>,
        timeouts: ShutdownTimeouts,
    ) -> Self {
        let inner = Arc::new(ChannelInner {
            connection,
            transport,
            consumers: Mutex::new(vec![]),
            lifecycle: Lifecycle::new(),
            timeouts,
        });

        let weak = Arc::downgrade(&inner);
        let runtime = Handle::current();
        inner.transport.observe(Arc::new(move |event: &TransportEvent| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event {
                TransportEvent::Closed { had_error } => {
                    warn!(had_error, "channel closed by peer");
                    inner.lifecycle.mark_dying();
                    let reason = AmqpError::ChannelClosed {
                        had_error: *had_error,
                    };
                    inner.lifecycle.settle(Err(reason.clone()));

                    let channel = Channel::from_inner(inner);
                    runtime.spawn(async move { channel.cancel_consumers(Some(reason)).await });
                }
                TransportEvent::Error(err) => {
                    error!(error = err.to_string(), "channel error");
                    let channel = Channel::from_inner(inner);
                    let reason = AmqpError::Notified {
                        level: Level::Channel,
                        source: err.clone(),
                    };
                    runtime.spawn(async move { channel.close(Some(reason)).await });
                }
            }
        }));

        Channel { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Channel { inner }
    }

    /// Reports whether the channel still accepts publishes and new consumers.
    pub fn is_open(&self) -> bool {
        self.inner.lifecycle.is_open()
    }

    /// Whether the channel was opened in publisher confirm mode.
    pub fn is_confirm(&self) -> bool {
        self.inner.transport.is_confirm()
    }

    /// The connection this channel belongs to, while it is still alive.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connection.upgrade().map(Connection::from_inner)
    }

    /// Every consumer started on this channel, including settled ones.
    pub fn consumers(&self) -> Vec<Consumer> {
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits until the channel has closed and returns how it ended.
    ///
    /// # Returns
    /// `Ok(())` for a plain close, otherwise the close reason, the peer close or the
    /// deadline that settled it
    pub async fn closed(&self) -> Result<(), AmqpError> {
        self.inner.lifecycle.wait().await
    }

    /// Closes the channel: cancels every consumer concurrently, waits for outstanding
    /// confirms in confirm mode, then closes the transport channel. Bounded by the
    /// channel close deadline.
    ///
    /// Idempotent. Never fails; the outcome is available from [`Channel::closed`].
    ///
    /// # Parameters
    /// * `reason` - Failure to settle with, passed on to every consumer
    pub async fn close(&self, reason: Option<AmqpError>) {
        otel::timed("channel.close", async {
            if self.inner.lifecycle.begin_shutdown() {
                info!("closing channel");
                let deadline = self.inner.timeouts.channel_close();
                self.inner
                    .lifecycle
                    .arm_deadline(deadline, AmqpError::ChannelCloseTimeout(deadline));

                let channel = self.clone();
                tokio::spawn(async move { channel.shutdown(reason).await });
            }

            if let Err(err) = self.inner.lifecycle.wait().await {
                debug!(error = err.to_string(), "channel closed with failure");
            }
        })
        .await
    }

    async fn shutdown(self, reason: Option<AmqpError>) {
        self.cancel_consumers(reason.clone()).await;

        if self.inner.transport.is_confirm() {
            if let Err(err) = self.inner.transport.wait_for_confirms().await {
                warn!(error = err.to_string(), "failure waiting for publish confirms");
            }
        }

        if let Err(err) = self.inner.transport.close().await {
            warn!(error = err.to_string(), "failure to close the channel");
        }

        if self.inner.lifecycle.settle(outcome_from(reason)) {
            debug!("channel closed");
        }
    }

    async fn cancel_consumers(&self, reason: Option<AmqpError>) {
        let consumers = self.consumers();
        join_all(consumers.iter().map(|c| c.cancel(reason.clone()))).await;
    }

    /// Limits the number of unacknowledged deliveries the broker hands this channel.
    ///
    /// # Parameters
    /// * `count` - Maximum number of unacknowledged deliveries
    pub async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.inner.transport.prefetch(count).await.map_err(|err| {
            error!(error = err.to_string(), count, "failure to configure qos");
            AmqpError::transport(Level::Channel, "configure prefetch", err)
        })
    }

    /// Publishes a persistent message. In confirm mode, returns once the broker
    /// confirmed it. A channel error notified while the call is in flight fails it.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `body` - Opaque payload
    /// * `headers` - Message headers; the current trace context is added to them
    ///
    /// # Returns
    /// Ok(()) once sent (and confirmed in confirm mode) or the transport failure
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: Headers,
    ) -> Result<(), AmqpError> {
        otel::timed("channel.publish", async {
            let mut headers = headers;
            otel::inject_context(&mut headers);

            let (tx, rx) = oneshot::channel::<TransportError>();
            let tx = Mutex::new(Some(tx));
            let _observer = ObserverGuard::new(
                self.inner.transport.clone(),
                Arc::new(move |event: &TransportEvent| {
                    if let TransportEvent::Error(err) = event {
                        let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                        if let Some(sender) = sender {
                            let _ = sender.send(err.clone());
                        }
                    }
                }),
            );

            let result = tokio::select! {
                result = self.send(exchange, routing_key, body, &headers) => result,
                Ok(err) = rx => Err(err),
            };

            result.map_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                AmqpError::transport(Level::Channel, "publish", err)
            })
        })
        .await
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), TransportError> {
        self.inner
            .transport
            .publish(exchange, routing_key, body, headers)
            .await?;

        if self.inner.transport.is_confirm() {
            self.inner.transport.wait_for_confirms().await?;
        }

        Ok(())
    }

    /// Starts consuming `queue`, dispatching every delivery to `handler`.
    ///
    /// A subscription that completes after the channel started closing is cancelled
    /// again instead of being handed out.
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to consume from
    /// * `handler` - Invoked once per delivery on its own task
    /// * `options` - Consumer tag, exclusivity and no-local flags
    ///
    /// # Returns
    /// The running consumer, or `AmqpError::NotOpen` when the channel is closing
    pub async fn consume<H>(
        &self,
        queue: &str,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<Consumer, AmqpError>
    where
        H: MessageHandler + 'static,
    {
        if !self.is_open() {
            return Err(AmqpError::NotOpen(Level::Channel));
        }

        let consumer = Consumer::new(
            Arc::downgrade(&self.inner),
            self.inner.transport.clone(),
            queue,
            Arc::new(handler),
            self.inner.timeouts.clone(),
        );

        let target = consumer.clone();
        let sink: DeliverySink = Arc::new(move |delivery| target.deliver(delivery));

        let tag = match self.inner.transport.consume(queue, &options, sink).await {
            Ok(tag) => tag,
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                let err = AmqpError::transport(Level::Consumer, "consume", err);
                consumer.abandon(err.clone());
                return Err(err);
            }
        };
        consumer.set_tag(tag);

        // checked under the lock so a concurrent close either sees this consumer in its
        // snapshot or this call sees the channel closing
        let admitted = {
            let mut consumers = self
                .inner
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let open = self.is_open();
            if open {
                consumers.push(consumer.clone());
            }
            open
        };

        if !admitted {
            warn!(queue, "channel closed while subscribing, cancelling consumer");
            let err = AmqpError::NotOpen(Level::Channel);
            consumer.cancel(Some(err.clone())).await;
            return Err(err);
        }

        Ok(consumer)
    }

    /// Serves requests arriving on `exchange` under `routing_key` through an exclusive,
    /// auto-deleted queue. The queue is deleted once the returned consumer settles, or
    /// right away if the setup fails.
    ///
    /// # Parameters
    /// * `exchange` - Exchange the requests are published to
    /// * `queue` - Reply queue name, empty to let the broker generate one
    /// * `routing_key` - Binding key for the requests
    /// * `handler` - Serves each request
    ///
    /// # Returns
    /// The consumer of the reply queue
    pub async fn handle_rpc<H>(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        handler: H,
    ) -> Result<Consumer, AmqpError>
    where
        H: MessageHandler + 'static,
    {
        let mut declared = queue.to_owned();
        let started = async {
            let def = QueueDefinition::new(queue).exclusive().delete();
            declared = self
                .inner
                .transport
                .declare_queue(&def)
                .await
                .map_err(|err| AmqpError::transport(Level::Channel, "declare queue", err))?;

            let binding = QueueBinding::new(&declared)
                .exchange(exchange)
                .routing_key(routing_key);
            self.inner
                .transport
                .bind_queue(&binding)
                .await
                .map_err(|err| AmqpError::transport(Level::Channel, "bind queue", err))?;

            self.consume(&declared, handler, ConsumeOptions::default())
                .await
        }
        .await;

        match started {
            Ok(consumer) => {
                debug!(queue = declared, exchange, routing_key, "rpc handler started");
                let channel = self.clone();
                let watched = consumer.clone();
                tokio::spawn(async move {
                    if let Err(err) = watched.closed().await {
                        debug!(error = err.to_string(), "rpc consumer ended with failure");
                    }
                    channel.delete_queue(&declared).await;
                });
                Ok(consumer)
            }
            Err(err) => {
                error!(error = err.to_string(), queue = declared, "failure to start rpc handler");
                self.delete_queue(&declared).await;
                Err(err)
            }
        }
    }

    async fn delete_queue(&self, queue: &str) {
        match self.inner.transport.delete_queue(queue).await {
            Ok(()) => debug!(queue, "rpc queue deleted"),
            Err(err) => warn!(error = err.to_string(), queue, "failure to delete rpc queue"),
        }
    }
}
