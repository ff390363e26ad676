// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! [`Connection`] is the root of the connection → channel → consumer hierarchy. It opens
//! the transport connection, hands out [`Channel`]s and closes gracefully: every channel
//! is closed concurrently before the transport connection itself, and the whole shutdown
//! is bounded by the connection close deadline.

use crate::{
    channel::Channel,
    completion::{outcome_from, Lifecycle},
    config::AmqpConfig,
    errors::{AmqpError, Level},
    lapin_transport::LapinTransport,
    otel,
    transport::{Transport, TransportConnection, TransportEvent},
};
use futures_util::future::join_all;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// A broker connection and the channels opened on it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    config: AmqpConfig,
    transport: Arc<dyn TransportConnection>,
    channels: Mutex<Vec<Channel>>,
    lifecycle: Lifecycle,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.inner.config.uri)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Opens a connection to `config.uri` through the lapin transport.
    ///
    /// # Parameters
    /// * `config` - Broker URI, connection name, timeouts and prefetch
    ///
    /// # Returns
    /// The open connection, or the configuration or connect failure
    pub async fn connect(config: &AmqpConfig) -> Result<Connection, AmqpError> {
        Self::open(config, &LapinTransport).await
    }

    /// Opens a connection through the given transport and starts observing its close
    /// and error notifications.
    ///
    /// # Parameters
    /// * `config` - Validated before anything is sent to the transport
    /// * `transport` - The AMQP client implementation to connect with
    pub async fn open(config: &AmqpConfig, transport: &dyn Transport) -> Result<Connection, AmqpError> {
        otel::timed("connection.open", async {
            config.validate()?;

            debug!(uri = config.uri, "creating amqp connection...");
            let conn = transport.connect(config).await.map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError {
                    uri: config.uri.clone(),
                    source: err,
                }
            })?;
            debug!("amqp connected");

            let inner = Arc::new(ConnectionInner {
                config: config.clone(),
                transport: conn,
                channels: Mutex::new(vec![]),
                lifecycle: Lifecycle::new(),
            });

            let weak = Arc::downgrade(&inner);
            let runtime = Handle::current();
            inner.transport.observe(Arc::new(move |event: &TransportEvent| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    TransportEvent::Closed { had_error } => {
                        warn!(had_error, "connection closed by peer");
                        inner.lifecycle.mark_dying();
                        inner.lifecycle.settle(Err(AmqpError::ConnectionClosed));

                        // the peer is gone, only the channels are left to settle
                        let connection = Connection::from_inner(inner);
                        runtime.spawn(async move {
                            connection
                                .close_channels(Some(AmqpError::ConnectionClosed))
                                .await
                        });
                    }
                    TransportEvent::Error(err) => {
                        error!(error = err.to_string(), "connection error");
                        let connection = Connection::from_inner(inner);
                        let reason = AmqpError::Notified {
                            level: Level::Connection,
                            source: err.clone(),
                        };
                        runtime.spawn(async move { connection.close(Some(reason)).await });
                    }
                }
            }));

            Ok::<_, AmqpError>(Connection { inner })
        })
        .await
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Connection { inner }
    }

    /// Returns the broker URI this connection was opened with.
    pub fn uri(&self) -> &str {
        &self.inner.config.uri
    }

    /// Returns the configuration this connection was opened with.
    pub fn config(&self) -> &AmqpConfig {
        &self.inner.config
    }

    /// Reports whether the connection is still usable.
    ///
    /// # Returns
    /// `false` once a close started, the peer closed it, or its outcome settled
    pub fn is_open(&self) -> bool {
        self.inner.lifecycle.is_open()
    }

    /// Every channel opened on this connection, including closed ones.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits until the connection has closed and returns how it ended.
    ///
    /// # Returns
    /// `Ok(())` for a plain close, otherwise the close reason, the peer close or the
    /// deadline that settled it
    pub async fn closed(&self) -> Result<(), AmqpError> {
        self.inner.lifecycle.wait().await
    }

    /// Opens a channel on this connection.
    ///
    /// The configured prefetch is applied to the new channel. A channel whose
    /// connection starts closing while it is being opened is closed again right away.
    ///
    /// # Parameters
    /// * `confirm` - Opens the channel in publisher confirm mode
    ///
    /// # Returns
    /// The new channel, or `AmqpError::NotOpen` when the connection is closing
    pub async fn open_channel(&self, confirm: bool) -> Result<Channel, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::NotOpen(Level::Connection));
        }

        debug!(confirm, "creating amqp channel...");
        let transport = self
            .inner
            .transport
            .create_channel(confirm)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the channel");
                AmqpError::transport(Level::Connection, "open channel", err)
            })?;

        let channel = Channel::new(
            Arc::downgrade(&self.inner),
            transport,
            self.inner.config.timeouts.clone(),
        );

        if let Some(count) = self.inner.config.prefetch {
            if let Err(err) = channel.prefetch(count).await {
                channel.close(Some(err.clone())).await;
                return Err(err);
            }
        }

        // checked under the lock so a concurrent close either sees this channel in its
        // snapshot or this call sees the connection closing
        let admitted = {
            let mut channels = self
                .inner
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let open = self.is_open();
            if open {
                channels.push(channel.clone());
            }
            open
        };

        if !admitted {
            warn!("connection closed while opening a channel");
            let err = AmqpError::NotOpen(Level::Connection);
            channel.close(Some(err.clone())).await;
            return Err(err);
        }

        debug!("channel created");
        Ok(channel)
    }

    /// Closes every channel concurrently, then the transport connection. Bounded by the
    /// connection close deadline; `reason`, when given, becomes the completion's failure.
    ///
    /// Idempotent. Never fails; the outcome is available from [`Connection::closed`].
    pub async fn close(&self, reason: Option<AmqpError>) {
        otel::timed("connection.close", async {
            if self.inner.lifecycle.begin_shutdown() {
                info!(uri = self.inner.config.uri, "closing connection");
                let deadline = self.inner.config.timeouts.connection_close();
                self.inner
                    .lifecycle
                    .arm_deadline(deadline, AmqpError::ConnectionCloseTimeout(deadline));

                let connection = self.clone();
                tokio::spawn(async move { connection.shutdown(reason).await });
            }

            if let Err(err) = self.inner.lifecycle.wait().await {
                debug!(error = err.to_string(), "connection closed with failure");
            }
        })
        .await
    }

    async fn shutdown(self, reason: Option<AmqpError>) {
        self.close_channels(reason.clone()).await;

        if let Err(err) = self.inner.transport.close().await {
            warn!(error = err.to_string(), "failure to close the connection");
        }

        if self.inner.lifecycle.settle(outcome_from(reason)) {
            debug!("connection closed");
        }
    }

    async fn close_channels(&self, reason: Option<AmqpError>) {
        let channels = self.channels();
        join_all(channels.iter().map(|c| c.close(reason.clone()))).await;
    }
}
