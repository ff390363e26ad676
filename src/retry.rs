// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bounded Redelivery
//!
//! The broker's redelivered flag is a boolean, so retries are counted manually in the
//! `x-redelivered-count` header. [`Retrying`] wraps a handler: when it fails and the
//! message's count is below the configured maximum, a copy is redelivered and the
//! original acknowledged; once the maximum is reached the message is dequeued.

use crate::{
    config::AmqpConfig,
    errors::HandlerError,
    handler::MessageHandler,
    message::Message,
};
use async_trait::async_trait;
use tracing::{error, warn};

/// How many manual redeliveries a message gets before it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_redelivered_count: u32,
}

impl RetryPolicy {
    /// Creates a policy allowing `max_redelivered_count` redeliveries per message.
    pub fn new(max_redelivered_count: u32) -> Self {
        RetryPolicy {
            max_redelivered_count,
        }
    }

    /// Creates a policy from `AmqpConfig::max_redelivered_count`.
    pub fn from_config(cfg: &AmqpConfig) -> Self {
        Self::new(cfg.max_redelivered_count)
    }

    /// Wraps `handler` with this policy.
    ///
    /// # Parameters
    /// * `handler` - The handler whose failures are retried
    ///
    /// # Returns
    /// A handler that redelivers or dequeues on failure and reports success
    pub fn wrap<H: MessageHandler>(self, handler: H) -> Retrying<H> {
        Retrying {
            inner: handler,
            policy: self,
        }
    }
}

/// A handler whose failures are turned into bounded redeliveries.
pub struct Retrying<H> {
    inner: H,
    policy: RetryPolicy,
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Retrying<H> {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let Err(err) = self.inner.handle(message.clone()).await else {
            return Ok(());
        };

        let count = message.redelivered_count();
        if count < self.policy.max_redelivered_count {
            warn!(
                error = err.to_string(),
                count,
                routing_key = message.routing_key(),
                "error whiling handling msg, redelivering"
            );
            message.redeliver().await?;
            message.ack().await?;
        } else {
            error!(
                error = err.to_string(),
                count,
                routing_key = message.routing_key(),
                "too many attempts, dropping msg"
            );
            message.dequeue().await?;
        }

        Ok(())
    }
}
