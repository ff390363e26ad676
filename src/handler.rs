// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A [`MessageHandler`] processes one delivered [`Message`]. Handlers settle the message
//! themselves (`ack`, `dequeue`, `requeue`, ...). Returning an error is fatal to the
//! consumer that dispatched the message; wrap the handler in
//! [`Retrying`](crate::retry::Retrying) or catch failures inside it for isolation.

use crate::{errors::HandlerError, message::Message};
use async_trait::async_trait;
use std::future::Future;

#[cfg(test)]
use mockall::automock;

/// Processes messages delivered to a consumer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self)(message).await
    }
}
