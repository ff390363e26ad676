// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Lifecycle Layer
//!
//! Every failure produced by this crate is an [`AmqpError`]. Each variant belongs to
//! the hierarchy level it originated at (see [`Level`]) and may wrap the transport
//! failure that caused it, so [`AmqpError::report`] can render the whole causal chain
//! in one place.

use crate::{message::MessageStatus, transport::TransportError};
use std::{error::Error as StdError, fmt, sync::Arc, time::Duration};
use thiserror::Error;

/// Boxed failure returned by message handlers.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// The hierarchy level an [`AmqpError`] originated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Config,
    Connection,
    Channel,
    Consumer,
    Message,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Config => "config",
            Level::Connection => "connection",
            Level::Channel => "channel",
            Level::Consumer => "consumer",
            Level::Message => "message",
        };
        f.write_str(name)
    }
}

/// Represents errors that can occur while driving connections, channels, consumers
/// and messages.
///
/// The type is `Clone` because a single completion outcome is observed by every
/// caller awaiting it.
#[derive(Error, Debug, Clone)]
pub enum AmqpError {
    /// The configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The transport refused to open the connection
    #[error("failure to connect to `{uri}`")]
    ConnectionError {
        uri: String,
        #[source]
        source: TransportError,
    },

    /// The broker closed the connection
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Connection close did not settle before its deadline
    #[error("connection close timed out after {0:?}")]
    ConnectionCloseTimeout(Duration),

    /// The broker closed the channel
    #[error("channel closed by peer (error: {had_error})")]
    ChannelClosed { had_error: bool },

    /// Channel close did not settle before its deadline
    #[error("channel close timed out after {0:?}")]
    ChannelCloseTimeout(Duration),

    /// The broker canceled the consumer server-side
    #[error("consumer on queue `{0}` canceled by peer")]
    ConsumerCanceled(String),

    /// The broker-level cancel did not settle before its deadline
    #[error("consumer cancel timed out after {0:?}")]
    CancelTimeout(Duration),

    /// A message operation was attempted after its status was already set
    #[error("cannot {operation} message with status `{status}`")]
    InvalidState {
        operation: &'static str,
        status: MessageStatus,
    },

    /// The operation needs an open level, but it is closing or closed
    #[error("{0} is closing or closed")]
    NotOpen(Level),

    /// The channel a consumer belonged to has been dropped
    #[error("channel is no longer available")]
    ChannelDropped,

    /// A transport call issued on behalf of the given level failed
    #[error("{level} failure to {operation}")]
    Transport {
        level: Level,
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    /// The transport raised an error notification for the given level
    #[error("{level} error notified by transport")]
    Notified {
        level: Level,
        #[source]
        source: TransportError,
    },

    /// A message handler failed
    #[error("handler failure on queue `{queue}`")]
    HandlerError {
        queue: String,
        #[source]
        source: Arc<dyn StdError + Send + Sync>,
    },
}

impl AmqpError {
    pub(crate) fn transport(level: Level, operation: &'static str, source: TransportError) -> Self {
        AmqpError::Transport {
            level,
            operation,
            source,
        }
    }

    pub(crate) fn handler(queue: &str, source: HandlerError) -> Self {
        AmqpError::HandlerError {
            queue: queue.to_owned(),
            source: Arc::from(source),
        }
    }

    /// The hierarchy level this failure originated at.
    pub fn level(&self) -> Level {
        match self {
            AmqpError::InvalidConfig(_) => Level::Config,
            AmqpError::ConnectionError { .. }
            | AmqpError::ConnectionClosed
            | AmqpError::ConnectionCloseTimeout(_) => Level::Connection,
            AmqpError::ChannelClosed { .. }
            | AmqpError::ChannelCloseTimeout(_)
            | AmqpError::ChannelDropped => Level::Channel,
            AmqpError::ConsumerCanceled(_)
            | AmqpError::CancelTimeout(_)
            | AmqpError::HandlerError { .. } => Level::Consumer,
            AmqpError::InvalidState { .. } => Level::Message,
            AmqpError::Transport { level, .. }
            | AmqpError::Notified { level, .. }
            | AmqpError::NotOpen(level) => *level,
        }
    }

    /// Whether this failure was produced by a deadline firing.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionCloseTimeout(_)
                | AmqpError::ChannelCloseTimeout(_)
                | AmqpError::CancelTimeout(_)
        )
    }

    /// The diagnostic trace captured from the transport, if any failure in the chain
    /// carried one.
    pub fn diagnostic_trace(&self) -> Option<&str> {
        match self {
            AmqpError::ConnectionError { source, .. }
            | AmqpError::Transport { source, .. }
            | AmqpError::Notified { source, .. } => source.trace(),
            _ => None,
        }
    }

    /// Renders the failure, every cause in its source chain and the captured
    /// transport trace as one multi-line report.
    pub fn report(&self) -> String {
        let mut report = format!("[{}] {}", self.level(), self);
        let mut cause = self.source();
        while let Some(err) = cause {
            report.push_str("\n  caused by: ");
            report.push_str(&err.to_string());
            cause = err.source();
        }
        if let Some(trace) = self.diagnostic_trace() {
            report.push_str("\n  transport trace: ");
            report.push_str(trace);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_walks_the_causal_chain_and_trace() {
        let err = AmqpError::transport(
            Level::Channel,
            "publish",
            TransportError::with_trace("socket reset", "IOError(ConnectionReset)"),
        );

        let report = err.report();
        assert_eq!(err.level(), Level::Channel);
        assert!(report.starts_with("[channel] channel failure to publish"));
        assert!(report.contains("caused by: socket reset"));
        assert!(report.contains("transport trace: IOError(ConnectionReset)"));
    }

    #[test]
    fn handler_failures_belong_to_the_consumer() {
        let err = AmqpError::handler("orders", "boom".into());
        assert_eq!(err.level(), Level::Consumer);
        assert!(err.report().contains("caused by: boom"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn deadline_variants_are_timeouts() {
        assert!(AmqpError::ChannelCloseTimeout(Duration::from_secs(5)).is_timeout());
        assert!(AmqpError::CancelTimeout(Duration::from_secs(3)).is_timeout());
        assert!(!AmqpError::ConnectionClosed.is_timeout());
    }
}
