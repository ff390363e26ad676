// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders describing the queues and bindings a channel declares, most notably the
//! exclusive, auto-deleted reply queues created by
//! [`Channel::handle_rpc`](crate::channel::Channel::handle_rpc).

/// Definition of a queue with its declaration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition. An empty name lets the
    /// broker generate one.
    ///
    /// # Parameters
    /// * `name` - The queue name
    ///
    /// # Returns
    /// A new QueueDefinition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Restricts the queue to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    ///
    /// # Parameters
    /// * `ttl` - Time-To-Live in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue holds.
    ///
    /// # Parameters
    /// * `max` - Maximum number of messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Returns the queue name, empty when the broker should generate one.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether the queue survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Returns whether the queue is deleted with its last consumer.
    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    /// Returns whether the queue is restricted to the declaring connection.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Returns the message Time-To-Live in milliseconds, if set.
    pub fn message_ttl(&self) -> Option<i32> {
        self.ttl
    }

    /// Returns the maximum number of messages, if set.
    pub fn length_limit(&self) -> Option<i32> {
        self.max_length
    }
}

/// Binding of a queue to an exchange under a routing key.
#[derive(Debug, Clone, Copy)]
pub struct QueueBinding<'qb> {
    pub(crate) queue_name: &'qb str,
    pub(crate) exchange_name: &'qb str,
    pub(crate) routing_key: &'qb str,
}

impl<'qb> QueueBinding<'qb> {
    /// Creates a binding for the given queue with an empty exchange and routing key.
    pub fn new(queue: &'qb str) -> QueueBinding<'qb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
        }
    }

    /// Sets the exchange to bind to.
    ///
    /// # Parameters
    /// * `exchange` - The exchange name
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &'qb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the routing key of the binding.
    ///
    /// # Parameters
    /// * `key` - The routing key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &'qb str) -> Self {
        self.routing_key = key;
        self
    }

    /// Returns the bound queue name.
    pub fn queue_name(&self) -> &str {
        self.queue_name
    }

    /// Returns the exchange name.
    pub fn exchange_name(&self) -> &str {
        self.exchange_name
    }

    /// Returns the routing key.
    pub fn key(&self) -> &str {
        self.routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_queue_definition() {
        let def = QueueDefinition::new("").exclusive().delete();
        assert!(def.is_exclusive());
        assert!(def.is_auto_delete());
        assert!(!def.is_durable());
        assert_eq!(def.name(), "");
    }

    #[test]
    fn binding_builder() {
        let binding = QueueBinding::new("replies").exchange("rpc").routing_key("user.get");
        assert_eq!(binding.queue_name(), "replies");
        assert_eq!(binding.exchange_name(), "rpc");
        assert_eq!(binding.key(), "user.get");
    }
}
