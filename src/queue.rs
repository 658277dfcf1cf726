// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions and Bindings
//!
//! A route names a topic and, optionally, the queue that should hold its messages. When
//! the queue is omitted it is named after the topic.

/// Definition of a queue with its declaration flags.
///
/// Route queues are shared between service instances, so they are never exclusive to a
/// connection nor deleted with their last consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

/// Binding of a queue to an exchange under a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with the builder methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// Where a topic's messages land: an explicit queue, or a queue named after the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTarget {
    pub(crate) queue: Option<String>,
    pub(crate) topic: String,
}

impl QueueTarget {
    /// Creates a target for `topic` whose queue is named after the topic.
    pub fn new(topic: &str) -> QueueTarget {
        QueueTarget {
            queue: None,
            topic: topic.to_owned(),
        }
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_owned());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or(&self.topic)
    }
}
