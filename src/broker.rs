// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability Surface
//!
//! The router never talks to the AMQP client directly. It drives a `Broker` (a connection
//! factory) and the `BrokerSession` it hands out (one connection plus one channel). The
//! lapin-backed implementation lives in the `channel` module; tests plug in their own.

use crate::{
    config::BrokerConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

/// Header carrying the name of the publishing process.
pub const AMQP_HEADERS_FROM: &str = "x-from";
/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// One unit of message data received from a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// String-valued AMQP headers; other header types are rendered as text.
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

impl Delivery {
    /// Name of the process that published this delivery.
    pub fn origin(&self) -> &str {
        self.headers
            .get(AMQP_HEADERS_FROM)
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// Properties attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: String,
    pub message_id: String,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
    /// Delay in milliseconds, sent as the integer `x-delay` header.
    pub delay: Option<u64>,
}

impl Default for PublishProperties {
    fn default() -> Self {
        PublishProperties {
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: String::new(),
            persistent: true,
            headers: BTreeMap::default(),
            delay: None,
        }
    }
}

/// Stream of deliveries for one consumer. It ends when the consumer is cancelled or the
/// channel goes away.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// An active consumer on a queue.
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

/// Connection factory.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens one connection and one channel. A single attempt; retries live in `connect`.
    async fn connect(&self, cfg: &BrokerConfig) -> Result<Arc<dyn BrokerSession>, AmqpError>;
}

/// One live connection and its channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue and returns the name the broker assigned to it.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message. `Ok(false)` means the broker refused it (negative confirm or
    /// backpressure); the caller decides whether to retry.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<bool, AmqpError>;

    async fn consume(&self, queue: &str, no_ack: bool, exclusive: bool)
        -> Result<Subscription, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel, then the connection.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Connection-level fault signal. The value turns `Some(reason)` once the connection
    /// reports an error or is closed by the broker.
    fn faults(&self) -> watch::Receiver<Option<String>>;
}

/// Connects to the broker, retrying forever with the configured reconnection delay.
pub async fn connect(broker: &dyn Broker, cfg: &BrokerConfig) -> Arc<dyn BrokerSession> {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match broker.connect(cfg).await {
            Ok(session) => {
                info!(attempt, "connected correctly to rabbitmq");
                return session;
            }
            Err(err) => {
                error!(error = err.to_string(), attempt, "failure to connect, retrying");
                tokio::time::sleep(cfg.reconnection_delay()).await;
            }
        }
    }
}

/// Acknowledges a delivery on the session it came from.
///
/// A session that has already been torn down makes this a no-op.
pub async fn ack(session: Option<&Arc<dyn BrokerSession>>, delivery_tag: u64) {
    let Some(session) = session else {
        return;
    };

    if let Err(err) = session.ack(delivery_tag).await {
        error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
    }
}
