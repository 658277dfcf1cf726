// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Single-attempt publish through a broker session: encodes the body, stamps the
//! provenance header and the trace context, asserts the destination topology and hands
//! the bytes to the channel. Retrying is the caller's decision.

use crate::{
    broker::{BrokerSession, PublishProperties, AMQP_HEADERS_FROM},
    config::PublishOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{encode, Body},
    otel,
    queue::QueueTarget,
    topology::declare_exchange_and_queue,
};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

/// An outbound message and where it goes.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub key: String,
    /// Queue asserted for the destination; defaults to a queue named after the key.
    pub queue: Option<String>,
    pub body: Body,
    pub options: PublishOptions,
    /// Routes through the delayed exchange when set.
    pub delay: Option<Duration>,
}

impl PublishMessage {
    pub fn new(key: &str, body: impl Into<Body>) -> PublishMessage {
        PublishMessage {
            key: key.to_owned(),
            queue: None,
            body: body.into(),
            options: PublishOptions::default(),
            delay: None,
        }
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_owned());
        self
    }

    pub fn options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn target(&self) -> QueueTarget {
        let target = QueueTarget::new(&self.key);
        match &self.queue {
            Some(queue) => target.queue(queue),
            None => target,
        }
    }
}

/// Publishes one message.
///
/// `exchanges` holds the main exchange first and, when enabled, the delayed exchange
/// second. Returns `Ok(false)` when the broker refused the message.
pub async fn publish(
    session: &dyn BrokerSession,
    exchanges: &[ExchangeDefinition],
    message: &PublishMessage,
    origin: &str,
) -> Result<bool, AmqpError> {
    let exchange = match (message.delay, exchanges) {
        (_, []) => return Err(AmqpError::InternalError),
        (None, [main, ..]) => main,
        (Some(_), [_, delayed, ..]) => delayed,
        (Some(_), [_]) => return Err(AmqpError::DelayedExchangeDisabled),
    };

    info!(
        key = message.key,
        exchange = exchange.name(),
        protocol = "amqp",
        "publishing message"
    );

    let mut headers = message.options.headers.clone();
    headers.insert(AMQP_HEADERS_FROM.to_owned(), origin.to_owned());
    otel::inject(&mut headers);

    let properties = PublishProperties {
        message_id: Uuid::new_v4().to_string(),
        persistent: message.options.persistent,
        headers,
        delay: message
            .delay
            .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
        ..Default::default()
    };

    declare_exchange_and_queue(session, exchanges, &message.target()).await?;

    let published = session
        .publish(
            exchange.name(),
            &message.key,
            &encode(&message.body),
            &properties,
        )
        .await?;

    if published {
        debug!(key = message.key, "message was published");
    } else {
        error!(key = message.key, "message not published");
    }

    Ok(published)
}
