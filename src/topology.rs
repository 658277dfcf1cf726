// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Assertion
//!
//! Before a topic is published to or consumed from, its exchange, queue and binding must
//! exist. Every declaration here is idempotent on the broker side, so the router simply
//! re-asserts the topology each time instead of tracking what it already declared.

use crate::{
    broker::BrokerSession,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueTarget},
};
use tracing::debug;

/// Declares the exchanges, the target queue and binds the queue under its topic on every
/// exchange.
///
/// The first exchange is the main one; a delayed companion, when present, comes second so
/// that delayed messages reach the same queue. Returns the declared queue name.
pub async fn declare_exchange_and_queue(
    session: &dyn BrokerSession,
    exchanges: &[ExchangeDefinition],
    target: &QueueTarget,
) -> Result<String, AmqpError> {
    for exchange in exchanges {
        debug!("asserting exchange: {}", exchange.name());
        session.declare_exchange(exchange).await?;
    }

    create_and_bind_queue(session, exchanges, target).await
}

/// Declares the target queue and binds it under its topic on every given exchange.
pub async fn create_and_bind_queue(
    session: &dyn BrokerSession,
    exchanges: &[ExchangeDefinition],
    target: &QueueTarget,
) -> Result<String, AmqpError> {
    let queue = session
        .declare_queue(&QueueDefinition::new(target.queue_name()).durable())
        .await?;

    for exchange in exchanges {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue,
            exchange.name(),
            target.topic()
        );

        session
            .bind_queue(
                &QueueBinding::new(&queue)
                    .exchange(exchange.name())
                    .routing_key(target.topic()),
            )
            .await?;
    }

    Ok(queue)
}
