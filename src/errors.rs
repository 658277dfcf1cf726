// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Queue Router
//!
//! This module provides the error taxonomy for every layer of the router: configuration
//! validation, route validation, topology assertion, transport, publishing and
//! dead-lettering. Handler failures are carried as boxed errors (`HandlerError`) because
//! they belong to application code.

use thiserror::Error;

/// Error type returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur while routing messages through RabbitMQ.
///
/// Transport faults are absorbed by the connection supervisor and never reach
/// application code; everything else is surfaced to whichever operation triggered it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Startup configuration failed validation
    #[error("bad configuration: {0}")]
    ConfigurationError(String),

    /// A route or route set was rejected at registration
    #[error("wrong route object: {0}")]
    InvalidRoute(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// An operation needed a live channel and there was none
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while another connect attempt was in flight
    #[error("connection already in progress")]
    ConnectionInProgress,

    /// The service was closed while the operation was pending
    #[error("service closed")]
    Closed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Every attempt of a retried publish failed
    #[error("failed after: {attempts} times publishing to `{key}`")]
    PublishExhausted { key: String, attempts: u32 },

    /// Error publishing a message to the error queue
    #[error("failure to publish to error queue: {0}")]
    PublishingToErrorQueueError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error closing the channel or the connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// A delayed publish was requested without the delayed exchange enabled
    #[error("delayed exchange is not enabled")]
    DelayedExchangeDisabled,
}

impl AmqpError {
    /// Whether the error comes from declaring exchanges, queues or bindings.
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
        )
    }
}
