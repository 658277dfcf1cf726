// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Topic router and reliability layer over RabbitMQ.
//!
//! Register a handler per topic, connect, and the service consumes each topic's queue,
//! hands every delivery to its handler and settles it by the status the handler replies
//! with. Publishing, delayed publishing, bounded 5xx retries, dead-lettering and
//! reconnection are handled here.

mod dispatcher;
mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod reply;
pub mod router;
pub mod service;
pub mod topology;

pub use broker::{Broker, BrokerSession, Delivery, DeliveryStream, PublishProperties, Subscription};
pub use config::{
    BrokerConfig, ConsumeOptions, ExchangeOptions, PublishOptions, RetryPolicy, ServiceOptions,
};
pub use errors::{AmqpError, HandlerError};
pub use message::{Body, HttpMessage, RawEnvelope, Request};
pub use reply::{Reply, Response, StatusClass};
pub use router::{Handler, Route, Router};
pub use service::{ConnectionState, QueueService};
