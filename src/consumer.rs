// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Disposition
//!
//! Once a handler has answered (or failed), this module decides what happens to the
//! delivery:
//! 1. 2xx replies are acked
//! 2. 4xx replies and unrecognized statuses are sent to the error queue, then acked
//! 3. 5xx replies are acked at once and the envelope is republished to its routing key
//!    after the retry delay, until the redelivery counter reaches the retry budget; then
//!    it goes to the error queue
//! 4. Handler failures are sent to the error queue, then acked
//!
//! The module also carries the consume side of the broker adapter: topology assertion
//! followed by the subscription.

use crate::{
    broker::{self, BrokerSession, Subscription},
    config::ConsumeOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{HttpMessage, RawEnvelope, Request},
    publisher::PublishMessage,
    queue::QueueTarget,
    reply::{Response, StatusClass},
    service::{until_closed, ServiceInner},
    topology::declare_exchange_and_queue,
};
use chrono::Utc;
use opentelemetry::{
    global::BoxedSpan,
    trace::{Span, Status},
};
use serde_json::{json, Value};
use std::{
    borrow::Cow,
    sync::{Arc, Weak},
};
use tracing::{debug, error, info, warn, Instrument};

/// Header naming the topic that wants to hear about the outcome of a request.
pub const FLOW_INFORM_TOPIC_HEADER: &str = "x-flowinformtopic";
/// Status of the finished request, sent to the inform topic.
pub const FLOW_RESPONSE_CODE_HEADER: &str = "x-flowresponsecode";
/// Completion time of the finished request, sent to the inform topic.
pub const FLOW_FINISHED_ON_HEADER: &str = "x-flowtaskfinishedon";

const HANDLER_FAILURE_STATUS: u16 = 500;

/// Asserts the topology of a route target, then subscribes to its queue.
pub async fn consume(
    session: &dyn BrokerSession,
    exchanges: &[ExchangeDefinition],
    target: &QueueTarget,
    options: &ConsumeOptions,
) -> Result<Subscription, AmqpError> {
    let queue = declare_exchange_and_queue(session, exchanges, target).await?;
    debug!(queue, topic = target.topic(), "creating consumer");
    session
        .consume(&queue, options.no_ack, options.exclusive)
        .await
}

/// A delivery handed to a handler and not yet settled.
pub(crate) struct InFlight {
    pub(crate) inner: Arc<ServiceInner>,
    /// Session the delivery came from; acks are only valid there.
    pub(crate) session: Weak<dyn BrokerSession>,
    pub(crate) delivery_tag: u64,
    pub(crate) routing_key: String,
    pub(crate) auto_ack: bool,
    pub(crate) raw: RawEnvelope,
    pub(crate) request: Request,
    pub(crate) span: BoxedSpan,
}

impl InFlight {
    /// Applies the reply protocol to a handler's response.
    pub(crate) async fn resolve(mut self, response: Response) {
        let response_time = (Utc::now() - self.request.received_at).num_milliseconds();
        let status = response.status;

        self.inform_workflow(status, response.body.clone());

        match response.class() {
            StatusClass::Success => {
                info!(status, response_time, headers = ?response.headers, "queue request completed");
                self.ack().await;
                self.span.set_status(Status::Ok);
            }
            StatusClass::ClientError => {
                info!(status, response_time, headers = ?response.headers, "queue request completed");
                self.dead_letter(response.body).await;
                self.ack().await;
                self.fail_span("client error");
            }
            StatusClass::ServerError => {
                warn!(status, response_time, headers = ?response.headers, "queue request completed");
                let times_resent = self.raw.bump_times_resent();
                self.ack().await;
                self.fail_span("server error");
                self.requeue(times_resent, response.body).await;
            }
            StatusClass::Unrecognized => {
                error!(status, response_time, "unknown response sending to error queue");
                self.dead_letter(response.body).await;
                self.ack().await;
                self.fail_span("unknown response");
            }
        }

        self.span.end();
    }

    /// Handles a handler that returned an error or panicked.
    pub(crate) async fn handler_failed(mut self, message: String) {
        error!(error = message, "error executing handler, sending to error queue");

        self.inform_workflow(HANDLER_FAILURE_STATUS, json!({ "error": message }));

        self.dead_letter(Value::String(message.clone())).await;
        self.ack().await;

        self.fail_span(&message);
        self.span.end();
    }

    async fn requeue(&self, times_resent: u64, body: Value) {
        let delay = self.inner.config.retry_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = until_closed(self.inner.shutdown_signal()) => {
                debug!("service closed before the retry window elapsed");
                return;
            }
        }

        if times_resent >= u64::from(self.inner.config.max_retries) {
            error!(times_resent, "500 after max retries sending to error queue");
            self.dead_letter(body).await;
            return;
        }

        warn!(times_resent, "500 re-queueing for the {} time", times_resent);
        let message = PublishMessage::new(&self.routing_key, self.raw.clone());
        if let Err(err) = self.inner.publish_retry(message).await {
            error!(error = err.to_string(), "failure to re-queue message");
        }
    }

    async fn ack(&self) {
        if self.auto_ack {
            return;
        }
        let session = self.session.upgrade();
        broker::ack(session.as_ref(), self.delivery_tag).await;
    }

    async fn dead_letter(&self, response: Value) {
        if let Err(err) = self
            .inner
            .publish_to_error_queue(self.raw.clone(), response)
            .await
        {
            error!(
                error = err.to_string(),
                "unhandled error while publishing to the error queue"
            );
        }
    }

    /// Tells the requester's workflow topic how the request ended, when it asked to know.
    ///
    /// The notification is published in the background; the delivery is settled without
    /// waiting for it.
    fn inform_workflow(&self, status: u16, body: Value) {
        let Some(topic) = self.request.header(FLOW_INFORM_TOPIC_HEADER) else {
            return;
        };

        let mut headers = self.request.headers.clone();
        headers.remove(FLOW_INFORM_TOPIC_HEADER);
        headers.insert(FLOW_RESPONSE_CODE_HEADER.to_owned(), Value::from(status));
        headers.insert(
            FLOW_FINISHED_ON_HEADER.to_owned(),
            Value::String(Utc::now().to_rfc3339()),
        );

        let notification = HttpMessage {
            payload: Some(body),
            headers: Some(headers),
            ..Default::default()
        };

        let inner = self.inner.clone();
        let message = PublishMessage::new(topic, notification);
        tokio::spawn(
            async move {
                let topic = message.key.clone();
                if let Err(err) = inner.publish_retry(message).await {
                    error!(error = err.to_string(), topic, "failure to inform workflow");
                }
            }
            .in_current_span(),
        );
    }

    fn fail_span(&mut self, description: &str) {
        self.span.set_status(Status::Error {
            description: Cow::from(description.to_owned()),
        });
    }
}
