// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Route Dispatcher
//!
//! One consumer loop per registered route. Each delivery is decoded into a `Request`,
//! handed to the route's handler together with a `Reply`, and settled by the reply
//! protocol in `consumer` once the handler answers.
//!
//! Handlers of the same queue run one at a time in delivery order. Settling, on success
//! and on failure alike, runs in its own task, so neither a 5xx retry wait nor an error
//! queue publish stalls the queue.

use crate::{
    broker::{BrokerSession, Delivery, DeliveryStream},
    consumer::InFlight,
    message::{self, Request, METHOD_NAME, TRACE_ID_HEADER},
    otel,
    reply::Reply,
    router::Route,
    service::{until_closed, ServiceInner},
};
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Spawns the consumer loop of one route. The loop ends with the delivery stream.
pub(crate) fn spawn_consumer(
    inner: Arc<ServiceInner>,
    route: Route,
    session: &Arc<dyn BrokerSession>,
    mut deliveries: DeliveryStream,
    auto_ack: bool,
) {
    let session = Arc::downgrade(session);

    tokio::spawn(async move {
        while let Some(delivery) = deliveries.next().await {
            dispatch(&inner, &route, &session, delivery, auto_ack).await;
        }
        debug!(topic = route.topic, "consumer stream ended");
    });
}

async fn dispatch(
    inner: &Arc<ServiceInner>,
    route: &Route,
    session: &Weak<dyn BrokerSession>,
    delivery: Delivery,
    auto_ack: bool,
) {
    if !message::is_structured(&delivery.data) {
        warn!(
            topic = route.topic,
            from = delivery.origin(),
            "message is not a json object, delivering it under queueMessage"
        );
    }

    let (mut request, raw) = message::decode(&route.topic, METHOD_NAME, &delivery.data);
    let trace_id = ensure_trace_id(&mut request, &delivery);

    let span = info_span!(
        "queue_request",
        topic = %route.topic,
        trace_id = %trace_id,
        from = %delivery.origin(),
        exchange = %delivery.exchange,
        redelivered = delivery.redelivered
    );
    if delivery.redelivered {
        debug!(
            parent: &span,
            delivery_tag = delivery.delivery_tag,
            "delivery was redelivered by the broker"
        );
    }

    let in_flight = InFlight {
        inner: inner.clone(),
        session: session.clone(),
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.clone(),
        auto_ack,
        raw,
        request: request.clone(),
        span: otel::new_span(&delivery.headers, &route.topic),
    };

    let (reply, mut pending) = Reply::channel();

    let outcome = AssertUnwindSafe(route.handler.handle(request, reply))
        .catch_unwind()
        .instrument(span.clone())
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(panic) => Some(panic_message(&*panic)),
    };

    match failure {
        None => {
            let shutdown = inner.shutdown_signal();
            tokio::spawn(
                async move {
                    tokio::select! {
                        reply = pending => match reply {
                            Ok(response) => in_flight.resolve(response).await,
                            Err(_) => warn!("handler finished without replying, delivery left un-acked"),
                        },
                        _ = until_closed(shutdown) => debug!("service closed before the handler replied"),
                    }
                }
                .instrument(span),
            );
        }
        Some(error) => match pending.try_recv() {
            Ok(response) => {
                warn!(parent: &span, error, "handler failed after replying, keeping the reply");
                tokio::spawn(in_flight.resolve(response).instrument(span));
            }
            Err(_) => {
                tokio::spawn(in_flight.handler_failed(error).instrument(span));
            }
        },
    }
}

/// Returns the request's trace id, minting one when the publisher sent none.
fn ensure_trace_id(request: &mut Request, delivery: &Delivery) -> String {
    if let Some(trace_id) = request.trace_id() {
        return trace_id.to_owned();
    }

    warn!(
        url = request.path,
        from = delivery.origin(),
        "you should send the \"x-trace-id\" in the headers to keep the request traceability"
    );

    let trace_id = Uuid::new_v4().to_string();
    request
        .headers
        .insert(TRACE_ID_HEADER.to_owned(), Value::String(trace_id.clone()));
    trace_id
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "handler panicked".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(&*payload), "kaboom");

        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*payload), "handler panicked");
    }

    #[test]
    fn trace_id_is_kept_or_minted() {
        let delivery = Delivery::default();

        let (mut request, _) = message::decode(
            "orders",
            METHOD_NAME,
            br#"{"headers":{"x-trace-id":"abc"}}"#,
        );
        assert_eq!(ensure_trace_id(&mut request, &delivery), "abc");

        let (mut request, _) = message::decode("orders", METHOD_NAME, b"{}");
        let minted = ensure_trace_id(&mut request, &delivery);
        assert!(!minted.is_empty());
        assert_eq!(request.trace_id(), Some(minted.as_str()));
    }
}
