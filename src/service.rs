// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Service
//!
//! The facade applications hold. It owns the broker connection lifecycle (connect,
//! supervise, reconnect, close), the registered routes and their consumers, and every
//! publish path: application publishes with retry, delayed publishes, 5xx republishes
//! and dead-lettering to the error queue.
//!
//! `QueueService` is a cheap handle; clones share one connection.

use crate::{
    broker::{self, Broker, BrokerSession},
    channel::AmqpBroker,
    config::{BrokerConfig, PublishOptions, ServiceOptions},
    consumer,
    dispatcher,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Body, HttpMessage, RawEnvelope},
    publisher::{self, PublishMessage},
    router::{Route, Router},
};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Connection lifecycle of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    is_connecting: bool,
    is_closing: bool,
}

/// A live consumer of one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConsumerRegistration {
    pub(crate) topic: String,
    pub(crate) consumer_tag: String,
}

pub(crate) struct ServiceInner {
    pub(crate) config: BrokerConfig,
    pub(crate) options: ServiceOptions,
    broker: Arc<dyn Broker>,
    /// Main exchange first, delayed exchange second when enabled.
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    router: Mutex<Router>,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    consumers: Mutex<Vec<ConsumerRegistration>>,
    /// Held across every change to the live consumers, so one topic never ends up with
    /// two of them.
    attaching: Mutex<()>,
    status: Mutex<Status>,
    shutdown: watch::Sender<bool>,
}

/// Topic router and reliability layer over one RabbitMQ connection.
#[derive(Clone)]
pub struct QueueService {
    inner: Arc<ServiceInner>,
}

impl QueueService {
    /// Creates a service with the default options. Nothing connects until `connect`.
    ///
    /// # Parameters
    /// * `config` - Broker settings, validated here
    /// * `broker` - The connection factory
    ///
    /// # Returns
    /// The service, or `ConfigurationError` for an invalid config
    pub fn new(config: BrokerConfig, broker: Arc<dyn Broker>) -> Result<QueueService, AmqpError> {
        QueueService::with_options(config, ServiceOptions::default(), broker)
    }

    /// Creates a service with explicit retry, exchange, publish and consume policies.
    ///
    /// The delayed exchange is only declared when `options.delayed_exchange` is set.
    pub fn with_options(
        config: BrokerConfig,
        options: ServiceOptions,
        broker: Arc<dyn Broker>,
    ) -> Result<QueueService, AmqpError> {
        config.validate()?;

        let main = ExchangeDefinition::topic(&config.exchange, &options.exchange);
        let mut exchanges = Vec::with_capacity(2);
        if options.delayed_exchange {
            let delayed = ExchangeDefinition::topic_delayed(&main);
            exchanges.push(main);
            exchanges.push(delayed);
        } else {
            exchanges.push(main);
        }

        let (shutdown, _) = watch::channel(false);

        Ok(QueueService {
            inner: Arc::new(ServiceInner {
                config,
                options,
                broker,
                exchanges,
                router: Mutex::new(Router::new()),
                session: RwLock::new(None),
                consumers: Mutex::new(Vec::new()),
                attaching: Mutex::new(()),
                status: Mutex::new(Status {
                    state: ConnectionState::Disconnected,
                    is_connecting: false,
                    is_closing: false,
                }),
                shutdown,
            }),
        })
    }

    /// Service backed by a real RabbitMQ connection.
    pub fn amqp(config: BrokerConfig) -> Result<QueueService, AmqpError> {
        QueueService::new(config, Arc::new(AmqpBroker))
    }

    /// Connects (retrying until the broker answers) and attaches every registered route.
    ///
    /// A no-op when already connected; fails with `ConnectionInProgress` while another
    /// connect is running.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.inner.connect().await
    }

    /// Replaces the registered routes. Consumers are attached right away when connected,
    /// otherwise on the next connect.
    ///
    /// # Parameters
    /// * `routes` - The full route table; routes left out stop being consumed
    ///
    /// # Returns
    /// `InvalidRoute` when the batch is invalid, in which case nothing changes, or the
    /// topology error of the first route that could not be attached
    pub async fn register(&self, routes: Vec<Route>) -> Result<(), AmqpError> {
        self.inner.register(routes).await
    }

    /// Publishes to the main exchange under `key`, retrying per the service retry policy.
    ///
    /// # Parameters
    /// * `key` - The routing key (topic)
    /// * `body` - The payload, encoded as described on `Body`
    /// * `options` - Persistence and headers; the service defaults when `None`
    ///
    /// # Returns
    /// `PublishExhausted` once every attempt failed or was refused
    pub async fn publish_to_topic(
        &self,
        key: &str,
        body: impl Into<Body>,
        options: Option<PublishOptions>,
    ) -> Result<(), AmqpError> {
        let options = options.unwrap_or_else(|| self.inner.options.publish.clone());
        self.inner
            .publish_retry(PublishMessage::new(key, body).options(options))
            .await
    }

    /// Publishes an HTTP-shaped message; missing sections default to `{}`.
    pub async fn publish_http_to_topic(
        &self,
        key: &str,
        message: HttpMessage,
        options: Option<PublishOptions>,
    ) -> Result<(), AmqpError> {
        self.publish_to_topic(key, message, options).await
    }

    /// Publishes through the delayed exchange; `delay` defaults to the configured
    /// `delaySeconds`.
    pub async fn publish_delayed_http_to_topic(
        &self,
        key: &str,
        message: HttpMessage,
        delay: Option<Duration>,
    ) -> Result<(), AmqpError> {
        if !self.inner.options.delayed_exchange {
            return Err(AmqpError::DelayedExchangeDisabled);
        }

        let delay = delay.unwrap_or_else(|| self.inner.config.default_publish_delay());
        let message = PublishMessage::new(key, message)
            .options(self.inner.options.publish.clone())
            .delay(delay);
        self.inner.publish_retry(message).await
    }

    /// Sends an envelope to the error queue with `response` attached. A single attempt.
    pub async fn publish_to_error_queue(
        &self,
        envelope: RawEnvelope,
        response: Value,
    ) -> Result<(), AmqpError> {
        self.inner.publish_to_error_queue(envelope, response).await
    }

    /// Stops consuming, forgets the routes and closes the connection. No reconnect follows.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close().await
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.status.lock().await.state
    }

    /// The validated broker settings the service was built with.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }
}

impl ServiceInner {
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    async fn current_session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.session.read().await.clone()
    }

    async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        {
            let mut status = self.status.lock().await;
            if status.is_connecting {
                return Err(AmqpError::ConnectionInProgress);
            }
            if status.state == ConnectionState::Connected {
                return Ok(());
            }
            status.is_connecting = true;
            status.is_closing = false;
            status.state = ConnectionState::Connecting;
        }

        self.shutdown.send_replace(false);
        info!(host = self.config.host, vhost = self.config.vhost, "connecting to rabbitmq");

        let session = tokio::select! {
            session = broker::connect(self.broker.as_ref(), &self.config) => session,
            _ = until_closed(self.shutdown_signal()) => {
                self.finish_connecting(ConnectionState::Disconnected).await;
                return Err(AmqpError::Closed);
            }
        };

        let attached = {
            let _attaching = self.attaching.lock().await;
            *self.session.write().await = Some(session.clone());
            self.attach_routes(&session).await
        };

        if let Err(err) = attached {
            error!(error = err.to_string(), "failure to set up routes");
            self.teardown().await;
            self.finish_connecting(ConnectionState::Disconnected).await;
            return Err(err);
        }

        {
            let mut status = self.status.lock().await;
            status.is_connecting = false;
            if status.is_closing {
                drop(status);
                self.teardown().await;
                self.status.lock().await.state = ConnectionState::Disconnected;
                return Err(AmqpError::Closed);
            }
            status.state = ConnectionState::Connected;
        }

        self.supervise(&session);
        info!("queue service connected");
        Ok(())
    }

    async fn finish_connecting(&self, state: ConnectionState) {
        let mut status = self.status.lock().await;
        status.is_connecting = false;
        status.state = state;
    }

    /// Declares topology and starts a consumer for every registered route.
    async fn attach_routes(self: &Arc<Self>, session: &Arc<dyn BrokerSession>) -> Result<(), AmqpError> {
        let routes = self.router.lock().await.routes().to_vec();
        info!("registering {} routes", routes.len());

        for route in routes {
            let options = route.options.unwrap_or(self.options.consume);
            let subscription =
                consumer::consume(session.as_ref(), &self.exchanges, &route.target(), &options)
                    .await?;

            let registration = ConsumerRegistration {
                topic: route.topic.clone(),
                consumer_tag: subscription.consumer_tag,
            };
            debug!(
                topic = registration.topic,
                consumer_tag = registration.consumer_tag,
                "consumer attached"
            );

            dispatcher::spawn_consumer(
                self.clone(),
                route,
                session,
                subscription.deliveries,
                options.no_ack,
            );
            self.consumers.lock().await.push(registration);
        }

        Ok(())
    }

    /// Watches the session for a connection fault until the service closes.
    fn supervise(self: &Arc<Self>, session: &Arc<dyn BrokerSession>) {
        let inner = self.clone();
        let origin = Arc::downgrade(session);
        let faults = session.faults();
        let shutdown = self.shutdown_signal();

        tokio::spawn(async move {
            let reason = tokio::select! {
                reason = next_fault(faults) => reason,
                _ = until_closed(shutdown) => None,
            };

            let Some(reason) = reason else {
                return;
            };

            let still_current = match (origin.upgrade(), inner.current_session().await) {
                (Some(faulted), Some(current)) => Arc::ptr_eq(&faulted, &current),
                _ => false,
            };
            if !still_current {
                debug!(reason, "fault from a stale connection ignored");
                return;
            }

            inner.recover(reason).await;
        });
    }

    /// Tears down the faulted connection and reconnects unless the service is closing.
    async fn recover(self: Arc<Self>, reason: String) {
        warn!(reason, "rabbitmq connection lost");

        {
            let mut status = self.status.lock().await;
            if status.is_closing {
                return;
            }
            status.state = ConnectionState::Closing;
        }
        self.teardown().await;

        loop {
            {
                let mut status = self.status.lock().await;
                if status.is_closing || status.is_connecting {
                    debug!("skipping reconnection, service is closing or already connecting");
                    if !status.is_connecting {
                        status.state = ConnectionState::Disconnected;
                    }
                    return;
                }
                status.state = ConnectionState::Disconnected;
            }

            info!("reconnecting to rabbitmq");
            match self.connect().await {
                Ok(()) => return,
                Err(AmqpError::Closed) | Err(AmqpError::ConnectionInProgress) => return,
                Err(err) => {
                    error!(error = err.to_string(), "reconnection failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnection_delay()) => {}
                        _ = until_closed(self.shutdown_signal()) => return,
                    }
                }
            }
        }
    }

    async fn register(self: &Arc<Self>, routes: Vec<Route>) -> Result<(), AmqpError> {
        Router::validate(&routes)?;
        self.router.lock().await.replace(routes)?;

        let _attaching = self.attaching.lock().await;
        let Some(session) = self.current_session().await else {
            debug!("not connected, routes will be consumed on connect");
            return Ok(());
        };

        self.cancel_consumers(session.as_ref()).await;
        self.attach_routes(&session).await
    }

    async fn cancel_consumers(&self, session: &dyn BrokerSession) {
        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for consumer in consumers {
            if let Err(err) = session.cancel(&consumer.consumer_tag).await {
                debug!(
                    error = err.to_string(),
                    topic = consumer.topic,
                    "failure to cancel consumer"
                );
            }
        }
    }

    /// Drops the current session: cancels its consumers and closes it. Best effort.
    async fn teardown(&self) {
        let _attaching = self.attaching.lock().await;
        let session = self.session.write().await.take();
        let Some(session) = session else {
            return;
        };

        self.cancel_consumers(session.as_ref()).await;
        if let Err(err) = session.close().await {
            warn!(error = err.to_string(), "error closing previous connection");
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        {
            let mut status = self.status.lock().await;
            status.is_closing = true;
            status.state = ConnectionState::Closing;
        }

        self.shutdown.send_replace(true);
        self.router.lock().await.clear();
        self.teardown().await;

        self.status.lock().await.state = ConnectionState::Disconnected;
        info!("queue service closed");
        Ok(())
    }

    /// One publish attempt on the current session.
    async fn publish_once(&self, message: &PublishMessage) -> Result<bool, AmqpError> {
        let session = self.current_session().await.ok_or(AmqpError::NotConnected)?;
        publisher::publish(
            session.as_ref(),
            &self.exchanges,
            message,
            &self.config.app_name,
        )
        .await
    }

    /// Publishes with the service retry policy: a fixed delay between attempts.
    pub(crate) async fn publish_retry(&self, message: PublishMessage) -> Result<(), AmqpError> {
        let policy = self.options.retry;

        for attempt in 1..=policy.retries {
            debug!(attempt, key = message.key, "trying to publish");
            match self.publish_once(&message).await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(attempt, key = message.key, "publish refused by the broker"),
                Err(err) => debug!(attempt, key = message.key, error = err.to_string(), "publish failed"),
            }

            if attempt < policy.retries {
                tokio::time::sleep(policy.time).await;
            }
        }

        error!(key = message.key, "failed after: {} times", policy.retries);
        Err(AmqpError::PublishExhausted {
            key: message.key,
            attempts: policy.retries,
        })
    }

    pub(crate) async fn publish_to_error_queue(
        &self,
        mut envelope: RawEnvelope,
        response: Value,
    ) -> Result<(), AmqpError> {
        envelope.set_response(response);

        let message = PublishMessage::new(&self.config.error_topic, envelope)
            .queue(&self.config.error_queue);

        match self.publish_once(&message).await {
            Ok(true) => {
                debug!(queue = self.config.error_queue, "message sent to the error queue");
                Ok(())
            }
            Ok(false) => Err(AmqpError::PublishingToErrorQueueError(
                "refused by the broker".to_owned(),
            )),
            Err(err) => Err(AmqpError::PublishingToErrorQueueError(err.to_string())),
        }
    }
}

/// Resolves once the service is closed.
pub(crate) async fn until_closed(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Waits for the session's fault signal. `None` when the session dropped its sender
/// without ever faulting.
async fn next_fault(mut faults: watch::Receiver<Option<String>>) -> Option<String> {
    loop {
        if let Some(reason) = faults.borrow_and_update().clone() {
            return Some(reason);
        }
        if faults.changed().await.is_err() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Delivery, MockBroker, MockBrokerSession, Subscription},
        config::RetryPolicy,
        errors::HandlerError,
        message::Request,
        reply::Reply,
    };
    use futures_util::{stream, StreamExt};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> BrokerConfig {
        BrokerConfig::new("localhost", 5672, "guest", "guest", "/", "events", "errors", "errors.topic")
    }

    fn options(retries: u32) -> ServiceOptions {
        ServiceOptions {
            retry: RetryPolicy {
                retries,
                time: Duration::from_millis(100),
            },
            ..Default::default()
        }
    }

    fn quiet_session() -> MockBrokerSession {
        let mut session = MockBrokerSession::new();
        session.expect_declare_exchange().returning(|_| Ok(()));
        session
            .expect_declare_queue()
            .returning(|def| Ok(def.name().to_owned()));
        session.expect_bind_queue().returning(|_| Ok(()));
        session.expect_faults().returning(|| watch::channel(None).1);
        session.expect_cancel().returning(|_| Ok(()));
        session.expect_close().returning(|| Ok(()));
        session
    }

    fn broker_with(session: MockBrokerSession) -> Arc<dyn Broker> {
        let session: Arc<dyn BrokerSession> = Arc::new(session);
        let mut broker = MockBroker::new();
        broker
            .expect_connect()
            .returning(move |_| Ok(session.clone()));
        Arc::new(broker)
    }

    async fn ok(_: Request, reply: Reply) -> Result<(), HandlerError> {
        reply.send(Value::Null);
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = config();
        cfg.exchange = String::new();

        let err = QueueService::new(cfg, Arc::new(MockBroker::new())).err();
        assert!(matches!(err, Some(AmqpError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn register_rejects_before_touching_the_broker() {
        // Any broker call would panic on the bare mock.
        let service = QueueService::new(config(), Arc::new(MockBroker::new())).unwrap();

        let err = service
            .register(vec![Route::new("orders", ok), Route::new("orders", ok)])
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::InvalidRoute(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn publishing_before_connect_exhausts_the_retries() {
        let service =
            QueueService::with_options(config(), options(3), Arc::new(MockBroker::new())).unwrap();

        let err = service
            .publish_to_topic("orders", json!({"payload": {}}), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AmqpError::PublishExhausted {
                key: "orders".to_owned(),
                attempts: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refused_publishes_are_retried_with_a_fixed_delay() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let mut session = quiet_session();
        session.expect_publish().returning(move |_, _, _, _| {
            Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2)
        });

        let service =
            QueueService::with_options(config(), options(5), broker_with(session)).unwrap();
        service.connect().await.unwrap();

        let started = tokio::time::Instant::now();
        service
            .publish_to_topic("orders", "hello", None)
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn delayed_publish_requires_the_delayed_exchange() {
        let service = QueueService::new(config(), Arc::new(MockBroker::new())).unwrap();

        let err = service
            .publish_delayed_http_to_topic("orders", HttpMessage::new(json!({})), None)
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::DelayedExchangeDisabled);
    }

    #[tokio::test]
    async fn error_queue_publish_is_a_single_attempt() {
        let mut session = quiet_session();
        session
            .expect_publish()
            .withf(|exchange, key, body, _| {
                let doc: Value = serde_json::from_slice(body).unwrap();
                exchange == "events"
                    && key == "errors.topic"
                    && doc["response"] == json!("boom")
                    && doc["payload"] == json!({"id": 1})
            })
            .times(1)
            .returning(|_, _, _, _| Ok(false));

        let service = QueueService::new(config(), broker_with(session)).unwrap();
        service.connect().await.unwrap();

        let (_, envelope) = crate::message::decode(
            "orders",
            crate::message::METHOD_NAME,
            br#"{"payload":{"id":1}}"#,
        );
        let err = service
            .publish_to_error_queue(envelope, json!("boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::PublishingToErrorQueueError(_)));
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_close_disconnects() {
        let mut session = quiet_session();
        session.expect_consume().times(1).returning(|queue, _, _| {
            Ok(Subscription {
                consumer_tag: format!("{queue}-tag"),
                deliveries: stream::pending::<Delivery>().boxed(),
            })
        });

        let mut broker = MockBroker::new();
        let session: Arc<dyn BrokerSession> = Arc::new(session);
        broker
            .expect_connect()
            .times(1)
            .returning(move |_| Ok(session.clone()));

        let service = QueueService::new(config(), Arc::new(broker)).unwrap();
        service.register(vec![Route::new("orders", ok)]).await.unwrap();

        service.connect().await.unwrap();
        service.connect().await.unwrap();
        assert_eq!(service.state().await, ConnectionState::Connected);

        service.close().await.unwrap();
        assert_eq!(service.state().await, ConnectionState::Disconnected);
    }
}
