// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the integration tests.
//!
//! Exchanges are topic exchanges matched by exact routing key. Messages published to a
//! queue with no consumer wait in a backlog until one subscribes.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rabbitmq_router::{
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    AmqpError, Broker, BrokerConfig, BrokerSession, Delivery, PublishProperties, Subscription,
};
use serde_json::Value;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{mpsc, watch};

/// A message as it went through the broker.
#[derive(Debug, Clone)]
pub struct Published {
    pub session: usize,
    pub exchange: String,
    pub routing_key: String,
    pub properties: PublishProperties,
    pub data: Vec<u8>,
}

impl Published {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.data).unwrap_or(Value::Null)
    }
}

struct Subscriber {
    session: usize,
    consumer_tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct State {
    connect_failures: u32,
    connects: u32,
    reject_publishes: bool,
    next_tag: u64,
    next_consumer: u64,
    exchanges: BTreeSet<String>,
    queue_declarations: Vec<String>,
    bindings: BTreeSet<(String, String, String)>,
    backlog: HashMap<String, VecDeque<Delivery>>,
    subscribers: HashMap<String, Subscriber>,
    /// Every consumer ever started, as (session, queue, consumer tag).
    consumers: Vec<(usize, String, String)>,
    published: Vec<Published>,
    acks: Vec<(usize, u64)>,
    cancelled: Vec<String>,
    faults: Vec<watch::Sender<Option<String>>>,
    closed: BTreeSet<usize>,
}

impl State {
    fn route(&mut self, exchange: &str, routing_key: &str, delivery: Delivery) {
        let queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|(ex, key, _)| ex == exchange && key == routing_key)
            .map(|(_, _, queue)| queue.clone())
            .collect();

        for queue in queues {
            self.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: self.next_tag,
                ..delivery.clone()
            };
            self.deliver(&queue, delivery);
        }
    }

    fn deliver(&mut self, queue: &str, delivery: Delivery) {
        if let Some(subscriber) = self.subscribers.get(queue) {
            if subscriber.tx.send(delivery.clone()).is_ok() {
                return;
            }
            self.subscribers.remove(queue);
        }
        self.backlog
            .entry(queue.to_owned())
            .or_default()
            .push_back(delivery);
    }

    fn drop_session(&mut self, session: usize) {
        self.closed.insert(session);
        self.subscribers.retain(|_, sub| sub.session != session);
    }
}

/// Shared handle to the in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().unwrap().connect_failures = count;
    }

    pub fn reject_publishes(&self, reject: bool) {
        self.state.lock().unwrap().reject_publishes = reject;
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    /// Closes the latest session the way a broker-side connection drop would.
    pub fn simulate_close(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(session) = state.faults.len().checked_sub(1) else {
            return;
        };
        state.drop_session(session);
        state.faults[session].send_replace(Some(reason.to_owned()));
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.routing_key == routing_key)
            .collect()
    }

    pub fn acks(&self) -> Vec<(usize, u64)> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn exchanges(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().exchanges.clone()
    }

    pub fn queue_declarations(&self) -> Vec<String> {
        self.state.lock().unwrap().queue_declarations.clone()
    }

    pub fn bindings(&self) -> BTreeSet<(String, String, String)> {
        self.state.lock().unwrap().bindings.clone()
    }

    /// Consumers on `queue` that were started and neither cancelled nor closed with
    /// their session.
    pub fn live_consumers(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .consumers
            .iter()
            .filter(|(session, q, tag)| {
                q == queue && !state.closed.contains(session) && !state.cancelled.contains(tag)
            })
            .count()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state.lock().unwrap().subscribers.contains_key(queue)
    }

    pub fn backlog(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .backlog
            .get(queue)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, _cfg: &BrokerConfig) -> Result<Arc<dyn BrokerSession>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let (faults, _) = watch::channel(None);
        state.faults.push(faults);

        Ok(Arc::new(MemorySession {
            id: state.faults.len() - 1,
            state: self.state.clone(),
        }))
    }
}

pub struct MemorySession {
    id: usize,
    state: Arc<Mutex<State>>,
}

impl MemorySession {
    fn open(&self) -> Result<std::sync::MutexGuard<'_, State>, AmqpError> {
        let state = self.state.lock().unwrap();
        if state.closed.contains(&self.id) {
            return Err(AmqpError::ChannelError("channel closed".to_owned()));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.open()?.exchanges.insert(def.name().to_owned());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.open()?.queue_declarations.push(def.name().to_owned());
        Ok(def.name().to_owned())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open()?;
        if !state.exchanges.contains(binding.exchange_name()) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }
        state.bindings.insert((
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
            binding.queue_name().to_owned(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<bool, AmqpError> {
        let mut state = self.open()?;
        if state.reject_publishes {
            return Ok(false);
        }

        state.published.push(Published {
            session: self.id,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            data: body.to_vec(),
        });

        let delivery = Delivery {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            headers: properties.headers.clone(),
            data: body.to_vec(),
            ..Default::default()
        };
        state.route(exchange, routing_key, delivery);
        Ok(true)
    }

    async fn consume(
        &self,
        queue: &str,
        _no_ack: bool,
        _exclusive: bool,
    ) -> Result<Subscription, AmqpError> {
        let mut state = self.open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let pending = state.backlog.remove(queue).unwrap_or_default();
        for delivery in pending {
            let _ = tx.send(delivery);
        }

        let consumer_tag = format!("{queue}-{}", state.next_consumer);
        state.next_consumer += 1;
        state
            .consumers
            .push((self.id, queue.to_owned(), consumer_tag.clone()));
        state.subscribers.insert(
            queue.to_owned(),
            Subscriber {
                session: self.id,
                consumer_tag: consumer_tag.clone(),
                tx,
            },
        );

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.open()?;
        state.acks.push((self.id, delivery_tag));
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.open()?;
        state.subscribers.retain(|_, sub| sub.consumer_tag != consumer_tag);
        state.cancelled.push(consumer_tag.to_owned());
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.lock().unwrap().drop_session(self.id);
        Ok(())
    }

    fn faults(&self) -> watch::Receiver<Option<String>> {
        self.state.lock().unwrap().faults[self.id].subscribe()
    }
}

pub fn config() -> BrokerConfig {
    let mut cfg = BrokerConfig::new(
        "localhost",
        5672,
        "guest",
        "guest",
        "/",
        "events",
        "errors",
        "errors.topic",
    );
    cfg.app_name = "billing".to_owned();
    cfg.time_between_retries = 50;
    cfg.reconnection_time = 100;
    cfg
}

/// Polls `check` until it holds, advancing time in small steps. Panics after `limit`.
pub async fn eventually<F>(limit: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
