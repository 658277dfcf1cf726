// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Router
//!
//! In-memory registry mapping each topic to the handler that serves it. Registration
//! order is kept because it decides the order in which consumers are set up.

use crate::{
    config::ConsumeOptions,
    errors::{AmqpError, HandlerError},
    message::Request,
    queue::QueueTarget,
    reply::Reply,
};
use async_trait::async_trait;
use std::{collections::HashSet, fmt, future::Future, sync::Arc};

/// Application code serving one topic.
///
/// Returning an error (or panicking) dead-letters the delivery with the error message.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request, reply: Reply) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request, Reply) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request, reply: Reply) -> Result<(), HandlerError> {
        (self)(request, reply).await
    }
}

/// A topic bound to its handler.
#[derive(Clone)]
pub struct Route {
    pub(crate) topic: String,
    pub(crate) queue: Option<String>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) options: Option<ConsumeOptions>,
}

impl Route {
    /// Creates a route consuming `topic` from a queue of the same name.
    ///
    /// # Parameters
    /// * `topic` - The routing key the queue is bound under
    /// * `handler` - Any `Handler`, including an `async fn(Request, Reply)`
    ///
    /// # Returns
    /// A route using the service's default consume options
    pub fn new(topic: &str, handler: impl Handler + 'static) -> Route {
        Route {
            topic: topic.to_owned(),
            queue: None,
            handler: Arc::new(handler),
            options: None,
        }
    }

    /// Consumes from an explicit queue instead of one named after the topic.
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_owned());
        self
    }

    /// Overrides the service's consume options for this route only.
    pub fn options(mut self, options: ConsumeOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queue and topic this route consumes from.
    pub fn target(&self) -> QueueTarget {
        let target = QueueTarget::new(&self.topic);
        match &self.queue {
            Some(queue) => target.queue(queue),
            None => target,
        }
    }

    fn validate(&self) -> Result<(), AmqpError> {
        if self.topic.is_empty() {
            return Err(AmqpError::InvalidRoute(format!("{self:?}: empty topic")));
        }
        if matches!(&self.queue, Some(queue) if queue.is_empty()) {
            return Err(AmqpError::InvalidRoute(format!("{self:?}: empty queue name")));
        }
        Ok(())
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("topic", &self.topic)
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Ordered set of routes, one handler per topic.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    /// Adds one route.
    pub fn register(&mut self, route: Route) -> Result<(), AmqpError> {
        route.validate()?;
        if self.route(&route.topic).is_some() {
            return Err(AmqpError::InvalidRoute(format!(
                "{route:?}: topic already registered"
            )));
        }
        self.routes.push(route);
        Ok(())
    }

    /// Replaces the whole route set. Nothing changes if any route is rejected.
    pub fn replace(&mut self, routes: Vec<Route>) -> Result<(), AmqpError> {
        Router::validate(&routes)?;
        self.routes = routes;
        Ok(())
    }

    /// Checks a route set without registering it.
    pub fn validate(routes: &[Route]) -> Result<(), AmqpError> {
        let mut topics = HashSet::new();
        for route in routes {
            route.validate()?;
            if !topics.insert(route.topic.as_str()) {
                return Err(AmqpError::InvalidRoute(format!(
                    "{route:?}: duplicated topic"
                )));
            }
        }
        Ok(())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Looks up the route serving `topic`.
    pub fn route(&self, topic: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.topic == topic)
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
