// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The router publishes and consumes through a topic exchange. When delayed delivery is
//! enabled a second `x-delayed-message` exchange is declared next to it, routing with
//! topic semantics once the delay expires.

use crate::{config::ExchangeOptions, errors::AmqpError};
use std::collections::BTreeMap;

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Suffix appended to the main exchange name for the delayed exchange
pub const DELAYED_EXCHANGE_SUFFIX: &str = "_delayed";

/// Represents the types of exchanges the router declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Topic,
    XMessageDelayed,
}

impl TryInto<lapin::ExchangeKind> for ExchangeKind {
    type Error = AmqpError;

    fn try_into(self) -> Result<lapin::ExchangeKind, AmqpError> {
        match self {
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::XMessageDelayed => {
                Ok(lapin::ExchangeKind::Custom("x-delayed-message".to_owned()))
            }
        }
    }
}

/// Definition of an exchange with its declaration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) params: BTreeMap<String, String>,
}

impl ExchangeDefinition {
    /// Creates a topic exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Topic,
            durable: false,
            delete: false,
            params: BTreeMap::default(),
        }
    }

    /// Main topic exchange of the router, flagged from the service options.
    ///
    /// # Parameters
    /// * `name` - The exchange name
    /// * `options` - Durability and auto-delete flags
    ///
    /// # Returns
    /// A topic exchange definition
    pub fn topic(name: &str, options: &ExchangeOptions) -> ExchangeDefinition {
        let mut def = ExchangeDefinition::new(name);
        if options.durable {
            def = def.durable();
        }
        if options.auto_delete {
            def = def.delete();
        }
        def
    }

    /// Delayed companion of a topic exchange, sharing its flags.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    ///
    /// # Parameters
    /// * `main` - The main exchange the delayed one forwards to by topic
    ///
    /// # Returns
    /// An `x-delayed-message` exchange definition named `<main>_delayed`
    pub fn topic_delayed(main: &ExchangeDefinition) -> ExchangeDefinition {
        ExchangeDefinition {
            name: format!("{}{}", main.name, DELAYED_EXCHANGE_SUFFIX),
            ..main.clone()
        }
        .kind(ExchangeKind::XMessageDelayed)
        .param(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE, "topic")
    }

    /// Sets the type of the exchange.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the exchange once its last binding is removed.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Adds a declaration argument.
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}
