// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module is the lapin-backed implementation of the broker capability surface. It
//! establishes the connection and its channel, applies QoS and publisher confirms, and
//! translates lapin deliveries and errors into the router's own types.

use crate::{
    broker::{Broker, BrokerSession, Delivery, DeliveryStream, PublishProperties, Subscription},
    config::BrokerConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error};
use uuid::Uuid;

/// Header read by the delayed message exchange plugin
pub const AMQP_HEADERS_DELAY: &str = "x-delay";

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBroker;

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, cfg: &BrokerConfig) -> Result<Arc<dyn BrokerSession>, AmqpError> {
        let session = new_amqp_channel(cfg).await?;
        Ok(Arc::new(session))
    }
}

/// One lapin connection with its channel.
pub struct AmqpSession {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    faults: Arc<watch::Sender<Option<String>>>,
}

/// Creates a new AMQP connection and channel.
///
/// The channel gets the configured prefetch and publisher confirms, and connection errors
/// are forwarded to the session's fault signal.
pub async fn new_amqp_channel(cfg: &BrokerConfig) -> Result<AmqpSession, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }?;

    if let Err(err) = channel
        .basic_qos(cfg.prefetch, BasicQosOptions { global: false })
        .await
    {
        error!(error = err.to_string(), "error to configure qos");
        return Err(AmqpError::QoSDeclarationError(err.to_string()));
    }

    if let Err(err) = channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
    {
        error!(error = err.to_string(), "error to enable publisher confirms");
        return Err(AmqpError::ChannelError(err.to_string()));
    }
    debug!("channel created");

    let (tx, _) = watch::channel(None);
    let faults = Arc::new(tx);
    let signal = faults.clone();
    conn.on_error(move |err| {
        signal.send_replace(Some(err.to_string()));
    });

    Ok(AmqpSession {
        connection: Arc::new(conn),
        channel: Arc::new(channel),
        faults,
    })
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let params = def
            .params
            .iter()
            .map(|(k, v)| {
                (
                    ShortString::from(k.clone()),
                    AMQPValue::LongString(LongString::from(v.clone())),
                )
            })
            .collect::<BTreeMap<_, _>>();
        let kind: lapin::ExchangeKind = def.kind.clone().try_into()?;

        match self
            .channel
            .exchange_declare(
                &def.name,
                kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::from(params),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(queue.name().to_string()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<bool, AmqpError> {
        let mut headers = properties
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    ShortString::from(k.clone()),
                    AMQPValue::LongString(LongString::from(v.clone())),
                )
            })
            .collect::<BTreeMap<_, _>>();

        if let Some(delay) = properties.delay {
            headers.insert(
                ShortString::from(AMQP_HEADERS_DELAY),
                AMQPValue::LongLongInt(LongLongInt::try_from(delay).unwrap_or(LongLongInt::MAX)),
            );
        }

        let props = BasicProperties::default()
            .with_content_type(ShortString::from(properties.content_type.clone()))
            .with_message_id(ShortString::from(properties.message_id.clone()))
            .with_delivery_mode(if properties.persistent { 2 } else { 1 })
            .with_headers(FieldTable::from(headers));

        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Err(err) => {
                error!(error = err.to_string(), "error waiting publish confirmation");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirmation) => Ok(!confirmation.is_nack()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        exclusive: bool,
    ) -> Result<Subscription, AmqpError> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let deliveries: DeliveryStream = consumer
            .filter_map(|result| {
                future::ready(match result {
                    Ok(delivery) => Some(into_delivery(delivery)),
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        None
                    }
                })
            })
            .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::CancelConsumerError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))?;
        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }

    fn faults(&self) -> watch::Receiver<Option<String>> {
        self.faults.subscribe()
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_text(value).map(|text| (key.to_string(), text))
                })
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers,
        data: delivery.data,
    }
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_text_renders_scalars() {
        assert_eq!(
            header_text(&AMQPValue::LongString(LongString::from("billing"))),
            Some("billing".to_owned())
        );
        assert_eq!(header_text(&AMQPValue::LongInt(3)), Some("3".to_owned()));
        assert_eq!(header_text(&AMQPValue::Void), None);
    }
}
