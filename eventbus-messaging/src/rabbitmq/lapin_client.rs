//! lapin-backed AMQP client

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind, options::*,
    types::FieldTable,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::channel::{
    AmqpChannel, AmqpConnection, AmqpConnector, AmqpMessage, DeliveryStream, InboundDelivery,
};
use crate::config::RabbitMqConnection;
use crate::error::{EventBusError, Result};

/// Connects to RabbitMQ with lapin
#[derive(Debug, Clone)]
pub struct LapinConnector {
    url: String,
    connection_name: Option<String>,
}

impl LapinConnector {
    pub fn new(config: &RabbitMqConnection) -> Self {
        Self {
            url: config.url.clone(),
            connection_name: config.connection_name.clone(),
        }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(|e| EventBusError::Connectivity(e.to_string()))?;
        info!("Connected to RabbitMQ");
        Ok(Arc::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(exchange, "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(queue, "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: AmqpMessage,
    ) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_message_id(message.message_id.into())
            .with_content_type(message.content_type.into());
        if message.persistent {
            properties = properties.with_delivery_mode(2);
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|item| {
            item.map(|delivery| InboundDelivery {
                delivery_tag: delivery.delivery_tag,
                routing_key: delivery.routing_key.to_string(),
                message_id: delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.to_string()),
                redelivered: delivery.redelivered,
                body: delivery.data,
            })
            .map_err(EventBusError::from)
        });
        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| EventBusError::Acknowledge(e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| EventBusError::Acknowledge(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(200, "Normal shutdown").await?;
        Ok(())
    }
}
