//! AMQP client abstraction used by the broker-topology adapter

use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;

/// Stream of deliveries from one `basic.consume`.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<InboundDelivery>> + Send>>;

/// A message handed to `basic.publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpMessage {
    /// Fresh message id
    pub message_id: String,
    /// `application/json` for events
    pub content_type: String,
    /// Delivery mode 2
    pub persistent: bool,
    /// Payload
    pub body: Vec<u8>,
}

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Opens connections to an AMQP broker.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// One connection attempt
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>>;
}

/// An open AMQP connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>>;

    async fn close(&self) -> Result<()>;
}

/// An AMQP channel.
///
/// Operations referring to missing queues or exchanges fail with
/// [`EventBusError::TopologyNotFound`](crate::EventBusError::TopologyNotFound).
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declare a direct exchange
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a durable, non-exclusive, non-auto-delete queue
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, message: AmqpMessage)
    -> Result<()>;

    /// Start a manual-ack consumer
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject a delivery, optionally returning it to the queue
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
