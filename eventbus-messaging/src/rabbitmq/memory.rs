//! In-memory AMQP broker
//!
//! Direct-exchange routing, durable queues, manual acknowledgement and
//! redelivery, with hooks for injecting faults. Used by the test suite and for
//! running services locally without RabbitMQ.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use super::channel::{
    AmqpChannel, AmqpConnection, AmqpConnector, AmqpMessage, DeliveryStream, InboundDelivery,
};
use crate::error::{EventBusError, Result};

/// A message as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// A message accepted by `basic.publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: AmqpMessage,
}

type DeliverySender = mpsc::UnboundedSender<Result<InboundDelivery>>;

struct Consumer {
    tag: String,
    channel: u64,
    sender: DeliverySender,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Unacked {
    channel: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    failing_publishes: u32,
    failing_consumes: u32,
    connect_attempts: u32,
    publish_attempts: u32,
    acks: u32,
    next_id: u64,
    open_connections: HashSet<u64>,
    /// channel id -> owning connection id
    open_channels: HashMap<u64, u64>,
    /// exchange -> (queue, routing key)
    exchanges: HashMap<String, HashSet<(String, String)>>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    dead_lettered: Vec<StoredMessage>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.open_channels
            .get(&channel)
            .is_some_and(|connection| self.open_connections.contains(connection))
    }

    fn close_channel(&mut self, channel: u64) {
        self.open_channels.remove(&channel);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.channel != channel);
        }

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        // Requeued at the front, so walk from the newest delivery back.
        orphaned.sort_unstable_by(|a, b| b.cmp(a));
        for tag in orphaned {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }

    fn close_connection(&mut self, connection: u64) {
        self.open_connections.remove(&connection);
        let channels: Vec<u64> = self
            .open_channels
            .iter()
            .filter(|(_, owner)| **owner == connection)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
    }

    fn take_unacked(&mut self, channel: u64, delivery_tag: u64) -> Result<Unacked> {
        match self.unacked.remove(&delivery_tag) {
            Some(unacked) if unacked.channel == channel => Ok(unacked),
            other => {
                if let Some(unacked) = other {
                    self.unacked.insert(delivery_tag, unacked);
                }
                Err(EventBusError::Acknowledge(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )))
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    /// Channel-level errors close the channel, as an AMQP broker does.
    fn not_found(&mut self, channel: u64, what: String) -> EventBusError {
        self.close_channel(channel);
        EventBusError::TopologyNotFound(format!("NOT_FOUND - {}", what))
    }

    /// Hand ready messages to consumers, round robin.
    fn pump(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            loop {
                let Some(queue) = self.queues.get_mut(&name) else {
                    break;
                };
                if queue.consumers.is_empty() || queue.ready.is_empty() {
                    break;
                }
                let index = queue.next_consumer % queue.consumers.len();
                queue.next_consumer = queue.next_consumer.wrapping_add(1);
                let Some(message) = queue.ready.pop_front() else {
                    break;
                };

                self.next_id += 1;
                let tag = self.next_id;
                let Some(queue) = self.queues.get_mut(&name) else {
                    break;
                };
                let consumer = &queue.consumers[index];
                let delivery = InboundDelivery {
                    delivery_tag: tag,
                    routing_key: message.routing_key.clone(),
                    message_id: Some(message.message_id.clone()),
                    redelivered: message.redelivered,
                    body: message.body.clone(),
                };

                if consumer.sender.send(Ok(delivery)).is_err() {
                    queue.consumers.remove(index);
                    queue.ready.push_front(message);
                    continue;
                }

                trace!(queue = %name, delivery_tag = tag, "Delivered message");
                let channel = consumer.channel;
                self.unacked.insert(
                    tag,
                    Unacked {
                        channel,
                        queue: name.clone(),
                        message,
                    },
                );
            }
        }
    }
}

/// In-memory AMQP broker
///
/// Cloning yields another handle to the same broker. The broker itself is the
/// [`AmqpConnector`].
#[derive(Clone, Default)]
pub struct InMemoryAmqpBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryAmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Fail the next `count` publishes with a connectivity error
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().failing_publishes = count;
    }

    /// Make the next `count` `basic.consume` calls fail
    pub fn fail_next_consumes(&self, count: u32) {
        self.state.lock().failing_consumes = count;
    }

    /// Drop every open connection, as a broker restart would
    pub fn sever_connections(&self) {
        let mut state = self.state.lock();
        let connections: Vec<u64> = state.open_connections.iter().copied().collect();
        for connection in connections {
            state.close_connection(connection);
        }
    }

    /// Delete a queue, cancelling its consumers
    pub fn delete_queue(&self, queue: &str) {
        let mut state = self.state.lock();
        state.queues.remove(queue);
        for bindings in state.exchanges.values_mut() {
            bindings.retain(|(bound, _)| bound != queue);
        }
    }

    pub fn delete_exchange(&self, exchange: &str) {
        self.state.lock().exchanges.remove(exchange);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn publish_attempts(&self) -> u32 {
        self.state.lock().publish_attempts
    }

    /// Total successful acknowledgements
    pub fn ack_count(&self) -> u32 {
        self.state.lock().acks
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Messages rejected without requeue
    pub fn dead_lettered(&self) -> Vec<StoredMessage> {
        self.state.lock().dead_lettered.clone()
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .is_some_and(|bindings| {
                bindings.contains(&(queue.to_string(), routing_key.to_string()))
            })
    }

    /// Messages waiting in a queue
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Delivered but not yet settled messages
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    pub fn open_channel_count(&self) -> usize {
        self.state.lock().open_channels.len()
    }
}

#[async_trait]
impl AmqpConnector for InMemoryAmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.unreachable {
            return Err(EventBusError::Connectivity(
                "connection refused: broker unreachable".to_string(),
            ));
        }
        let id = state.next_id();
        state.open_connections.insert(id);
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.state.lock().open_connections.contains(&self.id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let mut state = self.state.lock();
        if !state.open_connections.contains(&self.id) {
            return Err(EventBusError::Connectivity("connection closed".to_string()));
        }
        let id = state.next_id();
        state.open_channels.insert(id, self.id);
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.close_connection(self.id);
        state.pump();
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<parking_lot::MutexGuard<'_, BrokerState>> {
        let state = self.state.lock();
        if !state.channel_open(self.id) {
            return Err(EventBusError::ChannelClosed(format!(
                "channel {} is closed",
                self.id
            )));
        }
        Ok(state)
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.state.lock().channel_open(self.id)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let mut state = self.open_state()?;
        state.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.open_state()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(state.not_found(self.id, format!("no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(state.not_found(self.id, format!("no exchange '{}'", exchange)));
        }
        if let Some(bindings) = state.exchanges.get_mut(exchange) {
            bindings.insert((queue.to_string(), routing_key.to_string()));
        }
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(state.not_found(self.id, format!("no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(state.not_found(self.id, format!("no exchange '{}'", exchange)));
        }
        if let Some(bindings) = state.exchanges.get_mut(exchange) {
            bindings.remove(&(queue.to_string(), routing_key.to_string()));
        }
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        self.open_state()?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: AmqpMessage,
    ) -> Result<()> {
        let mut state = self.open_state()?;
        state.publish_attempts += 1;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(EventBusError::Connectivity(
                "connection reset during publish".to_string(),
            ));
        }

        if !state.exchanges.contains_key(exchange) {
            return Err(state.not_found(self.id, format!("no exchange '{}'", exchange)));
        }
        let targets: Vec<String> = state.exchanges[exchange]
            .iter()
            .filter(|(_, key)| key == routing_key)
            .map(|(queue, _)| queue.clone())
            .collect();

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(StoredMessage {
                    message_id: message.message_id.clone(),
                    routing_key: routing_key.to_string(),
                    body: message.body.clone(),
                    redelivered: false,
                });
            }
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        });
        state.pump();
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.open_state()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = self.id;
        if state.failing_consumes > 0 {
            state.failing_consumes -= 1;
            return Err(EventBusError::Topology(format!(
                "consume on '{}' refused",
                queue
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(state.not_found(self.id, format!("no queue '{}'", queue)));
        }
        if let Some(target) = state.queues.get_mut(queue) {
            target.consumers.push(Consumer {
                tag: consumer_tag.to_string(),
                channel,
                sender,
            });
        }
        state.pump();

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.open_state()?;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.tag != consumer_tag);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.open_state()?;
        state.take_unacked(self.id, delivery_tag)?;
        state.acks += 1;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.open_state()?;
        let unacked = state.take_unacked(self.id, delivery_tag)?;
        if requeue {
            state.requeue(unacked);
            state.pump();
        } else {
            state.dead_lettered.push(unacked.message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.close_channel(self.id);
        state.pump();
        Ok(())
    }
}
