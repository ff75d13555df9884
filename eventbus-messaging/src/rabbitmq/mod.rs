//! Broker-topology transport (RabbitMQ)
//!
//! One direct exchange named after `defaultTopicName`, one durable queue per
//! subscribed event named `subscriberAppName.canonicalName`, bound with the
//! canonical name as routing key.
//!
//! Every event queue has its own `basic.consume` on a shared channel. The
//! consumers forward deliveries into one bounded channel drained by a single
//! consume-loop task, which dispatches each message and settles it exactly
//! once through the channel it arrived on.

mod channel;
mod connection;
#[cfg(feature = "rabbitmq")]
mod lapin_client;
mod memory;

pub use channel::{
    AmqpChannel, AmqpConnection, AmqpConnector, AmqpMessage, DeliveryStream, InboundDelivery,
};
pub use connection::{ConnectionState, PersistentConnection};
#[cfg(feature = "rabbitmq")]
pub use lapin_client::LapinConnector;
pub use memory::{InMemoryAmqpBroker, PublishedMessage, StoredMessage};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{EventBusConfig, TransportKind};
use crate::delivery::{DeliveryPolicy, Settlement};
use crate::dispatch::Dispatcher;
use crate::error::{EventBusError, Result};
use crate::event::OutgoingEvent;
use crate::handler::{HandlerResolver, HandlerType};
use crate::naming::EventNameProcessor;
use crate::registry::{SubscriptionBinding, SubscriptionRegistry};
use crate::retry::RetryPolicy;
use crate::EventBus;

const DELIVERY_BUFFER: usize = 256;
const TRACKED_MESSAGES: usize = 10_000;

type Delivery = (Arc<dyn AmqpChannel>, InboundDelivery);

/// Delivery attempts per message id.
///
/// Bounded; the oldest entries are forgotten first.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    counts: HashMap<String, u32>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DeliveryTracker {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            counts: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Count a delivery and return how often the message has been delivered
    pub fn record(&mut self, delivery: &InboundDelivery) -> u32 {
        // Redeliveries of anonymous messages cannot be counted; a redelivered
        // one is treated as exhausted.
        let Some(id) = &delivery.message_id else {
            return if delivery.redelivered { u32::MAX } else { 1 };
        };
        if let Some(count) = self.counts.get_mut(id) {
            *count += 1;
            return *count;
        }

        while self.counts.len() >= self.capacity.max(1) {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.counts.remove(&oldest);
                }
                None => break,
            }
        }
        let count = if delivery.redelivered { 2 } else { 1 };
        self.counts.insert(id.clone(), count);
        self.order.push_back(id.clone());
        count
    }

    pub fn forget(&mut self, message_id: &str) {
        if self.counts.remove(message_id).is_some() {
            self.order.retain(|id| id != message_id);
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

struct ConsumerHandle {
    tag: String,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct Topology {
    channel: Option<Arc<dyn AmqpChannel>>,
    generation: u64,
    consumers: HashMap<String, ConsumerHandle>,
    consume_loop: Option<JoinHandle<()>>,
}

impl Topology {
    fn stop_tasks(&mut self) {
        for (_, consumer) in self.consumers.drain() {
            consumer.forwarder.abort();
        }
        if let Some(task) = self.consume_loop.take() {
            task.abort();
        }
    }
}

struct Inner {
    exchange: String,
    prefetch_count: Option<u16>,
    connection: PersistentConnection,
    dispatcher: Dispatcher,
    delivery: DeliveryPolicy,
    retry: RetryPolicy,
    topology: Mutex<Topology>,
    evictions: SyncMutex<mpsc::UnboundedReceiver<String>>,
    deliveries: mpsc::Sender<Delivery>,
    pending_deliveries: SyncMutex<Option<mpsc::Receiver<Delivery>>>,
    tracker: SyncMutex<DeliveryTracker>,
    disposed: AtomicBool,
}

/// RabbitMQ event bus
///
/// ```rust,ignore
/// let bus = EventBusRabbitMq::new(config, Arc::new(LapinConnector::new(&config.rabbitmq)), resolver).await?;
/// bus.subscribe::<OrderCreatedIntegrationEvent, OrderCreatedHandler>().await?;
/// bus.publish(&OrderCreatedIntegrationEvent::new(42)).await?;
/// ```
#[derive(Clone)]
pub struct EventBusRabbitMq {
    inner: Arc<Inner>,
}

impl EventBusRabbitMq {
    /// Create the adapter and connect to the broker
    pub async fn new(
        config: EventBusConfig,
        connector: Arc<dyn AmqpConnector>,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Result<Self> {
        config.validate()?;

        let (eviction_tx, eviction_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SubscriptionRegistry::with_eviction_channel(eviction_tx));
        let names = EventNameProcessor::from_config(&config);
        let retry = config.retry_policy();
        let (deliveries, pending) = mpsc::channel(DELIVERY_BUFFER);

        let inner = Inner {
            exchange: config.default_topic_name.clone(),
            prefetch_count: config.rabbitmq.prefetch_count,
            connection: PersistentConnection::new(connector, retry),
            dispatcher: Dispatcher::new(registry, names, resolver),
            delivery: config.delivery,
            retry,
            topology: Mutex::new(Topology::default()),
            evictions: SyncMutex::new(eviction_rx),
            deliveries,
            pending_deliveries: SyncMutex::new(Some(pending)),
            tracker: SyncMutex::new(DeliveryTracker::with_capacity(TRACKED_MESSAGES)),
            disposed: AtomicBool::new(false),
        };

        inner.connection.connect_with_retry().await?;
        info!(exchange = %inner.exchange, "RabbitMQ event bus ready");

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.inner.dispatcher.registry()
    }

    pub fn names(&self) -> &EventNameProcessor {
        self.inner.dispatcher.names()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Dispatch a raw message as the consume loop would, without settling it
    pub async fn process_event(&self, event_name: &str, payload: &[u8]) -> Result<bool> {
        self.inner.dispatcher.process_event(event_name, payload).await
    }
}

impl Inner {
    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EventBusError::Disposed);
        }
        Ok(())
    }

    fn queue_name(&self, event_name: &str) -> String {
        self.dispatcher.names().queue_name(event_name)
    }

    /// Return the shared channel, reopening it and re-provisioning every
    /// registered event when it was lost.
    async fn ensure_channel(
        self: &Arc<Self>,
        topology: &mut Topology,
    ) -> Result<Arc<dyn AmqpChannel>> {
        let generation = self.connection.generation();
        if let Some(channel) = &topology.channel {
            if channel.is_open() && topology.generation == generation {
                return Ok(channel.clone());
            }
        }

        let channel = self.connection.create_channel().await?;
        if let Some(prefetch) = self.prefetch_count {
            channel.set_prefetch(prefetch).await?;
        }
        let recovering = topology.channel.is_some();
        topology.channel = Some(channel.clone());
        topology.generation = generation;

        if recovering {
            let events = self.dispatcher.registry().event_names();
            info!(events = events.len(), "Channel reopened, re-provisioning topology");
            for event in events {
                self.provision_event(&channel, &event).await?;
                self.start_consumer(topology, &channel, &event).await?;
            }
        }
        Ok(channel)
    }

    async fn provision_event(&self, channel: &Arc<dyn AmqpChannel>, event_name: &str) -> Result<()> {
        let queue = self.queue_name(event_name);
        channel.declare_exchange(&self.exchange).await?;
        channel.declare_queue(&queue).await?;
        channel.bind_queue(&queue, &self.exchange, event_name).await?;
        info!(queue = %queue, exchange = %self.exchange, routing_key = %event_name, "Queue bound");
        Ok(())
    }

    async fn start_consumer(
        self: &Arc<Self>,
        topology: &mut Topology,
        channel: &Arc<dyn AmqpChannel>,
        event_name: &str,
    ) -> Result<()> {
        if let Some(previous) = topology.consumers.remove(event_name) {
            previous.forwarder.abort();
        }

        let queue = self.queue_name(event_name);
        let tag = format!("{}-{}", queue, uuid::Uuid::new_v4().simple());
        let stream = channel.consume(&queue, &tag).await?;
        let forwarder = spawn_forwarder(
            Arc::downgrade(self),
            event_name.to_string(),
            tag.clone(),
            channel.clone(),
            stream,
            self.deliveries.clone(),
        );
        debug!(queue = %queue, consumer_tag = %tag, "Consumer started");
        topology
            .consumers
            .insert(event_name.to_string(), ConsumerHandle { tag, forwarder });
        Ok(())
    }

    fn start_consume_loop(self: &Arc<Self>, topology: &mut Topology) {
        if topology.consume_loop.is_some() {
            return;
        }
        let Some(receiver) = self.pending_deliveries.lock().take() else {
            return;
        };
        topology.consume_loop = Some(tokio::spawn(consume_loop(Arc::downgrade(self), receiver)));
        debug!("Consume loop started");
    }

    async fn handle_delivery(&self, channel: Arc<dyn AmqpChannel>, delivery: InboundDelivery) {
        let event_name = self.dispatcher.names().canonical_name(&delivery.routing_key);
        let delivery_count = self.tracker.lock().record(&delivery);

        let outcome = self
            .dispatcher
            .process_event(&event_name, &delivery.body)
            .await;
        let settlement = self.delivery.settle(&event_name, &outcome, delivery_count);

        if settlement != Settlement::Requeue {
            if let Some(id) = &delivery.message_id {
                self.tracker.lock().forget(id);
            }
        }

        let tag = delivery.delivery_tag;
        let result = match settlement {
            Settlement::Ack => channel.ack(tag).await,
            Settlement::Requeue => channel.reject(tag, true).await,
            Settlement::DeadLetter => channel.reject(tag, false).await,
        };
        if let Err(e) = result {
            error!(event = %event_name, delivery_tag = tag, error = %e, "Failed to settle message");
        }
    }

    /// Restart a consumer whose stream ended while still registered.
    async fn recover(self: Arc<Self>, event_name: String, consumer_tag: String) {
        let mut topology = self.topology.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let current = topology
            .consumers
            .get(&event_name)
            .is_some_and(|consumer| consumer.tag == consumer_tag);
        if !current || !self.dispatcher.registry().has_subscriptions(&event_name) {
            return;
        }

        warn!(event = %event_name, "Consumer stopped unexpectedly, recovering");
        let result = async {
            self.connection.connect_with_retry().await?;
            let generation = self.connection.generation();
            let channel = self.ensure_channel(&mut topology).await?;
            // A reopened channel already restarted every consumer.
            let restarted = topology
                .consumers
                .get(&event_name)
                .is_some_and(|consumer| consumer.tag != consumer_tag);
            if !restarted && topology.generation == generation {
                self.provision_event(&channel, &event_name).await?;
                self.start_consumer(&mut topology, &channel, &event_name).await?;
            }
            Ok::<_, EventBusError>(())
        }
        .await;

        if let Err(e) = result {
            error!(event = %event_name, error = %e, "Consumer recovery failed");
        }
    }

    /// Undo a binding whose consumer could not be started.
    ///
    /// The queue stays bound; the next subscribe re-declares it. Callers hold
    /// the topology lock, so any eviction raised here belongs to this event.
    fn revert_binding(&self, event_name: &str, handler: &HandlerType) {
        self.dispatcher.registry().remove_subscription(event_name, handler);
        let mut evictions = self.evictions.lock();
        while evictions.try_recv().is_ok() {}
        warn!(event = %event_name, handler = handler.name(), "Consumer failed to start, binding reverted");
    }

    async fn teardown_event(self: &Arc<Self>, topology: &mut Topology, event_name: &str) -> Result<()> {
        let queue = self.queue_name(event_name);

        if let Some(consumer) = topology.consumers.remove(event_name) {
            consumer.forwarder.abort();
            if let Some(channel) = topology.channel.as_ref().filter(|c| c.is_open()) {
                if let Err(e) = channel.cancel(&consumer.tag).await {
                    warn!(queue = %queue, error = %e, "Failed to cancel consumer");
                }
            }
        }

        self.connection.connect_with_retry().await?;
        let channel = self.ensure_channel(topology).await?;
        match channel.unbind_queue(&queue, &self.exchange, event_name).await {
            Ok(()) => {
                info!(queue = %queue, routing_key = %event_name, "Queue unbound");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(queue = %queue, error = %e, "Binding already gone during unsubscribe");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn spawn_forwarder(
    inner: Weak<Inner>,
    event_name: String,
    consumer_tag: String,
    channel: Arc<dyn AmqpChannel>,
    mut stream: DeliveryStream,
    deliveries: mpsc::Sender<Delivery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(delivery) => {
                    if deliveries.send((channel.clone(), delivery)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(event = %event_name, error = %e, "Consumer error");
                    break;
                }
            }
        }

        debug!(event = %event_name, consumer_tag = %consumer_tag, "Consumer stream ended");
        if let Some(inner) = inner.upgrade() {
            if !inner.disposed.load(Ordering::SeqCst) {
                tokio::spawn(inner.recover(event_name, consumer_tag));
            }
        }
    })
}

async fn consume_loop(inner: Weak<Inner>, mut deliveries: mpsc::Receiver<Delivery>) {
    while let Some((channel, delivery)) = deliveries.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_delivery(channel, delivery).await;
    }
    debug!("Consume loop stopped");
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.topology.get_mut().stop_tasks();
    }
}

#[async_trait]
impl EventBus for EventBusRabbitMq {
    async fn publish_raw(&self, event: OutgoingEvent) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_active()?;

        let routing_key = inner.dispatcher.names().canonical_name(&event.name);
        let message = AmqpMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            content_type: "application/json".to_string(),
            persistent: true,
            body: event.payload,
        };
        debug!(event = %routing_key, event_id = %event.event_id, "Publishing event");

        let connection = &inner.connection;
        let exchange = inner.exchange.as_str();
        let routing_key = routing_key.as_str();
        let message = &message;
        inner
            .retry
            .execute("publish", move |_| async move {
                connection.try_connect().await?;
                let channel = connection.create_channel().await?;
                let result = async {
                    channel.declare_exchange(exchange).await?;
                    channel.publish(exchange, routing_key, message.clone()).await
                }
                .await;
                if channel.is_open() {
                    if let Err(e) = channel.close().await {
                        debug!(error = %e, "Failed to close publish channel");
                    }
                }
                result
            })
            .await
    }

    async fn subscribe_binding(&self, binding: SubscriptionBinding) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_active()?;

        let event_name = inner.dispatcher.names().canonical_name(binding.event().name());
        let mut topology = inner.topology.lock().await;

        inner.connection.connect_with_retry().await?;
        let channel = inner.ensure_channel(&mut topology).await?;

        let first = !inner.dispatcher.registry().has_subscriptions(&event_name);
        if first {
            inner.provision_event(&channel, &event_name).await?;
        }

        let handler = binding.handler();
        let added = inner.dispatcher.registry().add_subscription(&event_name, binding)?;
        if !added {
            debug!(event = %event_name, handler = handler.name(), "Already subscribed");
        }
        if !topology.consumers.contains_key(&event_name) {
            if let Err(e) = inner.start_consumer(&mut topology, &channel, &event_name).await {
                if added {
                    inner.revert_binding(&event_name, &handler);
                }
                return Err(e);
            }
        }
        inner.start_consume_loop(&mut topology);

        info!(event = %event_name, handler = handler.name(), "Subscribed");
        Ok(())
    }

    async fn unsubscribe_binding(&self, event_name: &str, handler: HandlerType) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_active()?;

        let event_name = inner.dispatcher.names().canonical_name(event_name);
        let mut topology = inner.topology.lock().await;

        inner
            .dispatcher
            .registry()
            .remove_subscription(&event_name, &handler);

        let evicted: Vec<String> = {
            let mut evictions = inner.evictions.lock();
            std::iter::from_fn(|| evictions.try_recv().ok()).collect()
        };
        for evicted in evicted {
            inner.teardown_event(&mut topology, &evicted).await?;
        }

        if inner.dispatcher.registry().is_empty() {
            if let Some(channel) = topology.channel.take() {
                if channel.is_open() {
                    channel.close().await?;
                }
                info!("Last subscription removed, consumer channel closed");
            }
        } else if topology.channel.as_ref().is_none_or(|c| !c.is_open()) {
            inner.ensure_channel(&mut topology).await?;
        }

        info!(event = %event_name, handler = handler.name(), "Unsubscribed");
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut topology = inner.topology.lock().await;
        topology.stop_tasks();
        if let Some(channel) = topology.channel.take() {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "Error closing consumer channel");
                }
            }
        }
        inner.connection.close().await?;
        inner.dispatcher.registry().clear();
        info!("RabbitMQ event bus disposed");
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::BrokerTopology
    }
}
