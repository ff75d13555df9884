//! Managed-topic transport (Azure Service Bus)
//!
//! One topic named after `defaultTopicName`. Each subscribed event gets a
//! subscription `subscriberAppName.canonicalName` whose catch-all rule is
//! replaced by a correlation filter on the message label, and a message pump
//! that completes a message only after it was dispatched successfully.

mod client;
mod connection_string;
mod memory;
mod pump;
#[cfg(feature = "servicebus")]
mod rest;

pub use client::{
    CorrelationRule, DEFAULT_RULE_NAME, ReceivedMessage, ServiceBusMessage, TopicClient,
    TopicManagement,
};
pub use connection_string::ServiceBusConnectionString;
pub use memory::InMemoryServiceBus;
pub use pump::{ErrorHandler, MessagePump, MessageProcessor, PumpOptions, log_errors, message_processor};
#[cfg(feature = "servicebus")]
pub use rest::ServiceBusRestClient;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

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

struct Inner {
    topic: String,
    management: Arc<dyn TopicManagement>,
    client: Arc<dyn TopicClient>,
    dispatcher: Dispatcher,
    delivery: DeliveryPolicy,
    retry: RetryPolicy,
    pump_options: PumpOptions,
    pumps: Mutex<HashMap<String, MessagePump>>,
    evictions: SyncMutex<mpsc::UnboundedReceiver<String>>,
    disposed: AtomicBool,
}

/// Azure Service Bus event bus
#[derive(Clone)]
pub struct EventBusServiceBus {
    inner: Arc<Inner>,
}

impl EventBusServiceBus {
    /// Create the adapter and make sure the topic exists
    pub async fn new(
        config: EventBusConfig,
        management: Arc<dyn TopicManagement>,
        client: Arc<dyn TopicClient>,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Result<Self> {
        config.validate()?;

        let (eviction_tx, eviction_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SubscriptionRegistry::with_eviction_channel(eviction_tx));
        let names = EventNameProcessor::from_config(&config);

        let inner = Inner {
            topic: config.default_topic_name.clone(),
            management,
            client,
            dispatcher: Dispatcher::new(registry, names, resolver),
            delivery: config.delivery,
            retry: config.retry_policy(),
            pump_options: PumpOptions {
                max_concurrent_calls: config.service_bus.max_concurrent_calls,
                receive_wait: config.service_bus.receive_wait(),
            },
            pumps: Mutex::new(HashMap::new()),
            evictions: SyncMutex::new(eviction_rx),
            disposed: AtomicBool::new(false),
        };
        inner.provision_topic().await?;

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

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Dispatch a raw message as a pump would, without settling it
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

    fn subscription_name(&self, event_name: &str) -> String {
        self.dispatcher.names().queue_name(event_name)
    }

    async fn provision_topic(&self) -> Result<()> {
        let management = &self.management;
        let topic = self.topic.as_str();
        self.retry
            .execute("provision topic", move |_| async move {
                if !management.topic_exists(topic).await? {
                    management.create_topic(topic).await?;
                    info!(topic, "Topic created");
                }
                Ok::<_, EventBusError>(())
            })
            .await
    }

    async fn provision_subscription(&self, event_name: &str) -> Result<()> {
        let topic = self.topic.as_str();
        let subscription = self.subscription_name(event_name);

        if !self.management.subscription_exists(topic, &subscription).await? {
            self.management.create_subscription(topic, &subscription).await?;
            info!(topic, subscription = %subscription, "Subscription created");
        }

        match self
            .management
            .delete_rule(topic, &subscription, DEFAULT_RULE_NAME)
            .await
        {
            Ok(()) => debug!(subscription = %subscription, "Default rule removed"),
            Err(e) if e.is_not_found() => {
                debug!(subscription = %subscription, "Default rule already removed")
            }
            Err(e) => return Err(e),
        }

        if !self.management.rule_exists(topic, &subscription, event_name).await? {
            self.management
                .create_rule(topic, &subscription, &CorrelationRule::for_label(event_name))
                .await?;
            info!(subscription = %subscription, rule = %event_name, "Correlation rule created");
        }
        Ok(())
    }

    fn start_pump(self: &Arc<Self>, event_name: &str) -> MessagePump {
        let subscription = self.subscription_name(event_name);
        let inner = Arc::downgrade(self);
        let processor = message_processor(move |message: ReceivedMessage| {
            let inner = inner.clone();
            async move {
                match Weak::upgrade(&inner) {
                    Some(inner) => inner.handle_message(message).await,
                    None => Settlement::Requeue,
                }
            }
        });

        MessagePump::start(
            self.client.clone(),
            self.topic.clone(),
            subscription.clone(),
            self.pump_options,
            processor,
            log_errors(subscription),
        )
    }

    async fn handle_message(&self, message: ReceivedMessage) -> Settlement {
        let Some(label) = message.label.as_deref() else {
            warn!(message_id = %message.message_id, "Message without label");
            return Settlement::DeadLetter;
        };
        let event_name = self.dispatcher.names().canonical_name(label);

        let outcome = self.dispatcher.process_event(&event_name, &message.body).await;
        self.delivery
            .settle(&event_name, &outcome, message.delivery_count)
    }

    async fn remove_rule(&self, event_name: &str) -> Result<()> {
        let subscription = self.subscription_name(event_name);
        match self
            .management
            .delete_rule(&self.topic, &subscription, event_name)
            .await
        {
            Ok(()) => {
                info!(subscription = %subscription, rule = %event_name, "Correlation rule removed");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(subscription = %subscription, rule = %event_name, "Rule already gone during unsubscribe");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping a pump signals it to shut down.
        self.pumps.get_mut().clear();
    }
}

#[async_trait]
impl EventBus for EventBusServiceBus {
    async fn publish_raw(&self, event: OutgoingEvent) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_active()?;

        let label = inner.dispatcher.names().canonical_name(&event.name);
        let message = ServiceBusMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            label,
            content_type: "application/json".to_string(),
            body: event.payload,
        };
        debug!(event = %message.label, event_id = %event.event_id, "Publishing event");

        let client = &inner.client;
        let topic = inner.topic.as_str();
        let message = &message;
        inner
            .retry
            .execute("publish", move |_| client.send(topic, message.clone()))
            .await
    }

    async fn subscribe_binding(&self, binding: SubscriptionBinding) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_active()?;

        let event_name = inner.dispatcher.names().canonical_name(binding.event().name());
        let mut pumps = inner.pumps.lock().await;

        let first = !inner.dispatcher.registry().has_subscriptions(&event_name);
        if first {
            inner.provision_subscription(&event_name).await?;
        }

        let handler = binding.handler();
        if !inner.dispatcher.registry().add_subscription(&event_name, binding)? {
            debug!(event = %event_name, handler = handler.name(), "Already subscribed");
        }
        if !pumps.contains_key(&event_name) {
            let pump = inner.start_pump(&event_name);
            pumps.insert(event_name.clone(), pump);
        }

        info!(event = %event_name, handler = handler.name(), "Subscribed");
        Ok(())
    }

    async fn unsubscribe_binding(&self, event_name: &str, handler: HandlerType) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_active()?;

        let event_name = inner.dispatcher.names().canonical_name(event_name);
        let mut pumps = inner.pumps.lock().await;

        inner
            .dispatcher
            .registry()
            .remove_subscription(&event_name, &handler);

        let evicted: Vec<String> = {
            let mut evictions = inner.evictions.lock();
            std::iter::from_fn(|| evictions.try_recv().ok()).collect()
        };
        for evicted in evicted {
            if let Some(pump) = pumps.remove(&evicted) {
                pump.stop().await;
            }
            inner.remove_rule(&evicted).await?;
        }

        info!(event = %event_name, handler = handler.name(), "Unsubscribed");
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut pumps = inner.pumps.lock().await;
        for (_, pump) in pumps.drain() {
            pump.stop().await;
        }
        if let Err(e) = inner.client.close().await {
            warn!(error = %e, "Error closing topic client");
        }
        inner.management.close().await?;
        inner.dispatcher.registry().clear();
        info!(topic = %inner.topic, "Service Bus event bus disposed");
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::ManagedTopic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventEnvelope, IntegrationEvent};
    use crate::handler::{EventHandlerError, HandlerContainer, IntegrationEventHandler};
    use crate::EventBusExt;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    const TOPIC: &str = "EventBusDefaultTopic";
    const SUBSCRIPTION: &str = "Notification.OrderPaymentSuccess";
    const CONNECTION_STRING: &str = "Endpoint=sb://shop.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0";

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderPaymentSuccessIntegrationEvent {
        #[serde(flatten)]
        envelope: EventEnvelope,
        order_id: i32,
    }

    impl IntegrationEvent for OrderPaymentSuccessIntegrationEvent {
        fn envelope(&self) -> &EventEnvelope {
            &self.envelope
        }
    }

    fn paid(order_id: i32) -> OrderPaymentSuccessIntegrationEvent {
        OrderPaymentSuccessIntegrationEvent {
            envelope: EventEnvelope::new(),
            order_id,
        }
    }

    struct RecordingHandler {
        seen: mpsc::UnboundedSender<(&'static str, i32)>,
    }

    #[async_trait]
    impl IntegrationEventHandler<OrderPaymentSuccessIntegrationEvent> for RecordingHandler {
        async fn handle(
            &self,
            event: &OrderPaymentSuccessIntegrationEvent,
        ) -> std::result::Result<(), EventHandlerError> {
            let _ = self.seen.send(("recording", event.order_id));
            if event.order_id < 0 {
                return Err(EventHandlerError::HandlerFailed("rejected".into()));
            }
            Ok(())
        }
    }

    struct AuditHandler {
        seen: mpsc::UnboundedSender<(&'static str, i32)>,
    }

    #[async_trait]
    impl IntegrationEventHandler<OrderPaymentSuccessIntegrationEvent> for AuditHandler {
        async fn handle(
            &self,
            event: &OrderPaymentSuccessIntegrationEvent,
        ) -> std::result::Result<(), EventHandlerError> {
            let _ = self.seen.send(("audit", event.order_id));
            Ok(())
        }
    }

    struct Harness {
        namespace: InMemoryServiceBus,
        bus: EventBusServiceBus,
        seen: mpsc::UnboundedReceiver<(&'static str, i32)>,
    }

    fn config() -> EventBusConfig {
        EventBusConfig::new("Notification")
            .with_service_bus_connection_string(CONNECTION_STRING)
            .with_receive_wait(Duration::from_millis(50))
            .with_retry_base_delay(Duration::from_millis(5))
    }

    async fn harness(config: EventBusConfig) -> Harness {
        let namespace = InMemoryServiceBus::new();
        let (tx, seen) = mpsc::unbounded_channel();
        let container = HandlerContainer::new();
        container.register(RecordingHandler { seen: tx.clone() });
        container.register(AuditHandler { seen: tx });
        let bus = EventBusServiceBus::new(
            config,
            Arc::new(namespace.clone()),
            Arc::new(namespace.clone()),
            Arc::new(container),
        )
        .await
        .unwrap();
        Harness {
            namespace,
            bus,
            seen,
        }
    }

    async fn next(seen: &mut mpsc::UnboundedReceiver<(&'static str, i32)>) -> (&'static str, i32) {
        tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_topic_is_provisioned_once() {
        let namespace = InMemoryServiceBus::new();
        for _ in 0..2 {
            EventBusServiceBus::new(
                config(),
                Arc::new(namespace.clone()),
                Arc::new(namespace.clone()),
                Arc::new(HandlerContainer::new()),
            )
            .await
            .unwrap();
        }
        assert!(namespace.topic_exists_now(TOPIC));
        assert_eq!(namespace.topic_creations(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_replaces_default_rule() {
        let h = harness(config()).await;
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();

        assert!(h.namespace.subscription_exists_now(TOPIC, SUBSCRIPTION));
        assert_eq!(h.namespace.rules(TOPIC, SUBSCRIPTION), vec!["OrderPaymentSuccess"]);
    }

    #[tokio::test]
    async fn test_round_trip_completes_message() {
        let mut h = harness(config()).await;
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();

        h.bus.publish(&paid(42)).await.unwrap();

        assert_eq!(next(&mut h.seen).await, ("recording", 42));
        let namespace = h.namespace.clone();
        eventually(move || namespace.completed_count() == 1).await;

        let sent = h.namespace.sent();
        assert_eq!(sent[0].label, "OrderPaymentSuccess");
        assert_eq!(sent[0].content_type, "application/json");
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let mut h = harness(config()).await;
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, AuditHandler>()
            .await
            .unwrap();

        h.bus.publish(&paid(7)).await.unwrap();

        assert_eq!(next(&mut h.seen).await, ("recording", 7));
        assert_eq!(next(&mut h.seen).await, ("audit", 7));
    }

    #[tokio::test]
    async fn test_failing_handler_is_abandoned_then_dead_lettered() {
        let mut h = harness(config().with_max_delivery_count(2)).await;
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();

        h.bus.publish(&paid(-1)).await.unwrap();

        assert_eq!(next(&mut h.seen).await, ("recording", -1));
        assert_eq!(next(&mut h.seen).await, ("recording", -1));
        let namespace = h.namespace.clone();
        eventually(move || namespace.dead_lettered(TOPIC, SUBSCRIPTION).len() == 1).await;
        assert_eq!(h.namespace.abandoned_count(), 1);
        assert_eq!(h.namespace.completed_count(), 0);
    }

    #[tokio::test]
    async fn test_rule_survives_until_last_handler_leaves() {
        let h = harness(config()).await;
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, AuditHandler>()
            .await
            .unwrap();

        h.bus
            .unsubscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();
        assert_eq!(h.namespace.rules(TOPIC, SUBSCRIPTION), vec!["OrderPaymentSuccess"]);

        h.bus
            .unsubscribe::<OrderPaymentSuccessIntegrationEvent, AuditHandler>()
            .await
            .unwrap();
        assert!(h.namespace.rules(TOPIC, SUBSCRIPTION).is_empty());
        assert!(!h.bus.registry().has_subscriptions("OrderPaymentSuccess"));
    }

    #[tokio::test]
    async fn test_unsubscribe_absorbs_missing_rule() {
        let h = harness(config()).await;
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();
        h.namespace.drop_rule(TOPIC, SUBSCRIPTION, "OrderPaymentSuccess");

        h.bus
            .unsubscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resubscribe_is_idempotent() {
        let h = harness(config()).await;
        for _ in 0..2 {
            h.bus
                .subscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
                .await
                .unwrap();
            h.bus
                .unsubscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
                .await
                .unwrap();
        }
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();
        assert_eq!(h.namespace.rules(TOPIC, SUBSCRIPTION), vec!["OrderPaymentSuccess"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_then_surfaces() {
        let h = harness(config().with_connection_retry_count(3)).await;
        h.namespace.fail_next_sends(10);

        assert!(h.bus.publish(&paid(1)).await.unwrap_err().is_retryable());
        assert_eq!(h.namespace.send_attempts(), 4);
    }

    #[tokio::test]
    async fn test_dispose_closes_clients_once() {
        let h = harness(config()).await;
        h.bus
            .subscribe::<OrderPaymentSuccessIntegrationEvent, RecordingHandler>()
            .await
            .unwrap();

        h.bus.dispose().await.unwrap();
        h.bus.dispose().await.unwrap();

        assert_eq!(h.namespace.closed_clients(), 2);
        assert!(matches!(
            h.bus
                .subscribe::<OrderPaymentSuccessIntegrationEvent, AuditHandler>()
                .await,
            Err(EventBusError::Disposed)
        ));
    }
}
