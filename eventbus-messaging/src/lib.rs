//! # EventBus Messaging
//!
//! Typed integration events published and consumed over a message broker.
//!
//! Applications publish events and subscribe handlers; the bus maps each
//! event type to a canonical name, provisions the broker topology for it and
//! dispatches every received message to the registered handlers in order.
//!
//! Two transports share the same registry and dispatch engine:
//! - **Broker topology** (RabbitMQ) - a direct exchange with one durable queue per event
//! - **Managed topic** (Azure Service Bus) - one topic with a filtered subscription per event
//!
//! ## Features
//!
//! - `rabbitmq` - lapin-backed AMQP client
//! - `servicebus` - REST-backed Service Bus client
//! - `full` - both
//!
//! In-memory transports are always available for tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use eventbus_messaging::*;
//!
//! #[derive(Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct OrderCreatedIntegrationEvent {
//!     #[serde(flatten)]
//!     envelope: EventEnvelope,
//!     order_id: i32,
//! }
//!
//! impl IntegrationEvent for OrderCreatedIntegrationEvent {
//!     fn envelope(&self) -> &EventEnvelope {
//!         &self.envelope
//!     }
//! }
//!
//! struct OrderCreatedHandler;
//!
//! #[async_trait::async_trait]
//! impl IntegrationEventHandler<OrderCreatedIntegrationEvent> for OrderCreatedHandler {
//!     async fn handle(&self, event: &OrderCreatedIntegrationEvent) -> Result<(), EventHandlerError> {
//!         println!("order {} created", event.order_id);
//!         Ok(())
//!     }
//! }
//!
//! let handlers = HandlerContainer::new();
//! handlers.register(OrderCreatedHandler);
//!
//! let bus = EventBusFactory::create(EventBusConfig::from_env()?, Arc::new(handlers)).await?;
//! bus.subscribe::<OrderCreatedIntegrationEvent, OrderCreatedHandler>().await?;
//! bus.publish(&event).await?;
//! ```

use async_trait::async_trait;

pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod factory;
pub mod handler;
pub mod naming;
pub mod rabbitmq;
pub mod registry;
pub mod retry;
pub mod servicebus;

pub use config::{EventBusConfig, RabbitMqConnection, ServiceBusConnection, TransportKind};
pub use delivery::{DeliveryPolicy, Settlement};
pub use dispatch::Dispatcher;
pub use error::{EventBusError, Result};
pub use event::{EventDescriptor, EventEnvelope, IntegrationEvent, OutgoingEvent};
pub use factory::{EventBusFactory, TransportClients};
pub use handler::{
    EventHandlerError, HandlerContainer, HandlerInvoker, HandlerResolver, HandlerType,
    IntegrationEventHandler, TypedInvoker,
};
pub use naming::EventNameProcessor;
pub use rabbitmq::{EventBusRabbitMq, InMemoryAmqpBroker};
pub use registry::{SubscriptionBinding, SubscriptionRegistry};
pub use retry::RetryPolicy;
pub use servicebus::{EventBusServiceBus, InMemoryServiceBus};

/// A transport adapter.
///
/// Object safe; the typed operations live on [`EventBusExt`].
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Send an already serialized event
    async fn publish_raw(&self, event: OutgoingEvent) -> Result<()>;

    /// Register a binding, provisioning topology for its event if needed
    async fn subscribe_binding(&self, binding: SubscriptionBinding) -> Result<()>;

    /// Remove a handler; topology is torn down with the event's last handler
    async fn unsubscribe_binding(&self, event_name: &str, handler: HandlerType) -> Result<()>;

    /// Release consumers and connections. Later operations fail with
    /// [`EventBusError::Disposed`].
    async fn dispose(&self) -> Result<()>;

    fn transport(&self) -> TransportKind;
}

/// Typed publish / subscribe for every [`EventBus`].
#[async_trait]
pub trait EventBusExt: EventBus {
    /// Serialize and publish an event
    async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<()> {
        self.publish_raw(OutgoingEvent::from_event(event)?).await
    }

    /// Subscribe handler `H` to events of type `E`
    async fn subscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.subscribe_binding(SubscriptionBinding::of::<E, H>()).await
    }

    /// Unsubscribe handler `H` from events of type `E`
    async fn unsubscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.unsubscribe_binding(&E::event_name(), HandlerType::of::<H>())
            .await
    }
}

impl<T: EventBus + ?Sized> EventBusExt for T {}
