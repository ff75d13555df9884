//! Event handlers, handler identity and handler resolution

use async_trait::async_trait;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{EventBusError, Result};
use crate::event::IntegrationEvent;

/// A resolved, type-erased handler instance.
pub type HandlerInstance = Arc<dyn Any + Send + Sync>;

/// Integration event handler trait
///
/// ```rust,ignore
/// struct OrderCreatedHandler;
///
/// #[async_trait]
/// impl IntegrationEventHandler<OrderCreatedIntegrationEvent> for OrderCreatedHandler {
///     async fn handle(&self, event: &OrderCreatedIntegrationEvent) -> Result<(), EventHandlerError> {
///         println!("order {} created", event.order_id);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    /// Handle the event
    async fn handle(&self, event: &E) -> std::result::Result<(), EventHandlerError>;
}

/// Event handler error
#[derive(Debug, thiserror::Error)]
pub enum EventHandlerError {
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Event processing error: {0}")]
    ProcessingError(String),
}

impl From<EventBusError> for EventHandlerError {
    fn from(err: EventBusError) -> Self {
        EventHandlerError::ProcessingError(err.to_string())
    }
}

/// Identity of a handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerType {
    id: TypeId,
    name: &'static str,
}

impl HandlerType {
    /// Identity of `H`
    pub fn of<H: 'static>() -> Self {
        Self {
            id: TypeId::of::<H>(),
            name: std::any::type_name::<H>(),
        }
    }

    /// Rust type id
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Invokes one handler type for one event type on type-erased values.
///
/// Built once per binding at subscribe time, so dispatch never inspects types
/// by name.
#[async_trait]
pub trait HandlerInvoker: Send + Sync {
    /// Downcast the instance and the event, then run the handler
    async fn invoke(
        &self,
        event_name: &str,
        instance: HandlerInstance,
        event: &(dyn Any + Send + Sync),
    ) -> Result<()>;
}

/// [`HandlerInvoker`] for a concrete `(E, H)` pair.
pub struct TypedInvoker<E, H> {
    _marker: PhantomData<fn() -> (E, H)>,
}

impl<E, H> TypedInvoker<E, H> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E, H> Default for TypedInvoker<E, H> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E, H> HandlerInvoker for TypedInvoker<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn invoke(
        &self,
        event_name: &str,
        instance: HandlerInstance,
        event: &(dyn Any + Send + Sync),
    ) -> Result<()> {
        let handler = instance.downcast::<H>().map_err(|_| {
            EventBusError::HandlerResolution(format!(
                "resolved instance is not a {}",
                std::any::type_name::<H>()
            ))
        })?;
        let event = event.downcast_ref::<E>().ok_or_else(|| {
            EventBusError::HandlerResolution(format!(
                "decoded event is not a {}",
                std::any::type_name::<E>()
            ))
        })?;

        handler
            .handle(event)
            .await
            .map_err(|source| EventBusError::Handler {
                event: event_name.to_string(),
                handler: std::any::type_name::<H>(),
                source,
            })
    }
}

/// Handler resolution boundary supplied by the application.
pub trait HandlerResolver: Send + Sync {
    /// Resolve an instance of the given handler type
    fn resolve(&self, handler: &HandlerType) -> Option<HandlerInstance>;
}

impl<F> HandlerResolver for F
where
    F: Fn(&HandlerType) -> Option<HandlerInstance> + Send + Sync,
{
    fn resolve(&self, handler: &HandlerType) -> Option<HandlerInstance> {
        self(handler)
    }
}

type HandlerFactory = Arc<dyn Fn() -> HandlerInstance + Send + Sync>;

#[derive(Clone)]
enum Registration {
    Singleton(HandlerInstance),
    Factory(HandlerFactory),
}

/// Handler container
///
/// A small [`HandlerResolver`] holding singleton handler instances and
/// factories that build a fresh instance on every resolve.
#[derive(Clone, Default)]
pub struct HandlerContainer {
    registrations: Arc<RwLock<HashMap<TypeId, Registration>>>,
}

impl HandlerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a singleton handler instance
    pub fn register<H: Send + Sync + 'static>(&self, handler: H) {
        self.register_arc(Arc::new(handler));
    }

    /// Register a shared handler instance
    pub fn register_arc<H: Send + Sync + 'static>(&self, handler: Arc<H>) {
        let handler_type = HandlerType::of::<H>();
        self.registrations
            .write()
            .insert(handler_type.id(), Registration::Singleton(handler));
        debug!(handler = handler_type.name(), "Handler registered");
    }

    /// Register a factory producing a new handler per resolve
    pub fn register_factory<H, F>(&self, factory: F)
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let handler_type = HandlerType::of::<H>();
        let factory: HandlerFactory = Arc::new(move || Arc::new(factory()) as HandlerInstance);
        self.registrations
            .write()
            .insert(handler_type.id(), Registration::Factory(factory));
        debug!(handler = handler_type.name(), "Handler factory registered");
    }

    /// Check if a handler type is registered
    pub fn has<H: 'static>(&self) -> bool {
        self.registrations.read().contains_key(&TypeId::of::<H>())
    }

    /// Remove a handler registration
    pub fn remove<H: 'static>(&self) -> bool {
        self.registrations.write().remove(&TypeId::of::<H>()).is_some()
    }

    /// Clear all registrations
    pub fn clear(&self) {
        self.registrations.write().clear();
    }
}

impl HandlerResolver for HandlerContainer {
    fn resolve(&self, handler: &HandlerType) -> Option<HandlerInstance> {
        let registration = self.registrations.read().get(&handler.id()).cloned();
        trace!(
            handler = handler.name(),
            found = registration.is_some(),
            "Resolving handler"
        );
        match registration? {
            Registration::Singleton(instance) => Some(instance),
            Registration::Factory(factory) => Some(factory()),
        }
    }
}

impl fmt::Debug for HandlerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContainer")
            .field("registrations", &self.registrations.read().len())
            .finish()
    }
}
