//! In-process subscription registry

use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{EventBusError, Result};
use crate::event::{EventDescriptor, IntegrationEvent};
use crate::handler::{HandlerInvoker, HandlerType, IntegrationEventHandler, TypedInvoker};

/// Binding of one event type to one handler type.
#[derive(Clone)]
pub struct SubscriptionBinding {
    event: EventDescriptor,
    handler: HandlerType,
    invoker: Arc<dyn HandlerInvoker>,
}

impl SubscriptionBinding {
    /// Bind handler `H` to event `E`
    pub fn of<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            event: EventDescriptor::of::<E>(),
            handler: HandlerType::of::<H>(),
            invoker: Arc::new(TypedInvoker::<E, H>::new()),
        }
    }

    pub fn event(&self) -> &EventDescriptor {
        &self.event
    }

    pub fn handler(&self) -> HandlerType {
        self.handler
    }

    pub fn invoker(&self) -> &Arc<dyn HandlerInvoker> {
        &self.invoker
    }
}

impl fmt::Debug for SubscriptionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionBinding")
            .field("event", &self.event.type_name())
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Called with the canonical name of an event whose last binding was removed.
pub type EvictionListener = Arc<dyn Fn(&str) + Send + Sync>;

struct Entry {
    event: EventDescriptor,
    bindings: Vec<SubscriptionBinding>,
}

/// Subscription registry
///
/// Maps canonical event names to their event type and an ordered set of
/// handler bindings. Names are canonicalized by the caller. A name is present
/// exactly while it has at least one binding.
///
/// Removing the last binding of an event invokes the eviction listener before
/// `remove_subscription` returns, outside the registry lock.
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    on_evicted: Option<EvictionListener>,
}

impl SubscriptionRegistry {
    /// Registry without an eviction listener
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            on_evicted: None,
        }
    }

    /// Registry invoking `listener` on eviction
    pub fn with_eviction_listener<F>(listener: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            entries: RwLock::new(HashMap::new()),
            on_evicted: Some(Arc::new(listener)),
        }
    }

    /// Registry sending evicted names to a channel
    pub fn with_eviction_channel(sender: mpsc::UnboundedSender<String>) -> Self {
        Self::with_eviction_listener(move |name| {
            // The receiver lives as long as the owning adapter.
            let _ = sender.send(name.to_string());
        })
    }

    /// Add a binding under a canonical name
    ///
    /// Returns `false` when the same handler is already bound to the event.
    /// Binding a different event type to a name already in use is an error.
    pub fn add_subscription(&self, event_name: &str, binding: SubscriptionBinding) -> Result<bool> {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(event_name.to_string())
            .or_insert_with(|| Entry {
                event: binding.event.clone(),
                bindings: Vec::new(),
            });

        if entry.event.type_id() != binding.event.type_id() {
            return Err(EventBusError::Configuration(format!(
                "event name '{}' is already bound to {}, cannot bind {}",
                event_name,
                entry.event.type_name(),
                binding.event.type_name()
            )));
        }

        if entry
            .bindings
            .iter()
            .any(|existing| existing.handler == binding.handler)
        {
            trace!(event = %event_name, handler = binding.handler.name(), "Binding already present");
            return Ok(false);
        }

        debug!(event = %event_name, handler = binding.handler.name(), "Binding added");
        entry.bindings.push(binding);
        Ok(true)
    }

    /// Remove a handler binding
    ///
    /// Returns `true` if a binding was removed.
    pub fn remove_subscription(&self, event_name: &str, handler: &HandlerType) -> bool {
        let (removed, evicted) = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(event_name) else {
                return false;
            };

            let before = entry.bindings.len();
            entry.bindings.retain(|binding| binding.handler != *handler);
            let removed = entry.bindings.len() != before;

            let evicted = entry.bindings.is_empty();
            if evicted {
                entries.remove(event_name);
            }
            (removed, evicted)
        };

        if removed {
            debug!(event = %event_name, handler = handler.name(), "Binding removed");
        }
        if evicted {
            debug!(event = %event_name, "Last binding removed");
            if let Some(listener) = &self.on_evicted {
                listener(event_name);
            }
        }
        removed
    }

    pub fn has_subscriptions(&self, event_name: &str) -> bool {
        self.entries.read().contains_key(event_name)
    }

    /// Snapshot of the bindings for an event, in registration order
    pub fn handlers_for(&self, event_name: &str) -> Vec<SubscriptionBinding> {
        self.entries
            .read()
            .get(event_name)
            .map(|entry| entry.bindings.clone())
            .unwrap_or_default()
    }

    pub fn event_type_for(&self, event_name: &str) -> Option<EventDescriptor> {
        self.entries
            .read()
            .get(event_name)
            .map(|entry| entry.event.clone())
    }

    /// Canonical name `E` is registered under
    pub fn event_key<E: IntegrationEvent>(&self) -> Option<String> {
        let type_id = TypeId::of::<E>();
        self.entries
            .read()
            .iter()
            .find(|(_, entry)| entry.event.type_id() == type_id)
            .map(|(name, _)| name.clone())
    }

    pub fn has_subscriptions_for<E: IntegrationEvent>(&self) -> bool {
        self.event_key::<E>().is_some()
    }

    pub fn handlers_for_event<E: IntegrationEvent>(&self) -> Vec<SubscriptionBinding> {
        self.event_key::<E>()
            .map(|name| self.handlers_for(&name))
            .unwrap_or_default()
    }

    /// Canonical names with at least one binding
    pub fn event_names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop all bindings without eviction notifications
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        debug!(events = count, "Subscription registry cleared");
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("events", &self.event_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventEnvelope;
    use crate::handler::EventHandlerError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderCreatedIntegrationEvent {
        #[serde(flatten)]
        envelope: EventEnvelope,
    }

    impl IntegrationEvent for OrderCreatedIntegrationEvent {
        fn envelope(&self) -> &EventEnvelope {
            &self.envelope
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderShippedIntegrationEvent {
        #[serde(flatten)]
        envelope: EventEnvelope,
    }

    impl IntegrationEvent for OrderShippedIntegrationEvent {
        fn envelope(&self) -> &EventEnvelope {
            &self.envelope
        }
    }

    macro_rules! noop_handler {
        ($name:ident, $event:ty) => {
            struct $name;

            #[async_trait]
            impl IntegrationEventHandler<$event> for $name {
                async fn handle(&self, _: &$event) -> std::result::Result<(), EventHandlerError> {
                    Ok(())
                }
            }
        };
    }

    noop_handler!(FirstHandler, OrderCreatedIntegrationEvent);
    noop_handler!(SecondHandler, OrderCreatedIntegrationEvent);
    noop_handler!(ShippedHandler, OrderShippedIntegrationEvent);

    fn created<H: IntegrationEventHandler<OrderCreatedIntegrationEvent>>() -> SubscriptionBinding {
        SubscriptionBinding::of::<OrderCreatedIntegrationEvent, H>()
    }

    #[test]
    fn test_duplicate_binding_is_noop() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.add_subscription("OrderCreated", created::<FirstHandler>()).unwrap());
        assert!(!registry.add_subscription("OrderCreated", created::<FirstHandler>()).unwrap());
        assert_eq!(registry.handlers_for("OrderCreated").len(), 1);
    }

    #[test]
    fn test_bindings_keep_registration_order() {
        let registry = SubscriptionRegistry::new();
        registry.add_subscription("OrderCreated", created::<SecondHandler>()).unwrap();
        registry.add_subscription("OrderCreated", created::<FirstHandler>()).unwrap();

        let handlers: Vec<_> = registry
            .handlers_for("OrderCreated")
            .iter()
            .map(|b| b.handler())
            .collect();
        assert_eq!(
            handlers,
            vec![HandlerType::of::<SecondHandler>(), HandlerType::of::<FirstHandler>()]
        );
    }

    #[test]
    fn test_last_removal_fires_one_eviction() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        let registry =
            SubscriptionRegistry::with_eviction_listener(move |name| sink.lock().push(name.to_string()));

        registry.add_subscription("OrderCreated", created::<FirstHandler>()).unwrap();
        registry.add_subscription("OrderCreated", created::<SecondHandler>()).unwrap();

        assert!(registry.remove_subscription("OrderCreated", &HandlerType::of::<FirstHandler>()));
        assert!(evicted.lock().is_empty());
        assert!(registry.has_subscriptions("OrderCreated"));

        assert!(registry.remove_subscription("OrderCreated", &HandlerType::of::<SecondHandler>()));
        assert_eq!(*evicted.lock(), vec!["OrderCreated".to_string()]);
        assert!(!registry.has_subscriptions("OrderCreated"));
        assert!(registry.event_type_for("OrderCreated").is_none());
        assert!(registry.is_empty());

        assert!(!registry.remove_subscription("OrderCreated", &HandlerType::of::<SecondHandler>()));
        assert_eq!(evicted.lock().len(), 1);
    }

    #[test]
    fn test_eviction_channel_receives_name() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = SubscriptionRegistry::with_eviction_channel(tx);
        registry.add_subscription("OrderCreated", created::<FirstHandler>()).unwrap();
        registry.remove_subscription("OrderCreated", &HandlerType::of::<FirstHandler>());

        assert_eq!(rx.try_recv().unwrap(), "OrderCreated");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_name_collision_between_types_is_rejected() {
        let registry = SubscriptionRegistry::new();
        registry.add_subscription("Order", created::<FirstHandler>()).unwrap();
        let err = registry
            .add_subscription(
                "Order",
                SubscriptionBinding::of::<OrderShippedIntegrationEvent, ShippedHandler>(),
            )
            .unwrap_err();
        assert!(matches!(err, EventBusError::Configuration(_)));
    }

    #[test]
    fn test_typed_queries() {
        let registry = SubscriptionRegistry::new();
        registry.add_subscription("OrderCreated", created::<FirstHandler>()).unwrap();

        assert!(registry.has_subscriptions_for::<OrderCreatedIntegrationEvent>());
        assert!(!registry.has_subscriptions_for::<OrderShippedIntegrationEvent>());
        assert_eq!(
            registry.event_key::<OrderCreatedIntegrationEvent>().as_deref(),
            Some("OrderCreated")
        );
        assert_eq!(registry.handlers_for_event::<OrderCreatedIntegrationEvent>().len(), 1);
        assert!(registry.handlers_for_event::<OrderShippedIntegrationEvent>().is_empty());
    }

    #[test]
    fn test_clear_empties_without_eviction() {
        let fired = Arc::new(Mutex::new(0));
        let sink = fired.clone();
        let registry = SubscriptionRegistry::with_eviction_listener(move |_| *sink.lock() += 1);
        registry.add_subscription("OrderCreated", created::<FirstHandler>()).unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(*fired.lock(), 0);
    }
}
