//! Routing of inbound raw messages to typed handlers

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::handler::HandlerResolver;
use crate::naming::EventNameProcessor;
use crate::registry::SubscriptionRegistry;

/// Dispatch engine shared by both transports.
///
/// Looks up the bindings for a message, decodes the payload once into the
/// bound event type and runs every resolvable handler in registration order.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    names: EventNameProcessor,
    resolver: Arc<dyn HandlerResolver>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        names: EventNameProcessor,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        Self {
            registry,
            names,
            resolver,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn names(&self) -> &EventNameProcessor {
        &self.names
    }

    /// Process one inbound message
    ///
    /// Returns `Ok(false)` when nothing is subscribed to the event, without
    /// looking at the payload. A decode failure yields
    /// [`EventBusError::Deserialization`](crate::EventBusError::Deserialization);
    /// a failing handler aborts the remaining handlers and its error is returned.
    pub async fn process_event(&self, event_name: &str, payload: &[u8]) -> Result<bool> {
        let name = self.names.canonical_name(event_name);

        let Some(descriptor) = self.registry.event_type_for(&name) else {
            debug!(event = %name, "No subscriptions for event");
            return Ok(false);
        };
        let bindings = self.registry.handlers_for(&name);
        if bindings.is_empty() {
            debug!(event = %name, "Subscriptions removed before dispatch");
            return Ok(false);
        }

        let event = descriptor.decode(&name, payload)?;

        for binding in bindings {
            let handler = binding.handler();
            let Some(instance) = self.resolver.resolve(&handler) else {
                warn!(event = %name, handler = handler.name(), "Handler could not be resolved, skipping");
                continue;
            };

            debug!(event = %name, handler = handler.name(), "Dispatching event");
            binding.invoker().invoke(&name, instance, &*event).await?;
        }

        Ok(true)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("names", &self.names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventBusError;
    use crate::event::{EventEnvelope, IntegrationEvent};
    use crate::handler::{EventHandlerError, HandlerContainer, IntegrationEventHandler};
    use crate::registry::SubscriptionBinding;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderCreatedIntegrationEvent {
        #[serde(flatten)]
        envelope: EventEnvelope,
        order_id: i32,
    }

    impl IntegrationEvent for OrderCreatedIntegrationEvent {
        fn envelope(&self) -> &EventEnvelope {
            &self.envelope
        }
    }

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recording {
        label: &'static str,
        journal: Journal,
    }

    macro_rules! recording_handler {
        ($name:ident) => {
            struct $name(Recording);

            #[async_trait]
            impl IntegrationEventHandler<OrderCreatedIntegrationEvent> for $name {
                async fn handle(
                    &self,
                    event: &OrderCreatedIntegrationEvent,
                ) -> std::result::Result<(), EventHandlerError> {
                    self.0
                        .journal
                        .lock()
                        .push(format!("{}:{}", self.0.label, event.order_id));
                    if event.order_id < 0 {
                        return Err(EventHandlerError::HandlerFailed("negative order".into()));
                    }
                    Ok(())
                }
            }
        };
    }

    recording_handler!(AuditHandler);
    recording_handler!(BillingHandler);

    struct Fixture {
        dispatcher: Dispatcher,
        container: HandlerContainer,
        journal: Journal,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SubscriptionRegistry::new());
        let container = HandlerContainer::new();
        let names = EventNameProcessor::new("test").with_suffix("IntegrationEvent", true);
        let dispatcher = Dispatcher::new(registry, names, Arc::new(container.clone()));
        Fixture {
            dispatcher,
            container,
            journal: Arc::default(),
        }
    }

    fn payload(order_id: i32) -> Vec<u8> {
        serde_json::to_vec(&OrderCreatedIntegrationEvent {
            envelope: EventEnvelope::new(),
            order_id,
        })
        .unwrap()
    }

    impl Fixture {
        fn bind_audit(&self) {
            self.container.register(AuditHandler(Recording {
                label: "audit",
                journal: self.journal.clone(),
            }));
            self.dispatcher
                .registry()
                .add_subscription(
                    "OrderCreated",
                    SubscriptionBinding::of::<OrderCreatedIntegrationEvent, AuditHandler>(),
                )
                .unwrap();
        }

        fn bind_billing(&self) {
            self.container.register(BillingHandler(Recording {
                label: "billing",
                journal: self.journal.clone(),
            }));
            self.dispatcher
                .registry()
                .add_subscription(
                    "OrderCreated",
                    SubscriptionBinding::of::<OrderCreatedIntegrationEvent, BillingHandler>(),
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_unsubscribed_event_returns_false() {
        let f = fixture();
        let handled = f
            .dispatcher
            .process_event("OrderCreated", b"not even json")
            .await
            .unwrap();
        assert!(!handled);
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let f = fixture();
        f.bind_billing();
        f.bind_audit();

        assert!(f.dispatcher.process_event("OrderCreated", &payload(5)).await.unwrap());
        assert_eq!(*f.journal.lock(), vec!["billing:5", "audit:5"]);
    }

    #[tokio::test]
    async fn test_raw_name_is_canonicalized() {
        let f = fixture();
        f.bind_audit();

        assert!(
            f.dispatcher
                .process_event("OrderCreatedIntegrationEvent", &payload(1))
                .await
                .unwrap()
        );
        assert_eq!(f.journal.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_handler_is_skipped() {
        let f = fixture();
        f.bind_audit();
        f.bind_billing();
        f.container.remove::<AuditHandler>();

        assert!(f.dispatcher.process_event("OrderCreated", &payload(2)).await.unwrap());
        assert_eq!(*f.journal.lock(), vec!["billing:2"]);
    }

    #[tokio::test]
    async fn test_handler_failure_aborts_remaining() {
        let f = fixture();
        f.bind_audit();
        f.bind_billing();

        let err = f
            .dispatcher
            .process_event("OrderCreated", &payload(-1))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::Handler { .. }));
        assert_eq!(*f.journal.lock(), vec!["audit:-1"]);
    }

    #[tokio::test]
    async fn test_payload_mismatch_is_deserialization_error() {
        let f = fixture();
        f.bind_audit();

        let err = f
            .dispatcher
            .process_event("OrderCreated", br#"{"orderId":"seven"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::Deserialization { .. }));
        assert!(f.journal.lock().is_empty());
    }
}
