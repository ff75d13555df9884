// EventBus - typed integration events over RabbitMQ or Azure Service Bus
//
// This crate re-exports the messaging core and, with the `log` feature, the
// tracing subscriber setup.

// Re-export core functionality
pub use eventbus_messaging::*;

// Re-export optional crates
#[cfg(feature = "log")]
pub use eventbus_log as log;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        EventBus,
        EventBusConfig,
        EventBusError,
        EventBusExt,
        EventBusFactory,
        EventEnvelope,
        EventHandlerError,
        HandlerContainer,
        IntegrationEvent,
        IntegrationEventHandler,
        TransportKind,
    };
    pub use async_trait::async_trait;
}
