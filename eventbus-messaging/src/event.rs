//! Integration event definitions

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use uuid::Uuid;

use crate::error::{EventBusError, Result};

/// Identity carried by every integration event.
///
/// Fields are private: an envelope is created once by the publisher and never
/// mutated afterwards. Concrete events embed it with `#[serde(flatten)]` so the
/// wire format carries `id` and `createdAt` next to the event's own fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    id: Uuid,
    created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Create a new envelope with a fresh id and the current time
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild an envelope from known values
    pub fn from_parts(id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self { id, created_at }
    }

    /// Unique event id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creation timestamp
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Default for EventEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

/// Integration event trait
///
/// All events published through an [`EventBus`](crate::EventBus) implement this
/// trait. The event name defaults to the unqualified type name, which the
/// [`EventNameProcessor`](crate::EventNameProcessor) turns into a routing key.
///
/// ```rust,ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct OrderCreatedIntegrationEvent {
///     #[serde(flatten)]
///     envelope: EventEnvelope,
///     order_id: i32,
/// }
///
/// impl IntegrationEvent for OrderCreatedIntegrationEvent {
///     fn envelope(&self) -> &EventEnvelope { &self.envelope }
/// }
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Get the event envelope
    fn envelope(&self) -> &EventEnvelope;

    /// Raw (non-canonical) event name
    fn event_name() -> String {
        short_type_name::<Self>().to_string()
    }

    /// Get the event id
    fn event_id(&self) -> Uuid {
        self.envelope().id()
    }
}

/// Unqualified type name without module path or generic arguments.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// A serialized event ready to be handed to a transport.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    /// Raw event name (canonicalized by the adapter)
    pub name: String,
    /// Event id from the envelope
    pub event_id: Uuid,
    /// JSON payload
    pub payload: Vec<u8>,
}

impl OutgoingEvent {
    /// Serialize an event
    pub fn from_event<E: IntegrationEvent>(event: &E) -> Result<Self> {
        let payload =
            serde_json::to_vec(event).map_err(|e| EventBusError::Serialization(e.to_string()))?;
        Ok(Self {
            name: E::event_name(),
            event_id: event.event_id(),
            payload,
        })
    }

    /// Get the payload as a UTF-8 string
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|e| EventBusError::Serialization(e.to_string()))
    }
}

/// Decoded event, type-erased.
pub type AnyEvent = Box<dyn Any + Send + Sync>;

/// Payload decoder for one concrete event type.
pub type DecodeFn = fn(&[u8]) -> std::result::Result<AnyEvent, serde_json::Error>;

/// Stable identity of a concrete event type and how to decode it.
#[derive(Debug, Clone)]
pub struct EventDescriptor {
    type_id: TypeId,
    type_name: &'static str,
    name: String,
    decode: DecodeFn,
}

impl EventDescriptor {
    /// Describe the event type `E`
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            name: E::event_name(),
            decode: decode_event::<E>,
        }
    }

    /// Rust type id of the event
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified type name
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Raw event name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decode a payload into the described type
    pub fn decode(&self, event_name: &str, payload: &[u8]) -> Result<AnyEvent> {
        (self.decode)(payload).map_err(|e| EventBusError::Deserialization {
            event: event_name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl PartialEq for EventDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

fn decode_event<E: IntegrationEvent>(
    payload: &[u8],
) -> std::result::Result<AnyEvent, serde_json::Error> {
    serde_json::from_slice::<E>(payload).map(|event| Box::new(event) as AnyEvent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
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

    #[derive(Debug, Serialize, Deserialize)]
    struct Renamed {
        #[serde(flatten)]
        envelope: EventEnvelope,
    }

    impl IntegrationEvent for Renamed {
        fn envelope(&self) -> &EventEnvelope {
            &self.envelope
        }

        fn event_name() -> String {
            "CustomNameIntegrationEvent".to_string()
        }
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let a = EventEnvelope::new();
        let b = EventEnvelope::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_event_name_defaults_to_type_name() {
        assert_eq!(
            OrderCreatedIntegrationEvent::event_name(),
            "OrderCreatedIntegrationEvent"
        );
        assert_eq!(Renamed::event_name(), "CustomNameIntegrationEvent");
    }

    #[test]
    fn test_short_type_name_strips_generics() {
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
        assert_eq!(short_type_name::<u32>(), "u32");
    }

    #[test]
    fn test_wire_format_flattens_envelope() {
        let event = OrderCreatedIntegrationEvent {
            envelope: EventEnvelope::new(),
            order_id: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["orderId"], 7);
        assert_eq!(json["id"], event.envelope.id().to_string());
        assert!(json.get("createdAt").is_some());

        let outgoing = OutgoingEvent::from_event(&event).unwrap();
        assert_eq!(outgoing.name, "OrderCreatedIntegrationEvent");
        assert_eq!(outgoing.event_id, event.event_id());
    }

    #[test]
    fn test_descriptor_decodes_matching_payload() {
        let event = OrderCreatedIntegrationEvent {
            envelope: EventEnvelope::new(),
            order_id: 1,
        };
        let payload = serde_json::to_vec(&event).unwrap();
        let descriptor = EventDescriptor::of::<OrderCreatedIntegrationEvent>();

        let decoded = descriptor.decode("OrderCreated", &payload).unwrap();
        let decoded = decoded
            .downcast_ref::<OrderCreatedIntegrationEvent>()
            .unwrap();
        assert_eq!(decoded, &event);
    }

    #[test]
    fn test_descriptor_rejects_mismatched_payload() {
        let descriptor = EventDescriptor::of::<OrderCreatedIntegrationEvent>();
        let err = descriptor
            .decode("OrderCreated", br#"{"unexpected": true}"#)
            .unwrap_err();
        assert!(matches!(err, EventBusError::Deserialization { .. }));
    }
}
