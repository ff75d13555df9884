//! Canonical event names and per-subscriber queue names

use crate::config::EventBusConfig;
use crate::event::IntegrationEvent;

/// Maps raw event names to canonical routing keys.
///
/// Prefix and suffix stripping are character-set trims: every leading
/// character contained in the prefix and every trailing character contained in
/// the suffix is removed. With the default suffix `IntegrationEvent`,
/// `OrderCreatedIntegrationEvent` becomes `OrderCreated`, but
/// `PaymentIntegrationEvent` becomes `Paym`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNameProcessor {
    prefix: String,
    suffix: String,
    strip_prefix: bool,
    strip_suffix: bool,
    subscriber_app_name: String,
}

impl EventNameProcessor {
    /// Processor that strips nothing
    pub fn new(subscriber_app_name: impl Into<String>) -> Self {
        Self {
            prefix: String::new(),
            suffix: String::new(),
            strip_prefix: false,
            strip_suffix: false,
            subscriber_app_name: subscriber_app_name.into(),
        }
    }

    /// Build from bus configuration
    pub fn from_config(config: &EventBusConfig) -> Self {
        Self::new(config.subscriber_app_name.clone())
            .with_prefix(config.event_name_prefix.clone(), config.strips_prefix())
            .with_suffix(config.event_name_suffix.clone(), config.strips_suffix())
    }

    /// Set the prefix character set
    pub fn with_prefix(mut self, prefix: impl Into<String>, strip: bool) -> Self {
        self.prefix = prefix.into();
        self.strip_prefix = strip;
        self
    }

    /// Set the suffix character set
    pub fn with_suffix(mut self, suffix: impl Into<String>, strip: bool) -> Self {
        self.suffix = suffix.into();
        self.strip_suffix = strip;
        self
    }

    /// Canonical routing key for a raw event name
    pub fn canonical_name(&self, raw_name: &str) -> String {
        let mut name = raw_name;
        if self.strip_prefix && !self.prefix.is_empty() {
            name = name.trim_start_matches(|c: char| self.prefix.contains(c));
        }
        if self.strip_suffix && !self.suffix.is_empty() {
            name = name.trim_end_matches(|c: char| self.suffix.contains(c));
        }
        name.to_string()
    }

    /// Canonical routing key for an event type
    pub fn canonical_name_of<E: IntegrationEvent>(&self) -> String {
        self.canonical_name(&E::event_name())
    }

    /// `subscriberAppName.canonicalName`, used for queues and subscriptions
    pub fn queue_name(&self, canonical_name: &str) -> String {
        format!("{}.{}", self.subscriber_app_name, canonical_name)
    }

    pub fn subscriber_app_name(&self) -> &str {
        &self.subscriber_app_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> EventNameProcessor {
        EventNameProcessor::new("PaymentService").with_suffix("IntegrationEvent", true)
    }

    #[test]
    fn test_suffix_is_stripped() {
        let p = processor();
        assert_eq!(p.canonical_name("OrderCreatedIntegrationEvent"), "OrderCreated");
        assert_eq!(p.canonical_name("OrderStartedIntegrationEvent"), "OrderStarted");
        assert_eq!(p.canonical_name("OrderCreated"), "OrderCreated");
    }

    #[test]
    fn test_trim_is_character_set_based() {
        let p = processor();
        assert_eq!(p.canonical_name("PaymentIntegrationEvent"), "Paym");

        let p = EventNameProcessor::new("app").with_prefix("Evt", true);
        assert_eq!(p.canonical_name("tEvOrderPlaced"), "OrderPlaced");
    }

    #[test]
    fn test_flags_disable_stripping() {
        let p = EventNameProcessor::new("app")
            .with_prefix("Order", false)
            .with_suffix("IntegrationEvent", false);
        assert_eq!(
            p.canonical_name("OrderCreatedIntegrationEvent"),
            "OrderCreatedIntegrationEvent"
        );
    }

    #[test]
    fn test_canonical_name_is_idempotent() {
        let processors = [
            processor(),
            EventNameProcessor::new("app").with_prefix("Acme.", true),
            EventNameProcessor::new("app")
                .with_prefix("Evt", true)
                .with_suffix("Event", true),
            EventNameProcessor::new("app"),
        ];
        let names = [
            "OrderCreatedIntegrationEvent",
            "Acme.OrderShipped",
            "EvtUserRegisteredEvent",
            "",
            "IntegrationEvent",
            "tttt",
        ];

        for p in &processors {
            for name in names {
                let once = p.canonical_name(name);
                assert_eq!(p.canonical_name(&once), once, "{name} via {p:?}");
            }
        }
    }

    #[test]
    fn test_queue_name() {
        let p = processor();
        assert_eq!(p.queue_name("OrderCreated"), "PaymentService.OrderCreated");
    }
}
