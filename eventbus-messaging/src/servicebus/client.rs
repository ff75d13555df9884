//! Service Bus client abstraction used by the managed-topic adapter

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Name of the catch-all rule every new subscription starts with
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// A message sent to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBusMessage {
    pub message_id: String,
    /// Canonical event name, matched by correlation filters
    pub label: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// A message received in peek-lock mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub label: Option<String>,
    pub body: Vec<u8>,
    /// 1 on first delivery
    pub delivery_count: u32,
    pub lock_token: String,
}

/// A rule that forwards messages whose label equals `label`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRule {
    pub name: String,
    pub label: String,
}

impl CorrelationRule {
    pub fn for_label(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            name: label.clone(),
            label,
        }
    }
}

/// Namespace management: topics, subscriptions and rules.
///
/// Deleting a missing entity fails with
/// [`EventBusError::TopologyNotFound`](crate::EventBusError::TopologyNotFound).
#[async_trait]
pub trait TopicManagement: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool>;

    async fn create_topic(&self, topic: &str) -> Result<()>;

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool>;

    /// Create a subscription; it starts out with the [`DEFAULT_RULE_NAME`] rule
    async fn create_subscription(&self, topic: &str, subscription: &str) -> Result<()>;

    async fn rule_exists(&self, topic: &str, subscription: &str, rule: &str) -> Result<bool>;

    async fn create_rule(&self, topic: &str, subscription: &str, rule: &CorrelationRule) -> Result<()>;

    async fn delete_rule(&self, topic: &str, subscription: &str, rule: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Sending to a topic and peek-lock receiving from its subscriptions.
#[async_trait]
pub trait TopicClient: Send + Sync {
    async fn send(&self, topic: &str, message: ServiceBusMessage) -> Result<()>;

    /// Lock the next message, waiting up to `wait` for one to arrive
    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>>;

    async fn complete(&self, topic: &str, subscription: &str, message: &ReceivedMessage) -> Result<()>;

    /// Release the lock so the message is delivered again
    async fn abandon(&self, topic: &str, subscription: &str, message: &ReceivedMessage) -> Result<()>;

    async fn dead_letter(
        &self,
        topic: &str,
        subscription: &str,
        message: &ReceivedMessage,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
