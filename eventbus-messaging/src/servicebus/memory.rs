//! In-memory Service Bus namespace

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::client::{
    CorrelationRule, DEFAULT_RULE_NAME, ReceivedMessage, ServiceBusMessage, TopicClient,
    TopicManagement,
};
use crate::error::{EventBusError, Result};

#[derive(Debug, Clone)]
struct Stored {
    message: ServiceBusMessage,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Subscription {
    /// Rule name to label filter; `None` matches everything
    rules: HashMap<String, Option<String>>,
    active: VecDeque<Stored>,
    locked: HashMap<String, Stored>,
    dead_letter: Vec<ServiceBusMessage>,
}

impl Subscription {
    fn accepts(&self, label: &str) -> bool {
        self.rules
            .values()
            .any(|filter| filter.as_deref().is_none_or(|wanted| wanted == label))
    }
}

#[derive(Debug, Default)]
struct NamespaceState {
    unreachable: bool,
    failing_sends: u32,
    send_attempts: u32,
    topic_creations: u32,
    completed: u32,
    abandoned: u32,
    closed_clients: u32,
    topics: HashMap<String, HashMap<String, Subscription>>,
    sent: Vec<ServiceBusMessage>,
}

impl NamespaceState {
    fn reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(EventBusError::Connectivity(
                "namespace unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn subscription_mut(&mut self, topic: &str, subscription: &str) -> Result<&mut Subscription> {
        self.topics
            .get_mut(topic)
            .and_then(|subscriptions| subscriptions.get_mut(subscription))
            .ok_or_else(|| {
                EventBusError::TopologyNotFound(format!(
                    "MessagingEntityNotFound: {}/subscriptions/{}",
                    topic, subscription
                ))
            })
    }

    fn take_locked(&mut self, topic: &str, subscription: &str, message: &ReceivedMessage) -> Result<Stored> {
        self.subscription_mut(topic, subscription)?
            .locked
            .remove(&message.lock_token)
            .ok_or_else(|| EventBusError::Acknowledge(format!("MessageLockLost: {}", message.message_id)))
    }
}

/// A Service Bus namespace kept in memory.
///
/// Implements both [`TopicManagement`] and [`TopicClient`] with peek-lock
/// semantics, rule filtering and fault injection for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServiceBus {
    state: Arc<Mutex<NamespaceState>>,
    arrivals: Arc<Notify>,
}

impl InMemoryServiceBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Make the next `count` sends fail with a connectivity error
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().failing_sends = count;
    }

    /// Remove a rule behind the adapter's back
    pub fn drop_rule(&self, topic: &str, subscription: &str, rule: &str) {
        if let Ok(sub) = self.state.lock().subscription_mut(topic, subscription) {
            sub.rules.remove(rule);
        }
    }

    pub fn topic_exists_now(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    pub fn subscription_exists_now(&self, topic: &str, subscription: &str) -> bool {
        self.state
            .lock()
            .topics
            .get(topic)
            .is_some_and(|subs| subs.contains_key(subscription))
    }

    /// Rule names of a subscription, sorted
    pub fn rules(&self, topic: &str, subscription: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .topics
            .get(topic)
            .and_then(|subs| subs.get(subscription))
            .map(|sub| sub.rules.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn active_count(&self, topic: &str, subscription: &str) -> usize {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|subs| subs.get(subscription))
            .map_or(0, |sub| sub.active.len())
    }

    pub fn locked_count(&self, topic: &str, subscription: &str) -> usize {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|subs| subs.get(subscription))
            .map_or(0, |sub| sub.locked.len())
    }

    pub fn dead_lettered(&self, topic: &str, subscription: &str) -> Vec<ServiceBusMessage> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|subs| subs.get(subscription))
            .map(|sub| sub.dead_letter.clone())
            .unwrap_or_default()
    }

    pub fn sent(&self) -> Vec<ServiceBusMessage> {
        self.state.lock().sent.clone()
    }

    pub fn send_attempts(&self) -> u32 {
        self.state.lock().send_attempts
    }

    pub fn topic_creations(&self) -> u32 {
        self.state.lock().topic_creations
    }

    pub fn completed_count(&self) -> u32 {
        self.state.lock().completed
    }

    pub fn abandoned_count(&self) -> u32 {
        self.state.lock().abandoned
    }

    /// Number of `close` calls received from either client role
    pub fn closed_clients(&self) -> u32 {
        self.state.lock().closed_clients
    }

    fn try_lock_next(&self, topic: &str, subscription: &str) -> Result<Option<ReceivedMessage>> {
        let mut state = self.state.lock();
        state.reachable()?;
        let sub = state.subscription_mut(topic, subscription)?;
        let Some(mut stored) = sub.active.pop_front() else {
            return Ok(None);
        };

        stored.delivery_count += 1;
        let lock_token = uuid::Uuid::new_v4().to_string();
        let received = ReceivedMessage {
            message_id: stored.message.message_id.clone(),
            label: Some(stored.message.label.clone()),
            body: stored.message.body.clone(),
            delivery_count: stored.delivery_count,
            lock_token: lock_token.clone(),
        };
        sub.locked.insert(lock_token, stored);
        Ok(Some(received))
    }
}

#[async_trait]
impl TopicManagement for InMemoryServiceBus {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        let state = self.state.lock();
        state.reachable()?;
        Ok(state.topics.contains_key(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.reachable()?;
        if state.topics.contains_key(topic) {
            return Err(EventBusError::Topology(format!(
                "MessagingEntityAlreadyExists: {}",
                topic
            )));
        }
        state.topics.insert(topic.to_string(), HashMap::new());
        state.topic_creations += 1;
        Ok(())
    }

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool> {
        let state = self.state.lock();
        state.reachable()?;
        Ok(state
            .topics
            .get(topic)
            .is_some_and(|subs| subs.contains_key(subscription)))
    }

    async fn create_subscription(&self, topic: &str, subscription: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.reachable()?;
        let subs = state.topics.get_mut(topic).ok_or_else(|| {
            EventBusError::TopologyNotFound(format!("MessagingEntityNotFound: {}", topic))
        })?;
        if subs.contains_key(subscription) {
            return Err(EventBusError::Topology(format!(
                "MessagingEntityAlreadyExists: {}/subscriptions/{}",
                topic, subscription
            )));
        }
        let mut created = Subscription::default();
        created.rules.insert(DEFAULT_RULE_NAME.to_string(), None);
        subs.insert(subscription.to_string(), created);
        Ok(())
    }

    async fn rule_exists(&self, topic: &str, subscription: &str, rule: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.reachable()?;
        Ok(state
            .subscription_mut(topic, subscription)?
            .rules
            .contains_key(rule))
    }

    async fn create_rule(&self, topic: &str, subscription: &str, rule: &CorrelationRule) -> Result<()> {
        let mut state = self.state.lock();
        state.reachable()?;
        let sub = state.subscription_mut(topic, subscription)?;
        if sub.rules.contains_key(&rule.name) {
            return Err(EventBusError::Topology(format!(
                "MessagingEntityAlreadyExists: rule {}",
                rule.name
            )));
        }
        sub.rules.insert(rule.name.clone(), Some(rule.label.clone()));
        Ok(())
    }

    async fn delete_rule(&self, topic: &str, subscription: &str, rule: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.reachable()?;
        state
            .subscription_mut(topic, subscription)?
            .rules
            .remove(rule)
            .map(|_| ())
            .ok_or_else(|| {
                EventBusError::TopologyNotFound(format!("MessagingEntityNotFound: rule {}", rule))
            })
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed_clients += 1;
        Ok(())
    }
}

#[async_trait]
impl TopicClient for InMemoryServiceBus {
    async fn send(&self, topic: &str, message: ServiceBusMessage) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.reachable()?;
            state.send_attempts += 1;
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(EventBusError::Connectivity(
                    "injected send failure".to_string(),
                ));
            }

            let subs = state.topics.get_mut(topic).ok_or_else(|| {
                EventBusError::TopologyNotFound(format!("MessagingEntityNotFound: {}", topic))
            })?;
            for sub in subs.values_mut() {
                if sub.accepts(&message.label) {
                    sub.active.push_back(Stored {
                        message: message.clone(),
                        delivery_count: 0,
                    });
                }
            }
            state.sent.push(message);
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let arrived = self.arrivals.notified();
            if let Some(message) = self.try_lock_next(topic, subscription)? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, topic: &str, subscription: &str, message: &ReceivedMessage) -> Result<()> {
        let mut state = self.state.lock();
        state.take_locked(topic, subscription, message)?;
        state.completed += 1;
        Ok(())
    }

    async fn abandon(&self, topic: &str, subscription: &str, message: &ReceivedMessage) -> Result<()> {
        {
            let mut state = self.state.lock();
            let stored = state.take_locked(topic, subscription, message)?;
            state.subscription_mut(topic, subscription)?.active.push_front(stored);
            state.abandoned += 1;
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        topic: &str,
        subscription: &str,
        message: &ReceivedMessage,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state.take_locked(topic, subscription, message)?;
        state
            .subscription_mut(topic, subscription)?
            .dead_letter
            .push(stored.message);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed_clients += 1;
        Ok(())
    }
}
