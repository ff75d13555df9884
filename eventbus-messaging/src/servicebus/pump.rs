//! Concurrent peek-lock message pump

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::client::{ReceivedMessage, TopicClient};
use crate::delivery::Settlement;
use crate::error::EventBusError;

/// Processes one message and decides how it is settled
pub type MessageProcessor = Arc<dyn Fn(ReceivedMessage) -> BoxFuture<'static, Settlement> + Send + Sync>;

/// Receives errors raised while receiving or settling
pub type ErrorHandler = Arc<dyn Fn(&EventBusError) + Send + Sync>;

/// Wrap an async closure as a [`MessageProcessor`]
pub fn message_processor<F, Fut>(f: F) -> MessageProcessor
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Settlement> + Send + 'static,
{
    Arc::new(move |message: ReceivedMessage| f(message).boxed())
}

const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Pump options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOptions {
    /// Messages processed at the same time
    pub max_concurrent_calls: usize,
    /// Long-poll duration of a single receive
    pub receive_wait: Duration,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            receive_wait: Duration::from_secs(30),
        }
    }
}

/// Pulls messages from one subscription and hands them to a processor.
///
/// Messages are only completed when the processor says so; errors go to the
/// error handler and never stop the pump.
pub struct MessagePump {
    subscription: String,
    shutdown: watch::Sender<bool>,
    permits: Arc<Semaphore>,
    max_concurrent_calls: usize,
    task: Option<JoinHandle<()>>,
}

struct PumpContext {
    client: Arc<dyn TopicClient>,
    topic: String,
    subscription: String,
    processor: MessageProcessor,
    on_error: ErrorHandler,
}

impl MessagePump {
    pub fn start(
        client: Arc<dyn TopicClient>,
        topic: impl Into<String>,
        subscription: impl Into<String>,
        options: PumpOptions,
        processor: MessageProcessor,
        on_error: ErrorHandler,
    ) -> Self {
        let max_concurrent_calls = options.max_concurrent_calls.max(1);
        let permits = Arc::new(Semaphore::new(max_concurrent_calls));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let context = Arc::new(PumpContext {
            client,
            topic: topic.into(),
            subscription: subscription.into(),
            processor,
            on_error,
        });
        let subscription = context.subscription.clone();

        let task = tokio::spawn(run(context, permits.clone(), options.receive_wait, shutdown_rx));
        debug!(subscription = %subscription, max_concurrent_calls, "Message pump started");

        Self {
            subscription,
            shutdown,
            permits,
            max_concurrent_calls,
            task: Some(task),
        }
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop receiving and wait for in-flight messages to settle
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Ok(permits) = self.permits.acquire_many(self.max_concurrent_calls as u32).await {
            permits.forget();
        }
        debug!(subscription = %self.subscription, "Message pump stopped");
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for MessagePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePump")
            .field("subscription", &self.subscription)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run(
    context: Arc<PumpContext>,
    permits: Arc<Semaphore>,
    receive_wait: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = context.client.receive(&context.topic, &context.subscription, receive_wait) => received,
        };

        match received {
            Ok(Some(message)) => {
                let context = context.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    process(&context, message).await;
                });
            }
            Ok(None) => {}
            Err(e) => {
                drop(permit);
                (context.on_error)(&e);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

async fn process(context: &PumpContext, message: ReceivedMessage) {
    let settlement = (context.processor)(message.clone()).await;
    let (topic, subscription) = (context.topic.as_str(), context.subscription.as_str());

    let result = match settlement {
        Settlement::Ack => context.client.complete(topic, subscription, &message).await,
        Settlement::Requeue => context.client.abandon(topic, subscription, &message).await,
        Settlement::DeadLetter => context.client.dead_letter(topic, subscription, &message).await,
    };
    if let Err(e) = result {
        (context.on_error)(&e);
    }
}

/// Error handler that logs through `tracing`
pub fn log_errors(subscription: impl Into<String>) -> ErrorHandler {
    let subscription = subscription.into();
    Arc::new(move |e: &EventBusError| {
        error!(subscription = %subscription, error = %e, "Message pump error");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servicebus::client::{ServiceBusMessage, TopicManagement};
    use crate::servicebus::InMemoryServiceBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: &str = "EventBusDefaultTopic";
    const SUB: &str = "Ordering.OrderCreated";

    async fn namespace() -> InMemoryServiceBus {
        let bus = InMemoryServiceBus::new();
        bus.create_topic(TOPIC).await.unwrap();
        bus.create_subscription(TOPIC, SUB).await.unwrap();
        bus
    }

    async fn send(bus: &InMemoryServiceBus, count: usize) {
        for _ in 0..count {
            bus.send(
                TOPIC,
                ServiceBusMessage {
                    message_id: uuid::Uuid::new_v4().to_string(),
                    label: "OrderCreated".into(),
                    content_type: "application/json".into(),
                    body: Vec::new(),
                },
            )
            .await
            .unwrap();
        }
    }

    fn options(max_concurrent_calls: usize) -> PumpOptions {
        PumpOptions {
            max_concurrent_calls,
            receive_wait: Duration::from_millis(50),
        }
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
    async fn test_completes_processed_messages() {
        let bus = namespace().await;
        send(&bus, 3).await;

        let processor = message_processor(|_| async { Settlement::Ack });
        let pump = MessagePump::start(
            Arc::new(bus.clone()),
            TOPIC,
            SUB,
            options(2),
            processor,
            log_errors(SUB),
        );

        let probe = bus.clone();
        eventually(move || probe.completed_count() == 3).await;
        pump.stop().await;
        assert_eq!(bus.active_count(TOPIC, SUB), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let bus = namespace().await;
        send(&bus, 8).await;

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let processor = {
            let (running, peak) = (running.clone(), peak.clone());
            message_processor(move |_| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Settlement::Ack
                }
            })
        };
        let pump = MessagePump::start(
            Arc::new(bus.clone()),
            TOPIC,
            SUB,
            options(3),
            processor,
            log_errors(SUB),
        );

        let probe = bus.clone();
        eventually(move || probe.completed_count() == 8).await;
        pump.stop().await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_errors_are_reported_and_pump_keeps_running() {
        let bus = namespace().await;
        bus.set_reachable(false);

        let errors = Arc::new(AtomicUsize::new(0));
        let on_error: ErrorHandler = {
            let errors = errors.clone();
            Arc::new(move |_: &EventBusError| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };
        let processor = message_processor(|_| async { Settlement::Ack });
        let pump = MessagePump::start(Arc::new(bus.clone()), TOPIC, SUB, options(1), processor, on_error);

        let probe = errors.clone();
        eventually(move || probe.load(Ordering::SeqCst) >= 1).await;
        assert!(pump.is_running());

        bus.set_reachable(true);
        send(&bus, 1).await;
        let probe = bus.clone();
        eventually(move || probe.completed_count() == 1).await;
        pump.stop().await;
    }

    #[tokio::test]
    async fn test_abandoned_messages_come_back() {
        let bus = namespace().await;
        send(&bus, 1).await;

        let processor = message_processor(|message: ReceivedMessage| async move {
            if message.delivery_count < 3 {
                Settlement::Requeue
            } else {
                Settlement::DeadLetter
            }
        });
        let pump = MessagePump::start(
            Arc::new(bus.clone()),
            TOPIC,
            SUB,
            options(1),
            processor,
            log_errors(SUB),
        );

        let probe = bus.clone();
        eventually(move || probe.dead_lettered(TOPIC, SUB).len() == 1).await;
        pump.stop().await;
        assert_eq!(bus.abandoned_count(), 2);
    }
}
