//! Resilient AMQP connection

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::channel::{AmqpChannel, AmqpConnection, AmqpConnector};
use crate::error::{EventBusError, Result};
use crate::retry::RetryPolicy;

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A connection that re-establishes itself on demand.
///
/// Every successful connect bumps the generation, which lets owners notice
/// that topology declared on an earlier connection has to be re-provisioned.
pub struct PersistentConnection {
    connector: Arc<dyn AmqpConnector>,
    retry: RetryPolicy,
    current: RwLock<Option<Arc<dyn AmqpConnection>>>,
    connect_lock: Mutex<()>,
    connecting: AtomicBool,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl PersistentConnection {
    pub fn new(connector: Arc<dyn AmqpConnector>, retry: RetryPolicy) -> Self {
        Self {
            connector,
            retry,
            current: RwLock::new(None),
            connect_lock: Mutex::new(()),
            connecting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else if self.connecting.load(Ordering::SeqCst) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|connection| connection.is_open())
    }

    /// Number of connections established so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Make a single connection attempt unless already connected
    pub async fn try_connect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Disposed);
        }
        if self.is_connected() {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.connecting.store(true, Ordering::SeqCst);
        debug!("Connecting to AMQP broker");
        let result = self.connector.connect().await;
        self.connecting.store(false, Ordering::SeqCst);

        match result {
            Ok(connection) => {
                *self.current.write() = Some(connection);
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                info!(generation, "Connected to AMQP broker");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "AMQP connection attempt failed");
                Err(e)
            }
        }
    }

    /// Connect, retrying transient failures with the configured backoff
    pub async fn connect_with_retry(&self) -> Result<()> {
        self.retry
            .execute("connect", move |_| self.try_connect())
            .await
    }

    /// Open a channel on the current connection
    pub async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let connection = self
            .current
            .read()
            .clone()
            .filter(|connection| connection.is_open())
            .ok_or_else(|| EventBusError::Connectivity("not connected".to_string()))?;
        connection.create_channel().await
    }

    /// Close the connection for good
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let connection = self.current.write().take();
        if let Some(connection) = connection {
            if connection.is_open() {
                connection.close().await?;
            }
            info!("AMQP connection closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::InMemoryAmqpBroker;
    use std::time::Duration;

    fn connection(broker: &InMemoryAmqpBroker, retries: u32) -> PersistentConnection {
        PersistentConnection::new(
            Arc::new(broker.clone()),
            RetryPolicy::new(retries, Duration::from_millis(100)),
        )
    }

    #[tokio::test]
    async fn test_try_connect_is_idempotent() {
        let broker = InMemoryAmqpBroker::new();
        let conn = connection(&broker, 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.try_connect().await.unwrap();
        conn.try_connect().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.generation(), 1);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_counts_attempts() {
        let broker = InMemoryAmqpBroker::new();
        broker.set_reachable(false);
        let conn = connection(&broker, 3);

        let err = conn.connect_with_retry().await.unwrap_err();
        assert!(matches!(err, EventBusError::Connectivity(_)));
        assert_eq!(broker.connect_attempts(), 4);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_reconnects_after_sever() {
        let broker = InMemoryAmqpBroker::new();
        let conn = connection(&broker, 2);
        conn.try_connect().await.unwrap();

        broker.sever_connections();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.create_channel().await.is_err());

        conn.connect_with_retry().await.unwrap();
        assert_eq!(conn.generation(), 2);
        assert!(conn.create_channel().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_to_reconnect() {
        let broker = InMemoryAmqpBroker::new();
        let conn = connection(&broker, 0);
        conn.try_connect().await.unwrap();
        conn.close().await.unwrap();

        assert!(matches!(conn.try_connect().await, Err(EventBusError::Disposed)));
    }
}
