//! Building an event bus from configuration

use std::sync::Arc;
use tracing::info;

use crate::config::{EventBusConfig, TransportKind};
use crate::error::{EventBusError, Result};
use crate::handler::HandlerResolver;
use crate::rabbitmq::{AmqpConnector, EventBusRabbitMq, InMemoryAmqpBroker};
use crate::servicebus::{EventBusServiceBus, InMemoryServiceBus, TopicClient, TopicManagement};
use crate::EventBus;

/// Transport clients an adapter is built on
#[derive(Clone)]
pub enum TransportClients {
    /// AMQP connector for the broker-topology transport
    Broker(Arc<dyn AmqpConnector>),
    /// Management and messaging clients for the managed-topic transport
    Managed {
        management: Arc<dyn TopicManagement>,
        client: Arc<dyn TopicClient>,
    },
}

impl TransportClients {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportClients::Broker(_) => TransportKind::BrokerTopology,
            TransportClients::Managed { .. } => TransportKind::ManagedTopic,
        }
    }
}

impl From<InMemoryAmqpBroker> for TransportClients {
    fn from(broker: InMemoryAmqpBroker) -> Self {
        TransportClients::Broker(Arc::new(broker))
    }
}

impl From<InMemoryServiceBus> for TransportClients {
    fn from(namespace: InMemoryServiceBus) -> Self {
        TransportClients::Managed {
            management: Arc::new(namespace.clone()),
            client: Arc::new(namespace),
        }
    }
}

impl std::fmt::Debug for TransportClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransportClients").field(&self.kind()).finish()
    }
}

/// Creates the adapter selected by [`EventBusConfig::transport`]
pub struct EventBusFactory;

impl EventBusFactory {
    /// Create a bus talking to a real broker
    ///
    /// The broker-topology transport needs the `rabbitmq` feature, the
    /// managed-topic transport the `servicebus` feature.
    pub async fn create(
        config: EventBusConfig,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Result<Arc<dyn EventBus>> {
        let clients = match config.transport {
            TransportKind::BrokerTopology => broker_clients(&config)?,
            TransportKind::ManagedTopic => managed_clients(&config)?,
        };
        Self::create_with(config, resolver, clients).await
    }

    /// Create a bus on explicitly supplied transport clients
    pub async fn create_with(
        config: EventBusConfig,
        resolver: Arc<dyn HandlerResolver>,
        clients: TransportClients,
    ) -> Result<Arc<dyn EventBus>> {
        if clients.kind() != config.transport {
            return Err(EventBusError::Configuration(format!(
                "transport is {} but {} clients were supplied",
                config.transport,
                clients.kind()
            )));
        }

        info!(transport = %config.transport, app = %config.subscriber_app_name, "Creating event bus");
        let bus: Arc<dyn EventBus> = match clients {
            TransportClients::Broker(connector) => {
                Arc::new(EventBusRabbitMq::new(config, connector, resolver).await?)
            }
            TransportClients::Managed { management, client } => {
                Arc::new(EventBusServiceBus::new(config, management, client, resolver).await?)
            }
        };
        Ok(bus)
    }
}

#[cfg(feature = "rabbitmq")]
fn broker_clients(config: &EventBusConfig) -> Result<TransportClients> {
    Ok(TransportClients::Broker(Arc::new(
        crate::rabbitmq::LapinConnector::new(&config.rabbitmq),
    )))
}

#[cfg(not(feature = "rabbitmq"))]
fn broker_clients(_config: &EventBusConfig) -> Result<TransportClients> {
    Err(EventBusError::Configuration(
        "the broker-topology transport requires the `rabbitmq` feature".to_string(),
    ))
}

#[cfg(feature = "servicebus")]
fn managed_clients(config: &EventBusConfig) -> Result<TransportClients> {
    let client = Arc::new(crate::servicebus::ServiceBusRestClient::new(
        &config.service_bus,
        config.delivery.max_delivery_count,
    )?);
    Ok(TransportClients::Managed {
        management: client.clone(),
        client,
    })
}

#[cfg(not(feature = "servicebus"))]
fn managed_clients(_config: &EventBusConfig) -> Result<TransportClients> {
    Err(EventBusError::Configuration(
        "the managed-topic transport requires the `servicebus` feature".to_string(),
    ))
}
