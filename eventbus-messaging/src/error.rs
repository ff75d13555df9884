//! Error types for event bus operations

use thiserror::Error;

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;

/// Errors that can occur while publishing, subscribing or dispatching events
#[derive(Error, Debug)]
pub enum EventBusError {
    /// The broker could not be reached or the connection dropped
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A topology element (queue, binding, subscription, rule) does not exist
    #[error("Topology element not found: {0}")]
    TopologyNotFound(String),

    /// A topology operation was refused by the broker
    #[error("Topology operation failed: {0}")]
    Topology(String),

    /// Failed to serialize an event
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The payload does not match the registered event type
    #[error("Deserialization of '{event}' failed: {reason}")]
    Deserialization {
        /// Canonical event name
        event: String,
        /// Decoder message
        reason: String,
    },

    /// A handler returned an error
    #[error("Handler {handler} failed for '{event}': {source}")]
    Handler {
        /// Canonical event name
        event: String,
        /// Handler type name
        handler: &'static str,
        /// Error reported by the handler
        #[source]
        source: crate::handler::EventHandlerError,
    },

    /// A resolved handler instance does not match its binding
    #[error("Handler resolution failed: {0}")]
    HandlerResolution(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Failed to settle (ack, reject, complete, abandon) a message
    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    /// Channel or client is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The bus has been disposed
    #[error("Event bus has been disposed")]
    Disposed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl EventBusError {
    /// Check if this error is a transient transport fault worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EventBusError::Connectivity(_) | EventBusError::ChannelClosed(_)
        )
    }

    /// Check if this error reports a missing topology element
    pub fn is_not_found(&self) -> bool {
        matches!(self, EventBusError::TopologyNotFound(_))
    }

    /// Check if this error is fatal for a single message rather than the bus
    pub fn is_message_fatal(&self) -> bool {
        matches!(self, EventBusError::Deserialization { .. })
    }
}

/// AMQP reply code for a missing queue, exchange or binding
#[cfg(feature = "rabbitmq")]
const AMQP_NOT_FOUND: u16 = 404;

#[cfg(feature = "rabbitmq")]
impl From<lapin::Error> for EventBusError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) if amqp.get_id() == AMQP_NOT_FOUND => {
                EventBusError::TopologyNotFound(err.to_string())
            }
            lapin::Error::IOError(_) => EventBusError::Connectivity(err.to_string()),
            lapin::Error::InvalidChannelState(_) => EventBusError::ChannelClosed(err.to_string()),
            lapin::Error::InvalidConnectionState(_) => EventBusError::Connectivity(err.to_string()),
            _ => EventBusError::Topology(err.to_string()),
        }
    }
}

#[cfg(feature = "servicebus")]
impl From<reqwest::Error> for EventBusError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            EventBusError::Connectivity(err.to_string())
        } else {
            EventBusError::Other(err.to_string())
        }
    }
}
