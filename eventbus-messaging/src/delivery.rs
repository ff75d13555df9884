//! Settlement of consumed messages after dispatch

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{EventBusError, Result};

/// How a consumed message is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledge / complete; the message is gone
    Ack,
    /// Return the message for another delivery
    Requeue,
    /// Give up on the message (reject without requeue / dead-letter)
    DeadLetter,
}

/// Redelivery bound for failed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPolicy {
    /// Deliveries after which a failing message is dead-lettered
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,
}

fn default_max_delivery_count() -> u32 {
    5
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_delivery_count: default_max_delivery_count(),
        }
    }
}

impl DeliveryPolicy {
    pub fn new(max_delivery_count: u32) -> Self {
        Self { max_delivery_count }
    }

    /// Decide how to settle a message after dispatch
    ///
    /// `delivery_count` is the 1-based number of times this message has been
    /// delivered, including the current delivery.
    pub fn settle(&self, event: &str, outcome: &Result<bool>, delivery_count: u32) -> Settlement {
        match outcome {
            Ok(true) => Settlement::Ack,
            Ok(false) => {
                debug!(event = %event, "Unroutable event acknowledged");
                Settlement::Ack
            }
            Err(e @ EventBusError::Deserialization { .. }) => {
                error!(event = %event, error = %e, "Undecodable message dead-lettered");
                Settlement::DeadLetter
            }
            Err(e) if delivery_count < self.max_delivery_count => {
                warn!(
                    event = %event,
                    delivery_count,
                    max_delivery_count = self.max_delivery_count,
                    error = %e,
                    "Dispatch failed, message will be redelivered"
                );
                Settlement::Requeue
            }
            Err(e) => {
                error!(
                    event = %event,
                    delivery_count,
                    error = %e,
                    "Dispatch failed, redeliveries exhausted; dead-lettering"
                );
                Settlement::DeadLetter
            }
        }
    }
}
