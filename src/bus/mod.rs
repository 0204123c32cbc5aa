use async_trait::async_trait;

use crate::error::Error;

pub mod memory;
pub mod mqtt;

pub use memory::MemoryBroker;
pub use mqtt::MqttBus;

/// Topic prefix, shared by all receivers
pub const TOPIC_PREFIX: &str = "gnss/data/";

/// Returns the topic dedicated to this receiver
pub fn topic(receiver: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, receiver)
}

/// Events reported by the bus, consumed by its owner
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Link (re)established
    Connected,

    /// Link lost, with reason
    Disconnected(String),

    /// Incoming message on one of our subscriptions
    Message { topic: String, payload: String },
}

/// Cloneable publication handle
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), Error>;
}

/// Bus connection, owned by a single daemon or validator
#[async_trait]
pub trait Bus: Send + Sync {
    type Publisher: Publisher + Clone + 'static;

    /// Obtain a new [Publisher] handle
    fn publisher(&self) -> Self::Publisher;

    /// Subscribe to given topic
    async fn subscribe(&self, topic: &str) -> Result<(), Error>;

    /// Waits for the next [BusEvent]. None once the bus is closed for good.
    async fn recv(&mut self) -> Option<BusEvent>;

    /// Closes this connection
    async fn close(&mut self);
}
