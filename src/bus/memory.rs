//! In-process broker, used in loopback mode and in tests
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use log::warn;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    bus::{Bus, BusEvent, Publisher},
    error::Error,
};

const CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Frame {
    Publish { topic: String, payload: String },
    #[cfg(test)]
    Disconnect(String),
    #[cfg(test)]
    Reconnect,
}

/// [MemoryBroker] routes publications to all connected [MemoryBus]es
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    tx: broadcast::Sender<Frame>,
    online: Arc<AtomicBool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self {
            tx,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Opens a new client connection
    pub fn connect(&self) -> MemoryBus {
        let closed = Arc::new(AtomicBool::new(false));
        MemoryBus {
            rx: self.tx.subscribe(),
            announce: true,
            subscriptions: Default::default(),
            publisher: MemoryPublisher {
                tx: self.tx.clone(),
                online: self.online.clone(),
                closed: closed.clone(),
            },
            closed,
        }
    }

    /// Simulates a broker outage: all clients lose their link
    #[cfg(test)]
    pub fn disconnect_all(&self, reason: &str) {
        self.online.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Frame::Disconnect(reason.to_string()));
    }

    /// Ends the outage
    #[cfg(test)]
    pub fn reconnect_all(&self) {
        self.online.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Frame::Reconnect);
    }
}

#[derive(Debug, Clone)]
pub struct MemoryPublisher {
    tx: broadcast::Sender<Frame>,
    online: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), Error> {
        let failure = |reason: &str| Error::Publish {
            topic: topic.to_string(),
            reason: reason.to_string(),
        };

        if self.closed.load(Ordering::SeqCst) {
            return Err(failure("connection closed"));
        }

        if !self.online.load(Ordering::SeqCst) {
            return Err(failure("broker unreachable"));
        }

        // no receiver is not an error: nobody listens, like a real broker
        let _ = self.tx.send(Frame::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });

        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryBus {
    rx: broadcast::Receiver<Frame>,
    announce: bool,
    subscriptions: Mutex<HashSet<String>>,
    publisher: MemoryPublisher,
    closed: Arc<AtomicBool>,
}

impl MemoryBus {
    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(topic)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    type Publisher = MemoryPublisher;

    fn publisher(&self) -> MemoryPublisher {
        self.publisher.clone()
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Subscribe {
                topic: topic.to_string(),
                reason: "connection closed".to_string(),
            });
        }

        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string());

        Ok(())
    }

    async fn recv(&mut self) -> Option<BusEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        if self.announce {
            self.announce = false;
            return Some(BusEvent::Connected);
        }

        loop {
            match self.rx.recv().await {
                Ok(Frame::Publish { topic, payload }) => {
                    if self.is_subscribed(&topic) {
                        return Some(BusEvent::Message { topic, payload });
                    }
                },
                #[cfg(test)]
                Ok(Frame::Disconnect(reason)) => return Some(BusEvent::Disconnected(reason)),
                #[cfg(test)]
                Ok(Frame::Reconnect) => return Some(BusEvent::Connected),
                Err(RecvError::Lagged(missed)) => {
                    warn!("memory bus: {} frames lost", missed);
                },
                Err(RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn routing() {
        let broker = MemoryBroker::new();

        let mut rx_a = broker.connect();
        let mut rx_b = broker.connect();
        let tx = broker.connect();

        assert_eq!(rx_a.recv().await, Some(BusEvent::Connected));
        assert_eq!(rx_b.recv().await, Some(BusEvent::Connected));

        rx_a.subscribe("gnss/data/A").await.unwrap();
        rx_b.subscribe("gnss/data/B").await.unwrap();

        let publisher = tx.publisher();
        publisher.publish("gnss/data/B", "for b").await.unwrap();
        publisher.publish("gnss/data/A", "for a").await.unwrap();

        assert_eq!(
            rx_a.recv().await,
            Some(BusEvent::Message {
                topic: "gnss/data/A".to_string(),
                payload: "for a".to_string()
            })
        );

        assert_eq!(
            rx_b.recv().await,
            Some(BusEvent::Message {
                topic: "gnss/data/B".to_string(),
                payload: "for b".to_string()
            })
        );
    }

    #[tokio::test]
    async fn outage() {
        let broker = MemoryBroker::new();
        let mut bus = broker.connect();
        let publisher = bus.publisher();

        assert_eq!(bus.recv().await, Some(BusEvent::Connected));

        broker.disconnect_all("maintenance");

        assert_eq!(
            bus.recv().await,
            Some(BusEvent::Disconnected("maintenance".to_string()))
        );

        assert!(matches!(
            publisher.publish("gnss/data/A", "lost").await,
            Err(Error::Publish { .. })
        ));

        broker.reconnect_all();

        assert_eq!(bus.recv().await, Some(BusEvent::Connected));
        assert!(publisher.publish("gnss/data/A", "ok").await.is_ok());

        bus.close().await;
        assert_eq!(bus.recv().await, None);
        assert!(publisher.publish("gnss/data/A", "closed").await.is_err());
    }
}
