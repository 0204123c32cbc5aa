use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, error, warn};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    bus::{Bus, BusEvent, Publisher},
    error::Error,
    settings::{ReconnectPolicy, Settings},
};

/// Pending requests & events capacity
const CAPACITY: usize = 128;

/// MQTT client, polled by its own I/O task
#[derive(Debug)]
pub struct MqttBus {
    client: AsyncClient,
    online: Arc<AtomicBool>,
    events: mpsc::Receiver<BusEvent>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    online: Arc<AtomicBool>,
}

impl MqttBus {
    /// Deploys a new client. Connection happens in the background:
    /// wait for [BusEvent::Connected].
    pub fn connect(settings: &Settings, client_id: &str) -> Self {
        let mut options = MqttOptions::new(client_id, settings.broker.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));

        let (client, eventloop) = AsyncClient::new(options, CAPACITY);
        let (tx, events) = mpsc::channel(CAPACITY);

        let online = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(drive(
            eventloop,
            tx,
            online.clone(),
            settings.reconnect.clone(),
        ));

        Self {
            client,
            online,
            events,
            task,
        }
    }
}

/// Polls the MQTT event loop, forwards what matters to the owner.
async fn drive(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<BusEvent>,
    online: Arc<AtomicBool>,
    policy: ReconnectPolicy,
) {
    let mut attempt = 0;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("mqtt: connack {:?}", ack.code);
                attempt = 0;
                online.store(true, Ordering::SeqCst);
                BusEvent::Connected
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => BusEvent::Message {
                topic: publish.topic,
                payload: String::from_utf8_lossy(&publish.payload).into_owned(),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                online.store(false, Ordering::SeqCst);
                BusEvent::Disconnected("disconnected by broker".to_string())
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                online.store(false, Ordering::SeqCst);
                return;
            },
            Ok(_) => continue,
            Err(e) => {
                online.store(false, Ordering::SeqCst);

                if tx.send(BusEvent::Disconnected(e.to_string())).await.is_err() {
                    return;
                }

                match policy.backoff(attempt) {
                    Some(delay) => {
                        debug!(
                            "mqtt: reconnection attempt #{} in {:?}",
                            attempt + 1,
                            delay
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    },
                    None => {
                        error!("mqtt: giving up on broker connection");
                        return;
                    },
                }
            },
        };

        if tx.send(event).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), Error> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::Publish {
                topic: topic.to_string(),
                reason: "broker unreachable".to_string(),
            });
        }

        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .map_err(|e| Error::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Bus for MqttBus {
    type Publisher = MqttPublisher;

    fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
            online: self.online.clone(),
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| Error::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn recv(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("mqtt: disconnection request failed: {}", e);
        }

        // leave some time for the DISCONNECT packet to go out
        if tokio::time::timeout(Duration::from_secs(1), &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }

        self.events.close();
    }
}
