//! MQTT adapters for the upstream frame topic and the model queues.
//!
//! Each adapter owns one rumqttc client and a driver thread that iterates the
//! connection. Subscriptions are re-issued on every ConnAck because sessions
//! start clean.

use anyhow::{anyhow, Result};
use rumqttc::v5::{
    mqttbytes::QoS, Client, Connection, ConnectionError, Event, Incoming, MqttOptions,
};
use rumqttc::Outgoing;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::batch::Batch;
use crate::error::EngineError;
use crate::ingest::{EventSource, FrameEvent, LogPosition};
use crate::publish::{model_queue_topic, BatchMessage, BatchPublisher};

use super::endpoint::{MqttEndpoint, TlsMaterials};
use super::wire::decode_frame_event;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const SUBSCRIBE_QUEUE_DEPTH: usize = 10;
const PUBLISH_QUEUE_DEPTH: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Broker connection parameters shared by every adapter.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttSettings {
    fn connect(&self, role: &str, queue_depth: usize) -> Result<(Client, Connection)> {
        let client_id = format!("{}-{}", self.client_id, role);
        let mut options = MqttOptions::new(&client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(user) = &self.username {
            options.set_credentials(user, self.password.clone().unwrap_or_default());
        }
        options.set_transport(self.endpoint.transport(&self.tls)?);

        let (client, connection) = Client::new(options, queue_depth);
        log::info!(
            "MQTT client {} -> {}:{} (TLS: {}, auth: {})",
            client_id,
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.use_tls,
            self.username.is_some()
        );
        Ok((client, connection))
    }
}

enum Inbound {
    Message(Vec<u8>),
    Down(String),
}

/// A live subscription to one topic. Retained messages are skipped so a
/// reader only sees what is published after it connects.
pub struct MqttSubscription {
    topic: String,
    client: Client,
    inbound: Receiver<Inbound>,
    stop: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl MqttSubscription {
    pub fn open(settings: &MqttSettings, role: &str, topic: &str) -> Result<Self> {
        let (client, connection) = settings.connect(role, SUBSCRIBE_QUEUE_DEPTH)?;
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let driver = {
            let client = client.clone();
            let stop = stop.clone();
            let topic = topic.to_string();
            thread::Builder::new()
                .name(format!("mqtt-sub-{}", role))
                .spawn(move || drive_subscription(connection, client, topic, tx, stop))
                .map_err(|e| anyhow!("spawn MQTT driver: {}", e))?
        };
        Ok(Self {
            topic: topic.to_string(),
            client,
            inbound: rx,
            stop,
            driver: Some(driver),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, `Ok(None)` on timeout. A connection drop surfaces once
    /// as `Transport`; the driver keeps reconnecting in the background.
    pub fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>, EngineError> {
        match self.inbound.recv_timeout(timeout) {
            Ok(Inbound::Message(payload)) => Ok(Some(payload)),
            Ok(Inbound::Down(reason)) => Err(EngineError::Transport(reason)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Transport(format!(
                "subscription to {} closed",
                self.topic
            ))),
        }
    }

    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect: {}", e);
        }
        if let Some(handle) = self.driver.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MqttSubscription {
    fn drop(&mut self) {
        if self.driver.is_some() {
            self.close();
        }
    }
}

fn drive_subscription(
    mut connection: Connection,
    client: Client,
    topic: String,
    tx: Sender<Inbound>,
    stop: Arc<AtomicBool>,
) {
    for event in connection.iter() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                    Ok(()) => log::info!("subscribed to {}", topic),
                    Err(e) => log::error!("subscribe to {} failed: {}", topic, e),
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if publish.retain {
                    log::debug!("ignoring retained message on {}", topic);
                    continue;
                }
                if tx.send(Inbound::Message(publish.payload.to_vec())).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("MQTT connection error on {}: {}", topic, e);
                if tx.send(Inbound::Down(e.to_string())).is_err() {
                    break;
                }
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}

/// Upstream frame events from the camera topic.
///
/// Positions are assigned locally, starting at 1 for each subscription.
pub struct MqttEventSource {
    subscription: MqttSubscription,
    next_position: u64,
}

impl MqttEventSource {
    pub fn subscribe(settings: &MqttSettings, topic: &str) -> Result<Self> {
        Ok(Self {
            subscription: MqttSubscription::open(settings, "ingest", topic)?,
            next_position: 0,
        })
    }
}

impl EventSource for MqttEventSource {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<FrameEvent>, EngineError> {
        let Some(payload) = self.subscription.recv(timeout)? else {
            return Ok(None);
        };
        self.next_position += 1;
        decode_frame_event(&payload, LogPosition(self.next_position)).map(Some)
    }

    fn close(&mut self) {
        log::info!("closing subscription to {}", self.subscription.topic());
        self.subscription.close();
    }
}

/// Publishing half: QoS 1, never retained.
pub struct MqttPublisher {
    client: Client,
    close: Arc<CloseRequest>,
    driver: Mutex<Option<(JoinHandle<()>, Receiver<DriverExit>)>>,
}

impl MqttPublisher {
    pub fn connect(settings: &MqttSettings, role: &str) -> Result<Self> {
        let (client, mut connection) = settings.connect(role, PUBLISH_QUEUE_DEPTH)?;
        let close = Arc::new(CloseRequest::default());
        let (done_tx, done_rx) = mpsc::channel();
        let driver = {
            let close = close.clone();
            thread::Builder::new()
                .name(format!("mqtt-pub-{}", role))
                .spawn(move || {
                    let exit = drive_publisher(connection.iter(), &close);
                    let _ = done_tx.send(exit);
                })
                .map_err(|e| anyhow!("spawn MQTT driver: {}", e))?
        };
        Ok(Self {
            client,
            close,
            driver: Mutex::new(Some((driver, done_rx))),
        })
    }

    /// Hand a message to the client's outgoing queue without blocking.
    pub fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("publish to {}: {}", topic, e))
    }

    /// Write out everything already queued, then disconnect.
    ///
    /// Gives up after `CLOSE_GRACE` if the broker is unreachable.
    pub fn close(&self) {
        self.close.request(CLOSE_GRACE);
        if let Err(e) = self.client.try_disconnect() {
            log::warn!("MQTT disconnect not queued: {}", e);
        }
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((handle, done)) = driver else {
            return;
        };
        match done.recv_timeout(CLOSE_GRACE + RECONNECT_DELAY) {
            Ok(exit) => {
                log::info!("MQTT publisher closed ({:?})", exit);
                let _ = handle.join();
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("MQTT publisher still draining after {:?}; abandoning", CLOSE_GRACE);
            }
        }
    }
}

/// How a publisher driver ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DriverExit {
    /// The Disconnect went out after every request queued ahead of it.
    Disconnected,
    /// Close was requested and the connection failed or the deadline passed.
    Abandoned,
    /// The event stream ended on its own.
    Ended,
}

#[derive(Debug, Default)]
struct CloseRequest {
    deadline: Mutex<Option<Instant>>,
}

impl CloseRequest {
    fn request(&self, grace: Duration) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + grace);
    }

    fn requested(&self) -> bool {
        self.deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn expired(&self, now: Instant) -> bool {
        matches!(
            *self.deadline.lock().unwrap_or_else(PoisonError::into_inner),
            Some(deadline) if now >= deadline
        )
    }
}

/// Pump a publisher connection. Requests are written in queue order, so
/// seeing our own Disconnect means every earlier publish was written too.
fn drive_publisher<I>(events: I, close: &CloseRequest) -> DriverExit
where
    I: IntoIterator<Item = Result<Event, ConnectionError>>,
{
    for event in events {
        if close.expired(Instant::now()) {
            return DriverExit::Abandoned;
        }
        match event {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return DriverExit::Disconnected,
            Ok(_) => {}
            Err(e) => {
                if close.requested() {
                    log::warn!("MQTT publisher lost the connection while closing: {}", e);
                    return DriverExit::Abandoned;
                }
                log::warn!("MQTT publisher connection error: {}", e);
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    DriverExit::Ended
}

/// Sends finished batches to `<prefix>/<model>`.
pub struct MqttBatchPublisher {
    publisher: MqttPublisher,
    prefix: String,
}

impl MqttBatchPublisher {
    pub fn connect(settings: &MqttSettings, prefix: &str) -> Result<Self> {
        Ok(Self {
            publisher: MqttPublisher::connect(settings, "batches")?,
            prefix: prefix.to_string(),
        })
    }

    pub fn close(&self) {
        self.publisher.close();
    }
}

impl BatchPublisher for MqttBatchPublisher {
    fn publish(&self, batch: &Batch) -> Result<(), EngineError> {
        let message = BatchMessage::from_batch(batch);
        let payload = message.encode()?;
        let topic = model_queue_topic(&self.prefix, &batch.model);
        self.publisher
            .send(&topic, payload)
            .map_err(|e| EngineError::publish(&batch.model, e))?;
        log::debug!("batch {} queued on {}", message.batch_id, topic);
        Ok(())
    }
}
