use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::messages::{Advertisement, OfflineStatus, StatusReport};

/// How long `disconnect` lets the delivery loop flush before cancelling it.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("not connected to MQTT broker")]
    NotConnected,
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("publish rejected: {0}")]
    Rejected(#[from] rumqttc::ClientError),
}

type Handler = Box<dyn Fn() + Send + Sync>;

/// Connection state and delivery counters. Written only by the delivery loop
/// and the publish calls; every field is read independently, so a snapshot
/// across fields may be momentarily inconsistent.
#[derive(Default)]
struct ConnectionState {
    connected: AtomicBool,
    /// Unix millis of the last successful ConnAck, 0 if never connected.
    connected_since_ms: AtomicI64,
    connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    status_published: AtomicU64,
    on_connect: RwLock<Vec<Handler>>,
    on_disconnect: RwLock<Vec<Handler>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherStats {
    pub connected: bool,
    pub connected_since: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    /// Status and offline messages handed to the client for delivery.
    pub status_published: u64,
    pub reconnections: u64,
}

#[derive(Clone)]
pub struct Publisher {
    client: AsyncClient,
    broker: String,
    scanner_id: String,
    event_topic: String,
    status_topic: String,
    qos: QoS,
    reconnect_delay: Duration,
    state: Arc<ConnectionState>,
    task: Arc<Mutex<Option<(CancellationToken, JoinHandle<()>)>>>,
}

impl Publisher {
    pub fn new(config: &config::MqttConfig, scanner_id: &str) -> (Self, EventLoop) {
        let segment = topic_segment(scanner_id);
        let prefix = config.topic_prefix();
        let status_topic = format!("{prefix}/scanner/{segment}/status");

        let mut mqttoptions = MqttOptions::new(
            config.client_id(scanner_id),
            config.host.clone(),
            config.port(),
        );
        mqttoptions.set_keep_alive(config.keep_alive());

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let will = serde_json::to_vec(&OfflineStatus::new(scanner_id)).unwrap_or_default();
        mqttoptions.set_last_will(LastWill::new(&status_topic, will, config.qos(), true));

        let (client, eventloop) = AsyncClient::new(mqttoptions, config.channel_capacity());

        (
            Publisher {
                client,
                broker: format!("{}:{}", config.host, config.port()),
                scanner_id: scanner_id.to_string(),
                event_topic: format!("{prefix}/raw/{segment}"),
                status_topic,
                qos: config.qos(),
                reconnect_delay: config.reconnect_delay(),
                state: Arc::new(ConnectionState::default()),
                task: Arc::new(Mutex::new(None)),
            },
            eventloop,
        )
    }

    /// Called from the delivery loop after every successful (re)connect.
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state
            .on_connect
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    /// Called from the delivery loop whenever an established connection is lost.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state
            .on_disconnect
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    /// Start the background delivery loop. Reconnects are driven by the loop
    /// itself, waiting the configured delay after each connection error.
    pub fn connect(&self, mut eventloop: EventLoop) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            warn!("MQTT delivery loop already running");
            return;
        }
        info!("Connecting to MQTT broker {}", self.broker);

        let cancel = CancellationToken::new();
        let publisher = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            publisher.event_loop(&mut eventloop, token).await;
        });
        *task = Some((cancel, handle));
    }

    /// Close the session and stop the delivery loop. Idempotent.
    pub async fn disconnect(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((cancel, mut handle)) = task {
            info!("Disconnecting from MQTT broker");
            if let Err(err) = self.client.try_disconnect() {
                debug!("Error queueing MQTT disconnect: {:?}", err);
            }
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle)
                .await
                .is_err()
            {
                cancel.cancel();
                if let Err(err) = handle.await {
                    warn!("MQTT delivery loop ended abnormally: {}", err);
                }
            }
        }
        self.mark_disconnected("client disconnected");
    }

    /// Fire-and-forget publish of one advertisement. Never waits on the
    /// broker; while disconnected the event is counted as failed and dropped.
    pub fn publish_event(&self, advertisement: &Advertisement) -> bool {
        match self.send(&self.event_topic, advertisement, false) {
            Ok(()) => {
                debug!("Published advertisement to {}", self.event_topic);
                true
            }
            Err(err) => {
                self.state.messages_failed.fetch_add(1, Ordering::Relaxed);
                match err {
                    PublishError::NotConnected => {
                        debug!("Cannot publish: not connected to MQTT broker")
                    }
                    other => error!("Failed to publish advertisement: {}", other),
                }
                false
            }
        }
    }

    /// Publish a retained status report. Failures are not counted as lost events.
    pub fn publish_status(&self, report: &StatusReport) -> bool {
        self.send_status(report)
    }

    /// Publish the retained offline marker, normally right before `disconnect`.
    pub fn publish_offline(&self) -> bool {
        self.send_status(&OfflineStatus::new(&self.scanner_id))
    }

    fn send_status<T: Serialize>(&self, payload: &T) -> bool {
        match self.send(&self.status_topic, payload, true) {
            Ok(()) => {
                self.state.status_published.fetch_add(1, Ordering::Relaxed);
                debug!("Published status to {}", self.status_topic);
                true
            }
            Err(PublishError::NotConnected) => {
                warn!("Cannot publish status: not connected to MQTT broker");
                false
            }
            Err(err) => {
                error!("Failed to publish status: {}", err);
                false
            }
        }
    }

    fn send<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        retain: bool,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let payload = serde_json::to_vec(payload)?;
        self.client.try_publish(topic, self.qos, retain, payload)?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> PublisherStats {
        let connected = self.is_connected();
        let since_ms = self.state.connected_since_ms.load(Ordering::Relaxed);
        let connected_since = (since_ms > 0)
            .then(|| DateTime::<Utc>::from_timestamp_millis(since_ms))
            .flatten();
        let uptime_seconds = match (connected, connected_since) {
            (true, Some(since)) => u64::try_from((Utc::now() - since).num_seconds()).unwrap_or(0),
            _ => 0,
        };

        PublisherStats {
            connected,
            connected_since,
            uptime_seconds,
            messages_sent: self.state.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.state.messages_failed.load(Ordering::Relaxed),
            status_published: self.state.status_published.load(Ordering::Relaxed),
            reconnections: self
                .state
                .connections
                .load(Ordering::Relaxed)
                .saturating_sub(1),
        }
    }

    pub fn event_topic(&self) -> &str {
        &self.event_topic
    }

    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }

    async fn event_loop(&self, eventloop: &mut EventLoop, cancel: CancellationToken) {
        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    if !self.handle_event(&event) {
                        break;
                    }
                }
                Err(err) => {
                    self.handle_connection_error(&err);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
        debug!("MQTT delivery loop stopped");
    }

    /// Apply one transport event. Returns `false` once the session is closed.
    pub(crate) fn handle_event(&self, event: &Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.mark_connected();
                } else {
                    error!("Failed to connect to MQTT broker: {:?}", ack.code);
                    self.mark_disconnected("connection refused");
                }
            }
            Event::Incoming(Packet::PubAck(_)) | Event::Incoming(Packet::PubComp(_)) => {
                self.state.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Event::Outgoing(Outgoing::Publish(_)) if self.qos == QoS::AtMostOnce => {
                self.state.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Event::Incoming(Packet::Disconnect) => {
                self.mark_disconnected("disconnected by broker");
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("Disconnected from MQTT broker (clean)");
                self.mark_disconnected("client disconnected");
                return false;
            }
            _ => {}
        }
        true
    }

    fn handle_connection_error(&self, err: &ConnectionError) {
        if self.is_connected() {
            self.mark_disconnected(&err.to_string());
        } else {
            error!("Error polling MQTT event loop: {}", err);
        }
    }

    fn mark_connected(&self) {
        let previous = self.state.connections.fetch_add(1, Ordering::Relaxed);
        self.state
            .connected_since_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.state.connected.store(true, Ordering::Release);
        if previous == 0 {
            info!("Connected to MQTT broker {}", self.broker);
        } else {
            info!("Reconnected to MQTT broker {}", self.broker);
        }

        for handler in self
            .state
            .on_connect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            handler();
        }
    }

    fn mark_disconnected(&self, reason: &str) {
        if !self.state.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!("Disconnected from MQTT broker: {}", reason);

        for handler in self
            .state
            .on_disconnect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            handler();
        }
    }
}

/// Make an identifier safe to use as a single topic level.
fn topic_segment(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
