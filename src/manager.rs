use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use log::{debug, info, warn};
use rumqttc::EventLoop;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::filter::{Blocklist, Filter};
use crate::messages::{
    BluetoothStatus, ConfigEcho, MqttStatus, SCHEMA_VERSION, ScannerStatus, StatusMetrics,
    StatusReport,
};
use crate::mqtt::Publisher;
use crate::pipeline::Pipeline;
use crate::scanner::{CaptureSource, Receiver};

/// Wires capture, pipeline and publisher together and owns their lifecycle.
pub struct Manager {
    shared: Arc<Shared>,
    mqtt_event_loop: EventLoop,
}

struct Shared {
    config: Arc<AppConfig>,
    capture: CaptureSource,
    pipeline: Arc<Pipeline>,
    publisher: Publisher,
    started: Instant,
}

impl Manager {
    pub fn new(config: Arc<AppConfig>, receiver: Arc<dyn Receiver>) -> Self {
        let (publisher, mqtt_event_loop) = Publisher::new(&config.mqtt, &config.scanner.id);

        let dedup = &config.deduplication;
        let filter = Filter::new(
            Blocklist::new(config.blocklist.enabled, config.blocked_addresses()),
            dedup
                .enabled
                .then(|| (dedup.interval(), dedup.cleanup_age())),
        );
        let pipeline = Arc::new(Pipeline::new(
            config.scanner.id.clone(),
            filter,
            publisher.clone(),
        ));
        let capture = CaptureSource::new(receiver, config.scanner.adapter.clone());

        Manager {
            shared: Arc::new(Shared {
                config,
                capture,
                pipeline,
                publisher,
                started: Instant::now(),
            }),
            mqtt_event_loop,
        }
    }

    /// Run until `shutdown` resolves or capture gives up, then shut down in
    /// order. Returns the capture error in the latter case.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let shared = self.shared;
        let config = &shared.config;
        info!(
            "Starting scanner {} (adapter {}, broker {}:{})",
            config.scanner.id,
            config.scanner.adapter,
            config.mqtt.host,
            config.mqtt.port()
        );
        if config.deduplication.enabled {
            info!(
                "Deduplication enabled: {}s interval",
                config.deduplication.interval_seconds
            );
        }
        if config.blocklist.enabled {
            info!(
                "Blocklist enabled: {} devices",
                config.blocked_addresses().len()
            );
        }

        let status_requested = shared.watch_connection();
        shared.publisher.connect(self.mqtt_event_loop);

        let pipeline = Arc::clone(&shared.pipeline);
        shared
            .capture
            .on_detection(move |detection| pipeline.handle(detection));
        shared.capture.start();

        let cancel = CancellationToken::new();
        let status_task = tokio::spawn(Arc::clone(&shared).status_loop(
            status_requested,
            cancel.clone(),
        ));

        let outcome = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            error = shared.capture.failed() => Err(error),
        };

        shared.shutdown(cancel, status_task).await;
        outcome.map_err(anyhow::Error::from)
    }

    /// The status report as it would be published right now.
    pub fn status_report(&self) -> StatusReport {
        self.shared.status_report()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.shared.pipeline
    }
}

impl Shared {
    /// Register the publisher notifications. The returned `Notify` fires on
    /// every (re)connect so status goes out without the delivery loop
    /// waiting on it.
    fn watch_connection(&self) -> Arc<Notify> {
        let status_requested = Arc::new(Notify::new());
        {
            let status_requested = Arc::clone(&status_requested);
            self.publisher
                .on_connect(move || status_requested.notify_one());
        }
        self.publisher.on_disconnect(|| {
            warn!("MQTT disconnected, advertisements are dropped until it reconnects")
        });
        status_requested
    }

    async fn status_loop(self: Arc<Self>, requested: Arc<Notify>, cancel: CancellationToken) {
        let heartbeat = &self.config.heartbeat;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = requested.notified() => debug!("Publishing status after connect"),
                _ = tokio::time::sleep(heartbeat.interval()), if heartbeat.enabled => {}
            }
            // Failures are logged by the publisher; the next tick tries again.
            self.publisher.publish_status(&self.status_report());
        }
        debug!("Status loop stopped");
    }

    /// Each step runs even if the one before it failed.
    async fn shutdown(&self, cancel: CancellationToken, status_task: JoinHandle<()>) {
        info!("Shutting down");
        cancel.cancel();
        if let Err(e) = status_task.await {
            warn!("Status task ended abnormally: {}", e);
        }

        self.capture.stop().await;

        self.publisher.publish_offline();
        self.publisher.disconnect().await;

        let stats = self.pipeline.statistics();
        info!(
            "Shutdown complete: {} published, {} deduplicated, {} devices seen",
            stats.published, stats.deduplicated, stats.devices_seen
        );
    }

    fn status_report(&self) -> StatusReport {
        let pipeline = self.pipeline.statistics();
        let mqtt = self.publisher.statistics();

        StatusReport {
            version: SCHEMA_VERSION,
            scanner_id: self.config.scanner.id.clone(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            status: ScannerStatus::Online,
            uptime_seconds: self.started.elapsed().as_secs(),
            metrics: StatusMetrics {
                messages_sent: pipeline.published,
                messages_dropped: mqtt.messages_failed,
                messages_deduplicated: pipeline.deduplicated,
                malformed: pipeline.malformed,
                devices_seen: pipeline.devices_seen,
                devices_blocked: pipeline.devices_blocked,
            },
            bluetooth: BluetoothStatus {
                adapter: self.capture.adapter().to_string(),
                status: self.capture.state().as_str().to_string(),
                errors: self.capture.errors(),
            },
            mqtt: MqttStatus {
                connected: mqtt.connected,
                reconnections: mqtt.reconnections,
            },
            config: ConfigEcho {
                deduplication_enabled: self.config.deduplication.enabled,
                deduplication_interval: self.config.deduplication.interval_seconds,
                blocklist_count: self.config.blocked_addresses().len(),
            },
        }
    }
}
