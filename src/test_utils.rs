use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use rumqttc::{ConnAck, ConnectReturnCode, Event, EventLoop, Packet};
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::mqtt::Publisher;
use crate::normalize::RawDetection;
use crate::scanner::{CaptureError, DetectionSink, Receiver};

/// A detection with only an address and a signal strength.
pub fn detection(address: &str) -> RawDetection {
    RawDetection {
        address: address.to_string(),
        rssi: Some(-60),
        ..Default::default()
    }
}

/// Config pointing at a local port nothing listens on.
pub fn test_config(extra: &str) -> AppConfig {
    let config = format!(
        r#"
        [scanner]
        id = "test-scanner"

        [mqtt]
        host = "127.0.0.1"
        port = 9
        reconnect_delay_seconds = 1

        {extra}
        "#
    );
    AppConfig::from_toml(&config).unwrap()
}

/// Feed the publisher a successful ConnAck, as the delivery loop would.
pub fn accept_connection(publisher: &Publisher) {
    publisher.handle_event(&Event::Incoming(Packet::ConnAck(ConnAck {
        session_present: false,
        code: ConnectReturnCode::Success,
    })));
}

/// Publisher that believes the broker accepted its connection. Keep the
/// event loop alive for as long as the publisher is used.
pub fn connected_publisher(config: &AppConfig) -> (Publisher, EventLoop) {
    let (publisher, eventloop) = Publisher::new(&config.mqtt, &config.scanner.id);
    accept_connection(&publisher);
    (publisher, eventloop)
}

/// Scripted receiver: the first `failures` starts fail with `message`.
pub struct FakeReceiver {
    failures: AtomicU32,
    message: String,
    starts: Mutex<Vec<Instant>>,
    stops: AtomicUsize,
    check_failure: Mutex<Option<String>>,
    sink: Mutex<Option<DetectionSink>>,
    stop_hangs: AtomicBool,
    stop_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl FakeReceiver {
    pub fn failing(failures: u32, message: &str) -> Self {
        FakeReceiver {
            failures: AtomicU32::new(failures),
            message: message.to_string(),
            starts: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            check_failure: Mutex::new(None),
            sink: Mutex::new(None),
            stop_hangs: AtomicBool::new(false),
            stop_hook: Mutex::new(None),
        }
    }

    /// Make `stop` never complete, like a backend stuck on D-Bus.
    pub fn hang_on_stop(&self) {
        self.stop_hangs.store(true, Ordering::SeqCst);
    }

    /// Run `hook` whenever `stop` is called.
    pub fn on_stop<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.stop_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fail_next_check(&self, message: &str) {
        *self.check_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Deliver a detection through the sink registered by the last successful start.
    pub fn emit(&self, detection: RawDetection) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(detection);
        }
    }
}

impl Receiver for FakeReceiver {
    fn start(&self, sink: DetectionSink) -> BoxFuture<'_, Result<(), CaptureError>> {
        self.starts.lock().unwrap().push(Instant::now());
        let result = match self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(CaptureError::classify(self.message.clone())),
            Err(_) => {
                *self.sink.lock().unwrap() = Some(sink);
                Ok(())
            }
        };
        async move { result }.boxed()
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), CaptureError>> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = None;
        if let Some(hook) = self.stop_hook.lock().unwrap().as_ref() {
            hook();
        }
        if self.stop_hangs.load(Ordering::SeqCst) {
            return futures::future::pending().boxed();
        }
        async { Ok(()) }.boxed()
    }

    fn check(&self) -> BoxFuture<'_, Result<(), CaptureError>> {
        let failure = self.check_failure.lock().unwrap().take();
        async move {
            match failure {
                Some(message) => Err(CaptureError::classify(message)),
                None => Ok(()),
            }
        }
        .boxed()
    }
}
