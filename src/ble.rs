use btleplug::api::{
    AddressType, Central as _, CentralEvent, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::FutureExt as _;
use futures::StreamExt as _;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::messages::AddressKind;
use crate::normalize::RawDetection;
use crate::scanner::{CaptureError, DetectionSink, Receiver};

impl From<btleplug::Error> for CaptureError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            err @ btleplug::Error::PermissionDenied => {
                CaptureError::PermissionDenied(err.to_string())
            }
            other => CaptureError::classify(other.to_string()),
        }
    }
}

/// Receiver backed by the platform Bluetooth stack (BlueZ on Linux).
pub struct BtleReceiver {
    adapter_name: String,
    session: Mutex<Option<Session>>,
}

struct Session {
    adapter: Adapter,
    events: JoinHandle<()>,
}

impl BtleReceiver {
    pub fn new(adapter_name: impl Into<String>) -> Self {
        BtleReceiver {
            adapter_name: adapter_name.into(),
            session: Mutex::new(None),
        }
    }

    async fn open(&self, sink: DetectionSink) -> Result<(), CaptureError> {
        let mut session = self.session.lock().await;
        if let Some(stale) = session.take() {
            stale.events.abort();
        }

        let manager = Manager::new().await?;
        let adapter = find_adapter(&manager, &self.adapter_name).await?;

        // Subscribe before scanning so no early discovery is missed.
        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let event_adapter = adapter.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(id) = advertised_peripheral(&event) else {
                    continue;
                };
                match read_detection(&event_adapter, id).await {
                    Ok(Some(detection)) => sink(detection),
                    Ok(None) => {}
                    Err(e) => debug!("Skipping {:?}: {}", id, e),
                }
            }
            debug!("Bluetooth event stream ended");
        });

        *session = Some(Session {
            adapter,
            events: handle,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), CaptureError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.events.abort();
        session.adapter.stop_scan().await?;
        Ok(())
    }

    async fn liveness(&self) -> Result<(), CaptureError> {
        match self.session.lock().await.as_ref() {
            Some(session) if !session.events.is_finished() => Ok(()),
            Some(_) => Err(CaptureError::Other("bluetooth event stream closed".into())),
            None => Err(CaptureError::Other("scanner is not running".into())),
        }
    }
}

impl Receiver for BtleReceiver {
    fn start(&self, sink: DetectionSink) -> BoxFuture<'_, Result<(), CaptureError>> {
        self.open(sink).boxed()
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), CaptureError>> {
        self.close().boxed()
    }

    fn check(&self) -> BoxFuture<'_, Result<(), CaptureError>> {
        self.liveness().boxed()
    }
}

/// Pick the adapter whose info string starts with `name` (e.g. `hci0`), or
/// the first adapter if none matches.
async fn find_adapter(manager: &Manager, name: &str) -> Result<Adapter, CaptureError> {
    let adapters = manager.adapters().await?;
    if adapters.is_empty() {
        return Err(CaptureError::AdapterNotReady(
            "no bluetooth adapters found".into(),
        ));
    }

    for adapter in &adapters {
        let info = adapter.adapter_info().await?;
        if info.starts_with(name) {
            info!("Using bluetooth adapter {}", info);
            return Ok(adapter.clone());
        }
    }

    warn!(
        "Bluetooth adapter {} not found, falling back to the first available adapter",
        name
    );
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| CaptureError::AdapterNotReady("no bluetooth adapters found".into()))
}

/// The peripheral whose advertisement an event reports on. BlueZ signals an
/// RSSI change as `DeviceUpdated` but payload-only changes as the dedicated
/// advertisement events, so all of them trigger a fresh read.
fn advertised_peripheral(event: &CentralEvent) -> Option<&PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

async fn read_detection(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<Option<RawDetection>, btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    Ok(peripheral.properties().await?.and_then(detection_from))
}

/// `None` for devices BlueZ only remembers from an earlier scan: they are
/// replayed as discovered on subscribe but carry no signal strength.
fn detection_from(properties: PeripheralProperties) -> Option<RawDetection> {
    let rssi = properties.rssi?;
    Some(RawDetection {
        address: properties.address.to_string(),
        address_kind: properties.address_type.map(address_kind),
        name: properties.local_name,
        rssi: Some(rssi),
        tx_power: properties.tx_power_level,
        manufacturer_data: properties.manufacturer_data,
        service_data: properties
            .service_data
            .into_iter()
            .map(|(uuid, data)| (uuid.to_string(), data))
            .collect(),
        services: properties.services.iter().map(|uuid| uuid.to_string()).collect(),
        // BlueZ only exposes parsed advertisement fields, not the raw frame.
        raw: None,
    })
}

fn address_kind(address_type: AddressType) -> AddressKind {
    match address_type {
        AddressType::Public => AddressKind::Public,
        AddressType::Random => AddressKind::Random,
    }
}
