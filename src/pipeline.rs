use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use log::{debug, warn};

use crate::filter::{Decision, Filter};
use crate::mqtt::Publisher;
use crate::normalize::{RawDetection, normalize};

/// Counters for the detection path. Each field is read on its own, so a
/// snapshot taken while detections are flowing may be slightly skewed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub published: u64,
    pub deduplicated: u64,
    pub malformed: u64,
    pub devices_seen: u64,
    pub devices_blocked: u64,
}

/// The detection sink: normalize, record the device, filter, publish.
pub struct Pipeline {
    scanner_id: String,
    filter: Filter,
    publisher: Publisher,
    // Never purged; "devices seen" only grows.
    devices_seen: Mutex<HashSet<String>>,
    devices_blocked: Mutex<HashSet<String>>,
    published: AtomicU64,
    deduplicated: AtomicU64,
    malformed: AtomicU64,
}

impl Pipeline {
    pub fn new(scanner_id: impl Into<String>, filter: Filter, publisher: Publisher) -> Self {
        Pipeline {
            scanner_id: scanner_id.into(),
            filter,
            publisher,
            devices_seen: Mutex::new(HashSet::new()),
            devices_blocked: Mutex::new(HashSet::new()),
            published: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn handle(&self, raw: RawDetection) {
        self.handle_at(raw, Instant::now());
    }

    /// Process one detection. Nothing here fails past this call: a bad
    /// detection is logged and dropped.
    pub fn handle_at(&self, raw: RawDetection, now: Instant) {
        let advertisement = match normalize(raw, &self.scanner_id) {
            Ok(advertisement) => advertisement,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed detection: {}", e);
                return;
            }
        };
        let address = advertisement.address();
        remember(&self.devices_seen, address);

        match self.filter.evaluate_at(address, now) {
            Decision::Blocked => {
                debug!("Ignoring blocklisted device {}", address);
                remember(&self.devices_blocked, address);
            }
            Decision::Duplicate => {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
            }
            Decision::Publish => {
                if self.publisher.publish_event(&advertisement) {
                    self.published.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn statistics(&self) -> PipelineStats {
        PipelineStats {
            published: self.published.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            devices_seen: count(&self.devices_seen),
            devices_blocked: count(&self.devices_blocked),
        }
    }
}

fn remember(set: &Mutex<HashSet<String>>, address: &str) {
    let mut set = set.lock().unwrap_or_else(PoisonError::into_inner);
    if !set.contains(address) {
        set.insert(address.to_string());
    }
}

fn count(set: &Mutex<HashSet<String>>) -> u64 {
    set.lock().unwrap_or_else(PoisonError::into_inner).len() as u64
}
