//! Blocklist and per-device rate limiting for advertisements.
//!
//! The deduplicator is a rate limiter keyed purely on the device address.
//! Changes in signal strength, name or payload do not reset a device's timer.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::debug;

/// How often [`Filter`] sweeps stale entries out of the recency table.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Static set of addresses that are never published.
#[derive(Debug, Default)]
pub struct Blocklist {
    enabled: bool,
    addresses: HashSet<String>,
}

impl Blocklist {
    pub fn new(enabled: bool, addresses: HashSet<String>) -> Self {
        Blocklist { enabled, addresses }
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.enabled && self.addresses.contains(address)
    }
}

/// Tracks when each device was last published.
#[derive(Debug)]
pub struct Deduplicator {
    interval: Duration,
    last_published: HashMap<String, Instant>,
}

impl Deduplicator {
    pub fn new(interval: Duration) -> Self {
        Deduplicator {
            interval,
            last_published: HashMap::new(),
        }
    }

    pub fn should_publish(&mut self, address: &str) -> bool {
        self.should_publish_at(address, Instant::now())
    }

    /// Returns `true` for the first sighting of `address`, or when at least
    /// `interval` has passed since it was last published. Only a `true`
    /// result records `now`.
    pub fn should_publish_at(&mut self, address: &str, now: Instant) -> bool {
        match self.last_published.get(address) {
            Some(last) if now.saturating_duration_since(*last) < self.interval => {
                debug!(
                    "Deduplicating {}: last published {:.1}s ago (interval {}s)",
                    address,
                    now.saturating_duration_since(*last).as_secs_f64(),
                    self.interval.as_secs()
                );
                false
            }
            _ => {
                self.last_published.insert(address.to_string(), now);
                true
            }
        }
    }

    pub fn clear_old_entries(&mut self, max_age: Duration) -> usize {
        self.clear_old_entries_at(max_age, Instant::now())
    }

    /// Drop every entry older than `max_age`. Returns how many were removed.
    pub fn clear_old_entries_at(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.last_published.len();
        self.last_published
            .retain(|_, last| now.saturating_duration_since(*last) <= max_age);
        let removed = before - self.last_published.len();
        if removed > 0 {
            debug!("Cleared {} old deduplication entries", removed);
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.last_published.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Publish,
    Blocked,
    Duplicate,
}

/// Blocklist followed by the optional deduplicator, with amortized sweeping.
#[derive(Debug)]
pub struct Filter {
    blocklist: Blocklist,
    dedup: Option<Mutex<DedupState>>,
}

#[derive(Debug)]
struct DedupState {
    table: Deduplicator,
    cleanup_age: Duration,
    last_sweep: Option<Instant>,
}

impl Filter {
    pub fn new(blocklist: Blocklist, dedup: Option<(Duration, Duration)>) -> Self {
        Filter {
            blocklist,
            dedup: dedup.map(|(interval, cleanup_age)| {
                Mutex::new(DedupState {
                    table: Deduplicator::new(interval),
                    cleanup_age,
                    last_sweep: None,
                })
            }),
        }
    }

    pub fn evaluate(&self, address: &str) -> Decision {
        self.evaluate_at(address, Instant::now())
    }

    pub fn evaluate_at(&self, address: &str, now: Instant) -> Decision {
        if self.blocklist.is_blocked(address) {
            return Decision::Blocked;
        }
        let Some(dedup) = &self.dedup else {
            return Decision::Publish;
        };

        let mut state = dedup.lock().unwrap_or_else(PoisonError::into_inner);
        match state.last_sweep {
            Some(last) if now.saturating_duration_since(last) < SWEEP_PERIOD => {}
            Some(_) => {
                let cleanup_age = state.cleanup_age;
                state.table.clear_old_entries_at(cleanup_age, now);
                state.last_sweep = Some(now);
            }
            None => state.last_sweep = Some(now),
        }

        if state.table.should_publish_at(address, now) {
            Decision::Publish
        } else {
            Decision::Duplicate
        }
    }

    /// Number of addresses currently held in the recency table.
    pub fn tracked(&self) -> usize {
        self.dedup.as_ref().map_or(0, |dedup| {
            dedup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .table
                .len()
        })
    }
}
