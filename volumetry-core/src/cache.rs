//! Bounded result cache with TTL, LRU eviction, and single-flight
//! coalescing of concurrent scans for the same fingerprint.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use volumetry_model::{SizeReport, VolumeError};

/// Cache key: a stable hash over everything that determines a scan's
/// outcome identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn compute(volume_name: &str, mountpoint: &str, methods: &[String]) -> Self {
        let mut hasher = DefaultHasher::new();
        volume_name.hash(&mut hasher);
        mountpoint.hash(&mut hasher);
        for method in methods {
            method.hash(&mut hasher);
        }
        Fingerprint(hasher.finish())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug)]
struct Entry {
    volume_name: String,
    report: SizeReport,
    expires_at: Instant,
    hit_count: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<Fingerprint, Entry>,
    /// Usage order, least-recent first.
    order: VecDeque<Fingerprint>,
}

impl CacheInner {
    fn touch(&mut self, fingerprint: Fingerprint) {
        if let Some(pos) = self.order.iter().position(|fp| *fp == fingerprint) {
            self.order.remove(pos);
        }
        self.order.push_back(fingerprint);
    }

    fn remove(&mut self, fingerprint: Fingerprint) {
        self.map.remove(&fingerprint);
        if let Some(pos) = self.order.iter().position(|fp| *fp == fingerprint) {
            self.order.remove(pos);
        }
    }
}

type FlightResult = Result<SizeReport, VolumeError>;
type FlightTable = Arc<Mutex<HashMap<Fingerprint, broadcast::Sender<FlightResult>>>>;

/// Outcome of [`ScanCache::begin_flight`].
pub enum Flight {
    /// This caller runs the scan and must resolve the guard exactly once.
    Leader(FlightGuard),
    /// Another scan for this fingerprint is in flight; await its outcome.
    Follower(broadcast::Receiver<FlightResult>),
}

impl std::fmt::Debug for Flight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flight::Leader(_) => f.write_str("Flight::Leader"),
            Flight::Follower(_) => f.write_str("Flight::Follower"),
        }
    }
}

/// Owned by the flight leader. Dropping the guard without completing it
/// resolves all waiters with `scan_canceled`, so a panicking or aborted
/// leader can never strand its followers.
pub struct FlightGuard {
    fingerprint: Fingerprint,
    volume_name: String,
    tx: broadcast::Sender<FlightResult>,
    flights: FlightTable,
    completed: bool,
}

impl std::fmt::Debug for FlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightGuard")
            .field("fingerprint", &self.fingerprint)
            .field("volume_name", &self.volume_name)
            .finish()
    }
}

impl FlightGuard {
    /// Resolve the flight for every waiter.
    pub fn complete(mut self, result: FlightResult) {
        self.resolve(result);
        self.completed = true;
    }

    fn resolve(&self, result: FlightResult) {
        if let Ok(mut flights) = self.flights.lock() {
            flights.remove(&self.fingerprint);
        }
        let _ = self.tx.send(result);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.resolve(Err(VolumeError::ScanCanceled(self.volume_name.clone())));
        }
    }
}

/// Fingerprint → last result, bounded by TTL and capacity.
pub struct ScanCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
    flights: FlightTable,
}

impl std::fmt::Debug for ScanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl ScanCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fresh hit: bumps the entry's hit count and returns the report with
    /// `cached` set. Expired entries are dropped on access.
    pub fn get(&self, fingerprint: Fingerprint) -> Option<SizeReport> {
        let mut inner = self.inner.lock().ok()?;
        let expired = matches!(
            inner.map.get(&fingerprint),
            Some(entry) if entry.expires_at <= Instant::now()
        );
        if expired {
            inner.remove(fingerprint);
            return None;
        }
        let report = {
            let entry = inner.map.get_mut(&fingerprint)?;
            entry.hit_count += 1;
            let mut report = entry.report.clone();
            report.cached = true;
            report
        };
        inner.touch(fingerprint);
        Some(report)
    }

    pub fn insert(&self, fingerprint: Fingerprint, report: SizeReport) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        while inner.map.len() >= self.capacity && !inner.map.contains_key(&fingerprint) {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
        inner.map.insert(
            fingerprint,
            Entry {
                volume_name: report.volume_name.clone(),
                report,
                expires_at: Instant::now() + self.ttl,
                hit_count: 0,
            },
        );
        inner.touch(fingerprint);
    }

    /// Join or start the single flight for `fingerprint`.
    pub fn begin_flight(&self, fingerprint: Fingerprint, volume_name: &str) -> Flight {
        let Ok(mut flights) = self.flights.lock() else {
            // poisoned table: degrade to leader-per-caller rather than stall
            let (tx, _) = broadcast::channel(4);
            return Flight::Leader(FlightGuard {
                fingerprint,
                volume_name: volume_name.to_string(),
                tx,
                flights: Arc::clone(&self.flights),
                completed: false,
            });
        };
        if let Some(tx) = flights.get(&fingerprint) {
            return Flight::Follower(tx.subscribe());
        }
        let (tx, _) = broadcast::channel(4);
        flights.insert(fingerprint, tx.clone());
        Flight::Leader(FlightGuard {
            fingerprint,
            volume_name: volume_name.to_string(),
            tx,
            flights: Arc::clone(&self.flights),
            completed: false,
        })
    }

    /// Drop every cached result for the named volume.
    pub fn invalidate_volume(&self, volume_name: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let stale: Vec<Fingerprint> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.volume_name == volume_name)
            .map(|(fp, _)| *fp)
            .collect();
        for fingerprint in stale {
            inner.remove(fingerprint);
        }
    }

    pub fn flush(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.map.clear();
            inner.order.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_count(&self, fingerprint: Fingerprint) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.map.get(&fingerprint).map(|e| e.hit_count))
            .unwrap_or(0)
    }
}
