//! Suppression of duplicate GM reports

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Last delivered report for one IP
#[derive(Debug, Clone, Copy)]
pub struct CachedHostInfo {
    pub reported_at: Instant,
    pub expire_interval: Duration,
}

impl CachedHostInfo {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.reported_at) < self.expire_interval
    }
}

/// Per-IP cool-down after a successful GM delivery.
///
/// Cleared wholesale whenever the instance set is refreshed.
#[derive(Debug, Default)]
pub struct ReportCache {
    hosts: Mutex<HashMap<String, CachedHostInfo>>,
}

impl ReportCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ip: &str, expire_interval: Duration) {
        self.record_at(ip, Instant::now(), expire_interval);
    }

    pub fn record_at(&self, ip: &str, now: Instant, expire_interval: Duration) {
        self.hosts.lock().insert(
            ip.to_string(),
            CachedHostInfo {
                reported_at: now,
                expire_interval,
            },
        );
    }

    pub fn is_suppressed(&self, ip: &str) -> bool {
        self.is_suppressed_at(ip, Instant::now())
    }

    /// True while an earlier report for `ip` is inside its window.
    /// Expired entries are dropped on lookup.
    pub fn is_suppressed_at(&self, ip: &str, now: Instant) -> bool {
        let mut hosts = self.hosts.lock();
        match hosts.get(ip) {
            Some(info) if info.is_live(now) => true,
            Some(_) => {
                hosts.remove(ip);
                false
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.hosts.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.lock().is_empty()
    }
}
