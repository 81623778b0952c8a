//! Per-tenant sliding rate counters
//!
//! Four counters per tenant (requests, channels, joins, events) feed
//! admission control and observability. Writers are concurrent; `get`
//! returns a snapshot with a rolling per-second average.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

/// Averaging window in seconds
const WINDOW_SECS: u64 = 60;

/// The four counter kinds tracked per tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// Inbound requests per second
    RequestsPerSecond,
    /// Channels per client
    ChannelsPerClient,
    /// Channel joins per second
    JoinsPerSecond,
    /// Published events per second
    EventsPerSecond,
}

/// Snapshot returned by `get`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSnapshot {
    /// Rolling per-second average over the window
    pub avg: f64,
    /// Sum of all increments inside the window
    pub sum: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

/// One sliding counter: second-granularity buckets, drop-oldest
struct SlidingCounter {
    buckets: Mutex<VecDeque<(u64, u64)>>,
}

impl SlidingCounter {
    fn new() -> Self {
        Self {
            buckets: Mutex::new(VecDeque::with_capacity(WINDOW_SECS as usize)),
        }
    }

    fn add(&self, now_sec: u64, n: u64) {
        let mut buckets = self.buckets.lock().unwrap();
        match buckets.back_mut() {
            Some((sec, count)) if *sec == now_sec => *count += n,
            _ => buckets.push_back((now_sec, n)),
        }
        while let Some((sec, _)) = buckets.front() {
            if now_sec.saturating_sub(*sec) >= WINDOW_SECS {
                buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn snapshot(&self, now_sec: u64) -> CounterSnapshot {
        let buckets = self.buckets.lock().unwrap();
        let sum: u64 = buckets
            .iter()
            .filter(|(sec, _)| now_sec.saturating_sub(*sec) < WINDOW_SECS)
            .map(|(_, count)| count)
            .sum();

        CounterSnapshot {
            avg: sum as f64 / WINDOW_SECS as f64,
            sum,
            window_secs: WINDOW_SECS,
        }
    }
}

/// All rate counters on this node, keyed by `(tenant, kind)`.
///
/// Counters are created on first use and removed when the tenant's
/// Connect supervisor terminates.
#[derive(Default)]
pub struct RateCounters {
    counters: DashMap<(String, CounterKind), SlidingCounter>,
}

impl RateCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to a tenant counter, creating it on first use
    pub fn add(&self, tenant: &str, kind: CounterKind, n: u64) {
        self.add_at(tenant, kind, n, now_sec());
    }

    /// Snapshot a tenant counter
    pub fn get(&self, tenant: &str, kind: CounterKind) -> CounterSnapshot {
        self.get_at(tenant, kind, now_sec())
    }

    /// Remove every counter belonging to a tenant
    pub fn cleanup(&self, tenant: &str) {
        self.counters.retain(|(t, _), _| t != tenant);
    }

    fn add_at(&self, tenant: &str, kind: CounterKind, n: u64, now_sec: u64) {
        self.counters
            .entry((tenant.to_string(), kind))
            .or_insert_with(SlidingCounter::new)
            .add(now_sec, n);
    }

    fn get_at(&self, tenant: &str, kind: CounterKind, now_sec: u64) -> CounterSnapshot {
        match self.counters.get(&(tenant.to_string(), kind)) {
            Some(counter) => counter.snapshot(now_sec),
            None => CounterSnapshot {
                avg: 0.0,
                sum: 0,
                window_secs: WINDOW_SECS,
            },
        }
    }
}

fn now_sec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let counters = RateCounters::new();
        counters.add_at("t1", CounterKind::EventsPerSecond, 60, 100);

        let snap = counters.get_at("t1", CounterKind::EventsPerSecond, 100);
        assert_eq!(snap.sum, 60);
        assert!(snap.avg > 0.0);
        assert_eq!(snap.avg, 1.0);
    }

    #[test]
    fn test_unknown_counter_is_zero() {
        let counters = RateCounters::new();
        let snap = counters.get("t1", CounterKind::JoinsPerSecond);
        assert_eq!(snap.sum, 0);
        assert_eq!(snap.avg, 0.0);
    }

    #[test]
    fn test_window_drops_old_buckets() {
        let counters = RateCounters::new();
        counters.add_at("t1", CounterKind::RequestsPerSecond, 10, 100);
        counters.add_at("t1", CounterKind::RequestsPerSecond, 5, 100 + WINDOW_SECS);

        let snap = counters.get_at("t1", CounterKind::RequestsPerSecond, 100 + WINDOW_SECS);
        assert_eq!(snap.sum, 5);
    }

    #[test]
    fn test_kinds_are_independent() {
        let counters = RateCounters::new();
        counters.add_at("t1", CounterKind::EventsPerSecond, 3, 100);
        counters.add_at("t1", CounterKind::JoinsPerSecond, 7, 100);

        assert_eq!(counters.get_at("t1", CounterKind::EventsPerSecond, 100).sum, 3);
        assert_eq!(counters.get_at("t1", CounterKind::JoinsPerSecond, 100).sum, 7);
    }

    #[test]
    fn test_cleanup_removes_tenant() {
        let counters = RateCounters::new();
        counters.add_at("t1", CounterKind::EventsPerSecond, 3, 100);
        counters.add_at("t2", CounterKind::EventsPerSecond, 4, 100);

        counters.cleanup("t1");
        assert_eq!(counters.get_at("t1", CounterKind::EventsPerSecond, 100).sum, 0);
        assert_eq!(counters.get_at("t2", CounterKind::EventsPerSecond, 100).sum, 4);
    }
}
