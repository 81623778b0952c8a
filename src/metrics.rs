//! Node metrics and telemetry
//!
//! Atomic counters formatted as a text exposition dump with host, region and
//! node id labels. Telemetry observations from the replication ingester and
//! the authorization engine land here.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::authorization::Direction;

/// Metrics labels attached to every series
#[derive(Debug, Clone)]
struct Labels {
    host: String,
    region: String,
    id: String,
}

impl Labels {
    fn render(&self) -> String {
        format!(
            "host=\"{}\",region=\"{}\",id=\"{}\"",
            self.host, self.region, self.id
        )
    }
}

/// Node-wide metrics handle
pub struct Metrics {
    labels: Labels,
    broadcast_from_database_total: AtomicU64,
    broadcast_latency_committed_ns: AtomicU64,
    broadcast_latency_inserted_ns: AtomicU64,
    read_authorization_checks_total: AtomicU64,
    read_authorization_latency_ns: AtomicU64,
    write_authorization_checks_total: AtomicU64,
    write_authorization_latency_ns: AtomicU64,
    connect_supervisors_started_total: AtomicU64,
    connect_supervisors_stopped_total: AtomicU64,
}

impl Metrics {
    pub fn new(host: &str, region: &str, id: &str) -> Self {
        Self {
            labels: Labels {
                host: host.to_string(),
                region: region.to_string(),
                id: id.to_string(),
            },
            broadcast_from_database_total: AtomicU64::new(0),
            broadcast_latency_committed_ns: AtomicU64::new(0),
            broadcast_latency_inserted_ns: AtomicU64::new(0),
            read_authorization_checks_total: AtomicU64::new(0),
            read_authorization_latency_ns: AtomicU64::new(0),
            write_authorization_checks_total: AtomicU64::new(0),
            write_authorization_latency_ns: AtomicU64::new(0),
            connect_supervisors_started_total: AtomicU64::new(0),
            connect_supervisors_stopped_total: AtomicU64::new(0),
        }
    }

    /// One row fanned out from the replication stream.
    pub fn observe_broadcast_from_database(
        &self,
        latency_committed_at: Duration,
        latency_inserted_at: Option<Duration>,
    ) {
        self.broadcast_from_database_total
            .fetch_add(1, Ordering::Relaxed);
        self.broadcast_latency_committed_ns
            .fetch_add(latency_committed_at.as_nanos() as u64, Ordering::Relaxed);
        if let Some(latency) = latency_inserted_at {
            self.broadcast_latency_inserted_ns
                .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    /// One authorization probe transaction completed.
    pub fn observe_authorization_check(&self, direction: Direction, latency: Duration) {
        let (total, latency_sum) = match direction {
            Direction::Read => (
                &self.read_authorization_checks_total,
                &self.read_authorization_latency_ns,
            ),
            Direction::Write => (
                &self.write_authorization_checks_total,
                &self.write_authorization_latency_ns,
            ),
        };
        total.fetch_add(1, Ordering::Relaxed);
        latency_sum.fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn connect_started(&self) {
        self.connect_supervisors_started_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_stopped(&self) {
        self.connect_supervisors_stopped_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Text-format metrics dump.
    pub fn get_metrics(&self) -> String {
        let labels = self.labels.render();
        format!(
            concat!(
                "tenantcast_broadcast_from_database_total{{{labels}}} {bfd}\n",
                "tenantcast_broadcast_latency_committed_at_ns{{{labels}}} {bfd_committed}\n",
                "tenantcast_broadcast_latency_inserted_at_ns{{{labels}}} {bfd_inserted}\n",
                "tenantcast_read_authorization_checks_total{{{labels}}} {read_total}\n",
                "tenantcast_read_authorization_latency_ns{{{labels}}} {read_latency}\n",
                "tenantcast_write_authorization_checks_total{{{labels}}} {write_total}\n",
                "tenantcast_write_authorization_latency_ns{{{labels}}} {write_latency}\n",
                "tenantcast_connect_supervisors_started_total{{{labels}}} {started}\n",
                "tenantcast_connect_supervisors_stopped_total{{{labels}}} {stopped}\n",
            ),
            labels = labels,
            bfd = self.broadcast_from_database_total.load(Ordering::Relaxed),
            bfd_committed = self.broadcast_latency_committed_ns.load(Ordering::Relaxed),
            bfd_inserted = self.broadcast_latency_inserted_ns.load(Ordering::Relaxed),
            read_total = self.read_authorization_checks_total.load(Ordering::Relaxed),
            read_latency = self.read_authorization_latency_ns.load(Ordering::Relaxed),
            write_total = self.write_authorization_checks_total.load(Ordering::Relaxed),
            write_latency = self.write_authorization_latency_ns.load(Ordering::Relaxed),
            started = self.connect_supervisors_started_total.load(Ordering::Relaxed),
            stopped = self.connect_supervisors_stopped_total.load(Ordering::Relaxed),
        )
    }

    /// The same payload, gzip-compressed.
    pub fn get_compressed_metrics(&self) -> Vec<u8> {
        let text = self.get_metrics();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        // Writing to a Vec cannot fail
        let _ = encoder.write_all(text.as_bytes());
        encoder.finish().unwrap_or_default()
    }
}
