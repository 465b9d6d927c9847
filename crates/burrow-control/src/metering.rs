//! Traffic meter: per-forward byte counters with periodic persistence

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use burrow_catalog::{Catalog, ForwardId};

/// Counters for one forward. "In" is user -> agent-side service.
#[derive(Debug, Default)]
pub struct FlowCounters {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl FlowCounters {
    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }
}

/// In-memory accumulation of byte counts keyed by forward id.
pub struct TrafficMeter {
    counters: DashMap<ForwardId, Arc<FlowCounters>>,
}

impl TrafficMeter {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Shared counters for a forward, created on first use. Pipe tasks hold
    /// the `Arc` and update it without touching the map again.
    pub fn counters(&self, forward_id: ForwardId) -> Arc<FlowCounters> {
        self.counters
            .entry(forward_id)
            .or_insert_with(|| Arc::new(FlowCounters::default()))
            .clone()
    }

    pub fn add(&self, forward_id: ForwardId, bytes_in: u64, bytes_out: u64) {
        let counters = self.counters(forward_id);
        counters.add_in(bytes_in);
        counters.add_out(bytes_out);
    }

    /// Snapshot and zero all counters, returning nonzero deltas.
    pub fn snapshot_and_clear(&self) -> Vec<(ForwardId, u64, u64)> {
        let mut deltas = Vec::new();
        for entry in self.counters.iter() {
            let bytes_in = entry.value().bytes_in.swap(0, Ordering::Relaxed);
            let bytes_out = entry.value().bytes_out.swap(0, Ordering::Relaxed);
            if bytes_in > 0 || bytes_out > 0 {
                deltas.push((*entry.key(), bytes_in, bytes_out));
            }
        }
        deltas
    }

    /// Persist one record per forward with nonzero deltas.
    ///
    /// On a catalog error the delta is credited back so the next flush
    /// retries it.
    pub async fn flush(&self, catalog: &Arc<dyn Catalog>) -> usize {
        let deltas = self.snapshot_and_clear();
        let mut flushed = 0;
        for (forward_id, bytes_in, bytes_out) in deltas {
            let recorded_at = chrono::Utc::now();
            match catalog
                .append_traffic(forward_id, bytes_in, bytes_out, recorded_at)
                .await
            {
                Ok(()) => flushed += 1,
                Err(e) => {
                    tracing::warn!(forward_id, error = %e, "traffic flush failed, re-crediting");
                    self.add(forward_id, bytes_in, bytes_out);
                }
            }
        }
        flushed
    }
}

impl Default for TrafficMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic flusher. Aborted on shutdown after a final bounded
/// flush by the server.
pub fn spawn_flusher(
    meter: Arc<TrafficMeter>,
    catalog: Arc<dyn Catalog>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let flushed = meter.flush(&catalog).await;
            if flushed > 0 {
                tracing::debug!(records = flushed, "traffic counters flushed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_catalog::MemoryCatalog;

    #[tokio::test]
    async fn test_add_and_snapshot_clears() {
        let meter = TrafficMeter::new();
        meter.add(1, 100, 50);
        meter.add(1, 10, 0);
        meter.add(2, 0, 0);

        let mut deltas = meter.snapshot_and_clear();
        deltas.sort();
        assert_eq!(deltas, vec![(1, 110, 50)]);

        // Second snapshot is empty.
        assert!(meter.snapshot_and_clear().is_empty());
    }

    #[tokio::test]
    async fn test_shared_counters_feed_the_same_entry() {
        let meter = TrafficMeter::new();
        let counters = meter.counters(7);
        counters.add_in(5);
        counters.add_out(9);
        meter.add(7, 1, 1);

        assert_eq!(meter.snapshot_and_clear(), vec![(7, 6, 10)]);
    }

    #[tokio::test]
    async fn test_flush_appends_nonzero_records() {
        let meter = TrafficMeter::new();
        let catalog = Arc::new(MemoryCatalog::new());
        meter.add(1, 1024, 2048);
        meter.add(2, 0, 0);

        let catalog_dyn: Arc<dyn Catalog> = catalog.clone();
        assert_eq!(meter.flush(&catalog_dyn).await, 1);

        let entries = catalog.traffic();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].forward_id, 1);
        assert_eq!((entries[0].bytes_in, entries[0].bytes_out), (1024, 2048));

        // Nothing left after a successful flush.
        assert_eq!(meter.flush(&catalog_dyn).await, 0);
    }
}
