use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, encapsulated instead of living as file-scope
/// globals (design note: "Global singletons for config, statistics, and
/// logger").
#[derive(Default, Debug)]
pub struct Metrics {
    pub containers_created: AtomicU64,
    pub containers_destroyed: AtomicU64,
    pub containers_running: AtomicU64,
    pub containers_failed: AtomicU64,
    pub volumes_constructed: AtomicU64,
    pub volumes_deconstructed: AtomicU64,
    pub layers_imported: AtomicU64,
    pub events_processed: AtomicU64,
    pub respawns: AtomicU64,
    pub reconcile_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
