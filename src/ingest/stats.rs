use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free ingestion counters.
///
/// Counters only grow; `snapshot()` reads them all without contention so
/// the log thread and tests can observe progress while ingestion runs.
#[derive(Debug, Default)]
pub struct IngestStats {
    packets: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    stale_samples: AtomicU64,
    written_samples: AtomicU64,
    writes: AtomicU64,
    forced_advances: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    /// Packets received, including rejected and malformed ones.
    pub packets: u64,
    /// Packets rejected for an implausible timestamp.
    pub rejected: u64,
    /// Packets that failed to decode.
    pub malformed: u64,
    /// Samples dropped because they were behind the write position.
    pub stale_samples: u64,
    /// Samples copied into the ring buffers.
    pub written_samples: u64,
    /// Contiguous runs written.
    pub writes: u64,
    /// Empty advances forced while no data arrived.
    pub forced_advances: u64,
}

impl IngestSnapshot {
    /// Packets discarded before reassembly.
    pub fn dropped_packets(&self) -> u64 {
        self.rejected + self.malformed
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packets(&self, n: u64) {
        self.packets.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self, samples: u64) {
        self.stale_samples.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_write(&self, samples: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.written_samples.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_forced_advance(&self) {
        self.forced_advances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            stale_samples: self.stale_samples.load(Ordering::Relaxed),
            written_samples: self.written_samples.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            forced_advances: self.forced_advances.load(Ordering::Relaxed),
        }
    }
}
