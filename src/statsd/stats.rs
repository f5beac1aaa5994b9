use std::sync::atomic::{AtomicU64, Ordering};

use super::record::{MeasureKind, MEASURE_KIND_CARDINALITY};

/// Lock-free per-MeasureKind counters of accepted records.
///
/// `snapshot()` reads and resets every counter, so a periodic reporter
/// sees the count since its previous tick.
pub struct IngestStats {
    counts: [AtomicU64; MEASURE_KIND_CARDINALITY],
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given kind by one.
    pub fn record(&self, kind: MeasureKind) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(MeasureKind, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = MeasureKind::from_u8(i as u8) {
                    result.push((kind, v));
                }
            }
        }

        result
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}
