// CPU device — host memory with allocation accounting
//
// The device tracks how many bytes are live across every storage it handed
// out. An optional limit turns it into a bounded device: allocations past
// the limit fail with Error::Allocation instead of growing the heap. Tests
// use the limit to exercise partial-failure paths deterministically.
//
// Counters are shared between clones (Arc), so every Volume created from
// any clone of one device is charged against the same budget.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_core::{BackendDevice, Error, Result};

/// Snapshot of the device's memory accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently allocated.
    pub in_use: usize,
    /// High-water mark of `in_use`.
    pub peak: usize,
    /// Cumulative successful allocations.
    pub allocations: usize,
    /// Cumulative releases.
    pub releases: usize,
}

#[derive(Default)]
struct Counters {
    in_use: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicUsize,
    releases: AtomicUsize,
}

/// Host-memory device. Cheap to clone; clones share accounting.
#[derive(Clone)]
pub struct CpuDevice {
    limit: Option<usize>,
    counters: Arc<Counters>,
}

impl CpuDevice {
    /// Unbounded device.
    pub fn new() -> Self {
        CpuDevice {
            limit: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Device that refuses allocations once `limit` bytes are live.
    pub fn with_limit(limit: usize) -> Self {
        CpuDevice {
            limit: Some(limit),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Bytes currently allocated on this device.
    pub fn allocated_bytes(&self) -> usize {
        self.counters.in_use.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            in_use: self.counters.in_use.load(Ordering::Relaxed),
            peak: self.counters.peak.load(Ordering::Relaxed),
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
        }
    }

    /// Reserve `bytes` against the budget.
    pub(crate) fn charge(&self, bytes: usize) -> Result<()> {
        let c = &self.counters;
        let mut current = c.in_use.load(Ordering::Relaxed);
        loop {
            let next = current + bytes;
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(Error::Allocation {
                        requested: bytes,
                        in_use: current,
                        limit,
                    });
                }
            }
            match c
                .in_use
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    c.peak.fetch_max(next, Ordering::Relaxed);
                    c.allocations.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `bytes` to the budget.
    pub(crate) fn credit(&self, bytes: usize) {
        let c = &self.counters;
        let _ = c
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
        c.releases.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuDevice")
            .field("limit", &self.limit)
            .field("in_use", &self.allocated_bytes())
            .finish()
    }
}

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        match self.limit {
            Some(limit) => format!("cpu(limit={limit})"),
            None => "cpu".to_string(),
        }
    }
}
