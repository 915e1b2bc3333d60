//! Page store with fault injection for deterministic testing.
//!
//! Wraps a [`MemoryStore`] and fails reads, allocations and frees at
//! configurable rates. Faults are drawn from a seeded RNG, so the same seed and
//! the same call sequence produce the same faults.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::page::{Page, PageId};
use crate::store::{MemoryStore, PageStore, StoreError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of an allocation error (0.0 - 1.0).
    pub allocate_error_rate: f64,
    /// Probability of a free error (0.0 - 1.0).
    pub free_error_rate: f64,
}

impl FaultConfig {
    /// No faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Low fault rates on every operation.
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            allocate_error_rate: 0.005,
            free_error_rate: 0.001,
        }
    }

    /// High fault rates on every operation.
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.02,
            allocate_error_rate: 0.05,
            free_error_rate: 0.02,
        }
    }

    /// Faults on reads and allocations only.
    ///
    /// Aborted mutations give back every page they allocated, so without free
    /// faults the store never leaks.
    #[must_use]
    pub const fn without_free_faults(mut self) -> Self {
        self.free_error_rate = 0.0;
        self
    }
}

/// Counters of injected faults.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FaultStats {
    pub read_errors: u64,
    pub allocate_errors: u64,
    pub free_errors: u64,
}

impl FaultStats {
    /// Total number of injected faults.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.read_errors + self.allocate_errors + self.free_errors
    }
}

/// A [`MemoryStore`] that fails on purpose.
#[derive(Debug)]
pub struct FaultyStore {
    inner: MemoryStore,
    config: FaultConfig,
    rng: Mutex<StdRng>,
    /// Faults are suspended while false, e.g. while checking invariants.
    enabled: AtomicBool,
    read_errors: AtomicU64,
    allocate_errors: AtomicU64,
    free_errors: AtomicU64,
}

impl FaultyStore {
    /// Create a store that injects faults according to `config`.
    #[must_use]
    pub fn new(seed: u64, config: FaultConfig) -> Self {
        Self {
            inner: MemoryStore::new(),
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            enabled: AtomicBool::new(true),
            read_errors: AtomicU64::new(0),
            allocate_errors: AtomicU64::new(0),
            free_errors: AtomicU64::new(0),
        }
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// The fault configuration.
    #[must_use]
    pub const fn config(&self) -> &FaultConfig {
        &self.config
    }

    /// Turn fault injection on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Counters of the faults injected so far.
    #[must_use]
    pub fn stats(&self) -> FaultStats {
        FaultStats {
            read_errors: self.read_errors.load(Ordering::Relaxed),
            allocate_errors: self.allocate_errors.load(Ordering::Relaxed),
            free_errors: self.free_errors.load(Ordering::Relaxed),
        }
    }

    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 || !self.enabled.load(Ordering::Relaxed) {
            return false;
        }
        self.rng
            .lock()
            .is_ok_and(|mut rng| rng.random::<f64>() < rate)
    }
}

impl PageStore for FaultyStore {
    fn dereference(&self, id: PageId) -> Result<Page, StoreError> {
        if self.should_inject_fault(self.config.read_error_rate) {
            self.read_errors.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::InjectedFault(format!("read of page {id}")));
        }
        self.inner.dereference(id)
    }

    fn allocate(&self, bytes: &[u8]) -> Result<PageId, StoreError> {
        if self.should_inject_fault(self.config.allocate_error_rate) {
            self.allocate_errors.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::InjectedFault("allocation".to_string()));
        }
        self.inner.allocate(bytes)
    }

    fn free(&self, id: PageId) -> Result<(), StoreError> {
        if self.should_inject_fault(self.config.free_error_rate) {
            self.free_errors.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::InjectedFault(format!("free of page {id}")));
        }
        self.inner.free(id)
    }
}
