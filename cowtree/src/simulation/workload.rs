//! Random but reproducible tree operations.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One step of a simulated workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Get { key: Vec<u8> },
    /// Scan `start..end`, both ends inclusive.
    Scan { start: Vec<u8>, end: Vec<u8> },
    /// Take a snapshot to check later against a copy of the model.
    TakeSnapshot,
    /// Check and release the oldest snapshot.
    ReleaseSnapshot,
}

/// Configuration for operation generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkloadConfig {
    /// Number of distinct short keys.
    pub key_space: u32,
    /// Largest generated value.
    pub max_value_size: usize,
    /// Largest generated key for long keys.
    pub max_key_size: usize,
    /// Probability that an insert uses a long random key instead of a short one.
    pub long_key_rate: f64,
    /// Relative weight of inserts.
    pub insert_weight: u32,
    /// Relative weight of deletes.
    pub delete_weight: u32,
    /// Relative weight of point lookups.
    pub get_weight: u32,
    /// Relative weight of range scans.
    pub scan_weight: u32,
    /// Relative weight of snapshot operations.
    pub snapshot_weight: u32,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            key_space: 2000,
            max_value_size: 600,
            max_key_size: 1000,
            long_key_rate: 0.02,
            insert_weight: 50,
            delete_weight: 30,
            get_weight: 10,
            scan_weight: 5,
            snapshot_weight: 5,
        }
    }
}

/// Generator of [`Operation`]s.
#[derive(Debug)]
pub struct WorkloadGenerator {
    config: WorkloadConfig,
    rng: StdRng,
}

impl WorkloadGenerator {
    /// Create a generator with the given seed.
    #[must_use]
    pub fn new(seed: u64, config: WorkloadConfig) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Produce the next operation.
    pub fn next_operation(&mut self) -> Operation {
        let c = self.config;
        let total =
            c.insert_weight + c.delete_weight + c.get_weight + c.scan_weight + c.snapshot_weight;
        let mut pick = self.rng.random_range(0..total.max(1));

        if pick < c.insert_weight {
            return Operation::Insert {
                key: self.insert_key(),
                value: self.random_value(),
            };
        }
        pick -= c.insert_weight;
        if pick < c.delete_weight {
            return Operation::Delete {
                key: self.short_key(),
            };
        }
        pick -= c.delete_weight;
        if pick < c.get_weight {
            return Operation::Get {
                key: self.short_key(),
            };
        }
        pick -= c.get_weight;
        if pick < c.scan_weight {
            let a = self.short_key();
            let b = self.short_key();
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            return Operation::Scan { start, end };
        }

        if self.rng.random_bool(0.5) {
            Operation::TakeSnapshot
        } else {
            Operation::ReleaseSnapshot
        }
    }

    fn short_key(&mut self) -> Vec<u8> {
        let n = self.rng.random_range(0..self.config.key_space.max(1));
        format!("key{n:08}").into_bytes()
    }

    /// A short key, or sometimes a long one that sorts among the short keys.
    fn insert_key(&mut self) -> Vec<u8> {
        let mut key = self.short_key();
        if self.rng.random::<f64>() < self.config.long_key_rate {
            let len = self.rng.random_range(key.len()..=self.config.max_key_size.max(key.len()));
            while key.len() < len {
                key.push(self.rng.random_range(b'a'..=b'z'));
            }
        }
        key
    }

    fn random_value(&mut self) -> Vec<u8> {
        let len = self.rng.random_range(0..=self.config.max_value_size);
        let mut value = vec![0u8; len];
        self.rng.fill(value.as_mut_slice());
        value
    }
}
