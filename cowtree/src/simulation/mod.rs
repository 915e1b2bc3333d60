//! Deterministic simulation testing.
//!
//! This module provides tools for testing the tree with:
//! - A page store that injects faults at the store boundary
//! - Reproducible random workloads
//! - A model map and invariant checks after each operation
//!
//! Given the same seed, a run is identical, so a failing seed can be replayed
//! with the `simulate` binary.
//!
//! # Usage
//!
//! ```
//! use cowtree::simulation::{FaultConfig, Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345) // seed
//!     .with_operations(200)
//!     .with_fault_config(FaultConfig::low_faults().without_free_faults());
//!
//! let mut sim = Simulator::new(config);
//! let result = sim.run();
//!
//! assert!(result.passed());
//! ```

mod simulator;
mod storage;
mod workload;

pub use simulator::{Discrepancy, SimulationResult, Simulator, SimulatorConfig};
pub use storage::{FaultConfig, FaultStats, FaultyStore};
pub use workload::{Operation, WorkloadConfig, WorkloadGenerator};
