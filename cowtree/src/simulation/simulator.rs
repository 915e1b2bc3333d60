//! Main simulator harness.
//!
//! Runs a generated workload against a tree on a [`FaultyStore`] and mirrors
//! every successful operation in a `BTreeMap` model. After each operation the
//! tree is checked against the model and against its structural invariants.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::btree::{BTree, InvariantViolation, Snapshot, TreeError, TreeStats};
use crate::config::{ConfigError, TreeConfig, load_var};
use crate::page::PageId;
use crate::store::StoreError;

use super::storage::{FaultConfig, FaultStats, FaultyStore};
use super::workload::{Operation, WorkloadConfig, WorkloadGenerator};

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

/// Largest number of snapshots held at once.
const MAX_SNAPSHOTS: usize = 4;

/// Configuration for the simulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Number of operations to run.
    pub operations: u64,
    /// Fault injection configuration.
    pub fault_config: FaultConfig,
    /// Workload generation configuration.
    pub workload: WorkloadConfig,
    /// Configuration of the tree under test.
    pub tree: TreeConfig,
    /// Run a full scan against the model every this many operations.
    pub full_check_interval: u64,
}

impl SimulatorConfig {
    /// Create a new simulator config with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            operations: 1000,
            fault_config: FaultConfig::default(),
            workload: WorkloadConfig::default(),
            tree: TreeConfig::default(),
            full_check_interval: 100,
        }
    }

    /// Load a configuration from environment variables.
    ///
    /// - `COWTREE_SIM_SEED`: random seed (default: drawn at random)
    /// - `COWTREE_SIM_OPS`: number of operations (default: `10000`)
    /// - `COWTREE_SIM_FAULT_RATE`: allocation and read fault probability
    ///   (default: `0.0`)
    ///
    /// The tree itself is configured through [`TreeConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let seed = load_var("COWTREE_SIM_SEED", rand::random::<u64>())?;
        let operations = load_var("COWTREE_SIM_OPS", 10_000u64)?;
        let fault_rate = load_var("COWTREE_SIM_FAULT_RATE", 0.0f64)?;
        if !(0.0..=1.0).contains(&fault_rate) {
            return Err(ConfigError::InvalidValue {
                name: "COWTREE_SIM_FAULT_RATE".to_string(),
                message: format!("{fault_rate} is not a probability"),
            });
        }

        let tree = TreeConfig::from_env()?;
        let workload = WorkloadConfig {
            max_key_size: tree.max_key_size,
            max_value_size: WorkloadConfig::default().max_value_size.min(tree.max_value_size),
            ..WorkloadConfig::default()
        };
        Ok(Self::new(seed)
            .with_operations(operations)
            .with_tree_config(tree)
            .with_workload(workload)
            .with_fault_config(FaultConfig {
                read_error_rate: fault_rate,
                allocate_error_rate: fault_rate,
                free_error_rate: 0.0,
            }))
    }

    /// Set the number of operations.
    #[must_use]
    pub const fn with_operations(mut self, operations: u64) -> Self {
        self.operations = operations;
        self
    }

    /// Set the fault configuration.
    #[must_use]
    pub const fn with_fault_config(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }

    /// Set the workload configuration.
    #[must_use]
    pub const fn with_workload(mut self, config: WorkloadConfig) -> Self {
        self.workload = config;
        self
    }

    /// Set the configuration of the tree under test.
    #[must_use]
    pub const fn with_tree_config(mut self, config: TreeConfig) -> Self {
        self.tree = config;
        self
    }
}

/// A difference between the tree and the model, or a broken invariant.
#[derive(Debug)]
pub enum Discrepancy {
    /// The tree failed its structural check.
    Structure(InvariantViolation),
    /// A point lookup disagreed with the model.
    ValueMismatch {
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        actual: Option<Vec<u8>>,
    },
    /// A mutation returned the wrong previous value.
    PreviousValueMismatch { key: Vec<u8> },
    /// A scan disagreed with the model.
    ScanMismatch { expected: usize, actual: usize },
    /// A snapshot no longer shows the version it was taken on.
    SnapshotChanged { taken_at: u64 },
    /// A failed mutation changed the tree.
    RootChangedOnFailure,
    /// The store holds pages the tree cannot reach.
    LeakedPages { live: usize, reachable: usize },
    /// An operation failed without an injected fault.
    UnexpectedError(TreeError),
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structure(e) => write!(f, "structure: {e}"),
            Self::ValueMismatch {
                key,
                expected,
                actual,
            } => write!(
                f,
                "value mismatch for key {}: expected {:?} bytes, got {:?} bytes",
                String::from_utf8_lossy(key),
                expected.as_ref().map(Vec::len),
                actual.as_ref().map(Vec::len)
            ),
            Self::PreviousValueMismatch { key } => write!(
                f,
                "wrong previous value returned for key {}",
                String::from_utf8_lossy(key)
            ),
            Self::ScanMismatch { expected, actual } => {
                write!(f, "scan returned {actual} entries, expected {expected}")
            }
            Self::SnapshotChanged { taken_at } => {
                write!(f, "snapshot taken at operation {taken_at} changed")
            }
            Self::RootChangedOnFailure => write!(f, "failed mutation changed the root"),
            Self::LeakedPages { live, reachable } => {
                write!(f, "{live} live pages but only {reachable} reachable")
            }
            Self::UnexpectedError(e) => write!(f, "unexpected error: {e}"),
        }
    }
}

impl std::error::Error for Discrepancy {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Structure(e) => Some(e),
            Self::UnexpectedError(e) => Some(e),
            _ => None,
        }
    }
}

/// Results from a simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The seed used for this simulation.
    pub seed: u64,
    /// Number of operations run.
    pub operations: u64,
    /// Number of operations that failed because of an injected fault.
    pub failed_operations: u64,
    /// The first discrepancy found, with the operation number it happened at.
    pub discrepancy: Option<(u64, Discrepancy)>,
    /// Shape of the tree at the end of the run.
    pub final_stats: Option<TreeStats>,
    /// Faults injected by the store.
    pub faults: FaultStats,
}

impl SimulationResult {
    /// Whether the run found no discrepancy.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.discrepancy.is_none()
    }
}

/// A snapshot together with the model it should match.
struct HeldSnapshot {
    snapshot: Snapshot<FaultyStore>,
    model: Model,
    taken_at: u64,
}

/// The main simulator harness.
pub struct Simulator {
    config: SimulatorConfig,
    generator: WorkloadGenerator,
    store: Arc<FaultyStore>,
    model: Model,
    snapshots: VecDeque<HeldSnapshot>,
    operations: u64,
    failed_operations: u64,
}

impl Simulator {
    /// Create a new simulator with the given configuration.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            generator: WorkloadGenerator::new(config.seed, config.workload),
            // Distinct stream from the workload generator
            store: Arc::new(FaultyStore::new(
                config.seed.wrapping_add(1),
                config.fault_config,
            )),
            model: Model::new(),
            snapshots: VecDeque::new(),
            operations: 0,
            failed_operations: 0,
        }
    }

    /// Run the configured number of operations, stopping at the first
    /// discrepancy.
    pub fn run(&mut self) -> SimulationResult {
        let (final_stats, discrepancy) = match self.run_inner() {
            Ok(stats) => (Some(stats), None),
            Err((at, e)) => {
                tracing::error!(seed = self.config.seed, operation = at, "simulation failed: {e}");
                (None, Some((at, e)))
            }
        };

        SimulationResult {
            seed: self.config.seed,
            operations: self.operations,
            failed_operations: self.failed_operations,
            discrepancy,
            final_stats,
            faults: self.store.stats(),
        }
    }

    fn run_inner(&mut self) -> Result<TreeStats, (u64, Discrepancy)> {
        // Tree creation is not part of the workload
        self.store.set_enabled(false);
        let created = BTree::create(Arc::clone(&self.store), self.config.tree);
        self.store.set_enabled(true);
        let mut tree = created.map_err(|e| (0, Discrepancy::UnexpectedError(e)))?;

        while self.operations < self.config.operations {
            self.operations += 1;
            let step = self.operations;
            let operation = self.generator.next_operation();
            tracing::trace!(step, ?operation, "applying operation");
            self.apply(&mut tree, operation).map_err(|e| (step, e))?;

            self.store.set_enabled(false);
            let checked = self.check(&mut tree);
            self.store.set_enabled(true);
            checked.map_err(|e| (step, e))?;
        }

        // Release every snapshot so the final check sees no retired pages
        self.snapshots.clear();
        self.store.set_enabled(false);
        let reclaimed = tree.reclaim();
        let stats = tree.verify();
        self.store.set_enabled(true);
        let step = self.operations;
        reclaimed.map_err(|e| (step, Discrepancy::UnexpectedError(e)))?;
        stats.map_err(|e| (step, Discrepancy::Structure(e)))
    }

    fn apply(
        &mut self,
        tree: &mut BTree<FaultyStore>,
        operation: Operation,
    ) -> Result<(), Discrepancy> {
        match operation {
            Operation::Insert { key, value } => {
                let root = tree.root();
                match tree.insert(&key, &value) {
                    Ok(previous) => {
                        if previous != self.model.insert(key.clone(), value) {
                            return Err(Discrepancy::PreviousValueMismatch { key });
                        }
                    }
                    Err(e) => self.expect_fault(tree, root, e)?,
                }
            }
            Operation::Delete { key } => {
                let root = tree.root();
                match tree.delete(&key) {
                    Ok(removed) => {
                        if removed != self.model.remove(&key) {
                            return Err(Discrepancy::PreviousValueMismatch { key });
                        }
                    }
                    Err(e) => self.expect_fault(tree, root, e)?,
                }
            }
            Operation::Get { key } => match tree.get(&key) {
                Ok(actual) => {
                    let expected = self.model.get(&key).cloned();
                    if actual != expected {
                        return Err(Discrepancy::ValueMismatch {
                            key,
                            expected,
                            actual,
                        });
                    }
                }
                Err(e) => self.expect_read_fault(e)?,
            },
            Operation::Scan { start, end } => {
                let scanned: Result<Vec<_>, _> =
                    tree.range(start.as_slice()..=end.as_slice()).collect();
                match scanned {
                    Ok(actual) => {
                        let expected: Vec<_> = self
                            .model
                            .range(start..=end)
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        if actual != expected {
                            return Err(Discrepancy::ScanMismatch {
                                expected: expected.len(),
                                actual: actual.len(),
                            });
                        }
                    }
                    Err(e) => self.expect_read_fault(e)?,
                }
            }
            Operation::TakeSnapshot => {
                if self.snapshots.len() < MAX_SNAPSHOTS {
                    self.snapshots.push_back(HeldSnapshot {
                        snapshot: tree.snapshot(),
                        model: self.model.clone(),
                        taken_at: self.operations,
                    });
                }
            }
            Operation::ReleaseSnapshot => {
                if let Some(held) = self.snapshots.pop_front() {
                    self.store.set_enabled(false);
                    let result = check_snapshot(&held);
                    self.store.set_enabled(true);
                    result?;
                }
            }
        }
        Ok(())
    }

    /// A failed mutation must come from an injected fault and leave the tree
    /// as it was.
    fn expect_fault(
        &mut self,
        tree: &BTree<FaultyStore>,
        root_before: PageId,
        error: TreeError,
    ) -> Result<(), Discrepancy> {
        self.expect_read_fault(error)?;
        if tree.root() != root_before {
            return Err(Discrepancy::RootChangedOnFailure);
        }
        Ok(())
    }

    fn expect_read_fault(&mut self, error: TreeError) -> Result<(), Discrepancy> {
        if is_injected(&error) {
            self.failed_operations += 1;
            tracing::debug!(%error, "operation failed on injected fault");
            Ok(())
        } else {
            Err(Discrepancy::UnexpectedError(error))
        }
    }

    /// Compare the tree with the model. Runs with faults disabled.
    fn check(&self, tree: &mut BTree<FaultyStore>) -> Result<(), Discrepancy> {
        let stats = tree.verify().map_err(Discrepancy::Structure)?;
        if stats.keys != self.model.len() {
            return Err(Discrepancy::ScanMismatch {
                expected: self.model.len(),
                actual: stats.keys,
            });
        }

        if self.operations % self.config.full_check_interval.max(1) == 0 {
            let actual = tree
                .iter()
                .collect::<Result<Vec<_>, _>>()
                .map_err(Discrepancy::UnexpectedError)?;
            let matches = actual
                .iter()
                .map(|(k, v)| (k, v))
                .eq(self.model.iter());
            if !matches {
                return Err(Discrepancy::ScanMismatch {
                    expected: self.model.len(),
                    actual: actual.len(),
                });
            }
        }

        // Leaks are only meaningful once every retired page could be freed.
        if self.snapshots.is_empty() && self.config.fault_config.free_error_rate <= 0.0 {
            tree.reclaim().map_err(Discrepancy::UnexpectedError)?;
            let live = tree.store().inner().live_pages();
            if live != stats.pages() {
                return Err(Discrepancy::LeakedPages {
                    live,
                    reachable: stats.pages(),
                });
            }
        }
        Ok(())
    }
}

fn check_snapshot(held: &HeldSnapshot) -> Result<(), Discrepancy> {
    let actual = held
        .snapshot
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(Discrepancy::UnexpectedError)?;
    let unchanged = actual.iter().map(|(k, v)| (k, v)).eq(held.model.iter());
    if unchanged {
        Ok(())
    } else {
        Err(Discrepancy::SnapshotChanged {
            taken_at: held.taken_at,
        })
    }
}

fn is_injected(error: &TreeError) -> bool {
    matches!(error, TreeError::Store(StoreError::InjectedFault(_)))
}
