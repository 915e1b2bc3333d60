//! Run a seeded simulation against the tree.
//!
//! Configured through `COWTREE_SIM_*` and `COWTREE_*` environment variables;
//! logging through `RUST_LOG`.

use cowtree::simulation::{Simulator, SimulatorConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cowtree=info,simulate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match SimulatorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        seed = config.seed,
        operations = config.operations,
        fault_rate = config.fault_config.allocate_error_rate,
        "starting simulation"
    );

    let result = Simulator::new(config).run();
    if let Some((operation, discrepancy)) = &result.discrepancy {
        tracing::error!(
            seed = result.seed,
            operation,
            "simulation failed: {discrepancy}"
        );
        std::process::exit(1);
    }

    let stats = result.final_stats.unwrap_or_default();
    tracing::info!(
        seed = result.seed,
        operations = result.operations,
        failed_operations = result.failed_operations,
        injected_faults = result.faults.total(),
        height = stats.height,
        keys = stats.keys,
        pages = stats.pages(),
        "simulation passed"
    );
}
