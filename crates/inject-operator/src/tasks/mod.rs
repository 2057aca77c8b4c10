use crate::crds::Experiment;
use futures::StreamExt;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod admission;
pub mod cluster;
pub mod common;
pub mod config;
pub mod engine;
pub mod executor;
pub mod experiment;
pub mod gate;
pub mod model;
pub mod native;
pub mod phase;
pub mod pool;
pub mod range;
pub mod recovery;
pub mod scope;
pub mod types;

// Re-export commonly used items
pub use config::OperatorConfig;
pub use engine::Engine;
pub use experiment::{error_policy, reconcile_experiment};
pub use recovery::run_auto_recovery;
pub use types::{Context, Error, Result};

/// Default location of the mounted operator configuration
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Load the operator configuration, falling back to defaults when the file is unusable
pub fn load_config(path: &str) -> Result<OperatorConfig> {
    debug!(path, "Loading operator configuration from mounted file...");

    let config = match OperatorConfig::from_mounted_file(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "Failed to load configuration, using defaults");
            OperatorConfig::default()
        }
    };

    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }
    debug!("Configuration validation passed");
    Ok(config)
}

/// Run the Experiment controller until its watch stream ends
#[instrument(skip(client, context))]
pub async fn run_experiment_controller(client: Client, context: Arc<Context>) -> Result<()> {
    let concurrency = context.config.controller.concurrent_reconciles;
    info!(concurrency, "Starting Experiment controller");

    let experiments: Api<Experiment> = Api::all(client);
    let watcher_config = Config::default().any_semantic();

    Controller::new(experiments, watcher_config)
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile_experiment, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("experiment_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(experiment) => {
                        debug!(resource = ?experiment, "Experiment reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "Experiment reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("Experiment controller shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let config = load_config("/nonexistent/inject-operator/config.yaml")
            .expect("defaults should validate");
        assert_eq!(config.worker.pool_count, 5);
        assert_eq!(config.ticker.auto_check_interval, 10);
        assert_eq!(config.controller.concurrent_reconciles, 10);
    }
}
