//! Auto-recovery sweep
//!
//! On a fixed interval, experiments whose inject has finished and whose
//! declared duration has elapsed are switched to recover.

use crate::crds::experiment::{Experiment, PhaseType};
use crate::tasks::common::is_timeout;
use crate::tasks::types::Result;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Whether the sweep should request recovery for this experiment
#[must_use]
pub fn needs_auto_recover(experiment: &Experiment) -> bool {
    let Some(status) = experiment.status.as_ref() else {
        return false;
    };
    if status.phase != Some(PhaseType::Inject)
        || !status.status.is_terminal()
        || experiment.spec.target_phase == PhaseType::Recover
    {
        return false;
    }

    match is_timeout(&status.create_time, &experiment.spec.experiment.duration) {
        Ok(timed_out) => timed_out,
        Err(e) => {
            warn!(
                experiment = %experiment.name_any(),
                error = ?e,
                "Check timeout of experiment error"
            );
            false
        }
    }
}

/// One pass over every experiment in the cluster
pub async fn sweep(client: &Client) -> Result<usize> {
    let experiments: Api<Experiment> = Api::all(client.clone());
    let list = experiments.list(&ListParams::default()).await?;

    let mut requested = 0;
    for mut experiment in list.items {
        if !needs_auto_recover(&experiment) {
            continue;
        }

        let name = experiment.name_any();
        let Some(namespace) = experiment.namespace() else {
            continue;
        };
        info!(experiment = %name, %namespace, "Experiment is time to auto recover");

        experiment.spec.target_phase = PhaseType::Recover;
        let api: Api<Experiment> = Api::namespaced(client.clone(), &namespace);
        match api.replace(&name, &PostParams::default(), &experiment).await {
            Ok(_) => requested += 1,
            Err(e) => error!(
                experiment = %name,
                error = ?e,
                "Experiment is time to recover, but update \"targetPhase\" error"
            ),
        }
    }
    Ok(requested)
}

/// Run the sweep forever, first tick one interval after start
pub async fn run_auto_recovery(client: Client, interval: Duration) {
    info!(
        interval_secs = interval.as_secs(),
        "Starting auto recover checker"
    );
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match sweep(&client).await {
            Ok(requested) => debug!(requested, "Auto recover sweep finished"),
            Err(e) => error!(error = ?e, "Auto recover sweep failed"),
        }
    }
}
