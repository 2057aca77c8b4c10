use crate::crds::experiment::{Experiment, ExperimentStatus, PhaseType, FINALIZER_NAME};
use crate::tasks::engine::Engine;
use crate::tasks::phase::{self, next_step, Step};
use crate::tasks::types::{Context, Error, Result};
use futures::FutureExt;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// Reconcile boundary: a panic while processing one experiment becomes an
/// error for that experiment instead of taking the controller down.
#[instrument(
    skip(experiment, ctx),
    fields(experiment = %experiment.name_any(), namespace = ?experiment.namespace())
)]
pub async fn reconcile_experiment(
    experiment: Arc<Experiment>,
    ctx: Arc<Context>,
) -> Result<Action> {
    match AssertUnwindSafe(reconcile_inner(experiment, ctx))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Experiment reconcile panicked");
            Err(Error::ReconcilePanicked(message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub fn error_policy(experiment: Arc<Experiment>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(
        error = ?err,
        experiment = %experiment.name_any(),
        "Experiment reconciliation failed, requeueing"
    );
    Action::requeue(Duration::from_secs(ctx.config.controller.error_requeue_seconds))
}

fn has_finalizer(experiment: &Experiment) -> bool {
    experiment.finalizers().iter().any(|f| f == FINALIZER_NAME)
}

/// Run one pass of the state machine on the in-memory experiment.
///
/// Spec, metadata and status are updated in place; the caller persists
/// whatever changed.
pub async fn process_experiment(
    engine: &Arc<Engine>,
    experiment: &mut Experiment,
) -> Result<Step> {
    let deleting = experiment.metadata.deletion_timestamp.is_some();
    let (phase, status) = experiment
        .status
        .as_ref()
        .map_or((None, Default::default()), |s| (s.phase, s.status));
    let step = next_step(deleting, phase, status, experiment.spec.target_phase);
    debug!(?step, deleting, ?phase, %status, "Selected reconcile step");

    if step != Step::ReleaseFinalizer && !deleting && !has_finalizer(experiment) {
        experiment
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER_NAME.to_string());
    }

    let spec = &mut experiment.spec;
    let status = experiment
        .status
        .get_or_insert_with(ExperimentStatus::default);

    match step {
        Step::RequestRecover => {
            info!("Experiment deleted after inject, requesting recover first");
            spec.target_phase = PhaseType::Recover;
        }
        Step::ReleaseFinalizer => {
            if let Some(finalizers) = experiment.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != FINALIZER_NAME);
            }
        }
        Step::Initialize => phase::initialize(engine, spec, status).await?,
        Step::SolveCreated(p) => phase::solve_created(engine, spec, status, p).await,
        Step::SolveRunning(p) => phase::solve_running(engine, spec, status, p).await,
        Step::SolveTerminal(_) => phase::solve_terminal(spec, status),
        Step::Idle => {}
    }

    Ok(step)
}

async fn reconcile_inner(experiment: Arc<Experiment>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = experiment.namespace().ok_or(Error::MissingObjectKey)?;
    let name = experiment.name_any();
    let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut working = (*experiment).clone();
    let step = process_experiment(&ctx.engine, &mut working).await?;

    let metadata_changed = working.metadata.finalizers != experiment.metadata.finalizers
        || working.spec.target_phase != experiment.spec.target_phase;
    if metadata_changed {
        debug!("Persisting finalizer and target phase");
        api.replace(&name, &PostParams::default(), &working).await?;
    }

    let released = step == Step::ReleaseFinalizer;
    if working.status != experiment.status && !released {
        debug!("Persisting experiment status");
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": working.status })),
        )
        .await?;
    }

    let terminal = working
        .status
        .as_ref()
        .is_some_and(|s| s.status.is_terminal());
    match step {
        Step::ReleaseFinalizer => {
            info!("Experiment finished, finalizer released");
            Ok(Action::await_change())
        }
        Step::Idle if terminal => Ok(Action::await_change()),
        _ => Ok(Action::requeue(Duration::from_secs(
            ctx.config.controller.requeue_seconds,
        ))),
    }
}
