//! Sub-task handlers shared by the inject and recover phases
//!
//! Each pass fans the eligible sub-tasks out to spawned tasks, one worker-pool
//! slot each, waits for all of them and folds the results back by index.

use super::{aggregate_created, aggregate_running};
use crate::crds::experiment::{
    ExperimentCommon, ExperimentDetailUnit, ExperimentSpec, ExperimentStatus, PhaseType,
    ScopeType, StatusType,
};
use crate::tasks::common::{is_timeout, new_uids, now_string};
use crate::tasks::engine::Engine;
use crate::tasks::model::AtomicObject;
use crate::tasks::scope;
use crate::tasks::types::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Inputs every sub-task worker of one pass shares
struct PassContext {
    scope: ScopeType,
    common: ExperimentCommon,
    phase: PhaseType,
    timed_out: bool,
}

/// Timeout check that treats an unparsable duration as already timed out
fn timed_out(spec: &ExperimentSpec, status: &ExperimentStatus) -> bool {
    is_timeout(&status.create_time, &spec.experiment.duration).unwrap_or_else(|e| {
        error!(error = ?e, "Check if experiment timeout error, treating as timed out");
        true
    })
}

/// Run `work` on every unit currently in `eligible` status and write results back
async fn fan_out<F, Fut>(
    engine: &Arc<Engine>,
    units: &mut [ExperimentDetailUnit],
    eligible: StatusType,
    pass: Arc<PassContext>,
    work: F,
) where
    F: Fn(Arc<Engine>, Arc<PassContext>, ExperimentDetailUnit) -> Fut,
    Fut: Future<Output = ExperimentDetailUnit> + Send + 'static,
{
    let mut handles = Vec::new();
    for (index, unit) in units.iter().enumerate() {
        if unit.status != eligible {
            continue;
        }

        let permit = match engine.pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(
                    error = ?e,
                    "Worker pool closed, leaving remaining sub-tasks for the next pass"
                );
                break;
            }
        };
        debug!(
            target = %unit.inject_object_name,
            uid = %unit.uid,
            in_use = engine.pool.in_use(),
            "Sub-task admitted"
        );

        let fut = work(Arc::clone(engine), Arc::clone(&pass), unit.clone());
        let handle = tokio::spawn(async move {
            let _permit = permit;
            fut.await
        });
        handles.push((index, handle));
    }

    for (index, handle) in handles {
        match handle.await {
            Ok(updated) => {
                debug!(
                    target = %updated.inject_object_name,
                    status = %updated.status,
                    "Sub-task finished"
                );
                units[index] = updated;
            }
            Err(e) => error!(
                target = %units[index].inject_object_name,
                error = ?e,
                "Sub-task worker aborted, keeping previous state"
            ),
        }
    }
}

/// Outcome of resolving a sub-task's target
enum Resolved {
    Live(AtomicObject),
    Settled(ExperimentDetailUnit),
}

/// Transient error: keep `keep` until the experiment times out
fn retry_or_fail(unit: &mut ExperimentDetailUnit, keep: StatusType, what: &str, timed_out: bool) {
    if timed_out {
        unit.status = StatusType::Failed;
        unit.message = format!("{what} network error, timeout");
    } else {
        unit.status = keep;
        unit.message = format!("{what} network error, need to retry");
    }
}

async fn resolve(
    engine: &Engine,
    pass: &PassContext,
    mut unit: ExperimentDetailUnit,
    not_found_is_success: bool,
) -> Resolved {
    let keep = unit.status;
    let resolved =
        scope::resolve_target(engine, pass.scope, &pass.common, &unit.inject_object_name).await;
    match resolved {
        Ok(target) => Resolved::Live(target),
        Err(e) => {
            if e.is_network() {
                retry_or_fail(&mut unit, keep, "GetInjectObject", pass.timed_out);
            } else if not_found_is_success && e.is_not_found() {
                unit.status = StatusType::Success;
                unit.message = e.to_string();
            } else {
                unit.status = StatusType::Failed;
                unit.message = format!("GetInjectObject error: {e}");
            }
            unit.update_time = now_string();
            Resolved::Settled(unit)
        }
    }
}

async fn start_unit(
    engine: Arc<Engine>,
    pass: Arc<PassContext>,
    unit: ExperimentDetailUnit,
) -> ExperimentDetailUnit {
    let recovering = pass.phase == PhaseType::Recover;
    let target = match resolve(&engine, &pass, unit.clone(), recovering).await {
        Resolved::Live(target) => target,
        Resolved::Settled(unit) => return unit,
    };

    let mut unit = unit;
    let result: Result<Option<String>> = match pass.phase {
        PhaseType::Inject => {
            scope::execute_inject(&engine, pass.scope, &pass.common, &target, &unit.uid)
                .await
                .map(Some)
        }
        PhaseType::Recover => scope::execute_recover(
            &engine,
            pass.scope,
            &pass.common,
            &target,
            &unit.uid,
            &unit.backup,
        )
        .await
        .map(|()| None),
    };

    let now = now_string();
    unit.update_time.clone_from(&now);
    let phase = pass.phase;
    match result {
        Ok(backup) => {
            if let Some(backup) = backup {
                unit.backup = backup;
            }
            unit.status = StatusType::Running;
            unit.message = format!("experiment {phase} start success");
            unit.start_time = now;
        }
        Err(e) if e.is_conflict() => {
            unit.status = StatusType::Running;
            unit.message = format!("experiment {phase} start success");
        }
        Err(e) if recovering && e.is_not_found() => {
            unit.status = StatusType::Success;
            unit.message = e.to_string();
        }
        Err(e) if e.is_network() => {
            let what = format!("experiment {phase}");
            retry_or_fail(&mut unit, StatusType::Created, &what, pass.timed_out);
        }
        Err(e) => {
            unit.status = StatusType::Failed;
            unit.message = format!("experiment {phase} error: {e}");
        }
    }
    info!(
        target = %unit.inject_object_name,
        uid = %unit.uid,
        status = %unit.status,
        message = %unit.message,
        "Sub-task started"
    );
    unit
}

async fn poll_unit(
    engine: Arc<Engine>,
    pass: Arc<PassContext>,
    unit: ExperimentDetailUnit,
) -> ExperimentDetailUnit {
    let target = match resolve(&engine, &pass, unit.clone(), true).await {
        Resolved::Live(target) => target,
        Resolved::Settled(unit) => return unit,
    };

    let mut unit = unit;
    let queried = scope::execute_query(
        &engine,
        pass.scope,
        &pass.common,
        &target,
        &unit.uid,
        &unit.backup,
        pass.phase,
    )
    .await;

    match queried {
        Ok(info) => match info.status {
            StatusType::Success | StatusType::Failed | StatusType::Running => {
                unit.status = info.status;
                unit.message = info.message;
                if !info.create_time.is_empty() {
                    unit.start_time = info.create_time;
                }
                unit.update_time = if info.update_time.is_empty() {
                    now_string()
                } else {
                    info.update_time
                };
            }
            other => warn!(
                target = %unit.inject_object_name,
                status = %other,
                "Unexpected sub-experiment status, leaving sub-task unchanged"
            ),
        },
        Err(e) if e.is_not_found() => {
            unit.status = StatusType::Success;
            unit.message = e.to_string();
            unit.update_time = now_string();
        }
        Err(e) if e.is_network() => {
            retry_or_fail(&mut unit, StatusType::Running, "experiment query", pass.timed_out);
        }
        Err(e) => {
            unit.status = StatusType::Failed;
            unit.message = format!("experiment query error: {e}");
            unit.update_time = now_string();
        }
    }
    unit
}

fn pass_context(
    spec: &ExperimentSpec,
    status: &ExperimentStatus,
    phase: PhaseType,
) -> Arc<PassContext> {
    Arc::new(PassContext {
        scope: spec.scope,
        common: spec.experiment.clone(),
        phase,
        timed_out: timed_out(spec, status),
    })
}

/// Start every `created` sub-task of `phase` and aggregate
pub async fn solve_created(
    engine: &Arc<Engine>,
    spec: &ExperimentSpec,
    status: &mut ExperimentStatus,
    phase: PhaseType,
) {
    let pass = pass_context(spec, status, phase);
    let units = status.detail.units_mut(phase);
    fan_out(engine, units, StatusType::Created, pass, start_unit).await;

    let (aggregate, message) = aggregate_created(units);
    info!(%phase, total = units.len(), status = %aggregate, "Solve created finished");
    status.status = aggregate;
    status.message = message.to_string();
    status.update_time = now_string();
}

/// Poll every `running` sub-task of `phase` and aggregate
pub async fn solve_running(
    engine: &Arc<Engine>,
    spec: &ExperimentSpec,
    status: &mut ExperimentStatus,
    phase: PhaseType,
) {
    let pass = pass_context(spec, status, phase);
    let units = status.detail.units_mut(phase);
    fan_out(engine, units, StatusType::Running, pass, poll_unit).await;

    let (aggregate, message) = aggregate_running(units);
    info!(%phase, total = units.len(), status = %aggregate, "Solve running finished");
    status.status = aggregate;
    status.message = message.to_string();
    status.update_time = now_string();
}

/// Hand a terminal inject over to recover.
///
/// The recover list is built fresh from the inject list, keeping each
/// sub-task's identity and backup.
pub fn solve_terminal(spec: &ExperimentSpec, status: &mut ExperimentStatus) {
    if spec.target_phase != PhaseType::Recover || status.phase != Some(PhaseType::Inject) {
        return;
    }

    let now = now_string();
    status.detail.recover = status
        .detail
        .inject
        .iter()
        .map(|unit| ExperimentDetailUnit {
            inject_object_name: unit.inject_object_name.clone(),
            uid: unit.uid.clone(),
            message: "start to recover".to_string(),
            status: StatusType::Created,
            start_time: String::new(),
            update_time: now.clone(),
            backup: unit.backup.clone(),
        })
        .collect();
    status.phase = Some(PhaseType::Recover);
    status.status = StatusType::Created;
    status.message = "start to recover".to_string();
    status.update_time = now;
    info!(total = status.detail.recover.len(), "Recover sub-tasks seeded");
}

/// Resolve the selector, apply the range filter and seed the inject sub-tasks.
///
/// Network errors are returned so the pass is retried; anything else fails
/// the experiment with a message.
pub async fn initialize(
    engine: &Engine,
    spec: &ExperimentSpec,
    status: &mut ExperimentStatus,
) -> Result<()> {
    let now = now_string();
    if status.create_time.is_empty() {
        status.create_time.clone_from(&now);
    }
    status.update_time.clone_from(&now);
    status.phase = Some(PhaseType::Inject);

    let targets = match scope::resolve_selector(engine, spec).await {
        Ok(targets) => targets,
        Err(e) if e.is_network() => {
            status.phase = None;
            return Err(e);
        }
        Err(e) => {
            warn!(error = ?e, "Convert selector to inject object failed");
            status.status = StatusType::Failed;
            status.message = format!("convert selector to inject object error: {e}");
            return Ok(());
        }
    };

    let targets = engine.select_range(targets, spec.range_mode.as_ref());
    if targets.is_empty() {
        status.status = StatusType::Failed;
        status.message = "no matching target".to_string();
        return Ok(());
    }

    let uids = new_uids(targets.len());
    status.detail.inject = targets
        .iter()
        .zip(uids)
        .map(|(target, uid)| ExperimentDetailUnit {
            inject_object_name: target.object_name(),
            uid,
            message: "Initial experiment created".to_string(),
            status: StatusType::Created,
            start_time: String::new(),
            update_time: now.clone(),
            backup: String::new(),
        })
        .collect();
    status.detail.recover.clear();
    status.status = StatusType::Created;
    status.message = "Initial experiment created".to_string();
    info!(total = status.detail.inject.len(), "Inject sub-tasks seeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::experiment::ArgsUnit;
    use crate::tasks::cluster::MockClusterClient;
    use crate::tasks::executor::MockRemoteExecutor;
    use crate::tasks::types::Error;
    use chrono::Local;
    use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
    use kube::core::ObjectMeta;
    use kube::error::ErrorResponse;

    const TARGET: &str = "pod/shop/web-0/app";

    fn web_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("shop".to_string()),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                host_ip: Some("10.0.0.1".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    container_id: Some("containerd://abc".to_string()),
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    fn live_cluster() -> MockClusterClient {
        let mut cluster = MockClusterClient::new();
        cluster.expect_get_pod().returning(|_, _| Ok(web_pod()));
        cluster
    }

    fn gone_cluster() -> MockClusterClient {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_pod()
            .returning(|ns, name| Err(Error::NotFound(format!("pod {ns}/{name}"))));
        cluster
    }

    fn engine(cluster: MockClusterClient, remote: MockRemoteExecutor) -> Arc<Engine> {
        Arc::new(Engine::with_seed(Arc::new(cluster), Arc::new(remote), 2, 3))
    }

    fn spec(duration: &str) -> ExperimentSpec {
        ExperimentSpec {
            scope: ScopeType::Pod,
            range_mode: None,
            experiment: ExperimentCommon {
                duration: duration.to_string(),
                target: "cpu".to_string(),
                fault: "burn".to_string(),
                args: vec![ArgsUnit::new("percent", "80", "int")],
            },
            selector: Vec::new(),
            target_phase: PhaseType::Inject,
        }
    }

    /// One sub-task in `phase`, experiment created `age_secs` ago
    fn status(phase: PhaseType, unit_status: StatusType, age_secs: i64) -> ExperimentStatus {
        let created = (Local::now() - chrono::Duration::seconds(age_secs))
            .format(crate::tasks::common::TIME_FORMAT)
            .to_string();
        let mut status = ExperimentStatus {
            phase: Some(phase),
            status: unit_status,
            create_time: created,
            ..ExperimentStatus::default()
        };
        status.detail.units_mut(phase).push(ExperimentDetailUnit {
            inject_object_name: TARGET.to_string(),
            uid: "20240101120000abcdef01".to_string(),
            status: unit_status,
            backup: "10.0.0.1".to_string(),
            ..ExperimentDetailUnit::default()
        });
        status
    }

    fn only_unit(status: &ExperimentStatus, phase: PhaseType) -> &ExperimentDetailUnit {
        &status.detail.units(phase)[0]
    }

    fn conflict_409() -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        }))
    }

    fn unreachable_inject() -> MockRemoteExecutor {
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_inject()
            .returning(|_, _| Err(Error::NetworkError("connection refused".to_string())));
        remote
    }

    #[tokio::test]
    async fn test_inject_network_error_retries_until_timeout() {
        let engine = engine(live_cluster(), unreachable_inject());
        let spec = spec("5m");

        let mut fresh = status(PhaseType::Inject, StatusType::Created, 10);
        solve_created(&engine, &spec, &mut fresh, PhaseType::Inject).await;
        let unit = only_unit(&fresh, PhaseType::Inject);
        assert_eq!(unit.status, StatusType::Created);
        assert_eq!(unit.message, "experiment inject network error, need to retry");
        assert_eq!(fresh.status, StatusType::Created);

        let mut expired = status(PhaseType::Inject, StatusType::Created, 3600);
        solve_created(&engine, &spec, &mut expired, PhaseType::Inject).await;
        let unit = only_unit(&expired, PhaseType::Inject);
        assert_eq!(unit.status, StatusType::Failed);
        assert_eq!(unit.message, "experiment inject network error, timeout");
        assert_eq!(expired.status, StatusType::Failed);
    }

    #[tokio::test]
    async fn test_unparsable_duration_counts_as_timed_out() {
        let engine = engine(live_cluster(), unreachable_inject());
        let mut fresh = status(PhaseType::Inject, StatusType::Created, 1);

        solve_created(&engine, &spec("5p"), &mut fresh, PhaseType::Inject).await;
        assert_eq!(only_unit(&fresh, PhaseType::Inject).status, StatusType::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_inject_is_treated_as_started() {
        let mut remote = MockRemoteExecutor::new();
        remote.expect_inject().returning(|_, _| {
            Err(Error::RemoteError(
                "err code: 1, err msg: UNIQUE constraint failed: experiments.uid".to_string(),
            ))
        });
        let engine = engine(live_cluster(), remote);
        let mut status = status(PhaseType::Inject, StatusType::Created, 10);

        solve_created(&engine, &spec("5m"), &mut status, PhaseType::Inject).await;
        let unit = only_unit(&status, PhaseType::Inject);
        assert_eq!(unit.status, StatusType::Running);
        assert_eq!(unit.message, "experiment inject start success");
        assert_eq!(status.status, StatusType::Running);
    }

    #[tokio::test]
    async fn test_api_conflict_is_treated_as_started() {
        let mut remote = MockRemoteExecutor::new();
        remote.expect_inject().returning(|_, _| Err(conflict_409()));
        let engine = engine(live_cluster(), remote);
        let mut status = status(PhaseType::Inject, StatusType::Created, 3600);

        solve_created(&engine, &spec("5m"), &mut status, PhaseType::Inject).await;
        assert_eq!(only_unit(&status, PhaseType::Inject).status, StatusType::Running);
    }

    #[tokio::test]
    async fn test_other_inject_error_fails_the_unit() {
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_inject()
            .returning(|_, _| Err(Error::RemoteError("disk full".to_string())));
        let engine = engine(live_cluster(), remote);
        let mut status = status(PhaseType::Inject, StatusType::Created, 10);

        solve_created(&engine, &spec("5m"), &mut status, PhaseType::Inject).await;
        let unit = only_unit(&status, PhaseType::Inject);
        assert_eq!(unit.status, StatusType::Failed);
        assert!(unit.message.starts_with("experiment inject error:"));
    }

    #[tokio::test]
    async fn test_missing_target_fails_inject_but_completes_recover() {
        let engine = engine(gone_cluster(), MockRemoteExecutor::new());
        let spec = spec("5m");

        let mut inject = status(PhaseType::Inject, StatusType::Created, 10);
        solve_created(&engine, &spec, &mut inject, PhaseType::Inject).await;
        let unit = only_unit(&inject, PhaseType::Inject);
        assert_eq!(unit.status, StatusType::Failed);
        assert!(unit.message.starts_with("GetInjectObject error:"));

        let mut recover = status(PhaseType::Recover, StatusType::Created, 10);
        solve_created(&engine, &spec, &mut recover, PhaseType::Recover).await;
        assert_eq!(only_unit(&recover, PhaseType::Recover).status, StatusType::Success);
    }

    #[tokio::test]
    async fn test_recover_of_unknown_task_is_success() {
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_recover()
            .returning(|_, uid| Err(Error::NotFound(format!("task {uid}"))));
        let engine = engine(live_cluster(), remote);
        let mut status = status(PhaseType::Recover, StatusType::Created, 10);

        solve_created(&engine, &spec("5m"), &mut status, PhaseType::Recover).await;
        assert_eq!(only_unit(&status, PhaseType::Recover).status, StatusType::Success);
        assert_eq!(status.status, StatusType::Success);
    }

    #[tokio::test]
    async fn test_query_not_found_is_success() {
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_query()
            .returning(|_, uid, _| Err(Error::NotFound(format!("task {uid}"))));
        let engine = engine(live_cluster(), remote);
        let mut status = status(PhaseType::Inject, StatusType::Running, 10);

        solve_running(&engine, &spec("5m"), &mut status, PhaseType::Inject).await;
        assert_eq!(only_unit(&status, PhaseType::Inject).status, StatusType::Success);
        assert_eq!(status.status, StatusType::Success);
    }

    #[tokio::test]
    async fn test_target_gone_while_polling_is_success() {
        let engine = engine(gone_cluster(), MockRemoteExecutor::new());
        let mut status = status(PhaseType::Inject, StatusType::Running, 3600);

        solve_running(&engine, &spec("5m"), &mut status, PhaseType::Inject).await;
        assert_eq!(only_unit(&status, PhaseType::Inject).status, StatusType::Success);
    }

    #[tokio::test]
    async fn test_query_network_error_keeps_running_until_timeout() {
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_query()
            .returning(|_, _, _| Err(Error::NetworkError("timed out".to_string())));
        let engine = engine(live_cluster(), remote);
        let spec = spec("5m");

        let mut fresh = status(PhaseType::Inject, StatusType::Running, 10);
        solve_running(&engine, &spec, &mut fresh, PhaseType::Inject).await;
        assert_eq!(only_unit(&fresh, PhaseType::Inject).status, StatusType::Running);
        assert_eq!(fresh.status, StatusType::Running);

        let mut expired = status(PhaseType::Inject, StatusType::Running, 3600);
        solve_running(&engine, &spec, &mut expired, PhaseType::Inject).await;
        let unit = only_unit(&expired, PhaseType::Inject);
        assert_eq!(unit.status, StatusType::Failed);
        assert_eq!(unit.message, "experiment query network error, timeout");
        assert_eq!(expired.status, StatusType::Failed);
    }

    #[tokio::test]
    async fn test_query_result_is_copied_onto_the_unit() {
        let mut remote = MockRemoteExecutor::new();
        remote.expect_query().returning(|_, uid, _| {
            Ok(crate::tasks::executor::SubExpInfo {
                uid: uid.to_string(),
                status: StatusType::Failed,
                message: "cgroup not found".to_string(),
                create_time: "2024-01-01 12:00:00".to_string(),
                update_time: "2024-01-01 12:00:09".to_string(),
            })
        });
        let engine = engine(live_cluster(), remote);
        let mut status = status(PhaseType::Inject, StatusType::Running, 10);

        solve_running(&engine, &spec("5m"), &mut status, PhaseType::Inject).await;
        let unit = only_unit(&status, PhaseType::Inject);
        assert_eq!(unit.status, StatusType::Failed);
        assert_eq!(unit.message, "cgroup not found");
        assert_eq!(unit.start_time, "2024-01-01 12:00:00");
        assert_eq!(unit.update_time, "2024-01-01 12:00:09");
    }
}
