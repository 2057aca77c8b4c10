//! Admission rules for experiments
//!
//! Pure defaulting and validation. Nothing here talks to the cluster, so the
//! same rules can back a webhook or a CLI pre-flight check.

use crate::crds::experiment::{
    ArgsUnit, Experiment, PhaseType, RangeType, ScopeType, ValueType, CONTAINER_KEY,
    FINALIZER_NAME, FIRST_CONTAINER,
};
use crate::tasks::common::parse_duration;
use crate::tasks::scope::kubernetes::fault_of;
use crate::tasks::types::{Error, Result};
use kube::ResourceExt;
use tracing::debug;

fn reject(message: impl Into<String>) -> Error {
    Error::InvalidArgument(message.into())
}

/// Fill in the finalizer and the container filter of a new experiment
pub fn default_experiment(experiment: &mut Experiment) {
    debug!(experiment = %experiment.name_any(), "Defaulting experiment");
    if experiment.status.as_ref().is_some_and(|s| s.phase.is_some()) {
        return;
    }

    if !experiment.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        experiment.finalizers_mut().push(FINALIZER_NAME.to_string());
    }

    let wants_container = experiment.spec.scope == ScopeType::Pod
        || (experiment.spec.scope == ScopeType::Kubernetes
            && experiment.spec.experiment.target.contains("container"));
    let args = &mut experiment.spec.experiment.args;
    if wants_container && !args.iter().any(|a| a.key == CONTAINER_KEY) {
        args.push(ArgsUnit::new(CONTAINER_KEY, FIRST_CONTAINER, "string"));
    }
}

pub fn validate_create(experiment: &Experiment) -> Result<()> {
    let spec = &experiment.spec;
    if spec.experiment.duration.is_empty() {
        return Err(reject("experiment's duration is empty"));
    }
    parse_duration(&spec.experiment.duration)
        .map_err(|e| reject(format!("experiment's duration is invalid: {e}")))?;

    if spec.target_phase != PhaseType::Inject {
        return Err(reject("initial \"targetPhase\" only support: inject"));
    }

    if let Some(range) = spec.range_mode {
        match range.range_type {
            RangeType::Percent if range.value <= 0 || range.value > 100 => {
                return Err(reject("\"rangeMode.value\" should be in (0,100]"));
            }
            RangeType::Count if range.value <= 0 => {
                return Err(reject("\"rangeMode.value\" should larger than 0"));
            }
            _ => {}
        }
    }

    for arg in &spec.experiment.args {
        if !arg.value_type.is_empty() {
            arg.value_type.parse::<ValueType>().map_err(reject)?;
        }
    }

    if spec.selector.is_empty() && spec.scope != ScopeType::Kubernetes {
        return Err(reject("length of \"selector\" must not be 0"));
    }

    match spec.scope {
        ScopeType::Pod => {
            if spec.selector.iter().any(|unit| unit.namespace.is_empty()) {
                return Err(reject("namespace in selector must not empty"));
            }
        }
        ScopeType::Node => {
            for unit in &spec.selector {
                let provided = [!unit.name.is_empty(), !unit.label.is_empty(), !unit.ip.is_empty()]
                    .into_iter()
                    .filter(|p| *p)
                    .count();
                match provided {
                    0 => {
                        return Err(reject(
                            "must provide one of \"name\", \"label\", \"ip\" in selector",
                        ));
                    }
                    1 => {}
                    _ => {
                        return Err(reject(
                            "can only provide one type of selector in \"name\", \"label\", \"ip\"",
                        ));
                    }
                }
            }
        }
        ScopeType::Kubernetes => {
            fault_of(&spec.experiment)?;
        }
    }

    Ok(())
}

/// Only a one-way flip of `targetPhase` to recover is accepted, after inject has settled
pub fn validate_update(old: &Experiment, new: &Experiment) -> Result<()> {
    if old.spec == new.spec {
        return Ok(());
    }

    if old.spec.experiment != new.spec.experiment
        || old.spec.selector != new.spec.selector
        || old.spec.range_mode != new.spec.range_mode
        || old.spec.scope != new.spec.scope
    {
        return Err(reject("spec only support update \"targetPhase\""));
    }

    let settled = old
        .status
        .as_ref()
        .is_some_and(|s| s.phase == Some(PhaseType::Inject) && s.status.is_terminal());
    if !settled {
        return Err(reject(
            "only support update when \"status.phase == inject and status.status == \
             success/failed/partSuccess\"",
        ));
    }

    if new.spec.target_phase != PhaseType::Recover {
        return Err(reject("only can update \"targetPhase\" to \"recover\""));
    }

    Ok(())
}
