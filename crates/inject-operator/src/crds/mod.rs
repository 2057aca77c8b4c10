//! Custom Resource Definitions for chaos experiments

pub mod experiment;

pub use experiment::{
    ArgsUnit, CloudTargetType, Experiment, ExperimentCommon, ExperimentDetail,
    ExperimentDetailUnit, ExperimentSpec, ExperimentStatus, PhaseType, RangeMode, RangeType,
    ScopeType, SelectorUnit, StatusType, ValueType,
};
