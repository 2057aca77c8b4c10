pub mod controller;

pub use controller::{error_policy, process_experiment, reconcile_experiment};
