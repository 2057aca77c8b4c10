/*
 * ChaosMeta Inject Operator - Chaos Experiment Reconciliation for Kubernetes
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Inject operator core library
//!
//! This crate reconciles `Experiment` custom resources: it resolves selectors
//! into concrete targets, drives the inject and recover phases through the
//! host-level and direct-API fault executors, and persists per-target progress.

pub mod crds;
pub mod tasks;

// Re-export commonly used types
pub use crds::{Experiment, ExperimentSpec, ExperimentStatus};
pub use tasks::config::OperatorConfig;
pub use tasks::engine::Engine;
pub use tasks::types::{Context, Error, Result};
