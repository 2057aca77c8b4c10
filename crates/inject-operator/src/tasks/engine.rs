//! Process-wide dependencies shared by the reconciler and phase handlers

use crate::crds::experiment::RangeMode;
use crate::tasks::cluster::ClusterClient;
use crate::tasks::executor::RemoteExecutor;
use crate::tasks::gate::ClusterTaskGate;
use crate::tasks::model::AtomicObject;
use crate::tasks::pool::WorkerPool;
use crate::tasks::range::apply_range;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex, PoisonError};

/// Poll interval used while draining a running cluster task
pub const CLUSTER_TASK_STOP_POLL: std::time::Duration = std::time::Duration::from_secs(1);

/// Everything the engine touches outside the experiment object itself.
///
/// Built once at startup and handed to the controller through
/// [`crate::tasks::types::Context`].
pub struct Engine {
    pub cluster: Arc<dyn ClusterClient>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub pool: WorkerPool,
    pub gate: Arc<ClusterTaskGate>,
    rng: Mutex<StdRng>,
}

impl Engine {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        remote: Arc<dyn RemoteExecutor>,
        pool_size: usize,
    ) -> Self {
        Self::with_rng(cluster, remote, pool_size, StdRng::from_entropy())
    }

    /// Same as [`Engine::new`] with a reproducible range shuffle
    #[must_use]
    pub fn with_seed(
        cluster: Arc<dyn ClusterClient>,
        remote: Arc<dyn RemoteExecutor>,
        pool_size: usize,
        seed: u64,
    ) -> Self {
        Self::with_rng(cluster, remote, pool_size, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        cluster: Arc<dyn ClusterClient>,
        remote: Arc<dyn RemoteExecutor>,
        pool_size: usize,
        rng: StdRng,
    ) -> Self {
        Self {
            cluster,
            remote,
            pool: WorkerPool::new(pool_size),
            gate: Arc::new(ClusterTaskGate::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Apply the range filter using the engine's random source
    pub fn select_range(
        &self,
        targets: Vec<AtomicObject>,
        mode: Option<&RangeMode>,
    ) -> Vec<AtomicObject> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        apply_range(targets, mode, &mut *rng)
    }
}

/// Worker count for bulk cluster operations: half the available cores, at least one
#[must_use]
pub fn bulk_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::experiment::RangeType;
    use crate::tasks::cluster::MockClusterClient;
    use crate::tasks::executor::MockRemoteExecutor;
    use crate::tasks::model::DeploymentObject;

    fn engine(seed: u64) -> Engine {
        Engine::with_seed(
            Arc::new(MockClusterClient::new()),
            Arc::new(MockRemoteExecutor::new()),
            4,
            seed,
        )
    }

    fn targets() -> Vec<AtomicObject> {
        (0..10)
            .map(|i| {
                AtomicObject::Deployment(DeploymentObject {
                    namespace: "default".to_string(),
                    name: format!("app-{i}"),
                })
            })
            .collect()
    }

    #[test]
    fn test_seeded_engines_select_the_same_subset() {
        let mode = RangeMode {
            range_type: RangeType::Count,
            value: 3,
        };
        let first = engine(7).select_range(targets(), Some(&mode));
        let second = engine(7).select_range(targets(), Some(&mode));
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }

    #[test]
    fn test_pool_size_comes_from_constructor() {
        assert_eq!(engine(1).pool.size(), 4);
        assert!(!engine(1).gate.is_running());
    }

    #[test]
    fn test_bulk_workers_at_least_one() {
        assert!(bulk_workers() >= 1);
    }
}
