//! Wiring of the assignment services over one backing store.

use std::sync::Arc;

use tracing::info;

use crate::clock::{Clock, RandomSource, SeededRandom, SystemClock, ThreadRandom};
use crate::config::{ResolutionConfig, StorageConfig, UpgradeConfig};
use crate::engine::AssignmentEngine;
use crate::error::Result;
use crate::lifecycle::ExperimentManager;
use crate::overrides::{ExplicitAssignments, PreviewUsers};
use crate::storage::{AssignmentStore, ExperimentStore, MemoryStore, OverrideStore, TursoStore};
use crate::support::SupportService;

/// Every service, sharing one store, clock and random source.
pub struct Services {
    pub experiments: ExperimentManager,
    pub engine: Arc<AssignmentEngine>,
    pub explicit: ExplicitAssignments,
    pub preview: PreviewUsers,
    pub support: SupportService,
    /// Read access to assignment records and visits
    pub assignments: Arc<dyn AssignmentStore>,
    pub resolution: ResolutionConfig,
}

impl Services {
    pub fn new<S>(store: Arc<S>, clock: Arc<dyn Clock>, random: Arc<dyn RandomSource>) -> Self
    where
        S: ExperimentStore + AssignmentStore + OverrideStore + 'static,
    {
        let experiments: Arc<dyn ExperimentStore> = store.clone();
        let assignments: Arc<dyn AssignmentStore> = store.clone();
        let overrides: Arc<dyn OverrideStore> = store;

        let engine = Arc::new(AssignmentEngine::new(
            experiments.clone(),
            assignments.clone(),
            overrides.clone(),
            random,
            clock.clone(),
        ));

        Self {
            experiments: ExperimentManager::new(experiments.clone(), clock.clone()),
            explicit: ExplicitAssignments::new(
                experiments.clone(),
                overrides.clone(),
                clock.clone(),
            ),
            preview: PreviewUsers::new(experiments, overrides, clock),
            support: SupportService::new(engine.clone()),
            engine,
            assignments,
            resolution: ResolutionConfig::default(),
        }
    }

    /// Open the configured store and wire the services over it.
    pub async fn from_config(config: &UpgradeConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let random: Arc<dyn RandomSource> = match config.resolution.seed {
            Some(seed) => Arc::new(SeededRandom::new(seed)),
            None => Arc::new(ThreadRandom),
        };

        let services = match &config.storage {
            StorageConfig::Local { path } => {
                info!(path = %path.display(), "opening local assignment store");
                Self::new(Arc::new(TursoStore::new_local(path).await?), clock, random)
            }
            StorageConfig::Remote { url, token } => {
                info!(url = %url, "connecting to remote assignment store");
                Self::new(
                    Arc::new(TursoStore::new_remote(url, token).await?),
                    clock,
                    random,
                )
            }
            StorageConfig::Memory => {
                info!("using in-memory assignment store");
                Self::new(Arc::new(MemoryStore::new()), clock, random)
            }
        };

        Ok(Self {
            resolution: config.resolution.clone(),
            ..services
        })
    }
}
