use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{ForecastError, Result};
use crate::features::{build_feature_matrix, FeatureConfig};
use crate::forecaster::recursive_forecast;
use crate::model::observation::group_by_entity;
use crate::model::{DuplicatePolicy, EntityKey, Series, SeriesPoint, ValidationMetrics};
use crate::registry::{ModelRegistry, RegistryCommit, RegistryIndex, TrainedArtifact};
use crate::source::ObservationSource;
use crate::trainer::{train_entity, TrainOutcome, TrainerConfig};

#[derive(Debug, Clone)]
pub struct TrainingSettings {
    pub features: FeatureConfig,
    pub trainer: TrainerConfig,
    pub duplicate_policy: DuplicatePolicy,
    pub write_previews: bool,
    /// Real observations used to seed the post-training preview forecast.
    pub preview_tail: usize,
    /// Worker threads; 0 uses rayon's global pool.
    pub threads: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            trainer: TrainerConfig::default(),
            duplicate_policy: DuplicatePolicy::KeepFirst,
            write_previews: true,
            preview_tail: 60,
            threads: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityStatus {
    Trained { metrics: ValidationMetrics },
    Skipped { usable_rows: usize, required: usize },
    Failed { kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityReport {
    pub entity: EntityKey,
    pub observations: usize,
    pub duplicates_dropped: usize,
    #[serde(flatten)]
    pub status: EntityStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub run_id: String,
    pub trained_at: DateTime<Utc>,
    pub rejected_rows: usize,
    pub entities: Vec<EntityReport>,
    #[serde(skip)]
    pub index: RegistryIndex,
}

impl TrainingReport {
    fn count(&self, pred: impl Fn(&EntityStatus) -> bool) -> usize {
        self.entities.iter().filter(|e| pred(&e.status)).count()
    }

    pub fn trained(&self) -> usize {
        self.count(|s| matches!(s, EntityStatus::Trained { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, EntityStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, EntityStatus::Failed { .. }))
    }

    pub fn status_of(&self, entity: &EntityKey) -> Option<&EntityStatus> {
        self.entities
            .iter()
            .find(|e| e.entity == *entity)
            .map(|e| &e.status)
    }
}

/// Loads raw history, trains every entity independently and commits the
/// successful ones to the registry in a single batch.
pub struct TrainingOrchestrator<'a> {
    source: &'a dyn ObservationSource,
    registry: &'a dyn ModelRegistry,
    settings: TrainingSettings,
}

impl<'a> TrainingOrchestrator<'a> {
    pub fn new(
        source: &'a dyn ObservationSource,
        registry: &'a dyn ModelRegistry,
        settings: TrainingSettings,
    ) -> Self {
        Self {
            source,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    pub fn run(&self) -> Result<TrainingReport> {
        self.settings.features.validate()?;
        self.settings.trainer.params.validate()?;

        let run_id = format!("run-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let trained_at = Utc::now();
        let loaded = self.source.load_all()?;
        let groups: Vec<(EntityKey, Vec<SeriesPoint>)> =
            group_by_entity(loaded.observations).into_iter().collect();
        info!(
            run_id = %run_id,
            entities = groups.len(),
            rejected_rows = loaded.rejected,
            horizon = self.settings.trainer.horizon,
            "training run started"
        );

        let mut results = if self.settings.threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.settings.threads)
                .build()
                .map_err(|e| ForecastError::Config(format!("failed to build thread pool: {e}")))?;
            pool.install(|| self.train_all(groups))
        } else {
            self.train_all(groups)
        };
        results.sort_by(|a, b| a.0.entity.cmp(&b.0.entity));

        let mut entities = Vec::with_capacity(results.len());
        let mut artifacts = Vec::new();
        for (report, artifact) in results {
            entities.push(report);
            artifacts.extend(artifact);
        }

        let index = self.registry.commit(RegistryCommit {
            run_id: run_id.clone(),
            trained_at,
            horizon: self.settings.trainer.horizon,
            features: self.settings.features.clone(),
            artifacts,
        })?;

        let report = TrainingReport {
            run_id,
            trained_at,
            rejected_rows: loaded.rejected,
            entities,
            index,
        };
        info!(
            run_id = %report.run_id,
            trained = report.trained(),
            skipped = report.skipped(),
            failed = report.failed(),
            "training run finished"
        );
        Ok(report)
    }

    fn train_all(
        &self,
        groups: Vec<(EntityKey, Vec<SeriesPoint>)>,
    ) -> Vec<(EntityReport, Option<TrainedArtifact>)> {
        groups
            .into_par_iter()
            .map(|(entity, points)| self.train_one(entity, points))
            .collect()
    }

    fn train_one(
        &self,
        entity: EntityKey,
        points: Vec<SeriesPoint>,
    ) -> (EntityReport, Option<TrainedArtifact>) {
        let observations = points.len();
        let failed = |entity: EntityKey, duplicates_dropped: usize, err: ForecastError| {
            EntityReport {
                entity,
                observations,
                duplicates_dropped,
                status: EntityStatus::Failed {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                },
            }
        };

        let (series, duplicates_dropped) =
            match Series::from_points(entity.clone(), points, self.settings.duplicate_policy) {
                Ok(v) => v,
                Err(err) => {
                    warn!(entity = %entity, error = %err, "entity skipped on bad data");
                    return (failed(entity, 0, err), None);
                }
            };
        if duplicates_dropped > 0 {
            warn!(entity = %entity, duplicates_dropped, "dropped duplicate observations, kept first");
        }

        let matrix = build_feature_matrix(&series, &self.settings.features);
        let model = match train_entity(&entity, &matrix, &self.settings.trainer) {
            Ok(TrainOutcome::Trained(model)) => model,
            Ok(TrainOutcome::Skipped {
                usable_rows,
                required,
            }) => {
                info!(entity = %entity, rows = usable_rows, required, "skipped: insufficient history");
                let report = EntityReport {
                    entity,
                    observations,
                    duplicates_dropped,
                    status: EntityStatus::Skipped {
                        usable_rows,
                        required,
                    },
                };
                return (report, None);
            }
            Err(err) => {
                error!(entity = %entity, error = %err, "model training failed");
                return (failed(entity, duplicates_dropped, err), None);
            }
        };

        let metrics = *model.metrics();
        info!(
            entity = %entity,
            n_train = metrics.n_train,
            n_val = metrics.n_val,
            mae = metrics.mae,
            mape = metrics.mape,
            "trained"
        );

        let preview = if self.settings.write_previews {
            let tail = series.tail(self.settings.preview_tail);
            match recursive_forecast(&model, &tail, self.settings.trainer.horizon) {
                Ok(points) => points,
                Err(err) => {
                    warn!(entity = %entity, error = %err, "preview forecast unavailable");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let report = EntityReport {
            entity,
            observations,
            duplicates_dropped,
            status: EntityStatus::Trained { metrics },
        };
        (report, Some(TrainedArtifact { model, preview }))
    }
}
