//! Persisted per-entity models and the index that serving reads.
//!
//! `FileRegistry` keeps one JSON artifact per entity (`market_gbdt_{stem}.json`,
//! the stem ending in a digest of the entity key), an optional forecast
//! preview CSV (`market_preview_{stem}.csv`) and the index `market_meta.json`.
//! A commit writes every artifact first and the index last, through a temp
//! file and a rename, so readers only ever see a complete run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::RunCache;
use crate::error::{ForecastError, Result};
use crate::features::{FeatureConfig, FeatureSchema, RollingSpec};
use crate::model::{EntityKey, ForecastPoint, ValidationMetrics};
use crate::trainer::TrainedEntityModel;

pub const INDEX_FILE: &str = "market_meta.json";
pub const DEFAULT_INDEX_HORIZON: usize = 7;

/// Summary of one trained entity, enough to answer "is this forecastable"
/// without loading the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub crop: String,
    pub state: String,
    /// Artifact location relative to the registry root.
    pub path: String,
    pub feature_schema: FeatureSchema,
    pub n_train: usize,
    pub n_val: usize,
    pub mae: f64,
    pub mape: f64,
    #[serde(default)]
    pub preview: Option<String>,
}

impl RegistryEntry {
    pub fn entity(&self) -> EntityKey {
        EntityKey::new(&self.crop, &self.state)
    }

    pub fn metrics(&self) -> ValidationMetrics {
        ValidationMetrics {
            mae: self.mae,
            mape: self.mape,
            n_train: self.n_train,
            n_val: self.n_val,
        }
    }

    fn describe(model: &TrainedEntityModel, path: String, preview: Option<String>) -> Self {
        let metrics = model.metrics();
        Self {
            crop: model.entity().crop.clone(),
            state: model.entity().state.clone(),
            path,
            feature_schema: model.schema().clone(),
            n_train: metrics.n_train,
            n_val: metrics.n_val,
            mae: metrics.mae,
            mape: metrics.mape,
            preview,
        }
    }
}

fn default_index_horizon() -> usize {
    DEFAULT_INDEX_HORIZON
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryIndex {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub trained_at: Option<DateTime<Utc>>,
    #[serde(default = "default_index_horizon")]
    pub horizon: usize,
    #[serde(default)]
    pub lags: Vec<usize>,
    #[serde(default)]
    pub rolls: Vec<RollingSpec>,
    #[serde(default)]
    pub models: Vec<RegistryEntry>,
}

impl Default for RegistryIndex {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            trained_at: None,
            horizon: DEFAULT_INDEX_HORIZON,
            lags: Vec::new(),
            rolls: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl RegistryIndex {
    /// Case-insensitive on crop and state.
    pub fn find(&self, entity: &EntityKey) -> Option<&RegistryEntry> {
        self.models.iter().find(|e| e.entity() == *entity)
    }

    pub fn entities(&self) -> Vec<EntityKey> {
        self.models.iter().map(RegistryEntry::entity).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// One trained entity as handed to a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedArtifact {
    pub model: TrainedEntityModel,
    /// Empty when previews are disabled or could not be produced.
    pub preview: Vec<ForecastPoint>,
}

/// Everything one training run produced. Replaces the registry wholesale.
#[derive(Debug, Clone)]
pub struct RegistryCommit {
    pub run_id: String,
    pub trained_at: DateTime<Utc>,
    pub horizon: usize,
    pub features: FeatureConfig,
    pub artifacts: Vec<TrainedArtifact>,
}

impl RegistryCommit {
    fn index_with(&self, models: Vec<RegistryEntry>) -> RegistryIndex {
        RegistryIndex {
            run_id: self.run_id.clone(),
            trained_at: Some(self.trained_at),
            horizon: self.horizon,
            lags: self.features.lags.clone(),
            rolls: self.features.rolls.clone(),
            models,
        }
    }
}

pub trait ModelRegistry: Send + Sync {
    /// Current index; an empty index when nothing has been trained yet.
    fn index(&self) -> Result<RegistryIndex>;

    fn load_model(&self, entity: &EntityKey) -> Result<Arc<TrainedEntityModel>>;

    fn commit(&self, commit: RegistryCommit) -> Result<RegistryIndex>;

    /// `EntityUnknown` when the entity has no entry.
    fn lookup(&self, entity: &EntityKey) -> Result<RegistryEntry> {
        self.index()?
            .find(entity)
            .cloned()
            .ok_or_else(|| ForecastError::EntityUnknown {
                entity: entity.clone(),
            })
    }

    fn is_forecastable(&self, entity: &EntityKey) -> Result<bool> {
        Ok(self.index()?.find(entity).is_some())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PreviewRow {
    date: NaiveDate,
    modal_pred: f64,
}

pub fn artifact_file_name(entity: &EntityKey) -> String {
    format!("market_gbdt_{}.json", entity.file_stem())
}

pub fn preview_file_name(entity: &EntityKey) -> String {
    format!("market_preview_{}.csv", entity.file_stem())
}

pub fn write_preview_csv(path: &Path, points: &[ForecastPoint]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for p in points {
        writer.serialize(PreviewRow {
            date: p.date,
            modal_pred: p.value,
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_preview_csv(path: &Path) -> Result<Vec<ForecastPoint>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut points = Vec::new();
    for row in reader.deserialize::<PreviewRow>() {
        let row = row?;
        points.push(ForecastPoint {
            date: row.date,
            value: row.modal_pred,
        });
    }
    Ok(points)
}

/// Two entities in one commit must never share an artifact file.
fn ensure_distinct_artifacts(artifacts: &[TrainedArtifact]) -> Result<()> {
    let mut seen: HashMap<String, &EntityKey> = HashMap::with_capacity(artifacts.len());
    for artifact in artifacts {
        let entity = artifact.model.entity();
        if let Some(other) = seen.insert(artifact_file_name(entity), entity) {
            return Err(ForecastError::Model(format!(
                "{} and {} map to the same artifact file",
                other, entity
            )));
        }
    }
    Ok(())
}

/// Registry rooted at a models directory.
#[derive(Debug)]
pub struct FileRegistry {
    root: PathBuf,
    loaded: RunCache<EntityKey, Arc<TrainedEntityModel>>,
}

impl FileRegistry {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: RunCache::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn load_preview(&self, entity: &EntityKey) -> Result<Vec<ForecastPoint>> {
        let entry = self.lookup(entity)?;
        match entry.preview {
            Some(file) => read_preview_csv(&self.root.join(file)),
            None => Ok(Vec::new()),
        }
    }

    fn read_model(&self, entry: &RegistryEntry) -> Result<TrainedEntityModel> {
        let path = self.root.join(&entry.path);
        let payload = std::fs::read_to_string(&path)?;
        let model: TrainedEntityModel = serde_json::from_str(&payload)?;
        if *model.entity() != entry.entity() {
            return Err(ForecastError::Model(format!(
                "artifact {} holds the model for {}, not {}",
                path.display(),
                model.entity(),
                entry.entity()
            )));
        }
        if model.schema() != &entry.feature_schema {
            return Err(ForecastError::Model(format!(
                "artifact {} does not match the feature schema in the index",
                path.display()
            )));
        }
        Ok(model)
    }

    fn write_json_atomically<T: Serialize>(&self, file_name: &str, value: &T) -> Result<()> {
        let target = self.root.join(file_name);
        let tmp = self.root.join(format!("{file_name}.tmp"));
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }
}

impl ModelRegistry for FileRegistry {
    fn index(&self) -> Result<RegistryIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(RegistryIndex::default());
        }
        let payload = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&payload)?)
    }

    fn load_model(&self, entity: &EntityKey) -> Result<Arc<TrainedEntityModel>> {
        let index = self.index()?;
        let entry = index
            .find(entity)
            .ok_or_else(|| ForecastError::EntityUnknown {
                entity: entity.clone(),
            })?;
        self.loaded
            .get_or_try_insert_with(&index.run_id, entry.entity(), || {
                debug!(entity = %entity, path = %entry.path, "loading model artifact");
                self.read_model(entry).map(Arc::new)
            })
    }

    fn commit(&self, commit: RegistryCommit) -> Result<RegistryIndex> {
        std::fs::create_dir_all(&self.root)?;
        ensure_distinct_artifacts(&commit.artifacts)?;

        let mut entries = Vec::with_capacity(commit.artifacts.len());
        for artifact in &commit.artifacts {
            let entity = artifact.model.entity();
            let path = artifact_file_name(entity);
            self.write_json_atomically(&path, &artifact.model)?;

            let preview = if artifact.preview.is_empty() {
                None
            } else {
                let file = preview_file_name(entity);
                write_preview_csv(&self.root.join(&file), &artifact.preview)?;
                Some(file)
            };
            entries.push(RegistryEntry::describe(&artifact.model, path, preview));
        }

        let index = commit.index_with(entries);
        self.write_json_atomically(INDEX_FILE, &index)?;
        self.loaded.invalidate()?;
        info!(
            run_id = %index.run_id,
            models = index.len(),
            root = %self.root.display(),
            "registry committed"
        );
        Ok(index)
    }
}

/// Registry held entirely in memory; used by tests and embedders that train
/// and serve in one process.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    index: RegistryIndex,
    models: HashMap<EntityKey, Arc<TrainedEntityModel>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelRegistry for InMemoryRegistry {
    fn index(&self) -> Result<RegistryIndex> {
        let guard = self
            .state
            .read()
            .map_err(|_| ForecastError::Model("registry lock poisoned".to_string()))?;
        Ok(guard.index.clone())
    }

    fn load_model(&self, entity: &EntityKey) -> Result<Arc<TrainedEntityModel>> {
        let guard = self
            .state
            .read()
            .map_err(|_| ForecastError::Model("registry lock poisoned".to_string()))?;
        guard
            .models
            .get(entity)
            .cloned()
            .ok_or_else(|| ForecastError::EntityUnknown {
                entity: entity.clone(),
            })
    }

    fn commit(&self, commit: RegistryCommit) -> Result<RegistryIndex> {
        let mut entries = Vec::with_capacity(commit.artifacts.len());
        let mut models = HashMap::with_capacity(commit.artifacts.len());
        for artifact in &commit.artifacts {
            let entity = artifact.model.entity().clone();
            let preview = (!artifact.preview.is_empty()).then(|| preview_file_name(&entity));
            entries.push(RegistryEntry::describe(
                &artifact.model,
                artifact_file_name(&entity),
                preview,
            ));
            models.insert(entity, Arc::new(artifact.model.clone()));
        }
        let index = commit.index_with(entries);
        let mut guard = self
            .state
            .write()
            .map_err(|_| ForecastError::Model("registry lock poisoned".to_string()))?;
        *guard = MemoryState {
            index: index.clone(),
            models,
        };
        Ok(index)
    }
}
