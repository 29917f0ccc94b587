use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::features::FeatureConfig;
use crate::gbdt::GbdtParams;
use crate::model::DuplicatePolicy;
use crate::orchestrator::TrainingSettings;
use crate::service::ServingSettings;
use crate::trainer::{TargetMode, TrainerConfig};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub model: GbdtParams,
    #[serde(default)]
    pub serving: ServingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_path: PathBuf,
    /// Relative to `data_path` unless absolute. `.csv` or `.sqlite`.
    pub observations_file: PathBuf,
    pub models_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            observations_file: PathBuf::from("market_prices.csv"),
            models_path: PathBuf::from("models"),
        }
    }
}

impl PathsConfig {
    pub fn observations_path(&self) -> PathBuf {
        self.data_path.join(&self.observations_file)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub horizon: usize,
    pub min_history: usize,
    pub history_floor: usize,
    pub duplicate_policy: DuplicatePolicy,
    pub target: TargetMode,
    pub write_previews: bool,
    pub preview_tail: usize,
    pub threads: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            horizon: 7,
            min_history: 180,
            history_floor: 120,
            duplicate_policy: DuplicatePolicy::KeepFirst,
            target: TargetMode::Level,
            write_previews: true,
            preview_tail: 60,
            threads: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    pub default_horizon: usize,
    /// Unset means no limit beyond `timeout_ms`.
    pub max_horizon: Option<usize>,
    pub tail_window: usize,
    pub timeout_ms: u64,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            default_horizon: 7,
            max_horizon: None,
            tail_window: 60,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Log file; stderr when unset or empty.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Reads `path`, applies `DATA_PATH` / `MODELS_PATH` from the environment
    /// (after loading `.env`) and validates the result.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::parse(&config_str)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATA_PATH") {
            if !v.trim().is_empty() {
                self.paths.data_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("MODELS_PATH") {
            if !v.trim().is_empty() {
                self.paths.models_path = PathBuf::from(v);
            }
        }
    }

    /// Command-line overrides for a training run.
    pub fn with_training_overrides(
        mut self,
        horizon: Option<usize>,
        min_history: Option<usize>,
    ) -> Result<Self> {
        if let Some(h) = horizon {
            self.training.horizon = h;
        }
        if let Some(m) = min_history {
            self.training.min_history = m;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.features.validate().context("invalid [features]")?;
        self.model.validate().context("invalid [model]")?;

        let t = &self.training;
        if t.horizon < 1 {
            bail!("training.horizon must be >= 1");
        }
        if t.min_history < 1 {
            bail!("training.min_history must be >= 1");
        }
        if t.target == TargetMode::Lag1Residual && !self.features.lags.contains(&1) {
            bail!("training.target = \"lag1_residual\" requires lag 1 in features.lags");
        }
        let seed = self.features.seed_requirement();
        if t.write_previews && t.preview_tail < seed {
            bail!(
                "training.preview_tail ({}) is shorter than the {} observations a forecast needs",
                t.preview_tail,
                seed
            );
        }

        let s = &self.serving;
        if s.default_horizon < 1 {
            bail!("serving.default_horizon must be >= 1");
        }
        if let Some(max) = s.max_horizon {
            if max < s.default_horizon {
                bail!(
                    "serving.max_horizon ({}) is below serving.default_horizon ({})",
                    max,
                    s.default_horizon
                );
            }
        }
        if s.tail_window < seed {
            bail!(
                "serving.tail_window ({}) is shorter than the {} observations a forecast needs",
                s.tail_window,
                seed
            );
        }
        if s.timeout_ms == 0 {
            bail!("serving.timeout_ms must be > 0");
        }
        Ok(())
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            horizon: self.training.horizon,
            min_history: self.training.min_history,
            history_floor: self.training.history_floor,
            target: self.training.target,
            params: self.model,
        }
    }

    pub fn training_settings(&self) -> TrainingSettings {
        TrainingSettings {
            features: self.features.clone(),
            trainer: self.trainer_config(),
            duplicate_policy: self.training.duplicate_policy,
            write_previews: self.training.write_previews,
            preview_tail: self.training.preview_tail,
            threads: self.training.threads,
        }
    }

    pub fn serving_settings(&self) -> ServingSettings {
        ServingSettings {
            default_horizon: self.serving.default_horizon,
            max_horizon: self.serving.max_horizon,
            tail_window: self.serving.tail_window,
            timeout_ms: self.serving.timeout_ms,
            duplicate_policy: self.training.duplicate_policy,
        }
    }
}
