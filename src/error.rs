use thiserror::Error;

use crate::model::observation::EntityKey;

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("no trained model for {entity}")]
    EntityUnknown { entity: EntityKey },

    #[error(
        "insufficient recent history for {entity}: {available} observations available, {required} required"
    )]
    InsufficientHistory {
        entity: EntityKey,
        available: usize,
        required: usize,
    },

    #[error("invalid horizon {0}: must be >= 1")]
    InvalidHorizon(i64),

    #[error("horizon {requested} exceeds the configured limit of {max}")]
    HorizonTooLong { requested: usize, max: usize },

    #[error("forecast for {entity} timed out after {timeout_ms} ms")]
    Timeout { entity: EntityKey, timeout_ms: u64 },

    #[error("data error: {0}")]
    Data(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, ForecastError>;

impl ForecastError {
    /// Outcomes a caller is expected to handle as answers rather than faults.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::EntityUnknown { .. }
                | Self::InsufficientHistory { .. }
                | Self::InvalidHorizon(_)
                | Self::HorizonTooLong { .. }
        )
    }

    /// Stable machine-readable tag used in JSON error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EntityUnknown { .. } => "entity_unknown",
            Self::InsufficientHistory { .. } => "insufficient_history",
            Self::InvalidHorizon(_) => "invalid_horizon",
            Self::HorizonTooLong { .. } => "horizon_too_long",
            Self::Timeout { .. } => "timeout",
            Self::Data(_) => "data",
            Self::Model(_) => "model",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Csv(_) => "csv",
            Self::Sqlite(_) => "sqlite",
        }
    }
}
