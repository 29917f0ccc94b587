use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::RunCache;
use crate::error::{ForecastError, Result};
use crate::forecaster::{recursive_forecast_until, Deadline};
use crate::model::{DuplicatePolicy, EntityKey, ForecastResponse, Series, SeriesPoint, ValidationMetrics};
use crate::registry::ModelRegistry;
use crate::source::ObservationSource;

#[derive(Debug, Clone, PartialEq)]
pub struct ServingSettings {
    pub default_horizon: usize,
    /// Optional operator limit; unbounded when `None`, leaving `timeout_ms`
    /// to bound long rollouts.
    pub max_horizon: Option<usize>,
    /// Most recent real observations loaded to seed a rollout.
    pub tail_window: usize,
    pub timeout_ms: u64,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for ServingSettings {
    fn default() -> Self {
        Self {
            default_horizon: 7,
            max_horizon: None,
            tail_window: 60,
            timeout_ms: 2_000,
            duplicate_policy: DuplicatePolicy::KeepFirst,
        }
    }
}

/// Answers forecast queries from a registry and a source of recent history.
/// Read-only against both; every rollout works on its own copy of the data.
pub struct ForecastService {
    registry: Arc<dyn ModelRegistry>,
    source: Arc<dyn ObservationSource>,
    settings: ServingSettings,
    latest: RunCache<EntityKey, Option<SeriesPoint>>,
}

impl ForecastService {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        source: Arc<dyn ObservationSource>,
        settings: ServingSettings,
    ) -> Self {
        Self {
            registry,
            source,
            settings,
            latest: RunCache::new(),
        }
    }

    pub fn settings(&self) -> &ServingSettings {
        &self.settings
    }

    pub fn validate_horizon(&self, horizon: i64) -> Result<usize> {
        let h = match usize::try_from(horizon) {
            Ok(h) if h >= 1 => h,
            _ => return Err(ForecastError::InvalidHorizon(horizon)),
        };
        match self.settings.max_horizon {
            Some(max) if h > max => Err(ForecastError::HorizonTooLong { requested: h, max }),
            _ => Ok(h),
        }
    }

    pub fn is_forecastable(&self, entity: &EntityKey) -> Result<bool> {
        self.registry.is_forecastable(entity)
    }

    pub fn metrics(&self, entity: &EntityKey) -> Result<ValidationMetrics> {
        Ok(self.registry.lookup(entity)?.metrics())
    }

    pub fn forecast(&self, entity: &EntityKey, horizon: Option<i64>) -> Result<ForecastResponse> {
        self.forecast_with_deadline(entity, horizon, None)
    }

    pub fn forecast_with_deadline(
        &self,
        entity: &EntityKey,
        horizon: Option<i64>,
        deadline: Option<Deadline>,
    ) -> Result<ForecastResponse> {
        let default_horizon = i64::try_from(self.settings.default_horizon).unwrap_or(i64::MAX);
        let horizon = self.validate_horizon(horizon.unwrap_or(default_horizon))?;
        let entry = self.registry.lookup(entity)?;
        let model = self.registry.load_model(entity)?;
        let history = self.recent_history(entity)?;
        debug!(entity = %entity, horizon, history = history.len(), "forecast requested");

        let forecast = recursive_forecast_until(&model, &history, horizon, deadline)?;
        Ok(ForecastResponse {
            crop: entry.crop.clone(),
            state: entry.state.clone(),
            horizon,
            forecast,
            metrics: entry.metrics(),
        })
    }

    /// Runs the rollout on the blocking pool, bounded by `timeout_ms`. The
    /// rollout also checks the same deadline between steps so an abandoned
    /// task stops early.
    pub async fn forecast_with_timeout(
        self: Arc<Self>,
        entity: EntityKey,
        horizon: Option<i64>,
    ) -> Result<ForecastResponse> {
        let budget = Duration::from_millis(self.settings.timeout_ms);
        let deadline = Deadline::after(budget);
        let service = Arc::clone(&self);
        let task_entity = entity.clone();
        let task = tokio::task::spawn_blocking(move || {
            service.forecast_with_deadline(&task_entity, horizon, Some(deadline))
        });
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ForecastError::Model(format!(
                "forecast task for {entity} failed: {join_err}"
            ))),
            Err(_) => {
                warn!(entity = %entity, timeout_ms = self.settings.timeout_ms, "forecast timed out");
                Err(ForecastError::Timeout {
                    entity,
                    timeout_ms: self.settings.timeout_ms,
                })
            }
        }
    }

    /// Most recent real observation, memoized until the registry's run changes.
    pub fn latest_price(&self, entity: &EntityKey) -> Result<Option<SeriesPoint>> {
        let run_id = self.registry.index()?.run_id;
        self.latest
            .get_or_try_insert_with(&run_id, entity.clone(), || {
                Ok(self.recent_history(entity)?.last())
            })
    }

    fn recent_history(&self, entity: &EntityKey) -> Result<Series> {
        let observations = self.source.load_entity(entity)?;
        let (series, dropped) =
            Series::from_observations(entity.clone(), &observations, self.settings.duplicate_policy)?;
        if dropped > 0 {
            warn!(entity = %entity, dropped, "duplicate observations in recent history");
        }
        Ok(series.tail(self.settings.tail_window))
    }
}
