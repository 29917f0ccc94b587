use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ForecastError, Result};
use crate::features::{FeatureColumn, FeatureMatrix, FeatureRow, FeatureSchema};
use crate::gbdt::{GbdtParams, GbdtRegressor};
use crate::model::forecast::{mean_absolute_error, mean_absolute_percentage_error};
use crate::model::{EntityKey, ValidationMetrics};

/// Smallest trailing validation window regardless of horizon.
pub const MIN_VALIDATION_WINDOW: usize = 28;

/// What the regressor is fitted against. Trees predict within the range of
/// their training targets, so `Level` flattens out on a trend that leaves it;
/// `Lag1Residual` follows such a trend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// The observed value itself.
    #[default]
    Level,
    /// The change from `lag_1`; predictions add `lag_1` back.
    Lag1Residual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub horizon: usize,
    pub min_history: usize,
    pub history_floor: usize,
    pub target: TargetMode,
    pub params: GbdtParams,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            horizon: 7,
            min_history: 180,
            history_floor: 120,
            target: TargetMode::Level,
            params: GbdtParams::default(),
        }
    }
}

impl TrainerConfig {
    pub fn validation_window(&self) -> usize {
        (4 * self.horizon).max(MIN_VALIDATION_WINDOW)
    }

    /// Usable rows an entity needs before it is trained at all.
    pub fn required_rows(&self) -> usize {
        self.min_history
            .max(self.history_floor)
            .max(self.validation_window() + 1)
    }
}

/// Fitted regressor, the schema it was fitted on and its hold-out metrics.
/// Never mutated after training; a retrain produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedEntityModel {
    entity: EntityKey,
    schema: FeatureSchema,
    target: TargetMode,
    regressor: GbdtRegressor,
    metrics: ValidationMetrics,
}

impl TrainedEntityModel {
    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn target(&self) -> TargetMode {
        self.target
    }

    pub fn metrics(&self) -> &ValidationMetrics {
        &self.metrics
    }

    pub fn regressor(&self) -> &GbdtRegressor {
        &self.regressor
    }

    /// Predicts one value from a feature vector in schema order.
    pub fn predict(&self, features: &[f64]) -> Result<f64> {
        if features.len() != self.schema.len() {
            return Err(ForecastError::Model(format!(
                "{}: feature vector has {} values, schema has {}",
                self.entity,
                features.len(),
                self.schema.len()
            )));
        }
        let raw = self.regressor.predict(features)?;
        match self.target {
            TargetMode::Level => Ok(raw),
            TargetMode::Lag1Residual => Ok(lag1_value(&self.schema, features)? + raw),
        }
    }
}

fn lag1_index(schema: &FeatureSchema) -> Result<usize> {
    schema
        .index_of(&FeatureColumn::Lag(1).name())
        .ok_or_else(|| ForecastError::Model("lag1_residual target requires a lag_1 column".into()))
}

fn lag1_value(schema: &FeatureSchema, features: &[f64]) -> Result<f64> {
    let idx = lag1_index(schema)?;
    features
        .get(idx)
        .copied()
        .ok_or_else(|| ForecastError::Model("lag_1 index out of range".into()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    Trained(TrainedEntityModel),
    /// Not enough usable rows; a policy decision, not a failure.
    Skipped { usable_rows: usize, required: usize },
}

/// Fits one entity's model with a strict time split: the trailing
/// `validation_window()` rows are held out, everything before them trains.
pub fn train_entity(
    entity: &EntityKey,
    matrix: &FeatureMatrix,
    config: &TrainerConfig,
) -> Result<TrainOutcome> {
    let usable_rows = matrix.len();
    let required = config.required_rows();
    if usable_rows < required {
        return Ok(TrainOutcome::Skipped {
            usable_rows,
            required,
        });
    }

    let n_val = config.validation_window();
    let n_train = usable_rows - n_val;
    let (train, val) = matrix.rows.split_at(n_train);

    let lag1 = match config.target {
        TargetMode::Level => None,
        TargetMode::Lag1Residual => Some(lag1_index(&matrix.schema)?),
    };
    let fit_target = |row: &FeatureRow| match lag1 {
        Some(idx) => row.target - row.features[idx],
        None => row.target,
    };

    let x_train: Vec<Vec<f64>> = train.iter().map(|r| r.features.clone()).collect();
    let y_train: Vec<f64> = train.iter().map(fit_target).collect();
    let regressor = GbdtRegressor::fit(&x_train, &y_train, &config.params)?;

    let mut model = TrainedEntityModel {
        entity: entity.clone(),
        schema: matrix.schema.clone(),
        target: config.target,
        regressor,
        metrics: ValidationMetrics {
            mae: 0.0,
            mape: 0.0,
            n_train,
            n_val,
        },
    };

    let actual: Vec<f64> = val.iter().map(|r| r.target).collect();
    let predicted = val
        .iter()
        .map(|r| model.predict(&r.features))
        .collect::<Result<Vec<f64>>>()?;
    model.metrics.mae = mean_absolute_error(&actual, &predicted);
    model.metrics.mape = mean_absolute_percentage_error(&actual, &predicted);

    debug!(
        entity = %entity,
        n_train,
        n_val,
        mae = model.metrics.mae,
        mape = model.metrics.mape,
        "entity model fitted"
    );
    Ok(TrainOutcome::Trained(model))
}
