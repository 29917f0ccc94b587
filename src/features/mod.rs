//! Supervised-learning rows from a chronologically ordered series.
//!
//! Every row carries the calendar fields of its own date, positional lags
//! (`lag_k` is the k-th prior observation, not the value k calendar days
//! earlier) and rolling statistics over the observations strictly before it.
//! Positions without a full feature vector are dropped.

pub mod calendar;
pub mod rolling;

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::model::Series;

pub use calendar::{CalendarField, TimeFeatures};
pub use rolling::{RollingSpec, RollingStat, RollingWindow};

pub const DEFAULT_LAGS: [usize; 7] = [1, 2, 3, 7, 14, 21, 28];
pub const DEFAULT_ROLLS: [RollingSpec; 5] = [
    RollingSpec::new(7, RollingStat::Mean),
    RollingSpec::new(14, RollingStat::Mean),
    RollingSpec::new(28, RollingStat::Mean),
    RollingSpec::new(7, RollingStat::Std),
    RollingSpec::new(14, RollingStat::Std),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_lags")]
    pub lags: Vec<usize>,
    #[serde(default = "default_rolls")]
    pub rolls: Vec<RollingSpec>,
}

fn default_lags() -> Vec<usize> {
    DEFAULT_LAGS.to_vec()
}

fn default_rolls() -> Vec<RollingSpec> {
    DEFAULT_ROLLS.to_vec()
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lags: default_lags(),
            rolls: default_rolls(),
        }
    }
}

impl FeatureConfig {
    pub fn new(lags: Vec<usize>, rolls: Vec<RollingSpec>) -> Self {
        Self { lags, rolls }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lags.is_empty() && self.rolls.is_empty() {
            return Err(ForecastError::Config(
                "at least one lag or rolling feature is required".to_string(),
            ));
        }
        let mut seen_lags = HashSet::new();
        for &lag in &self.lags {
            if lag == 0 {
                return Err(ForecastError::Config("lag offsets must be >= 1".to_string()));
            }
            if !seen_lags.insert(lag) {
                return Err(ForecastError::Config(format!("duplicate lag offset {lag}")));
            }
        }
        let mut seen_rolls = HashSet::new();
        for spec in &self.rolls {
            if spec.window < spec.stat.min_window() {
                return Err(ForecastError::Config(format!(
                    "{} needs a window of at least {}",
                    spec,
                    spec.stat.min_window()
                )));
            }
            if !seen_rolls.insert(*spec) {
                return Err(ForecastError::Config(format!("duplicate rolling feature {spec}")));
            }
        }
        Ok(())
    }

    pub fn max_lag(&self) -> usize {
        self.lags.iter().copied().max().unwrap_or(0)
    }

    pub fn max_window(&self) -> usize {
        self.rolls.iter().map(|r| r.window).max().unwrap_or(0)
    }

    /// Leading positions that can never produce a complete row.
    pub fn warmup(&self) -> usize {
        self.max_lag().max(self.max_window())
    }

    /// Real observations a rollout needs before its first step.
    pub fn seed_requirement(&self) -> usize {
        self.max_lag() + self.max_window()
    }

    /// Calendar fields, then lags, then rolling statistics, each in
    /// configuration order.
    pub fn columns(&self) -> Vec<FeatureColumn> {
        CalendarField::ALL
            .into_iter()
            .map(FeatureColumn::Calendar)
            .chain(self.lags.iter().map(|&k| FeatureColumn::Lag(k)))
            .chain(self.rolls.iter().map(|&s| FeatureColumn::Rolling(s)))
            .collect()
    }

    pub fn schema(&self) -> FeatureSchema {
        FeatureSchema::from_columns(&self.columns())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureColumn {
    Calendar(CalendarField),
    Lag(usize),
    Rolling(RollingSpec),
}

impl FeatureColumn {
    pub fn name(&self) -> String {
        match self {
            Self::Calendar(field) => field.column_name().to_string(),
            Self::Lag(k) => format!("lag_{k}"),
            Self::Rolling(spec) => spec.column_name(),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        if let Some(field) = CalendarField::from_column_name(name) {
            return Some(Self::Calendar(field));
        }
        if let Some(k) = name.strip_prefix("lag_") {
            return k.parse().ok().filter(|k| *k > 0).map(Self::Lag);
        }
        RollingSpec::from_column_name(name).map(Self::Rolling)
    }
}

impl fmt::Display for FeatureColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Ordered feature-column names. Order is part of a trained model's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSchema(Vec<String>);

impl FeatureSchema {
    pub fn from_columns(columns: &[FeatureColumn]) -> Self {
        Self(columns.iter().map(FeatureColumn::name).collect())
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|c| c == name)
    }

    pub fn columns(&self) -> Result<Vec<FeatureColumn>> {
        self.0
            .iter()
            .map(|name| {
                FeatureColumn::parse(name).ok_or_else(|| {
                    ForecastError::Model(format!("unknown feature column '{name}' in schema"))
                })
            })
            .collect()
    }

    pub fn seed_requirement(&self) -> Result<usize> {
        let columns = self.columns()?;
        let max_lag = columns
            .iter()
            .filter_map(|c| match c {
                FeatureColumn::Lag(k) => Some(*k),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let max_window = columns
            .iter()
            .filter_map(|c| match c {
                FeatureColumn::Rolling(spec) => Some(spec.window),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        Ok(max_lag + max_window)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub date: NaiveDate,
    pub target: f64,
    /// Values in schema order.
    pub features: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

impl FeatureMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn targets(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.target).collect()
    }

    pub fn feature_rows(&self) -> Vec<Vec<f64>> {
        self.rows.iter().map(|r| r.features.clone()).collect()
    }
}

/// Builds the feature vector for `date` in `columns` order. `lag(k)` supplies
/// the k-th lag, `window(w)` a trailing window of `w` values ending before
/// `date`. Returns the first column that could not be filled.
pub fn assemble_features<'a, L, W>(
    columns: &[FeatureColumn],
    date: NaiveDate,
    lag: L,
    window: W,
) -> std::result::Result<Vec<f64>, FeatureColumn>
where
    L: Fn(usize) -> Option<f64>,
    W: Fn(usize) -> Option<&'a RollingWindow>,
{
    let calendar = TimeFeatures::from_date(date);
    columns
        .iter()
        .map(|column| {
            let value = match column {
                FeatureColumn::Calendar(field) => Some(calendar.value(*field)),
                FeatureColumn::Lag(k) => lag(*k),
                FeatureColumn::Rolling(spec) => window(spec.window).and_then(|w| spec.evaluate(w)),
            };
            value.filter(|v| v.is_finite()).ok_or(*column)
        })
        .collect()
}

pub fn build_feature_matrix(series: &Series, config: &FeatureConfig) -> FeatureMatrix {
    let columns = config.columns();
    let schema = FeatureSchema::from_columns(&columns);
    let values = series.values();
    let warmup = config.warmup();

    // Windows only ever hold values strictly before the row being built.
    let mut windows: BTreeMap<usize, RollingWindow> = config
        .rolls
        .iter()
        .map(|spec| (spec.window, RollingWindow::new(spec.window)))
        .collect();

    let mut rows = Vec::with_capacity(values.len().saturating_sub(warmup));
    for (t, point) in series.points().iter().enumerate() {
        if t >= warmup {
            let features = assemble_features(
                &columns,
                point.date,
                |k| t.checked_sub(k).map(|i| values[i]),
                |w| windows.get(&w),
            );
            if let Ok(features) = features {
                rows.push(FeatureRow {
                    date: point.date,
                    target: point.value,
                    features,
                });
            }
        }
        for window in windows.values_mut() {
            window.push(point.value);
        }
    }

    FeatureMatrix { schema, rows }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schema_order() {
        let names = FeatureConfig::default().schema().names().to_vec();
        assert_eq!(
            names,
            vec![
                "doy", "dow", "week", "month", "lag_1", "lag_2", "lag_3", "lag_7", "lag_14",
                "lag_21", "lag_28", "roll7_mean", "roll14_mean", "roll28_mean", "roll7_std",
                "roll14_std",
            ]
        );
    }

    #[test]
    fn seed_requirement_from_schema_matches_config() {
        let config = FeatureConfig::default();
        assert_eq!(config.seed_requirement(), 56);
        assert_eq!(config.schema().seed_requirement().unwrap(), 56);
        assert_eq!(config.warmup(), 28);
    }

    #[test]
    fn validate_rejects_bad_configs() {
        assert!(FeatureConfig::new(vec![], vec![]).validate().is_err());
        assert!(FeatureConfig::new(vec![0], vec![]).validate().is_err());
        assert!(FeatureConfig::new(vec![1, 1], vec![]).validate().is_err());
        assert!(FeatureConfig::new(vec![1], vec![RollingSpec::new(1, RollingStat::Std)])
            .validate()
            .is_err());
        assert!(FeatureConfig::default().validate().is_ok());
    }

    #[test]
    fn unknown_schema_column_is_a_model_error() {
        let schema: FeatureSchema = serde_json::from_str(r#"["doy","lag_1","ema_3"]"#).unwrap();
        assert!(matches!(schema.columns(), Err(ForecastError::Model(_))));
    }

    #[test]
    fn rolling_config_parses_from_toml() {
        let config: FeatureConfig = toml::from_str(
            r#"
lags = [1, 7]
rolls = [{ window = 7, stat = "mean" }, { window = 14, stat = "std" }]
"#,
        )
        .unwrap();
        assert_eq!(config.lags, vec![1, 7]);
        assert_eq!(config.rolls[1], RollingSpec::new(14, RollingStat::Std));
    }
}
