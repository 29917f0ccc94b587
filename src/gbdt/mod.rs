//! Gradient-boosted regression trees with a squared-error objective.
//!
//! Second-order leaf weights `-G / (H + lambda)`, exact greedy splits,
//! per-tree row subsampling and column subsampling drawn from a seeded
//! `StdRng`, so a fit is reproducible for the same data and parameters.

pub mod tree;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

pub use tree::{Node, RegressionTree};
use tree::{fit_tree, TrainingData, TreeGrowth};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbdtParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub subsample: f64,
    pub colsample_bytree: f64,
    pub reg_lambda: f64,
    pub min_child_weight: f64,
    pub seed: u64,
}

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            n_estimators: 600,
            learning_rate: 0.05,
            max_depth: 6,
            subsample: 0.9,
            colsample_bytree: 0.9,
            reg_lambda: 2.0,
            min_child_weight: 1.0,
            seed: 42,
        }
    }
}

impl GbdtParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_estimators == 0 {
            return Err(ForecastError::Config("model.n_estimators must be >= 1".to_string()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(ForecastError::Config(
                "model.learning_rate must be in (0, 1]".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(ForecastError::Config("model.max_depth must be >= 1".to_string()));
        }
        for (name, v) in [
            ("subsample", self.subsample),
            ("colsample_bytree", self.colsample_bytree),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                return Err(ForecastError::Config(format!("model.{name} must be in (0, 1]")));
            }
        }
        if self.reg_lambda < 0.0 || self.min_child_weight < 0.0 {
            return Err(ForecastError::Config(
                "model.reg_lambda and model.min_child_weight must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbdtRegressor {
    n_features: usize,
    base_score: f64,
    trees: Vec<RegressionTree>,
}

impl GbdtRegressor {
    pub fn fit(rows: &[Vec<f64>], targets: &[f64], params: &GbdtParams) -> Result<Self> {
        params.validate()?;
        if rows.is_empty() {
            return Err(ForecastError::Model("cannot fit on zero rows".to_string()));
        }
        if rows.len() != targets.len() {
            return Err(ForecastError::Model(format!(
                "feature rows ({}) and targets ({}) differ in length",
                rows.len(),
                targets.len()
            )));
        }
        let n_features = rows[0].len();
        if n_features == 0 || rows.iter().any(|r| r.len() != n_features) {
            return Err(ForecastError::Model(
                "feature rows must share one non-zero width".to_string(),
            ));
        }
        if rows.iter().flatten().chain(targets).any(|v| !v.is_finite()) {
            return Err(ForecastError::Model(
                "training data contains non-finite values".to_string(),
            ));
        }

        let n = rows.len();
        let base_score = targets.iter().sum::<f64>() / n as f64;
        let data = TrainingData::new(rows, n_features);
        let growth = TreeGrowth {
            max_depth: params.max_depth,
            reg_lambda: params.reg_lambda,
            min_child_weight: params.min_child_weight,
            learning_rate: params.learning_rate,
        };
        let n_cols = ((params.colsample_bytree * n_features as f64).ceil() as usize)
            .clamp(1, n_features);

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut predictions = vec![base_score; n];
        let hess = vec![1.0; n];
        let mut all_features: Vec<usize> = (0..n_features).collect();
        let mut trees = Vec::with_capacity(params.n_estimators);

        for _ in 0..params.n_estimators {
            let grad: Vec<f64> = predictions
                .iter()
                .zip(targets)
                .map(|(p, y)| p - y)
                .collect();
            let mut in_sample: Vec<bool> = (0..n)
                .map(|_| params.subsample >= 1.0 || rng.gen::<f64>() < params.subsample)
                .collect();
            if !in_sample.iter().any(|s| *s) {
                in_sample[rng.gen_range(0..n)] = true;
            }
            all_features.shuffle(&mut rng);
            let mut features = all_features[..n_cols].to_vec();
            features.sort_unstable();

            let tree = fit_tree(&data, &grad, &hess, &in_sample, &features, &growth);
            for (i, p) in predictions.iter_mut().enumerate() {
                *p += tree.predict(data.row(i));
            }
            trees.push(tree);
        }

        Ok(Self {
            n_features,
            base_score,
            trees,
        })
    }

    pub fn predict(&self, features: &[f64]) -> Result<f64> {
        if features.len() != self.n_features {
            return Err(ForecastError::Model(format!(
                "expected {} features, got {}",
                self.n_features,
                features.len()
            )));
        }
        let value = self.base_score + self.trees.iter().map(|t| t.predict(features)).sum::<f64>();
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ForecastError::Model("prediction is not finite".to_string()))
        }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn base_score(&self) -> f64 {
        self.base_score
    }
}
