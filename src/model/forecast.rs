use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Hold-out accuracy recorded when an entity model is trained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub mae: f64,
    /// Fraction, not percent (0.05 == 5%).
    pub mape: f64,
    pub n_train: usize,
    pub n_val: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResponse {
    pub crop: String,
    pub state: String,
    pub horizon: usize,
    pub forecast: Vec<ForecastPoint>,
    pub metrics: ValidationMetrics,
}

/// Floor applied to predictions before computing percentage error.
pub const MAPE_PREDICTION_FLOOR: f64 = 1e-6;

pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p).abs())
        .sum();
    sum / n as f64
}

/// Mean of `|a - max(p, floor)| / max(|a|, eps)`.
pub fn mean_absolute_percentage_error(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| {
            let p = p.max(MAPE_PREDICTION_FLOOR);
            (a - p).abs() / a.abs().max(f64::EPSILON)
        })
        .sum();
    sum / n as f64
}
