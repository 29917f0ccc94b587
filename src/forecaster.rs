//! Recursive multi-step forecasting.
//!
//! Each step predicts one day past the previous one. Lags for a target date
//! `d` are read at calendar date `d - k`; rolling statistics use the most
//! recent `w` values strictly before `d`. Both come from a [`WorkingSeries`]
//! that blends real observations with the forecasts already produced in this
//! rollout. A rollout owns its working series and never touches the caller's
//! history.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};

use crate::error::{ForecastError, Result};
use crate::features::{assemble_features, FeatureColumn, RollingWindow};
use crate::model::{EntityKey, ForecastPoint, Series};
use crate::trainer::TrainedEntityModel;

/// Real history plus the predictions made so far. Real values always win
/// over predictions for the same date.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingSeries {
    real: BTreeMap<NaiveDate, f64>,
    forecast: BTreeMap<NaiveDate, f64>,
    last_known: NaiveDate,
}

impl WorkingSeries {
    /// `None` for an empty series.
    pub fn from_series(series: &Series) -> Option<Self> {
        let last = series.last()?;
        let real = series.points().iter().map(|p| (p.date, p.value)).collect();
        Some(Self {
            real,
            forecast: BTreeMap::new(),
            last_known: last.date,
        })
    }

    /// Date of the most recent real observation.
    pub fn last_known(&self) -> NaiveDate {
        self.last_known
    }

    pub fn value_at(&self, date: NaiveDate) -> Option<f64> {
        self.real
            .get(&date)
            .or_else(|| self.forecast.get(&date))
            .copied()
    }

    /// The `count` most recent blended values dated before `before`, oldest
    /// first. `None` when fewer than `count` exist.
    pub fn trailing(&self, before: NaiveDate, count: usize) -> Option<Vec<f64>> {
        let mut real = self.real.range(..before).rev().peekable();
        let mut forecast = self.forecast.range(..before).rev().peekable();
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let real_date = real.peek().map(|(d, _)| **d);
            let forecast_date = forecast.peek().map(|(d, _)| **d);
            let next = match (real_date, forecast_date) {
                (Some(r), Some(f)) if f > r => forecast.next(),
                (Some(r), Some(f)) => {
                    if f == r {
                        forecast.next();
                    }
                    real.next()
                }
                (Some(_), None) => real.next(),
                (None, Some(_)) => forecast.next(),
                (None, None) => None,
            };
            match next {
                Some((_, v)) => out.push(*v),
                None => break,
            }
        }
        if out.len() < count {
            return None;
        }
        out.reverse();
        Some(out)
    }

    /// Returns the series with `value` recorded as the forecast for `date`.
    /// A real observation at `date` is kept and the forecast is ignored.
    pub fn with_forecast(mut self, date: NaiveDate, value: f64) -> Self {
        if !self.real.contains_key(&date) {
            self.forecast.insert(date, value);
        }
        self
    }

    pub fn real_len(&self) -> usize {
        self.real.len()
    }

    pub fn forecast_len(&self) -> usize {
        self.forecast.len()
    }
}

/// Wall-clock budget checked between rollout steps.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn budget_ms(&self) -> u64 {
        u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX)
    }
}

pub fn recursive_forecast(
    model: &TrainedEntityModel,
    history: &Series,
    horizon: usize,
) -> Result<Vec<ForecastPoint>> {
    recursive_forecast_until(model, history, horizon, None)
}

/// Like [`recursive_forecast`], failing with `Timeout` once `deadline` passes.
pub fn recursive_forecast_until(
    model: &TrainedEntityModel,
    history: &Series,
    horizon: usize,
    deadline: Option<Deadline>,
) -> Result<Vec<ForecastPoint>> {
    if horizon == 0 {
        return Err(ForecastError::InvalidHorizon(0));
    }
    let entity = history.entity().clone();
    let columns = model.schema().columns()?;
    let required = model.schema().seed_requirement()?.max(1);
    if history.len() < required {
        return Err(ForecastError::InsufficientHistory {
            entity,
            available: history.len(),
            required,
        });
    }
    let Some(mut working) = WorkingSeries::from_series(history) else {
        return Err(ForecastError::InsufficientHistory {
            entity,
            available: 0,
            required,
        });
    };

    let windows: BTreeSet<usize> = columns
        .iter()
        .filter_map(|c| match c {
            FeatureColumn::Rolling(spec) => Some(spec.window),
            _ => None,
        })
        .collect();

    let last_known = working.last_known();
    let mut points = Vec::with_capacity(horizon);
    for h in 1..=horizon {
        if let Some(deadline) = deadline {
            if deadline.expired() {
                return Err(ForecastError::Timeout {
                    entity,
                    timeout_ms: deadline.budget_ms(),
                });
            }
        }
        let date = last_known
            .checked_add_days(Days::new(h as u64))
            .ok_or_else(|| ForecastError::Data(format!("forecast date overflow at step {h}")))?;

        let rolling: BTreeMap<usize, RollingWindow> = windows
            .iter()
            .filter_map(|&w| {
                working
                    .trailing(date, w)
                    .map(|values| (w, RollingWindow::from_values(w, &values)))
            })
            .collect();
        let features = assemble_features(
            &columns,
            date,
            |k| {
                date.checked_sub_days(Days::new(k as u64))
                    .and_then(|d| working.value_at(d))
            },
            |w| rolling.get(&w),
        )
        .map_err(|column| {
            tracing::debug!(entity = %entity, %date, %column, "seeding window cannot back column");
            seeding_gap(&entity, history, last_known, required)
        })?;

        let value = model.predict(&features)?;
        working = working.with_forecast(date, value);
        points.push(ForecastPoint { date, value });
    }
    Ok(points)
}

/// A gap in the seeding window: count the real observations inside the
/// `required` calendar days ending at `last_known`.
fn seeding_gap(
    entity: &EntityKey,
    history: &Series,
    last_known: NaiveDate,
    required: usize,
) -> ForecastError {
    let start = last_known
        .checked_sub_days(Days::new(required as u64))
        .unwrap_or(NaiveDate::MIN);
    let available = history
        .points()
        .iter()
        .filter(|p| p.date > start)
        .count();
    ForecastError::InsufficientHistory {
        entity: entity.clone(),
        available,
        required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DuplicatePolicy, SeriesPoint};

    fn day(n: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .checked_add_days(Days::new(n))
            .unwrap()
    }

    fn working(values: &[(u64, f64)]) -> WorkingSeries {
        let points = values
            .iter()
            .map(|&(d, value)| SeriesPoint { date: day(d), value })
            .collect();
        let (series, _) =
            Series::from_points(EntityKey::new("onion", "goa"), points, DuplicatePolicy::KeepFirst)
                .unwrap();
        WorkingSeries::from_series(&series).unwrap()
    }

    #[test]
    fn real_value_is_never_overwritten() {
        let ws = working(&[(0, 10.0), (1, 11.0)]).with_forecast(day(1), 99.0);
        assert_eq!(ws.value_at(day(1)), Some(11.0));
        assert_eq!(ws.forecast_len(), 0);
    }

    #[test]
    fn trailing_blends_in_date_order() {
        let ws = working(&[(0, 1.0), (1, 2.0), (3, 4.0)])
            .with_forecast(day(2), 3.0)
            .with_forecast(day(4), 5.0);
        assert_eq!(ws.trailing(day(5), 5), Some(vec![1.0, 2.0, 3.0, 4.0, 5.0]));
        assert_eq!(ws.trailing(day(4), 2), Some(vec![3.0, 4.0]));
        assert_eq!(ws.trailing(day(2), 3), None);
    }

    #[test]
    fn forecasts_fill_gaps_only() {
        let ws = working(&[(0, 1.0), (2, 3.0)]).with_forecast(day(1), 2.0);
        assert_eq!(ws.value_at(day(1)), Some(2.0));
        assert_eq!(ws.real_len(), 2);
        assert_eq!(ws.last_known(), day(2));
    }
}
