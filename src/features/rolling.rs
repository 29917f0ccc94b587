use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollingStat {
    Mean,
    /// Sample standard deviation (n - 1 denominator).
    Std,
}

impl RollingStat {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Std => "std",
        }
    }

    /// Fewest values for which the statistic is defined.
    pub fn min_window(self) -> usize {
        match self {
            Self::Mean => 1,
            Self::Std => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollingSpec {
    pub window: usize,
    pub stat: RollingStat,
}

impl RollingSpec {
    pub const fn new(window: usize, stat: RollingStat) -> Self {
        Self { window, stat }
    }

    pub fn column_name(&self) -> String {
        format!("roll{}_{}", self.window, self.stat.suffix())
    }

    /// Parses `roll{window}_{mean|std}`.
    pub fn from_column_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("roll")?;
        let (window, stat) = rest.split_once('_')?;
        let window: usize = window.parse().ok().filter(|w| *w > 0)?;
        let stat = match stat {
            "mean" => RollingStat::Mean,
            "std" => RollingStat::Std,
            _ => return None,
        };
        Some(Self { window, stat })
    }

    /// Statistic over a window that already holds exactly `self.window` values.
    pub fn evaluate(&self, window: &RollingWindow) -> Option<f64> {
        if window.period() != self.window {
            return None;
        }
        match self.stat {
            RollingStat::Mean => window.mean(),
            RollingStat::Std => window.sample_std(),
        }
    }
}

impl fmt::Display for RollingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.column_name())
    }
}

/// Trailing window over the most recent `period` values using a ring buffer
/// for O(1) push. Statistics are recomputed from the buffer in arrival order,
/// so two windows holding the same values always agree bit for bit.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    period: usize,
    buffer: Vec<f64>,
    head: usize,
    count: usize,
}

impl RollingWindow {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "rolling window period must be > 0");
        Self {
            period,
            buffer: vec![0.0; period],
            head: 0,
            count: 0,
        }
    }

    /// Window over the last `period` items of `values`.
    pub fn from_values(period: usize, values: &[f64]) -> Self {
        let mut window = Self::new(period);
        let start = values.len().saturating_sub(period);
        for v in &values[start..] {
            window.push(*v);
        }
        window
    }

    pub fn push(&mut self, value: f64) {
        self.buffer[self.head] = value;
        self.head = (self.head + 1) % self.period;
        if self.count < self.period {
            self.count += 1;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.count >= self.period
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Values oldest first.
    fn ordered(&self) -> impl Iterator<Item = f64> + '_ {
        let start = if self.is_ready() { self.head } else { 0 };
        (0..self.count).map(move |i| self.buffer[(start + i) % self.period])
    }

    pub fn mean(&self) -> Option<f64> {
        if !self.is_ready() {
            return None;
        }
        let sum: f64 = self.ordered().sum();
        Some(sum / self.period as f64)
    }

    pub fn sample_std(&self) -> Option<f64> {
        if !self.is_ready() || self.period < 2 {
            return None;
        }
        let mean = self.mean()?;
        let ss: f64 = self.ordered().map(|v| (v - mean).powi(2)).sum();
        Some((ss / (self.period - 1) as f64).sqrt())
    }
}
