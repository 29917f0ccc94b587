pub mod forecast;
pub mod observation;

pub use forecast::{ForecastPoint, ForecastResponse, ValidationMetrics};
pub use observation::{DuplicatePolicy, EntityKey, Observation, Series, SeriesPoint};
