use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use tracing::warn;

use crate::error::{ForecastError, Result};
use crate::model::{EntityKey, Observation};

pub const REQUIRED_COLUMNS: [&str; 4] = ["date", "crop", "state", "modal"];
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedObservations {
    pub observations: Vec<Observation>,
    /// Rows dropped for a missing field, bad date or non-finite value.
    pub rejected: usize,
}

/// Where raw `(date, crop, state, value)` records come from.
pub trait ObservationSource: Send + Sync {
    fn load_all(&self) -> Result<LoadedObservations>;

    fn load_entity(&self, entity: &EntityKey) -> Result<Vec<Observation>> {
        let loaded = self.load_all()?;
        Ok(loaded
            .observations
            .into_iter()
            .filter(|o| o.entity == *entity)
            .collect())
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    // Timestamps such as "2024-03-01 00:00:00" keep only the date part.
    let raw = raw.split_whitespace().next().unwrap_or(raw);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn parse_record(date: &str, crop: &str, state: &str, modal: &str) -> Option<Observation> {
    let value: f64 = modal.trim().parse().ok()?;
    build_observation(date, crop, state, value)
}

fn build_observation(date: &str, crop: &str, state: &str, value: f64) -> Option<Observation> {
    let date = parse_date(date)?;
    if crop.trim().is_empty() || state.trim().is_empty() || !value.is_finite() {
        return None;
    }
    Some(Observation {
        date,
        entity: EntityKey::new(crop, state),
        value,
    })
}

/// CSV with at least `date,crop,state,modal` headers (extra columns such as
/// `mandi` are ignored).
#[derive(Debug, Clone)]
pub struct CsvObservationSource {
    path: PathBuf,
}

impl CsvObservationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Streams the file once, keeping only rows for `only` when given.
    fn read(&self, only: Option<&EntityKey>) -> Result<LoadedObservations> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)?;
        let headers = reader.headers()?.clone();
        let mut idx = [0usize; 4];
        for (slot, name) in idx.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    ForecastError::Data(format!(
                        "{} is missing required column '{name}'",
                        self.path.display()
                    ))
                })?;
        }

        let mut loaded = LoadedObservations::default();
        for (line, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(err) => {
                    warn!(path = %self.path.display(), line = line + 2, error = %err, "unreadable row dropped");
                    loaded.rejected += 1;
                    continue;
                }
            };
            let field = |i: usize| record.get(idx[i]).unwrap_or("");
            if let Some(entity) = only {
                if EntityKey::new(field(1), field(2)) != *entity {
                    continue;
                }
            }
            match parse_record(field(0), field(1), field(2), field(3)) {
                Some(obs) => loaded.observations.push(obs),
                None => loaded.rejected += 1,
            }
        }
        if loaded.rejected > 0 {
            warn!(
                path = %self.path.display(),
                rejected = loaded.rejected,
                kept = loaded.observations.len(),
                "dropped malformed observation rows"
            );
        }
        Ok(loaded)
    }
}

impl ObservationSource for CsvObservationSource {
    fn load_all(&self) -> Result<LoadedObservations> {
        self.read(None)
    }

    /// Rows for other entities are skipped before parsing.
    fn load_entity(&self, entity: &EntityKey) -> Result<Vec<Observation>> {
        Ok(self.read(Some(entity))?.observations)
    }
}

type RawRow = (String, String, String, Option<f64>);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

/// `market_prices` table in a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteObservationSource {
    path: PathBuf,
}

impl SqliteObservationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Connection> {
        if !self.path.exists() {
            return Err(ForecastError::Data(format!(
                "observation database {} does not exist",
                self.path.display()
            )));
        }
        Ok(Connection::open(&self.path)?)
    }

    fn collect(rows: impl Iterator<Item = rusqlite::Result<RawRow>>) -> Result<LoadedObservations> {
        let mut loaded = LoadedObservations::default();
        for row in rows {
            let (date, crop, state, modal) = row?;
            let parsed = modal.and_then(|m| build_observation(&date, &crop, &state, m));
            match parsed {
                Some(obs) => loaded.observations.push(obs),
                None => loaded.rejected += 1,
            }
        }
        Ok(loaded)
    }
}

impl ObservationSource for SqliteObservationSource {
    fn load_all(&self) -> Result<LoadedObservations> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT date, crop, state, modal FROM market_prices ORDER BY date")?;
        let rows = stmt.query_map([], raw_row)?;
        let loaded = Self::collect(rows)?;
        if loaded.rejected > 0 {
            warn!(path = %self.path.display(), rejected = loaded.rejected, "dropped malformed observation rows");
        }
        Ok(loaded)
    }

    fn load_entity(&self, entity: &EntityKey) -> Result<Vec<Observation>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT date, crop, state, modal FROM market_prices
             WHERE lower(crop) = lower(?1) AND lower(state) = lower(?2)
             ORDER BY date",
        )?;
        let rows = stmt.query_map(params![entity.crop, entity.state], raw_row)?;
        Ok(Self::collect(rows)?.observations)
    }
}

/// Writes observations into the `market_prices` table, creating it if needed.
pub fn persist_observations(path: &Path, observations: &[Observation]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS market_prices (
            date TEXT NOT NULL,
            crop TEXT NOT NULL,
            state TEXT NOT NULL,
            mandi TEXT,
            modal REAL
        );
        CREATE INDEX IF NOT EXISTS market_prices_entity
            ON market_prices (crop, state, date);
        "#,
    )?;
    let tx = conn.transaction()?;
    for o in observations {
        tx.execute(
            "INSERT INTO market_prices (date, crop, state, modal) VALUES (?1, ?2, ?3, ?4)",
            params![
                o.date.format("%Y-%m-%d").to_string(),
                o.entity.crop,
                o.entity.state,
                o.value
            ],
        )?;
    }
    tx.commit()?;
    Ok(observations.len())
}

/// Fixed set of observations, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryObservationSource {
    observations: Vec<Observation>,
}

impl MemoryObservationSource {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }
}

impl ObservationSource for MemoryObservationSource {
    fn load_all(&self) -> Result<LoadedObservations> {
        Ok(LoadedObservations {
            observations: self.observations.clone(),
            rejected: 0,
        })
    }
}

/// Picks a source by file extension: `.csv`, or `.sqlite`/`.sqlite3`/`.db`.
pub fn open_source(path: &Path) -> Result<Box<dyn ObservationSource>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => Ok(Box::new(CsvObservationSource::new(path))),
        "sqlite" | "sqlite3" | "db" => Ok(Box::new(SqliteObservationSource::new(path))),
        _ => Err(ForecastError::Config(format!(
            "unsupported observation file {}: expected .csv or .sqlite",
            path.display()
        ))),
    }
}
