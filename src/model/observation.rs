use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ForecastError, Result};

/// A (crop, state) pair. Equality, hashing and ordering ignore case so that
/// "Wheat/UP" and "wheat/up" address the same model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityKey {
    pub crop: String,
    pub state: String,
}

impl EntityKey {
    pub fn new(crop: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            crop: crop.into().trim().to_string(),
            state: state.into().trim().to_string(),
        }
    }

    fn normalized(&self) -> (String, String) {
        (self.crop.to_lowercase(), self.state.to_lowercase())
    }

    /// File-name-safe stem, e.g. `Wheat__UP-3f2a9c01d4e5`. The readable part
    /// is lossy, so a digest of the normalized key keeps distinct entities on
    /// distinct files.
    pub fn file_stem(&self) -> String {
        let (crop, state) = self.normalized();
        let mut hasher = Sha256::new();
        hasher.update(crop.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(state.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!(
            "{}__{}-{}",
            sanitize(&self.crop),
            sanitize(&self.state),
            &digest[..STEM_DIGEST_LEN]
        )
    }
}

const STEM_DIGEST_LEN: usize = 12;

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl PartialOrd for EntityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.crop, self.state)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub date: NaiveDate,
    pub entity: EntityKey,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first observation seen for a date, drop the rest.
    #[default]
    KeepFirst,
    /// Treat any repeated date as a data error for the entity.
    Reject,
}

/// One entity's observations, ascending by date with at most one point per date.
/// Gaps between dates are allowed.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    entity: EntityKey,
    points: Vec<SeriesPoint>,
}

impl Series {
    /// Sorts `points` by date (stable, so input order decides among equal
    /// dates) and resolves duplicates per `policy`. Returns the series and the
    /// number of dropped duplicates.
    pub fn from_points(
        entity: EntityKey,
        mut points: Vec<SeriesPoint>,
        policy: DuplicatePolicy,
    ) -> Result<(Self, usize)> {
        points.sort_by_key(|p| p.date);
        let before = points.len();
        let mut deduped: Vec<SeriesPoint> = Vec::with_capacity(points.len());
        for point in points {
            match deduped.last() {
                Some(last) if last.date == point.date => {
                    if policy == DuplicatePolicy::Reject {
                        return Err(ForecastError::Data(format!(
                            "duplicate observation for {} on {}",
                            entity, point.date
                        )));
                    }
                }
                _ => deduped.push(point),
            }
        }
        let dropped = before - deduped.len();
        Ok((
            Self {
                entity,
                points: deduped,
            },
            dropped,
        ))
    }

    pub fn from_observations(
        entity: EntityKey,
        observations: &[Observation],
        policy: DuplicatePolicy,
    ) -> Result<(Self, usize)> {
        let points = observations
            .iter()
            .filter(|o| o.entity == entity)
            .map(|o| SeriesPoint {
                date: o.date,
                value: o.value,
            })
            .collect();
        Self::from_points(entity, points, policy)
    }

    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<SeriesPoint> {
        self.points.last().copied()
    }

    /// The `n` most recent points as a new series.
    pub fn tail(&self, n: usize) -> Self {
        let start = self.points.len().saturating_sub(n);
        Self {
            entity: self.entity.clone(),
            points: self.points[start..].to_vec(),
        }
    }
}

/// Groups observations by entity, preserving input order within each group.
pub fn group_by_entity(observations: Vec<Observation>) -> BTreeMap<EntityKey, Vec<SeriesPoint>> {
    let mut groups: BTreeMap<EntityKey, Vec<SeriesPoint>> = BTreeMap::new();
    for obs in observations {
        groups.entry(obs.entity).or_default().push(SeriesPoint {
            date: obs.date,
            value: obs.value,
        });
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    #[test]
    fn entity_key_ignores_case_and_whitespace() {
        let a = EntityKey::new(" Wheat", "UP ");
        let b = EntityKey::new("wheat", "up");
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        let digest = |k: &EntityKey| k.file_stem().rsplit('-').next().map(str::to_string);
        assert_eq!(digest(&a), digest(&b));
        assert!(a.file_stem().starts_with("Wheat__UP-"));
    }

    #[test]
    fn file_stem_replaces_path_characters() {
        let key = EntityKey::new("Bengal Gram", "J&K/Ladakh");
        assert!(key.file_stem().starts_with("Bengal_Gram__J_K_Ladakh-"));
    }

    #[test]
    fn file_stem_keeps_sanitized_lookalikes_apart() {
        let spaced = EntityKey::new("Bengal Gram", "Rajasthan");
        let slashed = EntityKey::new("Bengal/Gram", "Rajasthan");
        assert_ne!(spaced.file_stem(), slashed.file_stem());
        let a = EntityKey::new("चना", "राजस्थान");
        let b = EntityKey::new("गेहूं", "राजस्थान");
        assert_ne!(a.file_stem(), b.file_stem());
    }

    #[test]
    fn duplicates_keep_first_in_input_order() {
        let points = vec![
            SeriesPoint { date: d(2), value: 20.0 },
            SeriesPoint { date: d(1), value: 10.0 },
            SeriesPoint { date: d(2), value: 99.0 },
        ];
        let (series, dropped) =
            Series::from_points(EntityKey::new("Wheat", "UP"), points, DuplicatePolicy::KeepFirst)
                .unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(series.values(), vec![10.0, 20.0]);
    }

    #[test]
    fn duplicates_rejected_when_policy_is_reject() {
        let points = vec![
            SeriesPoint { date: d(1), value: 1.0 },
            SeriesPoint { date: d(1), value: 2.0 },
        ];
        let err =
            Series::from_points(EntityKey::new("Wheat", "UP"), points, DuplicatePolicy::Reject)
                .unwrap_err();
        assert!(matches!(err, ForecastError::Data(_)));
    }

    #[test]
    fn tail_keeps_most_recent_points() {
        let points = (1..=5)
            .map(|day| SeriesPoint { date: d(day), value: day as f64 })
            .collect();
        let (series, _) =
            Series::from_points(EntityKey::new("Maize", "MP"), points, DuplicatePolicy::KeepFirst)
                .unwrap();
        let tail = series.tail(2);
        assert_eq!(tail.values(), vec![4.0, 5.0]);
        assert_eq!(series.tail(10).len(), 5);
    }
}
