use chrono::{Days, NaiveDate};

use crop_price_forecast::features::{
    build_feature_matrix, FeatureConfig, RollingSpec, RollingStat, TimeFeatures,
};
use crop_price_forecast::model::{DuplicatePolicy, EntityKey, Series, SeriesPoint};

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 1).expect("valid date")
}

fn day(n: u64) -> NaiveDate {
    start().checked_add_days(Days::new(n)).expect("date in range")
}

fn series_from(points: Vec<(u64, f64)>) -> Series {
    let points = points
        .into_iter()
        .map(|(d, value)| SeriesPoint { date: day(d), value })
        .collect();
    Series::from_points(EntityKey::new("Tomato", "Karnataka"), points, DuplicatePolicy::KeepFirst)
        .expect("series should build")
        .0
}

fn linear_series(n: u64) -> Series {
    series_from((0..n).map(|t| (t, 100.0 + t as f64)).collect())
}

fn lag1_lag7_roll7() -> FeatureConfig {
    FeatureConfig::new(vec![1, 7], vec![RollingSpec::new(7, RollingStat::Mean)])
}

#[test]
/// Verifies the first complete row of a 200-day linear series:
/// it lands at t=7 with lag_1=106, lag_7=100 and roll7_mean=103.
fn first_row_of_linear_series() {
    let matrix = build_feature_matrix(&linear_series(200), &lag1_lag7_roll7());

    assert_eq!(
        matrix.schema.names(),
        &["doy", "dow", "week", "month", "lag_1", "lag_7", "roll7_mean"]
    );
    assert_eq!(matrix.len(), 193);

    let first = &matrix.rows[0];
    assert_eq!(first.date, day(7));
    assert!((first.target - 107.0).abs() < 1e-12);
    assert!((first.features[4] - 106.0).abs() < 1e-12);
    assert!((first.features[5] - 100.0).abs() < 1e-12);
    assert!((first.features[6] - 103.0).abs() < 1e-12);

    let tf = TimeFeatures::from_date(day(7));
    assert_eq!(first.features[0], tf.day_of_year as f64);
    assert_eq!(first.features[1], tf.day_of_week as f64);
}

#[test]
/// Verifies rows are emitted in ascending date order, one per surviving position.
fn rows_are_date_ordered() {
    let matrix = build_feature_matrix(&linear_series(120), &FeatureConfig::default());
    assert_eq!(matrix.len(), 120 - 28);
    assert!(matrix.rows.windows(2).all(|w| w[0].date < w[1].date));
}

#[test]
/// Verifies no leakage: changing the value at or after a row's own date
/// never changes that row's features.
fn features_never_see_their_own_or_later_values() {
    let base: Vec<(u64, f64)> = (0..150)
        .map(|t| (t, 500.0 + ((t * 37) % 23) as f64 * 4.5))
        .collect();
    let config = FeatureConfig::default();
    let original = build_feature_matrix(&series_from(base.clone()), &config);

    let cut = 90u64;
    let mut perturbed = base.clone();
    for point in perturbed.iter_mut().filter(|(d, _)| *d >= cut) {
        point.1 += 1_000.0;
    }
    let changed = build_feature_matrix(&series_from(perturbed), &config);

    for (a, b) in original.rows.iter().zip(&changed.rows) {
        if a.date <= day(cut) {
            assert_eq!(a.features, b.features, "row {} saw future data", a.date);
        }
    }
}

#[test]
/// Verifies lags are positional over gapped series: lag_1 is the previous
/// observation even when calendar days are missing in between.
fn lags_are_positional_across_gaps() {
    let points: Vec<(u64, f64)> = (0..40).map(|i| (i * 3, 10.0 * i as f64)).collect();
    let config = FeatureConfig::new(vec![1, 2], vec![RollingSpec::new(2, RollingStat::Mean)]);
    let matrix = build_feature_matrix(&series_from(points), &config);

    let first = &matrix.rows[0];
    assert_eq!(first.date, day(6));
    assert!((first.features[4] - 10.0).abs() < 1e-12);
    assert!((first.features[5] - 0.0).abs() < 1e-12);
    assert!((first.features[6] - 5.0).abs() < 1e-12);
}

#[test]
/// Verifies rolling std uses the sample (n-1) estimator over prior values only.
fn rolling_std_over_prior_window() {
    let values = [2.0, 4.0, 4.0, 6.0, 100.0];
    let series = series_from(values.iter().enumerate().map(|(i, v)| (i as u64, *v)).collect());
    let config = FeatureConfig::new(vec![], vec![RollingSpec::new(4, RollingStat::Std)]);
    let matrix = build_feature_matrix(&series, &config);

    assert_eq!(matrix.len(), 1);
    let expected = (8.0f64 / 3.0).sqrt();
    assert!((matrix.rows[0].features[4] - expected).abs() < 1e-12);
}

#[test]
/// Verifies a series shorter than the warmup produces no rows instead of partial ones.
fn short_series_yields_no_rows() {
    let matrix = build_feature_matrix(&linear_series(20), &FeatureConfig::default());
    assert!(matrix.is_empty());
}

#[test]
/// Verifies determinism: the same series and configuration build identical matrices.
fn builder_is_deterministic() {
    let series = linear_series(180);
    let config = FeatureConfig::default();
    assert_eq!(
        build_feature_matrix(&series, &config),
        build_feature_matrix(&series, &config)
    );
}
