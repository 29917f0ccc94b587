use chrono::{Days, NaiveDate};

use crop_price_forecast::features::{build_feature_matrix, FeatureConfig, RollingSpec, RollingStat};
use crop_price_forecast::forecaster::recursive_forecast;
use crop_price_forecast::gbdt::GbdtParams;
use crop_price_forecast::model::{DuplicatePolicy, EntityKey, Series, SeriesPoint};
use crop_price_forecast::trainer::{train_entity, TargetMode, TrainOutcome, TrainerConfig};

fn entity() -> EntityKey {
    EntityKey::new("Onion", "Maharashtra")
}

fn series_of(values: impl IntoIterator<Item = f64>) -> Series {
    let start = NaiveDate::from_ymd_opt(2022, 6, 1).expect("valid date");
    let points = values
        .into_iter()
        .enumerate()
        .map(|(i, value)| SeriesPoint {
            date: start
                .checked_add_days(Days::new(i as u64))
                .expect("date in range"),
            value,
        })
        .collect();
    Series::from_points(entity(), points, DuplicatePolicy::KeepFirst)
        .expect("series should build")
        .0
}

fn seasonal(n: usize) -> Series {
    series_of((0..n).map(|t| {
        let t = t as f64;
        1_500.0 + 120.0 * (t / 7.0).sin() + 40.0 * (t / 30.0).cos() + (t as usize % 5) as f64 * 6.0
    }))
}

fn small_params() -> GbdtParams {
    GbdtParams {
        n_estimators: 40,
        max_depth: 3,
        learning_rate: 0.2,
        ..GbdtParams::default()
    }
}

fn trained(outcome: TrainOutcome) -> crop_price_forecast::trainer::TrainedEntityModel {
    match outcome {
        TrainOutcome::Trained(model) => model,
        other => panic!("expected a trained model, got {other:?}"),
    }
}

#[test]
/// Verifies the strict time split: the last max(4h, 28) rows validate,
/// every earlier row trains.
fn split_sizes_follow_validation_window() {
    let matrix = build_feature_matrix(&seasonal(250), &FeatureConfig::default());
    assert_eq!(matrix.len(), 222);

    let config = TrainerConfig {
        params: small_params(),
        ..TrainerConfig::default()
    };
    let model = trained(train_entity(&entity(), &matrix, &config).expect("training should run"));
    assert_eq!(model.metrics().n_val, 28);
    assert_eq!(model.metrics().n_train, 194);
    assert_eq!(model.schema(), &matrix.schema);
    assert!(model.metrics().mae.is_finite() && model.metrics().mae >= 0.0);
    assert!(model.metrics().mape >= 0.0);

    let config = TrainerConfig {
        horizon: 10,
        min_history: 100,
        params: small_params(),
        ..TrainerConfig::default()
    };
    let model = trained(train_entity(&entity(), &matrix, &config).expect("training should run"));
    assert_eq!(model.metrics().n_val, 40);
    assert_eq!(model.metrics().n_train, 182);
}

#[test]
/// Verifies the skip policy: too few usable rows is a skip, not an error.
fn short_history_is_skipped() {
    let matrix = build_feature_matrix(&seasonal(100), &FeatureConfig::default());
    let outcome = train_entity(&entity(), &matrix, &TrainerConfig::default())
        .expect("skip is not an error");
    assert_eq!(
        outcome,
        TrainOutcome::Skipped {
            usable_rows: 72,
            required: 180
        }
    );
}

#[test]
/// Verifies the history floor applies even when min_history is lower.
fn history_floor_applies() {
    let matrix = build_feature_matrix(&seasonal(140), &FeatureConfig::default());
    let config = TrainerConfig {
        min_history: 30,
        params: small_params(),
        ..TrainerConfig::default()
    };
    assert!(matches!(
        train_entity(&entity(), &matrix, &config).expect("skip is not an error"),
        TrainOutcome::Skipped { required: 120, .. }
    ));
}

#[test]
/// Verifies determinism: the same data and seed produce the same model and metrics.
fn training_is_deterministic() {
    let matrix = build_feature_matrix(&seasonal(240), &FeatureConfig::default());
    let config = TrainerConfig {
        params: small_params(),
        ..TrainerConfig::default()
    };
    let a = trained(train_entity(&entity(), &matrix, &config).expect("training should run"));
    let b = trained(train_entity(&entity(), &matrix, &config).expect("training should run"));
    assert_eq!(a, b);
    assert_eq!(a.metrics(), b.metrics());
}

#[test]
/// Verifies the linear scenario: on v(t) = 100 + t the residual target fits
/// the constant step exactly, validation error is ~0 and a horizon-3 rollout
/// continues the trend from the last value.
fn linear_series_is_tracked() {
    let series = series_of((0..200).map(|t| 100.0 + t as f64));
    let features = FeatureConfig::new(vec![1, 7], vec![RollingSpec::new(7, RollingStat::Mean)]);
    let matrix = build_feature_matrix(&series, &features);
    let config = TrainerConfig {
        horizon: 3,
        min_history: 150,
        target: TargetMode::Lag1Residual,
        params: small_params(),
        ..TrainerConfig::default()
    };
    let model = trained(train_entity(&entity(), &matrix, &config).expect("training should run"));
    assert!(model.metrics().mae < 1e-9, "mae = {}", model.metrics().mae);
    assert!(model.metrics().mape < 1e-9);

    let forecast = recursive_forecast(&model, &series.tail(60), 3).expect("forecast should run");
    let values: Vec<f64> = forecast.iter().map(|p| p.value).collect();
    for (got, want) in values.iter().zip([300.0, 301.0, 302.0]) {
        assert!((got - want).abs() < 1e-9, "got {values:?}");
    }
}

#[test]
/// Verifies the level target cannot follow a trend past its training range:
/// on the same linear series its validation error stays large.
fn level_target_flattens_on_a_trend() {
    let series = series_of((0..200).map(|t| 100.0 + t as f64));
    let features = FeatureConfig::new(vec![1, 7], vec![RollingSpec::new(7, RollingStat::Mean)]);
    let matrix = build_feature_matrix(&series, &features);
    let config = TrainerConfig {
        horizon: 3,
        min_history: 150,
        target: TargetMode::Level,
        params: small_params(),
        ..TrainerConfig::default()
    };
    let model = trained(train_entity(&entity(), &matrix, &config).expect("training should run"));
    assert!(model.metrics().mae > 5.0, "mae = {}", model.metrics().mae);
}

#[test]
/// Verifies the level target on a seasonal series keeps validation error
/// well under the series' own spread.
fn level_target_learns_seasonal_shape() {
    let matrix = build_feature_matrix(&seasonal(300), &FeatureConfig::default());
    let config = TrainerConfig {
        params: GbdtParams {
            n_estimators: 120,
            max_depth: 4,
            learning_rate: 0.1,
            ..GbdtParams::default()
        },
        ..TrainerConfig::default()
    };
    let model = trained(train_entity(&entity(), &matrix, &config).expect("training should run"));
    assert!(model.metrics().mae < 100.0, "mae = {}", model.metrics().mae);
    assert!(model.metrics().mape < 0.07, "mape = {}", model.metrics().mape);
}
