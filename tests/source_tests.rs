use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;

use crop_price_forecast::error::ForecastError;
use crop_price_forecast::model::{EntityKey, Observation};
use crop_price_forecast::source::{
    open_source, parse_date, persist_observations, CsvObservationSource, ObservationSource,
    SqliteObservationSource,
};

fn temp_path(test_name: &str, ext: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic")
        .as_nanos();
    std::env::temp_dir().join(format!("cpf-{}-{}.{}", test_name, ts, ext))
}

fn write(path: &Path, body: &str) {
    std::fs::write(path, body).expect("temp file writable");
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

#[test]
/// Verifies CSV cleaning: malformed rows are dropped and counted, good rows
/// keep their values, and `mandi` is ignored.
fn csv_drops_malformed_rows() {
    let path = temp_path("source-csv", "csv");
    write(
        &path,
        "date,crop,state,mandi,modal\n\
         2024-01-01,Onion,Maharashtra,Lasalgaon,1800\n\
         02/01/2024, onion ,maharashtra,Pimpalgaon,1825.5\n\
         not-a-date,Onion,Maharashtra,Lasalgaon,1900\n\
         2024-01-04,Onion,,Lasalgaon,1900\n\
         2024-01-05,Onion,Maharashtra,Lasalgaon,\n\
         2024-01-06,Onion,Maharashtra,Lasalgaon,NaN\n\
         2024-01-07 00:00:00,Tomato,Karnataka,Kolar,950\n",
    );

    let loaded = CsvObservationSource::new(&path)
        .load_all()
        .expect("csv should load");
    assert_eq!(loaded.observations.len(), 3);
    assert_eq!(loaded.rejected, 4);

    let second = &loaded.observations[1];
    assert_eq!(second.date, date(2024, 1, 2));
    assert_eq!(second.entity, EntityKey::new("Onion", "Maharashtra"));
    assert!((second.value - 1825.5).abs() < 1e-12);
    assert_eq!(loaded.observations[2].date, date(2024, 1, 7));
}

#[test]
/// Verifies a file without a required column is a data error.
fn csv_missing_column_is_a_data_error() {
    let path = temp_path("source-csv-missing", "csv");
    write(&path, "date,crop,mandi,modal\n2024-01-01,Onion,Lasalgaon,1800\n");
    let err = CsvObservationSource::new(&path).load_all().unwrap_err();
    assert!(matches!(err, ForecastError::Data(msg) if msg.contains("'state'")));
}

#[test]
/// Verifies per-entity loading from CSV filters case-insensitively.
fn csv_load_entity_filters() {
    let path = temp_path("source-csv-entity", "csv");
    write(
        &path,
        "date,crop,state,modal\n\
         2024-01-01,Onion,Maharashtra,1800\n\
         2024-01-01,Tomato,Karnataka,950\n\
         2024-01-02,ONION,MAHARASHTRA,1810\n",
    );
    let rows = CsvObservationSource::new(&path)
        .load_entity(&EntityKey::new("onion", "maharashtra"))
        .expect("csv should load");
    assert_eq!(rows.len(), 2);
}

#[test]
/// Verifies SQLite persistence and reads, including the case-insensitive
/// per-entity query.
fn sqlite_round_trip() {
    let path = temp_path("source-sqlite", "sqlite");
    let onion = EntityKey::new("Onion", "Maharashtra");
    let rows: Vec<Observation> = (1..=5)
        .map(|d| Observation {
            date: date(2024, 2, d),
            entity: onion.clone(),
            value: 1_700.0 + d as f64,
        })
        .chain(std::iter::once(Observation {
            date: date(2024, 2, 1),
            entity: EntityKey::new("Tomato", "Karnataka"),
            value: 900.0,
        }))
        .collect();
    assert_eq!(persist_observations(&path, &rows).expect("persist should succeed"), 6);

    let source = SqliteObservationSource::new(&path);
    let all = source.load_all().expect("sqlite should load");
    assert_eq!(all.observations.len(), 6);
    assert_eq!(all.rejected, 0);

    let only = source
        .load_entity(&EntityKey::new("ONION", "maharashtra"))
        .expect("sqlite should load");
    assert_eq!(only.len(), 5);
    assert_eq!(only[0].date, date(2024, 2, 1));
    assert!((only[4].value - 1_705.0).abs() < 1e-12);
}

#[test]
/// Verifies a missing database is a data error rather than a silently created file.
fn sqlite_missing_file_is_a_data_error() {
    let path = temp_path("source-sqlite-missing", "sqlite");
    let err = SqliteObservationSource::new(&path).load_all().unwrap_err();
    assert!(matches!(err, ForecastError::Data(_)));
    assert!(!path.exists());
}

#[test]
/// Verifies the source is chosen by extension.
fn open_source_by_extension() {
    assert!(open_source(Path::new("data/prices.csv")).is_ok());
    assert!(open_source(Path::new("data/prices.SQLITE")).is_ok());
    assert!(matches!(
        open_source(Path::new("data/prices.parquet")),
        Err(ForecastError::Config(_))
    ));
}

#[test]
/// Verifies the accepted date layouts.
fn date_formats() {
    assert_eq!(parse_date("2024-03-09"), Some(date(2024, 3, 9)));
    assert_eq!(parse_date("09/03/2024"), Some(date(2024, 3, 9)));
    assert_eq!(parse_date("09-03-2024"), Some(date(2024, 3, 9)));
    assert_eq!(parse_date(" 2024-03-09 12:00:00 "), Some(date(2024, 3, 9)));
    assert_eq!(parse_date("2024/13/01"), None);
}
