use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::logging;
use crate::model::EntityKey;
use crate::orchestrator::{EntityStatus, TrainingOrchestrator};
use crate::registry::{FileRegistry, ModelRegistry};
use crate::service::ForecastService;
use crate::source::{open_source, ObservationSource};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainArgs {
    pub config: Option<PathBuf>,
    pub horizon: Option<usize>,
    pub min_history: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForecastArgs {
    pub config: Option<PathBuf>,
    pub crop: String,
    pub state: String,
    /// Signed so that a negative request reaches horizon validation.
    pub horizon: Option<i64>,
}

/// Splits `--flag value` / `--flag=value` pairs. Returns `None` on `--help`.
fn flag_pairs(args: &[String]) -> Result<Option<Vec<(String, String)>>> {
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if matches!(arg, "-h" | "--help" | "help") {
            return Ok(None);
        }
        if !arg.starts_with('-') {
            bail!("unexpected argument `{}`", arg);
        }
        match arg.split_once('=') {
            Some((flag, value)) => pairs.push((flag.to_string(), value.to_string())),
            None => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow!("`{}` requires a value", arg))?;
                pairs.push((arg.to_string(), value.clone()));
                i += 1;
            }
        }
        i += 1;
    }
    Ok(Some(pairs))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("`{}` expects an integer, got `{}`", flag, value))
}

pub fn parse_train_args(args: &[String]) -> Result<Option<TrainArgs>> {
    let Some(pairs) = flag_pairs(args)? else {
        return Ok(None);
    };
    let mut out = TrainArgs::default();
    for (flag, value) in pairs {
        match flag.as_str() {
            "-c" | "--config" => out.config = Some(PathBuf::from(value)),
            "--horizon" => out.horizon = Some(parse_number(&flag, &value)?),
            "--min-history" => out.min_history = Some(parse_number(&flag, &value)?),
            other => bail!(
                "unknown option `{}`. expected one of: --config|--horizon|--min-history",
                other
            ),
        }
    }
    Ok(Some(out))
}

pub fn parse_forecast_args(args: &[String]) -> Result<Option<ForecastArgs>> {
    let Some(pairs) = flag_pairs(args)? else {
        return Ok(None);
    };
    let mut config = None;
    let mut crop = None;
    let mut state = None;
    let mut horizon = None;
    for (flag, value) in pairs {
        match flag.as_str() {
            "-c" | "--config" => config = Some(PathBuf::from(value)),
            "--crop" => crop = Some(value),
            "--state" => state = Some(value),
            "--horizon" => horizon = Some(parse_number(&flag, &value)?),
            other => bail!(
                "unknown option `{}`. expected one of: --config|--crop|--state|--horizon",
                other
            ),
        }
    }
    let crop = crop
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| anyhow!("`--crop` is required"))?;
    let state = state
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("`--state` is required"))?;
    Ok(Some(ForecastArgs {
        config,
        crop,
        state,
        horizon,
    }))
}

/// Explicit path, else `config/default.toml` if present, else built-in
/// defaults with environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return Config::load_from_path(path);
    }
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        return Config::load();
    }
    dotenvy::dotenv().ok();
    let mut config = Config::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub fn print_train_usage() {
    println!("usage: train [--config PATH] [--horizon N] [--min-history N]");
}

pub fn print_forecast_usage() {
    println!("usage: forecast [--config PATH] --crop CROP --state STATE [--horizon N]");
}

pub fn run_train(args: &[String]) -> Result<()> {
    let Some(args) = parse_train_args(args)? else {
        print_train_usage();
        return Ok(());
    };
    let config = load_config(args.config.as_deref())?
        .with_training_overrides(args.horizon, args.min_history)?;
    logging::init(&config.logging)?;

    let observations = config.paths.observations_path();
    let source = open_source(&observations)?;
    let registry = FileRegistry::open(&config.paths.models_path);
    let report = TrainingOrchestrator::new(source.as_ref(), &registry, config.training_settings())
        .run()
        .with_context(|| format!("training from {} failed", observations.display()))?;

    for entity in &report.entities {
        match &entity.status {
            EntityStatus::Trained { metrics } => println!(
                "[OK] {}  n_train={} n_val={} mae={:.2} mape={:.3}",
                entity.entity, metrics.n_train, metrics.n_val, metrics.mae, metrics.mape
            ),
            EntityStatus::Skipped {
                usable_rows,
                required,
            } => println!(
                "[SKIP] {}  insufficient history ({} usable rows, {} required)",
                entity.entity, usable_rows, required
            ),
            EntityStatus::Failed { kind, message } => {
                println!("[FAIL] {}  {}: {}", entity.entity, kind, message)
            }
        }
    }
    println!(
        "run {}: {} trained, {} skipped, {} failed -> {}",
        report.run_id,
        report.trained(),
        report.skipped(),
        report.failed(),
        registry.index_path().display()
    );
    Ok(())
}

/// Prints the forecast JSON, or `{"error": kind, "message": ...}`. Expected
/// outcomes (unknown entity, short history, bad horizon) exit with 2.
pub async fn run_forecast(args: &[String]) -> Result<ExitCode> {
    let Some(args) = parse_forecast_args(args)? else {
        print_forecast_usage();
        return Ok(ExitCode::SUCCESS);
    };
    let config = load_config(args.config.as_deref())?;
    logging::init(&config.logging)?;

    let source: Arc<dyn ObservationSource> =
        Arc::from(open_source(&config.paths.observations_path())?);
    let registry: Arc<dyn ModelRegistry> =
        Arc::new(FileRegistry::open(&config.paths.models_path));
    let service = Arc::new(ForecastService::new(
        registry,
        source,
        config.serving_settings(),
    ));

    let entity = EntityKey::new(args.crop, args.state);
    match service.forecast_with_timeout(entity, args.horizon).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            let payload = serde_json::json!({
                "error": err.kind(),
                "message": err.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(if err.is_expected() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
