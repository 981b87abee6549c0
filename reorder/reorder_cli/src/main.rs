use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, Utc};
use clap::{Args, Parser, Subcommand};
use reorder_features::{
    ArtifactStore, PipelineConfig, PipelineTelemetry, ReorderRuntime, ScoreOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::FileEventPublisher;
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use uuid::Uuid;

const DEFAULT_MANIFEST: &str = "logs/runs/index.jsonl";

#[derive(Parser, Debug)]
#[command(name = "reorder", version, about = "Reorder probability pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Builds features, fits the scaler and model, and persists artifacts.
    Train(TrainArgs),
    /// Scores one (user, product) pair with persisted artifacts.
    Score {
        #[command(flatten)]
        pipeline: PipelineArgs,
        #[arg(long)]
        user: u64,
        #[arg(long)]
        product: u64,
        /// Overrides `[serving] threshold`.
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Builds the feature table and writes it as CSV.
    Features {
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Defaults to `[artifacts] dir / features_file`.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Lists a user's most reordered products.
    Top {
        #[command(flatten)]
        pipeline: PipelineArgs,
        #[arg(long)]
        user: u64,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Lists the most recent training runs.
    Runs {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
    },
    /// Shows one training run.
    Status {
        run_id: String,
        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
        /// Stage event log to replay for the run.
        #[arg(long)]
        event_log: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone)]
struct PipelineArgs {
    /// Pipeline TOML; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `[data] dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Overrides `[artifacts] dir`.
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    /// Used when `[logging] path` is unset.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
    #[arg(long, default_value = DEFAULT_MANIFEST)]
    manifest: PathBuf,
    /// Overrides `[logging] event_log`.
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Skip writing the scaler, model, and feature export.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct RunManifestEntry {
    run_id: String,
    submitted_at: DateTime<Utc>,
    config: Option<PathBuf>,
    data_dir: PathBuf,
    log_path: PathBuf,
    status: String,
    #[serde(default)]
    rows: Option<usize>,
    #[serde(default)]
    metrics: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl RunManifestEntry {
    fn new(config: Option<PathBuf>, data_dir: PathBuf, log_path: PathBuf) -> Self {
        Self {
            run_id: format!("run-{}", Uuid::new_v4()),
            submitted_at: Utc::now(),
            config,
            data_dir,
            log_path,
            status: "pending".into(),
            rows: None,
            metrics: None,
            error: None,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => handle_train(args),
        Commands::Score {
            pipeline,
            user,
            product,
            threshold,
        } => handle_score(&pipeline, user, product, threshold),
        Commands::Features { pipeline, output } => handle_features(&pipeline, output),
        Commands::Top {
            pipeline,
            user,
            limit,
        } => handle_top(&pipeline, user, limit),
        Commands::Runs { limit, manifest } => {
            let entries = read_manifest(&manifest)?;
            for entry in entries.into_iter().rev().take(limit) {
                println!(
                    "{} | {} | {} | rows={} | {}",
                    entry.run_id,
                    entry.status,
                    entry.submitted_at,
                    entry
                        .rows
                        .map_or_else(|| "-".to_string(), |rows| rows.to_string()),
                    entry.data_dir.display()
                );
            }
            Ok(())
        }
        Commands::Status {
            run_id,
            manifest,
            event_log,
        } => {
            let entries = read_manifest(&manifest)?;
            if let Some(entry) = entries.into_iter().find(|e| e.run_id == run_id) {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("run {run_id} not found");
            }
            if let Some(path) = event_log {
                for event in FileEventPublisher::new(path)?.read_run(&run_id)? {
                    println!("{} | {} | {}", event.timestamp, event.stage, event.payload);
                }
            }
            Ok(())
        }
    }
}

fn load_config(args: &PipelineArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading pipeline config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data.dir.clone_from(dir);
    }
    if let Some(dir) = &args.artifacts_dir {
        config.artifacts.dir.clone_from(dir);
    }
    Ok(config)
}

fn handle_train(args: TrainArgs) -> Result<()> {
    let config = load_config(&args.pipeline)?;
    let log_path = match &config.logging.path {
        Some(path) => path.clone(),
        None => compute_log_path(&args.log_dir)?,
    };
    let mut entry = RunManifestEntry::new(
        args.pipeline.config.clone(),
        config.data.dir.clone(),
        log_path.clone(),
    );
    entry.status = "queued".into();
    append_manifest(&args.manifest, &entry)?;

    let mut telemetry = PipelineTelemetry::builder("reorder.train")
        .run_id(entry.run_id.clone())
        .log_path(&log_path)
        .min_level(config.log_level()?);
    if let Some(path) = args.event_log.as_ref().or(config.logging.event_log.as_ref()) {
        telemetry = telemetry.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    let telemetry = telemetry.build().context("building telemetry")?;

    let source = config.relation_source();
    let runtime = ReorderRuntime::builder()
        .config(config)
        .telemetry(telemetry)
        .build()?;

    update_entry(&args.manifest, &entry.run_id, |e| e.status = "running".into())?;
    log_run_event(
        &log_path,
        LogLevel::Info,
        "run started",
        json!({ "run_id": entry.run_id, "data_dir": entry.data_dir }),
    )?;

    let outcome = runtime.train(&source).and_then(|run| {
        let persisted = if args.dry_run {
            None
        } else {
            Some(runtime.persist(&run)?)
        };
        Ok((run, persisted))
    });
    match outcome {
        Ok((run, persisted)) => {
            if let Some(persisted) = persisted {
                println!("{}", serde_json::to_string_pretty(&persisted)?);
            }
            println!("{}", run.report);
            let summary = run.summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
            update_entry(&args.manifest, &entry.run_id, |e| {
                e.status = "completed".into();
                e.rows = Some(run.features.table.len());
                e.metrics = Some(summary.clone());
            })?;
            log_run_event(
                &log_path,
                LogLevel::Info,
                "run completed",
                json!({ "run_id": entry.run_id }),
            )?;
            Ok(())
        }
        Err(err) => {
            update_entry(&args.manifest, &entry.run_id, |e| {
                e.status = "failed".into();
                e.error = Some(err.to_string());
            })?;
            log_run_event(
                &log_path,
                LogLevel::Error,
                "run failed",
                json!({ "run_id": entry.run_id, "error": err.to_string() }),
            )?;
            Err(err.into())
        }
    }
}

fn handle_score(
    args: &PipelineArgs,
    user: u64,
    product: u64,
    threshold: Option<f64>,
) -> Result<()> {
    let config = load_config(args)?;
    let threshold = match threshold {
        Some(value) => value,
        None => config.threshold()?.value(),
    };
    let source = config.relation_source();
    let runtime = ReorderRuntime::builder().config(config).build()?;
    let service = runtime
        .serving(&source)
        .context("loading serving artifacts (run `reorder train` first)")?;
    match service.score(user, product, threshold)? {
        ScoreOutcome::Scored(score) => {
            println!("{score}");
            println!("{}", serde_json::to_string_pretty(&score)?);
        }
        ScoreOutcome::NoInteraction {
            user_id,
            product_id,
        } => {
            println!("no interaction found for User_{user_id} and product {product_id}");
        }
    }
    Ok(())
}

fn handle_features(args: &PipelineArgs, output: Option<PathBuf>) -> Result<()> {
    let config = load_config(args)?;
    let source = config.relation_source();
    let store = ArtifactStore::from_section(&config.artifacts);
    let runtime = ReorderRuntime::builder().config(config).build()?;
    let build = runtime.load_and_build(&source)?;
    let path = match output {
        Some(path) => {
            build.table.write_csv(&path)?;
            path
        }
        None => store.write_features(&build.table)?,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "rows": build.table.len(),
            "users": build.table.users().len(),
            "fingerprint": build.fingerprint,
            "join": build.join,
            "output": path,
        }))?
    );
    Ok(())
}

fn handle_top(args: &PipelineArgs, user: u64, limit: usize) -> Result<()> {
    let config = load_config(args)?;
    let source = config.relation_source();
    let runtime = ReorderRuntime::builder().config(config).build()?;
    let build = runtime.load_and_build(&source)?;
    let rows = build.table.top_reordered(user, limit);
    if rows.is_empty() {
        println!("User_{user} has no purchase history");
        return Ok(());
    }
    for row in rows {
        println!(
            "{} | {} | {} | reorders={} orders={}",
            row.product_id,
            row.product_name.as_deref().unwrap_or("-"),
            row.aisle.as_deref().unwrap_or("-"),
            row.up_reorder_count,
            row.up_order_count
        );
    }
    Ok(())
}

fn append_manifest(path: &Path, entry: &RunManifestEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening manifest {}", path.display()))?;
    serde_json::to_writer(&mut file, entry)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_manifest(path: &Path) -> Result<Vec<RunManifestEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: RunManifestEntry = serde_json::from_str(&line)
            .with_context(|| format!("parsing manifest {}", path.display()))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn update_entry(path: &Path, run_id: &str, apply: impl Fn(&mut RunManifestEntry)) -> Result<()> {
    let mut entries = read_manifest(path)?;
    let mut changed = false;
    for entry in &mut entries {
        if entry.run_id == run_id {
            apply(entry);
            changed = true;
        }
    }
    if !changed {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    for entry in entries {
        serde_json::to_writer(&mut file, &entry)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

fn compute_log_path(base: &Path) -> Result<PathBuf> {
    let now = Local::now();
    let dir = base
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()))
        .join(format!("{:02}", now.day()));
    fs::create_dir_all(&dir)?;
    Ok(dir.join(format!(
        "run-{}.log.jsonl",
        Utc::now().format("%Y%m%d-%H%M%S")
    )))
}

fn log_run_event(path: &Path, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
    let logger = JsonLogger::new(path)?;
    logger.log(&LogRecord::new("reorder", level, message).with_metadata(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_entries_update_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("runs/index.jsonl");
        let first = RunManifestEntry::new(None, PathBuf::from("data"), dir.path().join("a.log"));
        let second = RunManifestEntry::new(None, PathBuf::from("data"), dir.path().join("b.log"));
        append_manifest(&manifest, &first).unwrap();
        append_manifest(&manifest, &second).unwrap();

        update_entry(&manifest, &second.run_id, |e| {
            e.status = "completed".into();
            e.rows = Some(15);
        })
        .unwrap();
        let entries = read_manifest(&manifest).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first);
        assert_eq!(entries[1].status, "completed");
        assert_eq!(entries[1].rows, Some(15));

        // Unknown ids leave the file untouched.
        update_entry(&manifest, "run-missing", |e| e.status = "failed".into()).unwrap();
        assert_eq!(read_manifest(&manifest).unwrap(), entries);
    }

    #[test]
    fn missing_manifest_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_manifest(&dir.path().join("none.jsonl"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn cli_overrides_data_and_artifact_dirs() {
        let args = PipelineArgs {
            config: None,
            data_dir: Some(PathBuf::from("/srv/instacart")),
            artifacts_dir: Some(PathBuf::from("/srv/models")),
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.data.dir, PathBuf::from("/srv/instacart"));
        assert_eq!(config.artifacts.dir, PathBuf::from("/srv/models"));
    }

    #[test]
    fn cli_parses_score_command() {
        let cli = Cli::try_parse_from([
            "reorder", "score", "--user", "1", "--product", "196", "--threshold", "0.7",
        ])
        .unwrap();
        match cli.command {
            Commands::Score {
                user,
                product,
                threshold,
                ..
            } => {
                assert_eq!((user, product), (1, 196));
                assert_eq!(threshold, Some(0.7));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
