//! HDX Ingest - Health data export preprocessing tool

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Table};
use hdx_common::logging::{init_logging, LogConfig, LogLevel};
use hdx_common::manifest::Manifest;
use hdx_common::types::TIMESTAMP_FORMAT;
use hdx_ingest::config::parse_metric_list;
use hdx_ingest::{DedupScope, DstPolicy, Pipeline, PipelineConfig};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hdx-ingest")]
#[command(author, version, about = "Health data export preprocessing tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Pipeline configuration file (TOML)
    #[arg(short, long, env = "HDX_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Preprocess an export into per-metric tables
    Run(RunArgs),

    /// Print the manifest of a processed output directory
    Manifest {
        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the raw JSON
        #[arg(long)]
        json: bool,

        /// Check every table against its recorded checksum
        #[arg(long)]
        verify: bool,
    },

    /// Print the effective configuration as TOML
    Config(RunArgs),
}

/// Flags overriding the configuration file and environment
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Export document
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Reference timezone (IANA name)
    #[arg(long = "tz")]
    timezone: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Comma separated metrics to produce
    #[arg(long)]
    include: Option<String>,

    /// Comma separated metrics to skip
    #[arg(long)]
    exclude: Option<String>,

    /// earliest, latest or reject
    #[arg(long)]
    dst_policy: Option<DstPolicy>,

    /// table or batch
    #[arg(long)]
    dedup_scope: Option<DedupScope>,

    /// One writer task per metric
    #[arg(long)]
    parallel: bool,

    /// Do not read GPX route files
    #[arg(long)]
    no_routes: bool,

    /// Stop after this many records
    #[arg(long)]
    limit: Option<usize>,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,
}

impl RunArgs {
    fn apply(&self, mut config: PipelineConfig) -> Result<PipelineConfig> {
        if let Some(input) = &self.input {
            config.input_path = input.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(tz) = &self.timezone {
            config.reference_timezone = tz.clone();
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(list) = &self.include {
            config.include_metrics = parse_metric_list(list)?;
        }
        if let Some(list) = &self.exclude {
            config.exclude_metrics = parse_metric_list(list)?;
        }
        if let Some(policy) = self.dst_policy {
            config.dst_policy = policy;
        }
        if let Some(scope) = self.dedup_scope {
            config.dedup_scope = scope;
        }
        if self.parallel {
            config.parallel = true;
        }
        if self.no_routes {
            config.summarize_routes = false;
        }
        if let Some(limit) = self.limit {
            config.parse_limit = Some(limit);
        }
        if self.progress {
            config.show_progress = true;
        }
        Ok(config)
    }
}

/// Defaults, then the TOML file, then `HDX_*` variables, then flags
fn load_config(file: Option<&PathBuf>, args: &RunArgs) -> Result<PipelineConfig> {
    let config = match file {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let config = args.apply(config.merge_env()?)?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(LogLevel::from_verbosity(cli.verbose))
        .log_file_prefix("hdx-ingest")
        .build();

    // Environment variables take precedence over the flags
    let log_config = log_config.merge_env().unwrap_or_else(|e| {
        eprintln!("Warning: ignoring invalid logging environment: {e}");
        LogConfig::builder()
            .level(LogLevel::from_verbosity(cli.verbose))
            .log_file_prefix("hdx-ingest")
            .build()
    });

    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {e}");
            None
        },
    };

    let code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            1
        },
    };

    // process::exit skips destructors; flush buffered file logs first
    drop(guard);
    process::exit(code);
}

async fn execute(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::Run(args) => run(load_config(cli.config.as_ref(), args)?).await,
        Command::Manifest {
            output,
            json,
            verify,
        } => {
            let args = RunArgs {
                output: output.clone(),
                ..RunArgs::default()
            };
            let config = load_config(cli.config.as_ref(), &args)?;
            show_manifest(&config, *json, *verify)
        },
        Command::Config(args) => {
            let config = load_config(cli.config.as_ref(), args)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(0)
        },
    }
}

async fn run(config: PipelineConfig) -> Result<i32> {
    let pipeline = Pipeline::new(config)?;

    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current record");
            token.cancel();
        }
    });

    let report = pipeline.run().await?;
    let summary = &report.summary;

    println!("{}", summary.to_table());
    if !summary.unroutable.is_empty() {
        println!("{}", summary.unroutable_table());
    }
    println!(
        "{} records, {} rows written, {} malformed, {} excluded, {} unroutable in {:.1}s",
        summary.records_seen,
        summary.total_written(),
        summary.malformed,
        summary.excluded,
        summary.total_unroutable(),
        summary.elapsed.as_secs_f64()
    );

    if summary.has_failures() {
        for (metric, reason) in &summary.failed_metrics {
            eprintln!("Failed: {metric}: {reason}");
        }
        return Ok(2);
    }
    info!(output = %pipeline.config().output_dir.display(), "Tables ready");
    Ok(0)
}

fn show_manifest(config: &PipelineConfig, json: bool, verify: bool) -> Result<i32> {
    let manifest = Manifest::load(&config.output_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
    } else {
        println!(
            "Generated {} ({}), input {}",
            manifest.generated_at.to_rfc3339(),
            manifest.reference_timezone,
            manifest.input.as_deref().unwrap_or("-")
        );

        let format = |ts: Option<chrono::NaiveDateTime>| {
            ts.map(|t| t.format(TIMESTAMP_FORMAT).to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Metric", "Rows", "Earliest", "Latest", "Sources"]);
        for (metric, summary) in &manifest.metrics {
            let sources: Vec<&str> = summary.distinct_sources.iter().map(String::as_str).collect();
            table.add_row(vec![
                Cell::new(metric.as_str()),
                Cell::new(summary.row_count),
                Cell::new(format(summary.earliest_timestamp)),
                Cell::new(format(summary.latest_timestamp)),
                Cell::new(sources.join(", ")),
            ]);
        }
        println!("{table}");
    }

    if !verify {
        return Ok(0);
    }
    let mut corrupt = 0;
    for metric in manifest.metrics.keys() {
        if let Err(e) = manifest.verify_table(&config.output_dir, *metric) {
            eprintln!("{metric}: {e}");
            corrupt += 1;
        }
    }
    if corrupt > 0 {
        return Ok(2);
    }
    println!("All {} tables match their checksums", manifest.metrics.len());
    Ok(0)
}
