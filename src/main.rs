//! Perf Insights - weekly marketing performance summaries
//!
//! Reads seven days of per-client metrics from BigQuery, has an LLM write a
//! short assessment per client, and appends the summaries to BigQuery.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Configuration or startup error
//!   3 - Analytics store could not be read
//!   4 - Summary generation failed (abort policy)
//!   5 - Insights could not be written

mod analysis;
mod cli;
mod config;
mod error;
mod generator;
mod models;
mod pipeline;
mod warehouse;

use anyhow::{Context, Result};
use cli::Args;
use config::{Config, FailurePolicy, DEFAULT_CONFIG_FILE};
use error::PipelineError;
use generator::LlmSummaryGenerator;
use pipeline::{Pipeline, PipelineOptions};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use warehouse::{BigQueryReader, BigQueryWriter, TokenProvider};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let dotenv = dotenvy::dotenv();

    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("Perf Insights v{}", env!("CARGO_PKG_VERSION"));
    match dotenv {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => debug!("No .env file found"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };

    match run(&args, config).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("Run failed: {}", e);
            eprintln!("\n❌ Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Handle --init-config: generate a default .perf-insights.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Fill in the source and target tables, then run again.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Load the config file (if any), apply arguments and environment, validate.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        Config::load(config_path)?
    } else {
        match Config::load_default()? {
            Some(config) => {
                info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
                config
            }
            None => {
                debug!("No config file found, using defaults");
                Config::default()
            }
        }
    };

    config.merge_with_args(args);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

/// Wire the BigQuery reader and writer and the LLM client into a pipeline.
fn build_pipeline(config: &Config, show_progress: bool) -> error::Result<Pipeline> {
    let auth = Arc::new(TokenProvider::from_config(&config.credentials)?);
    let api_base = config.credentials.api_base.clone();

    let reader = BigQueryReader::new(config.source.clone(), api_base.clone(), auth.clone())?;
    let writer = BigQueryWriter::new(config.target.clone(), &config.source, api_base, auth)?;
    let generator = LlmSummaryGenerator::new(config.model.clone())?;

    let options = PipelineOptions {
        concurrency: config.general.concurrency,
        failure_policy: config.general.failure_policy,
        show_progress,
    };

    Ok(Pipeline::new(
        Arc::new(reader),
        Arc::new(generator),
        Arc::new(writer),
        options,
    ))
}

/// Run the pipeline once and print a summary.
async fn run(args: &Args, config: Config) -> Result<(), PipelineError> {
    let source_table = format!(
        "{}.{}.{}",
        config.source.project_id, config.source.dataset_id, config.source.table
    );

    println!("📊 Perf Insights");
    println!("   Source: {}", source_table);
    println!("   Target: {}", config.target_table_id());
    println!(
        "   Model: {} ({:?}, temperature {})",
        config.model.name, config.model.provider, config.model.temperature
    );
    println!(
        "   Concurrency: {} | On failure: {:?}",
        config.general.concurrency, config.general.failure_policy
    );

    let pipeline = build_pipeline(&config, !args.quiet)?;

    if args.dry_run {
        return handle_dry_run(&pipeline).await;
    }

    println!("\n🔬 Generating insights...");
    let report = pipeline.run().await?;

    println!("\n📝 Run Summary:");
    println!("   Window: {} ({} days)", report.window, report.window.days());
    println!("   Rows fetched: {}", report.rows_fetched);
    println!("   Clients: {}", report.clients);
    println!("   Insights written: {}", report.records_written);
    if !report.skipped.is_empty() {
        println!("   ⚠️  Skipped clients ({}):", report.skipped.len());
        for skipped in &report.skipped {
            println!("     - {}: {}", skipped.client, skipped.reason);
        }
    }
    println!("   Duration: {:.1}s", report.duration_seconds);

    if config.general.failure_policy == FailurePolicy::Skip && !report.is_complete() {
        println!("\n✅ Run complete with {} skipped clients.", report.skipped.len());
    } else {
        println!("\n✅ Run complete!");
    }

    Ok(())
}

/// Handle --dry-run: fetch and aggregate, print, exit.
async fn handle_dry_run(pipeline: &Pipeline) -> Result<(), PipelineError> {
    println!("\n🔍 Dry run: fetching and aggregating (no LLM calls, no writes)...\n");

    let preview = pipeline
        .aggregate_for(chrono::Local::now().date_naive())
        .await?;

    println!("   Window: {}", preview.window);
    println!("   Rows fetched: {}", preview.rows_fetched);

    if preview.aggregates.is_empty() {
        println!("   No clients found in the window.");
    } else {
        println!("   {} clients would be summarized:\n", preview.aggregates.len());
        for line in analysis::format_aggregates(&preview.aggregates).lines() {
            println!("     {}", line);
        }
    }

    println!("\n✅ Dry run complete. Nothing was written.");
    Ok(())
}
