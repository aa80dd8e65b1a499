//! Command-line interface argument parsing.
//!
//! Every option can also come from an environment variable, so a scheduled
//! run needs no arguments at all.

use crate::config::{FailurePolicy, Provider};
use clap::Parser;
use std::path::PathBuf;

/// Perf Insights - weekly marketing performance summaries
///
/// Reads the last seven days (ending yesterday) of per-client metrics from
/// BigQuery, asks an LLM for a short assessment per client, and appends the
/// summaries to a BigQuery table.
///
/// Examples:
///   perf-insights
///   perf-insights --config ./insights.toml --failure-policy skip
///   perf-insights --dry-run
///   perf-insights --init-config
#[derive(Parser, Debug, Clone)]
#[cfg_attr(test, derive(Default))]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for .perf-insights.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// GCP project of the source dataset
    #[arg(long, env = "PROJECT_ID", value_name = "PROJECT")]
    pub project_id: Option<String>,

    /// BigQuery dataset of the source table
    #[arg(long, env = "DATASET_ID", value_name = "DATASET")]
    pub dataset_id: Option<String>,

    /// Table with daily per-client metrics
    #[arg(long, env = "SOURCE_TABLE", value_name = "TABLE")]
    pub source_table: Option<String>,

    /// GCP project of the target table (defaults to the source project)
    #[arg(long, env = "TARGET_PROJECT_ID", value_name = "PROJECT")]
    pub target_project_id: Option<String>,

    /// Dataset of the target table (defaults to the source dataset)
    #[arg(long, env = "TARGET_DATASET_ID", value_name = "DATASET")]
    pub target_dataset_id: Option<String>,

    /// Table the insights are appended to
    #[arg(long, env = "TARGET_TABLE", value_name = "TABLE")]
    pub target_table: Option<String>,

    /// Service-account JSON key for BigQuery
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS", value_name = "FILE")]
    pub credential_path: Option<PathBuf>,

    /// Pre-minted OAuth access token for BigQuery
    #[arg(long, env = "BIGQUERY_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Text-generation backend
    #[arg(long, env = "INSIGHTS_PROVIDER", value_name = "PROVIDER")]
    pub provider: Option<Provider>,

    /// Model used to write the summaries
    #[arg(short, long, env = "INSIGHTS_MODEL")]
    pub model: Option<String>,

    /// Base URL of the text-generation API
    #[arg(long, env = "INSIGHTS_MODEL_URL", value_name = "URL")]
    pub model_url: Option<String>,

    /// API key for the text-generation service
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Sampling temperature for the summaries
    #[arg(long, env = "INSIGHTS_TEMPERATURE")]
    pub temperature: Option<f32>,

    /// Request timeout in seconds for each summary
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Number of clients summarized at once
    #[arg(long, env = "INSIGHTS_CONCURRENCY", value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// What to do when a client's summary fails (abort, skip)
    #[arg(long, env = "INSIGHTS_FAILURE_POLICY", value_name = "POLICY")]
    pub failure_policy: Option<FailurePolicy>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: fetch and aggregate, print the aggregates, write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .perf-insights.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate flag combinations that don't depend on the config file.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        if let Some(ref path) = self.config {
            if !path.is_file() {
                return Err(format!("Config file does not exist: {}", path.display()));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
