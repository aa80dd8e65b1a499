//! Configuration file handling.
//!
//! This module handles loading `.perf-insights.toml` files and merging them
//! with command-line arguments and environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".perf-insights.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Table the metric rows are read from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Table the insights are appended to.
    #[serde(default)]
    pub target: TargetConfig,

    /// Analytics store credentials.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Text-generation model settings.
    #[serde(default)]
    pub model: ModelConfig,
}

/// What to do when one client's summary cannot be generated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the run at the first failure; nothing is written.
    #[default]
    Abort,
    /// Leave the client out, report it, and write the rest.
    Skip,
}

/// Text-generation backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI-compatible chat completions API.
    #[default]
    Openai,
    /// Local Ollama server.
    Ollama,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Number of clients summarized concurrently (1 = one after another).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Behaviour on a per-client generation failure.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

/// Source table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// GCP project holding the dataset.
    #[serde(default)]
    pub project_id: String,

    /// BigQuery dataset.
    #[serde(default)]
    pub dataset_id: String,

    /// Table with one row per client and day.
    #[serde(default)]
    pub table: String,

    /// Column holding the observation date (DATE or TIMESTAMP).
    #[serde(default = "default_source_date_column")]
    pub date_column: String,

    /// Column holding the client name.
    #[serde(default = "default_source_client_column")]
    pub client_column: String,

    /// Dataset location, e.g. "US" or "southamerica-east1".
    #[serde(default)]
    pub location: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            dataset_id: String::new(),
            table: String::new(),
            date_column: default_source_date_column(),
            client_column: default_source_client_column(),
            location: None,
        }
    }
}

fn default_source_date_column() -> String {
    "data_inicio".to_string()
}

fn default_source_client_column() -> String {
    "account_name".to_string()
}

/// Target table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// GCP project; the source project when empty.
    #[serde(default)]
    pub project_id: String,

    /// BigQuery dataset; the source dataset when empty.
    #[serde(default)]
    pub dataset_id: String,

    /// Table insights are appended to.
    #[serde(default)]
    pub table: String,

    #[serde(default = "default_target_client_column")]
    pub client_column: String,

    #[serde(default = "default_target_date_column")]
    pub date_column: String,

    #[serde(default = "default_target_summary_column")]
    pub summary_column: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            dataset_id: String::new(),
            table: String::new(),
            client_column: default_target_client_column(),
            date_column: default_target_date_column(),
            summary_column: default_target_summary_column(),
        }
    }
}

fn default_target_client_column() -> String {
    "client".to_string()
}

fn default_target_date_column() -> String {
    "date".to_string()
}

fn default_target_summary_column() -> String {
    "summary_text".to_string()
}

/// Analytics store credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Path to a service-account JSON key.
    #[serde(default)]
    pub credential_path: Option<PathBuf>,

    /// Pre-minted OAuth access token. Takes precedence over the key file.
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,

    /// BigQuery REST endpoint.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            credential_path: None,
            access_token: None,
            api_base: default_api_base(),
        }
    }
}

fn default_api_base() -> String {
    "https://bigquery.googleapis.com".to_string()
}

/// Text-generation model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Backend to talk to.
    #[serde(default)]
    pub provider: Provider,

    /// Model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Base URL of the API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// API key (not needed for Ollama).
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            name: default_model(),
            api_url: default_api_url(),
            api_key: None,
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_timeout() -> u64 {
    120
}

impl TargetConfig {
    /// Project the insights land in.
    pub fn effective_project<'a>(&'a self, source: &'a SourceConfig) -> &'a str {
        if self.project_id.is_empty() {
            &source.project_id
        } else {
            &self.project_id
        }
    }

    /// Dataset the insights land in.
    pub fn effective_dataset<'a>(&'a self, source: &'a SourceConfig) -> &'a str {
        if self.dataset_id.is_empty() {
            &source.dataset_id
        } else {
            &self.dataset_id
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// Arguments (and the environment variables behind them) take precedence
    /// over the file, but only when they were actually provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
        }
        if let Some(policy) = args.failure_policy {
            self.general.failure_policy = policy;
        }

        if let Some(ref project) = args.project_id {
            self.source.project_id = project.clone();
        }
        if let Some(ref dataset) = args.dataset_id {
            self.source.dataset_id = dataset.clone();
        }
        if let Some(ref table) = args.source_table {
            self.source.table = table.clone();
        }

        if let Some(ref project) = args.target_project_id {
            self.target.project_id = project.clone();
        }
        if let Some(ref dataset) = args.target_dataset_id {
            self.target.dataset_id = dataset.clone();
        }
        if let Some(ref table) = args.target_table {
            self.target.table = table.clone();
        }

        if let Some(ref path) = args.credential_path {
            self.credentials.credential_path = Some(path.clone());
        }
        if let Some(ref token) = args.access_token {
            self.credentials.access_token = Some(token.clone());
        }

        if let Some(provider) = args.provider {
            self.model.provider = provider;
        }
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.model_url {
            self.model.api_url = url.clone();
        }
        if let Some(ref key) = args.api_key {
            self.model.api_key = Some(key.clone());
        }
        if let Some(temperature) = args.temperature {
            self.model.temperature = temperature;
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }
    }

    /// Check that the merged configuration is complete enough to run.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let required = [
            ("source project (PROJECT_ID)", &self.source.project_id),
            ("source dataset (DATASET_ID)", &self.source.dataset_id),
            ("source table (SOURCE_TABLE)", &self.source.table),
            ("target table (TARGET_TABLE)", &self.target.table),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(format!("Missing {}", name));
            }
        }

        let source_id = format!(
            "{}.{}.{}",
            self.source.project_id, self.source.dataset_id, self.source.table
        );
        if source_id == self.target_table_id() {
            return Err("Source and target tables must differ".to_string());
        }

        if self.credentials.access_token.is_none() && self.credentials.credential_path.is_none()
        {
            return Err(
                "No BigQuery credentials: set GOOGLE_APPLICATION_CREDENTIALS or BIGQUERY_ACCESS_TOKEN"
                    .to_string(),
            );
        }

        if !is_http_url(&self.credentials.api_base) {
            return Err("BigQuery API base must start with 'http://' or 'https://'".to_string());
        }
        if !is_http_url(&self.model.api_url) {
            return Err("Model API URL must start with 'http://' or 'https://'".to_string());
        }

        if self.model.provider == Provider::Openai && self.model.api_key.is_none() {
            return Err("Missing API key (OPENAI_API_KEY)".to_string());
        }

        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err("Temperature must be between 0.0 and 2.0".to_string());
        }

        if self.model.timeout_seconds == 0 {
            return Err("Timeout must be at least 1 second".to_string());
        }

        if self.general.concurrency == 0 {
            return Err("Concurrency must be at least 1".to_string());
        }

        Ok(())
    }

    /// Fully qualified target table, `project.dataset.table`.
    pub fn target_table_id(&self) -> String {
        format!(
            "{}.{}.{}",
            self.target.effective_project(&self.source),
            self.target.effective_dataset(&self.source),
            self.target.table
        )
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;

    fn complete_config() -> Config {
        let mut config = Config::default();
        config.source.project_id = "acme-analytics".to_string();
        config.source.dataset_id = "marketing".to_string();
        config.source.table = "daily_performance".to_string();
        config.target.table = "weekly_insights".to_string();
        config.credentials.access_token = Some("token".to_string());
        config.model.api_key = Some("sk-test".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model.name, "gpt-4o");
        assert_eq!(config.model.temperature, 0.3);
        assert_eq!(config.model.provider, Provider::Openai);
        assert_eq!(config.general.concurrency, 1);
        assert_eq!(config.general.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.source.date_column, "data_inicio");
        assert_eq!(config.target.summary_column, "summary_text");
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
concurrency = 4
failure_policy = "skip"

[source]
project_id = "acme-analytics"
dataset_id = "marketing"
table = "daily_performance"
location = "US"

[target]
table = "weekly_insights"

[model]
provider = "ollama"
name = "llama3.2:latest"
api_url = "http://localhost:11434"
temperature = 0.2
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.concurrency, 4);
        assert_eq!(config.general.failure_policy, FailurePolicy::Skip);
        assert_eq!(config.source.location.as_deref(), Some("US"));
        assert_eq!(config.source.client_column, "account_name");
        assert_eq!(config.model.provider, Provider::Ollama);
        assert_eq!(config.model.temperature, 0.2);
        assert_eq!(config.target_table_id(), "acme-analytics.marketing.weekly_insights");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[source]\ntable = \"rows\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.source.table, "rows");
        assert_eq!(config.model.name, "gpt-4o");

        std::fs::write(&path, "[source\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_merge_only_overrides_provided_values() {
        let mut config = complete_config();
        config.general.concurrency = 3;

        let args = Args {
            target_table: Some("other_insights".to_string()),
            failure_policy: Some(FailurePolicy::Skip),
            ..Args::default()
        };
        config.merge_with_args(&args);

        assert_eq!(config.target.table, "other_insights");
        assert_eq!(config.general.failure_policy, FailurePolicy::Skip);
        assert_eq!(config.general.concurrency, 3);
        assert_eq!(config.source.table, "daily_performance");
    }

    #[test]
    fn test_validate_complete_config() {
        assert!(complete_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_table() {
        let mut config = complete_config();
        config.source.table.clear();
        let err = config.validate().unwrap_err();
        assert!(err.contains("SOURCE_TABLE"));
    }

    #[test]
    fn test_validate_rejects_same_source_and_target() {
        let mut config = complete_config();
        config.target.table = config.source.table.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut config = complete_config();
        config.credentials.access_token = None;
        assert!(config.validate().is_err());

        config.credentials.credential_path = Some(PathBuf::from("/secrets/sa.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ollama_needs_no_key() {
        let mut config = complete_config();
        config.model.api_key = None;
        assert!(config.validate().is_err());

        config.model.provider = Provider::Ollama;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = complete_config();
        config.model.temperature = 2.5;
        assert!(config.validate().is_err());

        let mut config = complete_config();
        config.general.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[source]"));
        assert!(toml_str.contains("[target]"));
        assert!(toml_str.contains("[model]"));
        assert!(!toml_str.contains("api_key"));
    }
}
