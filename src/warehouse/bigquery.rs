//! BigQuery REST implementations of the reader and writer.
//!
//! The reader runs a parameterized `jobs.query` and pages through
//! `getQueryResults`; the writer appends with a single `tabledata.insertAll`.

use crate::config::{SourceConfig, TargetConfig};
use crate::error::{PipelineError, Result};
use crate::models::{InsightRecord, Metric, MetricRow, MetricWindow};
use crate::warehouse::auth::TokenProvider;
use crate::warehouse::{InsightSink, MetricSource};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How long BigQuery may hold a query request open, in milliseconds.
const QUERY_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    query: String,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameter>,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameter {
    name: &'static str,
    parameter_type: ParameterType,
    parameter_value: ParameterValue,
}

impl QueryParameter {
    fn date(name: &'static str, value: NaiveDate) -> Self {
        Self {
            name,
            parameter_type: ParameterType {
                kind: "DATE".to_string(),
            },
            parameter_value: ParameterValue {
                value: value.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ParameterType {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct ParameterValue {
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest {
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
    rows: Vec<InsertRow>,
}

#[derive(Debug, Serialize)]
struct InsertRow {
    json: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertError>,
}

#[derive(Debug, Deserialize)]
struct InsertError {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Positions of the columns the reader needs in a result schema.
#[derive(Debug)]
struct ColumnMap {
    date: usize,
    client: usize,
    metrics: Vec<(Metric, usize)>,
}

impl ColumnMap {
    fn from_schema(schema: &TableSchema) -> Result<Self> {
        let position = |name: &str| schema.fields.iter().position(|f| f.name == name);

        let date = position("date")
            .ok_or_else(|| PipelineError::source("Query result has no 'date' column"))?;
        let client = position("client")
            .ok_or_else(|| PipelineError::source("Query result has no 'client' column"))?;
        let metrics = schema
            .fields
            .iter()
            .enumerate()
            .filter_map(|(idx, f)| Metric::from_column(&f.name).map(|m| (m, idx)))
            .collect();

        Ok(Self {
            date,
            client,
            metrics,
        })
    }

    /// Parse one result row. Rows without a client cannot be attributed and
    /// come back as `None`.
    fn parse_row(&self, row: &TableRow) -> Result<Option<MetricRow>> {
        let date_text = cell_text(row, self.date)
            .ok_or_else(|| PipelineError::source("Row with NULL date"))?;
        let date = NaiveDate::parse_from_str(&date_text, "%Y-%m-%d")
            .map_err(|e| PipelineError::source(format!("Invalid date '{}': {}", date_text, e)))?;
        let Some(client) = cell_text(row, self.client) else {
            return Ok(None);
        };

        let mut parsed = MetricRow::new(date, client);
        for &(metric, idx) in &self.metrics {
            let value = match cell_text(row, idx) {
                Some(text) => {
                    let value = text.parse::<f64>().map_err(|_| {
                        PipelineError::source(format!("Non-numeric {} value '{}'", metric, text))
                    })?;
                    // NaN and infinities count as missing
                    value.is_finite().then_some(value)
                }
                None => None,
            };
            parsed.set(metric, value);
        }

        Ok(Some(parsed))
    }
}

/// Text of a cell, `None` for NULL or a missing cell.
fn cell_text(row: &TableRow, idx: usize) -> Option<String> {
    match row.f.get(idx).map(|c| &c.v) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

/// Project ids may carry a domain prefix (`example.com:project`).
fn is_valid_table_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

fn is_valid_column(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_table_parts(parts: &[&str]) -> Result<()> {
    for part in parts {
        if !is_valid_table_part(part) {
            return Err(PipelineError::config(format!(
                "Invalid BigQuery identifier '{}'",
                part
            )));
        }
    }
    Ok(())
}

fn check_columns(columns: &[&str]) -> Result<()> {
    for column in columns {
        if !is_valid_column(column) {
            return Err(PipelineError::config(format!(
                "Invalid column name '{}'",
                column
            )));
        }
    }
    Ok(())
}

/// Send a request and decode the JSON body, mapping every failure with `fail`.
async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    fail: fn(String) -> PipelineError,
) -> Result<T> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            fail(format!("BigQuery request timed out: {}", e))
        } else if e.is_connect() {
            fail(format!("Cannot connect to BigQuery: {}", e))
        } else {
            fail(format!("BigQuery request failed: {}", e))
        }
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(fail(format!("BigQuery API error {}: {}", status, body)));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| fail(format!("Failed to parse BigQuery response: {}", e)))
}

/// Reads the daily per-client metric table.
pub struct BigQueryReader {
    source: SourceConfig,
    api_base: String,
    auth: Arc<TokenProvider>,
    http_client: reqwest::Client,
}

impl BigQueryReader {
    pub fn new(source: SourceConfig, api_base: String, auth: Arc<TokenProvider>) -> Result<Self> {
        check_table_parts(&[
            source.project_id.as_str(),
            source.dataset_id.as_str(),
            source.table.as_str(),
        ])?;
        check_columns(&[source.date_column.as_str(), source.client_column.as_str()])?;

        Ok(Self {
            source,
            api_base: api_base.trim_end_matches('/').to_string(),
            auth,
            http_client: reqwest::Client::new(),
        })
    }

    /// SQL for one window; the bounds are bound as `@period_start`/`@period_end`.
    pub fn build_query(&self) -> String {
        let metrics: Vec<&str> = Metric::ALL.iter().map(|m| m.column()).collect();

        format!(
            "SELECT\n  DATE({date}) AS date,\n  {client} AS client,\n  {metrics}\n\
             FROM `{project}.{dataset}.{table}`\n\
             WHERE DATE({date}) BETWEEN @period_start AND @period_end",
            date = self.source.date_column,
            client = self.source.client_column,
            metrics = metrics.join(",\n  "),
            project = self.source.project_id,
            dataset = self.source.dataset_id,
            table = self.source.table,
        )
    }

    fn queries_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.api_base, self.source.project_id
        )
    }

    async fn token(&self) -> Result<String> {
        self.auth
            .access_token()
            .await
            .map_err(|e| PipelineError::source(e.to_string()))
    }

    async fn get_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse> {
        let token = self.token().await?;
        let mut params = vec![("timeoutMs", QUERY_TIMEOUT_MS.to_string())];
        if let Some(page) = page_token {
            params.push(("pageToken", page.to_string()));
        }
        if let Some(ref location) = job.location {
            params.push(("location", location.clone()));
        }

        let request = self
            .http_client
            .get(format!("{}/{}", self.queries_url(), job.job_id))
            .bearer_auth(token)
            .query(&params);

        send_json(request, PipelineError::SourceUnavailable).await
    }
}

#[async_trait]
impl MetricSource for BigQueryReader {
    async fn fetch(&self, period_start: NaiveDate, period_end: NaiveDate) -> Result<MetricWindow> {
        let body = QueryRequest {
            query: self.build_query(),
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: vec![
                QueryParameter::date("period_start", period_start),
                QueryParameter::date("period_end", period_end),
            ],
            timeout_ms: QUERY_TIMEOUT_MS,
            location: self.source.location.clone(),
        };

        debug!("Running query:\n{}", body.query);
        let token = self.token().await?;
        let request = self
            .http_client
            .post(self.queries_url())
            .bearer_auth(token)
            .json(&body);
        let mut response: QueryResponse = send_json(request, PipelineError::SourceUnavailable).await?;

        let mut columns: Option<ColumnMap> = None;
        let mut rows = MetricWindow::new();
        let mut pages = 0usize;
        let mut dropped = 0usize;

        loop {
            let job = response.job_reference.clone();

            if !response.job_complete {
                let job = job.ok_or_else(|| {
                    PipelineError::source("Query still running but no job reference returned")
                })?;
                debug!("Query job {} not complete yet, polling", job.job_id);
                response = self.get_results(&job, None).await?;
                continue;
            }

            if columns.is_none() {
                let schema = response
                    .schema
                    .as_ref()
                    .ok_or_else(|| PipelineError::source("Query result has no schema"))?;
                columns = Some(ColumnMap::from_schema(schema)?);
            }
            if let Some(ref map) = columns {
                for row in &response.rows {
                    match map.parse_row(row)? {
                        Some(parsed) => rows.push(parsed),
                        None => dropped += 1,
                    }
                }
            }
            pages += 1;

            match (response.page_token.take(), job) {
                (Some(page), Some(job)) => {
                    response = self.get_results(&job, Some(&page)).await?;
                }
                (Some(_), None) => {
                    return Err(PipelineError::source(
                        "Paged query result without a job reference",
                    ));
                }
                (None, _) => break,
            }
        }

        if dropped > 0 {
            warn!(
                "Dropped {} rows with a NULL {}",
                dropped, self.source.client_column
            );
        }
        info!(
            "Fetched {} rows for {}..={} ({} pages)",
            rows.len(),
            period_start,
            period_end,
            pages
        );
        Ok(rows)
    }
}

/// Appends insight records to the target table.
pub struct BigQueryWriter {
    target: TargetConfig,
    project_id: String,
    dataset_id: String,
    api_base: String,
    auth: Arc<TokenProvider>,
    http_client: reqwest::Client,
}

impl BigQueryWriter {
    pub fn new(
        target: TargetConfig,
        source: &SourceConfig,
        api_base: String,
        auth: Arc<TokenProvider>,
    ) -> Result<Self> {
        let project_id = target.effective_project(source).to_string();
        let dataset_id = target.effective_dataset(source).to_string();
        check_table_parts(&[
            project_id.as_str(),
            dataset_id.as_str(),
            target.table.as_str(),
        ])?;
        check_columns(&[
            target.client_column.as_str(),
            target.date_column.as_str(),
            target.summary_column.as_str(),
        ])?;

        Ok(Self {
            target,
            project_id,
            dataset_id,
            api_base: api_base.trim_end_matches('/').to_string(),
            auth,
            http_client: reqwest::Client::new(),
        })
    }

    fn insert_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.api_base, self.project_id, self.dataset_id, self.target.table
        )
    }

    fn to_row(&self, record: &InsightRecord) -> InsertRow {
        let mut json = Map::new();
        json.insert(
            self.target.client_column.clone(),
            Value::String(record.client.clone()),
        );
        json.insert(
            self.target.date_column.clone(),
            Value::String(record.report_date.to_string()),
        );
        json.insert(
            self.target.summary_column.clone(),
            Value::String(record.summary_text.clone()),
        );
        InsertRow { json }
    }
}

#[async_trait]
impl InsightSink for BigQueryWriter {
    async fn append(&self, batch: &[InsightRecord]) -> Result<()> {
        if batch.is_empty() {
            info!("Empty insight batch, nothing to append");
            return Ok(());
        }

        // No insertId: every run appends new rows, even for a window already reported.
        let body = InsertAllRequest {
            skip_invalid_rows: false,
            ignore_unknown_values: false,
            rows: batch.iter().map(|r| self.to_row(r)).collect(),
        };

        let token = self
            .auth
            .access_token()
            .await
            .map_err(|e| PipelineError::sink(e.to_string()))?;
        let request = self
            .http_client
            .post(self.insert_url())
            .bearer_auth(token)
            .json(&body);
        let response: InsertAllResponse =
            send_json(request, PipelineError::SinkUnavailable).await?;

        if let Some(first) = response.insert_errors.first() {
            let detail = first
                .errors
                .first()
                .map(|e| format!("{}: {}", e.reason, e.message))
                .unwrap_or_default();
            return Err(PipelineError::sink(format!(
                "{} rows rejected (first at index {}: {})",
                response.insert_errors.len(),
                first.index,
                detail
            )));
        }

        info!(
            "Appended {} insights to {}.{}.{}",
            batch.len(),
            self.project_id,
            self.dataset_id,
            self.target.table
        );
        Ok(())
    }
}
