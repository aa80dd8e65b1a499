//! Run orchestration.
//!
//! One run walks `ComputeWindow -> Fetch -> Aggregate -> GenerateAll ->
//! Persist -> Done`; any error ends it in the failed state and nothing is
//! persisted. Summaries are generated with a bounded per-client fan-out and
//! collected in full before the single append.

use crate::analysis;
use crate::config::FailurePolicy;
use crate::error::Result;
use crate::generator::SummaryGenerator;
use crate::models::{
    ClientAggregate, InsightBatch, InsightRecord, ReportWindow, RunReport, SkippedClient,
};
use crate::warehouse::{InsightSink, MetricSource};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// States of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ComputeWindow,
    Fetch,
    Aggregate,
    GenerateAll,
    Persist,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ComputeWindow => "compute-window",
            Stage::Fetch => "fetch",
            Stage::Aggregate => "aggregate",
            Stage::GenerateAll => "generate-all",
            Stage::Persist => "persist",
            Stage::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Knobs for a run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Maximum summaries in flight at once.
    pub concurrency: usize,
    /// Behaviour on a per-client generation failure.
    pub failure_policy: FailurePolicy,
    /// Draw a progress bar during generation.
    pub show_progress: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            failure_policy: FailurePolicy::Abort,
            show_progress: false,
        }
    }
}

/// Window and aggregates for one run, before any summary is generated.
#[derive(Debug, Clone)]
pub struct AggregatedWindow {
    pub window: ReportWindow,
    pub rows_fetched: usize,
    pub aggregates: Vec<ClientAggregate>,
}

/// Reader, generator and writer wired together.
pub struct Pipeline {
    source: Arc<dyn MetricSource>,
    generator: Arc<dyn SummaryGenerator>,
    sink: Arc<dyn InsightSink>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn MetricSource>,
        generator: Arc<dyn SummaryGenerator>,
        sink: Arc<dyn InsightSink>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            generator,
            sink,
            options,
        }
    }

    /// Run for the trailing week ending yesterday, local time.
    pub async fn run(&self) -> Result<RunReport> {
        self.run_for(chrono::Local::now().date_naive()).await
    }

    /// Run as if today were `today`.
    pub async fn run_for(&self, today: NaiveDate) -> Result<RunReport> {
        let start_time = Instant::now();

        let AggregatedWindow {
            window,
            rows_fetched,
            aggregates,
        } = self.aggregate_for(today).await?;

        enter(Stage::GenerateAll);
        let (batch, skipped) = self
            .generate_all(&window, &aggregates)
            .await
            .map_err(|e| failed(Stage::GenerateAll, e))?;

        enter(Stage::Persist);
        self.sink
            .append(&batch)
            .await
            .map_err(|e| failed(Stage::Persist, e))?;

        enter(Stage::Done);
        Ok(RunReport {
            window,
            rows_fetched,
            clients: aggregates.len(),
            records_written: batch.len(),
            skipped,
            duration_seconds: start_time.elapsed().as_secs_f64(),
        })
    }

    /// Compute the window, fetch it and aggregate it. Nothing is generated or written.
    pub async fn aggregate_for(&self, today: NaiveDate) -> Result<AggregatedWindow> {
        enter(Stage::ComputeWindow);
        let window = ReportWindow::trailing_week(today);
        info!("Report window: {}", window);

        enter(Stage::Fetch);
        let rows = self
            .source
            .fetch(window.start, window.end)
            .await
            .map_err(|e| failed(Stage::Fetch, e))?;

        enter(Stage::Aggregate);
        let aggregates = analysis::aggregate(&rows);
        info!(
            "Aggregated {} rows into {} clients",
            rows.len(),
            aggregates.len()
        );

        Ok(AggregatedWindow {
            window,
            rows_fetched: rows.len(),
            aggregates,
        })
    }

    /// Generate one summary per aggregate.
    ///
    /// Under [`FailurePolicy::Abort`] the first failure is returned and the
    /// summaries still in flight are dropped. Under [`FailurePolicy::Skip`]
    /// every client is attempted and failures come back as skipped clients.
    async fn generate_all(
        &self,
        window: &ReportWindow,
        aggregates: &[ClientAggregate],
    ) -> Result<(InsightBatch, Vec<SkippedClient>)> {
        let label = window.label();
        let progress = self.progress_bar(aggregates.len());

        let mut outcomes = stream::iter(aggregates)
            .map(|aggregate| {
                let label = label.as_str();
                async move {
                    debug!("Summarizing {}", aggregate.client);
                    let outcome = self
                        .generator
                        .summarize(&aggregate.client, label, aggregate)
                        .await;
                    (aggregate, outcome)
                }
            })
            .buffer_unordered(self.options.concurrency.max(1));

        let mut batch = InsightBatch::with_capacity(aggregates.len());
        let mut skipped = Vec::new();

        while let Some((aggregate, outcome)) = outcomes.next().await {
            if let Some(ref pb) = progress {
                pb.inc(1);
            }

            match outcome {
                Ok(summary_text) => batch.push(InsightRecord {
                    client: aggregate.client.clone(),
                    report_date: window.end,
                    summary_text,
                }),
                Err(err) => match self.options.failure_policy {
                    FailurePolicy::Abort => {
                        if let Some(ref pb) = progress {
                            pb.abandon();
                        }
                        return Err(err);
                    }
                    FailurePolicy::Skip => {
                        warn!("Skipping client {}: {}", aggregate.client, err);
                        skipped.push(SkippedClient {
                            client: aggregate.client.clone(),
                            reason: err.to_string(),
                        });
                    }
                },
            }
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        batch.sort_by(|a, b| a.client.cmp(&b.client));
        skipped.sort_by(|a, b| a.client.cmp(&b.client));
        info!(
            "Generated {} summaries ({} skipped)",
            batch.len(),
            skipped.len()
        );

        Ok((batch, skipped))
    }

    fn progress_bar(&self, len: usize) -> Option<ProgressBar> {
        if !self.options.show_progress || len == 0 {
            return None;
        }

        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} clients")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        Some(pb)
    }
}

fn enter(stage: Stage) {
    info!("Stage: {}", stage);
}

fn failed(stage: Stage, err: crate::error::PipelineError) -> crate::error::PipelineError {
    error!("Run failed during {}: {}", stage, err);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::models::{Metric, MetricRow, MetricWindow};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FakeSource {
        rows: MetricWindow,
        fail: bool,
        requests: Mutex<Vec<(NaiveDate, NaiveDate)>>,
    }

    impl FakeSource {
        fn with_rows(rows: MetricWindow) -> Arc<Self> {
            Arc::new(Self {
                rows,
                fail: false,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                rows: Vec::new(),
                fail: true,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MetricSource for FakeSource {
        async fn fetch(&self, start: NaiveDate, end: NaiveDate) -> Result<MetricWindow> {
            self.requests.lock().unwrap().push((start, end));
            if self.fail {
                return Err(PipelineError::source("connection refused"));
            }
            Ok(self.rows.clone())
        }
    }

    #[derive(Default)]
    struct FakeGenerator {
        fail_for: HashSet<String>,
        calls: Mutex<Vec<(String, String, ClientAggregate)>>,
    }

    impl FakeGenerator {
        fn failing_for(clients: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fail_for: clients.iter().map(|c| c.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String, ClientAggregate)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SummaryGenerator for FakeGenerator {
        async fn summarize(
            &self,
            client: &str,
            period_label: &str,
            aggregate: &ClientAggregate,
        ) -> Result<String> {
            self.calls.lock().unwrap().push((
                client.to_string(),
                period_label.to_string(),
                aggregate.clone(),
            ));
            if self.fail_for.contains(client) {
                return Err(PipelineError::generation(client, "service unavailable"));
            }
            Ok(format!("{} had a steady week.", client))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        fail: bool,
        batches: Mutex<Vec<InsightBatch>>,
    }

    impl RecordingSink {
        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                batches: Mutex::new(Vec::new()),
            })
        }

        fn batches(&self) -> Vec<InsightBatch> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InsightSink for RecordingSink {
        async fn append(&self, batch: &[InsightRecord]) -> Result<()> {
            if self.fail {
                return Err(PipelineError::sink("quota exceeded"));
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn today() -> NaiveDate {
        date("2024-03-15")
    }

    fn row(day: &str, client: &str, spend: f64, roas: f64) -> MetricRow {
        MetricRow::new(date(day), client)
            .with(Metric::TotalSpend, spend)
            .with(Metric::Roas, roas)
    }

    fn acme_globex_rows() -> MetricWindow {
        vec![
            row("2024-03-09", "Acme", 100.0, 2.0),
            row("2024-03-12", "Acme", 200.0, 4.0),
            row("2024-03-10", "Globex", 50.0, 1.0),
        ]
    }

    fn pipeline(
        source: Arc<FakeSource>,
        generator: Arc<FakeGenerator>,
        sink: Arc<RecordingSink>,
        options: PipelineOptions,
    ) -> Pipeline {
        Pipeline::new(source, generator, sink, options)
    }

    #[tokio::test]
    async fn test_two_clients_end_to_end() {
        let source = FakeSource::with_rows(acme_globex_rows());
        let generator = Arc::new(FakeGenerator::default());
        let sink = Arc::new(RecordingSink::default());
        let p = pipeline(
            source.clone(),
            generator.clone(),
            sink.clone(),
            PipelineOptions::default(),
        );

        let report = p.run_for(today()).await.unwrap();

        assert_eq!(
            source.requests.lock().unwrap().clone(),
            vec![(date("2024-03-08"), date("2024-03-14"))]
        );

        let mut calls = generator.calls();
        calls.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "Acme");
        assert_eq!(calls[0].1, "2024-03-08 to 2024-03-14");
        assert_eq!(calls[0].2.mean(Metric::TotalSpend), Some(150.0));
        assert_eq!(calls[0].2.mean(Metric::Roas), Some(3.0));
        assert_eq!(calls[1].0, "Globex");
        assert_eq!(calls[1].2.mean(Metric::TotalSpend), Some(50.0));
        assert_eq!(calls[1].2.mean(Metric::Roas), Some(1.0));

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|r| r.report_date == date("2024-03-14")));
        assert_eq!(batch[0].client, "Acme");
        assert_eq!(batch[0].summary_text, "Acme had a steady week.");

        assert_eq!(report.rows_fetched, 3);
        assert_eq!(report.clients, 2);
        assert_eq!(report.records_written, 2);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_empty_window_still_appends_empty_batch() {
        let generator = Arc::new(FakeGenerator::default());
        let sink = Arc::new(RecordingSink::default());
        let p = pipeline(
            FakeSource::with_rows(Vec::new()),
            generator.clone(),
            sink.clone(),
            PipelineOptions::default(),
        );

        let report = p.run_for(today()).await.unwrap();

        assert!(generator.calls().is_empty());
        assert_eq!(sink.batches(), vec![Vec::<InsightRecord>::new()]);
        assert_eq!(report.clients, 0);
        assert_eq!(report.records_written, 0);
    }

    #[tokio::test]
    async fn test_abort_policy_writes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let p = pipeline(
            FakeSource::with_rows(acme_globex_rows()),
            FakeGenerator::failing_for(&["Globex"]),
            sink.clone(),
            PipelineOptions::default(),
        );

        let err = p.run_for(today()).await.unwrap_err();

        assert!(matches!(err, PipelineError::Generation { ref client, .. } if client == "Globex"));
        assert_ne!(err.exit_code(), 0);
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_abort_policy_with_parallel_fan_out() {
        let sink = Arc::new(RecordingSink::default());
        let p = pipeline(
            FakeSource::with_rows(acme_globex_rows()),
            FakeGenerator::failing_for(&["Acme"]),
            sink.clone(),
            PipelineOptions {
                concurrency: 4,
                ..PipelineOptions::default()
            },
        );

        let err = p.run_for(today()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Generation { .. }));
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_skip_policy_reports_skipped_clients() {
        let sink = Arc::new(RecordingSink::default());
        let p = pipeline(
            FakeSource::with_rows(acme_globex_rows()),
            FakeGenerator::failing_for(&["Globex"]),
            sink.clone(),
            PipelineOptions {
                failure_policy: FailurePolicy::Skip,
                ..PipelineOptions::default()
            },
        );

        let report = p.run_for(today()).await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].client, "Acme");

        assert_eq!(report.records_written, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].client, "Globex");
        assert!(report.skipped[0].reason.contains("service unavailable"));
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_skip_policy_with_every_client_failing() {
        let sink = Arc::new(RecordingSink::default());
        let p = pipeline(
            FakeSource::with_rows(acme_globex_rows()),
            FakeGenerator::failing_for(&["Acme", "Globex"]),
            sink.clone(),
            PipelineOptions {
                failure_policy: FailurePolicy::Skip,
                concurrency: 2,
                ..PipelineOptions::default()
            },
        );

        let report = p.run_for(today()).await.unwrap();
        assert_eq!(sink.batches(), vec![Vec::<InsightRecord>::new()]);
        let skipped: Vec<&str> = report.skipped.iter().map(|s| s.client.as_str()).collect();
        assert_eq!(skipped, vec!["Acme", "Globex"]);
    }

    #[tokio::test]
    async fn test_source_failure_stops_before_generation() {
        let generator = Arc::new(FakeGenerator::default());
        let sink = Arc::new(RecordingSink::default());
        let p = pipeline(
            FakeSource::failing(),
            generator.clone(),
            sink.clone(),
            PipelineOptions::default(),
        );

        let err = p.run_for(today()).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable(_)));
        assert!(generator.calls().is_empty());
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_fails_the_run() {
        let p = pipeline(
            FakeSource::with_rows(acme_globex_rows()),
            Arc::new(FakeGenerator::default()),
            RecordingSink::failing(),
            PipelineOptions::default(),
        );

        let err = p.run_for(today()).await.unwrap_err();
        assert!(matches!(err, PipelineError::SinkUnavailable(_)));
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn test_rerun_appends_duplicates() {
        let sink = Arc::new(RecordingSink::default());
        let p = pipeline(
            FakeSource::with_rows(acme_globex_rows()),
            Arc::new(FakeGenerator::default()),
            sink.clone(),
            PipelineOptions::default(),
        );

        p.run_for(today()).await.unwrap();
        p.run_for(today()).await.unwrap();

        let all: Vec<InsightRecord> = sink.batches().into_iter().flatten().collect();
        assert_eq!(all.len(), 4);
        let acme_rows = all
            .iter()
            .filter(|r| r.client == "Acme" && r.report_date == date("2024-03-14"))
            .count();
        assert_eq!(acme_rows, 2);
    }

    #[tokio::test]
    async fn test_parallel_fan_out_matches_sequential() {
        let rows: MetricWindow = (0..12)
            .map(|i| {
                row(
                    "2024-03-10",
                    &format!("client-{:02}", i % 6),
                    i as f64,
                    1.0,
                )
            })
            .collect();

        let sequential_sink = Arc::new(RecordingSink::default());
        pipeline(
            FakeSource::with_rows(rows.clone()),
            Arc::new(FakeGenerator::default()),
            sequential_sink.clone(),
            PipelineOptions::default(),
        )
        .run_for(today())
        .await
        .unwrap();

        let parallel_sink = Arc::new(RecordingSink::default());
        let generator = Arc::new(FakeGenerator::default());
        pipeline(
            FakeSource::with_rows(rows),
            generator.clone(),
            parallel_sink.clone(),
            PipelineOptions {
                concurrency: 4,
                ..PipelineOptions::default()
            },
        )
        .run_for(today())
        .await
        .unwrap();

        assert_eq!(generator.calls().len(), 6);
        assert_eq!(sequential_sink.batches(), parallel_sink.batches());
    }

    #[tokio::test]
    async fn test_aggregate_for_does_not_generate() {
        let generator = Arc::new(FakeGenerator::default());
        let sink = Arc::new(RecordingSink::default());
        let p = pipeline(
            FakeSource::with_rows(acme_globex_rows()),
            generator.clone(),
            sink.clone(),
            PipelineOptions::default(),
        );

        let preview = p.aggregate_for(today()).await.unwrap();
        assert_eq!(preview.window.end, date("2024-03-14"));
        assert_eq!(preview.rows_fetched, 3);
        assert_eq!(preview.aggregates.len(), 2);
        assert!(generator.calls().is_empty());
        assert!(sink.batches().is_empty());
    }
}
