//! Data models for the insights pipeline.
//!
//! This module contains the rows fetched from the analytics store, the
//! per-client aggregates built from them, and the insight records written back.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A numeric performance metric tracked per client and day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Number of clicks.
    TotalClicks,
    /// Click-through rate, in percent.
    CtrPercent,
    /// Amount spent.
    TotalSpend,
    /// Number of purchases.
    TotalPurchases,
    /// Return on ad spend.
    Roas,
}

impl Metric {
    /// Every metric, in the order used for queries and prompts.
    pub const ALL: [Metric; 5] = [
        Metric::TotalClicks,
        Metric::CtrPercent,
        Metric::TotalSpend,
        Metric::TotalPurchases,
        Metric::Roas,
    ];

    /// Column name in the source table.
    pub fn column(&self) -> &'static str {
        match self {
            Metric::TotalClicks => "total_clicks",
            Metric::CtrPercent => "ctr_percent",
            Metric::TotalSpend => "total_spend",
            Metric::TotalPurchases => "total_purchases",
            Metric::Roas => "roas",
        }
    }

    /// Look up a metric by its column name.
    pub fn from_column(name: &str) -> Option<Metric> {
        Metric::ALL.into_iter().find(|m| m.column() == name)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.column())
    }
}

/// One observation for a single client on a single day.
///
/// A metric is `None` when the store holds NULL for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub date: NaiveDate,
    pub client: String,
    pub total_clicks: Option<f64>,
    pub ctr_percent: Option<f64>,
    pub total_spend: Option<f64>,
    pub total_purchases: Option<f64>,
    pub roas: Option<f64>,
}

impl MetricRow {
    /// Creates a row with every metric absent.
    pub fn new(date: NaiveDate, client: impl Into<String>) -> Self {
        Self {
            date,
            client: client.into(),
            total_clicks: None,
            ctr_percent: None,
            total_spend: None,
            total_purchases: None,
            roas: None,
        }
    }

    /// Builder-style setter for a single metric.
    #[cfg(test)]
    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.set(metric, Some(value));
        self
    }

    /// Returns the value of a metric, if present.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::TotalClicks => self.total_clicks,
            Metric::CtrPercent => self.ctr_percent,
            Metric::TotalSpend => self.total_spend,
            Metric::TotalPurchases => self.total_purchases,
            Metric::Roas => self.roas,
        }
    }

    /// Sets the value of a metric.
    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        let slot = match metric {
            Metric::TotalClicks => &mut self.total_clicks,
            Metric::CtrPercent => &mut self.ctr_percent,
            Metric::TotalSpend => &mut self.total_spend,
            Metric::TotalPurchases => &mut self.total_purchases,
            Metric::Roas => &mut self.roas,
        };
        *slot = value;
    }
}

/// All rows fetched for one report window.
pub type MetricWindow = Vec<MetricRow>;

/// Per-client mean of each metric over the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAggregate {
    /// Client identifier (the grouping key).
    pub client: String,
    /// Number of rows the means were computed from.
    pub row_count: usize,
    /// Mean per metric. Metrics that were NULL in every row are absent.
    pub means: BTreeMap<Metric, f64>,
}

impl ClientAggregate {
    /// Returns the mean for a metric, if any row carried it.
    pub fn mean(&self, metric: Metric) -> Option<f64> {
        self.means.get(&metric).copied()
    }
}

/// One generated summary, ready to be appended to the target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRecord {
    pub client: String,
    pub report_date: NaiveDate,
    pub summary_text: String,
}

/// Every insight produced by one run.
pub type InsightBatch = Vec<InsightRecord>;

/// The closed date interval a run reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ReportWindow {
    /// The seven days ending yesterday, relative to `today`.
    pub fn trailing_week(today: NaiveDate) -> Self {
        Self {
            start: today - Duration::days(7),
            end: today - Duration::days(1),
        }
    }

    /// Human-readable period label used in prompts.
    pub fn label(&self) -> String {
        format!("{} to {}", self.start, self.end)
    }

    /// Number of calendar days covered, both bounds included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for ReportWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A client whose summary could not be generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedClient {
    pub client: String,
    pub reason: String,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Window the run reported on.
    pub window: ReportWindow,
    /// Rows returned by the analytics store.
    pub rows_fetched: usize,
    /// Distinct clients found in the window.
    pub clients: usize,
    /// Records handed to the writer.
    pub records_written: usize,
    /// Clients dropped under the skip policy.
    pub skipped: Vec<SkippedClient>,
    /// Wall-clock duration of the run.
    pub duration_seconds: f64,
}

impl RunReport {
    /// True when every client got a summary.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_trailing_week_ends_yesterday() {
        let window = ReportWindow::trailing_week(date("2024-03-15"));
        assert_eq!(window.end, date("2024-03-14"));
        assert_eq!(window.start, date("2024-03-08"));
        assert_eq!(window.start, window.end - Duration::days(6));
        assert_eq!(window.days(), 7);
    }

    #[test]
    fn test_trailing_week_across_year_boundary() {
        let window = ReportWindow::trailing_week(date("2025-01-03"));
        assert_eq!(window.start, date("2024-12-27"));
        assert_eq!(window.end, date("2025-01-02"));
        assert_eq!(window.label(), "2024-12-27 to 2025-01-02");
    }

    #[test]
    fn test_metric_columns_round_trip() {
        for metric in Metric::ALL {
            assert_eq!(Metric::from_column(metric.column()), Some(metric));
        }
        assert_eq!(Metric::from_column("impressions"), None);
    }

    #[test]
    fn test_row_value_accessors() {
        let mut row = MetricRow::new(date("2024-03-10"), "Acme")
            .with(Metric::TotalSpend, 120.5)
            .with(Metric::Roas, 2.0);
        assert_eq!(row.value(Metric::TotalSpend), Some(120.5));
        assert_eq!(row.value(Metric::Roas), Some(2.0));
        assert_eq!(row.value(Metric::TotalClicks), None);

        row.set(Metric::Roas, None);
        assert_eq!(row.value(Metric::Roas), None);
    }
}
