//! Analytics store access.
//!
//! The pipeline only sees the [`MetricSource`] and [`InsightSink`] traits;
//! the BigQuery implementations live in [`bigquery`].

pub mod auth;
pub mod bigquery;

use crate::error::Result;
use crate::models::{InsightRecord, MetricWindow};
use async_trait::async_trait;
use chrono::NaiveDate;

pub use auth::TokenProvider;
pub use bigquery::{BigQueryReader, BigQueryWriter};

/// Reads metric rows for a closed date interval.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Every stored row with `period_start <= date <= period_end`.
    async fn fetch(&self, period_start: NaiveDate, period_end: NaiveDate) -> Result<MetricWindow>;
}

/// Appends insight records to the target table.
#[async_trait]
pub trait InsightSink: Send + Sync {
    /// Append the whole batch in one write. Existing rows are never touched.
    async fn append(&self, batch: &[InsightRecord]) -> Result<()>;
}
