//! Summary generation.
//!
//! Turns one client's aggregate into a natural-language assessment by
//! prompting a text-generation service.

pub mod client;
pub mod prompt;

use crate::error::Result;
use crate::models::ClientAggregate;
use async_trait::async_trait;

pub use client::LlmSummaryGenerator;

/// Produces one summary per client.
///
/// Output is not deterministic: the service samples, so identical input can
/// yield different text.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    /// Summarize `aggregate` for `client` over `period_label`.
    async fn summarize(
        &self,
        client: &str,
        period_label: &str,
        aggregate: &ClientAggregate,
    ) -> Result<String>;
}
