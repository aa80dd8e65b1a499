//! Per-client metric aggregation.
//!
//! Groups the rows of a window by client and averages every metric over
//! each client's rows.

use crate::models::{ClientAggregate, Metric, MetricRow};
use std::collections::BTreeMap;

/// Group rows by client name (exact, case-sensitive match).
pub fn group_by_client(rows: &[MetricRow]) -> BTreeMap<&str, Vec<&MetricRow>> {
    let mut grouped: BTreeMap<&str, Vec<&MetricRow>> = BTreeMap::new();

    for row in rows {
        grouped.entry(row.client.as_str()).or_default().push(row);
    }

    grouped
}

/// Aggregate a window into one [`ClientAggregate`] per distinct client.
///
/// Results are sorted by client. NULL and non-finite metric values are
/// skipped, so each mean covers only the rows that carried the metric; a
/// metric with no usable value in any of a client's rows is left out of that
/// client's aggregate.
pub fn aggregate(rows: &[MetricRow]) -> Vec<ClientAggregate> {
    group_by_client(rows)
        .into_iter()
        .map(|(client, client_rows)| {
            let means = Metric::ALL
                .into_iter()
                .filter_map(|metric| {
                    let values: Vec<f64> = client_rows
                        .iter()
                        .filter_map(|r| r.value(metric))
                        .filter(|v| v.is_finite())
                        .collect();
                    mean(values).map(|m| (metric, m))
                })
                .collect();

            ClientAggregate {
                client: client.to_string(),
                row_count: client_rows.len(),
                means,
            }
        })
        .collect()
}

/// Arithmetic mean, summed in sorted order so row order never changes the result.
fn mean(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    values.sort_by(|a, b| a.total_cmp(b));
    let sum: f64 = values.iter().sum();

    Some(sum / values.len() as f64)
}

/// Render aggregates as a plain-text table for terminal output.
pub fn format_aggregates(aggregates: &[ClientAggregate]) -> String {
    let mut lines = Vec::new();

    for agg in aggregates {
        lines.push(format!("{} ({} rows)", agg.client, agg.row_count));
        for (metric, value) in &agg.means {
            lines.push(format!("  - {}: {:.2}", metric, value));
        }
    }

    lines.join("\n")
}
