//! Prompt construction for client summaries.
//!
//! The prompt is a pure function of the client, the period label and the
//! aggregate, so it can be checked without any network call.
//!
//! Template:
//!
//! ```text
//! You are a digital marketing analyst. Analyze the data below for client <client>,
//! covering the period <period>:
//!
//! - <metric>: <mean>
//! ...
//!
//! Write a short, practical and objective assessment of the performance,
//! pointing out strengths and areas for improvement.
//! ```

use crate::models::{ClientAggregate, Metric};

/// Closing instruction appended after the metric list.
pub const ASSESSMENT_REQUEST: &str = "Write a short, practical and objective assessment of the \
performance, pointing out strengths and areas for improvement.";

/// Build the summary prompt for one client.
pub fn build_prompt(client: &str, period_label: &str, aggregate: &ClientAggregate) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "You are a digital marketing analyst. Analyze the data below for client {}, \
         covering the period {}:\n\n",
        client, period_label
    ));

    for metric in Metric::ALL {
        if let Some(value) = aggregate.mean(metric) {
            prompt.push_str(&format!("- {}: {}\n", metric, format_value(value)));
        }
    }

    prompt.push('\n');
    prompt.push_str(ASSESSMENT_REQUEST);
    prompt
}

/// Significant digits kept when a mean is written into a prompt.
const SIGNIFICANT_DIGITS: usize = 10;

/// Format a mean to ten significant digits in plain notation.
///
/// Small values keep their magnitude (`0.00004` stays `0.00004`) while float
/// noise such as `0.30000000000000004` is rounded away.
pub fn format_value(value: f64) -> String {
    let rounded = format!("{:.*e}", SIGNIFICANT_DIGITS - 1, value)
        .parse::<f64>()
        .unwrap_or(value);
    if rounded == 0.0 {
        "0".to_string()
    } else {
        rounded.to_string()
    }
}
