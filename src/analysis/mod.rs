//! Analysis modules.
//!
//! Turns the raw rows of a window into per-client aggregates.

pub mod aggregator;

pub use aggregator::*;
