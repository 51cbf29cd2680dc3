//! Analysis modules.
//!
//! Turns raw service responses into scores and per-city rankings.

pub mod aggregator;
pub mod ranker;

pub use aggregator::{extract_breakdown, extract_timeseries, score};
pub use ranker::{rank, sort_scored};
