//! Result persistence and run reports.

pub mod generator;
pub mod sink;

pub use sink::{FileSink, ReportFormat, ResultSink};
