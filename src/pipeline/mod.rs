//! Fetch, aggregate and rank pipeline.
//!
//! `coordinator` fans a city's cells out to the query client under a
//! worker cap; `city` turns the outcomes into a ranked city report.

pub mod city;
pub mod coordinator;

pub use city::{process_city, CityRun, PipelineSettings};
