//! ohsome API client modules.
//!
//! This module provides the shared HTTP transport and the per-cell
//! query client with its retry policy.

pub mod query;
pub mod transport;

pub use query::{QueryClient, RetryPolicy};
pub use transport::{HttpTransport, Transport};
