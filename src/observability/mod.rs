//! Observability module providing logging and metrics.
//!
//! This module initializes and configures:
//! - Structured logging with configurable formats (pretty, compact, JSON)
//! - Cleanup run metrics, exported to Prometheus or to the log stream

pub mod metrics;
mod tracing_init;

pub use tracing_init::*;
