//! Operations and observability.
//!
//! This module handles operational concerns:
//! - [`metrics`] - Counters, gauges and Prometheus export
//! - [`audit`] - Periodic consistency audit

pub mod audit;
pub mod metrics;
