//! Telemetry module for logging and state reports.
//!
//! Provides:
//! - Logging configuration and initialization
//! - The periodic per-domain report document

mod logging;
mod report;

pub use logging::{LogConfig, LogFormat, init_logging};
pub use report::{
    DomainDetail, DomainReport, LinkCounts, LinkDetail, NatUsage, RouterReport, RuleSummary,
};
