//! Configuration management
//!
//! The router is configured by a TOML document describing its domains.
//! A document is validated as a whole before it replaces the running one.

mod types;
mod validation;

pub use types::*;
pub use validation::{ValidationResult, validate};

use crate::{Error, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<RouterConfig> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    parse(&content)
}

/// Parse configuration from TOML text
pub fn parse(content: &str) -> Result<RouterConfig> {
    toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

/// Parse and validate; warnings are logged, errors become `Error::Config`.
pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<RouterConfig> {
    let config = load(path)?;
    let result = validate(&config);
    for warning in &result.warnings {
        tracing::warn!("config: {}", warning);
    }
    if result.has_errors() {
        return Err(Error::Config(result.errors.join("; ")));
    }
    Ok(config)
}
