//! Configuration loading
//!
//! Settings come from an optional TOML file; command line flags are applied
//! on top of it by the entry point.

mod schema;

pub use schema::*;

use std::path::Path;
use tracing::debug;

use crate::error::{AppError, Result};

/// Load configuration from a TOML file, or defaults when no path is given
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path else {
        return Ok(AppConfig::default());
    };

    let raw = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
