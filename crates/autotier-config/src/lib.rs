//! autotier configuration subsystem.
//!
//! Reads the line-oriented, section-headed config file (`[Global]` followed
//! by one section per tier, in priority order) and produces an immutable,
//! validated [`Config`] record. The engine never sees an unvalidated
//! configuration.

/// Error types for configuration loading.
pub mod error;
/// Raw file parsing (section state machine, option-typed values).
pub mod parse;
/// Validation of raw values into the final config record.
pub mod validate;

pub use error::{ConfigError, Result};
pub use parse::{parse_str, write_default_config, RawConfig, RawTier};
pub use validate::{Config, LogLevel, TierSpec};

use std::path::Path;

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/autotier.conf";

/// Load and validate the configuration at `path`.
///
/// A missing file is created from the default template and reported as
/// [`ConfigError::CreatedDefault`] so the caller can tell the operator to
/// fill it in.
pub fn load(path: &Path) -> Result<Config> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_default_config(path)?;
            return Err(ConfigError::CreatedDefault {
                path: path.display().to_string(),
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };
    let raw = parse_str(&contents);
    validate::validate(path, raw)
}
