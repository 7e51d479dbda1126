use thiserror::Error;

/// Errors produced while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No config file existed; a default template was written.
    #[error("no config file found; wrote default template to {path} — edit it and restart")]
    CreatedDefault {
        /// Path the template was written to.
        path: String,
    },

    /// One or more validation checks failed.
    #[error("invalid configuration in {path}:\n  {}", problems.join("\n  "))]
    Invalid {
        /// Path of the offending file.
        path: String,
        /// Every failed check, one message per problem.
        problems: Vec<String>,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
