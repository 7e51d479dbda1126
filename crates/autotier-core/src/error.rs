use thiserror::Error;

/// Crate-level error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Capacity sampling (`statvfs`) failed for a tier.
    #[error("failed to sample capacity of tier {tier}: {source}")]
    CapacitySample {
        /// Tier id.
        tier: String,
        /// The failing syscall's error.
        source: std::io::Error,
    },

    /// A migration failed; see [`crate::migrate::MigrateError`].
    #[error(transparent)]
    Migrate(#[from] crate::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
