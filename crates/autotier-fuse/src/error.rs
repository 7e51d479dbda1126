use thiserror::Error;

/// Errors raised while wiring the daemon together. Filesystem
/// callbacks never construct these; they reply with raw `-errno`.
#[derive(Debug, Error)]
pub enum FuseError {
    /// The mountpoint or `-o` string failed validation. Every problem
    /// found is listed, the same way config validation reports.
    #[error("cannot mount at \"{mountpoint}\":\n  {}", problems.join("\n  "))]
    MountSetup {
        /// Requested mountpoint.
        mountpoint: String,
        /// Every failed check.
        problems: Vec<String>,
    },
}

pub type Result<T> = std::result::Result<T, FuseError>;

/// Translate an `io::Error` to the errno handed back to the kernel.
pub fn errno_of(e: &std::io::Error) -> libc::c_int {
    e.raw_os_error().unwrap_or(libc::EIO)
}
