//! autotier FUSE subsystem: the union passthrough filesystem.

/// Backing-file metadata to FUSE attribute conversion.
pub mod attr;
/// Error types and errno mapping.
pub mod error;
/// Union filesystem implementation (`fuser::Filesystem`).
pub mod filesystem;
/// Inode to logical-path table.
pub mod inode;
/// Mount surface validation: mountpoint, `-o` knobs, tier overlap.
pub mod mount;

pub use error::{FuseError, Result};
pub use filesystem::UnionFs;
