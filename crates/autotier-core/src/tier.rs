//! One physical storage tier: a backing directory plus capacity
//! statistics refreshed each policy tick.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use autotier_config::TierSpec;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::migrate::is_migration_temp;

/// One file found while enumerating a tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the tier's backing root.
    pub rel_path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last access time; the popularity proxy.
    pub atime: SystemTime,
}

/// A physical tier. Identity and watermark are fixed at startup; the
/// capacity statistics are written by the tiering thread only and read
/// by the resolver, so they live in atomics.
#[derive(Debug)]
pub struct Tier {
    id: String,
    path: PathBuf,
    watermark: u8,
    capacity_bytes: AtomicU64,
    used_bytes: AtomicU64,
    watermark_bytes: AtomicU64,
}

impl Tier {
    pub fn new(spec: &TierSpec) -> Self {
        Tier {
            id: spec.id.clone(),
            path: spec.path.clone(),
            watermark: spec.watermark,
            capacity_bytes: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
            watermark_bytes: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Absolute backing root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Watermark percent in [0, 100].
    pub fn watermark(&self) -> u8 {
        self.watermark
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes.load(Ordering::Relaxed)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// `capacity × watermark / 100`, recomputed by [`Tier::refresh`].
    pub fn watermark_bytes(&self) -> u64 {
        self.watermark_bytes.load(Ordering::Relaxed)
    }

    /// Replace the statvfs-derived usage with the precise byte sum found
    /// during a scan.
    pub fn set_used_bytes(&self, used: u64) {
        self.used_bytes.store(used, Ordering::Relaxed);
    }

    /// `used / capacity` as a real in [0, 1].
    pub fn usage_ratio(&self) -> f64 {
        let capacity = self.capacity_bytes();
        if capacity == 0 {
            return 0.0;
        }
        (self.used_bytes() as f64 / capacity as f64).clamp(0.0, 1.0)
    }

    /// Whether new data should spill past this tier.
    pub fn is_at_watermark(&self) -> bool {
        self.used_bytes() >= self.watermark_bytes()
    }

    /// Absolute backing path for a logical path.
    pub fn backing_path(&self, rel: &Path) -> PathBuf {
        self.path.join(rel)
    }

    /// Sample the backing filesystem and recompute capacity, usage and
    /// watermark bytes.
    pub fn refresh(&self) -> Result<()> {
        let st = statvfs(&self.path).map_err(|source| CoreError::CapacitySample {
            tier: self.id.clone(),
            source,
        })?;
        let frsize = st.f_frsize as u64;
        let capacity = st.f_blocks as u64 * frsize;
        let available = st.f_bavail as u64 * frsize;
        let used = capacity.saturating_sub(available);
        self.capacity_bytes.store(capacity, Ordering::Relaxed);
        self.used_bytes.store(used, Ordering::Relaxed);
        let watermark_bytes = (capacity as u128 * self.watermark as u128 / 100) as u64;
        self.watermark_bytes.store(watermark_bytes, Ordering::Relaxed);
        debug!(
            tier = self.id.as_str(),
            capacity,
            used,
            watermark_bytes = self.watermark_bytes(),
            "refreshed tier capacity"
        );
        Ok(())
    }

    /// Enumerate every regular file and symlink beneath the backing root
    /// as `(relative_path, size, atime)`, in unspecified order. Migration
    /// temporaries are skipped; symlinks are not followed.
    pub fn enumerate(&self) -> io::Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        crawl(&self.path, &self.path, &mut entries)?;
        Ok(entries)
    }
}

fn crawl(root: &Path, dir: &Path, out: &mut Vec<FileEntry>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            // Raced with an unlink; files can vanish under the crawler.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            crawl(root, &path, out)?;
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if is_migration_temp(name) {
                continue;
            }
        }
        let rel_path = path
            .strip_prefix(root)
            .expect("crawl stays under the tier root")
            .to_path_buf();
        out.push(FileEntry {
            rel_path,
            size: meta.len(),
            atime: atime_of(&meta),
        });
    }
    Ok(())
}

fn atime_of(meta: &std::fs::Metadata) -> SystemTime {
    let secs = meta.atime();
    let nsecs = meta.atime_nsec() as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn statvfs(path: &Path) -> io::Result<libc::statvfs> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}
