//! Atomic single-file migration between tiers.
//!
//! A migration must be invisible to concurrent readers: the destination
//! is populated behind a temporary name and renamed into place, so any
//! open sees either the full old file or the full new file. Metadata
//! (mode, owner, timestamps, xattrs) travels with the file.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{chown, lchown, DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::resolver::TierSet;
use crate::tier::Tier;

/// Suffix of in-flight copy temporaries; hidden from scans and listings.
pub const TMP_SUFFIX: &str = ".autotier.tmp";

/// Whether a file name is an in-flight migration temporary.
pub fn is_migration_temp(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TMP_SUFFIX)
}

/// Errors from the migration primitive.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Source disappeared before the move started (raced with unlink).
    #[error("source vanished before migration: {path}")]
    SourceVanished {
        /// Logical path.
        path: String,
    },

    /// Failure while preparing or copying; source left untouched.
    #[error("migration of {path} failed: {source}")]
    Io {
        /// Logical path.
        path: String,
        #[source]
        source: io::Error,
    },

    /// Destination is in place but the source could not be unlinked; the
    /// uniqueness invariant is violated until the next cleanup pass.
    #[error("destination in place but source unlink failed for {path}: {source}")]
    SourceUnlinkFailed {
        /// Logical path.
        path: String,
        #[source]
        source: io::Error,
    },
}

impl MigrateError {
    fn io(rel: &Path, source: io::Error) -> Self {
        MigrateError::Io {
            path: rel.display().to_string(),
            source,
        }
    }
}

/// Serializes migrations per logical path: a single short-held mutex
/// around the set of in-flight paths, shared by the tiering thread and
/// the filesystem's inline cross-tier renames.
#[derive(Debug, Default)]
pub struct MigrationGate {
    in_flight: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

/// Holds a path's migration slot; dropping it releases the slot.
pub struct GateGuard<'a> {
    gate: &'a MigrationGate,
    rel: PathBuf,
}

impl MigrationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `rel`, blocking while another migration of the same path is
    /// in flight. Contention is negligible: normally only the tiering
    /// thread migrates, with the occasional inline rename migration.
    pub fn acquire(&self, rel: &Path) -> GateGuard<'_> {
        let mut set = self.in_flight.lock().expect("migration gate poisoned");
        while set.contains(rel) {
            set = self.released.wait(set).expect("migration gate poisoned");
        }
        set.insert(rel.to_path_buf());
        GateGuard {
            gate: self,
            rel: rel.to_path_buf(),
        }
    }

    /// Whether a migration of `rel` is currently in flight.
    pub fn is_in_flight(&self, rel: &Path) -> bool {
        self.in_flight
            .lock()
            .expect("migration gate poisoned")
            .contains(rel)
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut set = self
            .gate
            .in_flight
            .lock()
            .expect("migration gate poisoned");
        set.remove(&self.rel);
        self.gate.released.notify_all();
    }
}

/// Move one logical file from `src` to `dst`, preserving metadata.
/// Returns the number of payload bytes moved.
pub fn migrate(
    rel: &Path,
    src: &Tier,
    dst: &Tier,
    copy_buffer_size: usize,
) -> Result<u64, MigrateError> {
    let src_path = src.backing_path(rel);
    let dst_path = dst.backing_path(rel);

    let meta = match std::fs::symlink_metadata(&src_path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(MigrateError::SourceVanished {
                path: rel.display().to_string(),
            });
        }
        Err(e) => return Err(MigrateError::io(rel, e)),
    };

    mirror_parents(src.path(), dst.path(), rel.parent()).map_err(|e| MigrateError::io(rel, e))?;

    if meta.file_type().is_symlink() {
        migrate_symlink(&src_path, &dst_path, &meta).map_err(|e| MigrateError::io(rel, e))?;
    } else {
        match std::fs::rename(&src_path, &dst_path) {
            Ok(()) => {
                debug!(path = %rel.display(), src = src.id(), dst = dst.id(), "migrated via rename");
                prune_empty_dirs(src.path(), rel.parent());
                return Ok(meta.len());
            }
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                copy_across(rel, &src_path, &dst_path, &meta, copy_buffer_size)?;
            }
            Err(e) => return Err(MigrateError::io(rel, e)),
        }
    }

    if let Err(e) = std::fs::remove_file(&src_path) {
        return Err(MigrateError::SourceUnlinkFailed {
            path: rel.display().to_string(),
            source: e,
        });
    }
    prune_empty_dirs(src.path(), rel.parent());
    debug!(path = %rel.display(), src = src.id(), dst = dst.id(), bytes = meta.len(), "migrated via copy");
    Ok(meta.len())
}

/// Cross-filesystem path: stream to a sibling temporary, fsync, apply
/// metadata, rename over the final name. Any failure removes the
/// temporary and leaves the source untouched.
fn copy_across(
    rel: &Path,
    src_path: &Path,
    dst_path: &Path,
    meta: &std::fs::Metadata,
    copy_buffer_size: usize,
) -> Result<(), MigrateError> {
    let tmp_path = temp_sibling(dst_path);

    let result = (|| -> io::Result<()> {
        let mut reader = File::open(src_path)?;
        let mut writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(meta.mode() & 0o7777)
            .open(&tmp_path)?;

        let mut buf = vec![0u8; copy_buffer_size.max(1)];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }
        writer.sync_all()?;
        drop(writer);

        // Owner may fail without privilege; mode was set at creation but
        // reapply in case the umask interfered.
        let _ = chown(&tmp_path, Some(meta.uid()), Some(meta.gid()));
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        copy_xattrs(src_path, &tmp_path)?;
        copy_times(meta, &tmp_path)?;

        std::fs::rename(&tmp_path, dst_path)?;
        Ok(())
    })();

    if let Err(e) = result {
        if let Err(cleanup) = std::fs::remove_file(&tmp_path) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(tmp = %tmp_path.display(), error = %cleanup, "failed to remove copy temporary");
            }
        }
        return Err(MigrateError::io(rel, e));
    }
    Ok(())
}

fn migrate_symlink(src_path: &Path, dst_path: &Path, meta: &std::fs::Metadata) -> io::Result<()> {
    let target = std::fs::read_link(src_path)?;
    match std::fs::remove_file(dst_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(&target, dst_path)?;
    let _ = lchown(dst_path, Some(meta.uid()), Some(meta.gid()));
    Ok(())
}

fn temp_sibling(dst_path: &Path) -> PathBuf {
    let name = dst_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst_path.with_file_name(format!(".{name}{TMP_SUFFIX}"))
}

/// Create each missing parent of `rel_parent` under `dst_root`, copying
/// mode and owner from the corresponding directory under `src_root`.
pub fn mirror_parents(
    src_root: &Path,
    dst_root: &Path,
    rel_parent: Option<&Path>,
) -> io::Result<()> {
    let Some(rel_parent) = rel_parent else {
        return Ok(());
    };
    let mut prefix = PathBuf::new();
    for component in rel_parent.components() {
        prefix.push(component);
        let dst_dir = dst_root.join(&prefix);
        if dst_dir.symlink_metadata().is_ok() {
            continue;
        }
        let src_meta = std::fs::metadata(src_root.join(&prefix)).ok();
        create_mirrored_dir(&dst_dir, src_meta.as_ref())?;
    }
    Ok(())
}

/// Like [`mirror_parents`] but sourcing each ancestor's metadata from
/// whichever tier holds it; used by path-creating filesystem operations.
pub fn mirror_parents_union(
    tiers: &TierSet,
    dst_index: usize,
    rel_parent: Option<&Path>,
) -> io::Result<()> {
    let Some(rel_parent) = rel_parent else {
        return Ok(());
    };
    let dst_root = tiers.tier(dst_index).path();
    let mut prefix = PathBuf::new();
    for component in rel_parent.components() {
        prefix.push(component);
        let dst_dir = dst_root.join(&prefix);
        if dst_dir.symlink_metadata().is_ok() {
            continue;
        }
        let src_meta = tiers
            .resolve(&prefix)
            .and_then(|r| std::fs::metadata(r.backing).ok());
        create_mirrored_dir(&dst_dir, src_meta.as_ref())?;
    }
    Ok(())
}

fn create_mirrored_dir(dst_dir: &Path, src_meta: Option<&std::fs::Metadata>) -> io::Result<()> {
    let mode = src_meta.map(|m| m.mode() & 0o7777).unwrap_or(0o755);
    match std::fs::DirBuilder::new().mode(mode).create(dst_dir) {
        Ok(()) => {}
        // Raced with another creator; the directory existing is the goal.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => return Err(e),
    }
    if let Some(meta) = src_meta {
        let _ = chown(dst_dir, Some(meta.uid()), Some(meta.gid()));
    }
    Ok(())
}

/// Remove now-empty parent directories of a migrated-away file, walking
/// up to (not including) the tier root. Non-empty directories end the
/// walk; all errors are deliberately ignored.
pub fn prune_empty_dirs(root: &Path, rel_parent: Option<&Path>) {
    let mut current = rel_parent;
    while let Some(rel) = current {
        if rel.as_os_str().is_empty() {
            break;
        }
        if std::fs::remove_dir(root.join(rel)).is_err() {
            break;
        }
        current = rel.parent();
    }
}

fn copy_times(meta: &std::fs::Metadata, dst: &Path) -> io::Result<()> {
    let times = [
        libc::timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        libc::timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    ];
    let cpath = cstring(dst)?;
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            cpath.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Copy every xattr from `src` to `dst`. Filesystems without xattr
/// support and unprivileged-to-set attributes are skipped silently.
fn copy_xattrs(src: &Path, dst: &Path) -> io::Result<()> {
    let src_c = cstring(src)?;
    let dst_c = cstring(dst)?;

    let list_len = unsafe { libc::llistxattr(src_c.as_ptr(), std::ptr::null_mut(), 0) };
    if list_len < 0 {
        let e = io::Error::last_os_error();
        return match e.raw_os_error() {
            Some(libc::ENOTSUP) => Ok(()),
            _ => Err(e),
        };
    }
    if list_len == 0 {
        return Ok(());
    }

    let mut names = vec![0u8; list_len as usize];
    let list_len = unsafe {
        libc::llistxattr(
            src_c.as_ptr(),
            names.as_mut_ptr() as *mut libc::c_char,
            names.len(),
        )
    };
    if list_len < 0 {
        return Err(io::Error::last_os_error());
    }
    names.truncate(list_len as usize);

    for name in names.split(|&b| b == 0).filter(|n| !n.is_empty()) {
        let name_c = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        let value_len = unsafe {
            libc::lgetxattr(
                src_c.as_ptr(),
                name_c.as_ptr(),
                std::ptr::null_mut(),
                0,
            )
        };
        if value_len < 0 {
            continue;
        }
        let mut value = vec![0u8; value_len as usize];
        let value_len = unsafe {
            libc::lgetxattr(
                src_c.as_ptr(),
                name_c.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if value_len < 0 {
            continue;
        }
        let rc = unsafe {
            libc::lsetxattr(
                dst_c.as_ptr(),
                name_c.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value_len as usize,
                0,
            )
        };
        if rc != 0 {
            let e = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::ENOTSUP) | Some(libc::EPERM) => {
                    debug!(xattr = %name_c.to_string_lossy(), "skipped unsupported xattr");
                }
                _ => return Err(e),
            }
        }
    }
    Ok(())
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotier_config::TierSpec;
    use std::sync::Arc;

    fn tier_at(dir: &Path, id: &str) -> Tier {
        Tier::new(&TierSpec {
            id: id.to_string(),
            path: dir.to_path_buf(),
            watermark: 50,
        })
    }

    #[test]
    fn test_is_migration_temp() {
        assert!(is_migration_temp(".data.bin.autotier.tmp"));
        assert!(!is_migration_temp("data.bin"));
        assert!(!is_migration_temp("data.bin.autotier.tmp"));
        assert!(!is_migration_temp(".hidden"));
    }

    #[test]
    fn test_temp_sibling_shape() {
        let tmp = temp_sibling(Path::new("/mnt/t1/d/file.bin"));
        assert_eq!(tmp, PathBuf::from("/mnt/t1/d/.file.bin.autotier.tmp"));
        assert!(is_migration_temp(tmp.file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn test_migrate_preserves_content() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = tier_at(a.path(), "fast");
        let dst = tier_at(b.path(), "slow");
        std::fs::write(a.path().join("f.bin"), b"payload").unwrap();

        let moved = migrate(Path::new("f.bin"), &src, &dst, 4096).unwrap();
        assert_eq!(moved, 7);
        assert!(!a.path().join("f.bin").exists());
        assert_eq!(std::fs::read(b.path().join("f.bin")).unwrap(), b"payload");
    }

    #[test]
    fn test_migrate_creates_parent_mirror() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = tier_at(a.path(), "fast");
        let dst = tier_at(b.path(), "slow");
        std::fs::create_dir_all(a.path().join("x/y")).unwrap();
        std::fs::write(a.path().join("x/y/f"), b"deep").unwrap();

        migrate(Path::new("x/y/f"), &src, &dst, 4096).unwrap();
        assert_eq!(std::fs::read(b.path().join("x/y/f")).unwrap(), b"deep");
    }

    #[test]
    fn test_migrate_prunes_empty_source_dirs() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = tier_at(a.path(), "fast");
        let dst = tier_at(b.path(), "slow");
        std::fs::create_dir_all(a.path().join("x/y")).unwrap();
        std::fs::write(a.path().join("x/y/only"), b"1").unwrap();

        migrate(Path::new("x/y/only"), &src, &dst, 4096).unwrap();
        assert!(!a.path().join("x/y").exists());
        assert!(!a.path().join("x").exists());
    }

    #[test]
    fn test_migrate_keeps_nonempty_source_dirs() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = tier_at(a.path(), "fast");
        let dst = tier_at(b.path(), "slow");
        std::fs::create_dir_all(a.path().join("x")).unwrap();
        std::fs::write(a.path().join("x/move"), b"1").unwrap();
        std::fs::write(a.path().join("x/stay"), b"2").unwrap();

        migrate(Path::new("x/move"), &src, &dst, 4096).unwrap();
        assert!(a.path().join("x/stay").exists());
    }

    #[test]
    fn test_migrate_preserves_mode_and_times() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = tier_at(a.path(), "fast");
        let dst = tier_at(b.path(), "slow");
        let src_file = a.path().join("f");
        std::fs::write(&src_file, b"x").unwrap();
        std::fs::set_permissions(&src_file, std::fs::Permissions::from_mode(0o640)).unwrap();
        let before = std::fs::metadata(&src_file).unwrap();

        migrate(Path::new("f"), &src, &dst, 4096).unwrap();
        let after = std::fs::metadata(b.path().join("f")).unwrap();
        assert_eq!(after.mode() & 0o7777, 0o640);
        assert_eq!(after.mtime(), before.mtime());
    }

    #[test]
    fn test_migrate_symlink_preserves_literal_target() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = tier_at(a.path(), "fast");
        let dst = tier_at(b.path(), "slow");
        std::os::unix::fs::symlink("some/target", a.path().join("lnk")).unwrap();

        migrate(Path::new("lnk"), &src, &dst, 4096).unwrap();
        assert!(a.path().join("lnk").symlink_metadata().is_err());
        assert_eq!(
            std::fs::read_link(b.path().join("lnk")).unwrap(),
            PathBuf::from("some/target")
        );
    }

    #[test]
    fn test_migrate_vanished_source() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = tier_at(a.path(), "fast");
        let dst = tier_at(b.path(), "slow");
        let err = migrate(Path::new("ghost"), &src, &dst, 4096).unwrap_err();
        assert!(matches!(err, MigrateError::SourceVanished { .. }));
    }

    #[test]
    fn test_migrate_leaves_no_temp_on_success() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = tier_at(a.path(), "fast");
        let dst = tier_at(b.path(), "slow");
        std::fs::write(a.path().join("f"), b"data").unwrap();

        migrate(Path::new("f"), &src, &dst, 4096).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(b.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_migration_temp(&e.file_name().to_string_lossy()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_mirror_parents_union_uses_resolved_metadata() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let specs = vec![
            TierSpec {
                id: "fast".into(),
                path: a.path().to_path_buf(),
                watermark: 50,
            },
            TierSpec {
                id: "slow".into(),
                path: b.path().to_path_buf(),
                watermark: 50,
            },
        ];
        let tiers = TierSet::new(&specs);
        std::fs::create_dir(a.path().join("d")).unwrap();
        std::fs::set_permissions(a.path().join("d"), std::fs::Permissions::from_mode(0o700))
            .unwrap();

        mirror_parents_union(&tiers, 1, Some(Path::new("d"))).unwrap();
        let meta = std::fs::metadata(b.path().join("d")).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o700);
    }

    #[test]
    fn test_copy_across_streams_and_cleans_temp() {
        // Exercises the EXDEV path directly; tempdirs share a filesystem
        // so migrate() would otherwise take the rename fast path.
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src_path = a.path().join("f");
        let dst_path = b.path().join("f");
        let payload = vec![7u8; 10_000];
        std::fs::write(&src_path, &payload).unwrap();
        std::fs::set_permissions(&src_path, std::fs::Permissions::from_mode(0o600)).unwrap();
        let meta = std::fs::symlink_metadata(&src_path).unwrap();

        // Tiny buffer forces many read/write iterations.
        copy_across(Path::new("f"), &src_path, &dst_path, &meta, 64).unwrap();

        assert_eq!(std::fs::read(&dst_path).unwrap(), payload);
        assert!(src_path.exists(), "copy_across must not unlink the source");
        let dst_meta = std::fs::metadata(&dst_path).unwrap();
        assert_eq!(dst_meta.mode() & 0o7777, 0o600);
        assert_eq!(dst_meta.mtime(), meta.mtime());
        let temps: Vec<_> = std::fs::read_dir(b.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_migration_temp(&e.file_name().to_string_lossy()))
            .collect();
        assert!(temps.is_empty());
    }

    #[test]
    fn test_gate_serializes_same_path() {
        let gate = Arc::new(MigrationGate::new());
        let guard = gate.acquire(Path::new("a/b"));
        assert!(gate.is_in_flight(Path::new("a/b")));
        assert!(!gate.is_in_flight(Path::new("a/c")));

        let gate2 = gate.clone();
        let waiter = std::thread::spawn(move || {
            let _g = gate2.acquire(Path::new("a/b"));
        });
        // The waiter cannot finish until the first guard drops.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().unwrap();
        assert!(!gate.is_in_flight(Path::new("a/b")));
    }
}
