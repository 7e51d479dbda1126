//! The union passthrough filesystem.
//!
//! Every operation that names a logical path resolves it to a backing
//! path on whichever tier currently holds it and delegates the syscall
//! there. Attribute and entry TTLs are zero so completed migrations are
//! visible to the very next call.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{CString, OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{chown, lchown, FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use autotier_core::migrate::{self, is_migration_temp, MigrateError, MigrationGate};
use autotier_core::resolver::{Resolved, TierSet};
use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use tracing::{debug, warn};

use crate::attr::{kind_of, to_file_attr};
use crate::error::errno_of;
use crate::inode::{InodeId, PathTable, ROOT_INODE};

/// Filesystem-level tunables.
#[derive(Debug, Clone)]
pub struct UnionFsConfig {
    /// Attribute cache TTL. Zero: lower-FS changes are seen immediately.
    pub attr_ttl: Duration,
    /// Entry cache TTL. Zero, same reason.
    pub entry_ttl: Duration,
}

impl Default for UnionFsConfig {
    fn default() -> Self {
        UnionFsConfig {
            attr_ttl: Duration::ZERO,
            entry_ttl: Duration::ZERO,
        }
    }
}

struct FsState {
    paths: PathTable,
    handles: HashMap<u64, Arc<File>>,
    next_fh: u64,
}

/// The union view over the ordered tier list.
pub struct UnionFs {
    tiers: Arc<TierSet>,
    gate: Arc<MigrationGate>,
    copy_buffer_size: usize,
    config: UnionFsConfig,
    state: Mutex<FsState>,
}

impl UnionFs {
    pub fn new(tiers: Arc<TierSet>, gate: Arc<MigrationGate>, copy_buffer_size: usize) -> Self {
        UnionFs {
            tiers,
            gate,
            copy_buffer_size,
            config: UnionFsConfig::default(),
            state: Mutex::new(FsState {
                paths: PathTable::new(),
                handles: HashMap::new(),
                next_fh: 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FsState> {
        self.state.lock().expect("filesystem state poisoned")
    }

    /// Logical path for an inode, or ENOENT when the table has no entry.
    fn rel_of(&self, ino: InodeId) -> Result<PathBuf, c_int> {
        self.lock().paths.logical_path(ino).ok_or(libc::ENOENT)
    }

    fn resolve(&self, rel: &Path) -> Result<Resolved, c_int> {
        self.tiers.resolve(rel).ok_or(libc::ENOENT)
    }

    fn attr_of(&self, ino: InodeId, rel: &Path) -> Result<fuser::FileAttr, c_int> {
        let resolved = self.resolve(rel)?;
        let meta = std::fs::symlink_metadata(&resolved.backing).map_err(|e| errno_of(&e))?;
        Ok(to_file_attr(ino, &meta))
    }

    fn handle(&self, fh: u64) -> Result<Arc<File>, c_int> {
        self.lock().handles.get(&fh).cloned().ok_or(libc::EBADF)
    }

    fn store_handle(&self, file: File) -> u64 {
        let mut state = self.lock();
        let fh = state.next_fh;
        state.next_fh += 1;
        state.handles.insert(fh, Arc::new(file));
        fh
    }

    /// Union of a logical directory across every tier that holds it:
    /// duplicate names appear once (fastest tier wins); a file/directory
    /// kind conflict hides the lower-priority entry; migration
    /// temporaries never surface.
    fn union_entries(
        &self,
        rel: &Path,
    ) -> Result<Vec<(u64, fuser::FileType, OsString)>, c_int> {
        let mut merged: BTreeMap<OsString, (u64, fuser::FileType)> = BTreeMap::new();
        let mut found_dir = false;
        for tier in self.tiers.tiers() {
            let backing = tier.backing_path(rel);
            let iter = match std::fs::read_dir(&backing) {
                Ok(iter) => iter,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => continue,
                Err(e) => return Err(errno_of(&e)),
            };
            found_dir = true;
            for entry in iter.flatten() {
                let name = entry.file_name();
                if let Some(name_str) = name.to_str() {
                    if is_migration_temp(name_str) {
                        continue;
                    }
                }
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                let kind = kind_of(&file_type);
                use std::os::unix::fs::DirEntryExt;
                match merged.get(&name) {
                    None => {
                        merged.insert(name, (entry.ino(), kind));
                    }
                    Some((_, existing_kind)) => {
                        let clash = (*existing_kind == fuser::FileType::Directory)
                            != (kind == fuser::FileType::Directory);
                        if clash {
                            warn!(
                                dir = %rel.display(),
                                name = %name.to_string_lossy(),
                                tier = tier.id(),
                                "name is a file on one tier and a directory on another; hiding lower tier"
                            );
                        }
                    }
                }
            }
        }
        if !found_dir {
            return Err(libc::ENOENT);
        }
        Ok(merged
            .into_iter()
            .map(|(name, (ino, kind))| (ino, kind, name))
            .collect())
    }

    /// Destination tier for a rename: keep the source tier when the new
    /// parent also exists there (no data movement), otherwise the fastest
    /// tier holding the new parent.
    fn rename_destination_tier(
        &self,
        src_index: usize,
        new_parent_rel: &Path,
    ) -> Result<usize, c_int> {
        let holders = self.tiers.resolve_all(new_parent_rel);
        if holders.is_empty() {
            return Err(libc::ENOENT);
        }
        if holders.iter().any(|h| h.tier_index == src_index) {
            return Ok(src_index);
        }
        Ok(holders[0].tier_index)
    }

    /// Inline migration ahead of a cross-tier two-path operation,
    /// serialized with the engine through the shared gate.
    fn migrate_for_rename(&self, rel: &Path, dst_index: usize) -> Result<(), c_int> {
        let _guard = self.gate.acquire(rel);
        // The engine may have moved the file while we waited.
        let src = self.resolve(rel)?;
        if src.tier_index == dst_index {
            return Ok(());
        }
        let src_tier = self.tiers.tier(src.tier_index);
        let dst_tier = self.tiers.tier(dst_index);
        match migrate::migrate(rel, src_tier, dst_tier, self.copy_buffer_size) {
            Ok(_) => Ok(()),
            // Destination is in place; the stale source copy is an
            // anomaly the engine cleans next tick.
            Err(MigrateError::SourceUnlinkFailed { .. }) => {
                warn!(path = %rel.display(), "inline migration left a duplicate behind");
                Ok(())
            }
            Err(MigrateError::SourceVanished { .. }) => Err(libc::ENOENT),
            Err(MigrateError::Io { source, .. }) => Err(errno_of(&source)),
        }
    }

    /// After a rename lands on `dst_index`, copies of the new name on
    /// other tiers would shadow or be shadowed; drop them.
    fn remove_shadowed(&self, new_rel: &Path, dst_index: usize) {
        for holder in self.tiers.resolve_all(new_rel) {
            if holder.tier_index == dst_index {
                continue;
            }
            let is_dir = std::fs::symlink_metadata(&holder.backing)
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if is_dir {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&holder.backing) {
                warn!(
                    path = %new_rel.display(),
                    error = %e,
                    "failed to remove shadowed copy after rename"
                );
            }
        }
    }
}

fn cstring(path: &Path) -> Result<CString, c_int> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)
}

fn statvfs_of(path: &Path) -> Result<libc::statvfs, c_int> {
    let cpath = cstring(path)?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(errno_of(&io::Error::last_os_error()));
    }
    Ok(st)
}

fn timespec_of(time: Option<TimeOrNow>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(at)) => match at.duration_since(UNIX_EPOCH) {
            Ok(d) => libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            },
            Err(_) => libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        },
    }
}

impl Filesystem for UnionFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!(tiers = self.tiers.len(), "union filesystem init");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("union filesystem destroy");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_rel = match self.rel_of(parent) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let rel = parent_rel.join(name);
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let meta = match std::fs::symlink_metadata(&resolved.backing) {
            Ok(m) => m,
            Err(e) => return reply.error(errno_of(&e)),
        };
        let ino = self.lock().paths.alloc_or_ref(parent, name);
        reply.entry(&self.config.entry_ttl, &to_file_attr(ino, &meta), 0);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.lock().paths.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        // An open handle stays valid even if a migration unlinked the
        // path underneath it; prefer fstat in that case.
        if let Some(fh) = fh {
            if let Ok(file) = self.handle(fh) {
                match file.metadata() {
                    Ok(meta) => return reply.attr(&self.config.attr_ttl, &to_file_attr(ino, &meta)),
                    Err(e) => return reply.error(errno_of(&e)),
                }
            }
        }
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        match self.attr_of(ino, &rel) {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let backing = &resolved.backing;

        if let Some(new_size) = size {
            let result = match fh.and_then(|fh| self.handle(fh).ok()) {
                Some(file) => file.set_len(new_size),
                None => OpenOptions::new()
                    .write(true)
                    .open(backing)
                    .and_then(|f| f.set_len(new_size)),
            };
            if let Err(e) = result {
                return reply.error(errno_of(&e));
            }
        }

        if let Some(new_mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(new_mode & 0o7777);
            if let Err(e) = std::fs::set_permissions(backing, perms) {
                return reply.error(errno_of(&e));
            }
        }

        if uid.is_some() || gid.is_some() {
            if let Err(e) = lchown(backing, uid, gid) {
                return reply.error(errno_of(&e));
            }
        }

        if atime.is_some() || mtime.is_some() {
            let times = [timespec_of(atime), timespec_of(mtime)];
            let cpath = match cstring(backing) {
                Ok(c) => c,
                Err(e) => return reply.error(e),
            };
            let rc = unsafe {
                libc::utimensat(
                    libc::AT_FDCWD,
                    cpath.as_ptr(),
                    times.as_ptr(),
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            };
            if rc != 0 {
                return reply.error(errno_of(&io::Error::last_os_error()));
            }
        }

        match self.attr_of(ino, &rel) {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        match std::fs::read_link(&resolved.backing) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let parent_rel = match self.rel_of(parent) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let rel = parent_rel.join(name);
        let dst_index = self.tiers.resolve_for_create();
        if let Err(e) = migrate::mirror_parents_union(&self.tiers, dst_index, rel.parent()) {
            return reply.error(errno_of(&e));
        }
        let backing = self.tiers.tier(dst_index).backing_path(&rel);
        let cpath = match cstring(&backing) {
            Ok(c) => c,
            Err(e) => return reply.error(e),
        };
        let effective = (mode & libc::S_IFMT) | (mode & 0o7777 & !umask);
        let rc = unsafe { libc::mknod(cpath.as_ptr(), effective as libc::mode_t, rdev as libc::dev_t) };
        if rc != 0 {
            return reply.error(errno_of(&io::Error::last_os_error()));
        }
        let _ = lchown(&backing, Some(req.uid()), Some(req.gid()));
        let meta = match std::fs::symlink_metadata(&backing) {
            Ok(m) => m,
            Err(e) => return reply.error(errno_of(&e)),
        };
        let ino = self.lock().paths.alloc_or_ref(parent, name);
        reply.entry(&self.config.entry_ttl, &to_file_attr(ino, &meta), 0);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_rel = match self.rel_of(parent) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let rel = parent_rel.join(name);
        let dst_index = self.tiers.resolve_for_create();
        if let Err(e) = migrate::mirror_parents_union(&self.tiers, dst_index, rel.parent()) {
            return reply.error(errno_of(&e));
        }
        let backing = self.tiers.tier(dst_index).backing_path(&rel);
        use std::os::unix::fs::DirBuilderExt;
        if let Err(e) = std::fs::DirBuilder::new()
            .mode(mode & 0o7777 & !umask)
            .create(&backing)
        {
            return reply.error(errno_of(&e));
        }
        let _ = chown(&backing, Some(req.uid()), Some(req.gid()));
        let meta = match std::fs::symlink_metadata(&backing) {
            Ok(m) => m,
            Err(e) => return reply.error(errno_of(&e)),
        };
        let ino = self.lock().paths.alloc_or_ref(parent, name);
        reply.entry(&self.config.entry_ttl, &to_file_attr(ino, &meta), 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_rel = match self.rel_of(parent) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let rel = parent_rel.join(name);
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = std::fs::remove_file(&resolved.backing) {
            return reply.error(errno_of(&e));
        }
        self.lock().paths.unlink_name(parent, name);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_rel = match self.rel_of(parent) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let rel = parent_rel.join(name);
        // Merged directories exist on several tiers at once; removal
        // succeeds only when every mirror is empty, and removes them all.
        let holders = self.tiers.resolve_all(&rel);
        if holders.is_empty() {
            return reply.error(libc::ENOENT);
        }
        for holder in &holders {
            match std::fs::read_dir(&holder.backing) {
                Ok(mut iter) => {
                    if iter.next().is_some() {
                        return reply.error(libc::ENOTEMPTY);
                    }
                }
                Err(e) => return reply.error(errno_of(&e)),
            }
        }
        for holder in &holders {
            if let Err(e) = std::fs::remove_dir(&holder.backing) {
                return reply.error(errno_of(&e));
            }
        }
        self.lock().paths.unlink_name(parent, name);
        reply.ok();
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent_rel = match self.rel_of(parent) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let rel = parent_rel.join(link_name);
        let dst_index = self.tiers.resolve_for_create();
        if let Err(e) = migrate::mirror_parents_union(&self.tiers, dst_index, rel.parent()) {
            return reply.error(errno_of(&e));
        }
        let backing = self.tiers.tier(dst_index).backing_path(&rel);
        // The target is stored verbatim; it only gains meaning when read
        // back through the union view.
        if let Err(e) = std::os::unix::fs::symlink(target, &backing) {
            return reply.error(errno_of(&e));
        }
        let _ = lchown(&backing, Some(req.uid()), Some(req.gid()));
        let meta = match std::fs::symlink_metadata(&backing) {
            Ok(m) => m,
            Err(e) => return reply.error(errno_of(&e)),
        };
        let ino = self.lock().paths.alloc_or_ref(parent, link_name);
        reply.entry(&self.config.entry_ttl, &to_file_attr(ino, &meta), 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            return reply.error(libc::EINVAL);
        }
        let (parent_rel, newparent_rel) = {
            let state = self.lock();
            match (
                state.paths.logical_path(parent),
                state.paths.logical_path(newparent),
            ) {
                (Some(a), Some(b)) => (a, b),
                _ => return reply.error(libc::ENOENT),
            }
        };
        let old_rel = parent_rel.join(name);
        let new_rel = newparent_rel.join(newname);

        let src = match self.resolve(&old_rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let dst_index = match self.rename_destination_tier(src.tier_index, &newparent_rel) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        if dst_index != src.tier_index {
            debug!(
                from = %old_rel.display(),
                to = %new_rel.display(),
                "rename crosses tiers; migrating inline"
            );
            if let Err(e) = self.migrate_for_rename(&old_rel, dst_index) {
                return reply.error(e);
            }
        }

        let tier = self.tiers.tier(dst_index);
        if let Err(e) = std::fs::rename(tier.backing_path(&old_rel), tier.backing_path(&new_rel)) {
            return reply.error(errno_of(&e));
        }
        self.remove_shadowed(&new_rel, dst_index);
        self.lock()
            .paths
            .rename_name(parent, name, newparent, newname);
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (rel, newparent_rel) = {
            let state = self.lock();
            match (
                state.paths.logical_path(ino),
                state.paths.logical_path(newparent),
            ) {
                (Some(a), Some(b)) => (a, b),
                _ => return reply.error(libc::ENOENT),
            }
        };
        let src = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        // Hardlinks never span tiers; a link whose new parent lives only
        // on other tiers is cross-device.
        let holders = self.tiers.resolve_all(&newparent_rel);
        if !holders.iter().any(|h| h.tier_index == src.tier_index) {
            return reply.error(libc::EXDEV);
        }
        let new_rel = newparent_rel.join(newname);
        let new_backing = self.tiers.tier(src.tier_index).backing_path(&new_rel);
        if let Err(e) = std::fs::hard_link(&src.backing, &new_backing) {
            return reply.error(errno_of(&e));
        }
        let meta = match std::fs::symlink_metadata(&new_backing) {
            Ok(m) => m,
            Err(e) => return reply.error(errno_of(&e)),
        };
        let new_ino = self.lock().paths.alloc_or_ref(newparent, newname);
        reply.entry(&self.config.entry_ttl, &to_file_attr(new_ino, &meta), 0);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let accmode = flags & libc::O_ACCMODE;
        let writable = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;
        let mut options = OpenOptions::new();
        options
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(writable)
            .truncate(writable && flags & libc::O_TRUNC != 0)
            // The kernel resolves append mode into explicit offsets; an
            // O_APPEND backing fd would break positional writes.
            .custom_flags(flags & !(libc::O_ACCMODE | libc::O_TRUNC | libc::O_APPEND | libc::O_CREAT));
        match options.open(&resolved.backing) {
            Ok(file) => {
                let fh = self.store_handle(file);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let file = match self.handle(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset as u64 + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return reply.error(errno_of(&e)),
            }
        }
        reply.data(&buf[..filled]);
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let file = match self.handle(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };
        match file.write_all_at(data, offset as u64) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.handle(fh) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.lock().handles.remove(&fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let file = match self.handle(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };
        let result = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.rel_of(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let merged = match self.union_entries(&rel) {
            Ok(m) => m,
            Err(e) => return reply.error(e),
        };
        let parent_ino = if ino == ROOT_INODE {
            ROOT_INODE
        } else {
            self.lock().paths.parent_of(ino).unwrap_or(ROOT_INODE)
        };

        let mut entries: Vec<(u64, fuser::FileType, OsString)> = vec![
            (ino, fuser::FileType::Directory, OsString::from(".")),
            (parent_ino, fuser::FileType::Directory, OsString::from("..")),
        ];
        entries.extend(merged);

        for (i, (entry_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        match statvfs_of(&resolved.backing) {
            Ok(st) => reply.statfs(
                st.f_blocks as u64,
                st.f_bfree as u64,
                st.f_bavail as u64,
                st.f_files as u64,
                st.f_ffree as u64,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(e) => reply.error(e),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let cpath = match cstring(&resolved.backing) {
            Ok(c) => c,
            Err(e) => return reply.error(e),
        };
        let Ok(cname) = CString::new(name.as_bytes()) else {
            return reply.error(libc::EINVAL);
        };
        let rc = unsafe {
            libc::lsetxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags,
            )
        };
        if rc != 0 {
            return reply.error(errno_of(&io::Error::last_os_error()));
        }
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let cpath = match cstring(&resolved.backing) {
            Ok(c) => c,
            Err(e) => return reply.error(e),
        };
        let Ok(cname) = CString::new(name.as_bytes()) else {
            return reply.error(libc::EINVAL);
        };
        if size == 0 {
            let len = unsafe {
                libc::lgetxattr(cpath.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0)
            };
            if len < 0 {
                return reply.error(errno_of(&io::Error::last_os_error()));
            }
            return reply.size(len as u32);
        }
        let mut buf = vec![0u8; size as usize];
        let len = unsafe {
            libc::lgetxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if len < 0 {
            return reply.error(errno_of(&io::Error::last_os_error()));
        }
        reply.data(&buf[..len as usize]);
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let cpath = match cstring(&resolved.backing) {
            Ok(c) => c,
            Err(e) => return reply.error(e),
        };
        if size == 0 {
            let len = unsafe { libc::llistxattr(cpath.as_ptr(), std::ptr::null_mut(), 0) };
            if len < 0 {
                return reply.error(errno_of(&io::Error::last_os_error()));
            }
            return reply.size(len as u32);
        }
        let mut buf = vec![0u8; size as usize];
        let len = unsafe {
            libc::llistxattr(cpath.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if len < 0 {
            return reply.error(errno_of(&io::Error::last_os_error()));
        }
        reply.data(&buf[..len as usize]);
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let cpath = match cstring(&resolved.backing) {
            Ok(c) => c,
            Err(e) => return reply.error(e),
        };
        let Ok(cname) = CString::new(name.as_bytes()) else {
            return reply.error(libc::EINVAL);
        };
        let rc = unsafe { libc::lremovexattr(cpath.as_ptr(), cname.as_ptr()) };
        if rc != 0 {
            return reply.error(errno_of(&io::Error::last_os_error()));
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let rel = match self.rel_of(ino) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let resolved = match self.resolve(&rel) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let cpath = match cstring(&resolved.backing) {
            Ok(c) => c,
            Err(e) => return reply.error(e),
        };
        let rc = unsafe { libc::access(cpath.as_ptr(), mask) };
        if rc != 0 {
            return reply.error(errno_of(&io::Error::last_os_error()));
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_rel = match self.rel_of(parent) {
            Ok(r) => r,
            Err(e) => return reply.error(e),
        };
        let rel = parent_rel.join(name);
        // New files are born on the fastest tier with headroom.
        let dst_index = self.tiers.resolve_for_create();
        if let Err(e) = migrate::mirror_parents_union(&self.tiers, dst_index, rel.parent()) {
            return reply.error(errno_of(&e));
        }
        let backing = self.tiers.tier(dst_index).backing_path(&rel);

        let accmode = flags & libc::O_ACCMODE;
        let mut options = OpenOptions::new();
        options
            .read(accmode != libc::O_WRONLY)
            .write(true)
            .create(true)
            .create_new(flags & libc::O_EXCL != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode & 0o7777 & !umask)
            .custom_flags(
                flags & !(libc::O_ACCMODE | libc::O_TRUNC | libc::O_APPEND | libc::O_CREAT | libc::O_EXCL),
            );
        let file = match options.open(&backing) {
            Ok(f) => f,
            Err(e) => return reply.error(errno_of(&e)),
        };
        let _ = chown(&backing, Some(req.uid()), Some(req.gid()));
        let meta = match file.metadata() {
            Ok(m) => m,
            Err(e) => return reply.error(errno_of(&e)),
        };
        let ino = self.lock().paths.alloc_or_ref(parent, name);
        let attr = to_file_attr(ino, &meta);
        let fh = self.store_handle(file);
        reply.created(&self.config.entry_ttl, &attr, 0, fh, 0);
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        if mode != 0 {
            return reply.error(libc::EOPNOTSUPP);
        }
        let file = match self.handle(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), offset, length) };
        if rc != 0 {
            return reply.error(rc);
        }
        reply.ok();
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        _ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        _ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        let (file_in, file_out) = match (self.handle(fh_in), self.handle(fh_out)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        let mut off_in = offset_in;
        let mut off_out = offset_out;
        let copied = unsafe {
            libc::copy_file_range(
                file_in.as_raw_fd(),
                &mut off_in,
                file_out.as_raw_fd(),
                &mut off_out,
                len as usize,
                0,
            )
        };
        if copied < 0 {
            return reply.error(errno_of(&io::Error::last_os_error()));
        }
        reply.written(copied as u32);
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let file = match self.handle(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };
        let result = unsafe { libc::lseek(file.as_raw_fd(), offset, whence) };
        if result < 0 {
            return reply.error(errno_of(&io::Error::last_os_error()));
        }
        reply.offset(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotier_config::TierSpec;

    fn union_over(dirs: &[&Path]) -> UnionFs {
        let specs: Vec<TierSpec> = dirs
            .iter()
            .enumerate()
            .map(|(i, d)| TierSpec {
                id: format!("tier{i}"),
                path: d.to_path_buf(),
                watermark: 50,
            })
            .collect();
        UnionFs::new(
            Arc::new(TierSet::new(&specs)),
            Arc::new(MigrationGate::new()),
            64 * 1024,
        )
    }

    #[test]
    fn test_union_entries_merges_tiers() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        std::fs::create_dir(fast.path().join("d")).unwrap();
        std::fs::create_dir(slow.path().join("d")).unwrap();
        std::fs::write(fast.path().join("d/a"), b"1").unwrap();
        std::fs::write(slow.path().join("d/b"), b"2").unwrap();

        let fs = union_over(&[fast.path(), slow.path()]);
        let entries = fs.union_entries(Path::new("d")).unwrap();
        let names: Vec<String> = entries
            .iter()
            .map(|(_, _, n)| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_union_entries_dedups_across_tiers() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        std::fs::write(fast.path().join("same"), b"1").unwrap();
        std::fs::write(slow.path().join("same"), b"2").unwrap();

        let fs = union_over(&[fast.path(), slow.path()]);
        let entries = fs.union_entries(Path::new("")).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_union_entries_hides_kind_conflict() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        std::fs::write(fast.path().join("x"), b"file wins").unwrap();
        std::fs::create_dir(slow.path().join("x")).unwrap();

        let fs = union_over(&[fast.path(), slow.path()]);
        let entries = fs.union_entries(Path::new("")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, fuser::FileType::RegularFile);
    }

    #[test]
    fn test_union_entries_hides_migration_temps() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        std::fs::write(fast.path().join("real"), b"1").unwrap();
        std::fs::write(fast.path().join(".real.autotier.tmp"), b"half").unwrap();

        let fs = union_over(&[fast.path(), slow.path()]);
        let entries = fs.union_entries(Path::new("")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].2, OsString::from("real"));
    }

    #[test]
    fn test_union_entries_missing_dir_is_enoent() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        let fs = union_over(&[fast.path(), slow.path()]);
        assert_eq!(fs.union_entries(Path::new("ghost")), Err(libc::ENOENT));
    }

    #[test]
    fn test_rename_destination_prefers_source_tier() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        // Parent dir exists on both tiers; a file on the slow tier
        // renames in place.
        std::fs::create_dir(fast.path().join("d")).unwrap();
        std::fs::create_dir(slow.path().join("d")).unwrap();
        let fs = union_over(&[fast.path(), slow.path()]);
        assert_eq!(fs.rename_destination_tier(1, Path::new("d")).unwrap(), 1);
    }

    #[test]
    fn test_rename_destination_follows_parent_tier() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        // New parent exists only on the fast tier: cross-tier rename.
        std::fs::create_dir(fast.path().join("only-fast")).unwrap();
        let fs = union_over(&[fast.path(), slow.path()]);
        assert_eq!(
            fs.rename_destination_tier(1, Path::new("only-fast")).unwrap(),
            0
        );
    }

    #[test]
    fn test_rename_destination_missing_parent() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        let fs = union_over(&[fast.path(), slow.path()]);
        assert_eq!(
            fs.rename_destination_tier(0, Path::new("nope")),
            Err(libc::ENOENT)
        );
    }

    #[test]
    fn test_migrate_for_rename_moves_file() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        std::fs::write(slow.path().join("x"), b"move me").unwrap();
        let fs = union_over(&[fast.path(), slow.path()]);

        fs.migrate_for_rename(Path::new("x"), 0).unwrap();
        assert_eq!(std::fs::read(fast.path().join("x")).unwrap(), b"move me");
        assert!(!slow.path().join("x").exists());
    }

    #[test]
    fn test_migrate_for_rename_noop_when_already_there() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        std::fs::write(fast.path().join("x"), b"stay").unwrap();
        let fs = union_over(&[fast.path(), slow.path()]);

        fs.migrate_for_rename(Path::new("x"), 0).unwrap();
        assert_eq!(std::fs::read(fast.path().join("x")).unwrap(), b"stay");
    }

    #[test]
    fn test_remove_shadowed_drops_other_copies() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        std::fs::write(fast.path().join("y"), b"winner").unwrap();
        std::fs::write(slow.path().join("y"), b"stale").unwrap();
        let fs = union_over(&[fast.path(), slow.path()]);

        fs.remove_shadowed(Path::new("y"), 0);
        assert!(fast.path().join("y").exists());
        assert!(!slow.path().join("y").exists());
    }
}
