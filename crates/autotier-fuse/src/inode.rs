//! Inode to logical-path mapping.
//!
//! fuser speaks inodes; the union view speaks logical paths. The table
//! maps each kernel-visible inode to its `(parent, name)` link so the
//! logical path can be reassembled on every call — the backing truth
//! stays on disk, never cached here. Entries live as long as the kernel
//! holds lookups on them.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

pub type InodeId = u64;

/// The root of the union view; its logical path is empty.
pub const ROOT_INODE: InodeId = 1;

#[derive(Debug)]
struct NodeEntry {
    parent: InodeId,
    name: OsString,
    lookup_count: u64,
}

/// Bidirectional ino ⇄ (parent, name) table.
#[derive(Debug)]
pub struct PathTable {
    entries: HashMap<InodeId, NodeEntry>,
    children: HashMap<(InodeId, OsString), InodeId>,
    next_ino: InodeId,
}

impl PathTable {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ROOT_INODE,
            NodeEntry {
                parent: ROOT_INODE,
                name: OsString::new(),
                lookup_count: 1,
            },
        );
        PathTable {
            entries,
            children: HashMap::new(),
            next_ino: ROOT_INODE + 1,
        }
    }

    /// Reassemble the logical path for an inode. `None` when the kernel
    /// references an inode the table no longer knows.
    pub fn logical_path(&self, ino: InodeId) -> Option<PathBuf> {
        if ino == ROOT_INODE {
            return Some(PathBuf::new());
        }
        let mut names = Vec::new();
        let mut current = ino;
        while current != ROOT_INODE {
            let entry = self.entries.get(&current)?;
            names.push(entry.name.clone());
            current = entry.parent;
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        Some(path)
    }

    /// Known child inode for `(parent, name)`, if any.
    pub fn child(&self, parent: InodeId, name: &OsStr) -> Option<InodeId> {
        self.children.get(&(parent, name.to_os_string())).copied()
    }

    /// Parent inode of a live entry.
    pub fn parent_of(&self, ino: InodeId) -> Option<InodeId> {
        self.entries.get(&ino).map(|e| e.parent)
    }

    /// Return the inode for `(parent, name)`, allocating one on first
    /// lookup and bumping the lookup count otherwise. Every reply that
    /// hands the kernel an entry must come through here so `forget`
    /// balances.
    pub fn alloc_or_ref(&mut self, parent: InodeId, name: &OsStr) -> InodeId {
        if let Some(ino) = self.child(parent, name) {
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.lookup_count += 1;
            }
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.entries.insert(
            ino,
            NodeEntry {
                parent,
                name: name.to_os_string(),
                lookup_count: 1,
            },
        );
        self.children.insert((parent, name.to_os_string()), ino);
        ino
    }

    /// Drop `nlookup` kernel references; the entry dies at zero.
    pub fn forget(&mut self, ino: InodeId, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let remove = match self.entries.get_mut(&ino) {
            Some(entry) => {
                entry.lookup_count = entry.lookup_count.saturating_sub(nlookup);
                entry.lookup_count == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = self.entries.remove(&ino) {
                let key = (entry.parent, entry.name);
                if self.children.get(&key) == Some(&ino) {
                    self.children.remove(&key);
                }
            }
        }
    }

    /// The name was unlinked: unmap it so fresh lookups miss, but keep
    /// the entry itself alive for the kernel's outstanding references.
    pub fn unlink_name(&mut self, parent: InodeId, name: &OsStr) {
        self.children.remove(&(parent, name.to_os_string()));
    }

    /// Move a name to a new `(parent, name)`, displacing any mapping the
    /// rename overwrote.
    pub fn rename_name(
        &mut self,
        parent: InodeId,
        name: &OsStr,
        new_parent: InodeId,
        new_name: &OsStr,
    ) {
        self.children.remove(&(new_parent, new_name.to_os_string()));
        if let Some(ino) = self.children.remove(&(parent, name.to_os_string())) {
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.parent = new_parent;
                entry.name = new_name.to_os_string();
            }
            self.children.insert((new_parent, new_name.to_os_string()), ino);
        }
    }

    /// Number of live entries (including the root).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}
