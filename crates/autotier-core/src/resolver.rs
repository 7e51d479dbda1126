//! Logical-path resolution across the ordered tier list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use autotier_config::TierSpec;
use tracing::warn;

use crate::tier::Tier;

/// A resolved logical path: which tier holds it and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Index into the tier list (0 = fastest).
    pub tier_index: usize,
    /// Absolute backing path on that tier.
    pub backing: PathBuf,
}

/// The ordered, immutable tier list. Index 0 is the fastest tier.
#[derive(Debug)]
pub struct TierSet {
    tiers: Vec<Arc<Tier>>,
}

impl TierSet {
    pub fn new(specs: &[TierSpec]) -> Self {
        TierSet {
            tiers: specs.iter().map(|s| Arc::new(Tier::new(s))).collect(),
        }
    }

    pub fn tiers(&self) -> &[Arc<Tier>] {
        &self.tiers
    }

    pub fn tier(&self, index: usize) -> &Arc<Tier> {
        &self.tiers[index]
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Find a tier by id.
    pub fn by_id(&self, id: &str) -> Option<&Arc<Tier>> {
        self.tiers.iter().find(|t| t.id() == id)
    }

    /// Resolve a logical path to the first (highest-priority) tier that
    /// holds it. `lstat` semantics: dangling symlinks still resolve.
    /// `None` means no tier holds the path; callers short-circuit to
    /// ENOENT without touching the filesystem again.
    pub fn resolve(&self, rel: &Path) -> Option<Resolved> {
        for (tier_index, tier) in self.tiers.iter().enumerate() {
            let backing = tier.backing_path(rel);
            if std::fs::symlink_metadata(&backing).is_ok() {
                return Some(Resolved {
                    tier_index,
                    backing,
                });
            }
        }
        None
    }

    /// Every tier holding the path, fastest first. More than one entry is
    /// a uniqueness-invariant violation; the caller decides what to do
    /// with the duplicates (the resolver never deletes).
    pub fn resolve_all(&self, rel: &Path) -> Vec<Resolved> {
        let mut found = Vec::new();
        for (tier_index, tier) in self.tiers.iter().enumerate() {
            let backing = tier.backing_path(rel);
            if std::fs::symlink_metadata(&backing).is_ok() {
                found.push(Resolved {
                    tier_index,
                    backing,
                });
            }
        }
        if found.len() > 1 {
            warn!(
                path = %rel.display(),
                copies = found.len(),
                "logical path present on multiple tiers"
            );
        }
        found
    }

    /// Tier for a newly created path: the fastest tier with watermark
    /// headroom, falling back to the last tier when every tier is full.
    pub fn resolve_for_create(&self) -> usize {
        for (index, tier) in self.tiers.iter().enumerate() {
            if !tier.is_at_watermark() {
                return index;
            }
        }
        self.tiers.len() - 1
    }
}
