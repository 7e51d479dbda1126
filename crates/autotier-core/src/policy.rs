//! Watermark-driven placement policy.
//!
//! Each tick the engine hands the policy a snapshot of every file across
//! all tiers; the policy ranks them by popularity and computes the moves
//! needed so that each tier holds the hottest files that fit under its
//! watermark. Planning is pure: no I/O, fully unit-testable.

use std::path::PathBuf;
use std::time::SystemTime;

use tracing::warn;

/// Snapshot of one file taken during a scan; lives for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Path relative to any tier root.
    pub rel_path: PathBuf,
    /// Tier currently holding the file.
    pub tier_index: usize,
    /// Size in bytes.
    pub size: u64,
    /// Last access time; more recent means more popular.
    pub atime: SystemTime,
}

/// One planned migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub rel_path: PathBuf,
    pub src: usize,
    pub dst: usize,
}

impl PlannedMove {
    /// A move toward a slower tier frees space on a hot tier.
    pub fn is_downward(&self) -> bool {
        self.dst > self.src
    }
}

/// The ordered list of moves for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    pub moves: Vec<PlannedMove>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }
}

/// Order files by decreasing popularity: most recent atime first, ties
/// broken by larger size (moving one large file beats many small ones),
/// then by path for determinism.
pub fn rank(files: &mut [FileRecord]) {
    files.sort_by(|a, b| {
        b.atime
            .cmp(&a.atime)
            .then_with(|| b.size.cmp(&a.size))
            .then_with(|| a.rel_path.cmp(&b.rel_path))
    });
}

/// Assign each file (already in rank order) to the first tier whose
/// planned usage leaves room under its watermark budget. Files that fit
/// nowhere land on the last tier; that overflow is tolerated and warned
/// about.
fn assign(budgets: &[u64], files: &[FileRecord]) -> Vec<usize> {
    let last = budgets.len() - 1;
    let mut planned_usage = vec![0u64; budgets.len()];
    let mut placement = Vec::with_capacity(files.len());
    let mut overflow_bytes = 0u64;

    for file in files {
        let target = (0..budgets.len())
            .find(|&i| planned_usage[i].saturating_add(file.size) <= budgets[i]);
        let tier = match target {
            Some(i) => i,
            None => {
                overflow_bytes += file.size;
                last
            }
        };
        planned_usage[tier] += file.size;
        placement.push(tier);
    }

    if overflow_bytes > 0 {
        warn!(
            overflow_bytes,
            tier = last,
            "no tier has watermark headroom; overflowing the slowest tier"
        );
    }

    placement
}

/// Compute the migration plan for one tick.
///
/// `budgets[i]` is tier i's watermark in bytes; `files` is the full
/// cross-tier enumeration. Moves that free space (downward) are ordered
/// before moves that fill it (upward) so destinations never transiently
/// exceed capacity.
pub fn plan(budgets: &[u64], mut files: Vec<FileRecord>) -> MigrationPlan {
    if budgets.is_empty() {
        return MigrationPlan::default();
    }
    rank(&mut files);
    let placement = assign(budgets, &files);

    let mut downward = Vec::new();
    let mut upward = Vec::new();
    for (file, &dst) in files.iter().zip(placement.iter()) {
        if dst == file.tier_index {
            continue;
        }
        let mv = PlannedMove {
            rel_path: file.rel_path.clone(),
            src: file.tier_index,
            dst,
        };
        if mv.is_downward() {
            downward.push(mv);
        } else {
            upward.push(mv);
        }
    }
    // Drain the coldest destinations first so each upward move finds the
    // space its demotions just freed.
    downward.sort_by(|a, b| b.dst.cmp(&a.dst).then_with(|| a.rel_path.cmp(&b.rel_path)));
    upward.sort_by(|a, b| a.dst.cmp(&b.dst).then_with(|| a.rel_path.cmp(&b.rel_path)));

    let mut moves = downward;
    moves.extend(upward);
    MigrationPlan { moves }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn file(path: &str, tier: usize, size: u64, atime_secs: u64) -> FileRecord {
        FileRecord {
            rel_path: PathBuf::from(path),
            tier_index: tier,
            size,
            atime: UNIX_EPOCH + Duration::from_secs(atime_secs),
        }
    }

    fn apply(files: &[FileRecord], plan: &MigrationPlan) -> Vec<FileRecord> {
        let mut after = files.to_vec();
        for mv in &plan.moves {
            let f = after
                .iter_mut()
                .find(|f| f.rel_path == mv.rel_path)
                .unwrap();
            assert_eq!(f.tier_index, mv.src);
            f.tier_index = mv.dst;
        }
        after
    }

    #[test]
    fn test_rank_recent_first() {
        let mut files = vec![file("old", 0, 10, 100), file("new", 0, 10, 200)];
        rank(&mut files);
        assert_eq!(files[0].rel_path, PathBuf::from("new"));
    }

    #[test]
    fn test_rank_ties_broken_by_size() {
        let mut files = vec![file("small", 0, 10, 100), file("big", 0, 99, 100)];
        rank(&mut files);
        assert_eq!(files[0].rel_path, PathBuf::from("big"));
    }

    #[test]
    fn test_plan_evicts_oldest_over_watermark() {
        // Tier 0 budget 50: A (30, older) + B (30, newer) cannot both stay.
        let files = vec![file("A", 0, 30, 100), file("B", 0, 30, 101)];
        let plan = plan(&[50, 1000], files);
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.moves[0],
            PlannedMove {
                rel_path: PathBuf::from("A"),
                src: 0,
                dst: 1,
            }
        );
    }

    #[test]
    fn test_plan_promotes_hot_file() {
        // A on the slow tier was just read; B on the fast tier is stale.
        let files = vec![file("A", 1, 30, 200), file("B", 0, 30, 100)];
        let plan = plan(&[50, 1000], files);
        assert_eq!(plan.len(), 2);
        // Downward move (B out) precedes upward move (A in).
        assert_eq!(plan.moves[0].rel_path, PathBuf::from("B"));
        assert!(plan.moves[0].is_downward());
        assert_eq!(plan.moves[1].rel_path, PathBuf::from("A"));
        assert!(!plan.moves[1].is_downward());
    }

    #[test]
    fn test_plan_no_moves_when_placement_matches() {
        let files = vec![file("A", 0, 30, 200), file("B", 1, 30, 100)];
        let plan = plan(&[50, 1000], files);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_idempotent_second_tick() {
        let files = vec![
            file("a", 0, 40, 300),
            file("b", 0, 40, 200),
            file("c", 1, 20, 400),
            file("d", 1, 10, 100),
        ];
        let first = plan(&[60, 1000], files.clone());
        let after = apply(&files, &first);
        let second = plan(&[60, 1000], after);
        assert!(second.is_empty(), "second tick replanned: {second:?}");
    }

    #[test]
    fn test_plan_overflow_lands_on_last_tier() {
        // 150 total into budgets (50, 50): last tier exceeds its
        // watermark rather than dropping files.
        let files = vec![
            file("a", 0, 50, 300),
            file("b", 0, 50, 200),
            file("c", 0, 50, 100),
        ];
        let plan = plan(&[50, 50], files.clone());
        let after = apply(&files, &plan);
        let tier1_bytes: u64 = after
            .iter()
            .filter(|f| f.tier_index == 1)
            .map(|f| f.size)
            .sum();
        assert_eq!(tier1_bytes, 100);
        let tier0_bytes: u64 = after
            .iter()
            .filter(|f| f.tier_index == 0)
            .map(|f| f.size)
            .sum();
        assert_eq!(tier0_bytes, 50);
    }

    #[test]
    fn test_plan_oversized_file_falls_through() {
        // A file bigger than tier 0's budget goes to the next tier with
        // room without blocking smaller hot files from tier 0.
        let files = vec![file("huge", 1, 500, 300), file("hot", 1, 10, 200)];
        let plan = plan(&[100, 1000], files.clone());
        let after = apply(&files, &plan);
        let huge = after.iter().find(|f| f.rel_path.ends_with("huge")).unwrap();
        let hot = after.iter().find(|f| f.rel_path.ends_with("hot")).unwrap();
        assert_eq!(huge.tier_index, 1);
        assert_eq!(hot.tier_index, 0);
    }

    #[test]
    fn test_plan_watermark_zero_drains_tier() {
        let files = vec![file("a", 0, 10, 300), file("b", 0, 20, 200)];
        let plan = plan(&[0, 1000], files.clone());
        let after = apply(&files, &plan);
        assert!(after.iter().all(|f| f.tier_index == 1));
    }

    #[test]
    fn test_plan_watermark_full_disables_eviction() {
        // Budget covers everything: nothing leaves tier 0.
        let files = vec![file("a", 0, 10, 300), file("b", 0, 20, 200)];
        let plan = plan(&[1000, 1000], files);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_downward_moves_precede_upward() {
        let files = vec![
            file("stale1", 0, 40, 100),
            file("stale2", 0, 40, 101),
            file("hot1", 1, 40, 500),
            file("hot2", 1, 40, 501),
        ];
        let plan = plan(&[80, 1000], files);
        let first_upward = plan
            .moves
            .iter()
            .position(|m| !m.is_downward())
            .unwrap_or(plan.len());
        assert!(plan.moves[..first_upward].iter().all(|m| m.is_downward()));
        assert!(plan.moves[first_upward..].iter().all(|m| !m.is_downward()));
    }

    #[test]
    fn test_plan_three_tiers_cascades() {
        let files = vec![
            file("hot", 0, 50, 300),
            file("warm", 0, 50, 200),
            file("cold", 0, 50, 100),
        ];
        let plan = plan(&[50, 50, 50], files.clone());
        let after = apply(&files, &plan);
        let tier_of = |name: &str| {
            after
                .iter()
                .find(|f| f.rel_path == PathBuf::from(name))
                .unwrap()
                .tier_index
        };
        assert_eq!(tier_of("hot"), 0);
        assert_eq!(tier_of("warm"), 1);
        assert_eq!(tier_of("cold"), 2);
    }

    #[test]
    fn test_plan_empty_inputs() {
        assert!(plan(&[], vec![]).is_empty());
        assert!(plan(&[100], vec![]).is_empty());
    }
}
