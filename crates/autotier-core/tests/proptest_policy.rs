//! Property-based tests for the placement policy.
//!
//! Verifies the watermark invariants over arbitrary tier shapes and file
//! populations, not just the hand-picked unit-test cases.

use autotier_core::policy::{plan, FileRecord, MigrationPlan};
use proptest::prelude::*;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

fn any_files(max_tier: usize) -> impl Strategy<Value = Vec<FileRecord>> {
    proptest::collection::vec(
        (0..=max_tier, 1u64..200, 0u64..1000),
        0..30,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (tier, size, atime))| FileRecord {
                rel_path: PathBuf::from(format!("f{i:03}")),
                tier_index: tier,
                size,
                atime: UNIX_EPOCH + Duration::from_secs(atime),
            })
            .collect()
    })
}

fn any_budgets() -> impl Strategy<Value = Vec<u64>> {
    proptest::collection::vec(0u64..1000, 2..5)
}

fn apply(files: &[FileRecord], plan: &MigrationPlan) -> Vec<FileRecord> {
    let mut after = files.to_vec();
    for mv in &plan.moves {
        let f = after
            .iter_mut()
            .find(|f| f.rel_path == mv.rel_path)
            .expect("planned move names a scanned file");
        assert_eq!(f.tier_index, mv.src, "plan src matches current placement");
        f.tier_index = mv.dst;
    }
    after
}

fn usage_per_tier(files: &[FileRecord], tiers: usize) -> Vec<u64> {
    let mut usage = vec![0u64; tiers];
    for f in files {
        usage[f.tier_index] += f.size;
    }
    usage
}

proptest! {
    /// Every tier except the last ends the tick within its budget; only
    /// the slowest tier may overflow.
    #[test]
    fn prop_watermarks_hold_except_last(
        budgets in any_budgets(),
        files in any_files(3),
    ) {
        let files: Vec<FileRecord> = files
            .into_iter()
            .map(|mut f| { f.tier_index %= budgets.len(); f })
            .collect();
        let plan = plan(&budgets, files.clone());
        let after = apply(&files, &plan);
        let usage = usage_per_tier(&after, budgets.len());
        for tier in 0..budgets.len() - 1 {
            prop_assert!(
                usage[tier] <= budgets[tier],
                "tier {} over budget: {} > {}",
                tier, usage[tier], budgets[tier]
            );
        }
    }

    /// Replanning immediately after applying a plan yields no moves.
    #[test]
    fn prop_plan_is_idempotent(
        budgets in any_budgets(),
        files in any_files(3),
    ) {
        let files: Vec<FileRecord> = files
            .into_iter()
            .map(|mut f| { f.tier_index %= budgets.len(); f })
            .collect();
        let first = plan(&budgets, files.clone());
        let after = apply(&files, &first);
        let second = plan(&budgets, after);
        prop_assert!(second.is_empty(), "second tick produced {:?}", second);
    }

    /// No planned move is a no-op, and space-freeing (downward) moves
    /// always precede space-consuming (upward) ones.
    #[test]
    fn prop_plan_ordering(
        budgets in any_budgets(),
        files in any_files(3),
    ) {
        let files: Vec<FileRecord> = files
            .into_iter()
            .map(|mut f| { f.tier_index %= budgets.len(); f })
            .collect();
        let plan = plan(&budgets, files);
        let mut seen_upward = false;
        for mv in &plan.moves {
            prop_assert_ne!(mv.src, mv.dst);
            if mv.is_downward() {
                prop_assert!(!seen_upward, "downward move after an upward move");
            } else {
                seen_upward = true;
            }
        }
    }

    /// Each file is placed as high as its popularity rank permits: no
    /// file could swap into a strictly faster tier that still has room
    /// after all hotter files are placed.
    #[test]
    fn prop_placed_as_high_as_rank_permits(
        budgets in any_budgets(),
        files in any_files(3),
    ) {
        let mut files: Vec<FileRecord> = files
            .into_iter()
            .map(|mut f| { f.tier_index %= budgets.len(); f })
            .collect();
        let the_plan = plan(&budgets, files.clone());
        let after = apply(&files, &the_plan);

        autotier_core::policy::rank(&mut files);
        let mut remaining = budgets.clone();
        for ranked in &files {
            let placed = after
                .iter()
                .find(|f| f.rel_path == ranked.rel_path)
                .unwrap()
                .tier_index;
            for faster in 0..placed {
                prop_assert!(
                    remaining[faster] < ranked.size,
                    "{} was placed on tier {} while tier {} still had {} free",
                    ranked.rel_path.display(), placed, faster, remaining[faster]
                );
            }
            remaining[placed] = remaining[placed].saturating_sub(ranked.size);
        }
    }
}
