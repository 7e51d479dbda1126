//! The periodic tiering loop.
//!
//! One background thread wakes every `tier_period`, scans all tiers,
//! asks the policy for a plan and applies it through the migration
//! primitive. Shutdown and ad-hoc oneshot requests arrive through a
//! condvar; the stop flag is honored between migrations, never during
//! one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::migrate::{self, MigrateError, MigrationGate};
use crate::policy::{self, FileRecord};
use crate::resolver::TierSet;

/// Counters accumulated across ticks.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub ticks: AtomicU64,
    pub files_moved: AtomicU64,
    pub bytes_moved: AtomicU64,
    pub failed_migrations: AtomicU64,
    pub duplicates_cleaned: AtomicU64,
}

#[derive(Debug, Default)]
struct Shared {
    stop: bool,
    oneshot: bool,
}

/// Orchestrates the periodic policy loop.
pub struct TierEngine {
    tiers: Arc<TierSet>,
    gate: Arc<MigrationGate>,
    period: Duration,
    copy_buffer_size: usize,
    shared: Mutex<Shared>,
    wakeup: Condvar,
    tiering: AtomicBool,
    stats: EngineStats,
}

impl TierEngine {
    pub fn new(
        tiers: Arc<TierSet>,
        gate: Arc<MigrationGate>,
        period: Duration,
        copy_buffer_size: usize,
    ) -> Arc<Self> {
        Arc::new(TierEngine {
            tiers,
            gate,
            period,
            copy_buffer_size,
            shared: Mutex::new(Shared::default()),
            wakeup: Condvar::new(),
            tiering: AtomicBool::new(false),
            stats: EngineStats::default(),
        })
    }

    pub fn tiers(&self) -> &Arc<TierSet> {
        &self.tiers
    }

    pub fn gate(&self) -> &Arc<MigrationGate> {
        &self.gate
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Whether a tick is currently executing.
    pub fn currently_tiering(&self) -> bool {
        self.tiering.load(Ordering::SeqCst)
    }

    /// Start the background loop. The first tick runs immediately.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("autotier-engine".to_string())
            .spawn(move || engine.run())
            .expect("failed to spawn tiering thread")
    }

    /// Ask the loop to exit after the in-flight migration (if any).
    pub fn request_stop(&self) {
        let mut shared = self.shared.lock().expect("engine state poisoned");
        shared.stop = true;
        self.wakeup.notify_all();
    }

    /// Ask for an immediate tick. Returns false when a tick is already
    /// running (the ad-hoc caller gets an error instead of a queue).
    pub fn request_oneshot(&self) -> bool {
        if self.currently_tiering() {
            return false;
        }
        let mut shared = self.shared.lock().expect("engine state poisoned");
        shared.oneshot = true;
        self.wakeup.notify_all();
        true
    }

    fn run(&self) {
        info!(period_s = self.period.as_secs(), "tiering engine started");
        loop {
            if self.shared.lock().expect("engine state poisoned").stop {
                break;
            }
            self.tick();

            let deadline = Instant::now() + self.period;
            let mut shared = self.shared.lock().expect("engine state poisoned");
            loop {
                if shared.stop || shared.oneshot {
                    shared.oneshot = false;
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _timeout) = self
                    .wakeup
                    .wait_timeout(shared, deadline - now)
                    .expect("engine state poisoned");
                shared = guard;
            }
            if shared.stop {
                break;
            }
        }
        info!("tiering engine stopped");
    }

    /// One pass of the policy loop: refresh, scan, clean duplicates,
    /// plan, execute, log fill levels.
    pub fn tick(&self) {
        self.tiering.store(true, Ordering::SeqCst);
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let active = self.refresh_tiers();
        let files = self.scan(&active);
        let files = self.clean_duplicates(files);
        let plan = self.build_plan(&active, files);
        self.execute(plan);
        self.log_fill_levels();

        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "tick complete");
        self.tiering.store(false, Ordering::SeqCst);
    }

    /// Refresh capacity on every tier; a tier that cannot be sampled is
    /// skipped for this tick (its files neither move nor receive).
    fn refresh_tiers(&self) -> Vec<bool> {
        self.tiers
            .tiers()
            .iter()
            .map(|tier| match tier.refresh() {
                Ok(()) => true,
                Err(e) => {
                    error!(tier = tier.id(), error = %e, "cannot sample tier; skipping this tick");
                    false
                }
            })
            .collect()
    }

    /// Enumerate every active tier, recording precise usage as we go.
    fn scan(&self, active: &[bool]) -> Vec<FileRecord> {
        let mut files = Vec::new();
        for (tier_index, tier) in self.tiers.tiers().iter().enumerate() {
            if !active[tier_index] {
                continue;
            }
            match tier.enumerate() {
                Ok(entries) => {
                    let mut used = 0u64;
                    for entry in entries {
                        used += entry.size;
                        files.push(FileRecord {
                            rel_path: entry.rel_path,
                            tier_index,
                            size: entry.size,
                            atime: entry.atime,
                        });
                    }
                    tier.set_used_bytes(used);
                }
                Err(e) => {
                    error!(tier = tier.id(), error = %e, "scan failed; tier skipped this tick");
                }
            }
        }
        files
    }

    /// Detect uniqueness-invariant violations (one logical path on two
    /// tiers, e.g. after an interrupted migration) and remove the
    /// lower-priority copy when the higher one is intact. Lower copies
    /// never enter the plan, removed or not: only the authoritative copy
    /// may be migrated.
    fn clean_duplicates(&self, files: Vec<FileRecord>) -> Vec<FileRecord> {
        let mut best: HashMap<PathBuf, usize> = HashMap::new();
        let mut duplicated = false;
        for file in &files {
            best.entry(file.rel_path.clone())
                .and_modify(|tier| {
                    duplicated = true;
                    *tier = (*tier).min(file.tier_index);
                })
                .or_insert(file.tier_index);
        }
        if !duplicated {
            return files;
        }

        let mut kept = Vec::with_capacity(files.len());
        for file in files {
            let keeper_tier = best[&file.rel_path];
            if file.tier_index == keeper_tier {
                kept.push(file);
                continue;
            }
            let keeper = self.tiers.tier(keeper_tier).backing_path(&file.rel_path);
            let intact = std::fs::symlink_metadata(&keeper)
                .map(|m| (m.is_file() && m.len() == file.size) || m.file_type().is_symlink())
                .unwrap_or(false);
            warn!(
                path = %file.rel_path.display(),
                keeper = self.tiers.tier(keeper_tier).id(),
                duplicate = self.tiers.tier(file.tier_index).id(),
                "uniqueness violation detected"
            );
            if intact {
                let dup = self.tiers.tier(file.tier_index).backing_path(&file.rel_path);
                match std::fs::remove_file(&dup) {
                    Ok(()) => {
                        self.stats.duplicates_cleaned.fetch_add(1, Ordering::Relaxed);
                        info!(path = %file.rel_path.display(), "removed stale duplicate");
                    }
                    Err(e) => {
                        warn!(path = %file.rel_path.display(), error = %e, "duplicate cleanup failed");
                    }
                }
            } else {
                warn!(
                    path = %file.rel_path.display(),
                    "higher-priority copy not intact; leaving duplicate for next tick"
                );
            }
        }
        kept
    }

    /// Run the policy over the active tiers only, translating between
    /// global tier indices and the compact index space the planner sees.
    fn build_plan(&self, active: &[bool], files: Vec<FileRecord>) -> policy::MigrationPlan {
        let active_indices: Vec<usize> = (0..self.tiers.len()).filter(|&i| active[i]).collect();
        if active_indices.len() < 2 {
            if active_indices.len() < self.tiers.len() {
                warn!("fewer than two usable tiers; skipping planning this tick");
            }
            return policy::MigrationPlan::default();
        }
        let to_compact: HashMap<usize, usize> = active_indices
            .iter()
            .enumerate()
            .map(|(compact, &global)| (global, compact))
            .collect();

        let budgets: Vec<u64> = active_indices
            .iter()
            .map(|&i| self.tiers.tier(i).watermark_bytes())
            .collect();
        let compact_files: Vec<FileRecord> = files
            .into_iter()
            .filter_map(|mut f| {
                let compact = *to_compact.get(&f.tier_index)?;
                f.tier_index = compact;
                Some(f)
            })
            .collect();

        let mut plan = policy::plan(&budgets, compact_files);
        for mv in &mut plan.moves {
            mv.src = active_indices[mv.src];
            mv.dst = active_indices[mv.dst];
        }
        plan
    }

    /// Apply the plan sequentially, honoring the stop flag between
    /// entries and serializing each path through the migration gate.
    fn execute(&self, plan: policy::MigrationPlan) {
        if plan.is_empty() {
            debug!("no migrations needed");
            return;
        }
        info!(moves = plan.len(), "executing migration plan");
        for mv in plan.moves {
            if self.shared.lock().expect("engine state poisoned").stop {
                info!("stop requested; abandoning remaining plan entries");
                return;
            }
            let _guard = self.gate.acquire(&mv.rel_path);
            let src = self.tiers.tier(mv.src);
            let dst = self.tiers.tier(mv.dst);
            match migrate::migrate(&mv.rel_path, src, dst, self.copy_buffer_size) {
                Ok(bytes) => {
                    self.stats.files_moved.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_moved.fetch_add(bytes, Ordering::Relaxed);
                }
                Err(MigrateError::SourceVanished { path }) => {
                    debug!(path, "source vanished before migration; skipping");
                }
                Err(e @ MigrateError::SourceUnlinkFailed { .. }) => {
                    self.stats.failed_migrations.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "duplicate left behind; cleanup scheduled for next tick");
                }
                Err(e) => {
                    self.stats.failed_migrations.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "migration failed; file stays on its tier until next tick");
                }
            }
        }
    }

    fn log_fill_levels(&self) {
        for tier in self.tiers.tiers() {
            if tier.refresh().is_err() {
                continue;
            }
            info!(
                tier = tier.id(),
                used = tier.used_bytes(),
                capacity = tier.capacity_bytes(),
                fill_pct = format!("{:.1}", tier.usage_ratio() * 100.0).as_str(),
                watermark_pct = tier.watermark(),
                "tier fill level"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotier_config::TierSpec;
    use std::path::Path;

    fn engine_over(dirs: &[&Path], watermarks: &[u8]) -> Arc<TierEngine> {
        let specs: Vec<TierSpec> = dirs
            .iter()
            .zip(watermarks)
            .enumerate()
            .map(|(i, (d, &w))| TierSpec {
                id: format!("tier{i}"),
                path: d.to_path_buf(),
                watermark: w,
            })
            .collect();
        TierEngine::new(
            Arc::new(TierSet::new(&specs)),
            Arc::new(MigrationGate::new()),
            Duration::from_secs(3600),
            64 * 1024,
        )
    }

    #[test]
    fn test_tick_on_empty_tiers_is_noop() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let engine = engine_over(&[a.path(), b.path()], &[50, 100]);
        engine.tick();
        assert_eq!(engine.stats().ticks.load(Ordering::Relaxed), 1);
        assert_eq!(engine.stats().files_moved.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_oneshot_rejected_while_tiering() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let engine = engine_over(&[a.path(), b.path()], &[50, 100]);
        engine.tiering.store(true, Ordering::SeqCst);
        assert!(!engine.request_oneshot());
        engine.tiering.store(false, Ordering::SeqCst);
        assert!(engine.request_oneshot());
    }

    #[test]
    fn test_spawned_engine_stops_cleanly() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let engine = engine_over(&[a.path(), b.path()], &[50, 100]);
        let handle = engine.spawn();
        // Give the first tick a moment, then shut down.
        std::thread::sleep(Duration::from_millis(50));
        engine.request_stop();
        handle.join().unwrap();
        assert!(engine.stats().ticks.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_duplicate_cleanup_removes_lower_copy() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("dup"), b"same").unwrap();
        std::fs::write(b.path().join("dup"), b"same").unwrap();
        let engine = engine_over(&[a.path(), b.path()], &[100, 100]);
        engine.tick();
        assert!(a.path().join("dup").exists());
        assert!(!b.path().join("dup").exists());
        assert_eq!(engine.stats().duplicates_cleaned.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_duplicate_kept_when_sizes_differ() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("dup"), b"short").unwrap();
        std::fs::write(b.path().join("dup"), b"much longer contents").unwrap();
        let engine = engine_over(&[a.path(), b.path()], &[100, 100]);
        engine.tick();
        assert!(a.path().join("dup").exists());
        assert!(b.path().join("dup").exists());
    }
}
