//! Snapshot rotation and creation (spec.md §4.5).
//!
//! Grounded 1:1 on `rsync_backup.py`'s `StageManager`: `Stage`/`TimeStamp`
//! are plain data, `StageManager` drives `create`/`rotate` by composing
//! [`crate::sync::sync`] (hard-link seeding and the real content sync)
//! and [`crate::rmtree::rmtree`] (eager removal during recovery, deferred
//! removal via the `.delete` recycling trick otherwise).

use crate::config::BackupConfig;
use crate::error::{BackupError, FsError};
use crate::fs::primitives;
use crate::logger::Logger;
use crate::rmtree::{self, RmtreeOptions};
use crate::sync::{self, SyncOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One retention tier: a name, the interval between its own snapshots
/// (already expanded to an absolute value by [`BackupConfig`], not just
/// this stage's own `keep`), and how many to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub interval_seconds: u64,
    pub keep: u32,
}

/// Reads and writes the `.{snapshot}.stamp` files that record when each
/// snapshot was created, aligned down to a multiple of the base
/// interval. `now` is captured once at construction (matching the
/// original, which reads the clock once per `StageManager` instance) so
/// every `elapsed`/`create` call during a single run agrees on "now".
pub struct TimeStamp {
    stages_path: PathBuf,
    base_interval: u64,
    now: i64,
}

impl TimeStamp {
    #[must_use]
    pub fn new(stages_path: PathBuf, base_interval: u64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        Self {
            stages_path,
            base_interval,
            now,
        }
    }

    fn path(&self, snapshot: &str) -> PathBuf {
        self.stages_path.join(format!(".{snapshot}.stamp"))
    }

    /// Reads the stamp for `snapshot`. Errors if the stamp file is
    /// missing or not a valid decimal integer.
    pub fn read(&self, snapshot: &str) -> std::io::Result<i64> {
        let content = std::fs::read_to_string(self.path(snapshot))?;
        content
            .trim()
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{e}")))
    }

    /// Seconds between `now` and `snapshot`'s creation stamp.
    pub fn elapsed(&self, snapshot: &str) -> std::io::Result<i64> {
        Ok(self.now - self.read(snapshot)?)
    }

    /// Writes a fresh, base-interval-aligned stamp for `snapshot`.
    pub fn create(&self, snapshot: &str) -> std::io::Result<()> {
        let base = self.base_interval.max(1) as i64;
        let aligned = (self.now / base) * base;
        std::fs::write(self.path(snapshot), aligned.to_string())
    }

    /// Copies `src_snapshot`'s stamp onto `tgt_snapshot`, if it exists.
    pub fn copy(&self, src_snapshot: &str, tgt_snapshot: &str) -> std::io::Result<()> {
        let src_path = self.path(src_snapshot);
        if primitives::is_file(&src_path) {
            primitives::copy_file(&src_path, &self.path(tgt_snapshot), false)?;
        }
        Ok(())
    }

    pub fn remove(&self, snapshot: &str) -> std::io::Result<()> {
        primitives::remove_file(&self.path(snapshot))
    }
}

const DELETE_NAME: &str = ".delete";

/// Tuning shared by every [`sync::sync`]/[`rmtree::rmtree`] call a
/// [`StageManager`] makes.
pub struct EngineOptions {
    pub jobs: usize,
    pub max_retries: usize,
    pub queue_limit: usize,
    pub save_memory: bool,
}

pub struct StageManager {
    engine: EngineOptions,
    source_path: PathBuf,
    stages_path: PathBuf,
    include_paths: Vec<PathBuf>,
    exclude_paths: Vec<PathBuf>,
    stages: Vec<Stage>,
    timestamp: TimeStamp,
    logger: Arc<Logger>,
    indent: u32,
    /// Set at construction if the initial snapshot's stamp could not be
    /// read — evidence of a prior run that was interrupted before its
    /// commit point (spec.md §4.5/§7 item 4).
    recover: bool,
}

impl StageManager {
    #[must_use]
    pub fn new(
        source_path: PathBuf,
        stages_path: PathBuf,
        include_paths: Vec<PathBuf>,
        exclude_paths: Vec<PathBuf>,
        config: &BackupConfig,
        engine: EngineOptions,
        logger: Arc<Logger>,
        indent: u32,
    ) -> Self {
        let stages = config
            .stages
            .iter()
            .map(|s| Stage {
                name: s.name.clone(),
                interval_seconds: s.interval_seconds,
                keep: s.keep,
            })
            .collect::<Vec<_>>();
        let timestamp = TimeStamp::new(stages_path.clone(), config.interval);
        let mut mgr = Self {
            engine,
            source_path,
            stages_path,
            include_paths,
            exclude_paths,
            stages,
            timestamp,
            logger,
            indent,
            recover: false,
        };
        let init = mgr.snapshot_names().remove(0);
        mgr.recover = mgr.timestamp.read(&init).is_err();
        mgr
    }

    fn log(&self, msg: &str, indent: u32) {
        self.logger.log(msg, self.indent + indent);
    }

    fn snapshot_name(stage_name: &str, num: u32) -> String {
        format!("{stage_name}.{num}")
    }

    fn path(&self, snapshot: &str) -> PathBuf {
        self.stages_path.join(snapshot)
    }

    fn has(&self, snapshot: &str) -> bool {
        primitives::is_dir(&self.path(snapshot))
    }

    fn sync_opts(&self, create_hard_links: bool, indent: u32) -> SyncOptions {
        SyncOptions {
            jobs: self.engine.jobs,
            max_retries: self.engine.max_retries,
            queue_limit: self.engine.queue_limit,
            create_hard_links,
            save_memory: self.engine.save_memory,
            indent: self.indent + indent,
        }
    }

    fn rmtree_opts(&self, indent: u32) -> RmtreeOptions {
        RmtreeOptions {
            jobs: self.engine.jobs,
            max_retries: self.engine.max_retries,
            queue_limit: self.engine.queue_limit,
            save_memory: self.engine.save_memory,
            indent: self.indent + indent,
        }
    }

    /// Removes `snapshot`, either eagerly (used during recovery) or by
    /// renaming it to `.delete` for cheap reuse by a later `create`, with
    /// the actual disk removal deferred to the next call that needs the
    /// `.delete` slot.
    fn rm(&self, snapshot: &str, indent: u32, delete_eager: bool) -> Result<(), BackupError> {
        if self.has(snapshot) {
            if delete_eager {
                rmtree::rmtree(&self.path(snapshot), &self.rmtree_opts(indent))?;
            } else {
                if self.has(DELETE_NAME) {
                    rmtree::rmtree(&self.path(DELETE_NAME), &self.rmtree_opts(indent))?;
                }
                let (src, dst) = (self.path(snapshot), self.path(DELETE_NAME));
                std::fs::rename(&src, &dst).map_err(|e| FsError::new(src, e))?;
            }
            let _ = self.timestamp.remove(snapshot);
        }
        Ok(())
    }

    fn mv(&self, src_snapshot: &str, tgt_snapshot: &str) -> Result<(), BackupError> {
        let _ = self.timestamp.copy(src_snapshot, tgt_snapshot);
        let (src, dst) = (self.path(src_snapshot), self.path(tgt_snapshot));
        std::fs::rename(&src, &dst).map_err(|e| FsError::new(src, e))?;
        let _ = self.timestamp.remove(src_snapshot);
        Ok(())
    }

    fn cp(&self, src_snapshot: &str, tgt_snapshot: &str, indent: u32) -> Result<(), BackupError> {
        sync::sync(
            &self.path(src_snapshot),
            &self.path(tgt_snapshot),
            &self.include_paths,
            &self.exclude_paths,
            &self.sync_opts(true, indent),
        )
    }

    /// Where a snapshot currently at `(stage_id, num)` should live after
    /// rotation: the first later stage whose interval bucket it now
    /// falls into, or `None` if it has aged past every stage (spec.md
    /// §4.5).
    fn next_after(&self, stage_id: usize, num: u32) -> Option<String> {
        let name = Self::snapshot_name(&self.stages[stage_id].name, num);
        let elapsed = self.timestamp.elapsed(&name).ok()?;
        for stage in &self.stages[stage_id..] {
            let q = elapsed / stage.interval_seconds.max(1) as i64;
            if q >= 0 && (q as u64) < u64::from(stage.keep) {
                return Some(Self::snapshot_name(&stage.name, q as u32));
            }
        }
        None
    }

    /// Every possible snapshot name, in declared stage order, ascending
    /// index within a stage. The first entry is the initial snapshot.
    #[must_use]
    pub fn snapshot_names(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|s| (0..s.keep).map(|i| Self::snapshot_name(&s.name, i)))
            .collect()
    }

    /// Creates a new snapshot for the initial stage, seeding it with
    /// hard links from the most recent existing snapshot so that only
    /// changed content costs storage (spec.md §4.5 "`create()`").
    pub fn create(&mut self) -> Result<(), BackupError> {
        let init_name = self.stages[0].name.clone();
        let init_snapshot = Self::snapshot_name(&init_name, 0);

        if self.recover {
            if self.has(&init_snapshot) {
                self.log("* Removing partial snapshot from interrupted run.", 0);
                self.rm(&init_snapshot, 1, true)?;
            }
            if self.has(DELETE_NAME) {
                self.log("* Cleanup pending removal from interrupted run.", 0);
                self.rm(DELETE_NAME, 1, true)?;
            }
        }

        if self.has(&init_snapshot) {
            self.log(
                &format!("Stage '{init_name}' still up-to-date, nothing to do."),
                0,
            );
            return Ok(());
        }

        if self.has(DELETE_NAME) {
            self.log("* Reusing previously deleted snapshot.", 0);
            self.mv(DELETE_NAME, &init_snapshot)?;
            for p in &self.exclude_paths {
                let _ = primitives::remove_node(&self.path(&init_snapshot).join(p));
            }
            for name in self.snapshot_names() {
                if name == init_snapshot {
                    continue;
                }
                if self.has(&name) {
                    self.cp(&name, &init_snapshot, 1)?;
                    break;
                }
            }
        } else {
            for name in self.snapshot_names() {
                if self.has(&name) {
                    self.log(
                        &format!("* Creating hard copy from previous backup '{name}'."),
                        0,
                    );
                    self.cp(&name, &init_snapshot, 1)?;
                    break;
                }
            }
        }

        self.log("* Running sync to create the actual backup.", 0);
        sync::sync(
            &self.source_path,
            &self.path(&init_snapshot),
            &self.include_paths,
            &self.exclude_paths,
            &self.sync_opts(false, 1),
        )?;
        // Commit point: only after this succeeds is the snapshot
        // considered valid. A crash before here leaves `recover` set on
        // the next run's construction.
        self.timestamp
            .create(&init_snapshot)
            .map_err(|e| FsError::new(self.timestamp.path(&init_snapshot), e))?;
        self.recover = false;
        Ok(())
    }

    /// Ages every existing snapshot into its next stage/slot, from the
    /// last stage to the first and, within a stage, from the highest
    /// index down, so later moves never collide with not-yet-processed
    /// earlier ones (spec.md §4.5 "`rotate()`").
    pub fn rotate(&self) -> Result<(), BackupError> {
        for stage_id in (0..self.stages.len()).rev() {
            let stage = self.stages[stage_id].clone();
            self.log(&format!("* Rotating stage '{}'.", stage.name), 0);
            for i in (0..stage.keep).rev() {
                let src_name = Self::snapshot_name(&stage.name, i);
                if !self.has(&src_name) {
                    continue;
                }
                match self.next_after(stage_id, i) {
                    None => {
                        self.log(&format!("- Removing {}.{}", stage.name, i), 1);
                        self.rm(&src_name, 2, false)?;
                    }
                    Some(tgt_name) if tgt_name != src_name => {
                        if self.has(&tgt_name) {
                            self.log(&format!("- Removing {src_name}"), 1);
                            self.rm(&src_name, 2, false)?;
                        } else {
                            self.log(&format!("- Moving {src_name} -> {tgt_name}"), 1);
                            self.mv(&src_name, &tgt_name)?;
                        }
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use std::fs;
    use std::os::unix::fs::MetadataExt;

    fn config(interval: u64, stages: &[(&str, u32)]) -> BackupConfig {
        let json = format!(
            r#"{{"interval": {interval}, "stages": [{}]}}"#,
            stages
                .iter()
                .map(|(name, keep)| format!(r#"{{"name": "{name}", "keep": {keep}}}"#))
                .collect::<Vec<_>>()
                .join(",")
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        file.write_all(json.as_bytes()).unwrap();
        BackupConfig::load(file.path()).unwrap()
    }

    fn engine() -> EngineOptions {
        EngineOptions {
            jobs: 2,
            max_retries: 2,
            queue_limit: 8,
            save_memory: false,
        }
    }

    fn manager(
        source: &Path,
        stages_path: &Path,
        cfg: &BackupConfig,
        now: i64,
    ) -> StageManager {
        let logger = Arc::new(Logger::new(stages_path));
        let mut mgr = StageManager::new(
            source.to_path_buf(),
            stages_path.to_path_buf(),
            Vec::new(),
            Vec::new(),
            cfg,
            engine(),
            logger,
            0,
        );
        // Override the real-time clock captured by `TimeStamp::new` with
        // a fixed value so rotation math is deterministic in tests.
        mgr.timestamp = TimeStamp {
            stages_path: stages_path.to_path_buf(),
            base_interval: cfg.interval,
            now,
        };
        mgr.recover = mgr.timestamp.read(&mgr.snapshot_names()[0]).is_err();
        mgr
    }

    #[test]
    fn snapshot_names_total_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(3600, &[("hourly", 24), ("daily", 7), ("weekly", 4)]);
        let mgr = manager(dir.path(), dir.path(), &cfg, 0);
        let names = mgr.snapshot_names();
        assert_eq!(names.len(), 24 + 7 + 4);
        let unique: std::collections::BTreeSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert_eq!(names[0], "hourly.0");
    }

    #[test]
    fn next_after_ages_into_next_stage_and_falls_off_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(3600, &[("hourly", 2), ("daily", 2)]);
        let mgr = manager(dir.path(), dir.path(), &cfg, 10 * 3600);
        mgr.timestamp.create("hourly.0").unwrap(); // stamp at aligned now (10*3600)
        // elapsed = 0 -> still within hourly.0's own bucket
        assert_eq!(mgr.next_after(0, 0), Some("hourly.0".to_string()));

        // An hourly.0 stamped at t=0 has, at now=10*3600, elapsed 10 hours:
        // falls off hourly (keep=2) into daily bucket floor(10*3600 / (3600*2)) = 2,
        // which is >= keep=2 for daily too, so it ages off entirely.
        fs::write(dir.path().join(".hourly.0.stamp"), "0").unwrap();
        assert_eq!(mgr.next_after(0, 0), None);
    }

    #[test]
    fn rotate_moves_snapshots_up_and_preserves_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("backup");
        fs::create_dir_all(&backup).unwrap();
        let cfg = config(3600, &[("hourly", 3)]);

        fs::create_dir_all(backup.join("hourly.0")).unwrap();
        fs::write(backup.join(".hourly.0.stamp"), "3600").unwrap();
        fs::create_dir_all(backup.join("hourly.1")).unwrap();
        fs::write(backup.join(".hourly.1.stamp"), "0").unwrap();

        // now = 7200: hourly.0 (stamp 3600) has elapsed 3600 -> bucket 1.
        // hourly.1 (stamp 0) has elapsed 7200 -> bucket 2.
        let mgr = manager(dir.path(), &backup, &cfg, 7200);
        mgr.rotate().unwrap();

        assert!(!backup.join("hourly.0").exists());
        assert!(backup.join("hourly.1").exists());
        assert!(backup.join("hourly.2").exists());
        assert_eq!(
            fs::read_to_string(backup.join(".hourly.1.stamp")).unwrap(),
            "3600"
        );
        assert_eq!(
            fs::read_to_string(backup.join(".hourly.2.stamp")).unwrap(),
            "0"
        );
    }

    #[test]
    fn create_seeds_unchanged_files_via_hard_link() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let cfg = config(3600, &[("hourly", 2)]);

        // First run: creates hourly.0 straight from source.
        let mut mgr = manager(src.path(), backup.path(), &cfg, 0);
        mgr.create().unwrap();
        assert!(backup.path().join("hourly.0/a.txt").exists());

        // Simulate the elapsed interval passing and rotate so hourly.0
        // becomes hourly.1, then create a fresh hourly.0. Since a.txt is
        // unchanged, the new hourly.0/a.txt must share an inode with the
        // seed (now hourly.1).
        let mut mgr2 = manager(src.path(), backup.path(), &cfg, 3600);
        mgr2.rotate().unwrap();
        assert!(backup.path().join("hourly.1/a.txt").exists());
        mgr2.create().unwrap();

        let seed_stat = fs::metadata(backup.path().join("hourly.1/a.txt")).unwrap();
        let new_stat = fs::metadata(backup.path().join("hourly.0/a.txt")).unwrap();
        assert_eq!(seed_stat.ino(), new_stat.ino());
    }

    #[test]
    fn interrupted_run_is_detected_and_recovered() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        // Partial snapshot with no stamp, plus a leftover `.delete`.
        fs::create_dir_all(backup.path().join("hourly.0")).unwrap();
        fs::create_dir_all(backup.path().join(".delete")).unwrap();
        let cfg = config(3600, &[("hourly", 2)]);

        let mut mgr = manager(src.path(), backup.path(), &cfg, 0);
        assert!(mgr.recover);
        mgr.create().unwrap();

        assert!(!backup.path().join(".delete").exists());
        assert!(backup.path().join("hourly.0/a.txt").exists());
        assert!(!mgr.recover);
    }
}
