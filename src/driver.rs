//! Top-level orchestration: path normalization, the `.inprogress`
//! marker, and wiring the [`crate::stage::StageManager`] through a
//! single rotate-then-create run.
//!
//! Grounded in `rsync_backup.py`'s `rsync_backup()` function: resolve
//! and validate paths, normalize `include`/`exclude` paths relative to
//! the source, auto-exclude the backup path if it lives under the
//! source, then guard the whole run behind the exclusive marker.

use crate::config::BackupConfig;
use crate::error::BackupError;
use crate::fs::primitives;
use crate::logger::Logger;
use crate::marker::ProgressMarker;
use crate::stage::{EngineOptions, StageManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything [`run_backup`] needs beyond the raw paths.
pub struct BackupOptions {
    pub config_path: Option<PathBuf>,
    pub jobs: usize,
    pub max_retries: usize,
    pub queue_limit: usize,
    pub save_memory: bool,
}

/// Resolves `p` relative to `source_path` and returns it relative to
/// `source_path`, or `None` (with a logged warning) if it points
/// outside of it.
fn normalize_and_relpath(source_path: &Path, paths: &[PathBuf], logger: &Logger) -> Vec<PathBuf> {
    let mut out = Vec::with_capacity(paths.len());
    for p in paths {
        let joined = source_path.join(p);
        let norm = std::path::absolute(&joined).unwrap_or(joined);
        match norm.strip_prefix(source_path) {
            Ok(rel) => out.push(rel.to_path_buf()),
            Err(_) => logger.log(&format!("Warning: Path '{}' is outside of source_path.", p.display()), 0),
        }
    }
    out
}

/// Drops any path that is a prefix of, or equal to, another path in the
/// list, collapsing both onto their common ancestor. Mirrors the
/// recursive `remove_shadowed_paths` helper.
fn remove_shadowed_paths(paths: Vec<PathBuf>, logger: &Logger) -> Vec<PathBuf> {
    if paths.len() <= 1 {
        return paths;
    }
    let mut rest = paths;
    let first = rest.remove(0);
    for i in 0..rest.len() {
        let first_is_ancestor = rest[i].starts_with(&first);
        let other_is_ancestor = first.starts_with(&rest[i]);
        if first_is_ancestor || other_is_ancestor {
            let common = if first_is_ancestor { first.clone() } else { rest[i].clone() };
            let removed = if first_is_ancestor { rest[i].clone() } else { first.clone() };
            logger.log(
                &format!("Warning: Path '{}' is shadowed by '{}'.", removed.display(), common.display()),
                0,
            );
            rest[i] = common;
            return remove_shadowed_paths(rest, logger);
        }
    }
    let mut result = vec![first];
    result.extend(remove_shadowed_paths(rest, logger));
    result
}

/// Runs one backup: validates `source_path`/config, normalizes
/// `include_paths`/`exclude_paths`, auto-excludes `backup_path` if it
/// lives under `source_path`, and — guarded by the `.inprogress`
/// marker — rotates existing snapshots and creates a fresh one.
pub fn run_backup(
    source_path: &Path,
    backup_path: &Path,
    include_paths: &[PathBuf],
    exclude_paths: &[PathBuf],
    opts: &BackupOptions,
) -> Result<(), BackupError> {
    let source_path = std::path::absolute(source_path).map_err(|_| BackupError::InvalidSource(source_path.to_path_buf()))?;
    let backup_path = std::path::absolute(backup_path).unwrap_or_else(|_| backup_path.to_path_buf());
    let config_path = opts
        .config_path
        .clone()
        .unwrap_or_else(|| backup_path.join("config.json"));
    let config_path = std::path::absolute(&config_path).unwrap_or(config_path);

    if !primitives::is_dir(&source_path) {
        return Err(BackupError::InvalidSource(source_path));
    }
    let config = BackupConfig::load(&config_path)?;

    std::fs::create_dir_all(&backup_path).map_err(|e| {
        BackupError::Fs(crate::error::FsError::new(backup_path.clone(), e))
    })?;

    let logger = Arc::new(Logger::new(&backup_path));

    let restricted = !include_paths.is_empty();
    let include_paths = remove_shadowed_paths(normalize_and_relpath(&source_path, include_paths, &logger), &logger);
    let mut exclude_paths = remove_shadowed_paths(normalize_and_relpath(&source_path, exclude_paths, &logger), &logger);

    if restricted && include_paths.is_empty() {
        return Err(BackupError::MalformedIncludePaths);
    }

    if let Ok(rel) = backup_path.strip_prefix(&source_path) {
        let rel = rel.to_path_buf();
        if !exclude_paths.contains(&rel) {
            logger.log("Warning: Excluding backup_path, which is in source_path.", 0);
            exclude_paths.push(rel);
        }
    }

    let Some(marker) = ProgressMarker::acquire(&backup_path)
        .map_err(|e| BackupError::Fs(crate::error::FsError::new(backup_path.clone(), e)))?
    else {
        let marker_path = ProgressMarker::path_for(&backup_path);
        logger.log(
            &format!("[ERR] Backup process already running.\nRemove {}.", marker_path.display()),
            0,
        );
        return Err(BackupError::AlreadyRunning(marker_path));
    };

    logger.log("[RUN] Starting backup process.", 0);
    let result = (|| -> Result<(), BackupError> {
        let mut stages = StageManager::new(
            source_path,
            backup_path.clone(),
            include_paths,
            exclude_paths,
            &config,
            EngineOptions {
                jobs: opts.jobs,
                max_retries: opts.max_retries,
                queue_limit: opts.queue_limit,
                save_memory: opts.save_memory,
            },
            Arc::clone(&logger),
            1,
        );
        let init = stages.snapshot_names().remove(0);
        logger.log("[1/2] Rotating stages:", 0);
        stages.rotate()?;
        logger.log(&format!("[2/2] Creating new snapshot for initial stage '{init}':"), 0);
        stages.create()?;
        Ok(())
    })();

    match &result {
        Ok(()) => logger.log("[END] Finished backup process.", 0),
        Err(e) => logger.log(&format!("[ERR] Backup process failed with error:\n{e}"), 0),
    }
    drop(marker);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(dir: &Path) {
        fs::write(
            dir.join("config.json"),
            r#"{"interval": 3600, "stages": [{"name": "hourly", "keep": 2}]}"#,
        )
        .unwrap();
    }

    #[test]
    fn full_run_creates_initial_snapshot() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        write_config(backup.path());

        let opts = BackupOptions {
            config_path: None,
            jobs: 2,
            max_retries: 2,
            queue_limit: 8,
            save_memory: false,
        };
        run_backup(src.path(), backup.path(), &[], &[], &opts).unwrap();

        assert!(backup.path().join("hourly.0/a.txt").exists());
        assert!(backup.path().join("backup.log").exists());
        assert!(!backup.path().join(".inprogress").exists());
    }

    #[test]
    fn concurrent_marker_refuses_second_run() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        write_config(backup.path());
        std::fs::create_dir_all(backup.path()).unwrap();
        let _marker = ProgressMarker::acquire(backup.path()).unwrap().unwrap();

        let opts = BackupOptions {
            config_path: None,
            jobs: 1,
            max_retries: 2,
            queue_limit: 8,
            save_memory: false,
        };
        let err = run_backup(src.path(), backup.path(), &[], &[], &opts).unwrap_err();
        assert!(matches!(err, BackupError::AlreadyRunning(_)));

        let log = fs::read_to_string(backup.path().join("backup.log")).unwrap();
        assert!(log.contains("Backup process already running"));
    }

    #[test]
    fn backup_path_under_source_is_auto_excluded() {
        let src = tempfile::tempdir().unwrap();
        let backup = src.path().join("backup");
        fs::create_dir_all(&backup).unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        write_config(&backup);

        let opts = BackupOptions {
            config_path: None,
            jobs: 2,
            max_retries: 2,
            queue_limit: 8,
            save_memory: false,
        };
        run_backup(src.path(), &backup, &[], &[], &opts).unwrap();

        assert!(backup.join("hourly.0/a.txt").exists());
        assert!(!backup.join("hourly.0/backup").exists());
    }

    #[test]
    fn malformed_include_path_outside_source_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        write_config(backup.path());

        let opts = BackupOptions {
            config_path: None,
            jobs: 1,
            max_retries: 2,
            queue_limit: 8,
            save_memory: false,
        };
        let err = run_backup(
            src.path(),
            backup.path(),
            &[PathBuf::from("/totally/elsewhere")],
            &[],
            &opts,
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::MalformedIncludePaths));
    }
}
