//! Recursive tree sync: mirrors `rsync --archive --delete` semantics
//! between a source and a target directory, walked in parallel over a
//! [`TaskSystem`].
//!
//! Two modes, chosen by [`SyncOptions::save_memory`]:
//!
//! - Tree mode (default) runs a discovery phase that records every
//!   change into a [`FileChanges`] tree, then an apply phase that walks
//!   that tree and performs the recorded changes. Faster, but the whole
//!   tree of pending changes is held in memory at once.
//! - Save-memory mode fuses discovery and apply into a single pass per
//!   node (`sync_path`, run once as a dry run to count nodes for the
//!   progress bar, then for real) so no tree is ever materialized.

use crate::atomic::AtomicCounter;
use crate::error::{BackupError, FsError};
use crate::fs::changes::{ChangeType, Entry, FileChanges};
use crate::fs::primitives;
use crate::progress::run_phase;
use crate::task::TaskHandle;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct SyncOptions {
    pub jobs: usize,
    pub max_retries: usize,
    pub queue_limit: usize,
    pub create_hard_links: bool,
    pub save_memory: bool,
    pub indent: u32,
}

/// Recursively syncs `source_path` to `target_path`, preserving mtime
/// and permissions. If `include_paths` is non-empty the sync is
/// restricted to those paths (relative to both roots); `exclude_paths`
/// (relative to `source_path`) are skipped entirely.
pub fn sync(
    source_path: &Path,
    target_path: &Path,
    include_paths: &[PathBuf],
    exclude_paths: &[PathBuf],
    opts: &SyncOptions,
) -> Result<(), BackupError> {
    let include_paths: Vec<PathBuf> = if include_paths.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        include_paths.to_vec()
    };
    for p in &include_paths {
        let dir = target_path.join(p);
        std::fs::create_dir_all(&dir).map_err(|e| FsError::new(dir, e))?;
    }

    let source_root = Arc::new(source_path.to_path_buf());
    let exclude_paths = Arc::new(exclude_paths.to_vec());

    if opts.save_memory {
        sync_save_memory(source_path, target_path, &include_paths, &source_root, &exclude_paths, opts)
    } else {
        sync_tree(source_path, target_path, &include_paths, &source_root, &exclude_paths, opts)
    }
}

fn sync_save_memory(
    source_path: &Path,
    target_path: &Path,
    include_paths: &[PathBuf],
    source_root: &Arc<PathBuf>,
    exclude_paths: &Arc<Vec<PathBuf>>,
    opts: &SyncOptions,
) -> Result<(), BackupError> {
    let max_nodes = run_phase(
        opts.jobs,
        opts.max_retries,
        opts.queue_limit,
        opts.indent,
        "Discovering files...",
        None,
        |ts, counter| {
            for p in include_paths {
                submit_sync_path(
                    ts,
                    Arc::clone(source_root),
                    Arc::clone(exclude_paths),
                    source_path.join(p),
                    target_path.join(p),
                    opts.create_hard_links,
                    true,
                    Arc::clone(&counter),
                );
            }
        },
    )
    .map_err(BackupError::from)?;

    run_phase(
        opts.jobs,
        opts.max_retries,
        opts.queue_limit,
        opts.indent,
        "Progress",
        Some(max_nodes),
        |ts, counter| {
            for p in include_paths {
                submit_sync_path(
                    ts,
                    Arc::clone(source_root),
                    Arc::clone(exclude_paths),
                    source_path.join(p),
                    target_path.join(p),
                    opts.create_hard_links,
                    false,
                    Arc::clone(&counter),
                );
            }
        },
    )
    .map_err(BackupError::from)?;
    Ok(())
}

fn submit_sync_path(
    ts: &crate::task::TaskSystem,
    source_root: Arc<PathBuf>,
    exclude_paths: Arc<Vec<PathBuf>>,
    src_path: PathBuf,
    tgt_path: PathBuf,
    create_hard_links: bool,
    dry_run: bool,
    num_nodes: Arc<AtomicCounter>,
) {
    let handle = ts.handle();
    ts.add(move || {
        sync_path(
            handle,
            source_root,
            exclude_paths,
            src_path,
            tgt_path,
            create_hard_links,
            dry_run,
            num_nodes,
        );
    });
}

fn spawn_sync_path(
    handle: &TaskHandle,
    source_root: Arc<PathBuf>,
    exclude_paths: Arc<Vec<PathBuf>>,
    src_path: PathBuf,
    tgt_path: PathBuf,
    create_hard_links: bool,
    dry_run: bool,
    num_nodes: Arc<AtomicCounter>,
) {
    let handle2 = handle.clone();
    handle.add_or_run(move || {
        sync_path(
            handle2,
            source_root,
            exclude_paths,
            src_path,
            tgt_path,
            create_hard_links,
            dry_run,
            num_nodes,
        );
    });
}

fn sync_path(
    handle: TaskHandle,
    source_root: Arc<PathBuf>,
    exclude_paths: Arc<Vec<PathBuf>>,
    src_path: PathBuf,
    tgt_path: PathBuf,
    create_hard_links: bool,
    dry_run: bool,
    num_nodes: Arc<AtomicCounter>,
) {
    let nodes = nodes_to_sync(&src_path, &tgt_path);
    let mut count = 0i64;
    for node in nodes {
        count += 1;
        let src_node = src_path.join(&node);
        let tgt_node = tgt_path.join(&node);
        if is_excluded(&src_node, &source_root, &exclude_paths) {
            continue;
        }
        if primitives::is_special(&src_node) {
            continue;
        }
        if !primitives::exists(&src_node) {
            if !dry_run {
                expect_fs(primitives::remove_node(&tgt_node), &tgt_node);
            }
            continue;
        }
        if !primitives::exists(&tgt_node) {
            if copy_node_maybe(&src_node, &tgt_node, false, create_hard_links, dry_run) {
                spawn_sync_path(
                    &handle,
                    Arc::clone(&source_root),
                    Arc::clone(&exclude_paths),
                    src_node,
                    tgt_node,
                    create_hard_links,
                    dry_run,
                    Arc::clone(&num_nodes),
                );
            }
            continue;
        }

        let sstat = expect_fs(primitives::node_stat(&src_node), &src_node);
        let tstat = expect_fs(primitives::node_stat(&tgt_node), &tgt_node);
        if !primitives::same_types(&sstat, &tstat) {
            if copy_node_maybe(&src_node, &tgt_node, true, create_hard_links, dry_run) {
                spawn_sync_path(
                    &handle,
                    Arc::clone(&source_root),
                    Arc::clone(&exclude_paths),
                    src_node,
                    tgt_node,
                    create_hard_links,
                    dry_run,
                    Arc::clone(&num_nodes),
                );
            }
            continue;
        } else if primitives::is_dir(&src_node) {
            spawn_sync_path(
                &handle,
                Arc::clone(&source_root),
                Arc::clone(&exclude_paths),
                src_node,
                tgt_node,
                create_hard_links,
                dry_run,
                Arc::clone(&num_nodes),
            );
            continue;
        } else if sstat.mtime() != tstat.mtime() {
            if copy_node_maybe(&src_node, &tgt_node, false, create_hard_links, dry_run) {
                spawn_sync_path(
                    &handle,
                    Arc::clone(&source_root),
                    Arc::clone(&exclude_paths),
                    src_node,
                    tgt_node,
                    create_hard_links,
                    dry_run,
                    Arc::clone(&num_nodes),
                );
            }
            continue;
        }

        if !primitives::same_permissions(&sstat, &tstat) && !dry_run {
            expect_fs(primitives::copy_stat(&src_node, &tgt_node), &tgt_node);
        }
    }
    num_nodes.increment(count);
}

/// Copies `src` onto `tgt` unless `dry_run`. Returns whether `src` is a
/// directory (and thus whether the caller should recurse into it),
/// regardless of `dry_run`.
fn copy_node_maybe(src: &Path, tgt: &Path, clear: bool, create_hard_links: bool, dry_run: bool) -> bool {
    if primitives::is_dir(src) {
        if !dry_run {
            if clear {
                expect_fs(primitives::remove_node(tgt), tgt);
            }
            expect_fs(std::fs::create_dir_all(tgt), tgt);
            expect_fs(primitives::copy_stat(src, tgt), tgt);
        }
        true
    } else {
        if !dry_run {
            expect_fs(primitives::copy_file(src, tgt, create_hard_links), tgt);
        }
        false
    }
}

// --- Tree mode -------------------------------------------------------

/// Mirror of [`FileChanges`] that is still being built: each directory's
/// children map is behind its own `Mutex` so the task that records it
/// can be handed the (initially empty) map before it has run, matching
/// how the original populates a dict in place from a child task.
pub(crate) type BuildMap = BTreeMap<OsString, BuildEntry>;

pub(crate) enum BuildEntry {
    Leaf(ChangeType),
    Dir(ChangeType, Arc<Mutex<BuildMap>>),
}

fn sync_tree(
    source_path: &Path,
    target_path: &Path,
    include_paths: &[PathBuf],
    source_root: &Arc<PathBuf>,
    exclude_paths: &Arc<Vec<PathBuf>>,
    opts: &SyncOptions,
) -> Result<(), BackupError> {
    let roots: Vec<Arc<Mutex<BuildMap>>> = include_paths
        .iter()
        .map(|_| Arc::new(Mutex::new(BuildMap::new())))
        .collect();

    let max_nodes = run_phase(
        opts.jobs,
        opts.max_retries,
        opts.queue_limit,
        opts.indent,
        "Discovering files...",
        None,
        |ts, counter| {
            for (p, root) in include_paths.iter().zip(roots.iter()) {
                let handle = ts.handle();
                let src = source_path.join(p);
                let tgt = target_path.join(p);
                let source_root = Arc::clone(source_root);
                let exclude_paths = Arc::clone(exclude_paths);
                let root = Arc::clone(root);
                let counter = Arc::clone(&counter);
                ts.add(move || {
                    record_changes(handle, source_root, exclude_paths, src, tgt, root, counter);
                });
            }
        },
    )
    .map_err(BackupError::from)?;

    let frozen: Vec<FileChanges> = roots.iter().map(|m| freeze(m)).collect();

    run_phase(
        opts.jobs,
        opts.max_retries,
        opts.queue_limit,
        opts.indent,
        "Progress",
        Some(max_nodes),
        |ts, counter| {
            for (p, changes) in include_paths.iter().zip(frozen) {
                let handle = ts.handle();
                let src = source_path.join(p);
                let tgt = target_path.join(p);
                let create_hard_links = opts.create_hard_links;
                let counter = Arc::clone(&counter);
                ts.add(move || {
                    apply_changes(handle, src, tgt, changes, create_hard_links, counter);
                });
            }
        },
    )
    .map_err(BackupError::from)?;

    Ok(())
}

pub(crate) fn freeze(map: &Mutex<BuildMap>) -> FileChanges {
    map.lock()
        .unwrap()
        .iter()
        .map(|(name, entry)| (name.clone(), freeze_entry(entry)))
        .collect()
}

pub(crate) fn freeze_entry(entry: &BuildEntry) -> Entry {
    match entry {
        BuildEntry::Leaf(change) => Entry::Leaf(*change),
        BuildEntry::Dir(change, children) => Entry::Dir(*change, freeze(children)),
    }
}

fn record_changes(
    handle: TaskHandle,
    source_root: Arc<PathBuf>,
    exclude_paths: Arc<Vec<PathBuf>>,
    src_path: PathBuf,
    tgt_path: PathBuf,
    changes: Arc<Mutex<BuildMap>>,
    num_nodes: Arc<AtomicCounter>,
) {
    let nodes = nodes_to_sync(&src_path, &tgt_path);
    let mut local = BuildMap::new();
    for node in nodes {
        let src_node = src_path.join(&node);
        let tgt_node = tgt_path.join(&node);
        if is_excluded(&src_node, &source_root, &exclude_paths) {
            continue;
        }
        if primitives::is_special(&src_node) {
            continue;
        }

        let mut change_type: Option<ChangeType> = None;
        let mut subchanges: Option<Arc<Mutex<BuildMap>>> = None;

        if !primitives::exists(&src_node) {
            change_type = Some(ChangeType::RemoveNode);
        } else if !primitives::exists(&tgt_node) {
            if primitives::is_dir(&src_node) {
                let sub = Arc::new(Mutex::new(BuildMap::new()));
                subchanges = Some(Arc::clone(&sub));
                spawn_record_changes(
                    &handle,
                    Arc::clone(&source_root),
                    Arc::clone(&exclude_paths),
                    src_node.clone(),
                    tgt_node.clone(),
                    sub,
                    Arc::clone(&num_nodes),
                );
            }
            change_type = Some(ChangeType::UpdateNode);
        } else {
            let sstat = expect_fs(primitives::node_stat(&src_node), &src_node);
            let tstat = expect_fs(primitives::node_stat(&tgt_node), &tgt_node);
            if !primitives::same_types(&sstat, &tstat) {
                if primitives::is_dir(&src_node) {
                    let sub = Arc::new(Mutex::new(BuildMap::new()));
                    subchanges = Some(Arc::clone(&sub));
                    spawn_record_changes(
                        &handle,
                        Arc::clone(&source_root),
                        Arc::clone(&exclude_paths),
                        src_node.clone(),
                        tgt_node.clone(),
                        sub,
                        Arc::clone(&num_nodes),
                    );
                }
                change_type = Some(ChangeType::CreateNode);
            } else if primitives::is_dir(&src_node) {
                let sub = Arc::new(Mutex::new(BuildMap::new()));
                subchanges = Some(Arc::clone(&sub));
                spawn_record_changes(
                    &handle,
                    Arc::clone(&source_root),
                    Arc::clone(&exclude_paths),
                    src_node.clone(),
                    tgt_node.clone(),
                    sub,
                    Arc::clone(&num_nodes),
                );
                change_type = Some(if primitives::same_permissions(&sstat, &tstat) {
                    ChangeType::NoChange
                } else {
                    ChangeType::UpdateStat
                });
            } else if sstat.mtime() != tstat.mtime() {
                change_type = Some(ChangeType::UpdateNode);
            }
        }

        if let Some(change) = change_type {
            let entry = match subchanges {
                Some(sub) => BuildEntry::Dir(change, sub),
                None => BuildEntry::Leaf(change),
            };
            local.insert(node, entry);
        }
    }
    num_nodes.increment(local.len() as i64);
    *changes.lock().unwrap() = local;
}

fn spawn_record_changes(
    handle: &TaskHandle,
    source_root: Arc<PathBuf>,
    exclude_paths: Arc<Vec<PathBuf>>,
    src_path: PathBuf,
    tgt_path: PathBuf,
    changes: Arc<Mutex<BuildMap>>,
    num_nodes: Arc<AtomicCounter>,
) {
    let handle2 = handle.clone();
    handle.add_or_run(move || {
        record_changes(handle2, source_root, exclude_paths, src_path, tgt_path, changes, num_nodes);
    });
}

fn apply_changes(
    handle: TaskHandle,
    src_path: PathBuf,
    tgt_path: PathBuf,
    changes: FileChanges,
    create_hard_links: bool,
    num_nodes: Arc<AtomicCounter>,
) {
    let mut count = 0i64;
    for (node, entry) in changes {
        count += 1;
        let src_node = src_path.join(&node);
        let tgt_node = tgt_path.join(&node);
        let is_dir = entry.children().is_some();
        match entry.change() {
            ChangeType::RemoveNode => expect_fs(primitives::remove_node(&tgt_node), &tgt_node),
            ChangeType::UpdateNode => apply_copy_node(&src_node, &tgt_node, is_dir, false, create_hard_links),
            ChangeType::CreateNode => apply_copy_node(&src_node, &tgt_node, is_dir, true, create_hard_links),
            ChangeType::UpdateStat => expect_fs(primitives::copy_stat(&src_node, &tgt_node), &tgt_node),
            ChangeType::NoChange => {}
        }
        if let Entry::Dir(_, children) = entry {
            let handle2 = handle.clone();
            let num_nodes2 = Arc::clone(&num_nodes);
            handle.add_or_run(move || {
                apply_changes(handle2, src_node, tgt_node, children, create_hard_links, num_nodes2);
            });
        }
    }
    num_nodes.increment(count);
}

fn apply_copy_node(src: &Path, tgt: &Path, is_dir: bool, clear: bool, create_hard_links: bool) {
    if is_dir {
        if clear {
            expect_fs(primitives::remove_node(tgt), tgt);
        }
        expect_fs(std::fs::create_dir_all(tgt), tgt);
        expect_fs(primitives::copy_stat(src, tgt), tgt);
    } else {
        expect_fs(primitives::copy_file(src, tgt, create_hard_links), tgt);
    }
}

// --- Shared helpers ----------------------------------------------------

fn nodes_to_sync(src: &Path, tgt: &Path) -> BTreeSet<OsString> {
    let mut nodes = BTreeSet::new();
    if primitives::is_dir(src) {
        if let Ok(names) = primitives::listdir(src) {
            nodes.extend(names);
        }
    } else if primitives::is_file(src) {
        if let Some(name) = src.file_name() {
            nodes.insert(name.to_owned());
        }
    }
    if primitives::is_dir(tgt) {
        if let Ok(names) = primitives::listdir(tgt) {
            nodes.extend(names);
        }
    } else if primitives::is_file(tgt) {
        if let Some(name) = tgt.file_name() {
            nodes.insert(name.to_owned());
        }
    }
    nodes
}

fn is_excluded(src_node: &Path, source_root: &Path, exclude_paths: &[PathBuf]) -> bool {
    src_node
        .strip_prefix(source_root)
        .is_ok_and(|rel| exclude_paths.iter().any(|p| p == rel))
}

/// Turns a filesystem error mid-sync into a worker panic, which
/// [`TaskSystem`](crate::task::TaskSystem) captures and re-raises from
/// `join` — the same path an unhandled exception in a worker thread
/// takes in the original.
fn expect_fs<T>(result: std::io::Result<T>, path: &Path) -> T {
    result.unwrap_or_else(|e| panic!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn opts() -> SyncOptions {
        SyncOptions {
            jobs: 2,
            max_retries: 2,
            queue_limit: 8,
            create_hard_links: false,
            save_memory: false,
            indent: 0,
        }
    }

    #[test]
    fn copies_new_tree_and_preserves_mtime() {
        let src_dir = tempfile::tempdir().unwrap();
        let tgt_dir = tempfile::tempdir().unwrap();
        fs::create_dir(src_dir.path().join("sub")).unwrap();
        fs::write(src_dir.path().join("sub/file.txt"), b"hello").unwrap();

        sync(src_dir.path(), tgt_dir.path(), &[], &[], &opts()).unwrap();

        let copied = tgt_dir.path().join("sub/file.txt");
        assert_eq!(fs::read(&copied).unwrap(), b"hello");
    }

    #[test]
    fn removes_target_nodes_missing_from_source() {
        let src_dir = tempfile::tempdir().unwrap();
        let tgt_dir = tempfile::tempdir().unwrap();
        fs::write(tgt_dir.path().join("stale.txt"), b"old").unwrap();

        sync(src_dir.path(), tgt_dir.path(), &[], &[], &opts()).unwrap();

        assert!(!tgt_dir.path().join("stale.txt").exists());
    }

    #[test]
    fn excludes_paths_relative_to_source() {
        let src_dir = tempfile::tempdir().unwrap();
        let tgt_dir = tempfile::tempdir().unwrap();
        fs::write(src_dir.path().join("keep.txt"), b"keep").unwrap();
        fs::write(src_dir.path().join("skip.txt"), b"skip").unwrap();

        sync(
            src_dir.path(),
            tgt_dir.path(),
            &[],
            &[PathBuf::from("skip.txt")],
            &opts(),
        )
        .unwrap();

        assert!(tgt_dir.path().join("keep.txt").exists());
        assert!(!tgt_dir.path().join("skip.txt").exists());
    }

    #[test]
    fn repeated_sync_is_idempotent() {
        let src_dir = tempfile::tempdir().unwrap();
        let tgt_dir = tempfile::tempdir().unwrap();
        fs::create_dir(src_dir.path().join("sub")).unwrap();
        fs::write(src_dir.path().join("sub/file.txt"), b"hello").unwrap();

        sync(src_dir.path(), tgt_dir.path(), &[], &[], &opts()).unwrap();
        sync(src_dir.path(), tgt_dir.path(), &[], &[], &opts()).unwrap();

        assert_eq!(
            fs::read(tgt_dir.path().join("sub/file.txt")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn save_memory_mode_matches_tree_mode() {
        let src_dir = tempfile::tempdir().unwrap();
        let tgt_dir = tempfile::tempdir().unwrap();
        fs::create_dir(src_dir.path().join("sub")).unwrap();
        fs::write(src_dir.path().join("sub/file.txt"), b"hello").unwrap();

        let mut save_memory_opts = opts();
        save_memory_opts.save_memory = true;
        sync(src_dir.path(), tgt_dir.path(), &[], &[], &save_memory_opts).unwrap();

        assert_eq!(
            fs::read(tgt_dir.path().join("sub/file.txt")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn create_hard_links_shares_inode() {
        let src_dir = tempfile::tempdir().unwrap();
        let tgt_dir = tempfile::tempdir().unwrap();
        fs::write(src_dir.path().join("file.txt"), b"hello").unwrap();

        let mut linked_opts = opts();
        linked_opts.create_hard_links = true;
        sync(src_dir.path(), tgt_dir.path(), &[], &[], &linked_opts).unwrap();

        let sstat = fs::metadata(src_dir.path().join("file.txt")).unwrap();
        let tstat = fs::metadata(tgt_dir.path().join("file.txt")).unwrap();
        assert_eq!(sstat.ino(), tstat.ino());
    }
}
