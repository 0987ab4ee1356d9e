//! Recursive tree removal (spec.md §4.4), with three interchangeable
//! strategies selected in priority order:
//!
//! 1. **FD-API** — single-threaded, walks the tree through `openat`-family
//!    directory file descriptors so a symlink swapped in mid-walk cannot
//!    redirect an `unlink`/`rmdir` outside the tree being removed
//!    (classic TOCTOU symlink race). Linux-only.
//! 2. **Tree** — parallel two-phase, mirrors [`crate::sync`]'s discovery
//!    phase by recording a [`crate::fs::changes`] tree, then removing it.
//! 3. **Save-memory** — a single fused parallel pass per directory, run
//!    once as a dry run to count nodes, once for real.
//!
//! All three report progress the same way as [`crate::sync::sync`]: a
//! rotating indicator while node count is unknown, a bar once it is.

use crate::atomic::AtomicCounter;
use crate::error::BackupError;
use crate::fs::changes::{ChangeType, Entry, FileChanges};
use crate::fs::primitives;
use crate::progress::run_phase;
use crate::sync::{BuildEntry, BuildMap, freeze};
use crate::task::TaskHandle;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct RmtreeOptions {
    pub jobs: usize,
    pub max_retries: usize,
    pub queue_limit: usize,
    pub save_memory: bool,
    pub indent: u32,
}

/// Recursively removes `root`. A no-op if `root` is not a directory
/// (matches `FileSystem.is_dir(root)` guard in the original).
pub fn rmtree(root: &Path, opts: &RmtreeOptions) -> Result<(), BackupError> {
    if !primitives::is_dir(root) {
        return Ok(());
    }
    if opts.save_memory {
        rmtree_save_memory(root, opts)
    } else if fd_api::supported() {
        rmtree_fd_api(root, opts)
    } else {
        rmtree_tree(root, opts)
    }
}

// --- FD-API strategy -----------------------------------------------------

mod fd_api {
    use std::ffi::{CStr, CString, OsStr, OsString};
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn supported() -> bool {
        true
    }

    #[cfg(not(target_os = "linux"))]
    #[must_use]
    pub fn supported() -> bool {
        false
    }

    fn cstr(name: &OsStr) -> io::Result<CString> {
        CString::new(name.as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL byte"))
    }

    /// Opens `path` itself as a directory fd, without following a
    /// trailing symlink.
    pub fn open_root(path: &Path) -> io::Result<i32> {
        let c = cstr(path.as_os_str())?;
        // SAFETY: `c` is a valid NUL-terminated C string for the call.
        let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW) };
        if fd < 0 { Err(io::Error::last_os_error()) } else { Ok(fd) }
    }

    /// Opens `name` as a directory fd relative to `parent`, without
    /// following a trailing symlink.
    pub fn open_at(parent: i32, name: &OsStr) -> io::Result<i32> {
        let c = cstr(name)?;
        // SAFETY: `parent` is a valid open directory fd owned by the
        // caller, `c` is a valid NUL-terminated C string.
        let fd = unsafe { libc::openat(parent, c.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW) };
        if fd < 0 { Err(io::Error::last_os_error()) } else { Ok(fd) }
    }

    pub fn close(fd: i32) {
        // SAFETY: `fd` is a valid fd owned by the caller, closed exactly once.
        unsafe {
            libc::close(fd);
        }
    }

    /// Node type at `name` relative to `parent`, without following a
    /// trailing symlink.
    pub fn is_dir_at(parent: i32, name: &OsStr) -> io::Result<bool> {
        let c = cstr(name)?;
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: `st` is a valid out-pointer for `fstatat`.
        let rc = unsafe { libc::fstatat(parent, c.as_ptr(), &mut st, libc::AT_SYMLINK_NOFOLLOW) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((st.st_mode & libc::S_IFMT) == libc::S_IFDIR)
    }

    /// Lists the names of `fd`'s directory entries, excluding `.`/`..`.
    /// `fdopendir` takes ownership of the fd it is given, so this
    /// operates on a `dup`, leaving `fd` itself open for the caller.
    pub fn list_at(fd: i32) -> io::Result<Vec<OsString>> {
        // SAFETY: `fd` is a valid open directory fd owned by the caller.
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `dup_fd` was just created and not yet used elsewhere;
        // ownership passes to `fdopendir`/`closedir`.
        let dirp = unsafe { libc::fdopendir(dup_fd) };
        if dirp.is_null() {
            let err = io::Error::last_os_error();
            // SAFETY: `dup_fd` is still open; `fdopendir` failed without
            // taking ownership.
            unsafe {
                libc::close(dup_fd);
            }
            return Err(err);
        }
        let mut names = Vec::new();
        loop {
            // SAFETY: `dirp` is a valid, open `DIR*`.
            let entry = unsafe { libc::readdir(dirp) };
            if entry.is_null() {
                break;
            }
            // SAFETY: `entry` is non-null and valid until the next
            // `readdir`/`closedir` call on this stream.
            let d_name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
            let bytes = d_name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            names.push(OsStr::from_bytes(bytes).to_owned());
        }
        // SAFETY: `dirp` was opened above and not yet closed.
        unsafe {
            libc::closedir(dirp);
        }
        Ok(names)
    }

    pub fn unlink_at(parent: i32, name: &OsStr) -> io::Result<()> {
        let c = cstr(name)?;
        // SAFETY: `parent` is a valid open directory fd, `c` is valid.
        let rc = unsafe { libc::unlinkat(parent, c.as_ptr(), 0) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    pub fn rmdir_at(parent: i32, name: &OsStr) -> io::Result<()> {
        let c = cstr(name)?;
        // SAFETY: `parent` is a valid open directory fd, `c` is valid.
        let rc = unsafe { libc::unlinkat(parent, c.as_ptr(), libc::AT_REMOVEDIR) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }
}

fn expect_io<T>(name: &std::ffi::OsStr, result: std::io::Result<T>) -> T {
    result.unwrap_or_else(|e| panic!("{}: {e}", name.to_string_lossy()))
}

fn record_fds(fd: i32, counter: &AtomicCounter) {
    let names = expect_io(std::ffi::OsStr::new("<scandir>"), fd_api::list_at(fd));
    let mut count = 0i64;
    for name in &names {
        if expect_io(name, fd_api::is_dir_at(fd, name)) {
            let child_fd = expect_io(name, fd_api::open_at(fd, name));
            record_fds(child_fd, counter);
            fd_api::close(child_fd);
        }
        count += 1;
    }
    counter.increment(count);
}

fn remove_fds(fd: i32, counter: &AtomicCounter) {
    let names = expect_io(std::ffi::OsStr::new("<scandir>"), fd_api::list_at(fd));
    let mut count = 0i64;
    for name in &names {
        if expect_io(name, fd_api::is_dir_at(fd, name)) {
            let child_fd = expect_io(name, fd_api::open_at(fd, name));
            remove_fds(child_fd, counter);
            expect_io(name, fd_api::rmdir_at(fd, name));
            fd_api::close(child_fd);
        } else {
            expect_io(name, fd_api::unlink_at(fd, name));
        }
        count += 1;
    }
    counter.increment(count);
}

fn rmtree_fd_api(root: &Path, opts: &RmtreeOptions) -> Result<(), BackupError> {
    let max_nodes = run_phase(
        opts.jobs,
        opts.max_retries,
        opts.queue_limit,
        opts.indent,
        "Discovering files...",
        None,
        |ts, counter| {
            let root = root.to_path_buf();
            ts.add(move || {
                let fd = expect_io(root.as_os_str(), fd_api::open_root(&root));
                record_fds(fd, &counter);
                fd_api::close(fd);
            });
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
            let root = root.to_path_buf();
            ts.add(move || {
                let fd = expect_io(root.as_os_str(), fd_api::open_root(&root));
                remove_fds(fd, &counter);
                fd_api::close(fd);
                expect_io(root.as_os_str(), std::fs::remove_dir(&root));
            });
        },
    )
    .map_err(BackupError::from)?;
    Ok(())
}

// --- Tree strategy ---------------------------------------------------------

fn record_nodes(handle: TaskHandle, path: PathBuf, changes: Arc<Mutex<BuildMap>>, num_nodes: Arc<AtomicCounter>) {
    let names = primitives::listdir(&path).unwrap_or_default();
    let mut local = BuildMap::new();
    for name in names {
        let node_path = path.join(&name);
        if primitives::is_dir(&node_path) {
            let sub = Arc::new(Mutex::new(BuildMap::new()));
            let handle2 = handle.clone();
            let sub2 = Arc::clone(&sub);
            let num_nodes2 = Arc::clone(&num_nodes);
            handle.add_or_run(move || record_nodes(handle2, node_path, sub2, num_nodes2));
            local.insert(name, BuildEntry::Dir(ChangeType::NoChange, sub));
        } else {
            local.insert(name, BuildEntry::Leaf(ChangeType::RemoveNode));
        }
    }
    num_nodes.increment(local.len() as i64);
    *changes.lock().unwrap() = local;
}

/// Removes an already-empty directory and walks upward, removing each
/// newly-empty ancestor up to and including `root`. Stops silently on
/// the first failure (ancestor not yet empty, already removed by a
/// sibling's own upward walk, or any other error) — every leaf that
/// finishes attempts this walk, so between all of them the whole tree
/// is guaranteed to be removed by the time every task has run.
fn try_remove_parents(root: &Path, mut path: PathBuf) {
    loop {
        if primitives::remove_empty_dir(&path).is_err() {
            return;
        }
        if path == root {
            return;
        }
        match path.parent() {
            Some(parent) => path = parent.to_path_buf(),
            None => return,
        }
    }
}

fn remove_nodes(
    handle: TaskHandle,
    root: Arc<PathBuf>,
    path: PathBuf,
    changes: FileChanges,
    num_nodes: Arc<AtomicCounter>,
) {
    let mut count = 0i64;
    for (name, entry) in changes {
        let node_path = path.join(&name);
        if entry.change() == ChangeType::RemoveNode {
            let _ = primitives::remove_file(&node_path);
        }
        count += 1;
        if let Entry::Dir(_, children) = entry {
            let handle2 = handle.clone();
            let root2 = Arc::clone(&root);
            let num_nodes2 = Arc::clone(&num_nodes);
            handle.add_or_run(move || remove_nodes(handle2, root2, node_path, children, num_nodes2));
        }
    }
    num_nodes.increment(count);
    try_remove_parents(&root, path);
}

fn rmtree_tree(root: &Path, opts: &RmtreeOptions) -> Result<(), BackupError> {
    let build_root = Arc::new(Mutex::new(BuildMap::new()));

    let max_nodes = run_phase(
        opts.jobs,
        opts.max_retries,
        opts.queue_limit,
        opts.indent,
        "Discovering files...",
        None,
        |ts, counter| {
            let handle = ts.handle();
            let root_path = root.to_path_buf();
            let build_root = Arc::clone(&build_root);
            ts.add(move || record_nodes(handle, root_path, build_root, counter));
        },
    )
    .map_err(BackupError::from)?;

    let changes = freeze(&build_root);
    let root_arc = Arc::new(root.to_path_buf());

    run_phase(
        opts.jobs,
        opts.max_retries,
        opts.queue_limit,
        opts.indent,
        "Progress",
        Some(max_nodes),
        |ts, counter| {
            let handle = ts.handle();
            let root_path = root.to_path_buf();
            let root_arc = Arc::clone(&root_arc);
            ts.add(move || remove_nodes(handle, root_arc, root_path, changes, counter));
        },
    )
    .map_err(BackupError::from)?;
    Ok(())
}

// --- Save-memory strategy --------------------------------------------------

fn remove_content(
    handle: TaskHandle,
    root: Arc<PathBuf>,
    path: PathBuf,
    num_nodes: Arc<AtomicCounter>,
    dry_run: bool,
) {
    let names = primitives::listdir(&path).unwrap_or_default();
    let mut count = 0i64;
    for name in names {
        let node_path = path.join(&name);
        count += 1;
        if primitives::is_dir(&node_path) {
            let handle2 = handle.clone();
            let root2 = Arc::clone(&root);
            let num_nodes2 = Arc::clone(&num_nodes);
            handle.add_or_run(move || remove_content(handle2, root2, node_path, num_nodes2, dry_run));
        } else if !dry_run {
            let _ = primitives::remove_file(&node_path);
        }
    }
    num_nodes.increment(count);
    if !dry_run {
        try_remove_parents(&root, path);
    }
}

fn rmtree_save_memory(root: &Path, opts: &RmtreeOptions) -> Result<(), BackupError> {
    let root_arc = Arc::new(root.to_path_buf());

    let max_nodes = run_phase(
        opts.jobs,
        opts.max_retries,
        opts.queue_limit,
        opts.indent,
        "Discovering files...",
        None,
        |ts, counter| {
            let handle = ts.handle();
            let root_path = root.to_path_buf();
            let root_arc = Arc::clone(&root_arc);
            ts.add(move || remove_content(handle, root_arc, root_path, counter, true));
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
            let handle = ts.handle();
            let root_path = root.to_path_buf();
            let root_arc = Arc::clone(&root_arc);
            ts.add(move || remove_content(handle, root_arc, root_path, counter, false));
        },
    )
    .map_err(BackupError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn opts(save_memory: bool) -> RmtreeOptions {
        RmtreeOptions {
            jobs: 2,
            max_retries: 2,
            queue_limit: 8,
            save_memory,
            indent: 0,
        }
    }

    #[test]
    fn tree_strategy_removes_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("victim");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/file.txt"), b"x").unwrap();
        fs::write(root.join("top.txt"), b"y").unwrap();

        rmtree_tree(&root, &opts(false)).unwrap();

        assert!(!root.exists());
    }

    #[test]
    fn save_memory_strategy_removes_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("victim");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/file.txt"), b"x").unwrap();

        rmtree(&root, &opts(true)).unwrap();

        assert!(!root.exists());
    }

    #[test]
    fn rmtree_on_missing_root_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        rmtree(&missing, &opts(false)).unwrap();
    }

    #[test]
    fn fd_api_strategy_removes_nested_directories() {
        if !fd_api::supported() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("victim");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/file.txt"), b"x").unwrap();
        fs::write(root.join("top.txt"), b"y").unwrap();

        rmtree_fd_api(&root, &opts(false)).unwrap();

        assert!(!root.exists());
    }
}
