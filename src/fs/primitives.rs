//! Single-node filesystem operations, all symlink-aware: a symlink is
//! treated as the node it is, never silently followed to whatever it
//! points at. This matches `rsync --archive`, which only ever copies a
//! symlink itself, not its target.

use std::ffi::{CString, OsString};
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// Lists the names of the direct children of `dir`.
pub fn listdir(dir: &Path) -> io::Result<Vec<OsString>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name());
    }
    Ok(names)
}

/// Node exists, including as a dangling symlink.
#[must_use]
pub fn exists(node: &Path) -> bool {
    node.symlink_metadata().is_ok()
}

/// Node is a directory and not a symlink to one.
#[must_use]
pub fn is_dir(node: &Path) -> bool {
    node.symlink_metadata()
        .is_ok_and(|m| m.file_type().is_dir())
}

/// Node is a regular file or a symlink (dangling or not).
#[must_use]
pub fn is_file(node: &Path) -> bool {
    node.symlink_metadata().is_ok_and(|m| {
        let ft = m.file_type();
        ft.is_file() || ft.is_symlink()
    })
}

/// Node exists but is neither a directory nor a file/symlink (socket,
/// fifo, device, ...).
#[must_use]
pub fn is_special(node: &Path) -> bool {
    exists(node) && !is_dir(node) && !is_file(node)
}

/// Stat without following a trailing symlink.
pub fn node_stat(node: &Path) -> io::Result<Metadata> {
    node.symlink_metadata()
}

/// Node type (regular file, directory, symlink, ...) matches between the
/// two stats.
#[must_use]
pub fn same_types(a: &Metadata, b: &Metadata) -> bool {
    (a.mode() & libc::S_IFMT as u32) == (b.mode() & libc::S_IFMT as u32)
}

/// Permission bits match between the two stats.
#[must_use]
pub fn same_permissions(a: &Metadata, b: &Metadata) -> bool {
    (a.mode() & 0o777) == (b.mode() & 0o777)
}

/// Removes `file` if it is a file or symlink, otherwise does nothing.
pub fn remove_file(file: &Path) -> io::Result<()> {
    if is_file(file) {
        fs::remove_file(file)?;
    }
    Ok(())
}

/// Removes an empty directory. Fails if the directory is not empty.
pub fn remove_empty_dir(dir: &Path) -> io::Result<()> {
    fs::remove_dir(dir)
}

/// Removes `node`, whatever it is (file, symlink, or non-empty directory).
pub fn remove_node(node: &Path) -> io::Result<()> {
    if is_dir(node) {
        fs::remove_dir_all(node)?;
    }
    remove_file(node)
}

/// Copies or hard-links `src` onto `tgt`, removing any existing `tgt`
/// first. `src` must already exist. A non-link copy preserves mtime and
/// permissions (`copy_stat`), matching `shutil.copy2`.
pub fn copy_file(src: &Path, tgt: &Path, link: bool) -> io::Result<()> {
    remove_node(tgt)?;
    if link {
        fs::hard_link(src, tgt)
    } else {
        fs::copy(src, tgt)?;
        copy_stat(src, tgt)
    }
}

/// Copies mtime and (for non-symlinks) permission bits from `src` to
/// `tgt`, without following either as a symlink. Linux has no `lchmod`,
/// so a symlink target keeps whatever permissions it was created with —
/// the same limitation `shutil.copystat(follow_symlinks=False)` has.
pub fn copy_stat(src: &Path, tgt: &Path) -> io::Result<()> {
    let meta = node_stat(src)?;
    set_mtime_no_follow(tgt, meta.mtime(), meta.mtime_nsec())?;
    if !meta.file_type().is_symlink() {
        fs::set_permissions(tgt, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    }
    Ok(())
}

fn set_mtime_no_follow(path: &Path, mtime_sec: i64, mtime_nsec: i64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec {
            tv_sec: mtime_sec as libc::time_t,
            tv_nsec: mtime_nsec,
        },
    ];
    // SAFETY: `c_path` is a valid NUL-terminated C string for the
    // duration of the call, `times` points to a 2-element array as
    // required by `utimensat(2)`.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
