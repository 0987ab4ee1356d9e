//! Append-only run log plus stdout echo.
//!
//! Grounded in `rsync_backup.py`'s `log()` closure: every call prints the
//! indented message to stdout and appends a timestamped copy of each
//! line to `backup.log` under the backup root.

use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const INDENT_WIDTH: usize = 2;

/// Writes to `<backup_path>/backup.log` and echoes to stdout.
///
/// The log file handle is behind a `Mutex` so `Logger` can be shared
/// across worker threads (the stage manager and sync engine both log
/// from whichever thread happens to run a given phase).
pub struct Logger {
    log_path: PathBuf,
    lock: Mutex<()>,
}

impl Logger {
    #[must_use]
    pub fn new(backup_path: &Path) -> Self {
        Self {
            log_path: backup_path.join("backup.log"),
            lock: Mutex::new(()),
        }
    }

    /// Prints `msg` indented by `indent * 2` spaces, then appends a
    /// timestamped copy of each of its lines to `backup.log`.
    pub fn log(&self, msg: &str, indent: u32) {
        let indented = format!("{}{msg}", " ".repeat(indent as usize * INDENT_WIDTH));
        println!("{indented}");

        let _guard = self.lock.lock().unwrap();
        let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        else {
            return;
        };
        let timestamp = Local::now().format("[%Y/%m/%d %H:%M:%S]");
        for line in indented.lines() {
            let _ = writeln!(file, "{timestamp} {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(dir.path());
        logger.log("hello", 0);
        logger.log("world", 1);

        let contents = std::fs::read_to_string(dir.path().join("backup.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("hello"));
        assert!(lines[1].ends_with("  world"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn log_indents_multiline_messages_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(dir.path());
        logger.log("first\nsecond", 1);

        let contents = std::fs::read_to_string(dir.path().join("backup.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }
}
