//! Command-line interface.
//!
//! Flags as spec.md §6: `-c/--config`, `-s/--save-memory` (a bare flag
//! defaults to `true`, matching the original's keyword-only boolean),
//! `-j/--jobs` (defaults to the build-time detected parallelism),
//! repeatable `-i/--include-paths`/`-e/--exclude-paths`, and two
//! positional arguments. `--generate` is carried over from the teacher's
//! `clap_complete` usage as a free ambient convenience.

use clap::{Parser, ValueHint, value_parser};
use clap_complete::aot::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "snaptree", version = env!("CARGO_PKG_VERSION"))]
/// Create an incremental, rotating, hard-link-sharing backup snapshot.
pub struct Args {
    #[arg(value_name = "SOURCE", value_hint = ValueHint::DirPath, index = 1)]
    pub source_path: Option<PathBuf>,

    #[arg(value_name = "BACKUP", value_hint = ValueHint::DirPath, index = 2)]
    pub backup_path: Option<PathBuf>,

    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        value_hint = ValueHint::FilePath,
        help = "Path to config.json (defaults to <backup>/config.json)"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short = 's',
        long = "save-memory",
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Avoid building large in-memory file trees; slightly slower"
    )]
    pub save_memory: Option<bool>,

    #[arg(
        short = 'j',
        long = "jobs",
        default_value = env!("THREAD_COUNT"),
        help = "Number of worker threads"
    )]
    pub jobs: usize,

    #[arg(
        short = 'i',
        long = "include-paths",
        value_name = "PATH",
        action = clap::ArgAction::Append,
        help = "Restrict the backup to these paths, relative to SOURCE (repeatable)"
    )]
    pub include_paths: Vec<PathBuf>,

    #[arg(
        short = 'e',
        long = "exclude-paths",
        value_name = "PATH",
        action = clap::ArgAction::Append,
        help = "Skip these paths during sync, relative to SOURCE (repeatable)"
    )]
    pub exclude_paths: Vec<PathBuf>,

    #[arg(
        long = "generate",
        value_parser = value_parser!(Shell),
        help = "Generate shell completions and exit"
    )]
    pub generate: Option<Shell>,
}

impl Args {
    /// `true` if `-s`/`--save-memory` was given, with its default-missing
    /// value applied; `false` if never passed.
    #[must_use]
    pub fn save_memory(&self) -> bool {
        self.save_memory.unwrap_or(false)
    }
}
