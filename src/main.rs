//! Binary entry point: parses CLI arguments and drives the backup.

use clap_complete::aot::generate;
use snaptree::cli::Args;
use snaptree::driver::{self, BackupOptions};
use std::io::stdout;

use clap::{CommandFactory, Parser};

fn main() {
    let args = Args::parse();

    if let Some(shell) = args.generate {
        let mut cmd = Args::command();
        let name = cmd.get_name().to_owned();
        generate(shell, &mut cmd, name, &mut stdout());
        return;
    }

    let Some(source_path) = args.source_path.clone() else {
        eprintln!("Error: missing SOURCE path.");
        std::process::exit(1);
    };
    let Some(backup_path) = args.backup_path.clone() else {
        eprintln!("Error: missing BACKUP path.");
        std::process::exit(1);
    };

    let opts = BackupOptions {
        config_path: args.config.clone(),
        jobs: args.jobs.max(1),
        max_retries: 4,
        queue_limit: 32,
        save_memory: args.save_memory(),
    };

    if let Err(err) = driver::run_backup(
        &source_path,
        &backup_path,
        &args.include_paths,
        &args.exclude_paths,
        &opts,
    ) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
