//! Incremental, rotating, hard-link-sharing directory-tree backups.
//!
//! Built from three layers: a small work-stealing-style task system
//! ([`task`]) that everything else runs on top of, a two-phase parallel
//! tree-sync/remove engine ([`sync`], [`rmtree`]) that mirrors
//! `rsync --archive --delete`, and a stage/snapshot manager ([`stage`])
//! that rotates named snapshots through a multi-tier retention schedule
//! with crash recovery via on-disk markers.

pub mod atomic;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod fs;
pub mod logger;
pub mod marker;
pub mod progress;
pub mod rmtree;
pub mod stage;
pub mod sync;
pub mod task;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;
