//! `config.json` schema and loader.
//!
//! Grounded in `rsync_backup.py`'s `load_stages_from_config`: a base
//! interval plus an ordered list of named stages, each carrying only a
//! `keep` count. A stage's own interval is derived, not stored, as the
//! running product of every earlier stage's `keep` times the base
//! interval (spec.md §3/§6).

use crate::error::ConfigError;
use crate::stage::Stage;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Fully parsed and validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    /// Base interval, in seconds, between snapshots of the first stage.
    pub interval: u64,
    pub stages: Vec<Stage>,
}

#[derive(Deserialize)]
struct RawConfig {
    interval: u64,
    stages: Vec<RawStage>,
}

#[derive(Deserialize)]
struct RawStage {
    name: String,
    keep: u32,
}

impl BackupConfig {
    /// Loads and validates a config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let file = File::open(path).map_err(ConfigError::Io)?;
        let raw: RawConfig = serde_json::from_reader(BufReader::new(file))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        let mut stages = Vec::with_capacity(raw.stages.len());
        let mut stage_interval = raw.interval;
        for s in raw.stages {
            if s.keep == 0 {
                return Err(ConfigError::ZeroKeep { stage: s.name });
            }
            stages.push(Stage {
                name: s.name,
                interval_seconds: stage_interval,
                keep: s.keep,
            });
            stage_interval *= u64::from(stages.last().unwrap().keep);
        }
        Ok(Self {
            interval: raw.interval,
            stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn derives_stage_intervals_as_running_product() {
        let file = write_config(
            r#"{"interval": 3600, "stages": [
                {"name": "hourly", "keep": 24},
                {"name": "daily", "keep": 7},
                {"name": "weekly", "keep": 4}
            ]}"#,
        );
        let cfg = BackupConfig::load(file.path()).unwrap();
        assert_eq!(cfg.stages[0].interval_seconds, 3600);
        assert_eq!(cfg.stages[1].interval_seconds, 3600 * 24);
        assert_eq!(cfg.stages[2].interval_seconds, 3600 * 24 * 7);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = BackupConfig::load(Path::new("/no/such/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn empty_stages_rejected() {
        let file = write_config(r#"{"interval": 3600, "stages": []}"#);
        let err = BackupConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NoStages));
    }

    #[test]
    fn zero_keep_rejected() {
        let file = write_config(
            r#"{"interval": 3600, "stages": [{"name": "hourly", "keep": 0}]}"#,
        );
        let err = BackupConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroKeep { .. }));
    }

    #[test]
    fn malformed_json_is_malformed_error() {
        let file = write_config(r#"{"interval": 3600,"#);
        let err = BackupConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }
}
