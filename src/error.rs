use std::fmt;
use std::path::PathBuf;

/// Error raised when a worker in a [`crate::task::TaskSystem`] panics.
///
/// Captured per worker and re-raised (in worker-index order) from
/// [`crate::task::TaskSystem::join`].
#[derive(Debug)]
pub struct TaskError {
    pub worker: usize,
    pub message: String,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} exited with error: {}", self.worker, self.message)
    }
}

impl core::error::Error for TaskError {}

/// Error raised while loading or validating `config.json`.
#[derive(Debug)]
pub enum ConfigError {
    NotFound(PathBuf),
    Io(std::io::Error),
    Malformed(serde_json::Error),
    NoStages,
    ZeroKeep { stage: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "config file '{}' does not exist", path.display()),
            Self::Io(err) => write!(f, "failed to read config file: {err}"),
            Self::Malformed(err) => write!(f, "malformed config file: {err}"),
            Self::NoStages => write!(f, "config must declare at least one stage"),
            Self::ZeroKeep { stage } => write!(f, "stage '{stage}' has keep = 0"),
        }
    }
}

impl core::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err)
    }
}

/// Error on a leaf filesystem operation (stat, copy, link, remove, rename).
///
/// Wraps the underlying [`std::io::Error`] together with the path it
/// occurred on, so driver-level logging can report something actionable.
#[derive(Debug)]
pub struct FsError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.source)
    }
}

impl core::error::Error for FsError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl FsError {
    pub fn new(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// Top-level error returned by [`crate::driver::run_backup`].
#[derive(Debug)]
pub enum BackupError {
    InvalidSource(PathBuf),
    Config(ConfigError),
    AlreadyRunning(PathBuf),
    Task(TaskError),
    Fs(FsError),
    MalformedIncludePaths,
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSource(path) => {
                write!(f, "source path '{}' is not a valid directory", path.display())
            }
            Self::Config(err) => write!(f, "{err}"),
            Self::AlreadyRunning(marker) => write!(
                f,
                "Backup process already running. Remove {}.",
                marker.display()
            ),
            Self::Task(err) => write!(f, "{err}"),
            Self::Fs(err) => write!(f, "{err}"),
            Self::MalformedIncludePaths => write!(f, "malformed include paths"),
        }
    }
}

impl core::error::Error for BackupError {}

impl From<ConfigError> for BackupError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<TaskError> for BackupError {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}

impl From<FsError> for BackupError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}
