use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for sqlreduce operations.
///
/// Faults raised by the engine under test are *not* errors: they are the
/// outcome the reducer is hunting for and travel as fault signatures. This
/// enum only covers failures of the reducer itself and of its environment.
#[derive(Error, Debug)]
pub enum ReduceError {
    // === Oracle Errors ===
    /// The engine binary could not be started at all.
    #[error("failed to start engine '{path}': {source}")]
    OracleSpawn {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Talking to a running engine process failed (stdin write, wait).
    #[error("engine I/O failed while {action}: {source}")]
    OracleIo {
        action: &'static str,
        source: std::io::Error,
    },

    // === Crash Journal Errors ===
    /// The durable crash journal could not be written or read back.
    #[error("crash journal '{path}' is unusable: {detail}")]
    Journal { path: PathBuf, detail: String },

    // === Worker Errors ===
    /// The isolated harness worker could not be launched.
    #[error("failed to launch harness worker: {detail}")]
    WorkerLaunch { detail: String },

    // === Configuration Errors ===
    /// Settings are inconsistent or could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Input scripts are unusable (empty exec script, unreadable file).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // === Plumbing ===
    /// Generic filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, ReduceError>;

impl ReduceError {
    /// Whether the whole reduction run must stop immediately.
    ///
    /// Oracle startup and configuration failures never get better by
    /// retrying another candidate, so they abort the run.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OracleSpawn { .. } | Self::Config(_) | Self::InvalidInput(_)
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::OracleSpawn { .. } => {
                Some("Check --shell: the engine binary must exist and be executable")
            }
            Self::Journal { .. } => Some("Check that --work-dir is writable"),
            Self::WorkerLaunch { .. } => {
                Some("Retry with --isolation thread if the driver binary cannot re-execute itself")
            }
            Self::Config(_) => Some("Fix the configuration file or the conflicting flag"),
            Self::InvalidInput(_) => Some("Check the --load and --exec script paths"),
            _ => None,
        }
    }

    /// Process exit code for the CLI.
    ///
    /// `1` is reserved for "could not reproduce", which is not an error.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::InvalidInput(_) => 2,
            Self::OracleSpawn { .. } | Self::OracleIo { .. } => 3,
            Self::Journal { .. } | Self::WorkerLaunch { .. } => 4,
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => 5,
        }
    }

    /// Create a journal error.
    pub fn journal(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Journal {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config(detail.into())
    }

    /// Create an internal error.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }
}
