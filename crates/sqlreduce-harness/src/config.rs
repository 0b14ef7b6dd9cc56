//! Run settings: defaults, TOML loading, validation.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlreduce_error::{ReduceError, Result};

use crate::classifier::FaultSignature;
use crate::oracle::EngineConfig;

/// Wall-clock budget used when none is configured.
pub const DEFAULT_MAX_TIME_SECS: u64 = 300;

/// Scratch directory used when none is configured.
pub const DEFAULT_WORK_DIR: &str = ".sqlreduce";

/// Where the crash harness runs its worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Re-executed driver binary; survives engine crashes that take the
    /// whole process down.
    #[default]
    Process,
    /// Scoped thread in this process; survives panics only.
    Thread,
}

impl IsolationMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Thread => "thread",
        }
    }
}

impl FromStr for IsolationMode {
    type Err = ReduceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            other => Err(ReduceError::config(format!(
                "unknown isolation mode '{other}' (expected process or thread)"
            ))),
        }
    }
}

/// What a harness trial must produce to be accepted during log reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcceptancePolicy {
    /// The trial must reproduce the original signature exactly.
    #[default]
    SameSignature,
    /// Any internal fault, or a worker death, is accepted.
    AnyFault,
}

impl AcceptancePolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SameSignature => "same-signature",
            Self::AnyFault => "any-fault",
        }
    }

    /// Whether a trial that ended with `observed` counts as reproducing
    /// `target`. `None` means the trial saw no fault.
    pub fn accepts(self, target: &FaultSignature, observed: Option<&FaultSignature>) -> bool {
        match (self, observed) {
            (_, None) => false,
            (Self::AnyFault, Some(signature)) => !signature.is_empty(),
            (Self::SameSignature, Some(signature)) => signature == target,
        }
    }
}

impl FromStr for AcceptancePolicy {
    type Err = ReduceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "same-signature" => Ok(Self::SameSignature),
            "any-fault" => Ok(Self::AnyFault),
            other => Err(ReduceError::config(format!(
                "unknown acceptance policy '{other}' (expected same-signature or any-fault)"
            ))),
        }
    }
}

/// Settings for one reduction run.
///
/// Every field has a default, so a config file only needs the keys it
/// changes:
///
/// ```toml
/// max_time_secs = 60
/// isolation = "thread"
///
/// [engine]
/// shell = "/opt/duckdb/build/release/duckdb"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReduceSettings {
    pub engine: EngineConfig,
    /// Wall-clock budget; no new trial starts once it has elapsed.
    pub max_time_secs: u64,
    /// Log every rejected candidate, not just accepted ones.
    pub verbose: bool,
    /// Holds the crash journal and worker job files.
    pub work_dir: PathBuf,
    pub isolation: IsolationMode,
    /// Binary to re-execute as the process worker. Defaults to the
    /// running executable.
    pub worker_exe: Option<PathBuf>,
    pub acceptance: AcceptancePolicy,
    /// Run single-statement trials through the crash harness too.
    pub isolate_statement_trials: bool,
}

impl Default for ReduceSettings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            max_time_secs: DEFAULT_MAX_TIME_SECS,
            verbose: false,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            isolation: IsolationMode::default(),
            worker_exe: None,
            acceptance: AcceptancePolicy::default(),
            isolate_statement_trials: true,
        }
    }
}

impl ReduceSettings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text)
            .map_err(|err| ReduceError::config(format!("failed to parse settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            ReduceError::config(format!("cannot read '{}': {err}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.shell.as_os_str().is_empty() {
            return Err(ReduceError::config("engine shell path is empty"));
        }
        let function = &self.engine.shrink_function;
        if function.is_empty()
            || !function
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(ReduceError::config(format!(
                "shrink function '{function}' is not a plain identifier"
            )));
        }
        if self.work_dir.as_os_str().is_empty() {
            return Err(ReduceError::config("work_dir is empty"));
        }
        Ok(())
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.max_time_secs)
    }

    pub fn ensure_work_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        Ok(())
    }
}
