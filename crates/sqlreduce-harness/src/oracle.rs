//! Oracle executor: runs scripts against the engine under test.
//!
//! The engine is a separate shell process fed the script on stdin. Each
//! call is independent; no state is carried between executions.

use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use sqlreduce_error::{ReduceError, Result};
use tracing::{debug, warn};

use crate::classifier::{FaultReport, classify};

/// Default engine shell, relative to an engine checkout.
pub const DEFAULT_SHELL: &str = "build/debug/duckdb";

/// Engine-side table function that proposes smaller variants of a statement.
pub const DEFAULT_SHRINK_FUNCTION: &str = "reduce_sql_statement";

/// How to start the engine shell. Serializable so an isolated worker
/// process can rebuild the same oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub shell: PathBuf,
    pub args: Vec<String>,
    pub shrink_function: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            args: ["-csv", "--batch", "-init", "/dev/null"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            shrink_function: DEFAULT_SHRINK_FUNCTION.to_owned(),
        }
    }
}

/// Captured result of one engine invocation. Output is trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Terminating signal, when the engine was killed.
    pub signal: Option<i32>,
}

impl ExecOutcome {
    /// A clean run that printed `stdout`.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    /// A run that exited with `code` after printing `stderr`.
    #[must_use]
    pub fn failed(stderr: impl Into<String>, code: i32) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: Some(code),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }

    #[must_use]
    pub fn classify(&self) -> FaultReport {
        classify(self)
    }
}

/// The engine under test, as seen by the reducers.
///
/// Implementations must be shareable across threads: the thread-isolated
/// harness runs its worker on a scoped thread borrowing the oracle.
pub trait Oracle: Sync {
    /// Run `script` to completion and capture what happened.
    fn execute(&self, script: &str) -> Result<ExecOutcome>;

    /// Name of the engine's shrink table function.
    fn shrink_function(&self) -> &str {
        DEFAULT_SHRINK_FUNCTION
    }

    /// Ask the engine for smaller variants of `statement`, in engine order.
    ///
    /// An engine that rejects the request yields no candidates.
    fn shrink_candidates(&self, statement: &str) -> Result<Vec<String>> {
        let query = shrink_query(self.shrink_function(), statement);
        let outcome = self.execute(&query)?;
        if !outcome.exited_cleanly() {
            warn!(
                exit_code = ?outcome.exit_code,
                signal = ?outcome.signal,
                stderr = %outcome.stderr,
                "engine rejected shrink request"
            );
            return Ok(Vec::new());
        }
        Ok(parse_shrink_output(&outcome.stdout))
    }

    /// Launch description for a worker in another process. `None` when
    /// the oracle only exists in this address space.
    fn engine_config(&self) -> Option<&EngineConfig> {
        None
    }
}

/// Oracle backed by the engine's command-line shell.
#[derive(Debug, Clone)]
pub struct ShellOracle {
    config: EngineConfig,
}

impl ShellOracle {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Oracle for ShellOracle {
    fn execute(&self, script: &str) -> Result<ExecOutcome> {
        let mut child = Command::new(&self.config.shell)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ReduceError::OracleSpawn {
                path: self.config.shell.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ReduceError::internal("engine stdin was not captured"))?;

        // Feed stdin from a scoped thread so a chatty engine cannot
        // deadlock against a full stdout pipe.
        let (written, output) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || stdin.write_all(script.as_bytes()));
            let output = child.wait_with_output();
            (writer.join(), output)
        });

        match written {
            Ok(Ok(())) => {}
            // The engine may die before consuming the whole script.
            Ok(Err(err)) if err.kind() == ErrorKind::BrokenPipe => {
                debug!("engine closed stdin early");
            }
            Ok(Err(source)) => {
                return Err(ReduceError::OracleIo {
                    action: "writing the script",
                    source,
                });
            }
            Err(_) => return Err(ReduceError::internal("stdin writer thread panicked")),
        }

        let output = output.map_err(|source| ReduceError::OracleIo {
            action: "waiting for the engine",
            source,
        })?;

        let outcome = ExecOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            exit_code: output.status.code(),
            signal: exit_signal(&output.status),
        };
        debug!(
            script_bytes = script.len(),
            exit_code = ?outcome.exit_code,
            signal = ?outcome.signal,
            "engine invocation finished"
        );
        Ok(outcome)
    }

    fn shrink_function(&self) -> &str {
        &self.config.shrink_function
    }

    fn engine_config(&self) -> Option<&EngineConfig> {
        Some(&self.config)
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Query asking the engine to enumerate shrink candidates for `statement`.
#[must_use]
pub fn shrink_query(function: &str, statement: &str) -> String {
    format!(
        "SELECT * FROM {function}('{}');",
        statement.replace('\'', "''")
    )
}

/// Parse the engine's CSV answer to a shrink query.
///
/// Lines of two characters or fewer are noise. One surrounding pair of
/// quotes is stripped and doubled quotes are unescaped. The first
/// remaining row is the column header.
#[must_use]
pub fn parse_shrink_output(stdout: &str) -> Vec<String> {
    stdout
        .split('\n')
        .filter(|line| line.chars().count() > 2)
        .map(|line| {
            let line = line.strip_prefix('"').unwrap_or(line);
            let line = line.strip_suffix('"').unwrap_or(line);
            line.replace("\"\"", "\"")
        })
        .skip(1)
        .collect()
}
