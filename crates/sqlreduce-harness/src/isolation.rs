//! Crash isolation harness.
//!
//! Runs a statement sequence in a worker that journals its progress, then
//! reads the verdict back from the journal. The worker may die at any
//! point; the parent only trusts what reached the journal.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use sqlreduce_error::{ReduceError, Result};
use tracing::{debug, info, warn};

use crate::classifier::FaultSignature;
use crate::config::{IsolationMode, ReduceSettings};
use crate::journal::{
    CRASH_JOURNAL_FILE, CrashJournal, JournalRecord, JournalVerdict, replay_journal,
};
use crate::oracle::{EngineConfig, Oracle, ShellOracle};
use crate::script::{LoadContext, Statement, split_query_log};

/// Hidden driver subcommand that runs one worker job.
pub const WORKER_SUBCOMMAND: &str = "__harness-worker";

/// Job file name inside the work directory.
pub const WORKER_JOB_FILE: &str = "harness_job.json";

/// Exit code of a Rust process that panicked.
const PANIC_EXIT_CODE: i32 = 101;

/// Everything a worker process needs to rebuild the trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub engine: EngineConfig,
    pub load: LoadContext,
    pub statements: Vec<Statement>,
    pub journal_path: PathBuf,
}

/// Verdict of one harness run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarnessOutcome {
    /// Retained statements, faulting one last. `None` when no fault.
    pub surviving: Option<Vec<Statement>>,
    /// Recorded signature, or the crash placeholder after a worker death.
    pub signature: Option<FaultSignature>,
    pub worker_died: bool,
}

impl HarnessOutcome {
    #[must_use]
    pub fn reproduced(&self) -> bool {
        self.signature.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkerExit {
    Completed,
    Died(String),
}

/// Worker loop: run each statement cumulatively on top of the load and
/// the statements retained so far, journaling before and after each one.
///
/// DDL-shaped statements are always retained. The first target-shaped
/// fault stops the loop and is journaled; otherwise the journal is
/// cleared at the end.
pub fn run_statements_until_fault(
    oracle: &dyn Oracle,
    load: &LoadContext,
    statements: &[Statement],
    journal_path: &Path,
) -> Result<()> {
    let mut journal = CrashJournal::create(journal_path, statements.len())?;
    let mut retained: Vec<Statement> = Vec::with_capacity(statements.len());

    for (index, statement) in statements.iter().enumerate() {
        let position = index + 1;
        journal.append(&JournalRecord::Pending {
            position,
            sql: statement.clone(),
        })?;

        retained.push(statement.clone());
        let report = oracle.execute(&load.render(&retained))?.classify();
        if report.is_target_shaped() {
            debug!(position, signature = %report.signature, "worker hit fault");
            journal.append(&JournalRecord::Fault {
                signature: report.signature,
            })?;
            return Ok(());
        }

        if !statement.is_ddl() {
            retained.pop();
            journal.append(&JournalRecord::Dropped { position })?;
        }
    }

    journal.append(&JournalRecord::Cleared)
}

/// Entry point of the worker subcommand.
pub fn run_worker_job(job_path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(job_path).map_err(|err| ReduceError::WorkerLaunch {
        detail: format!("cannot read job '{}': {err}", job_path.display()),
    })?;
    let job: WorkerJob = serde_json::from_str(&text)?;
    let oracle = ShellOracle::new(job.engine);
    run_statements_until_fault(&oracle, &job.load, &job.statements, &job.journal_path)
}

/// Parent side of the harness.
pub struct CrashHarness<'a> {
    oracle: &'a dyn Oracle,
    settings: &'a ReduceSettings,
}

impl<'a> CrashHarness<'a> {
    #[must_use]
    pub fn new(oracle: &'a dyn Oracle, settings: &'a ReduceSettings) -> Self {
        Self { oracle, settings }
    }

    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.settings.work_dir.join(CRASH_JOURNAL_FILE)
    }

    /// Run `statements` after `load` in an isolated worker and report the
    /// first fault, if any.
    pub fn run_until_fault(
        &self,
        load: &LoadContext,
        statements: &[Statement],
    ) -> Result<HarnessOutcome> {
        let journal_path = self.journal_path();
        crate::journal::remove_journal(&journal_path)?;

        let exit = match self.settings.isolation {
            IsolationMode::Process => self.launch_process(load, statements, &journal_path)?,
            IsolationMode::Thread => self.launch_thread(load, statements, &journal_path)?,
        };
        if let WorkerExit::Died(reason) = &exit {
            warn!(
                isolation = self.settings.isolation.as_str(),
                %reason,
                "harness worker died; recovering from journal"
            );
        }

        // The worker journals its header before running anything, so an
        // unwritten journal means the sequence never ran.
        let outcome = match replay_journal(&journal_path)? {
            JournalVerdict::Unwritten => {
                return Err(ReduceError::WorkerLaunch {
                    detail: format!(
                        "worker exited without journaling ({})",
                        match exit {
                            WorkerExit::Completed => "clean exit".to_owned(),
                            WorkerExit::Died(reason) => reason,
                        }
                    ),
                });
            }
            JournalVerdict::Cleared => HarnessOutcome::default(),
            JournalVerdict::Faulted(report) => HarnessOutcome {
                surviving: Some(report.retained.into_iter().map(|r| r.sql).collect()),
                signature: Some(report.signature),
                worker_died: report.worker_died,
            },
        };
        debug!(
            statements = statements.len(),
            reproduced = outcome.reproduced(),
            worker_died = outcome.worker_died,
            "harness run finished"
        );
        Ok(outcome)
    }

    /// Split a captured query log and run it through the harness.
    pub fn cleanup_query_log(&self, load: &LoadContext, log: &str) -> Result<HarnessOutcome> {
        let statements = split_query_log(log);
        info!(statements = statements.len(), "replaying query log");
        self.run_until_fault(load, &statements)
    }

    fn launch_thread(
        &self,
        load: &LoadContext,
        statements: &[Statement],
        journal_path: &Path,
    ) -> Result<WorkerExit> {
        let oracle = self.oracle;
        let joined = std::thread::scope(|scope| {
            std::thread::Builder::new()
                .name("sqlreduce-worker".to_owned())
                .spawn_scoped(scope, move || {
                    run_statements_until_fault(oracle, load, statements, journal_path)
                })
                .map(|handle| handle.join())
        })
        .map_err(|err| ReduceError::WorkerLaunch {
            detail: format!("cannot spawn worker thread: {err}"),
        })?;

        match joined {
            Ok(Ok(())) => Ok(WorkerExit::Completed),
            Ok(Err(err)) => Err(err),
            Err(payload) => Ok(WorkerExit::Died(format!(
                "worker thread panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    fn launch_process(
        &self,
        load: &LoadContext,
        statements: &[Statement],
        journal_path: &Path,
    ) -> Result<WorkerExit> {
        let engine = self.oracle.engine_config().ok_or_else(|| {
            ReduceError::config("process isolation needs a shell-backed oracle; use thread isolation")
        })?;
        let exe = match &self.settings.worker_exe {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|err| ReduceError::WorkerLaunch {
                detail: format!("cannot locate driver executable: {err}"),
            })?,
        };

        let job = WorkerJob {
            engine: engine.clone(),
            load: load.clone(),
            statements: statements.to_vec(),
            journal_path: journal_path.to_path_buf(),
        };
        let job_path = self.settings.work_dir.join(WORKER_JOB_FILE);
        std::fs::write(&job_path, serde_json::to_string(&job)?)?;

        let status = Command::new(&exe)
            .arg(WORKER_SUBCOMMAND)
            .arg("--job")
            .arg(&job_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|err| ReduceError::WorkerLaunch {
                detail: format!("cannot start '{}': {err}", exe.display()),
            })?;

        match status.code() {
            Some(0) => Ok(WorkerExit::Completed),
            Some(PANIC_EXIT_CODE) => Ok(WorkerExit::Died("worker process panicked".to_owned())),
            Some(code) => Err(ReduceError::WorkerLaunch {
                detail: format!("worker process failed with exit code {code}"),
            }),
            None => Ok(WorkerExit::Died(format!("worker process killed: {status}"))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ExecOutcome;
    use std::sync::Mutex;

    /// Faults when the script contains `needle`, recording every script.
    struct NeedleOracle {
        needle: &'static str,
        seen: Mutex<Vec<String>>,
    }

    impl NeedleOracle {
        fn new(needle: &'static str) -> Self {
            Self {
                needle,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Oracle for NeedleOracle {
        fn execute(&self, script: &str) -> Result<ExecOutcome> {
            self.seen.lock().expect("lock").push(script.to_owned());
            if script.contains(self.needle) {
                Ok(ExecOutcome::failed("INTERNAL Error: needle found", 1))
            } else {
                Ok(ExecOutcome::success(""))
            }
        }
    }

    fn stmts(texts: &[&str]) -> Vec<Statement> {
        texts.iter().filter_map(|t| Statement::new(t)).collect()
    }

    fn thread_settings(dir: &Path) -> ReduceSettings {
        ReduceSettings {
            isolation: IsolationMode::Thread,
            work_dir: dir.to_path_buf(),
            ..ReduceSettings::default()
        }
    }

    #[test]
    fn worker_runs_cumulatively_and_keeps_ddl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = thread_settings(dir.path());
        let oracle = NeedleOracle::new("BOOM");
        let harness = CrashHarness::new(&oracle, &settings);
        let load = LoadContext::new("PRAGMA threads=1;");

        let outcome = harness
            .run_until_fault(
                &load,
                &stmts(&["CREATE TABLE t(a INT)", "SELECT 1", "SELECT BOOM FROM t", "SELECT 2"]),
            )
            .expect("harness run");

        assert!(outcome.reproduced());
        assert_eq!(
            outcome.surviving.expect("surviving"),
            stmts(&["CREATE TABLE t(a INT)", "SELECT BOOM FROM t"])
        );
        let seen = oracle.seen.lock().expect("lock");
        assert_eq!(seen.len(), 3, "case=stops_at_first_fault");
        assert_eq!(
            seen[1],
            "PRAGMA threads=1;\nCREATE TABLE t(a INT);\nSELECT 1;\n",
            "case=cumulative_script"
        );
    }

    #[test]
    fn clean_run_reports_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = thread_settings(dir.path());
        let oracle = NeedleOracle::new("BOOM");
        let harness = CrashHarness::new(&oracle, &settings);
        let outcome = harness
            .run_until_fault(&LoadContext::empty(), &stmts(&["SELECT 1", "SELECT 2"]))
            .expect("harness run");
        assert_eq!(outcome, HarnessOutcome::default());
    }

    /// Panics on the statement containing `PANIC`.
    struct PanickingOracle;

    impl Oracle for PanickingOracle {
        fn execute(&self, script: &str) -> Result<ExecOutcome> {
            assert!(!script.contains("PANIC"), "engine exploded");
            Ok(ExecOutcome::success(""))
        }
    }

    #[test]
    fn worker_panic_is_recovered_from_journal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = thread_settings(dir.path());
        let harness = CrashHarness::new(&PanickingOracle, &settings);
        let outcome = harness
            .run_until_fault(
                &LoadContext::empty(),
                &stmts(&["INSERT INTO t VALUES (1)", "SELECT 1", "SELECT PANIC", "SELECT 3"]),
            )
            .expect("harness survives the panic");

        assert!(outcome.worker_died);
        assert!(outcome.signature.as_ref().is_some_and(FaultSignature::is_crash_placeholder));
        assert_eq!(
            outcome.surviving.expect("surviving"),
            stmts(&["INSERT INTO t VALUES (1)", "SELECT PANIC"])
        );
    }

    #[test]
    fn process_isolation_requires_shell_oracle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = ReduceSettings {
            work_dir: dir.path().to_path_buf(),
            ..ReduceSettings::default()
        };
        let oracle = NeedleOracle::new("x");
        let err = CrashHarness::new(&oracle, &settings)
            .run_until_fault(&LoadContext::empty(), &stmts(&["SELECT 1"]))
            .expect_err("in-memory oracle cannot cross processes");
        assert!(matches!(err, ReduceError::Config(_)), "err={err}");
    }

    #[test]
    fn worker_job_reads_back_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = WorkerJob {
            engine: EngineConfig {
                shell: PathBuf::from("/nonexistent/engine"),
                ..EngineConfig::default()
            },
            load: LoadContext::new("CREATE TABLE t(a INT);"),
            statements: stmts(&["SELECT 1"]),
            journal_path: dir.path().join(CRASH_JOURNAL_FILE),
        };
        let job_path = dir.path().join(WORKER_JOB_FILE);
        std::fs::write(&job_path, serde_json::to_string(&job).expect("encode")).expect("write");

        let err = run_worker_job(&job_path).expect_err("engine binary is missing");
        assert!(matches!(err, ReduceError::OracleSpawn { .. }), "err={err}");
        let decoded: WorkerJob =
            serde_json::from_str(&std::fs::read_to_string(&job_path).expect("read")).expect("decode");
        assert_eq!(decoded, job);
    }

    #[test]
    fn cleanup_query_log_strips_version_query_and_replays() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = thread_settings(dir.path());
        let oracle = NeedleOracle::new("BOOM");
        let harness = CrashHarness::new(&oracle, &settings);
        let log = "SELECT * FROM pragma_version()\nCREATE TABLE t(a INT);\nSELECT 1;\nSELECT BOOM;\n";
        let outcome = harness
            .cleanup_query_log(&LoadContext::empty(), log)
            .expect("cleanup");
        assert_eq!(
            outcome.surviving.expect("surviving"),
            stmts(&["CREATE TABLE t(a INT)", "SELECT BOOM"])
        );
    }

    /// Writes `body` as an executable worker stand-in and points process
    /// isolation at it. The script receives `__harness-worker --job <path>`.
    #[cfg(unix)]
    fn scripted_worker_settings(dir: &Path, body: &str) -> ReduceSettings {
        use std::os::unix::fs::PermissionsExt;

        let worker = dir.join("worker.sh");
        std::fs::write(&worker, format!("#!/bin/sh\n{body}")).expect("write worker");
        let mut perms = std::fs::metadata(&worker).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&worker, perms).expect("chmod");
        ReduceSettings {
            isolation: IsolationMode::Process,
            work_dir: dir.to_path_buf(),
            worker_exe: Some(worker),
            ..ReduceSettings::default()
        }
    }

    #[cfg(unix)]
    fn shell_oracle() -> ShellOracle {
        ShellOracle::new(EngineConfig {
            shell: PathBuf::from("/bin/sh"),
            ..EngineConfig::default()
        })
    }

    #[cfg(unix)]
    #[test]
    fn killed_process_worker_is_recovered_from_journal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = dir.path().join(CRASH_JOURNAL_FILE);
        let body = format!(
            "cat > '{journal}' <<'EOF'\n\
             {{\"record\":\"started\",\"schema_version\":1,\"statement_count\":3}}\n\
             {{\"record\":\"pending\",\"position\":1,\"sql\":\"CREATE TABLE t(a INT);\"}}\n\
             {{\"record\":\"pending\",\"position\":2,\"sql\":\"SELECT boom;\"}}\n\
             EOF\n\
             kill -9 $$\n",
            journal = journal.display()
        );
        let settings = scripted_worker_settings(dir.path(), &body);
        let oracle = shell_oracle();

        let outcome = CrashHarness::new(&oracle, &settings)
            .run_until_fault(
                &LoadContext::empty(),
                &stmts(&["CREATE TABLE t(a INT)", "SELECT boom", "SELECT 3"]),
            )
            .expect("harness survives a killed worker");

        assert!(outcome.worker_died, "case=death_detected");
        assert!(
            outcome.signature.as_ref().is_some_and(FaultSignature::is_crash_placeholder),
            "case=crash_placeholder"
        );
        assert_eq!(
            outcome.surviving.expect("surviving"),
            stmts(&["CREATE TABLE t(a INT)", "SELECT boom"])
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_process_worker_is_a_launch_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = scripted_worker_settings(dir.path(), "exit 3\n");
        let oracle = shell_oracle();
        let err = CrashHarness::new(&oracle, &settings)
            .run_until_fault(&LoadContext::empty(), &stmts(&["SELECT 1"]))
            .expect_err("exit code 3 is neither success nor death");
        assert!(matches!(err, ReduceError::WorkerLaunch { .. }), "err={err}");
    }

    #[cfg(unix)]
    #[test]
    fn worker_that_never_journals_is_a_launch_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let oracle = shell_oracle();
        for (case, body) in [("clean_exit", "exit 0\n"), ("killed", "kill -9 $$\n")] {
            let settings = scripted_worker_settings(dir.path(), body);
            let err = CrashHarness::new(&oracle, &settings)
                .run_until_fault(&LoadContext::empty(), &stmts(&["SELECT boom"]))
                .expect_err("no journal means the sequence never ran");
            assert!(
                matches!(err, ReduceError::WorkerLaunch { ref detail } if detail.contains("without journaling")),
                "case={case} err={err}"
            );
        }
    }
}
