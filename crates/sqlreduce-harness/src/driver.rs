//! Reduction driver: reproduce the fault, pick an entry point, reduce.

use std::time::Instant;

use sqlreduce_error::{ReduceError, Result};
use tracing::{info, warn};

use crate::classifier::FaultReport;
use crate::config::ReduceSettings;
use crate::log_reducer::LogReducer;
use crate::oracle::Oracle;
use crate::report::{REPORT_SCHEMA_VERSION, ReductionReport, ReductionStrategy, sha256_hex};
use crate::script::{LoadContext, Statement, is_multi_statement, render_statements, split_statements};
use crate::session::ReductionSession;
use crate::statement_reducer::StatementReducer;

/// Result of a driver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReductionOutcome {
    /// The original script did not produce any error.
    CouldNotReproduce { stdout: String },
    Reduced(ReductionReport),
}

pub struct ReductionDriver<'a> {
    oracle: &'a dyn Oracle,
    settings: &'a ReduceSettings,
}

impl<'a> ReductionDriver<'a> {
    #[must_use]
    pub fn new(oracle: &'a dyn Oracle, settings: &'a ReduceSettings) -> Self {
        Self { oracle, settings }
    }

    /// Run `load` followed by the raw `script` once and classify it.
    pub fn reproduce(&self, load: &LoadContext, script: &str) -> Result<FaultReport> {
        Ok(self.oracle.execute(&load.render_text(script))?.classify())
    }

    /// Reduce `script` (run after `load`) to a smaller script that
    /// reproduces the same fault.
    pub fn reduce_script(&self, load: &LoadContext, script: &str) -> Result<ReductionOutcome> {
        let started = Instant::now();
        self.settings.validate()?;
        self.settings.ensure_work_dir()?;

        let original_text = load.render_text(script);
        let outcome = self.oracle.execute(&original_text)?;
        let original = outcome.classify();
        if original.signature.is_empty() {
            warn!("failed to reproduce the error with the unmodified script");
            return Ok(ReductionOutcome::CouldNotReproduce {
                stdout: outcome.stdout,
            });
        }
        info!(signature = %original.signature, "found expected error");
        if !original.fatal {
            warn!("expected error is not an internal fault; statement-log steps cannot reproduce it");
        }

        let statements = split_statements(script);
        let (strategy, reduced, session) = if is_multi_statement(script) {
            self.reduce_multi_statement(load, statements, &original, started)?
        } else {
            let statement = statements.into_iter().next().ok_or_else(|| {
                ReduceError::InvalidInput(
                    "exec script is blank; the fault comes from the load script alone".to_owned(),
                )
            })?;
            let mut session =
                ReductionSession::with_start(&original, started, self.settings.time_budget());
            let reduced = StatementReducer::new(self.oracle, self.settings).reduce(
                &statement,
                load,
                &mut session,
            )?;
            (ReductionStrategy::SingleStatement, vec![reduced], session)
        };

        let final_script = render_statements(&reduced);
        let report = ReductionReport {
            schema_version: REPORT_SCHEMA_VERSION,
            strategy,
            target_signature: session.target().to_string(),
            target_is_internal: session.target_is_fatal(),
            original_statements: split_statements(script).len(),
            final_statements: reduced.len(),
            original_bytes: script.trim().len(),
            final_bytes: final_script.len(),
            original_sha256: sha256_hex(script.trim().as_bytes()),
            final_sha256: sha256_hex(final_script.as_bytes()),
            trials: session.trials(),
            accepted_steps: session.accepted(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            budget_secs: self.settings.max_time_secs,
            budget_exhausted: session.budget_was_exhausted(),
            final_script,
        };
        info!(line = %report.triage_line(), "reduction finished");
        Ok(ReductionOutcome::Reduced(report))
    }

    /// Try the last statement on its own first; fall back to reducing the
    /// whole statement log.
    fn reduce_multi_statement(
        &self,
        load: &LoadContext,
        statements: Vec<Statement>,
        original: &FaultReport,
        started: Instant,
    ) -> Result<(ReductionStrategy, Vec<Statement>, ReductionSession)> {
        let budget = self.settings.time_budget();
        if let Some(last) = statements.last() {
            info!("testing whether the last statement reproduces the issue on its own");
            let alone = self.reproduce(load, last.as_str())?;
            if alone.is_target_shaped() {
                info!(signature = %alone.signature, "last statement reproduces a fault alone");
                let mut session = ReductionSession::with_start(&alone, started, budget);
                let reduced = StatementReducer::new(self.oracle, self.settings).reduce(
                    last,
                    load,
                    &mut session,
                )?;
                return Ok((ReductionStrategy::LastStatement, vec![reduced], session));
            }
        }

        info!(statements = statements.len(), "reducing the statement log");
        let mut session = ReductionSession::with_start(original, started, budget);
        let reduced = LogReducer::new(self.oracle, self.settings).reduce(
            statements,
            load,
            &mut session,
        )?;
        Ok((ReductionStrategy::StatementLog, reduced, session))
    }
}
