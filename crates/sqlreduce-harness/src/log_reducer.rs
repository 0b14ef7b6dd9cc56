//! Multi-statement log reducer.
//!
//! Phase 1 deletes whole statements, left to right, keeping a deletion
//! whenever the harness still accepts the shorter log. Phase 2 shrinks
//! each surviving non-DDL statement in place with the engine's candidate
//! generator, judging every trial on the whole log through the harness.

use std::collections::HashSet;

use sqlreduce_error::Result;
use tracing::{debug, info};

use crate::config::ReduceSettings;
use crate::isolation::{CrashHarness, HarnessOutcome};
use crate::oracle::Oracle;
use crate::script::{LoadContext, Statement};
use crate::session::ReductionSession;

pub struct LogReducer<'a> {
    oracle: &'a dyn Oracle,
    settings: &'a ReduceSettings,
    harness: CrashHarness<'a>,
}

impl<'a> LogReducer<'a> {
    #[must_use]
    pub fn new(oracle: &'a dyn Oracle, settings: &'a ReduceSettings) -> Self {
        Self {
            oracle,
            settings,
            harness: CrashHarness::new(oracle, settings),
        }
    }

    /// Reduce `statements` while the harness keeps accepting the result.
    pub fn reduce(
        &self,
        statements: Vec<Statement>,
        load: &LoadContext,
        session: &mut ReductionSession,
    ) -> Result<Vec<Statement>> {
        let mut statements = self.delete_pass(statements, load, session)?;

        for index in 0..statements.len() {
            if statements[index].is_ddl() {
                continue;
            }
            if session.out_of_budget() {
                break;
            }
            statements[index] = self.shrink_in_place(&statements, index, load, session)?;
        }
        Ok(statements)
    }

    /// Phase 1: left-to-right deletion. DDL at the cursor is skipped.
    fn delete_pass(
        &self,
        mut statements: Vec<Statement>,
        load: &LoadContext,
        session: &mut ReductionSession,
    ) -> Result<Vec<Statement>> {
        let mut cursor = 0;
        while cursor < statements.len() {
            if session.out_of_budget() {
                break;
            }
            if statements[cursor].is_ddl() || statements.len() == 1 {
                cursor += 1;
                continue;
            }
            info!(
                position = cursor,
                total = statements.len(),
                "attempting to remove statement"
            );
            let mut candidate = statements.clone();
            candidate.remove(cursor);
            session.record_trial();
            let outcome = self.harness.run_until_fault(load, &candidate)?;
            if self.accepts(session, &outcome) {
                debug!(position = cursor, "statement removed");
                session.record_acceptance();
                statements = candidate;
            } else {
                cursor += 1;
            }
        }
        Ok(statements)
    }

    /// Phase 2: greedy shrink of the statement at `index`, keeping the rest
    /// of the log fixed.
    fn shrink_in_place(
        &self,
        statements: &[Statement],
        index: usize,
        load: &LoadContext,
        session: &mut ReductionSession,
    ) -> Result<Statement> {
        let mut trial = statements.to_vec();
        let mut current = statements[index].clone();
        let mut visited: HashSet<Statement> = HashSet::from([current.clone()]);

        'search: loop {
            if session.out_of_budget() {
                break;
            }
            let mut accepted = None;
            for raw in self.oracle.shrink_candidates(current.as_str())? {
                let Some(candidate) = Statement::new(&raw) else {
                    continue;
                };
                if candidate.text_len() > current.text_len() || visited.contains(&candidate) {
                    continue;
                }
                if session.out_of_budget() {
                    break 'search;
                }
                trial[index] = candidate.clone();
                session.record_trial();
                let outcome = self.harness.run_until_fault(load, &trial)?;
                if self.accepts(session, &outcome) {
                    accepted = Some(candidate);
                    break;
                }
                if self.settings.verbose {
                    info!(
                        position = index,
                        candidate = %candidate,
                        observed = ?outcome.signature,
                        "candidate rejected"
                    );
                }
                visited.insert(candidate);
            }

            let Some(next) = accepted else {
                break;
            };
            info!(
                position = index,
                from_bytes = current.text_len(),
                to_bytes = next.text_len(),
                "found new reduced statement"
            );
            session.record_acceptance();
            visited.insert(next.clone());
            trial[index] = next.clone();
            current = next;
        }

        Ok(current)
    }

    fn accepts(&self, session: &ReductionSession, outcome: &HarnessOutcome) -> bool {
        self.settings
            .acceptance
            .accepts(session.target(), outcome.signature.as_ref())
    }
}
