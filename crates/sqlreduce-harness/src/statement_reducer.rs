//! Greedy single-statement reducer.
//!
//! Repeatedly asks the engine for smaller variants of the current
//! statement and moves to the first one that still produces the target
//! signature. Stops when a full round of candidates yields nothing, or
//! when the session's budget runs out.

use std::collections::HashSet;

use sqlreduce_error::Result;
use tracing::{debug, info};

use crate::classifier::FaultSignature;
use crate::config::ReduceSettings;
use crate::isolation::CrashHarness;
use crate::oracle::Oracle;
use crate::script::{LoadContext, Statement};
use crate::session::ReductionSession;

pub struct StatementReducer<'a> {
    oracle: &'a dyn Oracle,
    settings: &'a ReduceSettings,
    harness: CrashHarness<'a>,
}

impl<'a> StatementReducer<'a> {
    #[must_use]
    pub fn new(oracle: &'a dyn Oracle, settings: &'a ReduceSettings) -> Self {
        Self {
            oracle,
            settings,
            harness: CrashHarness::new(oracle, settings),
        }
    }

    /// Shrink `statement` while it keeps reproducing the session target.
    ///
    /// The result is never longer than the input and always reproduces the
    /// target (or is the input itself).
    pub fn reduce(
        &self,
        statement: &Statement,
        load: &LoadContext,
        session: &mut ReductionSession,
    ) -> Result<Statement> {
        let mut current = statement.clone();
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
                session.record_trial();
                let observed = self.trial_signature(load, &candidate, session)?;
                if observed == *session.target() {
                    accepted = Some(candidate);
                    break;
                }
                self.log_rejection(&candidate, &observed);
                visited.insert(candidate);
            }

            let Some(next) = accepted else {
                break;
            };
            info!(
                from_bytes = current.text_len(),
                to_bytes = next.text_len(),
                "found new reduced statement"
            );
            session.record_acceptance();
            visited.insert(next.clone());
            current = next;
        }

        Ok(current)
    }

    /// Signature produced by `load` followed by `candidate`.
    fn trial_signature(
        &self,
        load: &LoadContext,
        candidate: &Statement,
        session: &ReductionSession,
    ) -> Result<FaultSignature> {
        // The harness only reports internal faults, so ordinary-error
        // targets are always checked by direct execution.
        if self.settings.isolate_statement_trials && session.target_is_fatal() {
            let outcome = self
                .harness
                .run_until_fault(load, std::slice::from_ref(candidate))?;
            return Ok(outcome.signature.unwrap_or_default());
        }
        let outcome = self.oracle.execute(&load.render(std::slice::from_ref(candidate)))?;
        Ok(outcome.classify().signature)
    }

    fn log_rejection(&self, candidate: &Statement, observed: &FaultSignature) {
        if self.settings.verbose {
            info!(
                candidate = %candidate,
                observed = %observed,
                "candidate rejected: signature changed"
            );
        } else {
            debug!(candidate_bytes = candidate.text_len(), "candidate rejected");
        }
    }
}
