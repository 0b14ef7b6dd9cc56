//! Per-run reduction state: target fault, time budget, trial counters.

use std::time::{Duration, Instant};

use tracing::info;

use crate::classifier::{FaultReport, FaultSignature};

#[derive(Debug, Clone)]
pub struct ReductionSession {
    target: FaultSignature,
    target_fatal: bool,
    started: Instant,
    budget: Duration,
    trials: u64,
    accepted: u64,
    budget_exhausted: bool,
}

impl ReductionSession {
    /// Start a session now, hunting `target`.
    #[must_use]
    pub fn new(target: &FaultReport, budget: Duration) -> Self {
        Self::with_start(target, Instant::now(), budget)
    }

    /// Start a session whose clock began at `started`.
    #[must_use]
    pub fn with_start(target: &FaultReport, started: Instant, budget: Duration) -> Self {
        Self {
            target: target.signature.clone(),
            target_fatal: target.fatal,
            started,
            budget,
            trials: 0,
            accepted: 0,
            budget_exhausted: false,
        }
    }

    #[must_use]
    pub fn target(&self) -> &FaultSignature {
        &self.target
    }

    /// Whether the target is an internal fault rather than an ordinary
    /// engine error.
    #[must_use]
    pub fn target_is_fatal(&self) -> bool {
        self.target_fatal
    }

    /// Check the budget before starting a trial. Once the elapsed time
    /// exceeds the budget this stays true for the rest of the session.
    pub fn out_of_budget(&mut self) -> bool {
        if !self.budget_exhausted && self.started.elapsed() > self.budget {
            info!(
                budget_secs = self.budget.as_secs(),
                trials = self.trials,
                "time budget exhausted; keeping best result so far"
            );
            self.budget_exhausted = true;
        }
        self.budget_exhausted
    }

    pub fn record_trial(&mut self) {
        self.trials += 1;
    }

    pub fn record_acceptance(&mut self) {
        self.accepted += 1;
    }

    #[must_use]
    pub fn trials(&self) -> u64 {
        self.trials
    }

    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn budget_was_exhausted(&self) -> bool {
        self.budget_exhausted
    }
}
