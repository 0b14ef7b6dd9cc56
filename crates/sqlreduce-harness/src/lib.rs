//! Test-case reduction for SQL engine faults.
//!
//! Given a setup script and a script that makes the engine fail, this
//! crate searches for a smaller script that still fails the same way.
//! The engine is driven as a black box through the [`oracle::Oracle`]
//! trait; runs that may crash the engine go through the journaled
//! [`isolation::CrashHarness`].

pub mod classifier;
pub mod config;
pub mod driver;
pub mod isolation;
pub mod journal;
pub mod log_reducer;
pub mod logging;
pub mod oracle;
pub mod report;
pub mod script;
pub mod session;
pub mod statement_reducer;

pub use classifier::{FaultReport, FaultSignature};
pub use config::{AcceptancePolicy, IsolationMode, ReduceSettings};
pub use driver::{ReductionDriver, ReductionOutcome};
pub use isolation::{CrashHarness, HarnessOutcome};
pub use oracle::{EngineConfig, ExecOutcome, Oracle, ShellOracle};
pub use report::{ReductionReport, ReductionStrategy};
pub use script::{LoadContext, Statement};
pub use session::ReductionSession;
