//! Machine-readable summary of a finished reduction.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlreduce_error::Result;

/// Bump when a field changes meaning or is removed.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Which entry point the driver took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionStrategy {
    /// The exec script was one statement.
    SingleStatement,
    /// The last statement of a multi-statement script reproduced alone.
    LastStatement,
    /// Full multi-statement log reduction.
    StatementLog,
}

impl ReductionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SingleStatement => "single_statement",
            Self::LastStatement => "last_statement",
            Self::StatementLog => "statement_log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionReport {
    pub schema_version: u32,
    pub strategy: ReductionStrategy,
    pub target_signature: String,
    pub target_is_internal: bool,
    pub original_statements: usize,
    pub final_statements: usize,
    pub original_bytes: usize,
    pub final_bytes: usize,
    pub original_sha256: String,
    pub final_sha256: String,
    pub trials: u64,
    pub accepted_steps: u64,
    pub elapsed_ms: u64,
    pub budget_secs: u64,
    pub budget_exhausted: bool,
    pub final_script: String,
}

impl ReductionReport {
    /// Fraction of the original script that was removed, in `[0, 1]`.
    #[must_use]
    pub fn reduction_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        1.0 - (self.final_bytes as f64 / self.original_bytes as f64)
    }

    /// Render a one-line summary for triage.
    #[must_use]
    pub fn triage_line(&self) -> String {
        format!(
            "REDUCED[{}]: {} -> {} statements, {} -> {} bytes ({:.1}% smaller), {} trials, {} accepted, budget_exhausted={}",
            self.strategy.as_str(),
            self.original_statements,
            self.final_statements,
            self.original_bytes,
            self.final_bytes,
            self.reduction_ratio() * 100.0,
            self.trials,
            self.accepted_steps,
            self.budget_exhausted,
        )
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0F)]));
    }
    out
}
