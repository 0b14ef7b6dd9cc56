//! Fault classification and signature normalization.
//!
//! A [`FaultSignature`] is the headline of an engine's error stream with the
//! run-specific noise (paths, addresses, sanitizer pids, timestamps) masked
//! out. Two executions reproduce the same fault iff their signatures are
//! equal strings; nothing else about the error text is compared.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::oracle::ExecOutcome;

/// Signature recorded by the crash harness before any statement runs. It
/// survives only when the worker dies without reaching a verdict.
pub const CRASH_PLACEHOLDER: &str = "__CRASH__";

/// Substrings that mark an error stream as an internal/fatal fault.
const INTERNAL_MARKERS: [&str; 6] = [
    "INTERNAL",
    "differs from original result",
    "signed integer overflow",
    "Sanitizer",
    "sanitizer",
    "runtime error",
];

/// Characters that make up separator rules printed around sanitizer reports.
const RULE_CHARS: [char; 4] = ['=', '-', '*', '#'];

/// Normalized fault fingerprint. Empty means "no fault".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaultSignature(String);

impl FaultSignature {
    /// The empty signature.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Build a signature from an error headline, normalizing it.
    #[must_use]
    pub fn from_headline(headline: &str) -> Self {
        Self(normalize_headline(headline))
    }

    #[must_use]
    pub fn crash_placeholder() -> Self {
        Self(CRASH_PLACEHOLDER.to_owned())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn is_crash_placeholder(&self) -> bool {
        self.0 == CRASH_PLACEHOLDER
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FaultSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultReport {
    /// Whether the error counts as an internal/fatal fault.
    pub fatal: bool,
    /// Normalized headline; empty when the engine printed no error.
    pub signature: FaultSignature,
    /// Everything after the headline (stack trace, sanitizer detail).
    pub trace: String,
}

impl FaultReport {
    /// A fault of the kind the reducer hunts: fatal with a usable signature.
    #[must_use]
    pub fn is_target_shaped(&self) -> bool {
        self.fatal && !self.signature.is_empty()
    }
}

/// Whether raw error text carries any internal/fatal marker.
#[must_use]
pub fn is_internal_error(error_text: &str) -> bool {
    INTERNAL_MARKERS
        .iter()
        .any(|marker| error_text.contains(marker))
}

/// Split an error stream into its headline and the remaining trace.
///
/// The headline is the first non-blank line that is not a separator rule.
#[must_use]
pub fn split_exception_trace(error_text: &str) -> (&str, String) {
    let mut lines = error_text.lines();
    let mut headline = "";
    for line in lines.by_ref() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.chars().all(|ch| RULE_CHARS.contains(&ch)) {
            continue;
        }
        headline = trimmed;
        break;
    }
    let trace = lines.collect::<Vec<_>>().join("\n").trim().to_owned();
    (headline, trace)
}

/// Mask run-specific details in an error headline.
#[must_use]
pub fn normalize_headline(headline: &str) -> String {
    let patterns = volatile_patterns();
    let mut normalized = headline.trim().to_owned();
    for (pattern, replacement) in patterns {
        normalized = pattern
            .replace_all(&normalized, *replacement)
            .into_owned();
    }
    normalized.trim().to_owned()
}

/// Classify captured stderr alone.
#[must_use]
pub fn classify_stderr(stderr: &str) -> FaultReport {
    let (headline, trace) = split_exception_trace(stderr);
    if headline.is_empty() {
        return FaultReport::default();
    }
    FaultReport {
        fatal: is_internal_error(stderr),
        signature: FaultSignature::from_headline(headline),
        trace,
    }
}

/// Classify a full execution, including silent deaths by signal.
#[must_use]
pub fn classify(outcome: &ExecOutcome) -> FaultReport {
    let report = classify_stderr(&outcome.stderr);
    match outcome.signal {
        Some(signal) if report.signature.is_empty() => FaultReport {
            fatal: true,
            signature: FaultSignature(format!("process terminated by signal {signal}")),
            trace: String::new(),
        },
        Some(_) => FaultReport {
            fatal: true,
            ..report
        },
        None => report,
    }
}

/// Masking rules applied to a headline, in order: pattern, replacement.
const VOLATILE_RULES: [(&str, &str); 5] = [
    // Unix absolute paths keep only their file name.
    (
        r#"(^|[\s"'(=:])/(?:[^\s"'/():]+/)+([^\s"'/():]+)"#,
        "${1}${2}",
    ),
    // Windows drive paths likewise.
    (
        r#"(^|[\s"'(=])[A-Za-z]:\\(?:[^\s"'\\]+\\)+([^\s"'\\]+)"#,
        "${1}${2}",
    ),
    (r"\b0x[0-9a-fA-F]{6,}\b", "0x?"),
    (r"==\d+==", "==?=="),
    (
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
        "<timestamp>",
    ),
];

fn volatile_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        VOLATILE_RULES
            .into_iter()
            .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
                Ok(regex) => Some((regex, replacement)),
                Err(err) => {
                    tracing::error!(pattern, error = %err, "masking rule failed to compile");
                    None
                }
            })
            .collect()
    })
}
