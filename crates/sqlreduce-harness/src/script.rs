//! Script data model and the naïve multi-statement splitter.
//!
//! Splitting is not SQL-aware: a `;` inside a string literal
//! splits the statement. The load script is therefore never split; it is
//! kept verbatim as a [`LoadContext`] and prepended to every trial.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Statement terminator used for splitting and re-appended to every fragment.
pub const STATEMENT_TERMINATOR: char = ';';

/// Keywords that mark a statement as schema/data mutating.
const DDL_KEYWORDS: [&str; 4] = ["create", "insert", "update", "delete"];

/// Query-log noise emitted by the engine's own shell on startup.
const QUERY_LOG_NOISE: &str = "SELECT * FROM pragma_version()\n";

/// One terminated, non-empty SQL statement.
///
/// Statements are replaced during reduction, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Statement(String);

impl Statement {
    /// Normalize raw text into a statement: trim it and make sure it ends
    /// with exactly one terminator. Returns `None` for blank input.
    #[must_use]
    pub fn new(text: &str) -> Option<Self> {
        let body = text.trim().trim_end_matches(STATEMENT_TERMINATOR).trim_end();
        if body.is_empty() {
            return None;
        }
        let mut sql = String::with_capacity(body.len() + 1);
        sql.push_str(body);
        sql.push(STATEMENT_TERMINATOR);
        Some(Self(sql))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the statement text in bytes, terminator included.
    #[must_use]
    pub fn text_len(&self) -> usize {
        self.0.len()
    }

    /// Whether this statement creates or mutates schema/data.
    #[must_use]
    pub fn is_ddl(&self) -> bool {
        is_ddl_statement(&self.0)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Statement {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value).ok_or_else(|| "statement text must not be blank".to_owned())
    }
}

impl From<Statement> for String {
    fn from(value: Statement) -> Self {
        value.0
    }
}

/// Keyword heuristic for DDL/DML-shaped statements.
///
/// Substring match, case-insensitive: `SELECT created_at` counts as DDL.
/// False positives only make the reducer keep more statements.
#[must_use]
pub fn is_ddl_statement(sql: &str) -> bool {
    let lowered = sql.to_lowercase();
    DDL_KEYWORDS.iter().any(|keyword| lowered.contains(keyword))
}

/// Setup script executed before every candidate; immutable for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadContext {
    script: String,
}

impl LoadContext {
    #[must_use]
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.script
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.script.trim().is_empty()
    }

    /// Full trial script: the load followed by `statements`, one per line.
    #[must_use]
    pub fn render(&self, statements: &[Statement]) -> String {
        let mut out = self.prefix();
        for statement in statements {
            out.push_str(statement.as_str());
            out.push('\n');
        }
        out
    }

    /// Full trial script with a raw, unsplit body.
    #[must_use]
    pub fn render_text(&self, body: &str) -> String {
        let mut out = self.prefix();
        out.push_str(body);
        out
    }

    fn prefix(&self) -> String {
        let load = self.script.trim();
        let mut out = String::with_capacity(load.len() + 2);
        if !load.is_empty() {
            out.push_str(load);
            if !load.ends_with(STATEMENT_TERMINATOR) {
                out.push(STATEMENT_TERMINATOR);
            }
            out.push('\n');
        }
        out
    }
}

/// Split a script on every terminator, dropping blank fragments.
#[must_use]
pub fn split_statements(text: &str) -> Vec<Statement> {
    text.split(STATEMENT_TERMINATOR)
        .filter_map(Statement::new)
        .collect()
}

/// Whether `text` holds more than one non-blank fragment.
#[must_use]
pub fn is_multi_statement(text: &str) -> bool {
    text.split(STATEMENT_TERMINATOR)
        .filter(|fragment| !fragment.trim().is_empty())
        .nth(1)
        .is_some()
}

/// Render a statement sequence as the final script text.
#[must_use]
pub fn render_statements(statements: &[Statement]) -> String {
    statements
        .iter()
        .map(Statement::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split a captured engine query log into statements.
///
/// Query logs terminate each statement with `;` followed by a newline, so
/// this splits on that pair rather than on every `;`.
#[must_use]
pub fn split_query_log(log: &str) -> Vec<Statement> {
    let cleaned = log.replace(QUERY_LOG_NOISE, "");
    cleaned
        .split(";\n")
        .filter_map(Statement::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn texts(statements: &[Statement]) -> Vec<&str> {
        statements.iter().map(Statement::as_str).collect()
    }

    #[test]
    fn split_trims_and_reterminates() {
        let statements = split_statements("  INSERT INTO t VALUES (1);\n SELECT a/0 FROM t;  ");
        assert_eq!(
            texts(&statements),
            vec!["INSERT INTO t VALUES (1);", "SELECT a/0 FROM t;"]
        );
    }

    #[test]
    fn split_drops_empty_fragments() {
        let statements = split_statements(";;SELECT 1;; ;\n;SELECT 2");
        assert_eq!(texts(&statements), vec!["SELECT 1;", "SELECT 2;"]);
    }

    #[test]
    fn multi_statement_detection() {
        assert!(!is_multi_statement("SELECT 1;"), "case=single");
        assert!(!is_multi_statement("SELECT 1;;  ;"), "case=single_with_noise");
        assert!(is_multi_statement("SELECT 1; SELECT 2"), "case=two");
        assert!(!is_multi_statement("   "), "case=blank");
    }

    #[test]
    fn statement_new_rejects_blank_and_adds_terminator() {
        assert_eq!(Statement::new("  ; "), None);
        let statement = Statement::new("SELECT 1").expect("non-blank text");
        assert_eq!(statement.as_str(), "SELECT 1;");
        let already = Statement::new("SELECT 1 ;;").expect("non-blank text");
        assert_eq!(already.as_str(), "SELECT 1;");
    }

    #[test]
    fn ddl_heuristic_matches_keywords_case_insensitively() {
        assert!(is_ddl_statement("CREATE TABLE t(a INT)"));
        assert!(is_ddl_statement("insert into t values (1)"));
        assert!(is_ddl_statement("UPDATE t SET a = 2"));
        assert!(is_ddl_statement("Delete FROM t"));
        assert!(!is_ddl_statement("SELECT a/0 FROM t"));
    }

    #[test]
    fn load_context_render_inserts_missing_terminator() {
        let load = LoadContext::new("CREATE TABLE t(a INT)\n");
        let statement = Statement::new("SELECT * FROM t").expect("statement");
        assert_eq!(
            load.render(&[statement]),
            "CREATE TABLE t(a INT);\nSELECT * FROM t;\n"
        );
        assert_eq!(
            LoadContext::empty().render_text("SELECT 1;"),
            "SELECT 1;",
            "case=empty_load_is_transparent"
        );
    }

    #[test]
    fn query_log_split_strips_version_query() {
        let log = "SELECT * FROM pragma_version()\nCREATE TABLE t(a INT);\nSELECT 1;\n";
        let statements = split_query_log(log);
        assert_eq!(texts(&statements), vec!["CREATE TABLE t(a INT);", "SELECT 1;"]);
    }

    #[test]
    fn statement_deserialization_rejects_blank() {
        let parsed: Result<Statement, _> = serde_json::from_str("\"   \"");
        assert!(parsed.is_err());
        let ok: Statement = serde_json::from_str("\"SELECT 1\"").expect("valid statement");
        assert_eq!(ok.as_str(), "SELECT 1;");
    }

    proptest! {
        #[test]
        fn split_fragments_are_terminated_and_unsplittable(text in "[a-z ;\n]{0,64}") {
            let statements = split_statements(&text);
            for statement in &statements {
                prop_assert!(statement.as_str().ends_with(';'));
                prop_assert_eq!(statement.as_str().matches(';').count(), 1);
                prop_assert!(!statement.as_str().trim_end_matches(';').trim().is_empty());
            }
            prop_assert_eq!(statements.len() > 1, is_multi_statement(&text));
        }

        #[test]
        fn resplitting_rendered_output_is_stable(text in "[a-z0-9 ;]{0,64}") {
            let statements = split_statements(&text);
            let again = split_statements(&render_statements(&statements));
            prop_assert_eq!(statements, again);
        }
    }
}
