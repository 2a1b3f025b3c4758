//! Static safety and shape checks for generated SQL.
//!
//! The generation model is untrusted: it can emit destructive statements,
//! chained statements, or a query against the wrong source table. Every
//! generated string passes through `validate_sql` before it is allowed
//! anywhere near the warehouse. The checks are purely textual, stateless,
//! and deterministic: identical input always yields identical output.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Statement fragments that must never appear in generated SQL.
const FORBIDDEN_PATTERNS: &[&str] = &[
    "DROP TABLE",
    "DELETE FROM",
    "TRUNCATE",
    "ALTER TABLE",
    "CREATE TABLE",
];

/// Substrings that indicate comment tricks, statement chaining, or stored
/// procedure calls. Generated SQL is expected to be one bare statement.
const SUSPICIOUS_SUBSTRINGS: &[&str] = &[";", "--", "/*", "*/", "xp_", "sp_"];

/// Severity of a validation warning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Fails validation; the SQL must not execute.
    Blocking,
    /// Informational only; never blocks.
    Info,
}

/// One validation finding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
    pub severity: Severity,
}

impl ValidationWarning {
    fn blocking(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Blocking,
        }
    }

    fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Info,
        }
    }
}

/// Structured record of what the checks observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationDetails {
    pub has_select: bool,
    pub has_from: bool,
    pub has_count: bool,
    pub has_group_by: bool,
    pub references_cohort_table: bool,
    pub has_join: bool,
    pub parentheses_balanced: bool,
    /// Identifiers found after FROM/JOIN, normalized to lowercase.
    pub tables_referenced: Vec<String>,
    /// `alias.column` references found, normalized to lowercase.
    pub columns_referenced: Vec<String>,
    /// Whether at least one referenced table was in the expected set
    /// (`true` when no expected set was supplied).
    pub expected_table_matched: bool,
}

/// Result of validating one generated SQL string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub warnings: Vec<ValidationWarning>,
    pub details: ValidationDetails,
}

impl ValidationResult {
    pub fn blocking_messages(&self) -> Vec<&str> {
        self.warnings
            .iter()
            .filter(|w| w.severity == Severity::Blocking)
            .map(|w| w.message.as_str())
            .collect()
    }
}

/// Validate one generated SQL string for a dimension query.
///
/// `cohort_table` is the identifier that must appear verbatim (quoting
/// characters ignored). `expected_tables`, when supplied, is the set of
/// source tables a correct query for this dimension reads from; a query
/// touching none of them is silently wrong and is blocked. The optional
/// `column_allowlist` maps a table alias to the columns allowed through it.
pub fn validate_sql(
    sql: &str,
    dimension: &str,
    cohort_table: &str,
    expected_tables: Option<&[&str]>,
    column_allowlist: Option<&HashMap<String, Vec<String>>>,
) -> ValidationResult {
    let mut warnings = Vec::new();
    let mut details = ValidationDetails::default();

    // Strip quoting characters so quoted identifiers compare verbatim.
    let unquoted: String = sql.chars().filter(|c| !matches!(c, '"' | '`')).collect();
    let upper = unquoted.to_uppercase();

    // Required clause shapes.
    details.has_select = upper.contains("SELECT");
    details.has_from = upper.contains("FROM");
    details.has_count = upper.contains("COUNT");
    details.has_group_by = upper.contains("GROUP BY");
    for (present, clause) in [
        (details.has_select, "SELECT"),
        (details.has_from, "FROM"),
        (details.has_count, "COUNT"),
        (details.has_group_by, "GROUP BY"),
    ] {
        if !present {
            warnings.push(ValidationWarning::blocking(format!(
                "{dimension}: required clause {clause} not found"
            )));
        }
    }

    // Destructive statements.
    for pattern in FORBIDDEN_PATTERNS {
        if upper.contains(pattern) {
            warnings.push(ValidationWarning::blocking(format!(
                "{dimension}: forbidden statement '{pattern}' present"
            )));
        }
    }
    // UPDATE ... SET needs a pattern match since arbitrary text sits between.
    let update_set = Regex::new(r"(?i)\bUPDATE\b[\s\S]*?\bSET\b").expect("static regex");
    if update_set.is_match(&unquoted) {
        warnings.push(ValidationWarning::blocking(format!(
            "{dimension}: forbidden statement 'UPDATE ... SET' present"
        )));
    }

    // Structural checks.
    details.references_cohort_table = upper.contains(&cohort_table.to_uppercase());
    if !details.references_cohort_table {
        warnings.push(ValidationWarning::blocking(format!(
            "{dimension}: cohort table '{cohort_table}' is not referenced"
        )));
    }

    details.has_join = upper.contains("JOIN");
    if !details.has_join {
        warnings.push(ValidationWarning::blocking(format!(
            "{dimension}: no JOIN found; dimension queries must join the cohort table"
        )));
    }

    details.parentheses_balanced = parentheses_balanced(&unquoted);
    if !details.parentheses_balanced {
        warnings.push(ValidationWarning::blocking(format!(
            "{dimension}: unbalanced parentheses"
        )));
    }

    for suspicious in SUSPICIOUS_SUBSTRINGS {
        if unquoted.contains(suspicious) {
            warnings.push(ValidationWarning::blocking(format!(
                "{dimension}: suspicious substring '{suspicious}' present"
            )));
        }
    }

    // Table selection.
    details.tables_referenced = extract_source_tables(&unquoted);
    details.expected_table_matched = match expected_tables {
        Some(expected) => {
            let matched = details.tables_referenced.iter().any(|table| {
                expected
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(table))
            });
            if !matched {
                warnings.push(ValidationWarning::blocking(format!(
                    "{dimension}: none of the expected source tables ({}) are referenced",
                    expected.join(", ")
                )));
            }
            matched
        }
        None => true,
    };

    // Column allow-list (strict mode).
    details.columns_referenced = extract_alias_columns(&unquoted);
    if let Some(allowlist) = column_allowlist {
        for reference in &details.columns_referenced {
            let (alias, column) = match reference.split_once('.') {
                Some(pair) => pair,
                None => continue,
            };
            if let Some(allowed) = allowlist.get(alias) {
                if !allowed.iter().any(|a| a.eq_ignore_ascii_case(column)) {
                    warnings.push(ValidationWarning::blocking(format!(
                        "{dimension}: column '{column}' is not allowed through alias '{alias}'"
                    )));
                }
            }
        }
    }

    // Informational only.
    if !upper.contains("PERCENTAGE") && !upper.contains("100.0") && !upper.contains("100 *") {
        warnings.push(ValidationWarning::info(format!(
            "{dimension}: no percentage calculation found"
        )));
    }

    let is_valid = !warnings.iter().any(|w| w.severity == Severity::Blocking);
    ValidationResult {
        is_valid,
        warnings,
        details,
    }
}

fn parentheses_balanced(sql: &str) -> bool {
    let mut depth: i64 = 0;
    for c in sql.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Extract identifiers following FROM/JOIN. Qualified names keep only their
/// final segment so `catalog.schema.patients` compares as `patients`.
fn extract_source_tables(sql: &str) -> Vec<String> {
    let pattern = Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_.]*)").expect("static regex");
    let mut tables = Vec::new();
    for capture in pattern.captures_iter(sql) {
        let raw = &capture[1];
        let table = raw.rsplit('.').next().unwrap_or(raw).to_lowercase();
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    tables
}

/// Extract `alias.column` references for allow-list checks. Multi-segment
/// names are table qualifiers, not alias references, and are skipped.
fn extract_alias_columns(sql: &str) -> Vec<String> {
    let pattern =
        Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b").expect("static regex");
    let mut columns = Vec::new();
    for capture in pattern.captures_iter(sql) {
        let whole = capture.get(0).expect("capture 0");
        // Skip when part of a longer dotted chain.
        let after = sql[whole.end()..].chars().next();
        let before = sql[..whole.start()].chars().next_back();
        if after == Some('.') || before == Some('.') {
            continue;
        }
        let reference = format!(
            "{}.{}",
            capture[1].to_lowercase(),
            capture[2].to_lowercase()
        );
        if !columns.contains(&reference) {
            columns.push(reference);
        }
    }
    columns
}
