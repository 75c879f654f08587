use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mappings::Row;

/// Bind parameter for an external query. Placeholders are written `$1..$N`
/// regardless of dialect.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// Uniform result shape across dialects.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let row_count = rows.len();
        Self { rows, row_count }
    }
}

/// Outcome of the grants audit run before sync starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivilegeReport {
    /// True only when grants were inspected and none of them allow writes.
    pub safe: bool,
    pub grants: Vec<String>,
    pub dangerous: Vec<String>,
    /// Set when the grants could not be inspected at all.
    pub error: Option<String>,
}

impl PrivilegeReport {
    pub fn inspected(grants: Vec<String>) -> Self {
        let dangerous: Vec<String> = grants
            .iter()
            .filter(|g| super::dialect::is_dangerous_grant(g))
            .cloned()
            .collect();
        Self {
            safe: dangerous.is_empty(),
            grants,
            dangerous,
            error: None,
        }
    }

    pub fn uninspected(error: impl Into<String>) -> Self {
        Self {
            safe: false,
            grants: Vec::new(),
            dangerous: Vec::new(),
            error: Some(error.into()),
        }
    }
}
