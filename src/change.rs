// ABOUTME: Change-row types: the operation kind and one recorded row of history
// ABOUTME: Also the diff, apply, and per-transaction counts reported by both stores

use crate::error::{ChangeError, Result};
use crate::model::TableModel;
use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the side relation holding a table's history.
pub fn change_table_name(table: &str) -> String {
    format!("{}_changes", table)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Insert, Operation::Update, Operation::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ChangeError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(ChangeError::config(format!("unknown change operation: {other}"))),
        }
    }
}

/// One row of a change table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRow {
    pub txid: i64,
    /// Unset until the row has been sequenced.
    pub changeid: Option<i64>,
    pub operation: Operation,
    pub public: bool,
    pub data: Row,
}

impl ChangeRow {
    /// The row's primary key values, in model key order.
    pub fn key(&self, model: &TableModel) -> Vec<Value> {
        model.key_of(&self.data)
    }

    pub fn get(&self, column: &str) -> &Value {
        self.data.get(column).unwrap_or(&Value::Null)
    }
}

/// Row counts produced by one composite diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl DiffStats {
    pub fn total(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Live-table rows touched by one apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub deleted: u64,
    pub updated: u64,
    pub inserted: u64,
}

/// Per-table operation counts for one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionSummary {
    pub entity: String,
    pub inserts: i64,
    pub updates: i64,
    pub deletes: i64,
}

impl TransactionSummary {
    pub fn total(&self) -> i64 {
        self.inserts + self.updates + self.deletes
    }
}

/// Fail with a constraint violation when a replay phase touched a different
/// number of live rows than it recorded.
pub(crate) fn check_replay_count(
    model: &TableModel,
    operation: Operation,
    expected: u64,
    actual: u64,
) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    Err(ChangeError::constraint(
        model.table(),
        format!(
            "{} change rows recorded {} {}s but {} live rows matched",
            model.change_table(),
            expected,
            operation,
            actual
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::ejerlav;

    #[test]
    fn test_operation_round_trips_through_text() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn test_change_table_name() {
        assert_eq!(change_table_name("ejerlav"), "ejerlav_changes");
    }

    #[test]
    fn test_operation_serializes_lowercase() {
        let json = serde_json::to_string(&Operation::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
    }

    #[test]
    fn test_summary_total() {
        let summary = TransactionSummary {
            entity: "ejerlav".into(),
            inserts: 2,
            updates: 1,
            deletes: 0,
        };
        assert_eq!(summary.total(), 3);
    }

    #[test]
    fn test_check_count_reports_mismatch() {
        assert!(check_replay_count(&ejerlav(), Operation::Delete, 2, 2).is_ok());
        let err = check_replay_count(&ejerlav(), Operation::Delete, 2, 1).unwrap_err();
        assert!(err.is_constraint_violation());
        assert!(err.to_string().contains("ejerlav_changes change rows recorded 2 deletes but 1 live rows matched"));
    }
}
