// ABOUTME: In-memory store with the same change-tracking semantics as the PostgreSQL engine
// ABOUTME: Relations are keyed maps; set operations are hash/B-tree joins over primary keys

mod engine;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::change::{ChangeRow, Operation, TransactionSummary};
use crate::error::{ChangeError, Result};
use crate::model::TableModel;
use crate::sequencer::Sequencer;
use crate::value::{Row, Value};

/// Computes a derived column from the other columns of the same change row.
pub type DeriveFn = Arc<dyn Fn(&Row) -> Value + Send + Sync>;

/// Rows of a live table keyed by primary key.
type KeyedRows = BTreeMap<Vec<Value>, Row>;

/// One entry of the transaction history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub txid: i64,
    pub description: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: HashMap<String, KeyedRows>,
    relations: HashMap<String, Vec<Row>>,
    changes: HashMap<String, Vec<ChangeRow>>,
    transactions: Vec<TransactionRecord>,
}

/// A self-contained change-tracking store.
///
/// Live tables, their change tables, and free-standing relations (source and
/// dirty sets) are held in memory. Every operation mirrors its PostgreSQL
/// counterpart, including the constraint violations raised on replay, so the
/// engine's behaviour can be exercised without a database.
///
/// Operations mutate the store directly; use
/// [`with_import_transaction`](Self::with_import_transaction) for atomicity.
#[derive(Default)]
pub struct MemoryStore {
    state: State,
    derivers: HashMap<(String, String), DeriveFn>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the computation for derived column `column` of `table`.
    pub fn register_deriver<F>(&mut self, table: &str, column: &str, derive: F)
    where
        F: Fn(&Row) -> Value + Send + Sync + 'static,
    {
        self.derivers
            .insert((table.to_string(), column.to_string()), Arc::new(derive));
    }

    /// Fail unless every derived column of `model` has a registered deriver.
    pub fn check_derivers(&self, model: &TableModel) -> Result<()> {
        for (column, _) in model.derived_columns() {
            self.deriver(model, column)?;
        }
        Ok(())
    }

    fn deriver(&self, model: &TableModel, column: &str) -> Result<DeriveFn> {
        self.derivers
            .get(&(model.table().to_string(), column.to_string()))
            .cloned()
            .ok_or_else(|| {
                ChangeError::config(format!(
                    "No deriver registered for derived column '{}' of '{}'",
                    column,
                    model.table()
                ))
            })
    }

    // Relations

    /// Create (or empty) the live table of `model`.
    pub fn create_table(&mut self, model: &TableModel) {
        self.state
            .tables
            .insert(model.table().to_string(), KeyedRows::new());
    }

    /// Write rows straight into a live table, bypassing history.
    pub fn load_table(&mut self, model: &TableModel, rows: Vec<Row>) -> Result<usize> {
        let table = self.table_mut(model)?;
        let mut staged = KeyedRows::new();
        for row in rows {
            model.check_row(&row)?;
            let key = model.key_of(&row);
            if table.contains_key(&key) || staged.contains_key(&key) {
                return Err(duplicate_key(model, &key));
            }
            staged.insert(key, complete_row(model, &row, &model.all_column_names()));
        }
        let loaded = staged.len();
        table.extend(staged);
        Ok(loaded)
    }

    /// Store a named source or dirty relation, replacing any previous one.
    pub fn put_relation(&mut self, name: &str, rows: Vec<Row>) {
        self.state.relations.insert(name.to_string(), rows);
    }

    pub fn drop_relation(&mut self, name: &str) -> Option<Vec<Row>> {
        self.state.relations.remove(name)
    }

    /// The live rows of `model`, ordered by primary key.
    pub fn live_rows(&self, model: &TableModel) -> Result<Vec<Row>> {
        Ok(self.table(model)?.values().cloned().collect())
    }

    /// Every row of `model`'s change table, in insertion order.
    pub fn change_rows(&self, model: &TableModel) -> Result<&[ChangeRow]> {
        self.state
            .changes
            .get(model.table())
            .map(Vec::as_slice)
            .ok_or_else(|| missing_change_table(model))
    }

    fn table(&self, model: &TableModel) -> Result<&KeyedRows> {
        self.state
            .tables
            .get(model.table())
            .ok_or_else(|| missing_relation(model.table()))
    }

    fn table_mut(&mut self, model: &TableModel) -> Result<&mut KeyedRows> {
        self.state
            .tables
            .get_mut(model.table())
            .ok_or_else(|| missing_relation(model.table()))
    }

    fn changes_mut(&mut self, model: &TableModel) -> Result<&mut Vec<ChangeRow>> {
        self.state
            .changes
            .get_mut(model.table())
            .ok_or_else(|| missing_change_table(model))
    }

    /// Rows of a named relation: a stored relation first, then a live table.
    fn relation(&self, name: &str) -> Result<Vec<&Row>> {
        if let Some(rows) = self.state.relations.get(name) {
            return Ok(rows.iter().collect());
        }
        if let Some(rows) = self.state.tables.get(name) {
            return Ok(rows.values().collect());
        }
        Err(missing_relation(name))
    }

    // Row mutations

    /// Record a non-public insert carrying every column of `row`.
    pub fn insert_row(&mut self, txid: i64, model: &TableModel, row: &Row) -> Result<()> {
        self.record_row(txid, model, row, Operation::Insert, model.all_column_names())
    }

    /// Record a non-public update carrying the non-derived columns of `row`.
    pub fn update_row(&mut self, txid: i64, model: &TableModel, row: &Row) -> Result<()> {
        self.record_row(
            txid,
            model,
            row,
            Operation::Update,
            model.non_derived_column_names(),
        )
    }

    /// Record a non-public delete carrying the non-derived columns of `row`.
    pub fn delete_row(&mut self, txid: i64, model: &TableModel, row: &Row) -> Result<()> {
        self.record_row(
            txid,
            model,
            row,
            Operation::Delete,
            model.non_derived_column_names(),
        )
    }

    fn record_row(
        &mut self,
        txid: i64,
        model: &TableModel,
        row: &Row,
        operation: Operation,
        columns: Vec<&str>,
    ) -> Result<()> {
        model.check_row(row)?;
        let data = complete_row(model, row, &columns);
        self.changes_mut(model)?.push(ChangeRow {
            txid,
            changeid: None,
            operation,
            public: false,
            data,
        });
        tracing::debug!(
            "Recorded non-public {} in {} (txid {})",
            operation,
            model.change_table(),
            txid
        );
        Ok(())
    }

    // Lifecycle

    /// Create (or empty) the change table of `model`.
    ///
    /// The live table must exist and every derived column needs a deriver.
    pub fn create_change_table(&mut self, model: &TableModel) -> Result<()> {
        self.table(model)?;
        self.check_derivers(model)?;
        self.state
            .changes
            .insert(model.table().to_string(), Vec::new());
        tracing::info!("Created change table {}", model.change_table());
        Ok(())
    }

    /// Seed a non-public insert per live row, then derive.
    pub fn init_change_table(&mut self, txid: i64, model: &TableModel) -> Result<u64> {
        let seeded = self.initialize_change_table(txid, model)?;
        self.derive_columns_for_change(txid, model)?;
        Ok(seeded)
    }

    /// Seed a non-public insert per live row without deriving.
    pub fn initialize_change_table(&mut self, txid: i64, model: &TableModel) -> Result<u64> {
        let snapshot: Vec<ChangeRow> = self
            .table(model)?
            .values()
            .map(|row| ChangeRow {
                txid,
                changeid: None,
                operation: Operation::Insert,
                public: false,
                data: row.clone(),
            })
            .collect();
        let seeded = snapshot.len() as u64;
        self.changes_mut(model)?.extend(snapshot);
        tracing::info!(
            "Seeded {} with {} rows from {} (txid {})",
            model.change_table(),
            seeded,
            model.table(),
            txid
        );
        Ok(seeded)
    }

    /// First full load from `source`: non-public inserts, derive, apply.
    pub fn initialize_from_scratch(
        &mut self,
        txid: i64,
        source: &str,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<u64> {
        let columns = match columns {
            Some(columns) => {
                model.check_columns(columns)?;
                columns.to_vec()
            }
            None => model.non_derived_column_names(),
        };
        let loaded: Vec<ChangeRow> = self
            .relation(source)?
            .into_iter()
            .map(|row| ChangeRow {
                txid,
                changeid: None,
                operation: Operation::Insert,
                public: false,
                data: complete_row(model, row, &columns),
            })
            .collect();
        let count = loaded.len() as u64;
        self.changes_mut(model)?.extend(loaded);
        self.derive_columns_for_change(txid, model)?;
        self.apply_changes(txid, model)?;
        tracing::info!(
            "Initialized {} from {} with {} rows (txid {})",
            model.table(),
            source,
            count,
            txid
        );
        Ok(count)
    }

    /// Drop all history and re-seed a non-public snapshot under `txid`.
    pub fn clear_history(&mut self, txid: i64, model: &TableModel) -> Result<u64> {
        let changes = self.changes_mut(model)?;
        let removed = changes.len();
        changes.clear();
        tracing::info!("Removed {} history rows from {}", removed, model.change_table());
        self.initialize_change_table(txid, model)
    }

    pub fn count_changes(&self, txid: i64, model: &TableModel) -> Result<i64> {
        Ok(self
            .change_rows(model)?
            .iter()
            .filter(|c| c.txid == txid)
            .count() as i64)
    }

    pub fn make_changes_non_public(&mut self, txid: i64, model: &TableModel) -> Result<u64> {
        let mut hidden = 0;
        for change in self.changes_mut(model)?.iter_mut() {
            if change.txid == txid && change.public {
                change.public = false;
                hidden += 1;
            }
        }
        Ok(hidden)
    }

    /// Copy live values of `columns` onto each key's latest change row.
    pub fn refresh_latest_from_live(&mut self, model: &TableModel, columns: &[&str]) -> Result<u64> {
        model.check_columns(columns)?;
        if let Some(key) = columns.iter().find(|c| model.is_primary_key(c)) {
            return Err(ChangeError::config(format!(
                "Primary key column '{}' of '{}' cannot be refreshed",
                key,
                model.entity()
            )));
        }
        let live = self.table(model)?.clone();
        let changes = self.changes_mut(model)?;

        let mut latest: HashMap<Vec<Value>, usize> = HashMap::new();
        for (index, change) in changes.iter().enumerate() {
            let key = change.key(model);
            if !live.contains_key(&key) {
                continue;
            }
            let newer = match latest.get(&key) {
                Some(&current) => recency(change) > recency(&changes[current]),
                None => true,
            };
            if newer {
                latest.insert(key, index);
            }
        }

        let mut refreshed = 0;
        for (key, index) in latest {
            if let Some(row) = live.get(&key) {
                for column in columns {
                    let value = row.get(*column).cloned().unwrap_or(Value::Null);
                    changes[index].data.insert(column.to_string(), value);
                }
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    // Import transactions

    /// Allocate and record the next txid.
    pub fn begin_import(&mut self, description: &str) -> i64 {
        let txid = self
            .state
            .transactions
            .iter()
            .map(|t| t.txid)
            .max()
            .unwrap_or(0)
            + 1;
        self.state.transactions.push(TransactionRecord {
            txid,
            description: description.to_string(),
            time: Utc::now(),
        });
        tracing::info!("Began import transaction {}: {}", txid, description);
        txid
    }

    /// Sequence every change row of `txid` across `ordered`.
    pub fn finish_import(&mut self, txid: i64, ordered: &[&TableModel]) -> Result<u64> {
        let mut sequencer = self.resume_sequencer();
        let sequenced = self.assign_sequence_numbers(&mut sequencer, txid, ordered)?;
        tracing::info!(
            "Finished import transaction {} ({} change rows sequenced)",
            txid,
            sequenced
        );
        Ok(sequenced)
    }

    /// Run `work` as one atomic import.
    ///
    /// A txid is allocated, `work` runs, and the transaction's change rows are
    /// sequenced across `ordered`. If any step fails the store is restored to
    /// its state before the call.
    pub fn with_import_transaction<T, F>(
        &mut self,
        description: &str,
        ordered: &[&TableModel],
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Self, i64) -> Result<T>,
    {
        let snapshot = self.state.clone();
        let txid = self.begin_import(description);
        let outcome = work(self, txid).and_then(|value| {
            self.finish_import(txid, ordered)?;
            Ok(value)
        });
        if let Err(e) = &outcome {
            tracing::warn!("Rolling back import transaction {}: {}", txid, e);
            self.state = snapshot;
        }
        outcome
    }

    pub fn transactions(&self) -> &[TransactionRecord] {
        &self.state.transactions
    }

    /// Seed a [`Sequencer`] from the highest changeid in any change table of
    /// the store, so tables synced separately never share an id.
    pub fn resume_sequencer(&self) -> Sequencer {
        let highest = self
            .state
            .changes
            .values()
            .flatten()
            .filter_map(|c| c.changeid)
            .max()
            .unwrap_or(0);
        Sequencer::starting_after(highest)
    }

    // Replication reads

    /// Public change rows with `from <= changeid <= to`, in changeid order.
    pub fn events(
        &self,
        model: &TableModel,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<ChangeRow>> {
        let from = from.unwrap_or(i64::MIN);
        let to = to.unwrap_or(i64::MAX);
        let mut events: Vec<ChangeRow> = self
            .change_rows(model)?
            .iter()
            .filter(|c| c.public && c.changeid.map_or(false, |id| id >= from && id <= to))
            .cloned()
            .collect();
        events.sort_by_key(|c| c.changeid);
        Ok(events)
    }

    /// Table state ordered by primary key: live when `as_of` is `None`,
    /// otherwise rebuilt from history as of changeid `as_of`.
    pub fn extract(&self, model: &TableModel, as_of: Option<i64>) -> Result<Vec<Row>> {
        let Some(as_of) = as_of else {
            return self.live_rows(model);
        };
        let changes = self.change_rows(model)?;
        let Some(horizon) = extract_horizon(changes, as_of) else {
            return Ok(Vec::new());
        };

        let mut latest: BTreeMap<Vec<Value>, &ChangeRow> = BTreeMap::new();
        for change in changes
            .iter()
            .filter(|c| c.txid <= horizon && c.changeid.map_or(true, |id| id <= as_of))
        {
            let key = change.key(model);
            let newer = latest
                .get(&key)
                .map_or(true, |current| recency(change) > recency(current));
            if newer {
                latest.insert(key, change);
            }
        }
        Ok(latest
            .into_values()
            .filter(|c| c.operation != Operation::Delete)
            .map(|c| c.data.clone())
            .collect())
    }

    pub fn transaction_summary(
        &self,
        txid: i64,
        models: &[&TableModel],
    ) -> Result<Vec<TransactionSummary>> {
        models
            .iter()
            .map(|model| {
                let mut summary = TransactionSummary {
                    entity: model.entity().to_string(),
                    ..Default::default()
                };
                for change in self.change_rows(model)?.iter().filter(|c| c.txid == txid) {
                    match change.operation {
                        Operation::Insert => summary.inserts += 1,
                        Operation::Update => summary.updates += 1,
                        Operation::Delete => summary.deletes += 1,
                    }
                }
                Ok(summary)
            })
            .collect()
    }
}

/// Latest-first ordering of change rows: txid, then changeid with unset ids
/// ranking below any assigned one.
fn recency(change: &ChangeRow) -> (i64, Option<i64>) {
    (change.txid, change.changeid)
}

/// The txid bounding a point-in-time extract at `as_of`: the transaction that
/// produced `as_of`, else the one before the first later transaction, else
/// the newest.
fn extract_horizon(changes: &[ChangeRow], as_of: i64) -> Option<i64> {
    let sequenced_upto = changes
        .iter()
        .filter(|c| c.changeid.map_or(false, |id| id <= as_of))
        .map(|c| c.txid)
        .max();
    let before_later = changes
        .iter()
        .filter(|c| c.changeid.map_or(false, |id| id > as_of))
        .map(|c| c.txid - 1)
        .min();
    let newest = changes.iter().map(|c| c.txid).max();
    sequenced_upto.or(before_later).or(newest)
}

/// A full row image over the model's columns: `columns` copied from `row`,
/// everything else NULL.
fn complete_row(model: &TableModel, row: &Row, columns: &[&str]) -> Row {
    model
        .all_column_names()
        .into_iter()
        .map(|name| {
            let value = if columns.contains(&name) {
                row.get(name).cloned().unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            (name.to_string(), value)
        })
        .collect()
}

fn duplicate_key(model: &TableModel, key: &[Value]) -> ChangeError {
    ChangeError::constraint(
        model.table(),
        format!("duplicate key {:?} violates primary key of {}", key, model.table()),
    )
}

fn missing_relation(name: &str) -> ChangeError {
    ChangeError::config(format!("relation \"{}\" does not exist", name))
}

fn missing_change_table(model: &TableModel) -> ChangeError {
    ChangeError::config(format!(
        "change table \"{}\" does not exist",
        model.change_table()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::ejerlav;
    use crate::value::row;

    fn change(txid: i64, changeid: Option<i64>, operation: Operation, kode: i64) -> ChangeRow {
        ChangeRow {
            txid,
            changeid,
            operation,
            public: true,
            data: row([("kode", Value::from(kode))]),
        }
    }

    #[test]
    fn test_extract_horizon() {
        let changes = vec![
            change(1, None, Operation::Insert, 60851),
            change(2, Some(1), Operation::Insert, 1),
            change(2, Some(2), Operation::Insert, 2),
            change(3, Some(3), Operation::Update, 1),
            change(4, Some(4), Operation::Delete, 1),
        ];
        assert_eq!(extract_horizon(&changes, 3), Some(3));
        assert_eq!(extract_horizon(&changes, 0), Some(1));
        assert_eq!(extract_horizon(&changes, 99), Some(4));
        assert_eq!(extract_horizon(&[], 1), None);
    }

    #[test]
    fn test_complete_row_nulls_unlisted_columns() {
        let model = ejerlav();
        let full = complete_row(
            &model,
            &row([("kode", Value::from(1)), ("navn", Value::from("foo"))]),
            &["kode"],
        );
        assert_eq!(full.len(), 3);
        assert_eq!(full["kode"], Value::from(1));
        assert!(full["navn"].is_null());
        assert!(full["tsv"].is_null());
    }

    #[test]
    fn test_create_change_table_requires_derivers() {
        let model = ejerlav();
        let mut store = MemoryStore::new();
        store.create_table(&model);
        let err = store.create_change_table(&model).unwrap_err();
        assert!(matches!(err, ChangeError::Configuration(_)));

        store.register_deriver("ejerlav", "tsv", |r| r.get("navn").cloned().unwrap_or(Value::Null));
        assert!(store.create_change_table(&model).is_ok());
    }

    #[test]
    fn test_load_table_rejects_duplicate_keys() {
        let model = ejerlav();
        let mut store = MemoryStore::new();
        store.create_table(&model);
        let rows = vec![
            row([("kode", Value::from(1))]),
            row([("kode", Value::from(1))]),
        ];
        assert!(store.load_table(&model, rows).unwrap_err().is_constraint_violation());
        assert!(store.live_rows(&model).unwrap().is_empty());
    }
}
