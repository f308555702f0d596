// ABOUTME: Diff, derive, apply, and sequencing for the in-memory store
// ABOUTME: Key-set differences and intersections run over B-tree maps keyed by primary key

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::{complete_row, duplicate_key, MemoryStore};
use crate::change::{check_replay_count, ApplyStats, ChangeRow, DiffStats, Operation};
use crate::error::{ChangeError, Result};
use crate::model::TableModel;
use crate::sequencer::{sequencing_plan, Sequencer};
use crate::value::{is_distinct_from, Row, Value};

type Keyed<'r> = BTreeMap<Vec<Value>, &'r Row>;

fn value<'r>(row: &'r Row, column: &str) -> &'r Value {
    row.get(column).unwrap_or(&Value::Null)
}

fn any_distinct(before: &Row, after: &Row, columns: &[&str]) -> bool {
    columns
        .iter()
        .any(|c| is_distinct_from(value(before, c), value(after, c)))
}

impl MemoryStore {
    /// Rows of `relation` keyed by `model`'s primary key, narrowed to `dirty`.
    ///
    /// A key occurring twice is a constraint violation. PostgreSQL reports the
    /// same source later, when the duplicated inserts are applied.
    fn keyed<'r>(
        &'r self,
        model: &TableModel,
        relation: &str,
        dirty: Option<&HashSet<Vec<Value>>>,
    ) -> Result<Keyed<'r>> {
        let mut keyed = Keyed::new();
        for row in self.relation(relation)? {
            let key = model.key_of(row);
            if dirty.map_or(false, |d| !d.contains(&key)) {
                continue;
            }
            if keyed.contains_key(&key) {
                return Err(ChangeError::constraint(
                    relation,
                    format!("duplicate key {:?} in {} for {}", key, relation, model.table()),
                ));
            }
            keyed.insert(key, row);
        }
        Ok(keyed)
    }

    fn dirty_keys(&self, model: &TableModel, dirty: Option<&str>) -> Result<Option<HashSet<Vec<Value>>>> {
        let Some(dirty) = dirty else {
            return Ok(None);
        };
        Ok(Some(
            self.relation(dirty)?
                .into_iter()
                .map(|row| model.key_of(row))
                .collect(),
        ))
    }

    fn record(&mut self, model: &TableModel, rows: Vec<ChangeRow>) -> Result<u64> {
        let count = rows.len() as u64;
        self.changes_mut(model)?.extend(rows);
        Ok(count)
    }

    // Inserts

    pub fn compute_inserts(
        &mut self,
        txid: i64,
        source: &str,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<u64> {
        self.inserts(txid, source, model.table(), None, model, columns)
    }

    pub fn compute_inserts_subset(
        &mut self,
        txid: i64,
        source: &str,
        dirty: &str,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<u64> {
        self.inserts(txid, source, model.table(), Some(dirty), model, columns)
    }

    fn inserts(
        &mut self,
        txid: i64,
        source: &str,
        target: &str,
        dirty: Option<&str>,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<u64> {
        let projection = model.insert_projection(columns)?;
        // Derived columns stay NULL until recomputed
        let from_source: Vec<&str> = projection
            .into_iter()
            .filter(|c| model.column(c).map_or(false, |col| !col.is_derived()))
            .collect();

        let dirty = self.dirty_keys(model, dirty)?;
        let after = self.keyed(model, source, dirty.as_ref())?;
        let before = self.keyed(model, target, dirty.as_ref())?;
        let rows: Vec<ChangeRow> = after
            .iter()
            .filter(|(key, _)| !before.contains_key(*key))
            .map(|(_, row)| ChangeRow {
                txid,
                changeid: None,
                operation: Operation::Insert,
                public: true,
                data: complete_row(model, row, &from_source),
            })
            .collect();

        let inserted = self.record(model, rows)?;
        tracing::debug!("{} insert rows recorded for {}", inserted, model.table());
        Ok(inserted)
    }

    // Updates

    pub fn compute_updates(
        &mut self,
        txid: i64,
        source: &str,
        model: &TableModel,
        non_preserved: Option<&[&str]>,
    ) -> Result<u64> {
        self.updates(txid, source, model.table(), None, model, non_preserved)
    }

    pub fn compute_updates_subset(
        &mut self,
        txid: i64,
        source: &str,
        dirty: &str,
        model: &TableModel,
        non_preserved: Option<&[&str]>,
    ) -> Result<u64> {
        self.updates(txid, source, model.table(), Some(dirty), model, non_preserved)
    }

    fn updates(
        &mut self,
        txid: i64,
        source: &str,
        target: &str,
        dirty: Option<&str>,
        model: &TableModel,
        non_preserved: Option<&[&str]>,
    ) -> Result<u64> {
        let split = model.update_split(non_preserved)?;
        let compared = model.compared_column_names();
        if compared.is_empty() {
            tracing::debug!(
                "{} has no compared columns, skipping update detection",
                model.table()
            );
            return Ok(0);
        }
        let public_compared = model.public_compared_column_names();
        let all_public = !model.has_non_public_columns();

        let dirty = self.dirty_keys(model, dirty)?;
        let before = self.keyed(model, target, dirty.as_ref())?;
        let source_rows = self.keyed(model, source, dirty.as_ref())?;

        let mut rows = Vec::new();
        for (key, before_row) in &before {
            let Some(source_row) = source_rows.get(key) else {
                continue;
            };
            let mut after = Row::new();
            for column in &split.from_source {
                after.insert(column.to_string(), value(source_row, column).clone());
            }
            for column in &split.preserved {
                after.insert(column.to_string(), value(before_row, column).clone());
            }
            if !any_distinct(before_row, &after, &compared) {
                continue;
            }
            let public = all_public || any_distinct(before_row, &after, &public_compared);
            let stored: Vec<&str> = split
                .from_source
                .iter()
                .chain(split.preserved.iter())
                .copied()
                .collect();
            rows.push(ChangeRow {
                txid,
                changeid: None,
                operation: Operation::Update,
                public,
                data: complete_row(model, &after, &stored),
            });
        }

        let updated = self.record(model, rows)?;
        tracing::debug!("{} update rows recorded for {}", updated, model.table());
        Ok(updated)
    }

    // Deletes

    pub fn compute_deletes(&mut self, txid: i64, source: &str, model: &TableModel) -> Result<u64> {
        self.deletes(txid, source, model.table(), None, model)
    }

    pub fn compute_deletes_subset(
        &mut self,
        txid: i64,
        source: &str,
        dirty: &str,
        model: &TableModel,
    ) -> Result<u64> {
        self.deletes(txid, source, model.table(), Some(dirty), model)
    }

    fn deletes(
        &mut self,
        txid: i64,
        source: &str,
        target: &str,
        dirty: Option<&str>,
        model: &TableModel,
    ) -> Result<u64> {
        let dirty = self.dirty_keys(model, dirty)?;
        let before = self.keyed(model, target, dirty.as_ref())?;
        let after = self.keyed(model, source, dirty.as_ref())?;
        let all = model.all_column_names();
        let rows: Vec<ChangeRow> = before
            .iter()
            .filter(|(key, _)| !after.contains_key(*key))
            .map(|(_, row)| ChangeRow {
                txid,
                changeid: None,
                operation: Operation::Delete,
                public: true,
                data: complete_row(model, row, &all),
            })
            .collect();

        let deleted = self.record(model, rows)?;
        tracing::debug!("{} delete rows recorded for {}", deleted, model.table());
        Ok(deleted)
    }

    // Composite diffs

    /// Inserts, then updates, then deletes against the live table.
    pub fn compute_differences(
        &mut self,
        txid: i64,
        source: &str,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<DiffStats> {
        self.differences(txid, source, model.table(), None, model, columns)
    }

    pub fn compute_differences_subset(
        &mut self,
        txid: i64,
        source: &str,
        dirty: &str,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<DiffStats> {
        self.differences(txid, source, model.table(), Some(dirty), model, columns)
    }

    /// Composite diff against `target` instead of the live table.
    pub fn compute_differences_view(
        &mut self,
        txid: i64,
        source: &str,
        target: &str,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<DiffStats> {
        self.differences(txid, source, target, None, model, columns)
    }

    fn differences(
        &mut self,
        txid: i64,
        source: &str,
        target: &str,
        dirty: Option<&str>,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<DiffStats> {
        let stats = DiffStats {
            inserts: self.inserts(txid, source, target, dirty, model, columns)?,
            updates: self.updates(txid, source, target, dirty, model, columns)?,
            deletes: self.deletes(txid, source, target, dirty, model)?,
        };
        tracing::info!(
            "Diffed {} against {} (txid {}): {} inserts, {} updates, {} deletes",
            source,
            target,
            txid,
            stats.inserts,
            stats.updates,
            stats.deletes
        );
        Ok(stats)
    }

    // Derive

    /// Recompute derived columns on the inserts and updates of `txid`.
    ///
    /// Every deriver sees the row as it was before this pass.
    pub fn derive_columns_for_change(&mut self, txid: i64, model: &TableModel) -> Result<u64> {
        let derivers = model
            .derived_columns()
            .map(|(column, _)| Ok((column.to_string(), self.deriver(model, column)?)))
            .collect::<Result<Vec<_>>>()?;
        if derivers.is_empty() {
            return Ok(0);
        }

        let mut derived = 0;
        for change in self.changes_mut(model)?.iter_mut() {
            if change.txid != txid || change.operation == Operation::Delete {
                continue;
            }
            let computed: Vec<(String, Value)> = derivers
                .iter()
                .map(|(column, derive)| (column.clone(), derive(&change.data)))
                .collect();
            change.data.extend(computed);
            derived += 1;
        }
        Ok(derived)
    }

    // Apply

    /// Apply deletes, updates and inserts recorded for `txid`, in that order.
    pub fn apply_changes(&mut self, txid: i64, model: &TableModel) -> Result<ApplyStats> {
        let deleted = self.apply_deletes(txid, model)?;
        let updated = self.apply_updates(txid, model)?;
        let inserted = self.apply_inserts(txid, model)?;
        tracing::info!(
            "Applied txid {} to {}: {} deleted, {} updated, {} inserted",
            txid,
            model.table(),
            deleted,
            updated,
            inserted
        );
        Ok(ApplyStats {
            deleted,
            updated,
            inserted,
        })
    }

    fn recorded(&self, txid: i64, model: &TableModel, operation: Operation) -> Result<Vec<ChangeRow>> {
        Ok(self
            .change_rows(model)?
            .iter()
            .filter(|c| c.txid == txid && c.operation == operation)
            .cloned()
            .collect())
    }

    pub fn apply_deletes(&mut self, txid: i64, model: &TableModel) -> Result<u64> {
        let recorded = self.recorded(txid, model, Operation::Delete)?;
        let table = self.table_mut(model)?;
        let matched: BTreeSet<Vec<Value>> = recorded
            .iter()
            .map(|c| c.key(model))
            .filter(|key| table.contains_key(key))
            .collect();
        check_replay_count(model, Operation::Delete, recorded.len() as u64, matched.len() as u64)?;
        for key in &matched {
            table.remove(key);
        }
        Ok(matched.len() as u64)
    }

    pub fn apply_updates(&mut self, txid: i64, model: &TableModel) -> Result<u64> {
        let columns = model.non_primary_column_names();
        if columns.is_empty() {
            return Ok(0);
        }
        let recorded = self.recorded(txid, model, Operation::Update)?;
        let table = self.table_mut(model)?;
        let mut matched: BTreeMap<Vec<Value>, &ChangeRow> = BTreeMap::new();
        for change in &recorded {
            let key = change.key(model);
            if table.contains_key(&key) {
                matched.insert(key, change);
            }
        }
        check_replay_count(model, Operation::Update, recorded.len() as u64, matched.len() as u64)?;
        for (key, change) in &matched {
            if let Some(row) = table.get_mut(key) {
                for column in &columns {
                    row.insert(column.to_string(), change.get(column).clone());
                }
            }
        }
        Ok(matched.len() as u64)
    }

    pub fn apply_inserts(&mut self, txid: i64, model: &TableModel) -> Result<u64> {
        let recorded = self.recorded(txid, model, Operation::Insert)?;
        let all = model.all_column_names();
        let table = self.table_mut(model)?;
        let mut staged = BTreeMap::new();
        for change in &recorded {
            let key = change.key(model);
            if table.contains_key(&key) || staged.contains_key(&key) {
                return Err(duplicate_key(model, &key));
            }
            staged.insert(key, complete_row(model, &change.data, &all));
        }
        let inserted = staged.len() as u64;
        table.extend(staged);
        Ok(inserted)
    }

    // Sequencing

    /// Give every unsequenced change row of `txid` a changeid, deletes in
    /// reverse table order and inserts/updates in declared order, each group
    /// ordered by primary key.
    pub fn assign_sequence_numbers(
        &mut self,
        sequencer: &mut Sequencer,
        txid: i64,
        ordered: &[&TableModel],
    ) -> Result<u64> {
        let mut total = 0;
        for (model, operation) in sequencing_plan(ordered) {
            let changes = self.changes_mut(model)?;
            let mut pending: Vec<(Vec<Value>, usize)> = changes
                .iter()
                .enumerate()
                .filter(|(_, c)| c.txid == txid && c.operation == operation && c.changeid.is_none())
                .map(|(index, c)| (c.key(model), index))
                .collect();
            pending.sort();
            for (_, index) in &pending {
                changes[*index].changeid = Some(sequencer.next_change_id(model.table()));
            }
            total += pending.len() as u64;
        }
        tracing::info!("Sequenced {} change rows for txid {}", total, txid);
        Ok(total)
    }
}
