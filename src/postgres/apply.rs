// ABOUTME: Applier - replays one transaction's change rows onto the live table
// ABOUTME: Deletes, then updates, then inserts; row-count mismatches are surfaced

use tokio_postgres::GenericClient;

use super::classify;
use crate::change::{check_replay_count, ApplyStats, Operation};
use crate::error::{DbContext, Result};
use crate::model::TableModel;
use crate::sql::{columns_equal_clause, quote_ident, select_list};

/// Replays recorded change rows onto a tracked table.
///
/// Applying is not idempotent. Replaying rows that were already applied fails
/// with [`ChangeError::ConstraintViolation`] (duplicate key on insert, or a
/// delete/update that no longer matches its recorded row), and the caller is
/// expected to roll back.
pub struct Applier<'a, C: GenericClient> {
    client: &'a C,
}

impl<'a, C: GenericClient> Applier<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Apply deletes, updates and inserts recorded for `txid`, in that order.
    ///
    /// Deleting first lets a batch vacate a key that a later insert reuses.
    pub async fn apply_changes(&self, txid: i64, model: &TableModel) -> Result<ApplyStats> {
        let deleted = self.apply_deletes(txid, model).await?;
        let updated = self.apply_updates(txid, model).await?;
        let inserted = self.apply_inserts(txid, model).await?;

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

    pub async fn apply_deletes(&self, txid: i64, model: &TableModel) -> Result<u64> {
        let expected = self.recorded(txid, model, Operation::Delete).await?;
        let sql = build_apply_deletes_sql(model);
        let deleted = self
            .client
            .execute(sql.as_str(), &[&txid])
            .await
            .map_err(|e| {
                classify(
                    model.table(),
                    format!("Failed to apply deletes to {}", model.table()),
                    e,
                )
            })?;
        check_replay_count(model, Operation::Delete, expected, deleted)?;
        Ok(deleted)
    }

    pub async fn apply_updates(&self, txid: i64, model: &TableModel) -> Result<u64> {
        let Some(sql) = build_apply_updates_sql(model) else {
            return Ok(0);
        };
        let expected = self.recorded(txid, model, Operation::Update).await?;
        let updated = self
            .client
            .execute(sql.as_str(), &[&txid])
            .await
            .map_err(|e| {
                classify(
                    model.table(),
                    format!("Failed to apply updates to {}", model.table()),
                    e,
                )
            })?;
        check_replay_count(model, Operation::Update, expected, updated)?;
        Ok(updated)
    }

    pub async fn apply_inserts(&self, txid: i64, model: &TableModel) -> Result<u64> {
        let sql = build_apply_inserts_sql(model);
        let inserted = self
            .client
            .execute(sql.as_str(), &[&txid])
            .await
            .map_err(|e| {
                classify(
                    model.table(),
                    format!("Failed to apply inserts to {}", model.table()),
                    e,
                )
            })?;
        Ok(inserted)
    }

    async fn recorded(&self, txid: i64, model: &TableModel, operation: Operation) -> Result<u64> {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE txid = $1 AND operation = '{}'",
            quote_ident(&model.change_table()),
            operation.as_str()
        );
        let row = self
            .client
            .query_one(sql.as_str(), &[&txid])
            .await
            .db_context(|| format!("Failed to count {} rows of {}", operation, model.change_table()))?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }
}

fn build_apply_deletes_sql(model: &TableModel) -> String {
    format!(
        "DELETE FROM {} t USING {} c WHERE c.txid = $1 AND c.operation = 'delete' AND {}",
        quote_ident(model.table()),
        quote_ident(&model.change_table()),
        columns_equal_clause("t", "c", model.primary_key())
    )
}

fn build_apply_updates_sql(model: &TableModel) -> Option<String> {
    let columns = model.non_primary_column_names();
    if columns.is_empty() {
        return None;
    }
    let assignments: Vec<String> = columns
        .iter()
        .map(|c| {
            let c = quote_ident(c);
            format!("{} = c.{}", c, c)
        })
        .collect();
    Some(format!(
        "UPDATE {} t SET {} FROM {} c WHERE c.txid = $1 AND c.operation = 'update' AND {}",
        quote_ident(model.table()),
        assignments.join(", "),
        quote_ident(&model.change_table()),
        columns_equal_clause("t", "c", model.primary_key())
    ))
}

fn build_apply_inserts_sql(model: &TableModel) -> String {
    let columns = select_list(None, &model.all_column_names());
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} WHERE txid = $1 AND operation = 'insert'",
        quote_ident(model.table()),
        columns,
        columns,
        quote_ident(&model.change_table())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Column;

    fn model() -> TableModel {
        TableModel::new(
            "vejstykke",
            "vejstykker",
            vec!["kommunekode".into(), "kode".into()],
            vec![
                Column::new("kommunekode"),
                Column::new("kode"),
                Column::new("vejnavn"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_build_apply_deletes_sql() {
        assert_eq!(
            build_apply_deletes_sql(&model()),
            "DELETE FROM \"vejstykker\" t USING \"vejstykker_changes\" c \
             WHERE c.txid = $1 AND c.operation = 'delete' \
             AND t.\"kommunekode\" = c.\"kommunekode\" AND t.\"kode\" = c.\"kode\""
        );
    }

    #[test]
    fn test_build_apply_updates_sql_sets_non_key_columns() {
        let sql = build_apply_updates_sql(&model()).unwrap();
        assert!(sql.starts_with("UPDATE \"vejstykker\" t SET \"vejnavn\" = c.\"vejnavn\" FROM"));
        assert!(sql.contains("c.operation = 'update'"));
    }

    #[test]
    fn test_build_apply_updates_sql_without_non_key_columns() {
        let keys_only = TableModel::new(
            "x",
            "x",
            vec!["a".into(), "b".into()],
            vec![Column::new("a"), Column::new("b")],
        )
        .unwrap();
        assert!(build_apply_updates_sql(&keys_only).is_none());
    }

    #[test]
    fn test_build_apply_inserts_sql() {
        assert_eq!(
            build_apply_inserts_sql(&model()),
            "INSERT INTO \"vejstykker\" (\"kommunekode\", \"kode\", \"vejnavn\") \
             SELECT \"kommunekode\", \"kode\", \"vejnavn\" FROM \"vejstykker_changes\" \
             WHERE txid = $1 AND operation = 'insert'"
        );
    }
}
