// ABOUTME: Single-row change recording for event-driven corrections outside bulk loads
// ABOUTME: Rows are written non-public and without derived-column recomputation

use tokio_postgres::types::ToSql;
use tokio_postgres::GenericClient;

use crate::change::Operation;
use crate::error::{DbContext, Result};
use crate::model::TableModel;
use crate::sql::{placeholders, quote_ident, select_list};
use crate::value::{Row, Value};

/// Records individual insert, update and delete change rows.
///
/// The rows are marked non-public: they reach the live table when the
/// transaction is applied, but whether replication consumers see them is left
/// to a later explicit decision. Derived columns are not recomputed here; call
/// [`derive_columns_for_change`](super::derive_columns_for_change) when needed.
pub struct RowMutator<'a, C: GenericClient> {
    client: &'a C,
}

impl<'a, C: GenericClient> RowMutator<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Record an insert carrying every column of `row` (absent columns are NULL).
    pub async fn insert(&self, txid: i64, model: &TableModel, row: &Row) -> Result<u64> {
        self.record(txid, model, row, Operation::Insert, model.all_column_names())
            .await
    }

    /// Record an update carrying the non-derived columns of `row`.
    pub async fn update(&self, txid: i64, model: &TableModel, row: &Row) -> Result<u64> {
        self.record(
            txid,
            model,
            row,
            Operation::Update,
            model.non_derived_column_names(),
        )
        .await
    }

    /// Record a delete carrying the non-derived columns of `row`.
    pub async fn delete(&self, txid: i64, model: &TableModel, row: &Row) -> Result<u64> {
        self.record(
            txid,
            model,
            row,
            Operation::Delete,
            model.non_derived_column_names(),
        )
        .await
    }

    async fn record(
        &self,
        txid: i64,
        model: &TableModel,
        row: &Row,
        operation: Operation,
        columns: Vec<&str>,
    ) -> Result<u64> {
        model.check_row(row)?;
        let sql = build_row_sql(model, operation, &columns);

        let values: Vec<&Value> = columns
            .iter()
            .map(|c| row.get(*c).unwrap_or(&Value::Null))
            .collect();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(values.len() + 1);
        params.push(&txid);
        params.extend(values.iter().map(|v| *v as &(dyn ToSql + Sync)));

        let written = self
            .client
            .execute(sql.as_str(), &params)
            .await
            .db_context(|| {
                format!(
                    "Failed to record single-row {} in {}",
                    operation,
                    model.change_table()
                )
            })?;
        tracing::debug!(
            "Recorded non-public {} in {} (txid {})",
            operation,
            model.change_table(),
            txid
        );
        Ok(written)
    }
}

fn build_row_sql(model: &TableModel, operation: Operation, columns: &[&str]) -> String {
    format!(
        "INSERT INTO {} (txid, operation, public, {}) VALUES ($1, '{}', false, {})",
        quote_ident(&model.change_table()),
        select_list(None, columns),
        operation.as_str(),
        placeholders(2, columns.len())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, DeriveStep};

    fn ejerlav() -> TableModel {
        TableModel::new(
            "ejerlav",
            "ejerlav",
            vec!["kode".into()],
            vec![
                Column::new("kode"),
                Column::new("navn"),
                Column::new("tsv").non_public().derived(DeriveStep::sql("navn")),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_build_row_sql_is_non_public() {
        let model = ejerlav();
        assert_eq!(
            build_row_sql(&model, Operation::Update, &model.non_derived_column_names()),
            "INSERT INTO \"ejerlav_changes\" (txid, operation, public, \"kode\", \"navn\") \
             VALUES ($1, 'update', false, $2, $3)"
        );
    }
}
