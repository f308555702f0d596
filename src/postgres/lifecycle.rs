// ABOUTME: Change-table lifecycle: DDL, seeding from live or source data, compaction
// ABOUTME: Also counts per-transaction changes and adjusts visibility of recorded batches

use tokio_postgres::GenericClient;

use super::apply::Applier;
use super::derive::derive_columns_for_change;
use crate::error::{ChangeError, DbContext, Result};
use crate::model::TableModel;
use crate::sql::{columns_equal_clause, quote_ident, select_list, Relation};

/// Creates the PostgreSQL enum used by the `operation` column when missing.
const OPERATION_TYPE_SQL: &str = "DO $$ BEGIN \
     CREATE TYPE operation_type AS ENUM ('insert', 'update', 'delete'); \
     EXCEPTION WHEN duplicate_object THEN NULL; \
     END $$";

/// Administrative operations on a table's change table.
///
/// Every method runs its statements on the given client in sequence; callers
/// wrap them in the transaction that owns `txid` so a failure leaves nothing
/// behind.
pub struct ChangeTableAdmin<'a, C: GenericClient> {
    client: &'a C,
}

impl<'a, C: GenericClient> ChangeTableAdmin<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Drop and recreate the change table with the tracked table's column
    /// types, plus its three lookup indexes.
    pub async fn create_change_table(&self, model: &TableModel) -> Result<()> {
        self.client
            .batch_execute(OPERATION_TYPE_SQL)
            .await
            .db_context(|| "Failed to create operation_type enum")?;
        self.client
            .batch_execute(&build_change_table_sql(model))
            .await
            .db_context(|| format!("Failed to create {}", model.change_table()))?;
        tracing::info!("Created change table {}", model.change_table());
        Ok(())
    }

    /// Seed the change table with a non-public insert per live row, then
    /// recompute derived columns on the seeded rows.
    pub async fn init_change_table(&self, txid: i64, model: &TableModel) -> Result<u64> {
        let seeded = self.initialize_change_table(txid, model).await?;
        self.analyze(&model.change_table()).await?;
        derive_columns_for_change(self.client, txid, model).await?;
        Ok(seeded)
    }

    /// Seed the change table from the live table without deriving columns.
    pub async fn initialize_change_table(&self, txid: i64, model: &TableModel) -> Result<u64> {
        let sql = build_snapshot_sql(model);
        let seeded = self
            .client
            .execute(sql.as_str(), &[&txid])
            .await
            .db_context(|| format!("Failed to seed {}", model.change_table()))?;
        tracing::info!(
            "Seeded {} with {} rows from {} (txid {})",
            model.change_table(),
            seeded,
            model.table(),
            txid
        );
        Ok(seeded)
    }

    /// First full load: record every source row as a non-public insert,
    /// derive, and apply to the (empty) live table.
    ///
    /// `columns` selects the source columns to load and defaults to every
    /// non-derived column.
    pub async fn initialize_from_scratch(
        &self,
        txid: i64,
        source: &Relation,
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

        let sql = build_load_sql(model, source, &columns);
        let loaded = self
            .client
            .execute(sql.as_str(), &[&txid])
            .await
            .db_context(|| format!("Failed to load {} from {}", model.change_table(), source))?;
        self.analyze(&model.change_table()).await?;
        derive_columns_for_change(self.client, txid, model).await?;
        Applier::new(self.client).apply_changes(txid, model).await?;
        self.analyze(model.table()).await?;

        tracing::info!(
            "Initialized {} from {} with {} rows (txid {})",
            model.table(),
            source,
            loaded,
            txid
        );
        Ok(loaded)
    }

    /// Discard all history and re-seed a single non-public insert snapshot of
    /// the current live state under `txid`.
    pub async fn clear_history(&self, txid: i64, model: &TableModel) -> Result<u64> {
        let sql = format!("DELETE FROM {}", quote_ident(&model.change_table()));
        let removed = self
            .client
            .execute(sql.as_str(), &[])
            .await
            .db_context(|| format!("Failed to clear {}", model.change_table()))?;
        tracing::info!("Removed {} history rows from {}", removed, model.change_table());
        self.initialize_change_table(txid, model).await
    }

    /// Number of change rows recorded for `txid`, across all operations.
    pub async fn count_changes(&self, txid: i64, model: &TableModel) -> Result<i64> {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE txid = $1",
            quote_ident(&model.change_table())
        );
        let row = self
            .client
            .query_one(sql.as_str(), &[&txid])
            .await
            .db_context(|| format!("Failed to count changes in {}", model.change_table()))?;
        Ok(row.get(0))
    }

    /// Hide every change row of `txid` from replication consumers.
    pub async fn make_changes_non_public(&self, txid: i64, model: &TableModel) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET public = false WHERE txid = $1 AND public",
            quote_ident(&model.change_table())
        );
        let hidden = self
            .client
            .execute(sql.as_str(), &[&txid])
            .await
            .db_context(|| format!("Failed to hide changes in {}", model.change_table()))?;
        tracing::info!(
            "Marked {} change rows of {} non-public (txid {})",
            hidden,
            model.change_table(),
            txid
        );
        Ok(hidden)
    }

    /// Copy the live values of `columns` onto each key's latest change row.
    ///
    /// Used after a column was backfilled directly in the live table, so the
    /// latest history row agrees with it again.
    pub async fn refresh_latest_from_live(
        &self,
        model: &TableModel,
        columns: &[&str],
    ) -> Result<u64> {
        if columns.is_empty() {
            return Ok(0);
        }
        model.check_columns(columns)?;
        if let Some(key) = columns.iter().find(|c| model.is_primary_key(c)) {
            return Err(ChangeError::config(format!(
                "Primary key column '{}' of '{}' cannot be refreshed",
                key,
                model.entity()
            )));
        }
        let sql = build_refresh_latest_sql(model, columns);
        let refreshed = self
            .client
            .execute(sql.as_str(), &[])
            .await
            .db_context(|| format!("Failed to refresh {} from live", model.change_table()))?;
        tracing::info!(
            "Refreshed {:?} on {} latest rows of {}",
            columns,
            refreshed,
            model.change_table()
        );
        Ok(refreshed)
    }

    async fn analyze(&self, table: &str) -> Result<()> {
        self.client
            .batch_execute(&format!("ANALYZE {}", quote_ident(table)))
            .await
            .db_context(|| format!("Failed to analyze {}", table))
    }
}

fn build_change_table_sql(model: &TableModel) -> String {
    let changes = quote_ident(&model.change_table());
    format!(
        "DROP TABLE IF EXISTS {changes} CASCADE; \
         CREATE TABLE {changes} AS (SELECT NULL::bigint AS txid, NULL::bigint AS changeid, \
         NULL::operation_type AS operation, NULL::boolean AS public, {columns} \
         FROM {table} WHERE false); \
         CREATE INDEX ON {changes} ({keys}, txid DESC NULLS LAST, changeid DESC NULLS LAST); \
         CREATE INDEX ON {changes} (changeid) WHERE public; \
         CREATE INDEX ON {changes} (txid);",
        changes = changes,
        columns = select_list(None, &model.all_column_names()),
        table = quote_ident(model.table()),
        keys = select_list(None, model.primary_key()),
    )
}

fn build_snapshot_sql(model: &TableModel) -> String {
    let columns = select_list(None, &model.all_column_names());
    format!(
        "INSERT INTO {} (txid, operation, public, {columns}) \
         SELECT $1::bigint, 'insert', false, {columns} FROM {}",
        quote_ident(&model.change_table()),
        quote_ident(model.table()),
        columns = columns,
    )
}

fn build_load_sql(model: &TableModel, source: &Relation, columns: &[&str]) -> String {
    let columns = select_list(None, columns);
    format!(
        "INSERT INTO {} (txid, operation, public, {columns}) \
         SELECT $1::bigint, 'insert', false, {columns} FROM {}",
        quote_ident(&model.change_table()),
        source.quoted(),
        columns = columns,
    )
}

fn build_refresh_latest_sql(model: &TableModel, columns: &[&str]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .map(|c| {
            let c = quote_ident(c);
            format!("{} = u.{}", c, c)
        })
        .collect();
    let changes = quote_ident(&model.change_table());
    format!(
        "WITH latest AS (\
         SELECT {keys}, {values}, c.txid, c.changeid FROM {table} t \
         JOIN LATERAL (SELECT txid, changeid FROM {changes} c WHERE {join} \
         ORDER BY txid DESC NULLS LAST, changeid DESC NULLS LAST LIMIT 1) c ON true) \
         UPDATE {changes} c SET {assignments} FROM latest u \
         WHERE {matches} AND u.txid = c.txid AND u.changeid IS NOT DISTINCT FROM c.changeid",
        keys = select_list(Some("t"), model.primary_key()),
        values = select_list(Some("t"), columns),
        table = quote_ident(model.table()),
        changes = changes,
        join = columns_equal_clause("t", "c", model.primary_key()),
        assignments = assignments.join(", "),
        matches = columns_equal_clause("c", "u", model.primary_key()),
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
    fn test_change_table_sql_creates_indexes() {
        let sql = build_change_table_sql(&ejerlav());
        assert!(sql.starts_with("DROP TABLE IF EXISTS \"ejerlav_changes\" CASCADE;"));
        assert!(sql.contains("NULL::operation_type AS operation"));
        assert!(sql.contains("\"kode\", \"navn\", \"tsv\" FROM \"ejerlav\" WHERE false"));
        assert!(sql.contains(
            "CREATE INDEX ON \"ejerlav_changes\" (\"kode\", txid DESC NULLS LAST, changeid DESC NULLS LAST)"
        ));
        assert!(sql.contains("(changeid) WHERE public"));
        assert!(sql.contains("CREATE INDEX ON \"ejerlav_changes\" (txid)"));
    }

    #[test]
    fn test_snapshot_sql_is_non_public_insert() {
        assert_eq!(
            build_snapshot_sql(&ejerlav()),
            "INSERT INTO \"ejerlav_changes\" (txid, operation, public, \"kode\", \"navn\", \"tsv\") \
             SELECT $1::bigint, 'insert', false, \"kode\", \"navn\", \"tsv\" FROM \"ejerlav\""
        );
    }

    #[test]
    fn test_load_sql_reads_source() {
        let source = Relation::parse("staging.ejerlav").unwrap();
        let sql = build_load_sql(&ejerlav(), &source, &["kode", "navn"]);
        assert!(sql.ends_with("FROM \"staging\".\"ejerlav\""));
        assert!(sql.contains("(txid, operation, public, \"kode\", \"navn\")"));
    }

    #[test]
    fn test_refresh_latest_sql_targets_latest_row() {
        let sql = build_refresh_latest_sql(&ejerlav(), &["navn"]);
        assert!(sql.contains("ORDER BY txid DESC NULLS LAST, changeid DESC NULLS LAST LIMIT 1"));
        assert!(sql.contains("SET \"navn\" = u.\"navn\""));
        assert!(sql.contains("u.changeid IS NOT DISTINCT FROM c.changeid"));
    }
}
