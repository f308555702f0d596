// ABOUTME: Replication read contract over change tables: event stream and point-in-time extract
// ABOUTME: Rows are read as to_jsonb of a column subselect and mapped onto Value

use tokio_postgres::GenericClient;

use crate::change::{ChangeRow, Operation, TransactionSummary};
use crate::error::{ChangeError, DbContext, Result};
use crate::model::TableModel;
use crate::sql::{quote_ident, select_list};
use crate::value::{Row, Value};

/// Reads what replication consumers see.
pub struct ChangeFeed<'a, C: GenericClient> {
    client: &'a C,
}

impl<'a, C: GenericClient> ChangeFeed<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Public change rows with `from <= changeid <= to`, in changeid order.
    pub async fn events(
        &self,
        model: &TableModel,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<ChangeRow>> {
        let sql = build_events_sql(model);
        let from = from.unwrap_or(i64::MIN);
        let to = to.unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(sql.as_str(), &[&from, &to])
            .await
            .db_context(|| format!("Failed to read events from {}", model.change_table()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let operation: String = row.get(2);
            let data: serde_json::Value = row.get(4);
            events.push(ChangeRow {
                txid: row.get(0),
                changeid: row.get(1),
                operation: operation.parse::<Operation>()?,
                public: row.get(3),
                data: json_to_row(data)?,
            });
        }
        tracing::debug!("Read {} events from {}", events.len(), model.change_table());
        Ok(events)
    }

    /// Full state of the table, ordered by primary key.
    ///
    /// `None` reads the live table. `Some(changeid)` rebuilds the state a
    /// consumer would have after replaying every event up to `changeid`: the
    /// latest change row per key among those visible at that point, with
    /// deleted keys left out.
    pub async fn extract(&self, model: &TableModel, as_of: Option<i64>) -> Result<Vec<Row>> {
        let rows = match as_of {
            None => {
                let sql = build_live_extract_sql(model);
                self.client.query(sql.as_str(), &[]).await
            }
            Some(changeid) => {
                let sql = build_history_extract_sql(model);
                self.client.query(sql.as_str(), &[&changeid]).await
            }
        }
        .db_context(|| format!("Failed to extract {}", model.table()))?;

        rows.into_iter()
            .map(|row| json_to_row(row.get(0)))
            .collect()
    }

    /// Count the change rows `txid` recorded in each of `models`.
    pub async fn transaction_summary(
        &self,
        txid: i64,
        models: &[&TableModel],
    ) -> Result<Vec<TransactionSummary>> {
        let mut summaries = Vec::with_capacity(models.len());
        for model in models {
            let sql = format!(
                "SELECT operation::text, count(*) FROM {} WHERE txid = $1 GROUP BY operation",
                quote_ident(&model.change_table())
            );
            let rows = self
                .client
                .query(sql.as_str(), &[&txid])
                .await
                .db_context(|| format!("Failed to summarize {}", model.change_table()))?;

            let mut summary = TransactionSummary {
                entity: model.entity().to_string(),
                ..Default::default()
            };
            for row in rows {
                let operation: String = row.get(0);
                let count: i64 = row.get(1);
                match operation.parse::<Operation>()? {
                    Operation::Insert => summary.inserts = count,
                    Operation::Update => summary.updates = count,
                    Operation::Delete => summary.deletes = count,
                }
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

fn json_to_row(data: serde_json::Value) -> Result<Row> {
    match data {
        serde_json::Value::Object(fields) => Ok(fields
            .into_iter()
            .map(|(name, value)| (name, Value::from_json(value)))
            .collect()),
        other => Err(ChangeError::config(format!(
            "Expected a row object from the change feed, got {}",
            other
        ))),
    }
}

/// The model's columns of `alias` as one jsonb object.
///
/// Built from a row subselect, so it is one function argument at any width.
fn row_object_sql(alias: &str, model: &TableModel) -> String {
    format!(
        "(SELECT to_jsonb(r) FROM (SELECT {}) r)",
        select_list(Some(alias), &model.all_column_names())
    )
}

fn build_events_sql(model: &TableModel) -> String {
    format!(
        "SELECT c.txid, c.changeid, c.operation::text, c.public, {data} \
         FROM {changes} c WHERE c.public AND c.changeid BETWEEN $1 AND $2 \
         ORDER BY c.changeid",
        data = row_object_sql("c", model),
        changes = quote_ident(&model.change_table()),
    )
}

fn build_live_extract_sql(model: &TableModel) -> String {
    format!(
        "SELECT {} FROM {} t ORDER BY {}",
        row_object_sql("t", model),
        quote_ident(model.table()),
        select_list(Some("t"), model.primary_key())
    )
}

/// Latest row per key as of changeid `$1`.
///
/// Unsequenced rows (bootstrap snapshots) count as visible when their txid is
/// not after the txid that produced `$1`.
fn build_history_extract_sql(model: &TableModel) -> String {
    let changes = quote_ident(&model.change_table());
    format!(
        "WITH horizon AS (SELECT COALESCE(\
         (SELECT max(txid) FROM {changes} WHERE changeid <= $1), \
         (SELECT min(txid) - 1 FROM {changes} WHERE changeid > $1), \
         (SELECT max(txid) FROM {changes})) AS txid), \
         latest AS (SELECT DISTINCT ON ({keys}) c.operation, {data} AS data, {keys} \
         FROM {changes} c, horizon h \
         WHERE c.txid <= h.txid AND (c.changeid IS NULL OR c.changeid <= $1) \
         ORDER BY {keys}, c.txid DESC, c.changeid DESC NULLS LAST) \
         SELECT data FROM latest WHERE operation <> 'delete' ORDER BY {plain_keys}",
        changes = changes,
        keys = select_list(Some("c"), model.primary_key()),
        data = row_object_sql("c", model),
        plain_keys = select_list(None, model.primary_key()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Column;

    fn ejerlav() -> TableModel {
        TableModel::new(
            "ejerlav",
            "ejerlav",
            vec!["kode".into()],
            vec![Column::new("kode"), Column::new("navn")],
        )
        .unwrap()
    }

    #[test]
    fn test_row_object_sql() {
        assert_eq!(
            row_object_sql("c", &ejerlav()),
            "(SELECT to_jsonb(r) FROM (SELECT c.\"kode\", c.\"navn\") r)"
        );
    }

    #[test]
    fn test_row_object_sql_is_one_expression_for_wide_models() {
        let mut columns = vec![Column::new("kode")];
        columns.extend((1..=60).map(|i| Column::new(format!("felt{}", i))));
        let model = TableModel::new("bred", "bred", vec!["kode".into()], columns).unwrap();
        let sql = row_object_sql("t", &model);
        assert!(!sql.contains("jsonb_build_object"));
        assert_eq!(sql.matches("to_jsonb(").count(), 1);
        assert!(sql.contains("t.\"felt60\") r)"));
    }

    #[test]
    fn test_events_sql_reads_public_rows_in_order() {
        let sql = build_events_sql(&ejerlav());
        assert!(sql.contains("WHERE c.public AND c.changeid BETWEEN $1 AND $2"));
        assert!(sql.ends_with("ORDER BY c.changeid"));
    }

    #[test]
    fn test_history_extract_sql_excludes_deletes() {
        let sql = build_history_extract_sql(&ejerlav());
        assert!(sql.contains("DISTINCT ON (c.\"kode\")"));
        assert!(sql.contains("c.changeid IS NULL OR c.changeid <= $1"));
        assert!(sql.contains("WHERE operation <> 'delete' ORDER BY \"kode\""));
    }

    #[test]
    fn test_json_to_row() {
        let row = json_to_row(serde_json::json!({"kode": 1, "navn": null})).unwrap();
        assert_eq!(row["kode"], Value::Int(1));
        assert!(row["navn"].is_null());
        assert!(json_to_row(serde_json::json!([1])).is_err());
    }
}
