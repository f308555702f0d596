// ABOUTME: Assigns changeids to a transaction's change rows across dependent tables
// ABOUTME: Reverse order for deletes, declared order for inserts and updates

use tokio_postgres::GenericClient;

use crate::change::Operation;
use crate::error::{DbContext, Result};
use crate::model::TableModel;
use crate::sequencer::{sequencing_plan, Sequencer};
use crate::sql::{quote_ident, select_list};

/// Seed a [`Sequencer`] from the highest changeid recorded in any of `models`.
///
/// Pass every catalogued model; a table left out can have its ids reused.
pub async fn resume_sequencer<C: GenericClient>(
    client: &C,
    models: &[&TableModel],
) -> Result<Sequencer> {
    let mut highest = 0i64;
    for model in models {
        let sql = format!(
            "SELECT COALESCE(MAX(changeid), 0)::bigint FROM {}",
            quote_ident(&model.change_table())
        );
        let row = client
            .query_one(sql.as_str(), &[])
            .await
            .db_context(|| format!("Failed to read highest changeid of {}", model.change_table()))?;
        let max: i64 = row.get(0);
        highest = highest.max(max);
    }
    tracing::debug!("Resuming changeid sequence after {}", highest);
    Ok(Sequencer::starting_after(highest))
}

/// Give every unsequenced change row of `txid` a changeid.
///
/// `ordered` lists tables so that no table is referenced by a foreign key
/// from an earlier one. Within one (table, operation) group ids follow the
/// primary key. Returns the number of rows sequenced.
pub async fn assign_sequence_numbers<C: GenericClient>(
    client: &C,
    sequencer: &mut Sequencer,
    txid: i64,
    ordered: &[&TableModel],
) -> Result<u64> {
    let mut total = 0;
    for (model, operation) in sequencing_plan(ordered) {
        let first = sequencer.peek();
        let sql = build_sequence_sql(model, operation);
        let assigned = client
            .execute(sql.as_str(), &[&txid, &first])
            .await
            .db_context(|| {
                format!(
                    "Failed to sequence {} rows of {}",
                    operation,
                    model.change_table()
                )
            })?;
        let range = sequencer.reserve(model.table(), assigned);
        if assigned > 0 {
            tracing::debug!(
                "Sequenced {} {} rows of {} as {}..={}",
                assigned,
                operation,
                model.table(),
                range.start,
                range.end - 1
            );
        }
        total += assigned;
    }
    tracing::info!("Sequenced {} change rows for txid {}", total, txid);
    Ok(total)
}

fn build_sequence_sql(model: &TableModel, operation: Operation) -> String {
    let changes = quote_ident(&model.change_table());
    format!(
        "WITH numbered AS (\
         SELECT ctid AS row_ref, row_number() OVER (ORDER BY {keys}) AS n \
         FROM {changes} WHERE txid = $1 AND operation = '{op}' AND changeid IS NULL) \
         UPDATE {changes} c SET changeid = $2::bigint + numbered.n - 1 \
         FROM numbered WHERE c.ctid = numbered.row_ref",
        keys = select_list(None, model.primary_key()),
        changes = changes,
        op = operation.as_str(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Column;

    #[test]
    fn test_build_sequence_sql() {
        let model = TableModel::new(
            "ejerlav",
            "ejerlav",
            vec!["kode".into()],
            vec![Column::new("kode"), Column::new("navn")],
        )
        .unwrap();
        let sql = build_sequence_sql(&model, Operation::Delete);
        assert!(sql.contains("row_number() OVER (ORDER BY \"kode\")"));
        assert!(sql.contains("FROM \"ejerlav_changes\" WHERE txid = $1 AND operation = 'delete' AND changeid IS NULL"));
        assert!(sql.contains("SET changeid = $2::bigint + numbered.n - 1"));
    }
}
