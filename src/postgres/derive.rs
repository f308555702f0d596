// ABOUTME: Recomputes derived columns on change rows after a diff has materialized
// ABOUTME: Each derive step is a same-row SQL expression evaluated in one UPDATE

use tokio_postgres::GenericClient;

use crate::error::{DbContext, Result};
use crate::model::TableModel;
use crate::sql::quote_ident;

/// Recompute every derived column of the inserts and updates recorded for `txid`.
///
/// Delete rows keep the before image they were recorded with. Returns the
/// number of change rows touched; a model without derived columns is a no-op.
pub async fn derive_columns_for_change<C: GenericClient>(
    client: &C,
    txid: i64,
    model: &TableModel,
) -> Result<u64> {
    let Some(sql) = build_derive_sql(model) else {
        return Ok(0);
    };
    let derived = client
        .execute(sql.as_str(), &[&txid])
        .await
        .db_context(|| format!("Failed to derive columns for {}", model.change_table()))?;
    tracing::debug!(
        "Derived {:?} on {} change rows of {}",
        model.derived_column_names(),
        derived,
        model.table()
    );
    Ok(derived)
}

fn build_derive_sql(model: &TableModel) -> Option<String> {
    let assignments: Vec<String> = model
        .derived_columns()
        .map(|(name, step)| format!("{} = ({})", quote_ident(name), step.expression()))
        .collect();
    if assignments.is_empty() {
        return None;
    }
    Some(format!(
        "UPDATE {} SET {} WHERE txid = $1 AND operation <> 'delete'",
        quote_ident(&model.change_table()),
        assignments.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, DeriveStep};

    #[test]
    fn test_build_derive_sql() {
        let model = TableModel::new(
            "ejerlav",
            "ejerlav",
            vec!["kode".into()],
            vec![
                Column::new("kode"),
                Column::new("navn"),
                Column::new("tsv")
                    .non_public()
                    .derived(DeriveStep::sql("to_tsvector('simple', coalesce(navn, ''))")),
            ],
        )
        .unwrap();
        assert_eq!(
            build_derive_sql(&model).unwrap(),
            "UPDATE \"ejerlav_changes\" SET \"tsv\" = (to_tsvector('simple', coalesce(navn, ''))) \
             WHERE txid = $1 AND operation <> 'delete'"
        );
    }

    #[test]
    fn test_no_derived_columns_means_no_statement() {
        let model =
            TableModel::new("x", "x", vec!["id".into()], vec![Column::new("id")]).unwrap();
        assert!(build_derive_sql(&model).is_none());
    }
}
