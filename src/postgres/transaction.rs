// ABOUTME: Import transactions: txid allocation recorded in transaction_history
// ABOUTME: finish_import sequences the transaction's change rows in dependency order

use tokio_postgres::GenericClient;

use super::sequence::{assign_sequence_numbers, resume_sequencer};
use crate::error::{DbContext, Result};
use crate::model::TableModel;

const TRANSACTION_HISTORY_SQL: &str = "CREATE TABLE IF NOT EXISTS transaction_history (\
     txid bigint PRIMARY KEY, \
     description text, \
     time timestamptz NOT NULL DEFAULT now())";

/// Create the `transaction_history` table if it does not exist yet.
pub async fn ensure_transaction_history<C: GenericClient>(client: &C) -> Result<()> {
    client
        .batch_execute(TRANSACTION_HISTORY_SQL)
        .await
        .db_context(|| "Failed to create transaction_history")
}

/// Allocate and record the next txid.
///
/// Must run inside the caller's transaction: the table lock is held until it
/// commits or rolls back, so concurrent imports receive distinct txids and a
/// rolled-back import leaves no trace.
pub async fn begin_import<C: GenericClient>(client: &C, description: &str) -> Result<i64> {
    client
        .batch_execute("LOCK TABLE transaction_history IN EXCLUSIVE MODE")
        .await
        .db_context(|| "Failed to lock transaction_history")?;
    let row = client
        .query_one(
            "INSERT INTO transaction_history (txid, description) \
             SELECT COALESCE(MAX(txid), 0) + 1, $1 FROM transaction_history \
             RETURNING txid",
            &[&description],
        )
        .await
        .db_context(|| "Failed to allocate txid")?;
    let txid: i64 = row.get(0);
    tracing::info!("Began import transaction {}: {}", txid, description);
    Ok(txid)
}

/// Sequence every change row of `txid`.
///
/// `catalogue` is every tracked model, parent before child, not only those
/// the transaction touched: numbering resumes after the highest changeid in
/// any of them, which keeps ids unique and increasing across tables.
pub async fn finish_import<C: GenericClient>(
    client: &C,
    txid: i64,
    catalogue: &[&TableModel],
) -> Result<u64> {
    let mut sequencer = resume_sequencer(client, catalogue).await?;
    let sequenced = assign_sequence_numbers(client, &mut sequencer, txid, catalogue).await?;
    tracing::info!(
        "Finished import transaction {} ({} change rows sequenced)",
        txid,
        sequenced
    );
    Ok(sequenced)
}
