// ABOUTME: Sync command - diff source relations into change tables and replay them
// ABOUTME: One transaction: diff, derive, apply per table, then sequence across tables

use anyhow::{Context, Result};

use super::{binding_map, Connection};
use crate::config::ModelCatalog;
use crate::postgres::{
    begin_import, derive_columns_for_change, ensure_transaction_history, finish_import, Applier,
    ChangeFeed, DiffEngine,
};
use crate::sql::Relation;

pub struct SyncOptions {
    /// `entity=relation` pairs naming the new state of each table.
    pub sources: Vec<(String, String)>,
    /// `entity=relation` pairs naming key sets that may have changed.
    pub dirty: Vec<(String, String)>,
    /// `entity=col1,col2` pairs restricting the columns refreshed from source.
    pub columns: Vec<(String, String)>,
    pub description: String,
    /// Compute and report the changes, then roll back.
    pub dry_run: bool,
}

pub async fn sync(connection: &Connection, catalog: &ModelCatalog, options: SyncOptions) -> Result<()> {
    let sources = binding_map(options.sources, "source")?;
    let dirty = binding_map(options.dirty, "dirty")?;
    let columns = binding_map(options.columns, "columns")?;
    for entity in sources.keys().chain(dirty.keys()).chain(columns.keys()) {
        catalog.get(entity)?;
    }
    if let Some(entity) = dirty.keys().chain(columns.keys()).find(|e| !sources.contains_key(*e)) {
        anyhow::bail!("Entity '{}' has no --source binding", entity);
    }

    let models: Vec<_> = catalog
        .ordered()
        .into_iter()
        .filter(|m| sources.contains_key(m.entity()))
        .collect();
    if models.is_empty() {
        anyhow::bail!("Nothing to sync: pass at least one --source ENTITY=RELATION");
    }

    let mut client = connection.open().await?;
    let tx = client.transaction().await.context("Failed to begin transaction")?;
    ensure_transaction_history(&tx).await?;
    let txid = begin_import(&tx, &options.description).await?;

    let engine = DiffEngine::new(&tx);
    let applier = Applier::new(&tx);
    for model in &models {
        let source = Relation::parse(&sources[model.entity()])?;
        let selected: Option<Vec<&str>> = columns
            .get(model.entity())
            .map(|list| list.split(',').map(str::trim).collect());

        let stats = match dirty.get(model.entity()) {
            Some(dirty) => {
                let dirty = Relation::parse(dirty)?;
                engine
                    .compute_differences_subset(txid, &source, &dirty, model, selected.as_deref())
                    .await?
            }
            None => {
                engine
                    .compute_differences(txid, &source, model, selected.as_deref())
                    .await?
            }
        };
        if stats.is_empty() {
            tracing::info!("{} is unchanged", model.entity());
            continue;
        }
        derive_columns_for_change(&tx, txid, model).await?;
        applier.apply_changes(txid, model).await?;
    }

    finish_import(&tx, txid, &catalog.ordered()).await?;
    let summaries = ChangeFeed::new(&tx).transaction_summary(txid, &models).await?;
    for summary in &summaries {
        println!(
            "{}: {} inserts, {} updates, {} deletes",
            summary.entity, summary.inserts, summary.updates, summary.deletes
        );
    }

    if options.dry_run {
        tx.rollback().await.context("Failed to roll back")?;
        println!("Dry run: rolled back txid {}", txid);
    } else {
        tx.commit().await.context("Failed to commit")?;
        let total: i64 = summaries.iter().map(|s| s.total()).sum();
        println!("Committed txid {} ({} change rows)", txid, total);
    }
    Ok(())
}
