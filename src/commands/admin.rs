// ABOUTME: Administrative commands: config check, change-table creation, seeding, compaction
// ABOUTME: Each database command runs inside one transaction recorded in transaction_history

use anyhow::{Context, Result};

use super::{binding_map, Connection};
use crate::config::{Config, ModelCatalog};
use crate::postgres::{begin_import, ensure_transaction_history, ChangeFeed, ChangeTableAdmin};
use crate::sql::Relation;

/// Validate the configuration and print the catalogue.
pub fn check_config(config: &Config) -> Result<()> {
    let catalog = config.catalog().context("Invalid table catalogue")?;
    println!("Configuration OK: {} table model(s)", catalog.len());
    for model in catalog.ordered() {
        println!(
            "  {} -> {} (key: {})",
            model.entity(),
            model.table(),
            model.primary_key().join(", ")
        );
        let derived = model.derived_column_names();
        if !derived.is_empty() {
            println!("    derived: {}", derived.join(", "));
        }
        let hidden: Vec<&str> = model
            .columns()
            .iter()
            .filter(|c| !c.public)
            .map(|c| c.name.as_str())
            .collect();
        if !hidden.is_empty() {
            println!("    non-public: {}", hidden.join(", "));
        }
    }
    Ok(())
}

/// (Re)create the change tables of the selected entities.
pub async fn create_change_tables(
    connection: &Connection,
    catalog: &ModelCatalog,
    entities: &[String],
) -> Result<()> {
    let models = catalog.select(entities)?;
    let mut client = connection.open().await?;
    let tx = client.transaction().await.context("Failed to begin transaction")?;
    ensure_transaction_history(&tx).await?;
    let admin = ChangeTableAdmin::new(&tx);
    for model in &models {
        admin.create_change_table(model).await?;
        println!("Created {}", model.change_table());
    }
    tx.commit().await.context("Failed to commit")?;
    Ok(())
}

/// Seed change tables from the current live tables.
pub async fn init(
    connection: &Connection,
    catalog: &ModelCatalog,
    entities: &[String],
    description: &str,
) -> Result<()> {
    let models = catalog.select(entities)?;
    let mut client = connection.open().await?;
    let tx = client.transaction().await.context("Failed to begin transaction")?;
    ensure_transaction_history(&tx).await?;
    let txid = begin_import(&tx, description).await?;
    let admin = ChangeTableAdmin::new(&tx);
    for model in &models {
        let seeded = admin.init_change_table(txid, model).await?;
        println!("{}: seeded {} rows (txid {})", model.entity(), seeded, txid);
    }
    tx.commit().await.context("Failed to commit")?;
    Ok(())
}

/// First full load of empty live tables from source relations.
pub async fn load(
    connection: &Connection,
    catalog: &ModelCatalog,
    sources: Vec<(String, String)>,
    columns: Vec<(String, String)>,
    description: &str,
) -> Result<()> {
    let sources = binding_map(sources, "source")?;
    let columns = binding_map(columns, "columns")?;
    let mut plan = Vec::new();
    for model in catalog.ordered() {
        if let Some(source) = sources.get(model.entity()) {
            plan.push((model, Relation::parse(source)?));
        }
    }
    for entity in sources.keys().chain(columns.keys()) {
        catalog.get(entity)?;
    }

    let mut client = connection.open().await?;
    let tx = client.transaction().await.context("Failed to begin transaction")?;
    ensure_transaction_history(&tx).await?;
    let txid = begin_import(&tx, description).await?;
    let admin = ChangeTableAdmin::new(&tx);
    for (model, source) in &plan {
        let selected: Option<Vec<&str>> = columns
            .get(model.entity())
            .map(|list| list.split(',').map(str::trim).collect());
        let loaded = admin
            .initialize_from_scratch(txid, source, model, selected.as_deref())
            .await?;
        println!("{}: loaded {} rows from {} (txid {})", model.entity(), loaded, source, txid);
    }
    tx.commit().await.context("Failed to commit")?;
    Ok(())
}

/// Compact history to a single snapshot per table.
pub async fn clear_history(
    connection: &Connection,
    catalog: &ModelCatalog,
    entities: &[String],
    description: &str,
) -> Result<()> {
    let models = catalog.select(entities)?;
    let mut client = connection.open().await?;
    let tx = client.transaction().await.context("Failed to begin transaction")?;
    ensure_transaction_history(&tx).await?;
    let txid = begin_import(&tx, description).await?;
    let admin = ChangeTableAdmin::new(&tx);
    for model in &models {
        let seeded = admin.clear_history(txid, model).await?;
        println!("{}: history replaced by {} snapshot rows (txid {})", model.entity(), seeded, txid);
    }
    tx.commit().await.context("Failed to commit")?;
    Ok(())
}

/// Print the change rows a transaction recorded per table.
pub async fn count(
    connection: &Connection,
    catalog: &ModelCatalog,
    txid: i64,
    entities: &[String],
) -> Result<()> {
    let models = catalog.select(entities)?;
    let client = connection.open().await?;
    let summaries = ChangeFeed::new(&client)
        .transaction_summary(txid, &models)
        .await?;
    for summary in summaries {
        println!(
            "{}: {} inserts, {} updates, {} deletes",
            summary.entity, summary.inserts, summary.updates, summary.deletes
        );
    }
    Ok(())
}

/// Hide a transaction's change rows from replication consumers.
pub async fn hide(
    connection: &Connection,
    catalog: &ModelCatalog,
    txid: i64,
    entities: &[String],
) -> Result<()> {
    let models = catalog.select(entities)?;
    let mut client = connection.open().await?;
    let tx = client.transaction().await.context("Failed to begin transaction")?;
    let admin = ChangeTableAdmin::new(&tx);
    for model in &models {
        let hidden = admin.make_changes_non_public(txid, model).await?;
        println!("{}: {} change rows hidden", model.entity(), hidden);
    }
    tx.commit().await.context("Failed to commit")?;
    Ok(())
}
