// ABOUTME: Command implementations behind the table-changes CLI
// ABOUTME: Shared helpers for connecting and parsing entity=value bindings

pub mod admin;
pub mod sync;

pub use admin::{check_config, clear_history, count, create_change_tables, hide, init, load};
pub use sync::{sync, SyncOptions};

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use tokio_postgres::Client;

use crate::config::Config;
use crate::postgres::{connect_with_retry, redact_url};

/// Connection settings resolved from the command line and the config file.
pub struct Connection {
    pub url: String,
    pub accept_invalid_certs: bool,
    pub retries: u32,
}

impl Connection {
    /// The URL given on the command line (or via the environment) wins over
    /// the one in the config file.
    pub fn resolve(
        cli_url: Option<String>,
        allow_self_signed_certs: bool,
        config: &Config,
    ) -> Result<Self> {
        let Some(url) = cli_url.or_else(|| config.database.url.clone()) else {
            bail!(
                "No database URL. Pass --database-url, set TABLE_CHANGES_DATABASE_URL, \
                 or add [database] url to the config file."
            );
        };
        Ok(Self {
            url,
            accept_invalid_certs: allow_self_signed_certs || config.database.accept_invalid_certs,
            retries: config.database.connect_retries,
        })
    }

    pub async fn open(&self) -> Result<Client> {
        tracing::info!("Connecting to {}", redact_url(&self.url));
        connect_with_retry(&self.url, self.accept_invalid_certs, self.retries)
            .await
            .context("Failed to connect to database")
    }
}

/// Parse `entity=value`.
pub fn parse_binding(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((entity, value)) if !entity.trim().is_empty() && !value.trim().is_empty() => {
            Ok((entity.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected ENTITY=VALUE, got '{}'", raw)),
    }
}

/// Collect bindings into a map, rejecting an entity bound twice.
pub(crate) fn binding_map(
    bindings: Vec<(String, String)>,
    flag: &str,
) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for (entity, value) in bindings {
        if map.insert(entity.clone(), value).is_some() {
            bail!("--{} given twice for entity '{}'", flag, entity);
        }
    }
    Ok(map)
}
