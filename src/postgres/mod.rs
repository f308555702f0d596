// ABOUTME: PostgreSQL-backed change tracking: connection setup and the engine components
// ABOUTME: Diffing, deriving, applying, sequencing, row mutations, lifecycle, and feeds

pub mod apply;
pub mod derive;
pub mod diff;
pub mod feed;
pub mod lifecycle;
pub mod rows;
pub mod sequence;
pub mod transaction;

pub use apply::Applier;
pub use derive::derive_columns_for_change;
pub use diff::DiffEngine;
pub use feed::ChangeFeed;
pub use lifecycle::ChangeTableAdmin;
pub use rows::RowMutator;
pub use sequence::{assign_sequence_numbers, resume_sequencer};
pub use transaction::{begin_import, ensure_transaction_history, finish_import};

use anyhow::{Context, Result};
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;

use crate::error::ChangeError;

/// Connect to PostgreSQL, negotiating TLS according to the URL's `sslmode`.
///
/// The connection task is spawned onto the current tokio runtime; connection
/// errors after startup are logged rather than returned.
pub async fn connect(url: &str, accept_invalid_certs: bool) -> Result<Client> {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .context("Failed to build TLS connector")?;
    let connector = postgres_native_tls::MakeTlsConnector::new(tls);

    let (client, connection) = tokio_postgres::connect(url, connector)
        .await
        .with_context(|| format!("Failed to connect to {}", redact_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with exponential backoff, starting at one second.
pub async fn connect_with_retry(url: &str, accept_invalid_certs: bool, max_retries: u32) -> Result<Client> {
    let mut delay = Duration::from_secs(1);
    let mut attempt = 0;
    loop {
        match connect(url, accept_invalid_certs).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "Connection failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    max_retries + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Replace the password of a connection URL for display.
pub fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Map a statement failure to a typed error, surfacing integrity violations
/// as [`ChangeError::ConstraintViolation`].
pub(crate) fn classify(table: &str, context: String, source: tokio_postgres::Error) -> ChangeError {
    let violated = matches!(
        source.code(),
        Some(code) if *code == SqlState::UNIQUE_VIOLATION
            || *code == SqlState::FOREIGN_KEY_VIOLATION
            || *code == SqlState::NOT_NULL_VIOLATION
            || *code == SqlState::CHECK_VIOLATION
    );
    if violated {
        let detail = source
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| source.to_string());
        ChangeError::constraint(table, format!("{}: {}", context, detail))
    } else {
        ChangeError::Database { context, source }
    }
}
