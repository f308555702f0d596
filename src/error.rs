// ABOUTME: Error type shared by the diff, apply, sequencing, and lifecycle operations
// ABOUTME: Separates setup-time configuration faults from replay constraint violations

use thiserror::Error;

/// Errors raised by change-tracking operations.
///
/// Any error returned while a transaction is open means the caller must roll
/// that transaction back; no operation attempts to compensate for a partially
/// executed statement sequence.
#[derive(Debug, Error)]
pub enum ChangeError {
    /// A table model, binding, or identifier is incomplete or inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Replaying change rows collided with an existing key or missed a row.
    #[error("constraint violation on {table}: {message}")]
    ConstraintViolation { table: String, message: String },

    /// No table model is registered for the entity.
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    /// A statement failed in the database.
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: tokio_postgres::Error,
    },
}

impl ChangeError {
    pub fn config(message: impl Into<String>) -> Self {
        ChangeError::Configuration(message.into())
    }

    pub fn constraint(table: impl Into<String>, message: impl Into<String>) -> Self {
        ChangeError::ConstraintViolation {
            table: table.into(),
            message: message.into(),
        }
    }

    /// True when the error is a replay collision the caller must roll back.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, ChangeError::ConstraintViolation { .. })
    }
}

pub type Result<T, E = ChangeError> = std::result::Result<T, E>;

/// Attach statement context to a database error, in the spirit of
/// `anyhow::Context` but keeping the typed error.
pub(crate) trait DbContext<T> {
    fn db_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> DbContext<T> for std::result::Result<T, tokio_postgres::Error> {
    fn db_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| ChangeError::Database {
            context: context().into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_violation_display() {
        let err = ChangeError::constraint("ejerlav", "duplicate key (kode)=(1)");
        assert!(err.is_constraint_violation());
        assert_eq!(
            err.to_string(),
            "constraint violation on ejerlav: duplicate key (kode)=(1)"
        );
    }

    #[test]
    fn test_configuration_error_is_not_constraint() {
        let err = ChangeError::config("primary key is empty");
        assert!(!err.is_constraint_violation());
        assert!(err.to_string().contains("primary key is empty"));
    }
}
