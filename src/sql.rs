// ABOUTME: SQL text helpers for identifiers, relations, and column-list clauses
// ABOUTME: Every generated statement quotes identifiers validated here

use crate::error::{ChangeError, Result};
use std::fmt;

/// Validate a PostgreSQL identifier (table, schema, or column name).
///
/// Identifiers end up inside generated statements, so only letters, digits
/// and underscores are accepted, starting with a letter or underscore. Letters
/// outside ASCII are allowed since tracked schemas use national column names
/// such as `ændret`.
///
/// # Examples
///
/// ```
/// # use table_changes::sql::validate_identifier;
/// assert!(validate_identifier("ejerlav").is_ok());
/// assert!(validate_identifier("geo_ændret").is_ok());
/// assert!(validate_identifier("1abc").is_err());
/// assert!(validate_identifier("a\"; DROP TABLE x; --").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(ChangeError::config(
            "Identifier cannot be empty or whitespace-only",
        ));
    }

    // PostgreSQL truncates identifiers beyond 63 bytes
    if identifier.len() > 63 {
        return Err(ChangeError::config(format!(
            "Identifier '{}' exceeds maximum length of 63 bytes (got {})",
            sanitize_identifier(identifier),
            identifier.len()
        )));
    }

    let mut chars = identifier.chars();
    if let Some(first) = chars.next() {
        if !first.is_alphabetic() && first != '_' {
            return Err(ChangeError::config(format!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(identifier),
                first
            )));
        }
    }

    for (i, c) in identifier.chars().enumerate() {
        if !c.is_alphanumeric() && c != '_' {
            return Err(ChangeError::config(format!(
                "Identifier '{}' contains invalid character '{}' at position {}",
                sanitize_identifier(identifier),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            )));
        }
    }

    Ok(())
}

/// Strip control characters and cap the length, for log and error output only.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// A table or view name, optionally schema-qualified, usable in FROM clauses.
///
/// Source and dirty relations are supplied by import pipelines at runtime, so
/// they are validated on construction rather than trusted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relation {
    schema: Option<String>,
    name: String,
}

impl Relation {
    /// Parse `name` or `schema.name`.
    pub fn parse(relation: &str) -> Result<Self> {
        match relation.split_once('.') {
            Some((schema, name)) => {
                validate_identifier(schema)?;
                validate_identifier(name)?;
                Ok(Self {
                    schema: Some(schema.to_string()),
                    name: name.to_string(),
                })
            }
            None => {
                validate_identifier(relation)?;
                Ok(Self {
                    schema: None,
                    name: relation.to_string(),
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The quoted form used inside statements.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// `a."c1", a."c2"` or, without an alias, `"c1", "c2"`.
pub fn select_list<S: AsRef<str>>(alias: Option<&str>, columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| match alias {
            Some(alias) => format!("{}.{}", alias, quote_ident(c.as_ref())),
            None => quote_ident(c.as_ref()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `a."k1" = b."k1" AND a."k2" = b."k2"`
pub fn columns_equal_clause<S: AsRef<str>>(left: &str, right: &str, columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| {
            let c = quote_ident(c.as_ref());
            format!("{}.{} = {}.{}", left, c, right, c)
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Null-safe "any column differs" predicate. An empty column list never differs.
pub fn columns_distinct_clause<S: AsRef<str>>(left: &str, right: &str, columns: &[S]) -> String {
    if columns.is_empty() {
        return "false".to_string();
    }
    let parts: Vec<String> = columns
        .iter()
        .map(|c| {
            let c = quote_ident(c.as_ref());
            format!("{}.{} IS DISTINCT FROM {}.{}", left, c, right, c)
        })
        .collect();
    format!("({})", parts.join(" OR "))
}

/// `$first, $first+1, ...` for `count` parameters.
pub fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_rejects_injection() {
        assert!(validate_identifier("ejerlav").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("   ").is_err());
        assert!(validate_identifier("9lives").is_err());
        assert!(validate_identifier("my-table").is_err());
        assert!(validate_identifier("x\"; DROP TABLE y; --").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("navn"), "\"navn\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_relation_parse() {
        let plain = Relation::parse("fetch_ejerlav").unwrap();
        assert_eq!(plain.quoted(), "\"fetch_ejerlav\"");
        assert_eq!(plain.to_string(), "fetch_ejerlav");

        let qualified = Relation::parse("staging.fetch_ejerlav").unwrap();
        assert_eq!(qualified.quoted(), "\"staging\".\"fetch_ejerlav\"");
        assert_eq!(qualified.name(), "fetch_ejerlav");

        assert!(Relation::parse("a.b.c").is_err());
        assert!(Relation::parse("bad name").is_err());
    }

    #[test]
    fn test_select_list() {
        assert_eq!(select_list(Some("t"), &["a", "b"]), "t.\"a\", t.\"b\"");
        assert_eq!(select_list::<&str>(None, &["a"]), "\"a\"");
    }

    #[test]
    fn test_columns_equal_clause_composite() {
        assert_eq!(
            columns_equal_clause("t", "c", &["kommunekode", "kode"]),
            "t.\"kommunekode\" = c.\"kommunekode\" AND t.\"kode\" = c.\"kode\""
        );
    }

    #[test]
    fn test_columns_distinct_clause() {
        assert_eq!(
            columns_distinct_clause("before", "after", &["navn"]),
            "(before.\"navn\" IS DISTINCT FROM after.\"navn\")"
        );
        assert_eq!(columns_distinct_clause::<&str>("a", "b", &[]), "false");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(2, 3), "$2, $3, $4");
        assert_eq!(placeholders(1, 0), "");
    }
}
