// ABOUTME: Static description of a tracked table: entity, physical table, keys, columns
// ABOUTME: Validated once at setup and immutable afterwards

use crate::change::change_table_name;
use crate::error::{ChangeError, Result};
use crate::sql::validate_identifier;
use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A same-row computation for a derived column.
///
/// The expression is evaluated against the change row after a diff has
/// materialized, with the row's other columns in scope by their bare names,
/// e.g. `to_tsvector('simple', coalesce(navn, ''))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeriveStep(String);

impl DeriveStep {
    pub fn sql(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    pub fn expression(&self) -> &str {
        &self.0
    }
}

fn default_public() -> bool {
    true
}

/// One column of a tracked table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Changes confined to non-public columns are not replication-visible.
    #[serde(default = "default_public")]
    pub public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derive: Option<DeriveStep>,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public: true,
            derive: None,
        }
    }

    pub fn non_public(mut self) -> Self {
        self.public = false;
        self
    }

    pub fn derived(mut self, step: DeriveStep) -> Self {
        self.derive = Some(step);
        self
    }

    pub fn is_derived(&self) -> bool {
        self.derive.is_some()
    }
}

#[derive(Deserialize)]
struct RawTableModel {
    entity: String,
    table: String,
    primary_key: Vec<String>,
    columns: Vec<Column>,
}

impl TryFrom<RawTableModel> for TableModel {
    type Error = ChangeError;

    fn try_from(raw: RawTableModel) -> Result<Self> {
        TableModel::new(raw.entity, raw.table, raw.primary_key, raw.columns)
    }
}

/// Descriptor of a tracked table and its change table.
///
/// # Examples
///
/// ```
/// # use table_changes::model::{Column, DeriveStep, TableModel};
/// let model = TableModel::new(
///     "ejerlav",
///     "ejerlav",
///     vec!["kode".to_string()],
///     vec![
///         Column::new("kode"),
///         Column::new("navn"),
///         Column::new("tsv")
///             .non_public()
///             .derived(DeriveStep::sql("to_tsvector('simple', coalesce(navn, ''))")),
///     ],
/// )
/// .unwrap();
/// assert_eq!(model.change_table(), "ejerlav_changes");
/// assert_eq!(model.compared_column_names(), vec!["navn"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTableModel")]
pub struct TableModel {
    entity: String,
    table: String,
    primary_key: Vec<String>,
    columns: Vec<Column>,
}

impl TableModel {
    /// Build and validate a model.
    ///
    /// Fails with [`ChangeError::Configuration`] when the key is empty, a key
    /// column is missing from the column list or derived, column names repeat,
    /// or any name is not a valid identifier.
    pub fn new(
        entity: impl Into<String>,
        table: impl Into<String>,
        primary_key: Vec<String>,
        columns: Vec<Column>,
    ) -> Result<Self> {
        let model = Self {
            entity: entity.into(),
            table: table.into(),
            primary_key,
            columns,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if self.entity.trim().is_empty() {
            return Err(ChangeError::config("Table model has an empty entity name"));
        }
        validate_identifier(&self.table)?;
        validate_identifier(&change_table_name(&self.table))?;

        if self.primary_key.is_empty() {
            return Err(ChangeError::config(format!(
                "Table model '{}' declares no primary key columns",
                self.entity
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if matches!(
                column.name.as_str(),
                "txid" | "changeid" | "operation" | "public"
            ) {
                return Err(ChangeError::config(format!(
                    "Column '{}' of '{}' collides with a change-table bookkeeping column",
                    column.name, self.entity
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(ChangeError::config(format!(
                    "Column '{}' is declared twice in '{}'",
                    column.name, self.entity
                )));
            }
            if let Some(step) = &column.derive {
                if step.expression().trim().is_empty() {
                    return Err(ChangeError::config(format!(
                        "Derived column '{}' of '{}' has an empty expression",
                        column.name, self.entity
                    )));
                }
            }
        }

        for key in &self.primary_key {
            match self.column(key) {
                None => {
                    return Err(ChangeError::config(format!(
                        "Primary key column '{}' of '{}' is not a declared column",
                        key, self.entity
                    )))
                }
                Some(column) if column.is_derived() => {
                    return Err(ChangeError::config(format!(
                        "Primary key column '{}' of '{}' cannot be derived",
                        key, self.entity
                    )))
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn change_table(&self) -> String {
        change_table_name(&self.table)
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    pub fn all_column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn non_primary_column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !self.is_primary_key(&c.name))
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn derived_columns(&self) -> impl Iterator<Item = (&str, &DeriveStep)> {
        self.columns
            .iter()
            .filter_map(|c| c.derive.as_ref().map(|d| (c.name.as_str(), d)))
    }

    pub fn derived_column_names(&self) -> Vec<&str> {
        self.derived_columns().map(|(name, _)| name).collect()
    }

    pub fn non_derived_column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !c.is_derived())
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Columns whose before/after difference makes an update.
    ///
    /// Derived columns are excluded: they are recomputed after the diff and
    /// never taken from the source.
    pub fn compared_column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !self.is_primary_key(&c.name) && !c.is_derived())
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Compared columns that make an update replication-visible.
    pub fn public_compared_column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !self.is_primary_key(&c.name) && !c.is_derived() && c.public)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn has_non_public_columns(&self) -> bool {
        self.columns.iter().any(|c| !c.public)
    }

    /// Fail unless every name in `columns` is a modeled column.
    pub fn check_columns<S: AsRef<str>>(&self, columns: &[S]) -> Result<()> {
        for name in columns {
            if self.column(name.as_ref()).is_none() {
                return Err(ChangeError::config(format!(
                    "Column '{}' is not part of table model '{}'",
                    name.as_ref(),
                    self.entity
                )));
            }
        }
        Ok(())
    }

    /// Reject rows naming unknown columns or lacking a key value.
    pub fn check_row(&self, row: &Row) -> Result<()> {
        let names: Vec<&str> = row.keys().map(String::as_str).collect();
        self.check_columns(&names)?;
        for key in &self.primary_key {
            if row.get(key).map_or(true, Value::is_null) {
                return Err(ChangeError::config(format!(
                    "Row for '{}' lacks a value for primary key column '{}'",
                    self.entity, key
                )));
            }
        }
        Ok(())
    }

    /// Primary key values of `row` in key order; absent columns read as NULL.
    pub fn key_of(&self, row: &Row) -> Vec<Value> {
        self.primary_key
            .iter()
            .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Columns projected for inserts: the requested set (plus key and derived
    /// columns) in model order, or every column when nothing is requested.
    pub fn insert_projection<S: AsRef<str>>(&self, requested: Option<&[S]>) -> Result<Vec<&str>> {
        match requested {
            None => Ok(self.all_column_names()),
            Some(requested) => {
                self.check_columns(requested)?;
                Ok(self
                    .columns
                    .iter()
                    .filter(|c| {
                        self.is_primary_key(&c.name)
                            || c.is_derived()
                            || requested.iter().any(|r| r.as_ref() == c.name)
                    })
                    .map(|c| c.name.as_str())
                    .collect())
            }
        }
    }

    /// Split columns for an update into those taken from the source and those
    /// carried forward from the before image.
    ///
    /// `non_preserved` names the columns the caller wants refreshed from the
    /// source; `None` refreshes all of them. Derived columns belong to neither
    /// side. Key columns are always read from the source, where they equal
    /// the before image by construction.
    pub fn update_split<S: AsRef<str>>(&self, non_preserved: Option<&[S]>) -> Result<UpdateSplit<'_>> {
        if let Some(requested) = non_preserved {
            self.check_columns(requested)?;
        }
        let mut from_source = Vec::new();
        let mut preserved = Vec::new();
        for column in &self.columns {
            if column.is_derived() {
                continue;
            }
            let refreshed = match non_preserved {
                None => true,
                Some(requested) => {
                    self.is_primary_key(&column.name)
                        || requested.iter().any(|r| r.as_ref() == column.name)
                }
            };
            if refreshed {
                from_source.push(column.name.as_str());
            } else {
                preserved.push(column.name.as_str());
            }
        }
        Ok(UpdateSplit {
            from_source,
            preserved,
        })
    }
}

/// Result of [`TableModel::update_split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSplit<'a> {
    pub from_source: Vec<&'a str>,
    pub preserved: Vec<&'a str>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::value::row;

    pub(crate) fn ejerlav() -> TableModel {
        TableModel::new(
            "ejerlav",
            "ejerlav",
            vec!["kode".to_string()],
            vec![
                Column::new("kode"),
                Column::new("navn"),
                Column::new("tsv")
                    .non_public()
                    .derived(DeriveStep::sql("to_tsvector('simple', coalesce(navn, ''))")),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_column_sets() {
        let model = ejerlav();
        assert_eq!(model.all_column_names(), vec!["kode", "navn", "tsv"]);
        assert_eq!(model.non_primary_column_names(), vec!["navn", "tsv"]);
        assert_eq!(model.derived_column_names(), vec!["tsv"]);
        assert_eq!(model.non_derived_column_names(), vec!["kode", "navn"]);
        assert_eq!(model.compared_column_names(), vec!["navn"]);
        assert_eq!(model.public_compared_column_names(), vec!["navn"]);
        assert!(model.has_non_public_columns());
    }

    #[test]
    fn test_rejects_empty_primary_key() {
        let err = TableModel::new("x", "x", vec![], vec![Column::new("a")]).unwrap_err();
        assert!(matches!(err, ChangeError::Configuration(_)));
    }

    #[test]
    fn test_rejects_undeclared_key_column() {
        let err = TableModel::new("x", "x", vec!["id".into()], vec![Column::new("a")]).unwrap_err();
        assert!(err.to_string().contains("not a declared column"));
    }

    #[test]
    fn test_rejects_derived_key_and_duplicates() {
        let derived_key = TableModel::new(
            "x",
            "x",
            vec!["id".into()],
            vec![Column::new("id").derived(DeriveStep::sql("1"))],
        );
        assert!(derived_key.is_err());

        let duplicate = TableModel::new(
            "x",
            "x",
            vec!["id".into()],
            vec![Column::new("id"), Column::new("id")],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_rejects_bookkeeping_column_names() {
        let err = TableModel::new(
            "x",
            "x",
            vec!["id".into()],
            vec![Column::new("id"), Column::new("txid")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("bookkeeping"));
    }

    #[test]
    fn test_insert_projection_adds_key_and_derived() {
        let model = ejerlav();
        assert_eq!(
            model.insert_projection::<&str>(None).unwrap(),
            vec!["kode", "navn", "tsv"]
        );
        assert_eq!(
            model.insert_projection(Some(&["navn"][..])).unwrap(),
            vec!["kode", "navn", "tsv"]
        );
        assert!(model.insert_projection(Some(&["nope"][..])).is_err());
    }

    #[test]
    fn test_update_split_preserves_unlisted_columns() {
        let model = TableModel::new(
            "vejstykke",
            "vejstykker",
            vec!["kommunekode".into(), "kode".into()],
            vec![
                Column::new("kommunekode"),
                Column::new("kode"),
                Column::new("vejnavn"),
                Column::new("oprettet"),
            ],
        )
        .unwrap();

        let split = model.update_split(Some(&["vejnavn"][..])).unwrap();
        assert_eq!(split.from_source, vec!["kommunekode", "kode", "vejnavn"]);
        assert_eq!(split.preserved, vec!["oprettet"]);

        let all = model.update_split::<&str>(None).unwrap();
        assert!(all.preserved.is_empty());
        assert_eq!(all.from_source.len(), 4);
    }

    #[test]
    fn test_deserialize_validates() {
        let toml_text = r#"
            entity = "ejerlav"
            table = "ejerlav"
            primary_key = ["kode"]
            columns = [
                { name = "kode" },
                { name = "navn" },
                { name = "tsv", public = false, derive = "to_tsvector('simple', navn)" },
            ]
        "#;
        let model: TableModel = toml::from_str(toml_text).unwrap();
        assert_eq!(model.derived_column_names(), vec!["tsv"]);
        assert!(!model.column("tsv").unwrap().public);
        assert!(model.column("navn").unwrap().public);

        let bad = r#"
            entity = "ejerlav"
            table = "ejerlav"
            primary_key = ["id"]
            columns = [{ name = "kode" }]
        "#;
        assert!(toml::from_str::<TableModel>(bad).is_err());
    }

    #[test]
    fn test_check_row_requires_key() {
        let model = ejerlav();
        assert!(model.check_row(&row([("kode", Value::from(1))])).is_ok());
        assert!(model.check_row(&row([("navn", Value::from("x"))])).is_err());
        assert!(model.check_row(&row([("kode", Value::Null)])).is_err());
        assert!(model
            .check_row(&row([("kode", Value::from(1)), ("bogus", Value::from(2))]))
            .is_err());
    }
}
