// ABOUTME: TOML configuration: database connection settings and the table model catalogue
// ABOUTME: Catalogue order is the parent-before-child order used for sequencing

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::error::ChangeError;
use crate::model::TableModel;

fn default_connect_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection URL; the CLI flag and environment variable take precedence.
    pub url: Option<String>,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tables: Vec<TableModel>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Invalid configuration in {:?}", path))
    }

    /// Parse and validate configuration text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.catalog()?;
        Ok(config)
    }

    /// The table models, validated as a catalogue.
    pub fn catalog(&self) -> Result<ModelCatalog, ChangeError> {
        ModelCatalog::new(self.tables.clone())
    }
}

/// Table models in dependency order, looked up by entity name.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<TableModel>,
}

impl ModelCatalog {
    /// Fails when two models share an entity or a physical table.
    pub fn new(models: Vec<TableModel>) -> Result<Self, ChangeError> {
        let mut entities = HashSet::new();
        let mut tables = HashSet::new();
        for model in &models {
            if !entities.insert(model.entity()) {
                return Err(ChangeError::config(format!(
                    "Entity '{}' is declared twice",
                    model.entity()
                )));
            }
            if !tables.insert(model.table()) {
                return Err(ChangeError::config(format!(
                    "Table '{}' is tracked by more than one entity",
                    model.table()
                )));
            }
        }
        Ok(Self { models })
    }

    pub fn get(&self, entity: &str) -> Result<&TableModel, ChangeError> {
        self.models
            .iter()
            .find(|m| m.entity() == entity)
            .ok_or_else(|| ChangeError::UnknownEntity(entity.to_string()))
    }

    /// Every model, parent before child.
    pub fn ordered(&self) -> Vec<&TableModel> {
        self.models.iter().collect()
    }

    /// The named models in catalogue order, or every model when `entities` is empty.
    pub fn select(&self, entities: &[String]) -> Result<Vec<&TableModel>, ChangeError> {
        for entity in entities {
            self.get(entity)?;
        }
        Ok(self
            .models
            .iter()
            .filter(|m| entities.is_empty() || entities.iter().any(|e| e == m.entity()))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [database]
        url = "postgresql://dawa@localhost/dawa"
        connect_retries = 5

        [[tables]]
        entity = "ejerlav"
        table = "ejerlav"
        primary_key = ["kode"]
        columns = [
            { name = "kode" },
            { name = "navn" },
            { name = "tsv", public = false, derive = "to_tsvector('simple', coalesce(navn, ''))" },
        ]

        [[tables]]
        entity = "jordstykke"
        table = "jordstykker"
        primary_key = ["ejerlavkode", "matrikelnr"]
        columns = [
            { name = "ejerlavkode" },
            { name = "matrikelnr" },
            { name = "areal" },
        ]
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.database.connect_retries, 5);
        assert!(!config.database.accept_invalid_certs);
        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 2);
        let ordered: Vec<&str> = catalog.ordered().iter().map(|m| m.entity()).collect();
        assert_eq!(ordered, vec!["ejerlav", "jordstykke"]);
        assert_eq!(catalog.get("jordstykke").unwrap().table(), "jordstykker");
    }

    #[test]
    fn test_unknown_entity() {
        let catalog = Config::parse(SAMPLE).unwrap().catalog().unwrap();
        let err = catalog.get("vejstykke").unwrap_err();
        assert!(matches!(err, ChangeError::UnknownEntity(ref e) if e == "vejstykke"));
        assert!(catalog.select(&["vejstykke".to_string()]).is_err());
    }

    #[test]
    fn test_select_keeps_catalogue_order() {
        let catalog = Config::parse(SAMPLE).unwrap().catalog().unwrap();
        let picked = catalog
            .select(&["jordstykke".to_string(), "ejerlav".to_string()])
            .unwrap();
        assert_eq!(picked[0].entity(), "ejerlav");
        assert_eq!(catalog.select(&[]).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_entities_rejected() {
        let text = r#"
            [[tables]]
            entity = "ejerlav"
            table = "ejerlav"
            primary_key = ["kode"]
            columns = [{ name = "kode" }]

            [[tables]]
            entity = "ejerlav"
            table = "ejerlav2"
            primary_key = ["kode"]
            columns = [{ name = "kode" }]
        "#;
        let err = Config::parse(text).unwrap_err();
        assert!(format!("{:#}", err).contains("declared twice"));
    }

    #[test]
    fn test_invalid_model_rejected() {
        let text = r#"
            [[tables]]
            entity = "ejerlav"
            table = "ejerlav; DROP TABLE x"
            primary_key = ["kode"]
            columns = [{ name = "kode" }]
        "#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgresql://dawa@localhost/dawa")
        );

        let missing = Config::load(Path::new("/nonexistent/table-changes.toml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read configuration"));
    }
}
