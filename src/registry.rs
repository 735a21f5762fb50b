// ABOUTME: Table registry describing which tables are mirrored and how
// ABOUTME: Maps notification channels to tables, primary keys, and typed column lists

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::utils::validate_postgres_identifier;

/// How a column's value is shaped before it reaches the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Passed through untouched.
    #[default]
    Scalar,
    /// List-typed column; string-encoded arrays are decoded.
    Array,
    /// Nested document; string-encoded JSON is decoded.
    Json,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Scalar => "scalar",
            ColumnKind::Array => "array",
            ColumnKind::Json => "json",
        }
    }
}

/// A replicated column and its declared kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ColumnEntry")]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn scalar(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ColumnKind::Scalar,
        }
    }

    pub fn array(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ColumnKind::Array,
        }
    }

    pub fn json(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ColumnKind::Json,
        }
    }
}

/// Columns may be written as a bare name or as `{ name, kind }` in TOML.
#[derive(Deserialize)]
#[serde(untagged)]
enum ColumnEntry {
    Name(String),
    Spec {
        name: String,
        #[serde(default)]
        kind: ColumnKind,
    },
}

impl From<ColumnEntry> for ColumnSpec {
    fn from(entry: ColumnEntry) -> Self {
        match entry {
            ColumnEntry::Name(name) => ColumnSpec {
                name,
                kind: ColumnKind::Scalar,
            },
            ColumnEntry::Spec { name, kind } => ColumnSpec { name, kind },
        }
    }
}

fn default_schema() -> String {
    "public".to_string()
}

/// Static replication settings for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSyncConfig {
    /// Table name in the primary database
    #[serde(rename = "name")]
    pub table_name: String,
    /// Schema holding the table on both sides
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Destination table name (defaults to `table_name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_table: Option<String>,
    /// Notification channel the primary's trigger publishes on
    pub channel: String,
    /// Primary key column used for fetches, upserts and deletes
    pub primary_key: String,
    /// Ordered column projection, always including the primary key
    pub columns: Vec<ColumnSpec>,
}

impl TableSyncConfig {
    pub fn new(table_name: &str, channel: &str, primary_key: &str, columns: Vec<ColumnSpec>) -> Self {
        Self {
            table_name: table_name.to_string(),
            schema: default_schema(),
            mirror_table: None,
            channel: channel.to_string(),
            primary_key: primary_key.to_string(),
            columns,
        }
    }

    /// Destination table name.
    pub fn mirror_table(&self) -> &str {
        self.mirror_table.as_deref().unwrap_or(&self.table_name)
    }

    /// Column names in projection order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table_name)
    }

    fn validate(&self) -> Result<()> {
        validate_postgres_identifier(&self.table_name).context("Invalid table name")?;
        validate_postgres_identifier(&self.schema)
            .with_context(|| format!("Invalid schema for table '{}'", self.table_name))?;
        validate_postgres_identifier(self.mirror_table())
            .with_context(|| format!("Invalid mirror table for '{}'", self.table_name))?;
        validate_postgres_identifier(&self.channel)
            .with_context(|| format!("Invalid channel for table '{}'", self.table_name))?;
        validate_postgres_identifier(&self.primary_key)
            .with_context(|| format!("Invalid primary key for table '{}'", self.table_name))?;

        if self.columns.is_empty() {
            bail!("Table '{}' has no columns configured", self.table_name);
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_postgres_identifier(&column.name)
                .with_context(|| format!("Invalid column in table '{}'", self.table_name))?;
            if !seen.insert(column.name.as_str()) {
                bail!(
                    "Column '{}' is listed twice for table '{}'",
                    column.name,
                    self.table_name
                );
            }
        }

        if !seen.contains(self.primary_key.as_str()) {
            bail!(
                "Columns for table '{}' must include the primary key '{}'",
                self.table_name,
                self.primary_key
            );
        }

        Ok(())
    }
}

#[derive(Deserialize)]
struct RegistryFile {
    tables: Vec<TableSyncConfig>,
}

/// Immutable set of replicated tables, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRegistry {
    tables: Vec<TableSyncConfig>,
}

impl TableRegistry {
    /// Build a registry, enforcing unique tables and channels.
    pub fn new(tables: Vec<TableSyncConfig>) -> Result<Self> {
        if tables.is_empty() {
            bail!("Table registry is empty");
        }

        let mut names = HashSet::new();
        let mut channels = HashSet::new();
        for table in &tables {
            table.validate()?;
            if !names.insert(table.table_name.as_str()) {
                bail!("Table '{}' is registered twice", table.table_name);
            }
            if !channels.insert(table.channel.as_str()) {
                bail!(
                    "Channel '{}' is used by more than one table",
                    table.channel
                );
            }
        }

        Ok(Self { tables })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: RegistryFile =
            toml::from_str(contents).context("Failed to parse table registry TOML")?;
        Self::new(file.tables)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read table registry {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid table registry {}", path.display()))
    }

    /// Resolve the registry: explicit path, then `~/.mirror-sync/tables.toml`,
    /// then the built-in tables.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        if let Some(default_path) = default_registry_path() {
            if default_path.exists() {
                tracing::info!("Loading table registry from {}", default_path.display());
                return Self::load(&default_path);
            }
        }

        Ok(Self::builtin())
    }

    /// Tables written by the chat services that share the primary database.
    pub fn builtin() -> Self {
        Self {
            tables: vec![
                TableSyncConfig::new(
                    "conversations",
                    "conversations_changes",
                    "id",
                    vec![
                        ColumnSpec::scalar("id"),
                        ColumnSpec::scalar("user_id"),
                        ColumnSpec::scalar("user_message"),
                        ColumnSpec::scalar("bot_response"),
                        ColumnSpec::scalar("emotion"),
                        ColumnSpec::array("topics"),
                        ColumnSpec::json("metadata"),
                        ColumnSpec::scalar("created_at"),
                    ],
                ),
                TableSyncConfig::new(
                    "user_profiles",
                    "user_profiles_changes",
                    "user_id",
                    vec![
                        ColumnSpec::scalar("user_id"),
                        ColumnSpec::scalar("display_name"),
                        ColumnSpec::array("interests"),
                        ColumnSpec::json("preferences"),
                        ColumnSpec::scalar("updated_at"),
                    ],
                ),
                TableSyncConfig::new(
                    "notes",
                    "notes_changes",
                    "id",
                    vec![
                        ColumnSpec::scalar("id"),
                        ColumnSpec::scalar("user_id"),
                        ColumnSpec::scalar("title"),
                        ColumnSpec::scalar("content"),
                        ColumnSpec::array("tags"),
                        ColumnSpec::scalar("created_at"),
                        ColumnSpec::scalar("updated_at"),
                    ],
                ),
            ],
        }
    }

    pub fn tables(&self) -> &[TableSyncConfig] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.table_name.clone()).collect()
    }

    pub fn get(&self, table_name: &str) -> Option<&TableSyncConfig> {
        self.tables.iter().find(|t| t.table_name == table_name)
    }

    pub fn by_channel(&self, channel: &str) -> Option<&TableSyncConfig> {
        self.tables.iter().find(|t| t.channel == channel)
    }

    /// Distinct channels in registry order.
    pub fn channels(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.tables
            .iter()
            .map(|t| t.channel.as_str())
            .filter(|c| seen.insert(*c))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn default_registry_path() -> Option<std::path::PathBuf> {
    dirs::home_dir().map(|home| home.join(".mirror-sync").join("tables.toml"))
}
