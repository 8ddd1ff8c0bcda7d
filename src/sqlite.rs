//! SQLite store: declarative schema, configuration and connection factory.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StoreContext};

pub const DB_PATH_ENV: &str = "PET_REGISTRY_DB";
pub const BUSY_TIMEOUT_ENV: &str = "PET_REGISTRY_BUSY_TIMEOUT_MS";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Schema definition for the SQLite database
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub tables: Vec<TableDefinition>,
    pub views: Vec<ViewDefinition>,
    pub triggers: Vec<TriggerDefinition>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_table(mut self, table: TableDefinition) -> Self {
        self.tables.push(table);
        self
    }
    pub fn add_view(mut self, view: ViewDefinition) -> Self {
        self.views.push(view);
        self
    }
    pub fn add_trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Render the whole schema as an idempotent DDL batch.
    pub fn to_sql(&self) -> String {
        let mut sql = String::new();
        for table in &self.tables {
            sql.push_str(&table.to_sql());
            for index in &table.indexes {
                sql.push_str(&index.to_sql(&table.name));
            }
        }
        for view in &self.views {
            let _ = writeln!(sql, "CREATE VIEW IF NOT EXISTS {} AS {};", view.name, view.select);
        }
        for trigger in &self.triggers {
            let _ = writeln!(
                sql,
                "CREATE TRIGGER IF NOT EXISTS {} {}\nBEGIN\n    {};\nEND;",
                trigger.name, trigger.event, trigger.body
            );
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexDefinition>,
}

impl TableDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }
    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }
    pub fn foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }
    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    fn to_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnDefinition::to_sql).collect();
        parts.extend(self.foreign_keys.iter().map(ForeignKey::to_sql));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);\n",
            self.name,
            parts.join(",\n    ")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
    pub constraints: Vec<ColumnConstraint>,
    pub default_value: Option<DefaultValue>,
}

impl ColumnDefinition {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            constraints: Vec::new(),
            default_value: None,
        }
    }
    pub fn with(mut self, constraint: ColumnConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }
    pub fn default_value(mut self, value: DefaultValue) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Shorthand for a required text column that rejects blank values.
    pub fn required_text(name: &str) -> Self {
        Self::new(name, DataType::Text)
            .with(ColumnConstraint::NotNull)
            .with(ColumnConstraint::Check(format!("length(trim({name})) > 0")))
    }

    /// Soft-delete flag, false unless flipped.
    pub fn deleted_flag() -> Self {
        Self::new("deleted", DataType::Integer)
            .with(ColumnConstraint::NotNull)
            .with(ColumnConstraint::Check("deleted IN (0, 1)".into()))
            .default_value(DefaultValue::Integer(0))
    }

    fn to_sql(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.data_type.as_sql());
        for constraint in &self.constraints {
            match constraint {
                ColumnConstraint::PrimaryKey => sql.push_str(" PRIMARY KEY"),
                ColumnConstraint::NotNull => sql.push_str(" NOT NULL"),
                ColumnConstraint::Unique => sql.push_str(" UNIQUE"),
                ColumnConstraint::Check(expr) => {
                    let _ = write!(sql, " CHECK ({expr})");
                }
            }
        }
        if let Some(default) = &self.default_value {
            let _ = write!(sql, " DEFAULT {}", default.as_sql());
        }
        sql
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataType {
    Integer,
    Text,
}

impl DataType {
    fn as_sql(self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConstraint {
    PrimaryKey,
    NotNull,
    Unique,
    Check(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Integer(i64),
    Text(String),
}

impl DefaultValue {
    fn as_sql(&self) -> String {
        match self {
            DefaultValue::Integer(value) => value.to_string(),
            DefaultValue::Text(value) => format!("'{}'", value.replace('\'', "''")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub foreign_table: String,
    pub foreign_column: String,
    pub on_delete: ForeignKeyAction,
    pub on_update: ForeignKeyAction,
}

impl ForeignKey {
    fn to_sql(&self) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE {} ON UPDATE {}",
            self.column,
            self.foreign_table,
            self.foreign_column,
            self.on_delete.as_sql(),
            self.on_update.as_sql()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForeignKeyAction {
    NoAction,
    Restrict,
}

impl ForeignKeyAction {
    fn as_sql(self) -> &'static str {
        match self {
            ForeignKeyAction::NoAction => "NO ACTION",
            ForeignKeyAction::Restrict => "RESTRICT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// Partial index predicate.
    pub predicate: Option<String>,
}

impl IndexDefinition {
    fn to_sql(&self, table: &str) -> String {
        let mut sql = format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {}({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            table,
            self.columns.join(", ")
        );
        if let Some(predicate) = &self.predicate {
            let _ = write!(sql, " WHERE {predicate}");
        }
        sql.push_str(";\n");
        sql
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewDefinition {
    pub name: String,
    pub select: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerDefinition {
    pub name: String,
    /// Timing, event and optional WHEN clause,
    /// e.g. `BEFORE UPDATE OF x ON t FOR EACH ROW WHEN ...`.
    pub event: String,
    pub body: String,
}

pub(crate) const MICROCHIP_COLUMNS: &str = "id, code, implant_date, clinic, notes, deleted";
pub(crate) const PET_COLUMNS: &str =
    "id, name, species, breed, birth_date, owner, microchip_id, deleted";

/// The registry's two tables, the views every read goes through, and the
/// guard that stops a set microchip reference from being repointed.
pub fn registry_schema() -> Schema {
    let microchips = TableDefinition::new("microchips")
        .column(ColumnDefinition::new("id", DataType::Integer).with(ColumnConstraint::PrimaryKey))
        .column(ColumnDefinition::required_text("code"))
        .column(ColumnDefinition::new("implant_date", DataType::Text))
        .column(ColumnDefinition::new("clinic", DataType::Text))
        .column(ColumnDefinition::new("notes", DataType::Text))
        .column(ColumnDefinition::deleted_flag())
        .index(IndexDefinition {
            name: "ux_microchips_active_code".into(),
            columns: vec!["code".into()],
            unique: true,
            predicate: Some("deleted = 0".into()),
        });

    let pets = TableDefinition::new("pets")
        .column(ColumnDefinition::new("id", DataType::Integer).with(ColumnConstraint::PrimaryKey))
        .column(ColumnDefinition::required_text("name"))
        .column(ColumnDefinition::required_text("species"))
        .column(ColumnDefinition::new("breed", DataType::Text))
        .column(ColumnDefinition::new("birth_date", DataType::Text))
        .column(ColumnDefinition::required_text("owner"))
        .column(
            ColumnDefinition::new("microchip_id", DataType::Integer)
                .with(ColumnConstraint::Unique),
        )
        .column(ColumnDefinition::deleted_flag())
        .foreign_key(ForeignKey {
            column: "microchip_id".into(),
            foreign_table: "microchips".into(),
            foreign_column: "id".into(),
            on_delete: ForeignKeyAction::Restrict,
            on_update: ForeignKeyAction::NoAction,
        })
        .index(IndexDefinition {
            name: "ix_pets_owner".into(),
            columns: vec!["owner".into()],
            unique: false,
            predicate: None,
        });

    Schema::new()
        .add_table(microchips)
        .add_table(pets)
        .add_view(ViewDefinition {
            name: "active_microchips".into(),
            select: format!("SELECT {MICROCHIP_COLUMNS} FROM microchips WHERE deleted = 0"),
        })
        .add_view(ViewDefinition {
            name: "active_pets".into(),
            select: format!("SELECT {PET_COLUMNS} FROM pets WHERE deleted = 0"),
        })
        .add_trigger(TriggerDefinition {
            name: "pets_microchip_reassignment_guard".into(),
            event: "BEFORE UPDATE OF microchip_id ON pets FOR EACH ROW \
                    WHEN OLD.microchip_id IS NOT NULL \
                    AND NEW.microchip_id IS NOT NULL \
                    AND NEW.microchip_id <> OLD.microchip_id"
                .into(),
            body: "SELECT RAISE(ABORT, \
                   'microchip reference must be cleared before it is reassigned')"
                .into(),
        })
}

/// SQLite store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file
    pub db_path: String,
    /// How long a connection waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Schema definition for the database
    #[serde(skip, default = "registry_schema")]
    pub schema: Schema,
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

impl SqliteConfig {
    /// Create a new SQLite config with path and schema
    pub fn new(db_path: impl Into<String>, schema: Schema) -> Self {
        Self {
            db_path: db_path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            schema,
        }
    }

    /// Config for the registry schema at `db_path`.
    pub fn registry(db_path: impl Into<String>) -> Self {
        Self::new(db_path, registry_schema())
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Read `PET_REGISTRY_DB` and optionally `PET_REGISTRY_BUSY_TIMEOUT_MS`.
    pub fn from_env() -> anyhow::Result<Self> {
        let db_path =
            std::env::var(DB_PATH_ENV).with_context(|| format!("{DB_PATH_ENV} is not set"))?;
        let mut config = Self::registry(db_path);
        if let Ok(raw) = std::env::var(BUSY_TIMEOUT_ENV) {
            config.busy_timeout_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("{BUSY_TIMEOUT_ENV} must be milliseconds, got '{raw}'"))?;
        }
        Ok(config)
    }
}

/// Connection factory for one SQLite database.
///
/// Cloning is cheap; every clone opens connections to the same file. A
/// connection is never shared between calls: the gateways open one per
/// autonomous operation and a [`crate::TransactionScope`] owns its own.
#[derive(Debug, Clone)]
pub struct Store {
    config: Arc<SqliteConfig>,
}

impl Store {
    pub fn new(config: SqliteConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Create the store and apply its schema.
    pub fn open(config: SqliteConfig) -> Result<Self> {
        let store = Self::new(config);
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    pub fn initialize_schema(&self) -> Result<()> {
        info!("initializing sqlite schema at path: {}", self.config.db_path);
        let conn = self.connect()?;
        conn.execute_batch(&self.config.schema.to_sql())
            .store_context(|| "apply the registry schema")
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        let path = &self.config.db_path;
        debug!("opening sqlite connection at path: {}", path);
        let conn =
            Connection::open(path).store_context(|| format!("open database at {path}"))?;
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))
            .store_context(|| "configure the busy timeout")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .store_context(|| "enable foreign keys")?;
        Ok(conn)
    }
}
