use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::db::engine_pool::EngineHandle;
use crate::db::executor::ExecutionError;

pub const EMPTY_SCHEMA: &str = "The database is empty";

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Schema storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Schema document is malformed: {0}")]
    Format(#[from] serde_json::Error),
    #[error("Schema generation failed: {0}")]
    Introspection(#[from] ExecutionError),
}

/// Schema text keyed by connection name. Consumers treat the text as opaque.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn get(&self, connection_name: &str) -> Result<Option<String>, SchemaError>;

    async fn put(&self, connection_name: &str, schema: &str) -> Result<(), SchemaError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemaDocument {
    connection_name: String,
    schema_content: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// One JSON document per connection on disk, fronted by an in-memory cache.
pub struct FileSchemaStore {
    schema_dir: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

impl FileSchemaStore {
    pub fn new(schema_dir: PathBuf) -> Result<Self, SchemaError> {
        if !schema_dir.exists() {
            info!("Creating schema directory: {}", schema_dir.display());
            std::fs::create_dir_all(&schema_dir)?;
        }

        Ok(Self {
            schema_dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn schema_path(&self, connection_name: &str) -> PathBuf {
        let file_name: String = connection_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.schema_dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl SchemaStore for FileSchemaStore {
    async fn get(&self, connection_name: &str) -> Result<Option<String>, SchemaError> {
        if let Some(schema) = self.cache.read().await.get(connection_name) {
            return Ok(Some(schema.clone()));
        }

        let path = self.schema_path(connection_name);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let document: SchemaDocument = serde_json::from_str(&raw)?;
        debug!(
            "Loaded schema for {} stored at {}",
            connection_name, document.timestamp
        );

        self.cache
            .write()
            .await
            .insert(connection_name.to_string(), document.schema_content.clone());

        Ok(Some(document.schema_content))
    }

    async fn put(&self, connection_name: &str, schema: &str) -> Result<(), SchemaError> {
        let document = SchemaDocument {
            connection_name: connection_name.to_string(),
            schema_content: schema.to_string(),
            timestamp: chrono::Utc::now(),
        };
        let body = serde_json::to_string_pretty(&document)?;
        tokio::fs::write(self.schema_path(connection_name), body).await?;

        self.cache
            .write()
            .await
            .insert(connection_name.to_string(), schema.to_string());

        info!("Stored schema for {}", connection_name);
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemorySchemaStore {
    schemas: std::sync::Mutex<HashMap<String, String>>,
}

#[cfg(test)]
impl MemorySchemaStore {
    pub fn with(key: &str, schema: &str) -> Self {
        let store = Self::default();
        store
            .schemas
            .lock()
            .unwrap()
            .insert(key.to_string(), schema.to_string());
        store
    }
}

#[cfg(test)]
#[async_trait]
impl SchemaStore for MemorySchemaStore {
    async fn get(&self, connection_name: &str) -> Result<Option<String>, SchemaError> {
        Ok(self.schemas.lock().unwrap().get(connection_name).cloned())
    }

    async fn put(&self, connection_name: &str, schema: &str) -> Result<(), SchemaError> {
        self.schemas
            .lock()
            .unwrap()
            .insert(connection_name.to_string(), schema.to_string());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TableSchema {
    pub columns: Vec<(String, String)>,
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub referred_table: String,
    pub referred_column: String,
}

/// Renders tables as the schema text embedded in prompts.
pub fn render_schema(tables: &BTreeMap<String, TableSchema>) -> String {
    let blocks: Vec<String> = tables
        .iter()
        .map(|(name, table)| {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|(column, data_type)| format!("{} {}", column, data_type))
                .collect();

            let mut block = format!("Table: {}\nColumns:\n  {}", name, columns.join("\n  "));

            if !table.primary_keys.is_empty() {
                block.push_str(&format!("\nPrimary Keys: {}", table.primary_keys.join(", ")));
            }

            if !table.foreign_keys.is_empty() {
                let fks: Vec<String> = table
                    .foreign_keys
                    .iter()
                    .map(|fk| {
                        format!("  {} -> {}.{}", fk.column, fk.referred_table, fk.referred_column)
                    })
                    .collect();
                block.push_str(&format!("\nForeign Keys:\n{}", fks.join("\n")));
            }

            block
        })
        .collect();

    blocks.join("\n\n")
}

const PG_COLUMNS: &str = "SELECT c.table_name::text, c.column_name::text, c.data_type::text \
    FROM information_schema.columns c \
    JOIN information_schema.tables t ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
    WHERE c.table_schema = current_schema() AND t.table_type = 'BASE TABLE' \
    ORDER BY c.table_name, c.ordinal_position";

const PG_PRIMARY_KEYS: &str = "SELECT kcu.table_name::text, kcu.column_name::text \
    FROM information_schema.table_constraints tc \
    JOIN information_schema.key_column_usage kcu \
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema AND tc.table_name = kcu.table_name \
    WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = current_schema() \
    ORDER BY kcu.table_name, kcu.ordinal_position";

const PG_FOREIGN_KEYS: &str = "SELECT kcu.table_name::text, kcu.column_name::text, ccu.table_name::text, ccu.column_name::text \
    FROM information_schema.table_constraints tc \
    JOIN information_schema.key_column_usage kcu \
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
    JOIN information_schema.constraint_column_usage ccu \
      ON ccu.constraint_name = tc.constraint_name AND ccu.constraint_schema = tc.constraint_schema \
    WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = current_schema() \
    ORDER BY kcu.table_name, kcu.ordinal_position";

const MYSQL_COLUMNS: &str = "SELECT CAST(TABLE_NAME AS CHAR), CAST(COLUMN_NAME AS CHAR), CAST(COLUMN_TYPE AS CHAR) \
    FROM information_schema.COLUMNS WHERE TABLE_SCHEMA = DATABASE() \
    ORDER BY TABLE_NAME, ORDINAL_POSITION";

const MYSQL_PRIMARY_KEYS: &str = "SELECT CAST(TABLE_NAME AS CHAR), CAST(COLUMN_NAME AS CHAR) \
    FROM information_schema.KEY_COLUMN_USAGE \
    WHERE TABLE_SCHEMA = DATABASE() AND CONSTRAINT_NAME = 'PRIMARY' \
    ORDER BY TABLE_NAME, ORDINAL_POSITION";

const MYSQL_FOREIGN_KEYS: &str = "SELECT CAST(TABLE_NAME AS CHAR), CAST(COLUMN_NAME AS CHAR), \
    CAST(REFERENCED_TABLE_NAME AS CHAR), CAST(REFERENCED_COLUMN_NAME AS CHAR) \
    FROM information_schema.KEY_COLUMN_USAGE \
    WHERE TABLE_SCHEMA = DATABASE() AND REFERENCED_TABLE_NAME IS NOT NULL \
    ORDER BY TABLE_NAME, ORDINAL_POSITION";

/// Reads tables, columns and keys of the engine's current database into schema text.
pub async fn introspect_schema(handle: &EngineHandle) -> Result<String, ExecutionError> {
    let (columns_sql, pk_sql, fk_sql) = match handle {
        EngineHandle::Postgres(_) => (PG_COLUMNS, PG_PRIMARY_KEYS, PG_FOREIGN_KEYS),
        EngineHandle::MySql(_) => (MYSQL_COLUMNS, MYSQL_PRIMARY_KEYS, MYSQL_FOREIGN_KEYS),
    };

    let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();

    for row in fetch_text_rows(handle, columns_sql, 3).await? {
        if let [table, column, data_type] = row.as_slice() {
            tables
                .entry(table.clone())
                .or_default()
                .columns
                .push((column.clone(), data_type.clone()));
        }
    }

    for row in fetch_text_rows(handle, pk_sql, 2).await? {
        if let [table, column] = row.as_slice() {
            if let Some(schema) = tables.get_mut(table) {
                schema.primary_keys.push(column.clone());
            }
        }
    }

    for row in fetch_text_rows(handle, fk_sql, 4).await? {
        if let [table, column, referred_table, referred_column] = row.as_slice() {
            if let Some(schema) = tables.get_mut(table) {
                schema.foreign_keys.push(ForeignKey {
                    column: column.clone(),
                    referred_table: referred_table.clone(),
                    referred_column: referred_column.clone(),
                });
            }
        }
    }

    info!("Introspected {} tables from {}", tables.len(), handle.kind());
    Ok(render_schema(&tables))
}

async fn fetch_text_rows(
    handle: &EngineHandle,
    sql: &str,
    width: usize,
) -> Result<Vec<Vec<String>>, ExecutionError> {
    macro_rules! collect_rows {
        ($pool:expr) => {{
            let rows = sqlx::query(sql)
                .fetch_all($pool)
                .await
                .map_err(ExecutionError::from_sqlx)?;
            rows.iter()
                .map(|row| {
                    (0..width)
                        .map(|i| {
                            row.try_get::<Option<String>, _>(i)
                                .unwrap_or_else(|e| {
                                    warn!("Unreadable information_schema value: {}", e);
                                    None
                                })
                                .unwrap_or_default()
                        })
                        .collect()
                })
                .collect()
        }};
    }

    let rows: Vec<Vec<String>> = match handle {
        EngineHandle::Postgres(pool) => collect_rows!(pool),
        EngineHandle::MySql(pool) => collect_rows!(pool),
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_schema_layout() {
        let mut tables = BTreeMap::new();
        tables.insert(
            "orders".to_string(),
            TableSchema {
                columns: vec![
                    ("id".to_string(), "integer".to_string()),
                    ("user_id".to_string(), "integer".to_string()),
                ],
                primary_keys: vec!["id".to_string()],
                foreign_keys: vec![ForeignKey {
                    column: "user_id".to_string(),
                    referred_table: "users".to_string(),
                    referred_column: "id".to_string(),
                }],
            },
        );
        tables.insert(
            "tags".to_string(),
            TableSchema {
                columns: vec![("name".to_string(), "text".to_string())],
                ..Default::default()
            },
        );

        assert_eq!(
            render_schema(&tables),
            "Table: orders\nColumns:\n  id integer\n  user_id integer\nPrimary Keys: id\nForeign Keys:\n  user_id -> users.id\n\nTable: tags\nColumns:\n  name text"
        );
    }

    #[test]
    fn test_render_empty_schema_is_blank() {
        assert_eq!(render_schema(&BTreeMap::new()), "");
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let dir = temp_dir.path().join("schemas");
        let store = FileSchemaStore::new(dir.clone()).unwrap();

        assert_eq!(store.get("prod").await.unwrap(), None);
        store.put("prod", "Table: users").await.unwrap();
        assert_eq!(store.get("prod").await.unwrap().as_deref(), Some("Table: users"));

        // A fresh store reads the document back from disk
        let reopened = FileSchemaStore::new(dir).unwrap();
        assert_eq!(
            reopened.get("prod").await.unwrap().as_deref(),
            Some("Table: users")
        );
    }

    #[test]
    fn test_schema_path_sanitizes_names() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let dir = temp_dir.path().to_path_buf();
        let store = FileSchemaStore::new(dir.clone()).unwrap();
        assert_eq!(store.schema_path("../etc/x"), dir.join("___etc_x.json"));
    }
}
