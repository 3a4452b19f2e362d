use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use sqlx::error::ErrorKind;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::types::{Oid, PgInterval, PgMoney};
use sqlx::postgres::{PgRow, PgTypeInfo, PgTypeKind};
use sqlx::{Column, Either, Executor, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::db::connection::ConnectionDescriptor;
use crate::db::engine_pool::{EngineHandle, EnginePool, PoolError, PooledEngine, SqlxEngineFactory};
use crate::db::normalize::{NormalizedRow, NumericMode, RawValue, normalize_row};
use crate::db::schema_store::introspect_schema;

const DDL_KEYWORDS: [&str; 3] = ["CREATE", "DROP", "ALTER"];

const READ_KEYWORDS: [&str; 8] = [
    "SELECT", "SHOW", "EXPLAIN", "DESCRIBE", "DESC", "VALUES", "TABLE", "WITH",
];

// Data-modifying statements that can hide behind a leading WITH
const DML_KEYWORDS: [&str; 4] = ["INSERT", "UPDATE", "DELETE", "MERGE"];

const CONSTRAINT_PHRASES: [&str; 6] = [
    "foreign key",
    "violates",
    "constraint fails",
    "duplicate key",
    "duplicate entry",
    "cannot be null",
];

fn leading_keyword(sql: &str) -> String {
    sql.trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Upper-cased words of the statement, skipping quoted text and `--` comments.
fn unquoted_words(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '-' if chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                current.push(c.to_ascii_uppercase());
                continue;
            }
            _ => {}
        }
        if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// True for statements that alter table structure.
pub fn changes_schema(sql: &str) -> bool {
    DDL_KEYWORDS.contains(&leading_keyword(sql).as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

impl StatementKind {
    /// Known read-only leading keywords are reads; anything else runs in a transaction.
    pub fn classify(sql: &str) -> Self {
        let keyword = leading_keyword(sql);
        if !READ_KEYWORDS.contains(&keyword.as_str()) {
            return StatementKind::Write;
        }
        if keyword == "WITH"
            && unquoted_words(sql)
                .iter()
                .any(|word| DML_KEYWORDS.contains(&word.as_str()))
        {
            return StatementKind::Write;
        }
        StatementKind::Read
    }
}

/// What a statement produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<NormalizedRow>,
    },
    Affected {
        affected_rows: u64,
    },
}

impl QueryOutcome {
    pub fn row_count(&self) -> u64 {
        match self {
            QueryOutcome::Rows { rows, .. } => rows.len() as u64,
            QueryOutcome::Affected { affected_rows } => *affected_rows,
        }
    }

    /// Rows as seen by a following chain step; an affected count becomes a single row.
    pub fn into_context_rows(self) -> Vec<NormalizedRow> {
        match self {
            QueryOutcome::Rows { rows, .. } => rows,
            QueryOutcome::Affected { affected_rows } => {
                let mut row = NormalizedRow::new();
                row.insert("affected_rows".to_string(), Value::from(affected_rows));
                vec![row]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    ConstraintViolation,
    Statement,
    Connection,
}

/// A statement the database refused or could not run. `message` is the engine's text.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn is_constraint_violation(&self) -> bool {
        self.kind == ExecutionErrorKind::ConstraintViolation
    }

    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let message = err.to_string();
        let kind = match &err {
            sqlx::Error::Database(db) => {
                let by_kind = matches!(
                    db.kind(),
                    ErrorKind::ForeignKeyViolation
                        | ErrorKind::UniqueViolation
                        | ErrorKind::NotNullViolation
                        | ErrorKind::CheckViolation
                );
                if by_kind || mentions_constraint_violation(&message) {
                    ExecutionErrorKind::ConstraintViolation
                } else {
                    ExecutionErrorKind::Statement
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => ExecutionErrorKind::Connection,
            _ if mentions_constraint_violation(&message) => ExecutionErrorKind::ConstraintViolation,
            _ => ExecutionErrorKind::Statement,
        };
        Self { kind, message }
    }
}

impl From<PoolError> for ExecutionError {
    fn from(err: PoolError) -> Self {
        Self {
            kind: ExecutionErrorKind::Connection,
            message: err.to_string(),
        }
    }
}

pub fn mentions_constraint_violation(message: &str) -> bool {
    let lowered = message.to_lowercase();
    CONSTRAINT_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}

/// Runs SQL against a described connection.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(
        &self,
        connection: &ConnectionDescriptor,
        sql: &str,
    ) -> Result<QueryOutcome, ExecutionError>;

    /// Renders the connection's tables as prompt-ready schema text.
    async fn introspect(&self, connection: &ConnectionDescriptor) -> Result<String, ExecutionError>;
}

pub struct QueryExecutor {
    engines: Arc<EnginePool<SqlxEngineFactory>>,
    numeric_mode: NumericMode,
}

// Runs a statement on either pool type. Writes get an explicit transaction that
// is rolled back before the error is returned. Whether a write yields rows or an
// affected count depends on what the database sent back.
macro_rules! run_statement {
    ($pool:expr, $sql:expr, $kind:expr, $decode:expr) => {{
        let pool = $pool;
        let sql: &str = $sql;
        match $kind {
            StatementKind::Read => sqlx::query(sql)
                .persistent(false)
                .fetch_all(pool)
                .await
                .map(|rows| $decode(&rows[..]))
                .map_err(ExecutionError::from_sqlx),
            StatementKind::Write => {
                let mut tx = pool.begin().await.map_err(ExecutionError::from_sqlx)?;
                let result: Result<QueryOutcome, sqlx::Error> = async {
                    let mut stream = (&mut *tx).fetch_many(sqlx::query(sql).persistent(false));
                    let mut rows = Vec::new();
                    let mut affected_rows = 0u64;
                    while let Some(step) = stream.try_next().await? {
                        match step {
                            Either::Left(done) => affected_rows += done.rows_affected(),
                            Either::Right(row) => rows.push(row),
                        }
                    }
                    Ok(write_outcome(rows, affected_rows, $decode))
                }
                .await;
                match result {
                    Ok(outcome) => {
                        tx.commit().await.map_err(ExecutionError::from_sqlx)?;
                        Ok(outcome)
                    }
                    Err(e) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!("Rollback failed: {}", rollback_err);
                        }
                        Err(ExecutionError::from_sqlx(e))
                    }
                }
            }
        }
    }};
}

macro_rules! run_batch {
    ($pool:expr, $statements:expr) => {{
        let mut tx = $pool.begin().await.map_err(ExecutionError::from_sqlx)?;
        let mut total = 0u64;
        for statement in $statements {
            debug!("Executing batch statement: {}", statement);
            match sqlx::query(statement.as_str())
                .persistent(false)
                .execute(&mut *tx)
                .await
            {
                Ok(done) => total += done.rows_affected(),
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!("Rollback failed: {}", rollback_err);
                    }
                    return Err(ExecutionError::from_sqlx(e));
                }
            }
        }
        tx.commit().await.map_err(ExecutionError::from_sqlx)?;
        Ok(total)
    }};
}

impl QueryExecutor {
    pub fn new(engines: Arc<EnginePool<SqlxEngineFactory>>, numeric_mode: NumericMode) -> Self {
        Self {
            engines,
            numeric_mode,
        }
    }

    pub async fn engine(
        &self,
        connection: &ConnectionDescriptor,
    ) -> Result<PooledEngine<EngineHandle>, ExecutionError> {
        Ok(self.engines.acquire(connection).await?)
    }

    /// Runs every statement in one transaction and returns the summed affected count.
    pub async fn execute_batch(
        &self,
        connection: &ConnectionDescriptor,
        statements: &[String],
    ) -> Result<u64, ExecutionError> {
        let engine = self.engine(connection).await?;
        info!("Executing batch of {} statements on {}", statements.len(), connection.pool_key());
        match &engine.handle {
            EngineHandle::Postgres(pool) => run_batch!(pool, statements),
            EngineHandle::MySql(pool) => run_batch!(pool, statements),
        }
    }

    async fn run(
        &self,
        handle: &EngineHandle,
        sql: &str,
        kind: StatementKind,
    ) -> Result<QueryOutcome, ExecutionError> {
        let mode = self.numeric_mode;
        match handle {
            EngineHandle::Postgres(pool) => {
                run_statement!(pool, sql, kind, |rows: &[PgRow]| pg_outcome(rows, mode))
            }
            EngineHandle::MySql(pool) => {
                run_statement!(pool, sql, kind, |rows: &[MySqlRow]| mysql_outcome(rows, mode))
            }
        }
    }
}

/// Rows win when the statement produced any; otherwise the summed affected count.
fn write_outcome<R>(
    rows: Vec<R>,
    affected_rows: u64,
    decode: impl FnOnce(&[R]) -> QueryOutcome,
) -> QueryOutcome {
    if rows.is_empty() {
        QueryOutcome::Affected { affected_rows }
    } else {
        decode(&rows[..])
    }
}

#[async_trait]
impl SqlExecutor for QueryExecutor {
    async fn execute(
        &self,
        connection: &ConnectionDescriptor,
        sql: &str,
    ) -> Result<QueryOutcome, ExecutionError> {
        let start = Instant::now();
        let kind = StatementKind::classify(sql);
        let mut engine = self.engine(connection).await?;

        info!("Executing {:?} statement on {}: {:.100}", kind, connection.pool_key(), sql);

        let mut result = self.run(&engine.handle, sql, kind).await;
        if matches!(&result, Err(e) if e.kind == ExecutionErrorKind::Connection)
            && engine.handle.is_closed()
        {
            // Retired by the TTL after we took it; closed pools refuse before running anything
            debug!("Engine for {} was disposed mid-request, retrying once", connection.pool_key());
            engine = self.engine(connection).await?;
            result = self.run(&engine.handle, sql, kind).await;
        }

        match result {
            Ok(outcome) => {
                info!(
                    "Statement finished in {}ms, {} rows",
                    start.elapsed().as_millis(),
                    outcome.row_count()
                );
                Ok(outcome)
            }
            Err(e) => {
                error!("Query execution failed: {} Query: {}", e, sql);
                if e.kind == ExecutionErrorKind::Connection {
                    // Rebuild on next use instead of reusing a broken engine
                    self.engines.evict(connection, engine.generation).await;
                }
                Err(e)
            }
        }
    }

    async fn introspect(&self, connection: &ConnectionDescriptor) -> Result<String, ExecutionError> {
        let engine = self.engine(connection).await?;
        info!("Generating schema for {}", connection.pool_key());
        introspect_schema(&engine.handle).await
    }
}

fn pg_outcome(rows: &[PgRow], mode: NumericMode) -> QueryOutcome {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows = rows
        .iter()
        .map(|row| {
            let cells = row.columns().iter().map(|column| {
                let type_info = column.type_info();
                let value = decode_pg_cell(row, column.ordinal(), type_info);
                (column.name().to_string(), type_info.name().to_string(), value)
            });
            normalize_row(cells, mode)
        })
        .collect();

    QueryOutcome::Rows { columns, rows }
}

fn mysql_outcome(rows: &[MySqlRow], mode: NumericMode) -> QueryOutcome {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows = rows
        .iter()
        .map(|row| {
            let cells = row.columns().iter().map(|column| {
                let type_name = column.type_info().name().to_string();
                let value = decode_mysql_cell(row, column.ordinal(), &type_name);
                (column.name().to_string(), type_name, value)
            });
            normalize_row(cells, mode)
        })
        .collect();

    QueryOutcome::Rows { columns, rows }
}

// Nullable elements, each wrapped like its scalar counterpart
macro_rules! pg_array {
    ($row:expr, $idx:expr, $elem:ty, $wrap:expr) => {
        $row.try_get::<Vec<Option<$elem>>, _>($idx).map(|items| {
            RawValue::Array(
                items
                    .into_iter()
                    .map(|item| item.map_or(RawValue::Null, $wrap))
                    .collect(),
            )
        })
    };
}

fn decode_pg_cell(row: &PgRow, idx: usize, type_info: &PgTypeInfo) -> RawValue {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return RawValue::Null,
    }

    let type_name = type_info.name();
    let decoded = match type_name {
        "BOOL" => row.try_get::<bool, _>(idx).map(RawValue::Bool),
        "INT2" => row.try_get::<i16, _>(idx).map(|v| RawValue::Int(v.into())),
        "INT4" => row.try_get::<i32, _>(idx).map(|v| RawValue::Int(v.into())),
        "INT8" => row.try_get::<i64, _>(idx).map(|v| RawValue::Int(v.into())),
        "OID" => row.try_get::<Oid, _>(idx).map(|v| RawValue::Int(v.0.into())),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(widen_f32),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(RawValue::Float),
        "NUMERIC" => row.try_get::<BigDecimal, _>(idx).map(RawValue::Decimal),
        "MONEY" => row
            .try_get::<PgMoney, _>(idx)
            .map(|v| RawValue::Decimal(v.to_bigdecimal(2))),
        "DATE" => row.try_get::<NaiveDate, _>(idx).map(RawValue::Date),
        "TIME" => row.try_get::<NaiveTime, _>(idx).map(RawValue::Time),
        "TIMESTAMP" => row.try_get::<NaiveDateTime, _>(idx).map(RawValue::Timestamp),
        "TIMESTAMPTZ" => row.try_get::<DateTime<Utc>, _>(idx).map(RawValue::TimestampTz),
        "INTERVAL" => row.try_get::<PgInterval, _>(idx).map(|v| RawValue::Interval {
            months: v.months,
            days: v.days,
            microseconds: v.microseconds,
        }),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx).map(RawValue::Json),
        "UUID" => row.try_get::<uuid::Uuid, _>(idx).map(RawValue::Uuid),
        "BYTEA" => row.try_get::<Vec<u8>, _>(idx).map(RawValue::Bytes),
        "BOOL[]" => pg_array!(row, idx, bool, RawValue::Bool),
        "INT2[]" => pg_array!(row, idx, i16, |v| RawValue::Int(v.into())),
        "INT4[]" => pg_array!(row, idx, i32, |v| RawValue::Int(v.into())),
        "INT8[]" => pg_array!(row, idx, i64, |v| RawValue::Int(v.into())),
        "FLOAT4[]" => pg_array!(row, idx, f32, widen_f32),
        "FLOAT8[]" => pg_array!(row, idx, f64, RawValue::Float),
        "NUMERIC[]" => pg_array!(row, idx, BigDecimal, RawValue::Decimal),
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => pg_array!(row, idx, String, RawValue::Text),
        "DATE[]" => pg_array!(row, idx, NaiveDate, RawValue::Date),
        "TIMESTAMP[]" => pg_array!(row, idx, NaiveDateTime, RawValue::Timestamp),
        "TIMESTAMPTZ[]" => pg_array!(row, idx, DateTime<Utc>, RawValue::TimestampTz),
        "UUID[]" => pg_array!(row, idx, uuid::Uuid, RawValue::Uuid),
        // Enum labels travel as their text form
        _ if matches!(type_info.kind(), PgTypeKind::Enum(_)) => {
            row.try_get_unchecked::<String, _>(idx).map(RawValue::Text)
        }
        _ => row.try_get::<String, _>(idx).map(RawValue::Text),
    };

    decoded.unwrap_or_else(|e| {
        warn!("Cannot decode column {} of type {}, returning null: {}", idx, type_name, e);
        RawValue::Null
    })
}

fn decode_mysql_cell(row: &MySqlRow, idx: usize, type_name: &str) -> RawValue {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return RawValue::Null,
    }

    let decoded = match type_name {
        "BOOLEAN" => row.try_get::<bool, _>(idx).map(RawValue::Bool),
        name if name.ends_with(" UNSIGNED") => {
            row.try_get::<u64, _>(idx).map(|v| RawValue::Int(v.into()))
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(idx).map(|v| RawValue::Int(v.into()))
        }
        "YEAR" => row.try_get::<u16, _>(idx).map(|v| RawValue::Int(v.into())),
        "BIT" => row.try_get::<u64, _>(idx).map(|v| RawValue::Int(v.into())),
        "FLOAT" => row.try_get::<f32, _>(idx).map(widen_f32),
        "DOUBLE" => row.try_get::<f64, _>(idx).map(RawValue::Float),
        "DECIMAL" => row.try_get::<BigDecimal, _>(idx).map(RawValue::Decimal),
        "DATE" => row.try_get::<NaiveDate, _>(idx).map(RawValue::Date),
        "TIME" => row.try_get::<NaiveTime, _>(idx).map(RawValue::Time),
        "DATETIME" => row.try_get::<NaiveDateTime, _>(idx).map(RawValue::Timestamp),
        "TIMESTAMP" => row.try_get::<DateTime<Utc>, _>(idx).map(RawValue::TimestampTz),
        "JSON" => row.try_get::<Value, _>(idx).map(RawValue::Json),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "GEOMETRY" => {
            row.try_get::<Vec<u8>, _>(idx).map(RawValue::Bytes)
        }
        _ => row.try_get::<String, _>(idx).map(RawValue::Text),
    };

    decoded.unwrap_or_else(|e| {
        warn!("Cannot decode column {} of type {}, returning null: {}", idx, type_name, e);
        RawValue::Null
    })
}

// Go through the shortest decimal spelling so 0.1f32 stays 0.1
fn widen_f32(v: f32) -> RawValue {
    RawValue::Float(v.to_string().parse::<f64>().unwrap_or(f64::from(v)))
}
