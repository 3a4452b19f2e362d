use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::db::connection::ConnectionSummary;
use crate::db::executor::{QueryOutcome, SqlExecutor};
use crate::db::normalize::NormalizedRow;
use crate::generation::pipeline::{NlRequest, PipelineResponse, QueryMode};
use crate::web::error::{ApiError, ApiResult};
use crate::web::state::AppState;

// Query types

#[derive(Debug, Deserialize)]
pub struct NlQueryRequest {
    pub prompt: String,
    pub connection_name: String,
    pub database_name: Option<String>,
    pub table_name: Option<String>,
    #[serde(default)]
    pub mode: QueryMode,
}

#[derive(Debug, Deserialize)]
pub struct RawSqlRequest {
    pub sql: String,
    pub connection_name: String,
    pub database_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RawSqlResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub query: String,
    pub summary: String,
    pub columns: Vec<String>,
    pub results: Vec<NormalizedRow>,
    pub affected_rows: u64,
}

#[derive(Debug, Deserialize)]
pub struct BatchSqlRequest {
    pub sql_queries: Vec<String>,
    pub connection_name: String,
    pub database_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchSqlResponse {
    pub message: String,
    pub affected_rows: u64,
}

// Connection and schema types

#[derive(Debug, Serialize)]
pub struct ConnectionList {
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseParam {
    pub database: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub connection: String,
    pub database: String,
    pub schema: String,
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub connection_count: usize,
    pub engine_count: usize,
    pub llm_backend: String,
}

// API Implementations

pub async fn nl_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NlQueryRequest>,
) -> ApiResult<Json<PipelineResponse>> {
    let connection = state.resolve(&payload.connection_name, payload.database_name.as_deref())?;
    info!(
        "Natural-language query on {} ({:?} mode): {}",
        connection.pool_key(),
        payload.mode,
        payload.prompt
    );

    if payload.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("Prompt must not be empty"));
    }

    let request = NlRequest {
        prompt: payload.prompt,
        mode: payload.mode,
        table_name: payload.table_name,
    };

    let response = state.pipeline.run(&connection, &request).await.map_err(|e| {
        error!("Query pipeline failed: {}", e);
        ApiError::from(e)
    })?;

    Ok(Json(response))
}

pub async fn execute_raw_sql(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RawSqlRequest>,
) -> ApiResult<Json<RawSqlResponse>> {
    let connection = state.resolve(&payload.connection_name, payload.database_name.as_deref())?;
    let start_time = Instant::now();

    let outcome = state.executor.execute(&connection, &payload.sql).await?;
    state.pipeline.after_statement(&connection, &payload.sql).await;

    let affected_rows = outcome.row_count();
    let (columns, results) = match outcome {
        QueryOutcome::Rows { columns, rows } => (columns, rows),
        QueryOutcome::Affected { .. } => (Vec::new(), Vec::new()),
    };

    Ok(Json(RawSqlResponse {
        kind: "single",
        summary: format!(
            "Executed SQL query successfully in {:.2}s\nAffected rows: {}",
            start_time.elapsed().as_secs_f64(),
            affected_rows
        ),
        query: payload.sql,
        columns,
        results,
        affected_rows,
    }))
}

pub async fn execute_batch(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BatchSqlRequest>,
) -> ApiResult<Json<BatchSqlResponse>> {
    if payload.sql_queries.is_empty() {
        return Err(ApiError::bad_request("No SQL queries provided"));
    }
    let connection = state.resolve(&payload.connection_name, payload.database_name.as_deref())?;

    let affected_rows = state
        .executor
        .execute_batch(&connection, &payload.sql_queries)
        .await?;

    for sql in &payload.sql_queries {
        state.pipeline.after_statement(&connection, sql).await;
    }

    Ok(Json(BatchSqlResponse {
        message: "Batch execution successful".to_string(),
        affected_rows,
    }))
}

pub async fn list_connections(State(state): State<Arc<AppState>>) -> Json<ConnectionList> {
    Json(ConnectionList {
        connections: state.registry.summaries(),
    })
}

pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    Path(connection): Path<String>,
    Query(params): Query<DatabaseParam>,
) -> ApiResult<Json<SchemaResponse>> {
    let descriptor = state.resolve(&connection, params.database.as_deref())?;
    let schema = state.pipeline.schema_for(&descriptor).await?;

    Ok(Json(SchemaResponse {
        connection: descriptor.name,
        database: descriptor.database,
        schema,
    }))
}

pub async fn refresh_schema(
    State(state): State<Arc<AppState>>,
    Path(connection): Path<String>,
    Query(params): Query<DatabaseParam>,
) -> ApiResult<Json<SchemaResponse>> {
    let descriptor = state.resolve(&connection, params.database.as_deref())?;
    info!("Refreshing schema for {}", descriptor.pool_key());
    let schema = state.pipeline.refresh_schema(&descriptor).await?;

    Ok(Json(SchemaResponse {
        connection: descriptor.name,
        database: descriptor.database,
        schema,
    }))
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        connection_count: state.registry.len(),
        engine_count: state.engines.len().await,
        llm_backend: state.llm_backend.clone(),
    })
}
