use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::connection::ConnectionDescriptor;
use crate::db::executor::{ExecutionError, ExecutionErrorKind, QueryOutcome, SqlExecutor, changes_schema};
use crate::db::normalize::NormalizedRow;
use crate::db::schema_store::{EMPTY_SCHEMA, SchemaError, SchemaStore};
use crate::generation::chain::{ChainExecutor, ChainStepFailure, StepResult};
use crate::generation::classifier::{QueryClassifier, QueryPlan};
use crate::generation::orchestrator::{ErrorHistory, GenerationError, GenerationTask, SqlGenerator};
use crate::llm::LanguageModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Generate only.
    Ask,
    #[default]
    Execute,
}

#[derive(Debug, Clone)]
pub struct NlRequest {
    pub prompt: String,
    pub mode: QueryMode,
    pub table_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineResponse {
    Ask {
        query: String,
        summary: String,
        attempts: u32,
    },
    Single {
        query: String,
        summary: String,
        columns: Vec<String>,
        results: Vec<NormalizedRow>,
        #[serde(skip_serializing_if = "Option::is_none")]
        affected_rows: Option<u64>,
        attempts: u32,
    },
    Multi {
        steps: Vec<StepResult>,
        summary: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("Constraint violation: {error}")]
    ConstraintViolation { error: ExecutionError, query: String },
    #[error(transparent)]
    Execution(ExecutionError),
    #[error(transparent)]
    Chain(#[from] ChainStepFailure),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Request-level entry point: schema, classification, then a single query or a chain.
pub struct QueryPipeline {
    generator: SqlGenerator,
    classifier: QueryClassifier,
    executor: Arc<dyn SqlExecutor>,
    schemas: Arc<dyn SchemaStore>,
}

impl QueryPipeline {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        executor: Arc<dyn SqlExecutor>,
        schemas: Arc<dyn SchemaStore>,
        max_attempts: u32,
    ) -> Self {
        Self {
            generator: SqlGenerator::new(Arc::clone(&model), max_attempts),
            classifier: QueryClassifier::new(model),
            executor,
            schemas,
        }
    }

    /// Stored schema text, introspected and stored on first use.
    pub async fn schema_for(&self, connection: &ConnectionDescriptor) -> Result<String, SchemaError> {
        match self.schemas.get(&connection.pool_key()).await? {
            Some(schema) => Ok(schema),
            None => self.refresh_schema(connection).await,
        }
    }

    pub async fn refresh_schema(&self, connection: &ConnectionDescriptor) -> Result<String, SchemaError> {
        let schema = self.executor.introspect(connection).await?;
        if schema.trim().is_empty() {
            // Not stored, so tables created later show up without a manual refresh
            return Ok(EMPTY_SCHEMA.to_string());
        }
        self.schemas.put(&connection.pool_key(), &schema).await?;
        Ok(schema)
    }

    /// Re-reads the schema after DDL. Failure only costs freshness.
    pub async fn after_statement(&self, connection: &ConnectionDescriptor, sql: &str) {
        if changes_schema(sql) {
            if let Err(e) = self.refresh_schema(connection).await {
                warn!("Schema refresh after DDL failed for {}: {}", connection.pool_key(), e);
            }
        }
    }

    pub async fn run(
        &self,
        connection: &ConnectionDescriptor,
        request: &NlRequest,
    ) -> Result<PipelineResponse, PipelineError> {
        let schema = self.schema_for(connection).await?;
        let request_text = match request.table_name.as_deref().map(str::trim) {
            Some(table) if !table.is_empty() => format!(
                "{}\nTable: {}, Database: {}, Server: {}",
                request.prompt, table, connection.database, connection.name
            ),
            _ => request.prompt.clone(),
        };

        if request.mode == QueryMode::Ask {
            let task = GenerationTask {
                request: &request_text,
                schema: &schema,
                chain: None,
            };
            let generated = self.generator.generate(task, &mut ErrorHistory::new(), 1).await?;
            return Ok(PipelineResponse::Ask {
                query: generated.result.query,
                summary: generated.result.summary,
                attempts: generated.attempt,
            });
        }

        match self.classifier.classify(&request.prompt).await {
            QueryPlan::Multi { steps } => {
                let outcome = ChainExecutor::new(&self.generator, self.executor.as_ref())
                    .run_chain(&steps, connection, &schema)
                    .await;
                // Completed steps stay applied even when a later one fails
                let completed = match &outcome {
                    Ok(results) => results.as_slice(),
                    Err(failure) => failure.completed.as_slice(),
                };
                for step in completed {
                    self.after_statement(connection, &step.query).await;
                }
                let results = outcome?;
                Ok(PipelineResponse::Multi {
                    summary: format!("Executed {} steps successfully", results.len()),
                    steps: results,
                })
            }
            QueryPlan::Single => self.run_single(connection, &request_text, &schema).await,
        }
    }

    async fn run_single(
        &self,
        connection: &ConnectionDescriptor,
        request_text: &str,
        schema: &str,
    ) -> Result<PipelineResponse, PipelineError> {
        let task = GenerationTask {
            request: request_text,
            schema,
            chain: None,
        };
        let mut history = ErrorHistory::new();
        let mut attempt = 1;

        loop {
            let generated = self.generator.generate(task, &mut history, attempt).await?;
            let query = generated.result.query;

            match self.executor.execute(connection, &query).await {
                Ok(outcome) => {
                    info!("Query succeeded on attempt {}", generated.attempt);
                    self.after_statement(connection, &query).await;

                    let (columns, results, affected_rows) = match outcome {
                        QueryOutcome::Rows { columns, rows } => (columns, rows, None),
                        QueryOutcome::Affected { affected_rows } => {
                            (Vec::new(), Vec::new(), Some(affected_rows))
                        }
                    };
                    return Ok(PipelineResponse::Single {
                        query,
                        summary: generated.result.summary,
                        columns,
                        results,
                        affected_rows,
                        attempts: generated.attempt,
                    });
                }
                Err(e) if e.is_constraint_violation() => {
                    error!("Constraint violation: {}", e);
                    return Err(PipelineError::ConstraintViolation { error: e, query });
                }
                // Regenerating cannot fix an unreachable database
                Err(e) if e.kind == ExecutionErrorKind::Connection => {
                    return Err(PipelineError::Execution(e));
                }
                Err(e) => {
                    warn!("Attempt {} failed: {}", generated.attempt, e);
                    history.push(format!("Attempt {} error: {}", generated.attempt, e));

                    if generated.attempt >= self.generator.max_attempts() {
                        error!("Query failed after {} attempts", generated.attempt);
                        return Err(GenerationError::Exhausted {
                            attempts: generated.attempt,
                            history: history.into_entries(),
                        }
                        .into());
                    }
                    attempt = generated.attempt + 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_descriptor;
    use crate::db::schema_store::MemorySchemaStore;
    use crate::generation::chain::tests::{ScriptedExecutor, answer, rows};
    use crate::llm::mock::ScriptedModel;
    use serde_json::json;

    const SINGLE: &str = r#"{"query_type": "single"}"#;

    fn pipeline(
        model: &Arc<ScriptedModel>,
        executor: ScriptedExecutor,
        schemas: &Arc<MemorySchemaStore>,
    ) -> (QueryPipeline, Arc<ScriptedExecutor>) {
        let executor = Arc::new(executor);
        let pipeline = QueryPipeline::new(model.clone(), executor.clone(), schemas.clone(), 3);
        (pipeline, executor)
    }

    fn execute(prompt: &str) -> NlRequest {
        NlRequest {
            prompt: prompt.to_string(),
            mode: QueryMode::Execute,
            table_name: None,
        }
    }

    fn statement_error(message: &str) -> ExecutionError {
        ExecutionError {
            kind: ExecutionErrorKind::Statement,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_single_query_introspects_and_stores_schema() {
        let model = Arc::new(ScriptedModel::new([
            SINGLE.to_string(),
            answer("SELECT id FROM users", "all users"),
        ]));
        let schemas = Arc::new(MemorySchemaStore::default());
        let executor = ScriptedExecutor {
            schema: "Table: users\nColumns:\n  id integer".to_string(),
            ..Default::default()
        }
        .answer("SELECT id FROM users", Ok(rows(&[1, 2, 3])));
        let (pipeline, _) = pipeline(&model, executor, &schemas);
        let conn = test_descriptor("prod", "app");

        let response = pipeline.run(&conn, &execute("list users")).await.unwrap();
        match response {
            PipelineResponse::Single {
                results, attempts, ..
            } => {
                assert_eq!(results.len(), 3);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }

        assert_eq!(
            schemas.get("prod_app").await.unwrap().as_deref(),
            Some("Table: users\nColumns:\n  id integer")
        );
        assert!(model.prompts()[1].contains("Table: users\nColumns:\n  id integer"));
    }

    #[tokio::test]
    async fn test_oldest_users_single_query() {
        let query = "SELECT * FROM users ORDER BY created_at ASC LIMIT 5";
        let model = Arc::new(ScriptedModel::new([
            SINGLE.to_string(),
            answer(query, "The five earliest registered users"),
        ]));
        let schemas = Arc::new(MemorySchemaStore::with("prod_app", "Table: users"));
        let executor = ScriptedExecutor::default().answer(query, Ok(rows(&[4, 9, 1, 7, 3])));
        let (pipeline, executor) = pipeline(&model, executor, &schemas);

        let response = pipeline
            .run(&test_descriptor("prod", "app"), &execute("show the 5 oldest users"))
            .await
            .unwrap();
        match response {
            PipelineResponse::Single {
                query: executed,
                results,
                affected_rows,
                ..
            } => {
                assert_eq!(executed, query);
                assert_eq!(results.len(), 5);
                assert_eq!(results[0]["id"], json!(4));
                assert_eq!(affected_rows, None);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(executor.executed(), vec![query.to_string()]);
    }

    #[tokio::test]
    async fn test_execution_error_feeds_next_attempt() {
        let model = Arc::new(ScriptedModel::new([
            SINGLE.to_string(),
            answer("SELECT nme FROM users", "names"),
            answer("SELECT name FROM users", "names"),
        ]));
        let schemas = Arc::new(MemorySchemaStore::with("prod_app", "Table: users"));
        let executor = ScriptedExecutor::default()
            .answer(
                "SELECT nme FROM users",
                Err(statement_error("column \"nme\" does not exist")),
            )
            .answer("SELECT name FROM users", Ok(rows(&[1])));
        let (pipeline, executor) = pipeline(&model, executor, &schemas);

        let response = pipeline
            .run(&test_descriptor("prod", "app"), &execute("user names"))
            .await
            .unwrap();
        assert!(matches!(response, PipelineResponse::Single { attempts: 2, .. }));

        let retry_prompt = &model.prompts()[2];
        assert!(retry_prompt.contains("Attempt 1 error: column \"nme\" does not exist"));
        assert!(retry_prompt.contains("This is attempt 2"));
        assert_eq!(executor.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_execution_failures_share_the_generation_budget() {
        let model = Arc::new(ScriptedModel::new([
            SINGLE.to_string(),
            answer("SELECT a FROM t", "a"),
            answer("SELECT b FROM t", "b"),
            answer("SELECT c FROM t", "c"),
            answer("SELECT d FROM t", "d"),
        ]));
        let schemas = Arc::new(MemorySchemaStore::with("prod_app", "Table: t"));
        let (pipeline, executor) = pipeline(&model, ScriptedExecutor::default(), &schemas);

        let err = pipeline
            .run(&test_descriptor("prod", "app"), &execute("read t"))
            .await
            .unwrap_err();

        match err {
            PipelineError::Generation(GenerationError::Exhausted { attempts, history }) => {
                assert_eq!(attempts, 3);
                assert_eq!(history.len(), 3);
                assert!(history[0].starts_with("Attempt 1 error:"));
                assert!(history[2].starts_with("Attempt 3 error:"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        // One classification plus three generations
        assert_eq!(model.calls(), 4);
        assert_eq!(executor.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_constraint_violation_is_not_retried() {
        let model = Arc::new(ScriptedModel::new([
            SINGLE.to_string(),
            answer("DELETE FROM orders WHERE id = 1", "delete"),
        ]));
        let schemas = Arc::new(MemorySchemaStore::with("prod_shop", "Table: orders"));
        let message = "update or delete on table \"orders\" violates foreign key constraint \"order_items_order_id_fkey\" on table \"order_items\"";
        let executor = ScriptedExecutor::default().answer(
            "DELETE FROM orders WHERE id = 1",
            Err(ExecutionError {
                kind: ExecutionErrorKind::ConstraintViolation,
                message: message.to_string(),
            }),
        );
        let (pipeline, _) = pipeline(&model, executor, &schemas);

        let err = pipeline
            .run(&test_descriptor("prod", "shop"), &execute("delete order 1"))
            .await
            .unwrap_err();

        match err {
            PipelineError::ConstraintViolation { error, query } => {
                assert_eq!(error.message, message);
                assert_eq!(query, "DELETE FROM orders WHERE id = 1");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_multi_plan_runs_chain() {
        let model = Arc::new(ScriptedModel::new([
            json!({"query_type": "multi", "steps": ["find old orders", "archive them"]}).to_string(),
            answer("SELECT id FROM orders", "old orders"),
            answer("UPDATE orders SET archived = true WHERE id IN (4)", "archive"),
        ]));
        let schemas = Arc::new(MemorySchemaStore::with("prod_shop", "Table: orders"));
        let executor = ScriptedExecutor::default()
            .answer("SELECT id FROM orders", Ok(rows(&[4])))
            .answer(
                "UPDATE orders SET archived = true WHERE id IN (4)",
                Ok(QueryOutcome::Affected { affected_rows: 1 }),
            );
        let (pipeline, _) = pipeline(&model, executor, &schemas);

        let response = pipeline
            .run(&test_descriptor("prod", "shop"), &execute("archive old orders"))
            .await
            .unwrap();

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "multi");
        assert_eq!(value["summary"], "Executed 2 steps successfully");
        assert_eq!(value["steps"][1]["results"][0]["affected_rows"], 1);
    }

    #[tokio::test]
    async fn test_failed_chain_still_refreshes_schema_after_ddl() {
        let create = "CREATE TABLE archive (id integer)";
        let model = Arc::new(ScriptedModel::new([
            json!({"query_type": "multi", "steps": ["create archive", "copy old orders"]}).to_string(),
            answer(create, "archive table"),
            answer("INSERT INTO archive SELECT id FROM missing", "copy"),
        ]));
        let schemas = Arc::new(MemorySchemaStore::with("prod_shop", "Table: orders"));
        let executor = ScriptedExecutor {
            schema: "Table: archive\n\nTable: orders".to_string(),
            ..Default::default()
        }
        .answer(create, Ok(QueryOutcome::Affected { affected_rows: 0 }))
        .answer(
            "INSERT INTO archive SELECT id FROM missing",
            Err(statement_error("relation \"missing\" does not exist")),
        );
        let (pipeline, executor) = pipeline(&model, executor, &schemas);

        let err = pipeline
            .run(&test_descriptor("prod", "shop"), &execute("archive old orders"))
            .await
            .unwrap_err();

        match err {
            PipelineError::Chain(failure) => {
                assert_eq!(failure.completed.len(), 1);
                assert_eq!(failure.step_index, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(executor.executed()[0], create);
        assert_eq!(
            schemas.get("prod_shop").await.unwrap().as_deref(),
            Some("Table: archive\n\nTable: orders")
        );
    }

    #[tokio::test]
    async fn test_ask_mode_generates_without_executing() {
        let model = Arc::new(ScriptedModel::new([answer("SELECT COUNT(*) FROM users", "count")]));
        let schemas = Arc::new(MemorySchemaStore::with("prod_app", "Table: users"));
        let (pipeline, executor) = pipeline(&model, ScriptedExecutor::default(), &schemas);

        let request = NlRequest {
            prompt: "how many users".to_string(),
            mode: QueryMode::Ask,
            table_name: Some("users".to_string()),
        };
        let response = pipeline
            .run(&test_descriptor("prod", "app"), &request)
            .await
            .unwrap();

        assert!(matches!(response, PipelineResponse::Ask { attempts: 1, .. }));
        assert!(executor.executed().is_empty());

        let prompt = &model.prompts()[0];
        assert_eq!(prompt.matches("Table: users, Database: app, Server: prod").count(), 1);
    }

    #[tokio::test]
    async fn test_empty_database_schema_placeholder() {
        let model = Arc::new(ScriptedModel::new([answer("SELECT 1", "one")]));
        let schemas = Arc::new(MemorySchemaStore::default());
        let (pipeline, _) = pipeline(&model, ScriptedExecutor::default(), &schemas);
        let conn = test_descriptor("prod", "empty");

        assert_eq!(pipeline.schema_for(&conn).await.unwrap(), EMPTY_SCHEMA);
        assert_eq!(schemas.get("prod_empty").await.unwrap(), None);
    }

    #[test]
    fn test_single_response_shape() {
        let response = PipelineResponse::Single {
            query: "DELETE FROM t".to_string(),
            summary: "clear t".to_string(),
            columns: Vec::new(),
            results: Vec::new(),
            affected_rows: Some(4),
            attempts: 1,
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "type": "single",
                "query": "DELETE FROM t",
                "summary": "clear t",
                "columns": [],
                "results": [],
                "affected_rows": 4,
                "attempts": 1
            })
        );
    }
}
