use serde::Serialize;
use tracing::{error, info};

use crate::db::connection::ConnectionDescriptor;
use crate::db::executor::{ExecutionError, SqlExecutor};
use crate::db::normalize::NormalizedRow;
use crate::generation::orchestrator::{ErrorHistory, GenerationError, GenerationTask, SqlGenerator};

/// State threaded from one chain step to the next.
#[derive(Debug, Clone, Default)]
pub struct ChainContext {
    pub schema: String,
    /// Full result set of the step that just ran.
    pub previous_results: Vec<NormalizedRow>,
    /// Every statement executed so far, oldest first.
    pub previous_queries: Vec<String>,
}

impl ChainContext {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step: String,
    pub query: String,
    pub summary: String,
    pub results: Vec<NormalizedRow>,
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// A chain stopped at `step_index` (1-based). Steps before it ran and stay applied.
#[derive(Debug, thiserror::Error)]
#[error("Error in step {step_index}: {cause}")]
pub struct ChainStepFailure {
    pub completed: Vec<StepResult>,
    pub step_index: usize,
    pub step: String,
    pub cause: StepError,
}

pub struct ChainExecutor<'a> {
    generator: &'a SqlGenerator,
    executor: &'a dyn SqlExecutor,
}

impl<'a> ChainExecutor<'a> {
    pub fn new(generator: &'a SqlGenerator, executor: &'a dyn SqlExecutor) -> Self {
        Self {
            generator,
            executor,
        }
    }

    pub async fn run_chain(
        &self,
        steps: &[String],
        connection: &ConnectionDescriptor,
        schema: &str,
    ) -> Result<Vec<StepResult>, ChainStepFailure> {
        let mut context = ChainContext::new(schema);
        let mut completed = Vec::with_capacity(steps.len());

        for (idx, step) in steps.iter().enumerate() {
            info!("Running chain step {}/{}: {}", idx + 1, steps.len(), step);

            match self.run_step(step, connection, &context).await {
                Ok(result) => {
                    context.previous_queries.push(result.query.clone());
                    context.previous_results = result.results.clone();
                    completed.push(result);
                }
                Err(cause) => {
                    error!("Error in step {}: {}", idx + 1, cause);
                    return Err(ChainStepFailure {
                        completed,
                        step_index: idx + 1,
                        step: step.clone(),
                        cause,
                    });
                }
            }
        }

        Ok(completed)
    }

    async fn run_step(
        &self,
        step: &str,
        connection: &ConnectionDescriptor,
        context: &ChainContext,
    ) -> Result<StepResult, StepError> {
        let task = GenerationTask {
            request: step,
            schema: &context.schema,
            chain: Some(context),
        };

        // Each step gets its own budget and history
        let mut history = ErrorHistory::new();
        let generated = self.generator.generate(task, &mut history, 1).await?;
        let outcome = self
            .executor
            .execute(connection, &generated.result.query)
            .await?;

        Ok(StepResult {
            step: step.to_string(),
            query: generated.result.query,
            summary: generated.result.summary,
            results: outcome.into_context_rows(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::connection::test_descriptor;
    use crate::db::executor::{ExecutionErrorKind, QueryOutcome};
    use crate::llm::mock::ScriptedModel;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Answers by exact SQL text and records every statement it ran.
    #[derive(Default)]
    pub(crate) struct ScriptedExecutor {
        pub answers: HashMap<String, Result<QueryOutcome, ExecutionError>>,
        pub executed: Mutex<Vec<String>>,
        pub schema: String,
    }

    impl ScriptedExecutor {
        pub fn answer(mut self, sql: &str, outcome: Result<QueryOutcome, ExecutionError>) -> Self {
            self.answers.insert(sql.to_string(), outcome);
            self
        }

        pub fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SqlExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _connection: &ConnectionDescriptor,
            sql: &str,
        ) -> Result<QueryOutcome, ExecutionError> {
            self.executed.lock().unwrap().push(sql.to_string());
            self.answers.get(sql).cloned().unwrap_or_else(|| {
                Err(ExecutionError {
                    kind: ExecutionErrorKind::Statement,
                    message: format!("unexpected statement: {}", sql),
                })
            })
        }

        async fn introspect(
            &self,
            _connection: &ConnectionDescriptor,
        ) -> Result<String, ExecutionError> {
            Ok(self.schema.clone())
        }
    }

    pub(crate) fn answer(query: &str, summary: &str) -> String {
        json!({"query": query, "summary": summary}).to_string()
    }

    pub(crate) fn rows(values: &[i64]) -> QueryOutcome {
        QueryOutcome::Rows {
            columns: vec!["id".to_string()],
            rows: values
                .iter()
                .map(|v| {
                    let mut row = NormalizedRow::new();
                    row.insert("id".to_string(), json!(v));
                    row
                })
                .collect(),
        }
    }

    fn steps(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_chain_threads_results_forward() {
        let model = Arc::new(ScriptedModel::new([
            answer("SELECT id FROM users WHERE active = false", "inactive users"),
            answer("DELETE FROM sessions WHERE user_id IN (1, 2)", "drop sessions"),
        ]));
        let generator = SqlGenerator::new(model.clone(), 3);
        let executor = ScriptedExecutor::default()
            .answer("SELECT id FROM users WHERE active = false", Ok(rows(&[1, 2])))
            .answer(
                "DELETE FROM sessions WHERE user_id IN (1, 2)",
                Ok(QueryOutcome::Affected { affected_rows: 5 }),
            );

        let results = ChainExecutor::new(&generator, &executor)
            .run_chain(
                &steps(&["find inactive users", "delete their sessions"]),
                &test_descriptor("prod", "app"),
                "Table: users",
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].results.len(), 2);
        assert_eq!(results[1].results[0]["affected_rows"], json!(5));

        // Step 2 saw step 1's rows and statement
        let prompts = model.prompts();
        assert!(prompts[1].contains("\"id\": 2"));
        assert!(prompts[1].contains("1. SELECT id FROM users WHERE active = false"));
        assert!(!prompts[0].contains("Previous step results"));
    }

    #[tokio::test]
    async fn test_failure_at_step_two_keeps_step_one_and_skips_step_three() {
        let model = Arc::new(ScriptedModel::new([
            answer("SELECT id FROM orders", "orders"),
            answer("DELETE FROM orders WHERE id = 1", "delete order"),
            answer("SELECT COUNT(*) FROM orders", "count"),
        ]));
        let generator = SqlGenerator::new(model.clone(), 3);
        let fk_error = ExecutionError {
            kind: ExecutionErrorKind::ConstraintViolation,
            message: "update or delete on table \"orders\" violates foreign key constraint \"order_items_order_id_fkey\" on table \"order_items\"".to_string(),
        };
        let executor = ScriptedExecutor::default()
            .answer("SELECT id FROM orders", Ok(rows(&[1])))
            .answer("DELETE FROM orders WHERE id = 1", Err(fk_error.clone()))
            .answer("SELECT COUNT(*) FROM orders", Ok(rows(&[0])));

        let failure = ChainExecutor::new(&generator, &executor)
            .run_chain(
                &steps(&["list orders", "delete order 1", "count orders"]),
                &test_descriptor("prod", "shop"),
                "Table: orders",
            )
            .await
            .unwrap_err();

        assert_eq!(failure.step_index, 2);
        assert_eq!(failure.step, "delete order 1");
        assert_eq!(failure.completed.len(), 1);
        assert_eq!(failure.completed[0].query, "SELECT id FROM orders");
        match &failure.cause {
            StepError::Execution(e) => assert_eq!(e, &fk_error),
            other => panic!("unexpected cause {:?}", other),
        }

        assert_eq!(model.calls(), 2);
        assert_eq!(
            executor.executed(),
            vec!["SELECT id FROM orders", "DELETE FROM orders WHERE id = 1"]
        );
    }

    #[tokio::test]
    async fn test_each_step_starts_with_fresh_history() {
        let model = Arc::new(ScriptedModel::new([
            "garbage".to_string(),
            answer("SELECT id FROM a", "a"),
            answer("SELECT id FROM b", "b"),
        ]));
        let generator = SqlGenerator::new(model.clone(), 3);
        let executor = ScriptedExecutor::default()
            .answer("SELECT id FROM a", Ok(rows(&[1])))
            .answer("SELECT id FROM b", Ok(rows(&[2])));

        ChainExecutor::new(&generator, &executor)
            .run_chain(
                &steps(&["read a", "read b"]),
                &test_descriptor("prod", "app"),
                "Table: a",
            )
            .await
            .unwrap();

        let prompts = model.prompts();
        assert!(prompts[1].contains("Previous errors encountered"));
        assert!(!prompts[2].contains("Previous errors encountered"));
    }
}
