use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::db::executor::{ExecutionError, ExecutionErrorKind};
use crate::db::schema_store::SchemaError;
use crate::generation::chain::StepResult;
use crate::generation::orchestrator::GenerationError;
use crate::generation::pipeline::PipelineError;

/// JSON error body. Only the fields relevant to the failure are present.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepResult>>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error: None,
            query: None,
            errors: None,
            attempts: None,
            failed_step: None,
            steps: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    fn with_query(mut self, query: String) -> Self {
        self.query = Some(query);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        let (status, message) = match err.kind {
            ExecutionErrorKind::ConstraintViolation => (StatusCode::BAD_REQUEST, "Constraint violation"),
            ExecutionErrorKind::Statement => (StatusCode::BAD_REQUEST, "Query execution failed"),
            ExecutionErrorKind::Connection => (StatusCode::BAD_GATEWAY, "Database unavailable"),
        };
        ApiError::new(status, message).with_error(err.message)
    }
}

impl From<SchemaError> for ApiError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::Introspection(e) => e.into(),
            other => {
                error!("Schema store failure: {}", other);
                ApiError::internal("Schema unavailable").with_error(other)
            }
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Exhausted { attempts, history } => {
                let mut api = ApiError::internal("Failed to generate valid query");
                api.errors = Some(history);
                api.attempts = Some(attempts);
                api
            }
            GenerationError::Llm(e) => {
                ApiError::new(StatusCode::BAD_GATEWAY, "Language model request failed").with_error(e)
            }
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Generation(e) => e.into(),
            PipelineError::ConstraintViolation { error, query } => {
                ApiError::from(error).with_query(query)
            }
            PipelineError::Execution(e) => e.into(),
            PipelineError::Chain(failure) => {
                let mut api = ApiError::internal(format!("Error in step {}", failure.step_index))
                    .with_error(&failure.cause);
                api.failed_step = Some(failure.step_index);
                api.steps = Some(failure.completed);
                api
            }
            PipelineError::Schema(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::chain::{ChainStepFailure, StepError};
    use crate::llm::LlmError;
    use serde_json::json;

    fn body(err: &ApiError) -> serde_json::Value {
        serde_json::to_value(err).unwrap()
    }

    #[test]
    fn test_constraint_violation_is_bad_request_with_engine_text() {
        let err: ApiError = PipelineError::ConstraintViolation {
            error: ExecutionError {
                kind: ExecutionErrorKind::ConstraintViolation,
                message: "violates foreign key constraint \"fk_orders\"".to_string(),
            },
            query: "DELETE FROM users".to_string(),
        }
        .into();

        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body(&err),
            json!({
                "message": "Constraint violation",
                "error": "violates foreign key constraint \"fk_orders\"",
                "query": "DELETE FROM users"
            })
        );
    }

    #[test]
    fn test_exhaustion_lists_history() {
        let err: ApiError = PipelineError::Generation(GenerationError::Exhausted {
            attempts: 3,
            history: vec!["a".into(), "b".into(), "c".into()],
        })
        .into();

        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&err)["errors"], json!(["a", "b", "c"]));
        assert_eq!(body(&err)["attempts"], json!(3));
    }

    #[test]
    fn test_model_failure_is_bad_gateway() {
        let err: ApiError = GenerationError::Llm(LlmError::ConnectionError("refused".into())).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_chain_failure_reports_step_and_completed() {
        let completed = vec![StepResult {
            step: "list".into(),
            query: "SELECT 1".into(),
            summary: "one".into(),
            results: Vec::new(),
        }];
        let err: ApiError = PipelineError::Chain(ChainStepFailure {
            completed,
            step_index: 2,
            step: "delete".into(),
            cause: StepError::Execution(ExecutionError {
                kind: ExecutionErrorKind::Statement,
                message: "syntax error".into(),
            }),
        })
        .into();

        let value = body(&err);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(value["message"], "Error in step 2");
        assert_eq!(value["failed_step"], 2);
        assert_eq!(value["error"], "syntax error");
        assert_eq!(value["steps"][0]["query"], "SELECT 1");
    }
}
