use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::generation::prompt::classification_prompt;
use crate::llm::LanguageModel;

/// How a request will be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPlan {
    Single,
    Multi { steps: Vec<String> },
}

#[derive(Debug, thiserror::Error)]
enum ClassificationError {
    #[error("unparseable classification: {0}")]
    Unparseable(String),
    #[error("unknown query_type '{0}'")]
    UnknownType(String),
}

#[derive(Deserialize)]
struct Classification {
    query_type: String,
    #[serde(default)]
    steps: Vec<String>,
}

fn parse_plan(response: &str) -> Result<QueryPlan, ClassificationError> {
    let parsed: Classification = serde_json::from_str(response.trim())
        .map_err(|e| ClassificationError::Unparseable(e.to_string()))?;

    match parsed.query_type.trim().to_ascii_lowercase().as_str() {
        "single" => Ok(QueryPlan::Single),
        // A chain of one is just a single query
        "multi" if parsed.steps.len() < 2 => Ok(QueryPlan::Single),
        "multi" => Ok(QueryPlan::Multi {
            steps: parsed.steps,
        }),
        other => Err(ClassificationError::UnknownType(other.to_string())),
    }
}

pub struct QueryClassifier {
    model: Arc<dyn LanguageModel>,
}

impl QueryClassifier {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Never fails: any problem reaching or reading the model degrades to [`QueryPlan::Single`].
    pub async fn classify(&self, request: &str) -> QueryPlan {
        let response = match self.model.invoke(&classification_prompt(request)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Classification call failed, treating as single query: {}", e);
                return QueryPlan::Single;
            }
        };

        match parse_plan(&response) {
            Ok(plan) => {
                if let QueryPlan::Multi { steps } = &plan {
                    info!("Request decomposed into {} steps", steps.len());
                }
                plan
            }
            Err(e) => {
                warn!("Falling back to single query: {}", e);
                QueryPlan::Single
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedModel;

    #[test]
    fn test_parse_multi_plan() {
        let plan = parse_plan(
            r#"{"query_type": "multi", "steps": ["find inactive users", "delete their sessions"]}"#,
        )
        .unwrap();
        assert_eq!(
            plan,
            QueryPlan::Multi {
                steps: vec![
                    "find inactive users".to_string(),
                    "delete their sessions".to_string()
                ]
            }
        );
    }

    #[test]
    fn test_single_step_multi_is_single() {
        assert_eq!(
            parse_plan(r#"{"query_type": "multi", "steps": ["only one"]}"#).unwrap(),
            QueryPlan::Single
        );
        assert_eq!(
            parse_plan(r#"{"query_type": "single"}"#).unwrap(),
            QueryPlan::Single
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_plan("I think this is a single query").is_err());
        assert!(parse_plan(r#"{"query_type": "batch"}"#).is_err());
    }

    #[tokio::test]
    async fn test_unparseable_answer_falls_back_to_single() {
        let model = Arc::new(ScriptedModel::new(["This needs several steps!"]));
        let classifier = QueryClassifier::new(model);
        assert_eq!(classifier.classify("do things").await, QueryPlan::Single);
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_to_single() {
        let model = Arc::new(ScriptedModel::default());
        model.push_failure("timeout");
        let classifier = QueryClassifier::new(model.clone());
        assert_eq!(classifier.classify("do things").await, QueryPlan::Single);
        assert_eq!(model.calls(), 1);
    }
}
