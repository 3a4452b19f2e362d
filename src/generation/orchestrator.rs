//! Bounded-retry SQL generation.
//!
//! One call runs attempts `starting_attempt..=max_attempts`. Each attempt builds a prompt that
//! carries every failure recorded so far, asks the model, and validates the answer. Validation
//! failures are appended to the caller's [`ErrorHistory`] and retried; model failures are not.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::generation::chain::ChainContext;
use crate::generation::parse::{ParsedGenerationResult, parse_generation_response};
use crate::generation::prompt::generation_prompt;
use crate::llm::{LanguageModel, LlmError};

/// Ordered record of everything that went wrong for one request. Append-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorHistory {
    entries: Vec<String>,
}

impl ErrorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

/// What to generate SQL for.
#[derive(Debug, Clone, Copy)]
pub struct GenerationTask<'a> {
    pub request: &'a str,
    pub schema: &'a str,
    pub chain: Option<&'a ChainContext>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub result: ParsedGenerationResult,
    /// 1-based attempt that produced the result.
    pub attempt: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Failed to generate valid SQL after {attempts} attempts. Last error: {}", .history.last().map(String::as_str).unwrap_or("none"))]
    Exhausted { attempts: u32, history: Vec<String> },
    #[error(transparent)]
    Llm(#[from] LlmError),
}

pub struct SqlGenerator {
    model: Arc<dyn LanguageModel>,
    max_attempts: u32,
}

impl SqlGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, max_attempts: u32) -> Self {
        Self {
            model,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn generate(
        &self,
        task: GenerationTask<'_>,
        history: &mut ErrorHistory,
        starting_attempt: u32,
    ) -> Result<Generated, GenerationError> {
        let mut attempt = starting_attempt.max(1);

        while attempt <= self.max_attempts {
            let prompt = generation_prompt(task.request, task.schema, task.chain, history, attempt);
            debug!("Generation prompt for attempt {}: {}", attempt, prompt);

            let response = self.model.invoke(&prompt).await?;
            debug!("Model response for attempt {}: {}", attempt, response);

            match parse_generation_response(&response) {
                Ok(result) => {
                    info!("Generated SQL on attempt {}: {}", attempt, result.query);
                    return Ok(Generated { result, attempt });
                }
                Err(e) => {
                    let entry = format!("Invalid JSON format in attempt {}: {}", attempt, e);
                    warn!("{}", entry);
                    history.push(entry);
                    attempt += 1;
                }
            }
        }

        Err(GenerationError::Exhausted {
            attempts: attempt - 1,
            history: history.entries().to_vec(),
        })
    }
}
