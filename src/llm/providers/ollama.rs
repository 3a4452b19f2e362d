use crate::config::LlmConfig;
use crate::llm::{LanguageModel, LlmError, check_status, http_client};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize, Debug)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    done: Option<bool>,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string());

        Ok(Self {
            client: http_client(config)?,
            api_url,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

fn extract_response(body: &str) -> Result<String, LlmError> {
    let parsed = serde_json::from_str::<OllamaResponse>(body).map_err(|e| {
        error!("Failed to parse Ollama response: {} - Response was: {}", e, body);
        LlmError::ResponseError(format!(
            "Failed to parse Ollama response: {} - Response was: {}",
            e, body
        ))
    })?;

    if parsed.done == Some(false) {
        debug!("Ollama reported an unfinished generation");
    }

    if parsed.response.trim().is_empty() {
        return Err(LlmError::ResponseError("Ollama returned an empty response".to_string()));
    }

    Ok(parsed.response)
}

#[async_trait]
impl LanguageModel for OllamaProvider {
    async fn invoke(&self, prompt: &str) -> Result<String, LlmError> {
        info!("Sending request to Ollama with model: {}", self.model);
        debug!("API URL: {}", self.api_url);

        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        let body = check_status(response, "Ollama")
            .await?
            .text()
            .await
            .map_err(|e| LlmError::ResponseError(format!("Failed to read response body: {}", e)))?;

        debug!("Raw response from Ollama: {}", body);
        extract_response(&body)
    }
}
