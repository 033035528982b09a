use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{GeneratorConfig, Provider};

/// Stop token the small chat-tuned local models emit at the end of a turn.
pub const END_OF_TURN: &str = "<end_of_turn>";

/// LLM client for a local Ollama server or an Anthropic-compatible API
pub struct LLMClient {
    client: Client,
    provider: Provider,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    top_k: u32,
    top_p: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("LLM request timed out: {0}")]
    Timeout(String),
    #[error("LLM service unreachable: {0}")]
    Unreachable(String),
    #[error("LLM quota exceeded ({status})")]
    Quota { status: u16 },
    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("undecodable LLM response: {0}")]
    Decode(String),
    #[error("LLM returned no text")]
    Empty,
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl From<reqwest::Error> for LLMError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LLMError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            LLMError::Unreachable(e.to_string())
        } else {
            LLMError::Decode(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    system: Option<String>,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Clone, Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_k: u32,
    top_p: f64,
    num_predict: u32,
    stop: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorBody>,
    msg: Option<String>,
}

/// Anthropic nests an object under `error`, Ollama sends a plain string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detail { message: Option<String> },
    Text(String),
}

/// Response from LLM completion
#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl LLMClient {
    /// Create a new LLM client
    pub fn new(config: &GeneratorConfig, api_key: Option<String>) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LLMError::Client(e.to_string()))?;
        Ok(Self {
            client,
            provider: config.provider,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
        })
    }

    /// Create client from config, taking the key from `LLM_API_KEY` when set
    pub fn from_config(config: &GeneratorConfig) -> Result<Self, LLMError> {
        Self::new(config, config.resolved_api_key())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a prompt to the LLM and get a response
    pub async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        max_tokens: u32,
    ) -> Result<LLMResponse, LLMError> {
        info!(
            model = %self.model,
            prompt_length = prompt.len(),
            "sending LLM request"
        );

        let response = match self.provider {
            Provider::Ollama => self.complete_ollama(prompt, system_prompt, max_tokens).await?,
            Provider::Anthropic => {
                self.complete_anthropic(prompt, system_prompt, max_tokens)
                    .await?
            }
        };

        if response.content.trim().is_empty() {
            return Err(LLMError::Empty);
        }

        info!(
            model = %response.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "LLM response received"
        );
        Ok(response)
    }

    async fn complete_ollama(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        max_tokens: u32,
    ) -> Result<LLMResponse, LLMError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: system_prompt.map(|s| s.to_string()),
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
                top_k: self.top_k,
                top_p: self.top_p,
                num_predict: max_tokens,
                stop: vec![END_OF_TURN.to_string()],
            },
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let body = read_body(response).await?;

        let generated: GenerateResponse =
            serde_json::from_str(&body).map_err(|e| LLMError::Decode(e.to_string()))?;
        Ok(LLMResponse {
            content: generated.response,
            model: generated.model.unwrap_or_else(|| self.model.clone()),
            input_tokens: generated.prompt_eval_count,
            output_tokens: generated.eval_count,
        })
    }

    async fn complete_anthropic(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        max_tokens: u32,
    ) -> Result<LLMResponse, LLMError> {
        let url = format!("{}/v1/messages", self.base_url);
        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens,
            system: system_prompt.map(|s| s.to_string()),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: self.temperature,
        };

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("anthropic-version", "2023-06-01");
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        let response = builder.json(&request).send().await?;
        let body = read_body(response).await?;

        let chat_response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| LLMError::Decode(e.to_string()))?;

        // Extract text content
        let content = chat_response
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .filter_map(|block| block.text.clone())
            .collect::<Vec<_>>()
            .join("");

        let usage = chat_response.usage.unwrap_or(Usage {
            input_tokens: 0,
            output_tokens: 0,
        });

        Ok(LLMResponse {
            content,
            model: chat_response.model.unwrap_or_else(|| self.model.clone()),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })
    }
}

/// Body of a successful response, or the classified API error.
async fn read_body(response: reqwest::Response) -> Result<String, LLMError> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }

    debug!(status = status.as_u16(), body = %body, "LLM API error body");
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::PAYMENT_REQUIRED {
        return Err(LLMError::Quota {
            status: status.as_u16(),
        });
    }

    let message = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .and_then(|err| {
            err.msg.or(match err.error {
                Some(ErrorBody::Detail { message }) => message,
                Some(ErrorBody::Text(text)) => Some(text),
                None => None,
            })
        })
        .unwrap_or(body);

    Err(LLMError::Api {
        status: status.as_u16(),
        message,
    })
}
