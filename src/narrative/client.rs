//! Narrative generation through a chat-completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::NarrativeError;

use super::request::DiagnosisRequest;

/// Text returned when no narrative could be generated.
pub const PLACEHOLDER_NARRATIVE: &str = "AI-assisted diagnostic opinion could not be generated.";

/// Default request timeout.
pub const DEFAULT_NARRATIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces free text from a prompt.
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, NarrativeError>;
}

/// Outcome of a narrative request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Narrative {
    pub text: String,
    /// `false` when `text` is the placeholder
    pub generated: bool,
}

/// Generate a narrative, falling back to [`PLACEHOLDER_NARRATIVE`] when no
/// generator is configured or the generator fails.
pub async fn generate_or_placeholder(
    generator: Option<&dyn NarrativeGenerator>,
    request: &DiagnosisRequest,
) -> Narrative {
    let result = match generator {
        Some(generator) => generator.generate(&request.prompt()).await,
        None => Err(NarrativeError::Disabled),
    };

    match result {
        Ok(text) => Narrative {
            text,
            generated: true,
        },
        Err(NarrativeError::Disabled) => {
            debug!("Narrative generation disabled, returning placeholder");
            placeholder()
        }
        Err(e) => {
            warn!(error = %e, "Narrative generation failed, returning placeholder");
            placeholder()
        }
    }
}

fn placeholder() -> Narrative {
    Narrative {
        text: PLACEHOLDER_NARRATIVE.to_string(),
        generated: false,
    }
}

// =============================================================================
// Chat Completions Client
// =============================================================================

/// Connection settings for a chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct NarrativeConfig {
    /// Full URL of the chat-completions endpoint
    pub endpoint: String,
    /// Bearer token, if the endpoint requires one
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub struct ChatCompletionClient {
    http: reqwest::Client,
    config: NarrativeConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: String,
}

impl ChatCompletionClient {
    pub fn new(config: NarrativeConfig) -> Result<Self, NarrativeError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NarrativeError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &NarrativeConfig {
        &self.config
    }
}

#[async_trait]
impl NarrativeGenerator for ChatCompletionClient {
    async fn generate(&self, prompt: &str) -> Result<String, NarrativeError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut request = self.http.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NarrativeError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NarrativeError::Status {
                status: status.as_u16(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| NarrativeError::Transport(e.to_string()))?;
        parse_completion(&text)
    }
}

/// Extract the first completion from a chat-completions response body.
pub fn parse_completion(body: &str) -> Result<String, NarrativeError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| NarrativeError::MalformedResponse(e.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| NarrativeError::MalformedResponse("no choices in response".to_string()))
}

// =============================================================================
// Tests
// =============================================================================
