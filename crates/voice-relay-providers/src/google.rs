//! Google Generative AI (Gemini) provider.
//!
//! Uses the non-streaming `generateContent` endpoint: the whole reply is
//! needed before synthesis starts anyway. Auth is via API key in query parameter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use voice_relay_core::turn::Role;

use crate::{ChatMessage, ChatModel, ChatRequest, Credentials};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    pub base_url: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Convert history plus the new user message into Gemini `contents`.
    fn format_contents(&self, history: &[ChatMessage], message: &str) -> Vec<serde_json::Value> {
        history
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Agent => "model",
                };
                json!({ "role": role, "parts": [{ "text": m.text }] })
            })
            .chain(std::iter::once(
                json!({ "role": "user", "parts": [{ "text": message }] }),
            ))
            .collect()
    }
}

// --- Gemini request/response types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<serde_json::Value>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    top_p: f64,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GeminiResponse {
    /// Concatenated text of the first candidate.
    fn into_text(self) -> anyhow::Result<String> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            anyhow::bail!("Gemini blocked the prompt: {reason}");
        }
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Gemini returned no candidates"))?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.is_empty() {
            anyhow::bail!(
                "Gemini returned no text (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            );
        }
        Ok(text)
    }
}

#[async_trait]
impl ChatModel for GeminiProvider {
    fn id(&self) -> &str {
        "google"
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<String> {
        let Credentials::ApiKey { api_key } = credentials;

        let body = GeminiRequest {
            contents: self.format_contents(&request.history, &request.message),
            system_instruction: request
                .system
                .as_ref()
                .map(|s| json!({ "parts": [{ "text": s }] })),
            generation_config: GenerationConfig {
                temperature: request.params.temperature,
                top_p: request.params.top_p,
                top_k: request.params.top_k,
                max_output_tokens: request.params.max_output_tokens,
            },
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );

        debug!(model = %request.model, history = request.history.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .query(&[("key", api_key.as_str())])
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error {status}: {body}");
        }

        let parsed: GeminiResponse = response.json().await?;
        parsed.into_text()
    }
}
