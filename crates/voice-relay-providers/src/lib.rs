//! Language model provider abstraction.
//!
//! Each provider implements the [`ChatModel`] trait to turn a persona, a chat
//! history, and a new user message into a single reply.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use voice_relay_core::config::LlmConfig;
use voice_relay_core::turn::Role;

pub mod google;

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
}

/// One prior message presented to the model as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

/// Sampling parameters forwarded to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl From<&LlmConfig> for GenerationParams {
    fn from(config: &LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_output_tokens: config.max_output_tokens,
        }
    }
}

/// A single chat turn request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub history: Vec<ChatMessage>,
    pub message: String,
    pub params: GenerationParams,
}

/// The core LLM provider trait.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider identifier (e.g., "google").
    fn id(&self) -> &str;

    /// Send the history plus the new message and return the reply text.
    async fn complete(
        &self,
        request: &ChatRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<String>;
}
