//! Single-turn conversation engine.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use voice_relay_core::config::LlmConfig;
use voice_relay_core::error::{Result, VoiceRelayError};
use voice_relay_core::turn::ConversationTurn;
use voice_relay_core::turn_store::TurnStore;
use voice_relay_providers::{ChatModel, ChatRequest, Credentials, GenerationParams};

use crate::history::turns_to_messages;

/// Produces agent replies from stored history plus a new caller utterance.
pub struct ConversationEngine {
    model: Arc<dyn ChatModel>,
    store: Arc<dyn TurnStore>,
    config: LlmConfig,
}

impl ConversationEngine {
    pub fn new(model: Arc<dyn ChatModel>, store: Arc<dyn TurnStore>, config: LlmConfig) -> Self {
        Self {
            model,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TurnStore> {
        &self.store
    }

    /// Answer `user_text` in the context of the session's prior turns.
    ///
    /// On success the user turn and then the agent turn are appended to the
    /// store. Any failure propagates and leaves the store untouched.
    pub async fn respond(&self, session_id: &str, user_text: &str) -> Result<String> {
        let start = Instant::now();

        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| VoiceRelayError::Config("No LLM API key configured".into()))?;
        let credentials = Credentials::ApiKey { api_key };

        let prior = self.store.history(session_id).await?;
        debug!(session_id, prior_turns = prior.len(), "Replaying conversation history");

        let request = ChatRequest {
            model: self.config.model.clone(),
            system: Some(self.config.system_instruction().to_string()),
            history: turns_to_messages(&prior),
            message: user_text.to_string(),
            params: GenerationParams::from(&self.config),
        };

        let reply = match self.model.complete(&request, &credentials).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session_id, provider = self.model.id(), error = %e, "Model call failed");
                return Err(VoiceRelayError::Provider(format!("{e:#}")));
            }
        };

        self.store
            .append(&[
                ConversationTurn::user(session_id, user_text),
                ConversationTurn::agent(session_id, reply.clone()),
            ])
            .await?;

        info!(
            session_id,
            duration_ms = start.elapsed().as_millis() as u64,
            reply_len = reply.len(),
            "Agent reply ready"
        );
        Ok(reply)
    }
}
