//! Streaming TTS: yields audio chunks as they arrive from the provider.

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;

use voice_relay_core::config::TtsConfig;

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";

/// Audio bytes in provider order. Ends when the provider finishes.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Turns reply text into a stream of encoded audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesis. A rejected request fails here, before any chunk.
    async fn stream(&self, text: &str) -> Result<AudioStream>;
}

/// ElevenLabs streaming synthesis (MP3 output).
pub struct ElevenLabsSynthesizer {
    config: TtsConfig,
    base_url: String,
    client: reqwest::Client,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: TtsConfig) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Self {
            config,
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

/// Build the streaming synthesis URL for a voice.
pub fn build_tts_url(base_url: &str, voice_id: &str) -> String {
    format!("{base_url}/v1/text-to-speech/{voice_id}/stream")
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn stream(&self, text: &str) -> Result<AudioStream> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;
        let voice_id = self
            .config
            .resolve_voice_id()
            .ok_or_else(|| anyhow::anyhow!("No TTS voice configured"))?;

        let url = build_tts_url(&self.base_url, &voice_id);
        debug!(voice_id, model = %self.config.model_id, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(&url)
            .query(&[(
                "optimize_streaming_latency",
                self.config.optimize_streaming_latency.to_string(),
            )])
            .header("xi-api-key", &api_key)
            .header("Accept", "audio/mpeg")
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.config.model_id,
                "voice_settings": {
                    "stability": self.config.stability,
                    "similarity_boost": self.config.similarity_boost,
                },
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| anyhow::anyhow!("TTS stream error: {e}")));
        Ok(Box::pin(stream))
    }
}
