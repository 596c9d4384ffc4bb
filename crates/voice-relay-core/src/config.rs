//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Spoken on connect before the caller says anything.
pub const DEFAULT_WELCOME_MESSAGE: &str =
    "Welcome to The HighOnSwift Hotel's booking service. How can I help you today?";

/// Persona handed to the language model as its system instruction.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are an expert, friendly, and efficient hotel booking assistant for \"The HighOnSwift Hotel\". Your goal is to help users book a room. Be conversational and concise.";

/// Top-level Voice Relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(default)]
    pub transcription: TranscriptionConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    5001
}

/// Streaming speech-to-text (Deepgram live) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider (only "deepgram" is supported).
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_transcription_key_env")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_transcription_model")]
    pub model: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_true")]
    pub smart_format: bool,

    /// Audio encoding of the client's microphone stream.
    #[serde(default = "default_encoding")]
    pub encoding: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Silence (ms) after which the provider finalizes a segment.
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,

    /// Gap (ms) between words that ends an utterance.
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u32,

    #[serde(default = "default_true")]
    pub interim_results: bool,

    /// Override for the streaming endpoint (e.g. a local mock).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: None,
            api_key_env: default_transcription_key_env(),
            model: default_transcription_model(),
            language: default_language(),
            smart_format: true,
            encoding: default_encoding(),
            sample_rate: default_sample_rate(),
            endpointing_ms: default_endpointing_ms(),
            utterance_end_ms: default_utterance_end_ms(),
            interim_results: true,
            base_url: None,
        }
    }
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

fn default_transcription_provider() -> String {
    "deepgram".into()
}

fn default_transcription_key_env() -> Option<String> {
    Some("DEEPGRAM_API_KEY".into())
}

fn default_transcription_model() -> String {
    "nova-2".into()
}

fn default_language() -> String {
    "en-US".into()
}

fn default_encoding() -> String {
    "linear16".into()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_endpointing_ms() -> u32 {
    200
}

fn default_utterance_end_ms() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

/// Language model (Gemini) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider (only "google" is supported).
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_key_env")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Persona text. Falls back to [`DEFAULT_SYSTEM_INSTRUCTION`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            api_key: None,
            api_key_env: default_llm_key_env(),
            model: default_llm_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_output_tokens: default_max_output_tokens(),
            system_instruction: None,
            base_url: None,
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn system_instruction(&self) -> &str {
        self.system_instruction
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_INSTRUCTION)
    }
}

fn default_llm_provider() -> String {
    "google".into()
}

fn default_llm_key_env() -> Option<String> {
    Some("GEMINI_API_KEY".into())
}

fn default_llm_model() -> String {
    "gemini-1.5-flash".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    1.0
}

fn default_top_k() -> u32 {
    1
}

fn default_max_output_tokens() -> u32 {
    2048
}

/// Text-to-speech (ElevenLabs) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// TTS provider (default: "elevenlabs").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_tts_key_env")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,

    #[serde(default = "default_voice_env")]
    pub voice_id_env: Option<String>,

    #[serde(default = "default_tts_model")]
    pub model_id: String,

    #[serde(default = "default_stability")]
    pub stability: f64,

    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f64,

    /// ElevenLabs latency optimization level (0-4).
    #[serde(default = "default_latency_level")]
    pub optimize_streaming_latency: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: default_tts_key_env(),
            voice_id: None,
            voice_id_env: default_voice_env(),
            model_id: default_tts_model(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            optimize_streaming_latency: default_latency_level(),
            base_url: None,
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn resolve_voice_id(&self) -> Option<String> {
        resolve_secret_field(&self.voice_id, &self.voice_id_env)
    }
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

fn default_tts_key_env() -> Option<String> {
    Some("ELEVENLABS_API_KEY".into())
}

fn default_voice_env() -> Option<String> {
    Some("ELEVENLABS_VOICE_ID".into())
}

fn default_tts_model() -> String {
    "eleven_turbo_v2".into()
}

fn default_stability() -> f64 {
    0.5
}

fn default_similarity_boost() -> f64 {
    0.75
}

fn default_latency_level() -> u8 {
    3
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Greeting spoken when a client connects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for persisted conversation turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voice_relay_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::VoiceRelayError::Io)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5 with `${ENV_VAR}` references).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::VoiceRelayError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(5001)
    }

    /// Gateway bind address.
    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn welcome_message(&self) -> &str {
        self.agent
            .as_ref()
            .and_then(|a| a.welcome_message.as_deref())
            .unwrap_or(DEFAULT_WELCOME_MESSAGE)
    }

    /// Directory holding persisted conversation turns.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.dir.as_ref())
            .map(|d| {
                let expanded = shellexpand::tilde(d);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(|| data_dir().join("conversations"))
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "llm.model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.transcription.resolve_api_key().is_none() {
            warnings.push("Transcription provider has no API key configured".to_string());
        }
        if self.llm.resolve_api_key().is_none() {
            warnings.push("Language model provider has no API key configured".to_string());
        }
        if self.tts.resolve_api_key().is_none() {
            warnings.push("TTS provider has no API key configured".to_string());
        }
        if self.tts.resolve_voice_id().is_none() {
            warnings.push("TTS voice id is not configured".to_string());
        }

        if self.transcription.provider != "deepgram" {
            errors.push(format!(
                "Unsupported transcription provider: {}",
                self.transcription.provider
            ));
        }
        if self.llm.provider != "google" {
            errors.push(format!("Unsupported LLM provider: {}", self.llm.provider));
        }
        if self.tts.provider != "elevenlabs" {
            errors.push(format!("Unsupported TTS provider: {}", self.tts.provider));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            errors.push(format!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.llm.temperature
            ));
        }
        if !(0.0..=1.0).contains(&self.llm.top_p) {
            errors.push(format!("llm.top_p must be within 0.0..=1.0, got {}", self.llm.top_p));
        }
        if self.llm.max_output_tokens == 0 {
            errors.push("llm.max_output_tokens cannot be 0".to_string());
        }
        if self.tts.optimize_streaming_latency > 4 {
            errors.push(format!(
                "tts.optimize_streaming_latency must be 0-4, got {}",
                self.tts.optimize_streaming_latency
            ));
        }
        if self.transcription.sample_rate == 0 {
            errors.push("transcription.sample_rate cannot be 0".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Voice Relay data: `~/.voice_relay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voice_relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_VR_KEY", "dg-test-123") };
        let input = r#"{"key": "${TEST_VR_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("dg-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_VR_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_VR_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 5001);
        assert_eq!(config.transcription.model, "nova-2");
        assert_eq!(config.transcription.sample_rate, 16_000);
        assert_eq!(config.transcription.endpointing_ms, 200);
        assert_eq!(config.transcription.utterance_end_ms, 1000);
        assert_eq!(config.llm.model, "gemini-1.5-flash");
        assert_eq!(config.llm.top_k, 1);
        assert_eq!(config.llm.max_output_tokens, 2048);
        assert_eq!(config.tts.model_id, "eleven_turbo_v2");
        assert_eq!(config.tts.optimize_streaming_latency, 3);
        assert_eq!(config.welcome_message(), DEFAULT_WELCOME_MESSAGE);
        assert_eq!(config.llm.system_instruction(), DEFAULT_SYSTEM_INSTRUCTION);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config = Config::parse(r#"{ llm: { model: "gemini-2.0-flash" }, gateway: {} }"#).unwrap();
        assert_eq!(config.llm.model, "gemini-2.0-flash");
        assert_eq!(config.llm.temperature, 0.7);
        assert_eq!(config.llm.api_key_env.as_deref(), Some("GEMINI_API_KEY"));
        assert_eq!(config.gateway_port(), 5001);
    }

    #[test]
    fn test_resolve_secret_direct_wins() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_VR_TTS_KEY", "from-env") };
        let mut tts = TtsConfig {
            api_key_env: Some("TEST_VR_TTS_KEY".into()),
            ..TtsConfig::default()
        };
        assert_eq!(tts.resolve_api_key(), Some("from-env".into()));

        tts.api_key = Some("direct-key".into());
        assert_eq!(tts.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_VR_TTS_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_get_path() {
        let config = Config::parse(r#"{ gateway: { port: 8080 } }"#).unwrap();
        assert_eq!(config.get_path("gateway.port"), Some(serde_json::json!(8080)));
        assert_eq!(
            config.get_path("transcription.language"),
            Some(serde_json::json!("en-US"))
        );
        assert!(config.get_path("gateway.nope").is_none());
    }

    #[test]
    fn test_validate_missing_keys_warn() {
        let config = Config {
            transcription: TranscriptionConfig {
                api_key_env: None,
                ..Default::default()
            },
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(
            warnings.iter().any(|w| w.contains("Transcription")),
            "Expected a transcription key warning, got: {warnings:?}"
        );
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn test_validate_bad_values_error() {
        let config = Config::parse(
            r#"{ gateway: { port: 0 }, llm: { temperature: 3.5 }, tts: { optimize_streaming_latency: 9 } }"#,
        )
        .unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("port")));
        assert!(errors.iter().any(|e| e.contains("temperature")));
        assert!(errors.iter().any(|e| e.contains("optimize_streaming_latency")));
    }

    #[test]
    fn test_storage_dir_override() {
        let config = Config::parse(r#"{ storage: { dir: "/tmp/vr-turns" } }"#).unwrap();
        assert_eq!(config.storage_dir(), PathBuf::from("/tmp/vr-turns"));
    }
}
