use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use voice_relay_agent::ConversationEngine;
use voice_relay_core::config::Config;
use voice_relay_core::turn_store::{JsonlTurnStore, TurnStore};
use voice_relay_gateway::{GatewayState, SessionServices};
use voice_relay_media::stt::DeepgramTranscriber;
use voice_relay_media::tts_stream::ElevenLabsSynthesizer;
use voice_relay_providers::google::GeminiProvider;

mod logging;

#[derive(Parser)]
#[command(
    name = "voice-relay",
    about = "Real-time voice agent relay: browser audio to STT, LLM and TTS and back",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Gateway {
        /// Port to listen on (default: 5001)
        #[arg(long)]
        port: Option<u16>,

        /// Do not serve the demo page
        #[arg(long)]
        no_ui: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print the stored conversation of a session (or list sessions)
    History {
        /// Session id; omit to list sessions with stored turns
        session_id: Option<String>,

        /// Print turns as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show system status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    logging::init(cli.verbose, config.logging.as_ref());

    match cli.command {
        Commands::Gateway { port, no_ui } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            run_gateway(config, port, !no_ui).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("Configuration has {} error(s)", errors.len());
                }
                println!("Configuration OK ({})", config_path.display());
            }
        },
        Commands::History { session_id, json } => {
            let store = JsonlTurnStore::new(config.storage_dir());
            match session_id {
                Some(id) => {
                    let turns = store.history(&id).await?;
                    if turns.is_empty() {
                        println!("No stored turns for session {id}");
                    }
                    for turn in turns {
                        if json {
                            println!("{}", serde_json::to_string(&turn)?);
                        } else {
                            println!(
                                "[{}] {}: {}",
                                turn.created_at.format("%Y-%m-%d %H:%M:%S"),
                                turn.role,
                                turn.text
                            );
                        }
                    }
                }
                None => {
                    for id in store.sessions().await? {
                        println!("{id}");
                    }
                }
            }
        }
        Commands::Status => {
            println!("Voice Relay v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway: {}:{}", config.gateway_bind(), config.gateway_port());
            println!("Storage: {}", config.storage_dir().display());
            let sessions = JsonlTurnStore::new(config.storage_dir()).sessions().await?;
            println!("Stored sessions: {}", sessions.len());
            let (warnings, errors) = config.validate();
            println!("Validation: {} warning(s), {} error(s)", warnings.len(), errors.len());
        }
    }

    Ok(())
}

/// Wire the real collaborators and serve until Ctrl+C.
async fn run_gateway(config: Config, port: u16, ui_enabled: bool) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        tracing::warn!("{w}");
    }
    if !errors.is_empty() {
        for e in &errors {
            tracing::error!("{e}");
        }
        anyhow::bail!("Refusing to start with an invalid configuration");
    }

    let store: Arc<dyn TurnStore> = Arc::new(JsonlTurnStore::new(config.storage_dir()));
    let model = Arc::new(GeminiProvider::new(config.llm.base_url.as_deref()));
    let engine = ConversationEngine::new(model, store, config.llm.clone());

    let services = SessionServices {
        engine: Arc::new(engine),
        transcriber: Arc::new(DeepgramTranscriber::new(config.transcription.clone())),
        synthesizer: Arc::new(ElevenLabsSynthesizer::new(config.tts.clone())),
    };

    tracing::info!(
        port,
        storage = %config.storage_dir().display(),
        stt = %config.transcription.model,
        llm = %config.llm.model,
        tts = %config.tts.model_id,
        "Starting Voice Relay gateway"
    );

    #[allow(unused_mut)]
    let mut state = GatewayState::new(Arc::new(config), services);

    #[cfg(feature = "metrics")]
    {
        let handle = voice_relay_gateway::metrics::install_prometheus_recorder()?;
        state = state.with_metrics(handle);
        tracing::info!("Prometheus metrics at /metrics");
    }

    voice_relay_gateway::start_gateway(Arc::new(state), port, ui_enabled).await
}
