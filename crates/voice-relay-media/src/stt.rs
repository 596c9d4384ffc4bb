//! Streaming speech-to-text over the Deepgram live WebSocket API.
//!
//! A [`TranscriptionHandle`] owns one provider connection. Audio goes in
//! through [`TranscriptionHandle::send_audio`]; typed [`TranscriptionEvent`]s
//! come out on `events`, to be consumed by whichever task owns the session.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use voice_relay_core::config::TranscriptionConfig;

const DEFAULT_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Deepgram drops idle streams after ~10s without audio.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;
const KEEP_ALIVE: &str = r#"{"type":"KeepAlive"}"#;

/// A transcript hypothesis from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptResult {
    pub text: String,
    /// The text of this segment will not change any more.
    pub is_final: bool,
    /// The speaker paused long enough to end the utterance.
    pub speech_final: bool,
}

/// Events emitted by an open transcription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionEvent {
    Transcript(TranscriptResult),
    /// Word-gap based utterance boundary (fires even when `speech_final` never does).
    UtteranceEnd,
    Error(String),
    /// The provider connection is gone; no further events follow.
    Closed,
}

/// Commands accepted by the stream pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Audio(Vec<u8>),
    Finish,
}

/// Owner side of one live transcription stream.
///
/// Dropping the handle aborts the connection; [`finish`](Self::finish) closes it
/// gracefully.
pub struct TranscriptionHandle {
    commands: mpsc::UnboundedSender<StreamCommand>,
    pub events: mpsc::UnboundedReceiver<TranscriptionEvent>,
    task: Option<JoinHandle<()>>,
}

impl TranscriptionHandle {
    /// Build a handle from raw channel ends, without a pump task.
    pub fn from_parts(
        commands: mpsc::UnboundedSender<StreamCommand>,
        events: mpsc::UnboundedReceiver<TranscriptionEvent>,
    ) -> Self {
        Self {
            commands,
            events,
            task: None,
        }
    }

    /// Queue raw audio for the provider. Returns false if the stream is gone.
    pub fn send_audio(&self, bytes: Vec<u8>) -> bool {
        self.commands.send(StreamCommand::Audio(bytes)).is_ok()
    }

    /// Ask the provider to flush and close the stream.
    pub fn finish(mut self) {
        let _ = self.commands.send(StreamCommand::Finish);
        // Detach: the pump exits on its own after sending CloseStream.
        self.task.take();
    }
}

impl Drop for TranscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens live transcription streams.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn open(&self, session_id: &str) -> anyhow::Result<TranscriptionHandle>;
}

/// Deepgram live transcription client.
pub struct DeepgramTranscriber {
    config: TranscriptionConfig,
}

impl DeepgramTranscriber {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self { config }
    }

    /// Build the listen URL with all stream options as query parameters.
    pub fn listen_url(&self) -> anyhow::Result<url::Url> {
        let c = &self.config;
        let base = c.base_url.as_deref().unwrap_or(DEFAULT_LISTEN_URL);
        let url = url::Url::parse_with_params(
            base,
            &[
                ("model", c.model.clone()),
                ("language", c.language.clone()),
                ("smart_format", c.smart_format.to_string()),
                ("encoding", c.encoding.clone()),
                ("sample_rate", c.sample_rate.to_string()),
                ("channels", "1".to_string()),
                ("endpointing", c.endpointing_ms.to_string()),
                ("utterance_end_ms", c.utterance_end_ms.to_string()),
                ("interim_results", c.interim_results.to_string()),
            ],
        )
        .with_context(|| format!("invalid transcription URL: {base}"))?;
        Ok(url)
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn open(&self, session_id: &str) -> anyhow::Result<TranscriptionHandle> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;

        let url = self.listen_url()?;
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {api_key}"))?,
        );

        debug!(session_id, model = %self.config.model, "Opening transcription stream");
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("transcription connect failed")?;
        info!(session_id, "Transcription stream opened");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(ws, command_rx, event_tx, session_id.to_string()));

        Ok(TranscriptionHandle {
            commands: command_tx,
            events: event_rx,
            task: Some(task),
        })
    }
}

type DeepgramSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Shuttle audio up and results down until either side closes.
async fn pump(
    ws: DeepgramSocket,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    events: mpsc::UnboundedSender<TranscriptionEvent>,
    session_id: String,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    let mut last_audio = Instant::now();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(StreamCommand::Audio(bytes)) => {
                    last_audio = Instant::now();
                    if let Err(e) = ws_tx.send(Message::Binary(bytes.into())).await {
                        let _ = events.send(TranscriptionEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(StreamCommand::Finish) | None => {
                    let _ = ws_tx.send(Message::Text(CLOSE_STREAM.into())).await;
                    let _ = ws_tx.close().await;
                    debug!(session_id = %session_id, "Transcription stream finished");
                    break;
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_message(text.as_str()) {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(session_id = %session_id, ?frame, "Provider closed transcription stream");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session_id = %session_id, %e, "Transcription socket error");
                    let _ = events.send(TranscriptionEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },
            _ = keepalive.tick() => {
                if last_audio.elapsed() >= KEEPALIVE_INTERVAL
                    && ws_tx.send(Message::Text(KEEP_ALIVE.into())).await.is_err()
                {
                    break;
                }
            }
        }
    }

    let _ = events.send(TranscriptionEvent::Closed);
}

// --- Deepgram message types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DeepgramMessage {
    Results(ResultsMessage),
    UtteranceEnd {},
    Error {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultsMessage {
    channel: ResultsChannel,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
}

#[derive(Debug, Deserialize)]
struct ResultsChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Map a provider text frame to an event. Metadata and unparsable frames yield `None`.
fn parse_message(text: &str) -> Option<TranscriptionEvent> {
    let msg: DeepgramMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(%e, "Ignoring unparsable transcription message");
            return None;
        }
    };
    match msg {
        DeepgramMessage::Results(results) => {
            let text = results
                .channel
                .alternatives
                .into_iter()
                .next()
                .map(|a| a.transcript)
                .unwrap_or_default();
            Some(TranscriptionEvent::Transcript(TranscriptResult {
                text,
                is_final: results.is_final,
                speech_final: results.speech_final,
            }))
        }
        DeepgramMessage::UtteranceEnd {} => Some(TranscriptionEvent::UtteranceEnd),
        DeepgramMessage::Error {
            description,
            message,
        } => Some(TranscriptionEvent::Error(
            description
                .or(message)
                .unwrap_or_else(|| "unknown transcription error".into()),
        )),
        DeepgramMessage::Other => None,
    }
}
