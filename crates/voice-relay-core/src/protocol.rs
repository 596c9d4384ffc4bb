//! Browser wire protocol.
//!
//! Control events travel as JSON text frames tagged by `type`; microphone and
//! synthesized audio travel as raw binary frames in both directions.

use serde::{Deserialize, Serialize};

/// Client -> Server control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Open a transcription stream for this connection.
    StartStream,
    /// Finish the transcription stream (microphone off).
    StopStream,
}

/// Everything the session task can receive from the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StartStream,
    AudioChunk(Vec<u8>),
    StopStream,
}

impl From<ClientFrame> for ClientEvent {
    fn from(frame: ClientFrame) -> Self {
        match frame {
            ClientFrame::StartStream => Self::StartStream,
            ClientFrame::StopStream => Self::StopStream,
        }
    }
}

/// Server -> Client control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Text of an agent reply (also the welcome message).
    AgentResponse { text: String },

    /// Interim or final transcript of the caller's speech.
    TranscriptUpdate {
        text: String,
        is_final: bool,
        speech_final: bool,
    },

    /// All audio chunks for the current reply have been sent.
    AudioStreamEnd,

    /// A collaborator failed; the session stays open.
    Error { source: ErrorSource, message: String },
}

/// Which collaborator an [`ServerFrame::Error`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Transcription,
    Conversation,
    Synthesis,
}

/// Outbound message queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Audio(Vec<u8>),
}

impl From<ServerFrame> for Outbound {
    fn from(frame: ServerFrame) -> Self {
        Self::Frame(frame)
    }
}
