//! Media collaborators: streaming speech-to-text and text-to-speech.

pub mod stt;
pub mod tts_stream;
