//! Conversation engine: turns one caller utterance into one agent reply.
//!
//! The engine replays the session's stored turns to the chat model under the
//! configured persona, and persists the exchange only once the model answers.

pub mod engine;
pub mod history;

pub use engine::ConversationEngine;
