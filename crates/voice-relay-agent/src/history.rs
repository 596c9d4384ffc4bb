//! Convert stored turns to model chat history.

use voice_relay_core::turn::ConversationTurn;
use voice_relay_providers::ChatMessage;

/// Map persisted turns to chat messages, oldest first. Blank turns are skipped.
pub fn turns_to_messages(turns: &[ConversationTurn]) -> Vec<ChatMessage> {
    turns
        .iter()
        .filter(|t| !t.text.trim().is_empty())
        .map(|t| ChatMessage {
            role: t.role,
            text: t.text.clone(),
        })
        .collect()
}
