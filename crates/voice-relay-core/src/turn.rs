//! Conversation turn model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who spoke a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Agent => f.write_str("agent"),
        }
    }
}

/// One persisted message in a session's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(session_id: &str, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, text)
    }

    pub fn agent(session_id: &str, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::Agent, text)
    }

    fn new(session_id: &str, role: Role, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            role,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}
