//! Append-only conversation turn storage.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, VoiceRelayError};
use crate::turn::ConversationTurn;

/// Persistence for conversation turns, keyed by session id.
///
/// Turns come back in insertion order. Stores never mutate a turn once written.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// All turns for a session, oldest first. Unknown sessions yield an empty list.
    async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>>;

    /// Append turns atomically with respect to other appends for the same session.
    async fn append(&self, turns: &[ConversationTurn]) -> Result<()>;

    /// Session ids that have at least one stored turn.
    async fn sessions(&self) -> Result<Vec<String>>;
}

/// File-based store: one JSONL file per session.
///
/// Layout: `<base>/<encoded-session-id>.jsonl`, one turn per line.
pub struct JsonlTurnStore {
    base: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTurnStore {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            write_lock: Mutex::new(()),
        }
    }

    fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.base.join(format!("{}.jsonl", encode_id(session_id)))
    }
}

/// Portable, reversible file stem for a session id.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes `%XX`.
fn encode_id(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_id`]. `None` for stems this store did not write.
fn decode_id(stem: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl TurnStore for JsonlTurnStore {
    async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let path = self.transcript_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut turns = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let turn: ConversationTurn = serde_json::from_str(line)
                .map_err(|e| VoiceRelayError::Storage(format!("corrupt turn line: {e}")))?;
            turns.push(turn);
        }
        debug!(session_id, turns = turns.len(), "Loaded conversation history");
        Ok(turns)
    }

    async fn append(&self, turns: &[ConversationTurn]) -> Result<()> {
        let Some(first) = turns.first() else {
            return Ok(());
        };
        if turns.iter().any(|t| t.session_id != first.session_id) {
            return Err(VoiceRelayError::Storage(
                "append spans multiple sessions".into(),
            ));
        }

        let mut data = String::new();
        for turn in turns {
            data.push_str(&serde_json::to_string(turn)?);
            data.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.base).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.transcript_path(&first.session_id))
            .await?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;

        debug!(session_id = %first.session_id, appended = turns.len(), "Persisted turns");
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<String>> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                match path.file_stem().and_then(|s| s.to_str()).and_then(decode_id) {
                    Some(id) => ids.push(id),
                    None => debug!(path = %path.display(), "Skipping unrecognized transcript file"),
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryTurnStore {
    turns: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        Ok(self
            .turns
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, turns: &[ConversationTurn]) -> Result<()> {
        let mut map = self.turns.write().await;
        for turn in turns {
            map.entry(turn.session_id.clone())
                .or_default()
                .push(turn.clone());
        }
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.turns.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
