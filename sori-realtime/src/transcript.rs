//! Conversation history and transcript assembly state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The learner.
    User,
    /// The tutor model.
    Assistant,
}

/// One completed conversation turn. Turns are only appended once a full
/// transcript for the role has been observed; partial deltas never land
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Speaker role.
    pub role: Role,
    /// Finalized transcript text.
    pub text: String,
    /// When the turn was finalized.
    pub timestamp: DateTime<Utc>,
}

/// Append-only ordered sequence of completed turns. Cleared on any
/// transition to `Idle`.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    /// Append a finalized turn.
    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        self.turns.push(Turn { role, text: text.into(), timestamp: Utc::now() });
    }

    /// All turns, oldest first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Number of completed turns.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether no turns have completed yet.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Drop all turns.
    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// Per-role delta buffers. A `completed` event finalizes the buffer that
/// precedes it into a [`ConversationHistory`] turn and clears it.
#[derive(Debug, Default)]
pub struct PartialTranscripts {
    user: String,
    assistant: String,
}

impl PartialTranscripts {
    /// Append a delta to the buffer for `role`.
    pub fn append(&mut self, role: Role, delta: &str) {
        match role {
            Role::User => self.user.push_str(delta),
            Role::Assistant => self.assistant.push_str(delta),
        }
    }

    /// Current buffer contents for `role`.
    pub fn current(&self, role: Role) -> &str {
        match role {
            Role::User => &self.user,
            Role::Assistant => &self.assistant,
        }
    }

    /// Take and clear the buffer for `role`, preferring `completed` text
    /// when the completion event carried the full transcript.
    pub fn finalize(&mut self, role: Role, completed: &str) -> String {
        let buffered = match role {
            Role::User => std::mem::take(&mut self.user),
            Role::Assistant => std::mem::take(&mut self.assistant),
        };
        if completed.is_empty() { buffered } else { completed.to_string() }
    }

    /// Drop both buffers.
    pub fn clear(&mut self) {
        self.user.clear();
        self.assistant.clear();
    }
}

/// Per-assistant-turn tracker distinguishing generation-complete from
/// playback-complete.
#[derive(Debug, Default)]
pub struct AiSpeechState {
    /// Whether assistant audio is currently considered playing.
    pub is_audio_playing: bool,
    /// Response id of the most recent assistant turn.
    pub last_response_id: Option<String>,
    /// Whether any audio chunk arrived for the current response.
    pub audio_data_received: bool,
    /// Whether a complete transcript arrived for the current response.
    pub transcript_received: bool,
}

impl AiSpeechState {
    /// Reset all per-response flags.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Begin a new assistant response.
    pub fn begin_response(&mut self, response_id: Option<String>) {
        if response_id.is_some() && response_id != self.last_response_id {
            self.audio_data_received = false;
            self.transcript_received = false;
            self.last_response_id = response_id;
        }
    }
}
