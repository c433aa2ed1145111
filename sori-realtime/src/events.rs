//! Wire event types for the realtime control channel.
//!
//! Inbound and outbound events are JSON messages tagged by `type`,
//! mirroring the realtime API's event taxonomy. Audio payloads travel as
//! base64 strings on the wire and are decoded to raw bytes at this
//! boundary so consumers never deal with the encoding.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Custom serde for base64-encoded audio ───────────────────────────────

fn deserialize_audio_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD.decode(&s).map_err(serde::de::Error::custom)
}

fn serialize_audio_bytes<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let s = base64::engine::general_purpose::STANDARD.encode(bytes);
    serializer.serialize_str(&s)
}

// ── Client Events ───────────────────────────────────────────────────────

/// Events sent from the client to the realtime server over the data
/// channel.
///
/// The orchestrator only ever produces two of these: a session-configure
/// after the channel opens, and a single response-create to make the
/// model speak first. Instructions are injected server-side during
/// credential minting and are never overridden here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration (voice, formats, VAD, temperature).
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration object.
        session: Value,
    },

    /// Trigger a response from the model.
    #[serde(rename = "response.create")]
    ResponseCreate {
        /// Optional response configuration.
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
}

// ── Server Events ───────────────────────────────────────────────────────

/// Events received from the realtime server on the data channel.
///
/// Unknown event types deserialize to [`ServerEvent::Unknown`]; the
/// protocol handler routes those (with their raw JSON) to the generic
/// `message` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Session was created on the remote side.
    #[serde(rename = "session.created")]
    SessionCreated {
        /// Session details.
        #[serde(default)]
        session: Value,
    },

    /// Session configuration was updated.
    #[serde(rename = "session.updated")]
    SessionUpdated {
        /// Updated session details.
        #[serde(default)]
        session: Value,
    },

    /// Server-side VAD detected the start of user speech.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        /// Audio offset of the speech start in milliseconds.
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },

    /// Server-side VAD detected the end of user speech.
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        /// Audio offset of the speech end in milliseconds.
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },

    /// Chunk of assistant output audio.
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Response this chunk belongs to.
        #[serde(default)]
        response_id: Option<String>,
        /// Audio data (raw bytes, base64 on the wire).
        #[serde(
            serialize_with = "serialize_audio_bytes",
            deserialize_with = "deserialize_audio_bytes"
        )]
        delta: Vec<u8>,
    },

    /// Assistant audio generation finished. Playback may still be going.
    #[serde(rename = "response.audio.done")]
    AudioDone {
        /// Response whose audio generation finished.
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Assistant transcript delta.
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta {
        /// Response this delta belongs to.
        #[serde(default)]
        response_id: Option<String>,
        /// Transcript fragment.
        delta: String,
    },

    /// Assistant transcript completed.
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        /// Response whose transcript completed.
        #[serde(default)]
        response_id: Option<String>,
        /// Complete transcript.
        #[serde(default)]
        transcript: String,
    },

    /// Authoritative generation-complete signal for a response.
    #[serde(rename = "response.done")]
    ResponseDone {
        /// Final response details.
        #[serde(default)]
        response: Value,
    },

    /// Remote output audio buffer drained. Informational only.
    #[serde(rename = "output_audio_buffer.stopped")]
    OutputAudioBufferStopped {
        /// Response whose buffer drained.
        #[serde(default)]
        response_id: Option<String>,
    },

    /// A conversation item was created. User audio items may carry a
    /// transcript inline.
    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        /// The created item.
        item: ConversationItem,
    },

    /// User input transcription delta (alternate user-transcript channel).
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptionDelta {
        /// Transcript fragment.
        delta: String,
    },

    /// User input transcription completed.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        /// Complete transcript.
        #[serde(default)]
        transcript: String,
    },

    /// Rate limit information.
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated {
        /// Rate limit details.
        #[serde(default)]
        rate_limits: Vec<RateLimit>,
    },

    /// Error reported by the remote.
    #[serde(rename = "error")]
    Error {
        /// Error details.
        error: ErrorInfo,
    },

    /// Unknown event type (forward compatibility).
    #[serde(other)]
    Unknown,
}

/// A conversation item on the control channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Unique ID for this item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item type, e.g. "message".
    #[serde(rename = "type", default)]
    pub item_type: Option<String>,
    /// Role: "user", "assistant", or "system".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts.
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

/// A content part within a conversation item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type: "input_text", "input_audio", "text", "audio".
    #[serde(rename = "type", default)]
    pub content_type: Option<String>,
    /// Text content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Transcript of audio content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl ConversationItem {
    /// Extract the user transcript carried inline on an `input_audio`
    /// content part, if any.
    pub fn user_audio_transcript(&self) -> Option<&str> {
        if self.role.as_deref() != Some("user") {
            return None;
        }
        self.content
            .iter()
            .find(|part| part.content_type.as_deref() == Some("input_audio"))
            .and_then(|part| part.transcript.as_deref())
            .filter(|t| !t.is_empty())
    }
}

/// Error information from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error type/code, e.g. "invalid_request_error".
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Machine-readable error code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable error message.
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Whether this is the benign truncation artifact the remote emits
    /// when an interrupted response is cancelled server-side.
    pub fn is_benign_truncation(&self) -> bool {
        self.code.as_deref() == Some("unsupported_content_type")
            || self.message.contains("unsupported_content_type")
    }
}

/// Rate limit information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    /// Limit name.
    pub name: String,
    /// Maximum allowed.
    #[serde(default)]
    pub limit: u64,
    /// Currently remaining.
    #[serde(default)]
    pub remaining: u64,
    /// Time until reset, in seconds.
    #[serde(default)]
    pub reset_seconds: f64,
}

/// Parse a raw control-channel message into a typed event plus its raw
/// JSON value.
///
/// The raw value is kept so unknown events can still be surfaced on the
/// generic `message` topic with their full payload.
pub fn parse_server_event(text: &str) -> serde_json::Result<(ServerEvent, Value)> {
    let value: Value = serde_json::from_str(text)?;
    let event = serde_json::from_value(value.clone())?;
    Ok((event, value))
}
