//! Error types for the voice session subsystem.

use thiserror::Error;

/// Result type for voice session operations.
pub type Result<T> = std::result::Result<T, VoiceError>;

/// Errors that can occur while running a voice session.
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Audio mode setup or device enumeration failed.
    ///
    /// Non-fatal: session starts are still attempted with the speaker
    /// fallback route.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Token broker exhausted its retries or received a fatal HTTP status.
    #[error("Token error: {0}")]
    Token(String),

    /// SDP exchange or the POST to the realtime endpoint failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// ICE gave up after exhausting recovery attempts.
    #[error("ICE connection failed: {0}")]
    IceConnectionFailed(String),

    /// The peer connection reached a terminal failed state.
    #[error("Peer connection failed: {0}")]
    PeerConnectionFailed(String),

    /// The control channel errored mid-session.
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// An outbound control event could not be enqueued.
    #[error("Send message error: {0}")]
    SendMessage(String),

    /// Orchestrator-level session start failure.
    #[error("Session start failed: {0}")]
    SessionStart(String),

    /// Orchestrator-level session stop failure.
    #[error("Session stop failed: {0}")]
    SessionStop(String),

    /// Scenario change failed.
    #[error("Scenario change failed: {0}")]
    ScenarioChange(String),

    /// The remote reported a non-benign error event.
    #[error("Remote error: {code} - {message}")]
    Remote {
        /// Error code from the remote event.
        code: String,
        /// Error message from the remote event.
        message: String,
    },

    /// Admission refused by the circuit breaker.
    #[error("Too many failures. Try again in {retry_in_secs} seconds.")]
    CircuitOpen {
        /// Seconds until the breaker permits a probe.
        retry_in_secs: u64,
    },

    /// Opus transcoding failed at the transport boundary.
    #[error("Audio codec error: {0}")]
    Codec(String),

    /// Timeout waiting on the transport or remote.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Create a new initialization error.
    pub fn initialization<S: Into<String>>(msg: S) -> Self {
        Self::Initialization(msg.into())
    }

    /// Create a new token error.
    pub fn token<S: Into<String>>(msg: S) -> Self {
        Self::Token(msg.into())
    }

    /// Create a new connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a new data channel error.
    pub fn data_channel<S: Into<String>>(msg: S) -> Self {
        Self::DataChannel(msg.into())
    }

    /// Create a new send-message error.
    pub fn send_message<S: Into<String>>(msg: S) -> Self {
        Self::SendMessage(msg.into())
    }

    /// Create a new remote error.
    pub fn remote<S: Into<String>>(code: S, message: S) -> Self {
        Self::Remote { code: code.into(), message: message.into() }
    }

    /// Stable kind string used in bus `error` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialization(_) => "initialization",
            Self::Token(_) => "token",
            Self::Connection(_) => "connection",
            Self::IceConnectionFailed(_) => "ice_connection_failed",
            Self::PeerConnectionFailed(_) => "peer_connection_failed",
            Self::DataChannel(_) => "data_channel",
            Self::SendMessage(_) => "send_message",
            Self::SessionStart(_) => "session_start",
            Self::SessionStop(_) => "session_stop",
            Self::ScenarioChange(_) => "scenario_change",
            Self::Remote { .. } => "openai",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Codec(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(VoiceError::token("x").kind(), "token");
        assert_eq!(VoiceError::connection("x").kind(), "connection");
        assert_eq!(VoiceError::CircuitOpen { retry_in_secs: 7 }.kind(), "circuit_open");
        assert_eq!(VoiceError::remote("e", "m").kind(), "openai");
    }

    #[test]
    fn circuit_open_message_carries_remaining_seconds() {
        let err = VoiceError::CircuitOpen { retry_in_secs: 12 };
        assert_eq!(err.to_string(), "Too many failures. Try again in 12 seconds.");
    }
}
