//! Configuration for voice sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default realtime model identifier.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Default voice for the tutor.
pub const DEFAULT_VOICE: &str = "shimmer";

/// Voices the realtime provider supports.
pub const SUPPORTED_VOICES: &[&str] =
    &["alloy", "ash", "ballad", "coral", "echo", "sage", "shimmer", "verse"];

/// Learner proficiency level, passed through to the backend when minting
/// credentials so instructions can be tailored server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProficiencyLevel {
    /// New learner.
    #[default]
    Beginner,
    /// Conversational learner.
    Intermediate,
    /// Fluent learner.
    Advanced,
}

impl ProficiencyLevel {
    /// Wire string for the backend token request.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }
}

/// Server-side VAD parameters sent in `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Detection threshold (0.0 - 1.0).
    pub threshold: f32,
    /// Padding included before detected speech, in milliseconds.
    pub prefix_padding_ms: u32,
    /// Silence duration before speech is considered ended, in milliseconds.
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self { threshold: 0.5, prefix_padding_ms: 300, silence_duration_ms: 800 }
    }
}

/// Timer and timeout knobs. Defaults are the normative values; the
/// speech-end pair is empirically chosen and should be replaced by a real
/// audio-drain signal where the media stack provides one.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Minimum gap between successive peer-connection attempts.
    pub connection_cooldown: Duration,
    /// How long to wait for the data channel to open before falling back
    /// to audio-only.
    pub data_channel_open_timeout: Duration,
    /// Delay between `session.update` and the initial `response.create`.
    pub response_create_delay: Duration,
    /// Grace period after `response.done` before the assistant is
    /// considered done speaking.
    pub speech_end_grace: Duration,
    /// Extension applied when speaking-state validation fails at the end
    /// of the grace period.
    pub speech_end_extension: Duration,
    /// Delay before an ICE `disconnected` state triggers a recovery pass.
    pub ice_recovery_delay: Duration,
    /// Recovery passes allowed per session before ICE is declared failed.
    pub max_ice_recoveries: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connection_cooldown: Duration::from_millis(2000),
            data_channel_open_timeout: Duration::from_secs(15),
            response_create_delay: Duration::from_secs(1),
            speech_end_grace: Duration::from_secs(5),
            speech_end_extension: Duration::from_secs(3),
            ice_recovery_delay: Duration::from_secs(2),
            max_ice_recoveries: 3,
        }
    }
}

/// Admission-gate parameters for the resilience layer.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Consecutive failures that open the circuit breaker.
    pub breaker_max_failures: u32,
    /// How long the breaker stays open before permitting a probe.
    pub breaker_reset_timeout: Duration,
    /// Window in which a start for the same scenario is treated as a
    /// duplicate.
    pub debounce_min_interval: Duration,
    /// Window after a user-initiated stop in which automatic restarts are
    /// rejected.
    pub user_intent_window: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker_max_failures: 3,
            breaker_reset_timeout: Duration::from_secs(30),
            debounce_min_interval: Duration::from_millis(2000),
            user_intent_window: Duration::from_secs(5),
        }
    }
}

/// Retry policy for the token broker.
#[derive(Debug, Clone)]
pub struct TokenRetryConfig {
    /// Maximum request attempts. A retryable failure on the final
    /// attempt is fatal.
    pub max_retries: u32,
    /// Base backoff, doubled each attempt.
    pub base_backoff: Duration,
    /// Cap applied to any single computed backoff.
    pub backoff_cap: Duration,
    /// Cap applied to a server-supplied `retryAfter`.
    pub retry_after_cap: Duration,
}

impl Default for TokenRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(1000),
            backoff_cap: Duration::from_secs(30),
            retry_after_cap: Duration::from_secs(300),
        }
    }
}

/// Configuration for the voice session subsystem.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Backend root URL (token endpoint lives under it).
    pub api_base: String,
    /// Remote realtime root URL.
    pub realtime_base: String,
    /// Realtime model identifier, sent to both backend and remote.
    pub model: String,
    /// Voice for assistant audio. Fixed per session.
    pub voice: String,
    /// Server-side VAD parameters.
    pub vad: VadConfig,
    /// Input-audio transcription model.
    pub transcription_model: String,
    /// Sampling temperature for responses.
    pub temperature: f32,
    /// STUN servers offered to the ICE agent.
    pub stun_servers: Vec<String>,
    /// Whether a degraded audio-only session may still attempt
    /// `session.update` (only meaningful for channels that opened and
    /// later degraded; server VAD defaults apply otherwise).
    pub audio_only_allows_session_update: bool,
    /// Timer knobs.
    pub timing: TimingConfig,
    /// Admission-gate knobs.
    pub resilience: ResilienceConfig,
    /// Token broker retry policy.
    pub token_retry: TokenRetryConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.sori.app".to_string(),
            realtime_base: "https://api.openai.com/v1/realtime".to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            vad: VadConfig::default(),
            transcription_model: "whisper-1".to_string(),
            temperature: 0.8,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            audio_only_allows_session_update: false,
            timing: TimingConfig::default(),
            resilience: ResilienceConfig::default(),
            token_retry: TokenRetryConfig::default(),
        }
    }
}

impl VoiceConfig {
    /// Create a builder.
    pub fn builder() -> VoiceConfigBuilder {
        VoiceConfigBuilder::default()
    }
}

/// Builder for [`VoiceConfig`].
#[derive(Debug, Clone, Default)]
pub struct VoiceConfigBuilder {
    config: VoiceConfig,
}

impl VoiceConfigBuilder {
    /// Set the backend root URL.
    pub fn api_base(mut self, url: impl Into<String>) -> Self {
        self.config.api_base = url.into();
        self
    }

    /// Set the realtime root URL.
    pub fn realtime_base(mut self, url: impl Into<String>) -> Self {
        self.config.realtime_base = url.into();
        self
    }

    /// Set the realtime model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    /// Set the voice.
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.config.voice = voice.into();
        self
    }

    /// Set the VAD parameters.
    pub fn vad(mut self, vad: VadConfig) -> Self {
        self.config.vad = vad;
        self
    }

    /// Set the transcription model.
    pub fn transcription_model(mut self, model: impl Into<String>) -> Self {
        self.config.transcription_model = model.into();
        self
    }

    /// Set the sampling temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = temperature;
        self
    }

    /// Set the timing knobs.
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.config.timing = timing;
        self
    }

    /// Set the resilience knobs.
    pub fn resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.config.resilience = resilience;
        self
    }

    /// Set the token retry policy.
    pub fn token_retry(mut self, retry: TokenRetryConfig) -> Self {
        self.config.token_retry = retry;
        self
    }

    /// Allow `session.update` in degraded audio-only mode.
    pub fn audio_only_allows_session_update(mut self, allow: bool) -> Self {
        self.config.audio_only_allows_session_update = allow;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> VoiceConfig {
        self.config
    }
}
