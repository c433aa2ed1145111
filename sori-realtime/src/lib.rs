//! # sori-realtime
//!
//! Real-time voice conversation manager for the Sori Korean tutoring
//! app.
//!
//! The subsystem brokers an ephemeral, authenticated peer connection
//! between the client and a third-party realtime speech API and drives
//! it through a precisely ordered lifecycle while the UI and the network
//! both try to break it.
//!
//! ## Architecture
//!
//! ```text
//!   caller ──► SessionManager ──► OperationQueue (strict FIFO)
//!                   │
//!                   ├─► ResilienceGates   breaker / latch / debounce / cooldown
//!                   ├─► TokenBroker       ephemeral credential from the backend
//!                   ├─► Negotiator        SDP exchange + str0m driver task
//!                   ├─► ProtocolHandler   control-channel events, transcripts
//!                   └─► EventBus          stable topics consumed by the UI
//! ```
//!
//! A session is an atomic unit: failed connections are torn down and
//! retried as new sessions, never renegotiated.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sori_realtime::{SessionManager, StartSessionRequest, VoiceConfig};
//! use secrecy::SecretString;
//!
//! #[tokio::main]
//! async fn main() -> sori_realtime::Result<()> {
//!     let manager = SessionManager::builder(
//!         VoiceConfig::builder().api_base("https://api.sori.app").build(),
//!         SecretString::from(std::env::var("SORI_ACCESS_TOKEN").unwrap()),
//!     )
//!     .build();
//!
//!     manager.initialize()?;
//!     manager.bus().on(sori_realtime::Topic::AiTranscriptDelta, |event| {
//!         println!("{event:?}");
//!     });
//!
//!     manager.start_session(StartSessionRequest::new("cafe-ordering")).await?;
//!     // ... conversation runs ...
//!     manager.stop_session_by_user().await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod resilience;
pub mod token;
pub mod transcript;
pub mod transport;

// Re-exports
pub use bus::{BusEvent, EventBus, ListenerId, Topic};
pub use config::{
    ProficiencyLevel, ResilienceConfig, TimingConfig, TokenRetryConfig, VadConfig, VoiceConfig,
    VoiceConfigBuilder,
};
pub use devices::{
    AudioDeviceAdapter, AudioModeSpec, AudioSink, MicrophoneConstraints, MicrophoneSource,
    MicrophoneStream, OutputRoute, StaticAudioDeviceAdapter,
};
pub use error::{Result, VoiceError};
pub use events::{ClientEvent, ErrorInfo, RateLimit, ServerEvent};
pub use orchestrator::{SessionManager, SessionManagerBuilder, StartSessionRequest, StateSnapshot};
pub use protocol::ProtocolHandler;
pub use queue::{OperationKind, OperationQueue};
pub use resilience::{Admission, BreakerState, CircuitBreaker, ResilienceGates};
pub use token::{TokenBroker, TokenRequest};
pub use transcript::{ConversationHistory, Role, Turn};
pub use transport::{Negotiator, Transport, TransportEvent};
