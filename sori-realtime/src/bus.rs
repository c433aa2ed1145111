//! Topic-keyed event bus connecting the orchestrator to the UI.
//!
//! Dispatch is synchronous and in registration order. A panicking
//! listener is isolated with `catch_unwind` and logged; its siblings
//! still run. There are no wildcard topics and no ordering guarantees
//! across topics.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::devices::OutputRoute;
use crate::events::RateLimit;
use crate::orchestrator::StateSnapshot;

/// Stable bus topics exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Initialized,
    Connecting,
    Connected,
    SessionStarted,
    SessionStopped,
    SessionCreated,
    SessionUpdated,
    UserSpeechStarted,
    UserSpeechStopped,
    AiSpeechStarted,
    AiSpeechEnded,
    AiTranscriptDelta,
    AiTranscriptComplete,
    UserTranscriptDelta,
    UserTranscriptComplete,
    AudioData,
    AudioDeviceChanged,
    AudioOnlyMode,
    RateLimitsUpdated,
    StateChanged,
    Error,
    UserEndedSession,
    ResponseCompleted,
    OutputAudioBufferStopped,
    /// Catch-all for control-channel events with no dedicated topic.
    Message,
}

impl Topic {
    /// Stable topic name, as exposed to the UI layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::SessionStarted => "sessionStarted",
            Self::SessionStopped => "sessionStopped",
            Self::SessionCreated => "sessionCreated",
            Self::SessionUpdated => "sessionUpdated",
            Self::UserSpeechStarted => "userSpeechStarted",
            Self::UserSpeechStopped => "userSpeechStopped",
            Self::AiSpeechStarted => "aiSpeechStarted",
            Self::AiSpeechEnded => "aiSpeechEnded",
            Self::AiTranscriptDelta => "aiTranscriptDelta",
            Self::AiTranscriptComplete => "aiTranscriptComplete",
            Self::UserTranscriptDelta => "userTranscriptDelta",
            Self::UserTranscriptComplete => "userTranscriptComplete",
            Self::AudioData => "audioData",
            Self::AudioDeviceChanged => "audioDeviceChanged",
            Self::AudioOnlyMode => "audioOnlyMode",
            Self::RateLimitsUpdated => "rateLimitsUpdated",
            Self::StateChanged => "stateChanged",
            Self::Error => "error",
            Self::UserEndedSession => "userEndedSession",
            Self::ResponseCompleted => "responseCompleted",
            Self::OutputAudioBufferStopped => "outputAudioBufferStopped",
            Self::Message => "message",
        }
    }
}

/// Typed payloads, one variant per topic. The payload shape is enforced
/// here, at the publication boundary.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Initialized,
    Connecting { session_id: String },
    Connected { session_id: String },
    SessionStarted { session_id: String, scenario_id: String, level: String },
    SessionStopped { session_id: String },
    SessionCreated { session: Value },
    SessionUpdated { session: Value },
    UserSpeechStarted,
    UserSpeechStopped,
    AiSpeechStarted,
    AiSpeechEnded,
    AiTranscriptDelta { delta: String },
    AiTranscriptComplete { text: String },
    UserTranscriptDelta { delta: String },
    UserTranscriptComplete { text: String },
    AudioData { chunk: Vec<u8> },
    AudioDeviceChanged { route: OutputRoute },
    AudioOnlyMode,
    RateLimitsUpdated { limits: Vec<RateLimit> },
    StateChanged { snapshot: StateSnapshot },
    Error { kind: &'static str, message: String },
    UserEndedSession,
    ResponseCompleted { response: Value },
    OutputAudioBufferStopped,
    Message { payload: Value },
}

impl BusEvent {
    /// The topic this payload belongs to.
    pub fn topic(&self) -> Topic {
        match self {
            Self::Initialized => Topic::Initialized,
            Self::Connecting { .. } => Topic::Connecting,
            Self::Connected { .. } => Topic::Connected,
            Self::SessionStarted { .. } => Topic::SessionStarted,
            Self::SessionStopped { .. } => Topic::SessionStopped,
            Self::SessionCreated { .. } => Topic::SessionCreated,
            Self::SessionUpdated { .. } => Topic::SessionUpdated,
            Self::UserSpeechStarted => Topic::UserSpeechStarted,
            Self::UserSpeechStopped => Topic::UserSpeechStopped,
            Self::AiSpeechStarted => Topic::AiSpeechStarted,
            Self::AiSpeechEnded => Topic::AiSpeechEnded,
            Self::AiTranscriptDelta { .. } => Topic::AiTranscriptDelta,
            Self::AiTranscriptComplete { .. } => Topic::AiTranscriptComplete,
            Self::UserTranscriptDelta { .. } => Topic::UserTranscriptDelta,
            Self::UserTranscriptComplete { .. } => Topic::UserTranscriptComplete,
            Self::AudioData { .. } => Topic::AudioData,
            Self::AudioDeviceChanged { .. } => Topic::AudioDeviceChanged,
            Self::AudioOnlyMode => Topic::AudioOnlyMode,
            Self::RateLimitsUpdated { .. } => Topic::RateLimitsUpdated,
            Self::StateChanged { .. } => Topic::StateChanged,
            Self::Error { .. } => Topic::Error,
            Self::UserEndedSession => Topic::UserEndedSession,
            Self::ResponseCompleted { .. } => Topic::ResponseCompleted,
            Self::OutputAudioBufferStopped => Topic::OutputAudioBufferStopped,
            Self::Message { .. } => Topic::Message,
        }
    }
}

/// Listener handle returned by [`EventBus::on`]; closures are not
/// comparable, so unsubscription is id-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<Topic, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

/// The event bus. Cheap to clone; clones share the listener registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `topic`. Listeners fire synchronously in
    /// registration order.
    pub fn on<F>(&self, topic: Topic, listener: F) -> ListenerId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().entry(topic).or_default().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn off(&self, topic: Topic, id: ListenerId) {
        if let Some(list) = self.inner.listeners.lock().get_mut(&topic) {
            list.retain(|(lid, _)| *lid != id);
        }
    }

    /// Remove all listeners for `topic`, or every listener when `None`.
    pub fn remove_all_listeners(&self, topic: Option<Topic>) {
        let mut listeners = self.inner.listeners.lock();
        match topic {
            Some(topic) => {
                listeners.remove(&topic);
            }
            None => listeners.clear(),
        }
    }

    /// Publish an event to its topic's listeners.
    ///
    /// A panicking listener is caught and logged; remaining listeners
    /// still run. The registry lock is released before dispatch so
    /// listeners may subscribe/unsubscribe reentrantly.
    pub fn emit(&self, event: BusEvent) {
        let topic = event.topic();
        let snapshot: Vec<Listener> = {
            let listeners = self.inner.listeners.lock();
            match listeners.get(&topic) {
                Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };

        for listener in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                tracing::error!(topic = topic.as_str(), panic = %msg, "bus listener panicked");
            }
        }
    }

    /// Number of listeners registered for `topic`.
    pub fn listener_count(&self, topic: Topic) -> usize {
        self.inner.listeners.lock().get(&topic).map(|l| l.len()).unwrap_or(0)
    }
}
