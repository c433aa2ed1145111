//! Session orchestrator: owns the lifecycle state machine and composes
//! the token broker, transport negotiator, protocol handler, and
//! resilience gates behind the public API.
//!
//! All mutating operations go through the operation queue, so the state
//! machine has a single logical writer. The lifecycle is
//! `Idle → Starting → Connecting → Active → Stopping → Idle`, with
//! `Active` optionally annotated audio-only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bus::{BusEvent, EventBus};
use crate::config::{ProficiencyLevel, VoiceConfig};
use crate::devices::{
    AudioDeviceAdapter, AudioModeSpec, AudioSink, MicrophoneConstraints, MicrophoneSource,
    NullAudioSink, NullMicrophoneSource, StaticAudioDeviceAdapter,
};
use crate::error::{Result, VoiceError};
use crate::protocol::ProtocolHandler;
use crate::queue::{OperationKind, OperationQueue};
use crate::resilience::{Admission, ResilienceGates};
use crate::token::{TokenBroker, TokenRequest};
use crate::transport::{Negotiator, Transport, TransportEvent};

/// Lifecycle phase of the owned session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Connecting,
    Active,
    Stopping,
}

/// Synchronous view of the state machine.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    /// A start is between admission and channel-open.
    pub is_connecting: bool,
    /// The control channel is open (false in audio-only mode).
    pub is_connected: bool,
    /// The session reached `Active`.
    pub is_session_active: bool,
    /// `Active` is annotated audio-only.
    pub audio_only: bool,
    /// Current session id, if any.
    pub session_id: Option<String>,
    /// Current scenario, if any.
    pub scenario_id: Option<String>,
    /// Proficiency level of the current session.
    pub level: ProficiencyLevel,
    /// When the current session was accepted.
    pub started_at: Option<DateTime<Utc>>,
    /// The most recent stop was user-initiated.
    pub user_ended_session: bool,
}

/// Parameters for a session start.
#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    /// Scenario identifier (opaque to this subsystem).
    pub scenario_id: String,
    /// Learner proficiency level.
    pub level: ProficiencyLevel,
    /// Opaque identity handle forwarded to the backend.
    pub user: Option<Value>,
    /// Opaque lesson context.
    pub lesson_details: Option<String>,
    /// Whether a human asked for this start. Automatic restarts must
    /// pass `false` so the user-intent latch can veto them.
    pub is_user_initiated: bool,
}

impl StartSessionRequest {
    /// A user-initiated start with defaults.
    pub fn new(scenario_id: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            level: ProficiencyLevel::default(),
            user: None,
            lesson_details: None,
            is_user_initiated: true,
        }
    }

    /// Set the proficiency level.
    pub fn level(mut self, level: ProficiencyLevel) -> Self {
        self.level = level;
        self
    }

    /// Attach the user identity handle.
    pub fn user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    /// Attach lesson context.
    pub fn lesson_details(mut self, details: impl Into<String>) -> Self {
        self.lesson_details = Some(details.into());
        self
    }

    /// Mark the start as automatic (not user-initiated).
    pub fn auto(mut self) -> Self {
        self.is_user_initiated = false;
        self
    }
}

struct SessionSlot {
    phase: Phase,
    session_id: Option<String>,
    scenario_id: Option<String>,
    level: ProficiencyLevel,
    started_at: Option<DateTime<Utc>>,
    audio_only: bool,
    transport: Option<Arc<Transport>>,
    response_create_timer: Option<tokio::task::JoinHandle<()>>,
    event_pump: Option<tokio::task::JoinHandle<()>>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            session_id: None,
            scenario_id: None,
            level: ProficiencyLevel::default(),
            started_at: None,
            audio_only: false,
            transport: None,
            response_create_timer: None,
            event_pump: None,
        }
    }
}

struct ManagerInner {
    config: VoiceConfig,
    bus: EventBus,
    queue: OperationQueue,
    gates: Mutex<ResilienceGates>,
    broker: TokenBroker,
    negotiator: Negotiator,
    protocol: ProtocolHandler,
    mic_source: Arc<dyn MicrophoneSource>,
    sink: Arc<dyn AudioSink>,
    devices: Arc<dyn AudioDeviceAdapter>,
    slot: Mutex<SessionSlot>,
    initialized: AtomicBool,
    device_watch: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The session manager. One owned instance per process; cheap to clone
/// for handing to UI glue and background tasks.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: VoiceConfig,
    bus: Option<EventBus>,
    access_token: SecretString,
    mic_source: Arc<dyn MicrophoneSource>,
    sink: Arc<dyn AudioSink>,
    devices: Arc<dyn AudioDeviceAdapter>,
}

impl SessionManagerBuilder {
    /// Start a builder with the given config and backend access token.
    pub fn new(config: VoiceConfig, access_token: SecretString) -> Self {
        Self {
            config,
            bus: None,
            access_token,
            mic_source: Arc::new(NullMicrophoneSource),
            sink: Arc::new(NullAudioSink),
            devices: Arc::new(StaticAudioDeviceAdapter::default()),
        }
    }

    /// Use an existing bus instead of a fresh one.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Plug in the platform microphone.
    pub fn microphone(mut self, mic: Arc<dyn MicrophoneSource>) -> Self {
        self.mic_source = mic;
        self
    }

    /// Plug in the playback sink for inbound assistant audio.
    pub fn sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Plug in the platform device adapter.
    pub fn devices(mut self, devices: Arc<dyn AudioDeviceAdapter>) -> Self {
        self.devices = devices;
        self
    }

    /// Build the manager.
    pub fn build(self) -> SessionManager {
        let bus = self.bus.unwrap_or_default();
        let broker = TokenBroker::new(
            self.config.api_base.clone(),
            self.config.model.clone(),
            self.config.voice.clone(),
            self.access_token,
            self.config.token_retry.clone(),
        );
        let negotiator = Negotiator::new(
            self.config.realtime_base.clone(),
            self.config.model.clone(),
            self.config.stun_servers.clone(),
        );
        let protocol = ProtocolHandler::new(bus.clone(), &self.config);
        let gates = ResilienceGates::new(
            &self.config.resilience,
            self.config.timing.connection_cooldown,
        );

        SessionManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                bus,
                queue: OperationQueue::new(),
                gates: Mutex::new(gates),
                broker,
                negotiator,
                protocol,
                mic_source: self.mic_source,
                sink: self.sink,
                devices: self.devices,
                slot: Mutex::new(SessionSlot::new()),
                initialized: AtomicBool::new(false),
                device_watch: Mutex::new(None),
            }),
        }
    }
}

impl SessionManager {
    /// Start building a manager.
    pub fn builder(config: VoiceConfig, access_token: SecretString) -> SessionManagerBuilder {
        SessionManagerBuilder::new(config, access_token)
    }

    /// The bus this manager publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Completed conversation turns for the current session.
    pub fn history(&self) -> Vec<crate::transcript::Turn> {
        self.inner.protocol.history()
    }

    /// Idempotent setup: audio mode, device-change forwarding, clean
    /// resilience state. Emits `initialized`. After `destroy`, brings
    /// the manager back to a state equivalent to fresh construction.
    pub fn initialize(&self) -> Result<()> {
        self.inner.queue.reopen();
        if !self.inner.initialized.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.inner.devices.configure(&AudioModeSpec::default()) {
                // Session starts still work with the speaker fallback.
                let err = VoiceError::initialization(err.to_string());
                tracing::warn!(error = %err, "audio mode setup failed");
                self.inner
                    .bus
                    .emit(BusEvent::Error { kind: err.kind(), message: err.to_string() });
            }

            let mut route_rx = self.inner.devices.watch_route();
            let bus = self.inner.bus.clone();
            let watcher = tokio::spawn(async move {
                while route_rx.changed().await.is_ok() {
                    let route = *route_rx.borrow();
                    bus.emit(BusEvent::AudioDeviceChanged { route });
                }
            });
            *self.inner.device_watch.lock() = Some(watcher);
        }

        self.inner.gates.lock().reset_to_clean_state();
        self.inner.bus.emit(BusEvent::Initialized);
        Ok(())
    }

    /// Synchronous state machine snapshot.
    pub fn state(&self) -> StateSnapshot {
        let slot = self.inner.slot.lock();
        let is_connected = slot
            .transport
            .as_ref()
            .map(|t| t.is_channel_open())
            .unwrap_or(false);
        StateSnapshot {
            is_connecting: matches!(slot.phase, Phase::Starting | Phase::Connecting),
            is_connected,
            is_session_active: slot.phase == Phase::Active,
            audio_only: slot.audio_only,
            session_id: slot.session_id.clone(),
            scenario_id: slot.scenario_id.clone(),
            level: slot.level,
            started_at: slot.started_at,
            user_ended_session: self.inner.gates.lock().user_ended_session(),
        }
    }

    /// Start a session. Serialized on the operation queue.
    ///
    /// Returns `Ok(true)` on success, `Ok(true)` for a debounced
    /// duplicate (the caller wanted a session to exist; one was just
    /// requested), and errors for fatal rejections such as an open
    /// circuit breaker.
    pub async fn start_session(&self, request: StartSessionRequest) -> Result<bool> {
        let manager = self.clone();
        self.inner
            .queue
            .run(OperationKind::StartSession, move || async move {
                manager.do_start(request).await
            })
            .await
    }

    /// Stop the session without touching the user-intent latch.
    /// Idempotent: stopping while `Idle` is a no-op success.
    pub async fn stop_session(&self) -> Result<()> {
        let manager = self.clone();
        self.inner
            .queue
            .run(OperationKind::StopSession, move || async move {
                manager.do_stop(false).await;
                Ok(true)
            })
            .await
            .map(|_| ())
    }

    /// Stop the session on behalf of the user: sets the user-intent
    /// latch (immediately, so racing auto-starts see it), tears down,
    /// and emits `userEndedSession`.
    pub async fn stop_session_by_user(&self) -> Result<()> {
        self.inner.gates.lock().set_user_ended(Instant::now());
        let manager = self.clone();
        self.inner
            .queue
            .run(OperationKind::StopSession, move || async move {
                manager.do_stop(true).await;
                Ok(true)
            })
            .await
            .map(|_| ())
    }

    /// Update the scenario context of the live session by re-sending
    /// `session.update`. The transport is not rebuilt.
    pub async fn change_scenario(
        &self,
        scenario_id: impl Into<String>,
        level: Option<ProficiencyLevel>,
    ) -> Result<()> {
        let scenario_id = scenario_id.into();
        let manager = self.clone();
        self.inner
            .queue
            .run(OperationKind::ChangeScenario, move || async move {
                manager.do_change_scenario(scenario_id, level).await.map(|_| true)
            })
            .await
            .map(|_| ())
    }

    /// Tear everything down: queue, session, listeners, gates.
    pub async fn destroy(&self) {
        self.inner.queue.clear();
        self.do_stop(false).await;
        if let Some(watcher) = self.inner.device_watch.lock().take() {
            watcher.abort();
        }
        self.inner.bus.remove_all_listeners(None);
        self.inner.gates.lock().reset_to_clean_state();
        self.inner.initialized.store(false, Ordering::Release);
    }

    // ── start path ──────────────────────────────────────────────────────

    async fn do_start(&self, request: StartSessionRequest) -> Result<bool> {
        let admission = self.inner.gates.lock().admit(
            &request.scenario_id,
            request.is_user_initiated,
            Instant::now(),
        );
        let cooldown = match admission {
            Admission::Rejected(err) => {
                tracing::info!(error = %err, scenario = %request.scenario_id,
                    "session start refused");
                return Err(err);
            }
            Admission::DebouncedDuplicate => {
                tracing::debug!(scenario = %request.scenario_id,
                    "duplicate start debounced");
                return Ok(true);
            }
            Admission::Proceed { cooldown } => cooldown,
        };

        if !cooldown.is_zero() {
            tracing::debug!(cooldown_ms = cooldown.as_millis() as u64,
                "connection cooldown before attempt");
            tokio::time::sleep(cooldown).await;
        }

        // A session is an atomic unit: any live connection is torn down
        // and fully settled before the new one is built.
        if self.inner.slot.lock().phase != Phase::Idle {
            self.do_stop(false).await;
        }

        let session_id = new_session_id();
        {
            let mut slot = self.inner.slot.lock();
            slot.phase = Phase::Starting;
            slot.session_id = Some(session_id.clone());
            slot.scenario_id = Some(request.scenario_id.clone());
            slot.level = request.level;
            slot.started_at = Some(Utc::now());
            slot.audio_only = false;
        }
        self.emit_state_changed();
        self.inner
            .gates
            .lock()
            .record_attempt(&request.scenario_id, Instant::now());

        match self.bring_up(&request, &session_id).await {
            Ok(()) => {
                self.inner.gates.lock().record_success();
                self.inner.bus.emit(BusEvent::SessionStarted {
                    session_id,
                    scenario_id: request.scenario_id,
                    level: request.level.as_str().to_string(),
                });
                self.emit_state_changed();
                Ok(true)
            }
            Err(err) => {
                tracing::error!(error = %err, "session bring-up failed");
                self.teardown_resources().await;
                self.inner.gates.lock().record_failure(Instant::now());
                let start_err = VoiceError::SessionStart(err.to_string());
                self.inner.bus.emit(BusEvent::Error {
                    kind: start_err.kind(),
                    message: start_err.to_string(),
                });
                self.emit_state_changed();
                Err(err)
            }
        }
    }

    /// Credential → transport → channel-open (or fallback) → configure.
    async fn bring_up(&self, request: &StartSessionRequest, session_id: &str) -> Result<()> {
        let token_request = TokenRequest {
            scenario_id: request.scenario_id.clone(),
            level: request.level,
            user: request.user.clone(),
            lesson_details: request.lesson_details.clone(),
            is_lesson_based: request.lesson_details.is_some(),
        };
        let probe = self.clone();
        let ephemeral_key = self
            .inner
            .broker
            .get_ephemeral_token(&token_request, move || probe.state().is_connected)
            .await?;

        {
            let mut slot = self.inner.slot.lock();
            slot.phase = Phase::Connecting;
        }
        self.inner
            .bus
            .emit(BusEvent::Connecting { session_id: session_id.to_string() });
        self.emit_state_changed();

        let mic = self
            .inner
            .mic_source
            .open(&MicrophoneConstraints::default())
            .await
            .map_err(|e| VoiceError::connection(format!("microphone capture: {e}")))?;

        let (transport, events) = self
            .inner
            .negotiator
            .connect(
                &ephemeral_key,
                Some(mic),
                Arc::clone(&self.inner.sink),
                &self.inner.config.timing,
            )
            .await?;
        let transport = Arc::new(transport);
        let remote_refused = transport.report().remote_refused_channel;
        {
            let mut slot = self.inner.slot.lock();
            slot.transport = Some(Arc::clone(&transport));
        }

        self.spawn_event_pump(events);

        let open = if remote_refused {
            false
        } else {
            transport
                .wait_for_channel_open(self.inner.config.timing.data_channel_open_timeout)
                .await
        };

        if open {
            self.inner
                .bus
                .emit(BusEvent::Connected { session_id: session_id.to_string() });
            transport.send_event(&self.inner.protocol.session_update(&self.inner.config))?;
            self.schedule_response_create(Arc::clone(&transport));
        } else {
            // Degrade: audio continues, turn-taking falls back to
            // server-side VAD, outbound control events become no-ops.
            tracing::warn!(remote_refused, "data channel unavailable; entering audio-only mode");
            transport.enable_audio_only();
            self.inner.slot.lock().audio_only = true;
            self.inner.bus.emit(BusEvent::AudioOnlyMode);
        }

        self.inner.slot.lock().phase = Phase::Active;
        Ok(())
    }

    /// Send `response.create` after the configured delay so the remote
    /// opens the conversation. Cancelable; the handle is cleared on fire.
    fn schedule_response_create(&self, transport: Arc<Transport>) {
        let manager = self.clone();
        let delay = self.inner.config.timing.response_create_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.inner.slot.lock().response_create_timer = None;
            let event = manager.inner.protocol.response_create();
            if let Err(err) = transport.send_event(&event) {
                tracing::warn!(error = %err, "initial response.create failed");
            }
        });

        let previous = self.inner.slot.lock().response_create_timer.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Route transport events into the protocol handler and the failure
    /// paths.
    fn spawn_event_pump(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let manager = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::ChannelMessage(text) => {
                        manager.inner.protocol.handle_message(&text);
                    }
                    TransportEvent::ChannelOpen => {
                        tracing::debug!("control channel open");
                    }
                    TransportEvent::ChannelClosed => {
                        // Mid-session control-channel loss degrades
                        // before anything is torn down.
                        let active = manager.inner.slot.lock().phase == Phase::Active;
                        if active {
                            let err = VoiceError::data_channel("control channel closed");
                            manager.inner.bus.emit(BusEvent::Error {
                                kind: err.kind(),
                                message: err.to_string(),
                            });
                            let transport = manager.inner.slot.lock().transport.clone();
                            if let Some(transport) = transport {
                                transport.enable_audio_only();
                            }
                            manager.inner.slot.lock().audio_only = true;
                            manager.inner.bus.emit(BusEvent::AudioOnlyMode);
                            manager.emit_state_changed();
                        }
                    }
                    TransportEvent::IceConnected | TransportEvent::IceDisconnected => {}
                    TransportEvent::IceFailed => {
                        let err =
                            VoiceError::IceConnectionFailed("recovery attempts exhausted".into());
                        manager.inner.bus.emit(BusEvent::Error {
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                        let stopper = manager.clone();
                        tokio::spawn(async move {
                            let _ = stopper.stop_session().await;
                        });
                    }
                    TransportEvent::PeerFailed(reason) => {
                        let active = manager.inner.slot.lock().phase == Phase::Active;
                        if active {
                            let err = VoiceError::PeerConnectionFailed(reason);
                            manager.inner.bus.emit(BusEvent::Error {
                                kind: err.kind(),
                                message: err.to_string(),
                            });
                            let stopper = manager.clone();
                            tokio::spawn(async move {
                                let _ = stopper.stop_session().await;
                            });
                        }
                    }
                    TransportEvent::Closed => break,
                }
            }
        });

        let previous = self.inner.slot.lock().event_pump.replace(pump);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    // ── stop path ───────────────────────────────────────────────────────

    /// Local teardown; never waits on remote acknowledgment and never
    /// fails. Emits `sessionStopped` only after every resource is
    /// released.
    async fn do_stop(&self, user_initiated: bool) {
        let session_id = {
            let mut slot = self.inner.slot.lock();
            if slot.phase == Phase::Idle {
                None
            } else {
                slot.phase = Phase::Stopping;
                slot.session_id.clone()
            }
        };

        let Some(session_id) = session_id else {
            // Already idle: stop is an idempotent no-op.
            if user_initiated {
                self.inner.bus.emit(BusEvent::UserEndedSession);
            }
            return;
        };
        self.emit_state_changed();

        self.teardown_resources().await;

        self.inner.bus.emit(BusEvent::SessionStopped { session_id });
        if user_initiated {
            self.inner.bus.emit(BusEvent::UserEndedSession);
        }
        self.emit_state_changed();
    }

    /// Release timers, pump, transport, and per-session protocol state,
    /// in that order. Each step tolerates already-released resources.
    async fn teardown_resources(&self) {
        let (timer, pump, transport) = {
            let mut slot = self.inner.slot.lock();
            (slot.response_create_timer.take(), slot.event_pump.take(), slot.transport.take())
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        self.inner.protocol.reset();

        let mut slot = self.inner.slot.lock();
        *slot = SessionSlot::new();
    }

    // ── scenario change ─────────────────────────────────────────────────

    async fn do_change_scenario(
        &self,
        scenario_id: String,
        level: Option<ProficiencyLevel>,
    ) -> Result<()> {
        let transport = {
            let slot = self.inner.slot.lock();
            if slot.phase != Phase::Active {
                return Err(VoiceError::ScenarioChange("no active session".to_string()));
            }
            slot.transport.clone()
        };
        let Some(transport) = transport else {
            return Err(VoiceError::ScenarioChange("no live transport".to_string()));
        };

        if transport.is_audio_only() && !self.inner.config.audio_only_allows_session_update {
            tracing::info!("audio-only session: scenario context updated locally only");
        } else {
            let update = self.inner.protocol.session_update(&self.inner.config);
            transport.send_event(&update).map_err(|e| {
                let err = VoiceError::ScenarioChange(e.to_string());
                self.inner
                    .bus
                    .emit(BusEvent::Error { kind: err.kind(), message: err.to_string() });
                err
            })?;
        }

        {
            let mut slot = self.inner.slot.lock();
            slot.scenario_id = Some(scenario_id);
            if let Some(level) = level {
                slot.level = level;
            }
        }
        self.emit_state_changed();
        Ok(())
    }

    fn emit_state_changed(&self) {
        let snapshot = self.state();
        self.inner.bus.emit(BusEvent::StateChanged { snapshot });
    }
}

/// Session ids are `session_<unixMillis>_<random>`.
fn new_session_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", Utc::now().timestamp_millis(), &random[..8])
}
