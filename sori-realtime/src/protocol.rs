//! Control-channel protocol handler.
//!
//! Consumes JSON events from the data channel, maintains AI-speaking /
//! transcript / conversation-history state, and emits bus topics. Also
//! builds the two outbound events the orchestrator produces:
//! `session.update` and the initial `response.create`.
//!
//! Generation-complete is not playback-complete: `response.done` only
//! schedules a delayed transition out of the speaking state, giving the
//! audio buffer time to drain. Interruption is remote-driven — a user
//! speech-start while the assistant speaks sends no local cancel; the
//! remote truncates and emits its own completion events.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::bus::{BusEvent, EventBus};
use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::events::{ClientEvent, ServerEvent, parse_server_event};
use crate::transcript::{AiSpeechState, ConversationHistory, PartialTranscripts, Role, Turn};

struct ProtocolState {
    history: ConversationHistory,
    partial: PartialTranscripts,
    speech: AiSpeechState,
    speech_end_timer: Option<tokio::task::JoinHandle<()>>,
}

impl ProtocolState {
    fn new() -> Self {
        Self {
            history: ConversationHistory::default(),
            partial: PartialTranscripts::default(),
            speech: AiSpeechState::default(),
            speech_end_timer: None,
        }
    }
}

/// The protocol handler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProtocolHandler {
    bus: EventBus,
    state: Arc<Mutex<ProtocolState>>,
    speech_end_grace: Duration,
    speech_end_extension: Duration,
}

impl ProtocolHandler {
    pub fn new(bus: EventBus, config: &VoiceConfig) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(ProtocolState::new())),
            speech_end_grace: config.timing.speech_end_grace,
            speech_end_extension: config.timing.speech_end_extension,
        }
    }

    /// Whether the assistant is currently considered speaking.
    pub fn is_ai_speaking(&self) -> bool {
        self.state.lock().speech.is_audio_playing
    }

    /// Completed turns so far, oldest first.
    pub fn history(&self) -> Vec<Turn> {
        self.state.lock().history.turns().to_vec()
    }

    /// Clear history, partial transcripts, and speaking state; cancel
    /// any scheduled timer. Invoked on every transition to `Idle`.
    pub fn reset(&self) {
        let timer = {
            let mut state = self.state.lock();
            state.history.clear();
            state.partial.clear();
            state.speech.clear();
            state.speech_end_timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    /// Build the `session.update` sent once the channel opens.
    ///
    /// Instructions were injected server-side when the credential was
    /// minted and are deliberately absent here.
    pub fn session_update(&self, config: &VoiceConfig) -> ClientEvent {
        ClientEvent::SessionUpdate {
            session: json!({
                "voice": config.voice,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "input_audio_transcription": {
                    "model": config.transcription_model,
                },
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": config.vad.threshold,
                    "prefix_padding_ms": config.vad.prefix_padding_ms,
                    "silence_duration_ms": config.vad.silence_duration_ms,
                },
                "temperature": config.temperature,
                "tools": [],
            }),
        }
    }

    /// Build the response-create that makes the model open the
    /// conversation.
    pub fn response_create(&self) -> ClientEvent {
        ClientEvent::ResponseCreate { response: None }
    }

    /// Process one raw control-channel message.
    pub fn handle_message(&self, text: &str) {
        let (event, raw) = match parse_server_event(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable control-channel message");
                return;
            }
        };
        self.handle_event(event, raw);
    }

    /// Process one typed event. Emissions happen after the state lock is
    /// released so listeners may re-enter the handler.
    pub fn handle_event(&self, event: ServerEvent, raw: Value) {
        let mut emissions: Vec<BusEvent> = Vec::new();
        let mut schedule_speech_end = false;

        {
            let mut state = self.state.lock();
            match event {
                ServerEvent::SessionCreated { session } => {
                    emissions.push(BusEvent::SessionCreated { session });
                }
                ServerEvent::SessionUpdated { session } => {
                    emissions.push(BusEvent::SessionUpdated { session });
                }
                ServerEvent::SpeechStarted { .. } => {
                    if state.speech.is_audio_playing {
                        // No local truncation: the remote owns it and
                        // will send the matching completion events.
                        tracing::debug!("user speech started while assistant speaking");
                    }
                    emissions.push(BusEvent::UserSpeechStarted);
                }
                ServerEvent::SpeechStopped { .. } => {
                    emissions.push(BusEvent::UserSpeechStopped);
                }
                ServerEvent::AudioDelta { response_id, delta } => {
                    state.speech.begin_response(response_id);
                    if !state.speech.is_audio_playing {
                        state.speech.is_audio_playing = true;
                        emissions.push(BusEvent::AiSpeechStarted);
                    }
                    state.speech.audio_data_received = true;
                    emissions.push(BusEvent::AudioData { chunk: delta });
                }
                ServerEvent::AudioDone { .. } => {
                    // Generation complete, not playback complete.
                    state.speech.audio_data_received = true;
                }
                ServerEvent::TranscriptDelta { response_id, delta } => {
                    state.speech.begin_response(response_id);
                    state.partial.append(Role::Assistant, &delta);
                    emissions.push(BusEvent::AiTranscriptDelta { delta });
                }
                ServerEvent::TranscriptDone { transcript, .. } => {
                    let text = state.partial.finalize(Role::Assistant, &transcript);
                    if !text.is_empty() {
                        state.history.push(Role::Assistant, text.clone());
                    }
                    state.speech.transcript_received = true;
                    emissions.push(BusEvent::AiTranscriptComplete { text });
                }
                ServerEvent::ResponseDone { response } => {
                    emissions.push(BusEvent::ResponseCompleted { response });
                    schedule_speech_end = true;
                }
                ServerEvent::OutputAudioBufferStopped { .. } => {
                    // Remote-side drain notification; the speaking state
                    // ends on our own schedule.
                    emissions.push(BusEvent::OutputAudioBufferStopped);
                }
                ServerEvent::ItemCreated { item } => {
                    if let Some(transcript) = item.user_audio_transcript() {
                        let text = transcript.to_string();
                        state.history.push(Role::User, text.clone());
                        emissions.push(BusEvent::UserTranscriptComplete { text });
                    }
                }
                ServerEvent::InputTranscriptionDelta { delta } => {
                    state.partial.append(Role::User, &delta);
                    emissions.push(BusEvent::UserTranscriptDelta { delta });
                }
                ServerEvent::InputTranscriptionCompleted { transcript } => {
                    let text = state.partial.finalize(Role::User, &transcript);
                    if !text.is_empty() {
                        state.history.push(Role::User, text.clone());
                        emissions.push(BusEvent::UserTranscriptComplete { text });
                    }
                }
                ServerEvent::RateLimitsUpdated { rate_limits } => {
                    emissions.push(BusEvent::RateLimitsUpdated { limits: rate_limits });
                }
                ServerEvent::Error { error } => {
                    if error.is_benign_truncation() {
                        tracing::debug!(message = %error.message,
                            "ignoring benign truncation artifact");
                    } else {
                        let err = VoiceError::remote(
                            error.code.unwrap_or_else(|| error.error_type.clone()),
                            error.message,
                        );
                        emissions.push(BusEvent::Error {
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                    }
                }
                ServerEvent::Unknown => {
                    emissions.push(BusEvent::Message { payload: raw });
                }
            }
        }

        for event in emissions {
            self.bus.emit(event);
        }
        if schedule_speech_end {
            self.schedule_speech_end();
        }
    }

    /// Schedule the delayed transition out of the speaking state.
    ///
    /// After the grace period, the state ends if audio actually arrived;
    /// otherwise the timer extends once before forcing the transition.
    /// The handle is cleared on fire and aborted by [`Self::reset`].
    fn schedule_speech_end(&self) {
        let handler = self.clone();
        let grace = self.speech_end_grace;
        let extension = self.speech_end_extension;

        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let validated = {
                let state = handler.state.lock();
                if !state.speech.is_audio_playing {
                    return;
                }
                state.speech.audio_data_received
            };

            if !validated {
                tracing::debug!("speech-end validation failed; extending");
                tokio::time::sleep(extension).await;
            }

            let ended = {
                let mut state = handler.state.lock();
                state.speech_end_timer = None;
                if state.speech.is_audio_playing {
                    state.speech.is_audio_playing = false;
                    true
                } else {
                    false
                }
            };
            if ended {
                handler.bus.emit(BusEvent::AiSpeechEnded);
            }
        });

        let previous = {
            let mut state = self.state.lock();
            state.speech_end_timer.replace(task)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}
