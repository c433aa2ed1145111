//! Audio device adapter and capture/playback contract surfaces.
//!
//! The subsystem never talks to OS audio APIs directly; platforms plug in
//! behind these traits. The adapter configures the OS audio mode with the
//! minimum required (recording permitted, playback in silent mode) so it
//! never interferes with external routes like Bluetooth or wired
//! headsets.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::Result;

/// Internal audio currency: PCM16 mono at 24 kHz.
pub const PCM_SAMPLE_RATE: u32 = 24_000;

/// Active audio output route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputRoute {
    Speaker,
    Bluetooth,
    Headphones,
    Earpiece,
}

/// Pick the preferred route from the available set: wired > bluetooth >
/// earpiece > speaker.
pub fn preferred_route(available: &[OutputRoute]) -> OutputRoute {
    for route in
        [OutputRoute::Headphones, OutputRoute::Bluetooth, OutputRoute::Earpiece, OutputRoute::Speaker]
    {
        if available.contains(&route) {
            return route;
        }
    }
    OutputRoute::Speaker
}

/// Minimal OS audio mode. Ducking other audio or staying active in the
/// background breaks external-device routing, so both stay off.
#[derive(Debug, Clone)]
pub struct AudioModeSpec {
    /// Recording permitted.
    pub allow_recording: bool,
    /// Playback allowed while the device is in silent mode.
    pub plays_in_silent_mode: bool,
    /// Never duck other audio.
    pub duck_others: bool,
    /// Never keep the audio session alive in background.
    pub stays_active_in_background: bool,
}

impl Default for AudioModeSpec {
    fn default() -> Self {
        Self {
            allow_recording: true,
            plays_in_silent_mode: true,
            duck_others: false,
            stays_active_in_background: false,
        }
    }
}

/// Capture constraints requested from the platform microphone.
#[derive(Debug, Clone)]
pub struct MicrophoneConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MicrophoneConstraints {
    fn default() -> Self {
        Self { echo_cancellation: true, noise_suppression: true, auto_gain_control: true }
    }
}

/// A live microphone capture. Dropping the stream releases the device.
pub struct MicrophoneStream {
    frames: mpsc::Receiver<Vec<i16>>,
}

impl MicrophoneStream {
    /// Wrap a frame channel produced by a platform capture backend.
    /// Frames are PCM16 mono at [`PCM_SAMPLE_RATE`].
    pub fn new(frames: mpsc::Receiver<Vec<i16>>) -> Self {
        Self { frames }
    }

    /// Receive the next capture frame. `None` once capture stops.
    pub async fn next_frame(&mut self) -> Option<Vec<i16>> {
        self.frames.recv().await
    }
}

/// Platform microphone contract. The microphone is captured exclusively
/// for the duration of a session; device acquisition may involve
/// permission prompts, so opening is async.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Open the microphone with the given constraints.
    async fn open(&self, constraints: &MicrophoneConstraints) -> Result<MicrophoneStream>;
}

/// Microphone source that yields no frames. Used in tests and in
/// embeddings where capture is driven by an external media stack.
#[derive(Debug, Clone, Default)]
pub struct NullMicrophoneSource;

#[async_trait]
impl MicrophoneSource for NullMicrophoneSource {
    async fn open(&self, _constraints: &MicrophoneConstraints) -> Result<MicrophoneStream> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(MicrophoneStream::new(rx))
    }
}

/// Playback contract for inbound assistant audio (PCM16 mono 24 kHz).
pub trait AudioSink: Send + Sync {
    /// Queue decoded samples for playback.
    fn play(&self, pcm: &[i16]);
}

/// Sink that drops audio. Useful when the UI consumes `audioData` bus
/// events instead.
#[derive(Debug, Clone, Default)]
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn play(&self, _pcm: &[i16]) {}
}

/// Output-device adapter contract.
pub trait AudioDeviceAdapter: Send + Sync {
    /// Configure the OS audio mode. Failures are non-fatal; sessions
    /// continue with the speaker fallback.
    fn configure(&self, mode: &AudioModeSpec) -> Result<()>;

    /// The currently active output route.
    fn current(&self) -> OutputRoute;

    /// Watch for route changes. The receiver's current value is the
    /// active route.
    fn watch_route(&self) -> watch::Receiver<OutputRoute>;
}

/// Device adapter with no OS integration: reports a fixed route until
/// told otherwise. The default adapter for tests and headless builds.
pub struct StaticAudioDeviceAdapter {
    tx: watch::Sender<OutputRoute>,
}

impl StaticAudioDeviceAdapter {
    /// Create an adapter reporting `route`.
    pub fn new(route: OutputRoute) -> Self {
        let (tx, _) = watch::channel(route);
        Self { tx }
    }

    /// Simulate a route change (test hook / platform glue entry point).
    pub fn set_route(&self, route: OutputRoute) {
        self.tx.send_replace(route);
    }
}

impl Default for StaticAudioDeviceAdapter {
    fn default() -> Self {
        Self::new(OutputRoute::Speaker)
    }
}

impl AudioDeviceAdapter for StaticAudioDeviceAdapter {
    fn configure(&self, mode: &AudioModeSpec) -> Result<()> {
        tracing::debug!(
            allow_recording = mode.allow_recording,
            plays_in_silent_mode = mode.plays_in_silent_mode,
            "audio mode configured"
        );
        Ok(())
    }

    fn current(&self) -> OutputRoute {
        *self.tx.borrow()
    }

    fn watch_route(&self) -> watch::Receiver<OutputRoute> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_preference_order() {
        assert_eq!(
            preferred_route(&[OutputRoute::Speaker, OutputRoute::Bluetooth]),
            OutputRoute::Bluetooth
        );
        assert_eq!(
            preferred_route(&[
                OutputRoute::Speaker,
                OutputRoute::Bluetooth,
                OutputRoute::Headphones
            ]),
            OutputRoute::Headphones
        );
        assert_eq!(
            preferred_route(&[OutputRoute::Speaker, OutputRoute::Earpiece]),
            OutputRoute::Earpiece
        );
        assert_eq!(preferred_route(&[]), OutputRoute::Speaker);
    }

    #[test]
    fn audio_mode_defaults_stay_out_of_the_way() {
        let mode = AudioModeSpec::default();
        assert!(mode.allow_recording);
        assert!(mode.plays_in_silent_mode);
        assert!(!mode.duck_others);
        assert!(!mode.stays_active_in_background);
    }

    #[tokio::test]
    async fn static_adapter_reports_route_changes() {
        let adapter = StaticAudioDeviceAdapter::default();
        assert_eq!(adapter.current(), OutputRoute::Speaker);

        let mut watcher = adapter.watch_route();
        adapter.set_route(OutputRoute::Bluetooth);
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), OutputRoute::Bluetooth);
        assert_eq!(adapter.current(), OutputRoute::Bluetooth);
    }

    #[tokio::test]
    async fn null_microphone_yields_no_frames() {
        let mic = NullMicrophoneSource;
        let mut stream = mic.open(&MicrophoneConstraints::default()).await.unwrap();
        assert!(stream.next_frame().await.is_none());
    }
}
