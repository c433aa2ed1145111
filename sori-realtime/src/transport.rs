//! Transport negotiator: peer-connection bring-up over SDP exchange.
//!
//! Stands up a working peer connection with a bidirectional control
//! channel and inbound audio, or fails cleanly. Built on Sans-IO WebRTC
//! (`str0m`): the negotiator performs the SDP handshake, then a
//! dedicated tokio task drives the `Rtc` state machine over a UDP
//! socket — timers in, datagrams in/out, events out.
//!
//! Ordering is load-bearing: the `oai-events` data channel is created
//! *before* the SDP offer is produced so the offer carries the SCTP
//! application section. The remote endpoint will not renegotiate to add
//! one later.

use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, MutSignals, SampleRate};
use secrecy::{ExposeSecret, SecretString};
use str0m::channel::ChannelId;
use str0m::change::SdpAnswer;
use str0m::media::{Direction, Frequency, MediaKind, MediaTime, Mid, Pt};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::config::TimingConfig;
use crate::devices::{AudioSink, MicrophoneStream};
use crate::error::{Result, VoiceError};
use crate::events::ClientEvent;

/// Label the remote endpoint requires for its control channel.
pub const DATA_CHANNEL_LABEL: &str = "oai-events";

/// Samples per 20 ms Opus frame at 24 kHz mono.
const SAMPLES_PER_FRAME: usize = 480;

/// Maximum size of an encoded Opus frame. Well above the largest frame
/// Opus can produce for speech configurations.
const MAX_OPUS_FRAME_BYTES: usize = 4000;

/// Maximum decoded samples per channel per frame (120 ms at 48 kHz).
const MAX_DECODED_SAMPLES_PER_CHANNEL: usize = 5760;

/// Cap on control messages queued before the channel opens.
const PENDING_MESSAGE_CAP: usize = 50;

// ── Opus transcoding boundary ───────────────────────────────────────────

/// PCM16 ↔ Opus transcoder for the WebRTC media track.
///
/// The subsystem's internal audio currency is PCM16 mono 24 kHz; the
/// wire carries Opus. Encoding uses the VoIP application profile.
pub struct OpusCodec {
    encoder: Encoder,
    decoder: Decoder,
    channels: Channels,
}

impl OpusCodec {
    /// Create a codec for the given sample rate and channel count.
    pub fn new(sample_rate: u32, channels: u8) -> Result<Self> {
        let sample_rate = SampleRate::try_from(sample_rate as i32)
            .map_err(|e| VoiceError::Codec(format!("invalid sample rate {sample_rate}: {e}")))?;
        let channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(VoiceError::Codec(format!(
                    "invalid channel count {other}: must be 1 or 2"
                )));
            }
        };

        let encoder = Encoder::new(sample_rate, channels, Application::Voip)
            .map_err(|e| VoiceError::Codec(format!("opus encoder init failed: {e}")))?;
        let decoder = Decoder::new(sample_rate, channels)
            .map_err(|e| VoiceError::Codec(format!("opus decoder init failed: {e}")))?;

        Ok(Self { encoder, decoder, channels })
    }

    /// Encode one frame of PCM16 samples to Opus.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; MAX_OPUS_FRAME_BYTES];
        let len = self
            .encoder
            .encode(pcm, &mut output)
            .map_err(|e| VoiceError::Codec(format!("opus encode failed: {e}")))?;
        output.truncate(len);
        Ok(output)
    }

    /// Decode an Opus frame to PCM16 samples.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<i16>> {
        let channel_count = match self.channels {
            Channels::Stereo => 2,
            _ => 1,
        };
        let mut output = vec![0i16; MAX_DECODED_SAMPLES_PER_CHANNEL * channel_count];

        let packet = audiopus::packet::Packet::try_from(opus_data)
            .map_err(|e| VoiceError::Codec(format!("invalid opus packet: {e}")))?;
        let signals = MutSignals::try_from(output.as_mut_slice())
            .map_err(|e| VoiceError::Codec(format!("output buffer: {e}")))?;

        let decoded = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|e| VoiceError::Codec(format!("opus decode failed: {e}")))?;
        output.truncate(decoded * channel_count);
        Ok(output)
    }
}

// ── SDP diagnostics ─────────────────────────────────────────────────────

/// What an SDP body claims about media sections. Used to diagnose offers
/// that were built wrong and answers where the remote refused the data
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpSummary {
    /// Carries an `m=application` media section.
    pub has_application: bool,
    /// Carries SCTP data-channel attributes.
    pub has_sctp: bool,
    /// Carries `a=group:BUNDLE`.
    pub has_bundle: bool,
    /// Carries an `m=audio` media section.
    pub has_audio: bool,
}

/// Inspect an SDP body for the media sections the session depends on.
pub fn analyze_sdp(sdp: &str) -> SdpSummary {
    SdpSummary {
        has_application: sdp.contains("m=application"),
        has_sctp: sdp.contains("a=sctp-port")
            || sdp.contains("a=sctpmap")
            || sdp.contains("webrtc-datachannel"),
        has_bundle: sdp.contains("a=group:BUNDLE"),
        has_audio: sdp.contains("m=audio"),
    }
}

/// Diagnostics captured during negotiation.
#[derive(Debug, Clone)]
pub struct NegotiationReport {
    /// Summary of the local offer.
    pub offer: SdpSummary,
    /// Summary of the remote answer.
    pub answer: SdpSummary,
    /// The answer carried no data-channel section; the session can only
    /// proceed audio-only.
    pub remote_refused_channel: bool,
}

// ── Pre-open outbound queue ─────────────────────────────────────────────

/// FIFO buffer for control messages sent before the channel opens.
struct PendingMessages {
    items: Vec<Vec<u8>>,
}

impl PendingMessages {
    fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn push(&mut self, message: Vec<u8>) -> Result<()> {
        if self.items.len() >= PENDING_MESSAGE_CAP {
            return Err(VoiceError::send_message(format!(
                "data channel message queue full ({PENDING_MESSAGE_CAP}); channel may not be \
                 opening"
            )));
        }
        self.items.push(message);
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.items)
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

// ── Driver plumbing ─────────────────────────────────────────────────────

/// Commands from the transport handle to the driver task.
enum DriverCommand {
    /// Write a control event to the data channel (queued until open).
    Send(Vec<u8>),
    /// Tear the connection down.
    Close,
}

/// Events from the driver task to the orchestrator.
#[derive(Debug)]
pub enum TransportEvent {
    /// The `oai-events` channel reached open.
    ChannelOpen,
    /// A control-channel message arrived.
    ChannelMessage(String),
    /// The control channel closed mid-session.
    ChannelClosed,
    /// ICE recovered or connected.
    IceConnected,
    /// ICE entered `disconnected`; a recovery timer is running.
    IceDisconnected,
    /// ICE gave up after the recovery budget.
    IceFailed,
    /// The peer connection died.
    PeerFailed(String),
    /// The driver exited; every resource is released.
    Closed,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Mic frames encoded and written to the track.
    pub frames_sent: AtomicU64,
    /// Remote audio frames decoded to the sink.
    pub frames_received: AtomicU64,
}

/// Live transport context: the peer connection, its data channel, and
/// the local capture stream, owned by the driver task behind this
/// handle. Exactly one exists per orchestrator at any time.
pub struct Transport {
    cmd_tx: mpsc::UnboundedSender<DriverCommand>,
    dc_open: Arc<AtomicBool>,
    dc_open_rx: watch::Receiver<bool>,
    audio_only: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
    report: NegotiationReport,
    driver: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Transport {
    /// Negotiation diagnostics for this connection.
    pub fn report(&self) -> &NegotiationReport {
        &self.report
    }

    /// Whether the control channel is open.
    pub fn is_channel_open(&self) -> bool {
        self.dc_open.load(Ordering::Acquire)
    }

    /// Whether the session is running degraded, without a control
    /// channel.
    pub fn is_audio_only(&self) -> bool {
        self.audio_only.load(Ordering::Acquire)
    }

    /// Enter audio-only mode: outbound control events become no-ops.
    pub fn enable_audio_only(&self) {
        self.audio_only.store(true, Ordering::Release);
    }

    /// Diagnostics counters.
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Send a control event.
    ///
    /// In audio-only mode the event is logged and dropped — turn-taking
    /// is driven entirely by server-side VAD there. Before the channel
    /// opens, events are queued (bounded) and flushed in order on open.
    pub fn send_event(&self, event: &ClientEvent) -> Result<()> {
        if self.is_audio_only() {
            tracing::info!(?event, "audio-only mode: dropping outbound control event");
            return Ok(());
        }
        let bytes = serde_json::to_vec(event)?;
        self.cmd_tx
            .send(DriverCommand::Send(bytes))
            .map_err(|_| VoiceError::send_message("transport driver is gone"))
    }

    /// Wait for the data channel to reach open.
    ///
    /// Dual mechanism: the driver's open notification and a polling loop
    /// over the shared open flag — in some runtimes the open callback is
    /// unreliable, and either satisfying the condition resolves the
    /// wait. Returns `false` on timeout.
    pub async fn wait_for_channel_open(&self, timeout: Duration) -> bool {
        if self.is_channel_open() {
            return true;
        }
        let mut open_rx = self.dc_open_rx.clone();
        let mut poll = tokio::time::interval(Duration::from_millis(100));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::select! {
                changed = open_rx.changed() => {
                    if changed.is_err() {
                        return self.is_channel_open();
                    }
                    if *open_rx.borrow() {
                        return true;
                    }
                }
                _ = poll.tick() => {
                    if self.is_channel_open() {
                        return true;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return self.is_channel_open();
                }
            }
        }
    }

    /// Tear down the transport. Never fails: each step tolerates
    /// already-closed resources, and a wedged driver is aborted.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(DriverCommand::Close);
        let handle = self.driver.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle).await.is_err() {
                tracing::warn!("transport driver did not settle; aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(DriverCommand::Close);
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

// ── Negotiator ──────────────────────────────────────────────────────────

/// Performs the SDP handshake with the realtime endpoint and hands the
/// connection to a driver task.
pub struct Negotiator {
    http: reqwest::Client,
    realtime_base: String,
    model: String,
    stun_servers: Vec<String>,
}

impl Negotiator {
    pub fn new(
        realtime_base: impl Into<String>,
        model: impl Into<String>,
        stun_servers: Vec<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            realtime_base: realtime_base.into(),
            model: model.into(),
            stun_servers,
        }
    }

    /// Bring up a peer connection in the normative order and return the
    /// live transport plus its event stream.
    ///
    /// The caller owns closing any previous transport first; this
    /// function always builds a fresh connection.
    pub async fn connect(
        &self,
        ephemeral_key: &SecretString,
        mic: Option<MicrophoneStream>,
        sink: Arc<dyn AudioSink>,
        timing: &TimingConfig,
    ) -> Result<(Transport, mpsc::UnboundedReceiver<TransportEvent>)> {
        // Socket first: the ICE agent needs the local host candidate.
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let local_addr = socket.local_addr()?;

        let mut rtc = Rtc::new(Instant::now());

        let candidate = Candidate::host(local_addr, "udp")
            .map_err(|e| VoiceError::connection(format!("host candidate: {e}")))?;
        rtc.add_local_candidate(candidate);

        // Media + data channel are added before apply() so both are
        // negotiated in the offer.
        let mut changes = rtc.sdp_api();
        let audio_mid = changes.add_media(MediaKind::Audio, Direction::SendRecv, None, None, None);
        let channel_id = changes.add_channel(DATA_CHANNEL_LABEL.to_string());

        let (offer, pending) = changes
            .apply()
            .ok_or_else(|| VoiceError::connection("no SDP changes to apply"))?;
        let offer_sdp = offer.to_sdp_string();

        let offer_summary = analyze_sdp(&offer_sdp);
        if !offer_summary.has_application {
            // The channel must be created before the offer; reaching
            // this point means the setup above regressed.
            return Err(VoiceError::PeerConnectionFailed(
                "local offer carries no data-channel media section".to_string(),
            ));
        }
        tracing::debug!(
            ?offer_summary,
            stun_servers = ?self.stun_servers,
            %audio_mid,
            "local SDP offer ready"
        );

        let answer_sdp = self.exchange_sdp(ephemeral_key, &offer_sdp).await?;
        let answer_summary = analyze_sdp(&answer_sdp);
        let remote_refused_channel = !answer_summary.has_application && !answer_summary.has_sctp;
        if remote_refused_channel {
            tracing::warn!(?answer_summary, "remote answer refused the data channel");
        }

        let answer = SdpAnswer::from_sdp_string(&answer_sdp)
            .map_err(|e| VoiceError::connection(format!("invalid SDP answer: {e}")))?;
        rtc.sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| VoiceError::connection(format!("apply SDP answer: {e}")))?;
        tracing::info!(%audio_mid, "SDP handshake complete");

        // Resolve the negotiated Opus payload type and clock rate.
        let (opus_pt, clock_rate) = {
            let writer = rtc.writer(audio_mid).ok_or_else(|| {
                VoiceError::connection("audio track writer unavailable after answer")
            })?;
            let params = writer.payload_params().next().ok_or_else(|| {
                VoiceError::connection("no audio payload type negotiated in answer")
            })?;
            (params.pt(), params.spec().clock_rate)
        };

        let codec = OpusCodec::new(24_000, 1)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (dc_open_tx, dc_open_rx) = watch::channel(false);
        let dc_open = Arc::new(AtomicBool::new(false));
        let audio_only = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(TransportStats::default());

        let driver = Driver {
            rtc,
            socket,
            local_addr,
            audio_mid,
            channel_id,
            opus_pt,
            clock_rate,
            codec,
            mic,
            sink,
            cmd_rx,
            event_tx,
            dc_open: Arc::clone(&dc_open),
            dc_open_tx,
            audio_only: Arc::clone(&audio_only),
            stats: Arc::clone(&stats),
            pending: PendingMessages::new(),
            pcm_buffer: Vec::new(),
            rtp_offset: 0,
            ice_recovery_deadline: None,
            ice_recovery_attempts: 0,
            ice_recovery_delay: timing.ice_recovery_delay,
            max_ice_recoveries: timing.max_ice_recoveries,
        };
        let handle = tokio::spawn(driver.run());

        let transport = Transport {
            cmd_tx,
            dc_open,
            dc_open_rx,
            audio_only,
            stats,
            report: NegotiationReport {
                offer: offer_summary,
                answer: answer_summary,
                remote_refused_channel,
            },
            driver: parking_lot::Mutex::new(Some(handle)),
        };
        Ok((transport, event_rx))
    }

    /// POST the offer to `{realtimeBase}?model=` and return the answer
    /// SDP. The endpoint may answer raw SDP or JSON with an `sdp` field.
    async fn exchange_sdp(&self, ephemeral_key: &SecretString, offer_sdp: &str) -> Result<String> {
        let url = format!("{}?model={}", self.realtime_base, self.model);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", ephemeral_key.expose_secret()))
            .header("Content-Type", "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| VoiceError::connection(format!("SDP exchange request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::connection(format!(
                "SDP exchange failed with status {status}: {body}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| VoiceError::connection(format!("reading SDP answer: {e}")))?;

        if content_type.contains("application/sdp") || body.starts_with("v=0") {
            Ok(body)
        } else {
            #[derive(serde::Deserialize)]
            struct SdpBody {
                sdp: String,
            }
            let parsed: SdpBody = serde_json::from_str(&body)
                .map_err(|e| VoiceError::connection(format!("SDP answer JSON: {e}")))?;
            Ok(parsed.sdp)
        }
    }
}

// ── Driver task ─────────────────────────────────────────────────────────

struct Driver {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    audio_mid: Mid,
    channel_id: ChannelId,
    opus_pt: Pt,
    clock_rate: Frequency,
    codec: OpusCodec,
    mic: Option<MicrophoneStream>,
    sink: Arc<dyn AudioSink>,
    cmd_rx: mpsc::UnboundedReceiver<DriverCommand>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    dc_open: Arc<AtomicBool>,
    dc_open_tx: watch::Sender<bool>,
    audio_only: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
    pending: PendingMessages,
    pcm_buffer: Vec<i16>,
    rtp_offset: u64,
    ice_recovery_deadline: Option<tokio::time::Instant>,
    ice_recovery_attempts: u32,
    ice_recovery_delay: Duration,
    max_ice_recoveries: u32,
}

impl Driver {
    async fn run(mut self) {
        let mut net_buf = vec![0u8; 2000];
        let mut next_timeout = match self.drain().await {
            Some(t) => t,
            None => {
                self.shutdown();
                return;
            }
        };

        loop {
            let delay = next_timeout.saturating_duration_since(Instant::now());
            let mic_active = self.mic.is_some();
            let recovery_pending = self.ice_recovery_deadline.is_some();
            let recovery_at =
                self.ice_recovery_deadline.unwrap_or_else(|| {
                    tokio::time::Instant::now() + Duration::from_secs(3600)
                });

            tokio::select! {
                // Network ingress (UDP → Rtc)
                received = self.socket.recv_from(&mut net_buf) => {
                    match received {
                        Ok((n, source)) => {
                            if let Ok(contents) = net_buf[..n].try_into() {
                                let receive = Receive {
                                    proto: Protocol::Udp,
                                    source,
                                    destination: self.local_addr,
                                    contents,
                                };
                                if let Err(e) =
                                    self.rtc.handle_input(Input::Receive(Instant::now(), receive))
                                {
                                    tracing::debug!(error = %e, "dropping bad datagram");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "UDP receive failed");
                            let _ = self.event_tx.send(TransportEvent::PeerFailed(e.to_string()));
                            break;
                        }
                    }
                }

                // Rtc timer
                _ = tokio::time::sleep(delay) => {
                    let _ = self.rtc.handle_input(Input::Timeout(Instant::now()));
                }

                // Outbound control events and teardown
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(DriverCommand::Send(bytes)) => {
                            if let Err(err) = self.write_channel(bytes) {
                                let _ = self.event_tx.send(
                                    TransportEvent::PeerFailed(err.to_string()),
                                );
                            }
                        }
                        Some(DriverCommand::Close) | None => break,
                    }
                }

                // Local mic frames → Opus → audio track
                frame = next_mic_frame(&mut self.mic), if mic_active => {
                    match frame {
                        Some(samples) => self.push_mic_samples(&samples),
                        None => {
                            tracing::debug!("microphone capture ended");
                            self.mic = None;
                        }
                    }
                }

                // ICE recovery timer
                _ = tokio::time::sleep_until(recovery_at), if recovery_pending => {
                    self.ice_recovery_deadline = None;
                    self.ice_recovery_attempts += 1;
                    if self.ice_recovery_attempts > self.max_ice_recoveries {
                        tracing::error!(
                            attempts = self.ice_recovery_attempts,
                            "ICE did not recover; giving up"
                        );
                        let _ = self.event_tx.send(TransportEvent::IceFailed);
                        break;
                    }
                    tracing::warn!(
                        attempt = self.ice_recovery_attempts,
                        "ICE still disconnected; continuing to monitor"
                    );
                    self.ice_recovery_deadline =
                        Some(tokio::time::Instant::now() + self.ice_recovery_delay);
                }
            }

            if !self.rtc.is_alive() {
                let _ = self
                    .event_tx
                    .send(TransportEvent::PeerFailed("peer connection closed".to_string()));
                break;
            }

            next_timeout = match self.drain().await {
                Some(t) => t,
                None => break,
            };
        }

        self.shutdown();
    }

    /// Drain all pending Rtc outputs. Returns the next timer deadline,
    /// or `None` when the connection is done.
    async fn drain(&mut self) -> Option<Instant> {
        loop {
            match self.rtc.poll_output() {
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) =
                        self.socket.send_to(&transmit.contents, transmit.destination).await
                    {
                        tracing::warn!(error = %e, "UDP send failed");
                    }
                }
                Ok(Output::Event(event)) => {
                    if !self.handle_event(event) {
                        return None;
                    }
                }
                Ok(Output::Timeout(t)) => return Some(t),
                Err(e) => {
                    let _ = self.event_tx.send(TransportEvent::PeerFailed(e.to_string()));
                    return None;
                }
            }
        }
    }

    /// Handle one Rtc event. Returns `false` when the driver must exit.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Connected => {
                tracing::info!("peer connection established");
                true
            }
            Event::ChannelOpen(id, label) => {
                if id == self.channel_id {
                    tracing::info!(%label, "data channel open");
                    self.dc_open.store(true, Ordering::Release);
                    let _ = self.dc_open_tx.send(true);
                    self.flush_pending();
                    let _ = self.event_tx.send(TransportEvent::ChannelOpen);
                }
                true
            }
            Event::ChannelData(data) => {
                if data.id == self.channel_id {
                    match std::str::from_utf8(&data.data) {
                        Ok(text) => {
                            let _ = self
                                .event_tx
                                .send(TransportEvent::ChannelMessage(text.to_string()));
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "non-UTF8 channel payload dropped");
                        }
                    }
                }
                true
            }
            Event::ChannelClose(id) => {
                if id == self.channel_id {
                    tracing::warn!("data channel closed");
                    self.dc_open.store(false, Ordering::Release);
                    let _ = self.event_tx.send(TransportEvent::ChannelClosed);
                }
                true
            }
            Event::IceConnectionStateChange(state) => self.handle_ice_state(state),
            Event::MediaData(media) => {
                if media.mid == self.audio_mid {
                    match self.codec.decode(&media.data) {
                        Ok(pcm) => {
                            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            self.sink.play(&pcm);
                        }
                        Err(e) => tracing::debug!(error = %e, "inbound audio decode failed"),
                    }
                }
                true
            }
            other => {
                tracing::trace!(?other, "unhandled transport event");
                true
            }
        }
    }

    fn handle_ice_state(&mut self, state: IceConnectionState) -> bool {
        tracing::info!(?state, "ICE state change");
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.ice_recovery_attempts = 0;
                self.ice_recovery_deadline = None;
                let _ = self.event_tx.send(TransportEvent::IceConnected);
            }
            IceConnectionState::Disconnected => {
                let _ = self.event_tx.send(TransportEvent::IceDisconnected);
                if self.ice_recovery_deadline.is_none() {
                    self.ice_recovery_deadline =
                        Some(tokio::time::Instant::now() + self.ice_recovery_delay);
                }
            }
            _ => {}
        }
        true
    }

    /// Write (or queue) an outbound control message.
    fn write_channel(&mut self, bytes: Vec<u8>) -> Result<()> {
        if !self.dc_open.load(Ordering::Acquire) {
            let queued = self.pending.push(bytes);
            if queued.is_ok() {
                tracing::debug!(pending = self.pending.len(), "channel not open; queued message");
            }
            return queued;
        }
        let mut channel = self
            .rtc
            .channel(self.channel_id)
            .ok_or_else(|| VoiceError::data_channel("data channel unavailable"))?;
        channel
            .write(false, &bytes)
            .map_err(|e| VoiceError::data_channel(format!("channel write failed: {e}")))?;
        Ok(())
    }

    fn flush_pending(&mut self) {
        let queued = self.pending.drain();
        if queued.is_empty() {
            return;
        }
        tracing::info!(count = queued.len(), "flushing queued control messages");
        let mut channel = match self.rtc.channel(self.channel_id) {
            Some(channel) => channel,
            None => return,
        };
        for message in queued {
            if let Err(e) = channel.write(false, &message) {
                tracing::warn!(error = %e, "queued message flush failed");
            }
        }
    }

    /// Buffer mic samples and write complete 20 ms frames to the track.
    fn push_mic_samples(&mut self, samples: &[i16]) {
        self.pcm_buffer.extend_from_slice(samples);
        while self.pcm_buffer.len() >= SAMPLES_PER_FRAME {
            let frame: Vec<i16> = self.pcm_buffer.drain(..SAMPLES_PER_FRAME).collect();
            let encoded = match self.codec.encode(&frame) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::debug!(error = %e, "mic frame encode failed");
                    continue;
                }
            };

            // Opus over RTP uses a 48 kHz clock regardless of the input
            // rate; scale the per-frame sample count accordingly.
            let clock_hz = self.clock_rate.get() as u64;
            let ticks = (SAMPLES_PER_FRAME as u64) * clock_hz / 24_000;
            let rtp_time = MediaTime::new(self.rtp_offset, self.clock_rate);
            self.rtp_offset += ticks;

            let writer = match self.rtc.writer(self.audio_mid) {
                Some(writer) => writer,
                None => return,
            };
            if let Err(e) = writer.write(self.opus_pt, Instant::now(), rtp_time, encoded) {
                tracing::debug!(error = %e, "audio track write failed");
                return;
            }
            self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Release everything: local capture, channel, peer connection.
    /// Every step tolerates already-closed resources; teardown never
    /// propagates errors.
    fn shutdown(mut self) {
        self.mic = None;
        self.dc_open.store(false, Ordering::Release);
        let _ = self.dc_open_tx.send(false);
        self.rtc.disconnect();
        // One last poll cycle lets str0m emit its close output. Bounded
        // so a misbehaving state machine cannot wedge teardown.
        for _ in 0..64 {
            match self.rtc.poll_output() {
                Ok(Output::Timeout(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        let _ = self.event_tx.send(TransportEvent::Closed);
        tracing::debug!("transport driver exited");
    }
}

async fn next_mic_frame(mic: &mut Option<MicrophoneStream>) -> Option<Vec<i16>> {
    match mic.as_mut() {
        Some(stream) => stream.next_frame().await,
        None => None,
    }
}
