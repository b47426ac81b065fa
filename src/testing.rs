//! In-memory collaborators for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::assets::Sound;
use crate::audio::opus::{CodecFactory, SpeechDecoder, SpeechEncoder};
use crate::audio::{AudioPacket, samples_for};
use crate::collaborators::{
    AudioCodec, AudioProcessor, Board, Display, Ota, ThingRegistry, VoiceEvents, WakeWordDetector,
};
use crate::error::{CodecError, OtaError};
use crate::orchestrator::update::UpdateHost;
use crate::protocol::{DeviceState, InboundMessage};
use crate::transport::{ChannelStatus, Session, Transport, TransportEventSink};

#[derive(Default)]
pub(crate) struct RecordingSink {
    json: Mutex<Vec<InboundMessage>>,
    audio: Mutex<Vec<AudioPacket>>,
    closed: AtomicUsize,
    errors: Mutex<Vec<String>>,
    goodbyes: Mutex<Vec<Option<String>>>,
}

impl RecordingSink {
    pub fn json(&self) -> Vec<InboundMessage> {
        self.json.lock().clone()
    }

    pub fn audio(&self) -> Vec<AudioPacket> {
        self.audio.lock().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn goodbyes(&self) -> Vec<Option<String>> {
        self.goodbyes.lock().clone()
    }
}

impl TransportEventSink for RecordingSink {
    fn on_json(&self, message: InboundMessage) {
        self.json.lock().push(message);
    }

    fn on_audio(&self, packet: AudioPacket) {
        self.audio.lock().push(packet);
    }

    fn on_channel_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_network_error(&self, message: String) {
        self.errors.lock().push(message);
    }

    fn on_goodbye(&self, session_id: Option<String>) {
        self.goodbyes.lock().push(session_id);
    }
}

/// Codec whose input is a constant signal and whose output is counted.
pub(crate) struct FakeCodec {
    input_rate: u32,
    output_rate: u32,
    input: AtomicBool,
    output: AtomicBool,
    reads: Mutex<Vec<usize>>,
    played: AtomicUsize,
}

impl FakeCodec {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input_rate,
            output_rate,
            input: AtomicBool::new(true),
            output: AtomicBool::new(false),
            reads: Mutex::new(Vec::new()),
            played: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> Vec<usize> {
        self.reads.lock().clone()
    }

    pub fn played(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }
}

impl AudioCodec for FakeCodec {
    fn start(&self) -> Result<(), CodecError> {
        Ok(())
    }

    fn enable_input(&self, enable: bool) {
        self.input.store(enable, Ordering::SeqCst);
    }

    fn enable_output(&self, enable: bool) {
        self.output.store(enable, Ordering::SeqCst);
    }

    fn input_enabled(&self) -> bool {
        self.input.load(Ordering::SeqCst)
    }

    fn output_enabled(&self) -> bool {
        self.output.load(Ordering::SeqCst)
    }

    fn input_data(&self, buffer: &mut [i16]) -> bool {
        self.reads.lock().push(buffer.len());
        buffer.fill(100);
        true
    }

    fn output_data(&self, pcm: &[i16]) {
        self.played.fetch_add(pcm.len(), Ordering::SeqCst);
    }

    fn input_sample_rate(&self) -> u32 {
        self.input_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.output_rate
    }

    fn input_channels(&self) -> usize {
        1
    }
}

#[derive(Default)]
pub(crate) struct CodecCounters {
    pub encoder_resets: AtomicUsize,
    pub decoder_resets: AtomicUsize,
    pub decoded: AtomicUsize,
    pub decoders: Mutex<Vec<(u32, u32)>>,
    pub fail_decode: AtomicBool,
}

impl CodecCounters {
    pub fn decoder_resets(&self) -> usize {
        self.decoder_resets.load(Ordering::SeqCst)
    }

    pub fn encoder_resets(&self) -> usize {
        self.encoder_resets.load(Ordering::SeqCst)
    }

    pub fn decoded(&self) -> usize {
        self.decoded.load(Ordering::SeqCst)
    }

    pub fn decoders(&self) -> Vec<(u32, u32)> {
        self.decoders.lock().clone()
    }
}

/// Encoder that emits one packet per call carrying the input length.
struct FakeEncoder {
    counters: Arc<CodecCounters>,
}

impl SpeechEncoder for FakeEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<AudioPacket>, CodecError> {
        Ok(vec![(pcm.len() as u16).to_be_bytes().to_vec()])
    }

    fn reset_state(&mut self) {
        self.counters.encoder_resets.fetch_add(1, Ordering::SeqCst);
    }

    fn set_complexity(&mut self, _complexity: i32) -> Result<(), CodecError> {
        Ok(())
    }
}

/// Decoder that yields one frame of `packet[0]` per packet.
struct FakeDecoder {
    sample_rate: u32,
    frame_duration_ms: u32,
    counters: Arc<CodecCounters>,
}

impl SpeechDecoder for FakeDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        if self.counters.fail_decode.load(Ordering::SeqCst) {
            return Err(CodecError::Decode("corrupt packet".into()));
        }
        self.counters.decoded.fetch_add(1, Ordering::SeqCst);
        let value = packet.first().copied().unwrap_or(0) as i16;
        Ok(vec![value; samples_for(self.sample_rate, self.frame_duration_ms)])
    }

    fn reset_state(&mut self) {
        self.counters.decoder_resets.fetch_add(1, Ordering::SeqCst);
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame_duration_ms(&self) -> u32 {
        self.frame_duration_ms
    }
}

#[derive(Default, Clone)]
pub(crate) struct FakeCodecs {
    pub counters: Arc<CodecCounters>,
}

impl CodecFactory for FakeCodecs {
    fn encoder(
        &self,
        _sample_rate: u32,
        _channels: u16,
        _frame_duration_ms: u32,
    ) -> Result<Box<dyn SpeechEncoder>, CodecError> {
        Ok(Box::new(FakeEncoder {
            counters: self.counters.clone(),
        }))
    }

    fn decoder(
        &self,
        sample_rate: u32,
        _channels: u16,
        frame_duration_ms: u32,
    ) -> Result<Box<dyn SpeechDecoder>, CodecError> {
        self.counters.decoders.lock().push((sample_rate, frame_duration_ms));
        Ok(Box::new(FakeDecoder {
            sample_rate,
            frame_duration_ms,
            counters: self.counters.clone(),
        }))
    }
}

pub(crate) const TEST_SESSION: &str = "test-session";

/// Transport double; clones share state so a test can keep a handle after
/// handing the transport to the control loop.
#[derive(Clone)]
pub(crate) struct RecordingTransport {
    texts: Arc<Mutex<Vec<String>>>,
    audio: Arc<Mutex<Vec<AudioPacket>>>,
    connected: Arc<AtomicBool>,
    open_ok: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    status: Arc<ChannelStatus>,
    session: Session,
}

impl RecordingTransport {
    pub fn new(open_ok: bool) -> Self {
        Self {
            texts: Arc::default(),
            audio: Arc::default(),
            connected: Arc::default(),
            open_ok: Arc::new(AtomicBool::new(open_ok)),
            opens: Arc::default(),
            closes: Arc::default(),
            status: Arc::default(),
            session: Session {
                session_id: TEST_SESSION.to_string(),
                ..Session::default()
            },
        }
    }

    pub fn texts(&self) -> Vec<Value> {
        self.texts
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    /// Sent messages of the given `type`.
    pub fn sent(&self, kind: &str) -> Vec<Value> {
        self.texts()
            .into_iter()
            .filter(|value| value["type"] == kind)
            .collect()
    }

    pub fn audio(&self) -> Vec<AudioPacket> {
        self.audio.lock().clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn start(&mut self) -> bool {
        true
    }

    fn open_audio_channel(&mut self) -> bool {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_ok.load(Ordering::SeqCst) {
            return false;
        }
        self.status.reset();
        self.set_connected(true);
        true
    }

    fn close_audio_channel(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
    }

    fn send_audio(&mut self, packet: AudioPacket) {
        self.audio.lock().push(packet);
    }

    fn send_text(&mut self, text: &str) -> bool {
        self.texts.lock().push(text.to_string());
        true
    }

    fn link_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn status(&self) -> &Arc<ChannelStatus> {
        &self.status
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

#[derive(Default)]
pub(crate) struct RecordingDisplay {
    statuses: Mutex<Vec<String>>,
    emotions: Mutex<Vec<String>>,
    chat: Mutex<Vec<(String, String)>>,
    notifications: Mutex<Vec<String>>,
}

impl RecordingDisplay {
    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }

    pub fn emotions(&self) -> Vec<String> {
        self.emotions.lock().clone()
    }

    pub fn chat(&self) -> Vec<(String, String)> {
        self.chat.lock().clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().clone()
    }
}

impl Display for RecordingDisplay {
    fn set_status(&self, status: &str) {
        self.statuses.lock().push(status.to_string());
    }

    fn set_emotion(&self, emotion: &str) {
        self.emotions.lock().push(emotion.to_string());
    }

    fn set_chat_message(&self, role: &str, message: &str) {
        self.chat.lock().push((role.to_string(), message.to_string()));
    }

    fn show_notification(&self, message: &str) {
        self.notifications.lock().push(message.to_string());
    }
}

#[derive(Default)]
pub(crate) struct RecordingBoard {
    power_save: Mutex<Vec<bool>>,
    reboots: AtomicUsize,
}

impl RecordingBoard {
    pub fn power_save(&self) -> Vec<bool> {
        self.power_save.lock().clone()
    }

    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }
}

impl Board for RecordingBoard {
    fn set_power_save_mode(&self, enabled: bool) {
        self.power_save.lock().push(enabled);
    }

    fn reboot(&self) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeThings {
    invoked: Mutex<Vec<Value>>,
}

impl FakeThings {
    pub fn invoked(&self) -> Vec<Value> {
        self.invoked.lock().clone()
    }
}

impl ThingRegistry for FakeThings {
    fn descriptors(&self) -> Vec<Value> {
        vec![json!({"name": "Speaker"}), json!({"name": "Lamp"})]
    }

    fn states(&self, delta: bool) -> Option<Value> {
        Some(json!([{"name": "Lamp", "state": {"power": !delta}}]))
    }

    fn invoke(&self, command: &Value) {
        self.invoked.lock().push(command.clone());
    }
}

#[derive(Default)]
pub(crate) struct FakeWakeWord {
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fed: AtomicUsize,
    encoded: AtomicUsize,
    packets: Mutex<Vec<AudioPacket>>,
}

impl FakeWakeWord {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fed(&self) -> usize {
        self.fed.load(Ordering::SeqCst)
    }

    pub fn encoded(&self) -> usize {
        self.encoded.load(Ordering::SeqCst)
    }

    pub fn queue_packet(&self, packet: AudioPacket) {
        self.packets.lock().push(packet);
    }
}

impl WakeWordDetector for FakeWakeWord {
    fn initialize(&self, _codec: Arc<dyn AudioCodec>, _events: Arc<dyn VoiceEvents>) {}

    fn start_detection(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop_detection(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_detection_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn feed_size(&self) -> usize {
        512
    }

    fn feed(&self, pcm: &[i16]) {
        self.fed.fetch_add(pcm.len(), Ordering::SeqCst);
    }

    fn encode_wake_word_data(&self) {
        self.encoded.fetch_add(1, Ordering::SeqCst);
    }

    fn take_wake_word_packet(&self) -> Option<AudioPacket> {
        let mut packets = self.packets.lock();
        if packets.is_empty() {
            None
        } else {
            Some(packets.remove(0))
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeProcessor {
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fed: AtomicUsize,
}

impl FakeProcessor {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fed(&self) -> usize {
        self.fed.load(Ordering::SeqCst)
    }
}

impl AudioProcessor for FakeProcessor {
    fn initialize(&self, _codec: Arc<dyn AudioCodec>, _realtime: bool, _events: Arc<dyn VoiceEvents>) {}

    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn feed_size(&self) -> usize {
        160
    }

    fn feed(&self, pcm: &[i16]) {
        self.fed.fetch_add(pcm.len(), Ordering::SeqCst);
    }
}

/// Version service driven by per-test scripts.
#[derive(Default)]
pub(crate) struct ScriptedOta {
    failing_checks: AtomicU32,
    check_calls: AtomicU32,
    new_version: Mutex<Option<String>>,
    upgrade_fails: AtomicBool,
    activation_code: Mutex<Option<String>>,
    pending_activations: AtomicU32,
    activate_calls: AtomicU32,
    marked_valid: AtomicBool,
    server_time: AtomicBool,
}

impl ScriptedOta {
    pub fn fail_checks(&self, count: u32) {
        self.failing_checks.store(count, Ordering::SeqCst);
    }

    pub fn offer_version(&self, version: &str) {
        *self.new_version.lock() = Some(version.to_string());
    }

    pub fn fail_upgrade(&self) {
        self.upgrade_fails.store(true, Ordering::SeqCst);
    }

    /// Activation succeeds after `pending` timeouts.
    pub fn require_activation(&self, code: &str, pending: u32) {
        *self.activation_code.lock() = Some(code.to_string());
        self.pending_activations.store(pending, Ordering::SeqCst);
    }

    pub fn report_server_time(&self) {
        self.server_time.store(true, Ordering::SeqCst);
    }

    pub fn check_calls(&self) -> u32 {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn activate_calls(&self) -> u32 {
        self.activate_calls.load(Ordering::SeqCst)
    }

    pub fn marked_valid(&self) -> bool {
        self.marked_valid.load(Ordering::SeqCst)
    }
}

impl Ota for ScriptedOta {
    fn check_version(&self) -> Result<(), OtaError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_checks.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_checks.store(remaining - 1, Ordering::SeqCst);
            return Err(OtaError::Request("connection refused".into()));
        }
        Ok(())
    }

    fn has_new_version(&self) -> bool {
        self.new_version.lock().is_some()
    }

    fn firmware_version(&self) -> String {
        self.new_version.lock().clone().unwrap_or_default()
    }

    fn current_version(&self) -> String {
        "1.0.0".to_string()
    }

    fn start_upgrade(&self, progress: &mut dyn FnMut(u32, usize)) -> Result<(), OtaError> {
        progress(50, 1024);
        if self.upgrade_fails.load(Ordering::SeqCst) {
            return Err(OtaError::Transfer("connection reset".into()));
        }
        progress(100, 2048);
        Ok(())
    }

    fn mark_current_version_valid(&self) {
        self.marked_valid.store(true, Ordering::SeqCst);
    }

    fn has_activation_code(&self) -> bool {
        self.activation_code.lock().is_some() && self.pending_activations.load(Ordering::SeqCst) > 0
    }

    fn has_activation_challenge(&self) -> bool {
        false
    }

    fn activation_code(&self) -> String {
        self.activation_code.lock().clone().unwrap_or_default()
    }

    fn activation_message(&self) -> String {
        format!("Enter code {}", self.activation_code())
    }

    fn activate(&self) -> Result<(), OtaError> {
        self.activate_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending_activations.load(Ordering::SeqCst);
        if pending > 0 {
            self.pending_activations.store(pending - 1, Ordering::SeqCst);
            return Err(OtaError::ActivationTimeout);
        }
        Ok(())
    }

    fn has_server_time(&self) -> bool {
        self.server_time.load(Ordering::SeqCst)
    }
}

/// Update host that records calls and never really sleeps.
pub(crate) struct RecordingHost {
    state: Mutex<DeviceState>,
    states: Mutex<Vec<DeviceState>>,
    statuses: Mutex<Vec<String>>,
    chat: Mutex<Vec<String>>,
    alerts: Mutex<Vec<String>>,
    sounds: Mutex<Vec<Sound>>,
    slept: Mutex<Duration>,
    sleeps: AtomicU32,
    idle_after_sleeps: AtomicU32,
    prepared: AtomicBool,
    reboots: AtomicUsize,
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self {
            state: Mutex::new(DeviceState::Starting),
            states: Mutex::default(),
            statuses: Mutex::default(),
            chat: Mutex::default(),
            alerts: Mutex::default(),
            sounds: Mutex::default(),
            slept: Mutex::new(Duration::ZERO),
            sleeps: AtomicU32::new(0),
            idle_after_sleeps: AtomicU32::new(u32::MAX),
            prepared: AtomicBool::new(false),
            reboots: AtomicUsize::new(0),
        }
    }
}

impl RecordingHost {
    /// Simulates a user forcing the device to Idle after `count` sleeps.
    pub fn force_idle_after_sleeps(&self, count: u32) {
        self.idle_after_sleeps.store(count, Ordering::SeqCst);
    }

    pub fn states(&self) -> Vec<DeviceState> {
        self.states.lock().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }

    pub fn chat(&self) -> Vec<String> {
        self.chat.lock().clone()
    }

    pub fn sounds(&self) -> Vec<Sound> {
        self.sounds.lock().clone()
    }

    pub fn slept(&self) -> Duration {
        *self.slept.lock()
    }

    pub fn prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }
}

impl UpdateHost for RecordingHost {
    fn device_state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
        self.states.lock().push(state);
    }

    fn set_status(&self, status: &str) {
        self.statuses.lock().push(status.to_string());
    }

    fn set_chat_message(&self, _role: &str, message: &str) {
        self.chat.lock().push(message.to_string());
    }

    fn alert(&self, status: &str, _message: &str, _emotion: &str, sound: Option<Sound>) {
        self.alerts.lock().push(status.to_string());
        if let Some(sound) = sound {
            self.sounds.lock().push(sound);
        }
    }

    fn play_sound(&self, sound: Sound) {
        self.sounds.lock().push(sound);
    }

    fn prepare_for_upgrade(&self) {
        self.prepared.store(true, Ordering::SeqCst);
    }

    fn reboot(&self) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
    }

    fn sleep(&self, duration: Duration) {
        *self.slept.lock() += duration;
        let sleeps = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
        if sleeps == self.idle_after_sleeps.load(Ordering::SeqCst) {
            *self.state.lock() = DeviceState::Idle;
        }
    }
}
