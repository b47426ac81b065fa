//! Device control: the state machine, the handle other threads use to reach
//! it, and the bridge that turns transport and voice callbacks into
//! scheduled control work.
//!
//! Everything that touches the transport, the device state or the display
//! runs as a task on the control loop. Other threads hold an [`Orchestrator`]
//! and schedule.

pub mod clock;
pub mod pipeline;
pub mod update;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::watch;

use crate::assets::{Sound, SoundBank};
use crate::audio::AudioPacket;
use crate::audio::opus::CodecFactory;
use crate::collaborators::{
    AudioCodec, AudioProcessor, Board, Display, Ota, ThingRegistry, VoiceEvents, WakeWordDetector,
};
use crate::config::ServerSettings;
use crate::error::StartupError;
use crate::protocol::{AbortReason, DeviceState, InboundMessage, ListeningMode, StatusSnapshot, TtsState};
use crate::scheduler::Scheduler;
use crate::transport::{Transport, TransportEventSink};

use pipeline::{AudioPipeline, PacketSink};
use update::{UpdateHost, UpdateOutcome};

pub mod strings {
    pub const STANDBY: &str = "Standby";
    pub const CONNECTING: &str = "Connecting...";
    pub const LISTENING: &str = "Listening...";
    pub const SPEAKING: &str = "Speaking...";
    pub const CHECKING_NEW_VERSION: &str = "Checking new version...";
    pub const NEW_VERSION: &str = "New version: ";
    pub const UPGRADING: &str = "Upgrading...";
    pub const UPGRADE_FAILED: &str = "Upgrade failed";
    pub const ACTIVATION: &str = "Activation";
    pub const VERSION: &str = "Version ";
    pub const ERROR: &str = "Error";
    pub const OTA_UPGRADE: &str = "OTA Upgrade";
    pub const LOADING_PROTOCOL: &str = "Loading protocol...";
}

/// Delay before re-entering auto listening right after speech, so the
/// speaker tail is not captured.
const AUTO_LISTEN_SETTLE: Duration = Duration::from_millis(120);
const TTS_STOP_SETTLE: Duration = Duration::from_millis(300);

/// Device state mirrored for threads outside the control loop.
#[derive(Debug, Default)]
pub struct StateCell {
    state: AtomicU8,
    clock_ticks: AtomicU32,
}

impl StateCell {
    pub fn get(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: DeviceState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn tick(&self) -> u32 {
        self.clock_ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_ticks(&self) {
        self.clock_ticks.store(0, Ordering::SeqCst);
    }
}

/// The external parts the control loop drives.
pub struct Collaborators {
    pub codec: Arc<dyn AudioCodec>,
    pub codecs: Arc<dyn CodecFactory>,
    pub display: Arc<dyn Display>,
    pub board: Arc<dyn Board>,
    pub things: Arc<dyn ThingRegistry>,
    pub ota: Arc<dyn Ota>,
    pub wake_word: Option<Arc<dyn WakeWordDetector>>,
    pub processor: Option<Arc<dyn AudioProcessor>>,
    pub sounds: SoundBank,
}

/// State owned by the control loop. Only ever touched through scheduled tasks.
pub struct Control {
    state: DeviceState,
    listening_mode: ListeningMode,
    realtime_chat: bool,
    voice_detected: bool,
    transport: Option<Box<dyn Transport>>,
    pipeline: Arc<AudioPipeline>,
    parts: Collaborators,
    cell: Arc<StateCell>,
    bridge: Arc<EventBridge>,
    scheduler: Scheduler<Control>,
    status_tx: Arc<watch::Sender<StatusSnapshot>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Control {
    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn listening_mode(&self) -> ListeningMode {
        self.listening_mode
    }

    pub fn voice_detected(&self) -> bool {
        self.voice_detected
    }

    /// Runs the control loop on its own thread until the scheduler shuts down.
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("control-loop".to_string())
            .spawn(move || {
                let scheduler = self.scheduler.clone();
                scheduler.run(&mut self);
                self.teardown();
            })
    }

    #[cfg(test)]
    pub(crate) fn run_pending(&mut self) -> usize {
        let scheduler = self.scheduler.clone();
        scheduler.run_pending(self)
    }

    fn teardown(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if transport.is_audio_channel_opened() {
                transport.close_audio_channel();
            }
        }
        self.pipeline.stop();
    }

    fn publish_status(&self) {
        let channel_open = self
            .transport
            .as_ref()
            .is_some_and(|transport| transport.is_audio_channel_opened());
        self.status_tx.send_replace(StatusSnapshot {
            state: self.state,
            listening_mode: self.listening_mode,
            channel_open,
        });
    }

    fn default_listening_mode(&self) -> ListeningMode {
        if self.realtime_chat {
            ListeningMode::Realtime
        } else {
            ListeningMode::AutoStop
        }
    }

    /// Moves to `state` and runs its entry actions. Waits for in-flight codec
    /// work first so nothing started under the old state races the new one.
    pub fn request_state(&mut self, state: DeviceState) {
        if state == self.state {
            return;
        }
        self.cell.reset_ticks();
        let previous = self.state;
        self.state = state;
        self.cell.set(state);
        tracing::info!(state = ?state, previous = ?previous, "state changed");
        self.pipeline.wait_for_work();
        self.publish_status();

        let display = self.parts.display.clone();
        match state {
            DeviceState::Unknown | DeviceState::Idle => {
                display.set_status(strings::STANDBY);
                display.set_emotion("neutral");
                if let Some(processor) = &self.parts.processor {
                    processor.stop();
                }
                if let Some(wake_word) = &self.parts.wake_word {
                    wake_word.start_detection();
                }
            }
            DeviceState::Connecting => {
                display.set_status(strings::CONNECTING);
                display.set_emotion("neutral");
                display.set_chat_message("system", "");
            }
            DeviceState::Listening => {
                display.set_status(strings::LISTENING);
                display.set_emotion("neutral");
                self.send_iot_states(true);

                let processor_running = self
                    .parts
                    .processor
                    .as_ref()
                    .is_some_and(|processor| processor.is_running());
                if !processor_running {
                    let mode = self.listening_mode;
                    if let Some(transport) = self.transport.as_mut() {
                        transport.send_start_listening(mode);
                    }
                    if mode == ListeningMode::AutoStop && previous == DeviceState::Speaking {
                        thread::sleep(AUTO_LISTEN_SETTLE);
                    }
                    self.pipeline.reset_encoder();
                    if let Some(wake_word) = &self.parts.wake_word {
                        wake_word.stop_detection();
                    }
                    if let Some(processor) = &self.parts.processor {
                        processor.start();
                    }
                }
            }
            DeviceState::Speaking => {
                display.set_status(strings::SPEAKING);
                if self.listening_mode != ListeningMode::Realtime {
                    if let Some(processor) = &self.parts.processor {
                        processor.stop();
                    }
                    if let Some(wake_word) = &self.parts.wake_word {
                        wake_word.start_detection();
                    }
                }
                self.pipeline.reset_decoder();
            }
            _ => {}
        }
    }

    pub fn set_listening_mode(&mut self, mode: ListeningMode) {
        self.listening_mode = mode;
        self.request_state(DeviceState::Listening);
    }

    pub fn install_transport(&mut self, transport: Box<dyn Transport>) {
        tracing::info!(transport = transport.name(), "transport installed");
        self.pipeline.set_channel(transport.status().clone());
        self.transport = Some(transport);
        self.publish_status();
    }

    /// Codec, voice front end and audio threads. Runs once at startup.
    pub fn start_audio(&mut self) {
        self.request_state(DeviceState::Starting);
        if let Err(err) = self.parts.codec.start() {
            tracing::error!("audio codec failed to start: {}", err);
        }
        let events: Arc<dyn VoiceEvents> = self.bridge.clone();
        if let Some(wake_word) = &self.parts.wake_word {
            wake_word.initialize(self.parts.codec.clone(), events.clone());
        }
        if let Some(processor) = &self.parts.processor {
            processor.initialize(self.parts.codec.clone(), self.realtime_chat, events);
        }
        if let Err(err) = self.pipeline.spawn_threads() {
            tracing::error!("failed to start audio threads: {}", err);
        }
    }

    pub fn send_audio(&mut self, packet: AudioPacket) {
        if let Some(transport) = self.transport.as_mut() {
            transport.send_audio(packet);
        }
    }

    fn send_iot_states(&mut self, delta: bool) {
        let Some(states) = self.parts.things.states(delta) else {
            return;
        };
        if let Some(transport) = self.transport.as_mut() {
            transport.send_iot_states(states);
        }
    }

    fn open_audio_channel(&mut self) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            tracing::error!("protocol not initialized");
            return false;
        };
        if !transport.open_audio_channel() {
            return false;
        }
        self.on_channel_opened();
        true
    }

    fn on_channel_opened(&mut self) {
        self.parts.board.set_power_save_mode(false);
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let server_rate = transport.server_sample_rate();
        let output_rate = self.parts.codec.output_sample_rate();
        if server_rate != output_rate {
            tracing::warn!(
                "server sample rate {} does not match device output sample rate {}, resampling may cause distortion",
                server_rate,
                output_rate
            );
        }
        self.pipeline
            .set_decode_format(server_rate, transport.server_frame_duration());
        transport.send_iot_descriptors(&self.parts.things.descriptors());
        if let Some(states) = self.parts.things.states(false) {
            transport.send_iot_states(states);
        }
        self.publish_status();
    }

    fn on_channel_closed(&mut self) {
        self.parts.board.set_power_save_mode(true);
        self.parts.display.set_chat_message("system", "");
        self.request_state(DeviceState::Idle);
        self.publish_status();
    }

    fn close_audio_channel(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close_audio_channel();
        }
    }

    fn on_network_error(&mut self, message: &str) {
        self.request_state(DeviceState::Idle);
        self.alert(strings::ERROR, message, "sad", Some(Sound::Exclamation));
    }

    fn on_goodbye(&mut self, session_id: Option<String>) {
        let Some(current) = self
            .transport
            .as_ref()
            .map(|transport| transport.session_id().to_string())
        else {
            return;
        };
        match session_id {
            Some(id) if id != current => {
                tracing::debug!(session_id = %id, "goodbye for another session ignored");
            }
            _ => self.close_audio_channel(),
        }
    }

    fn set_voice_detected(&mut self, speaking: bool) {
        self.voice_detected = speaking;
    }

    pub fn toggle_chat_state(&mut self) {
        if self.state == DeviceState::Activating {
            self.request_state(DeviceState::Idle);
            return;
        }
        if self.transport.is_none() {
            tracing::error!("protocol not initialized");
            return;
        }
        match self.state {
            DeviceState::Idle => {
                self.request_state(DeviceState::Connecting);
                if !self.open_audio_channel() {
                    return;
                }
                let mode = self.default_listening_mode();
                self.set_listening_mode(mode);
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::None),
            DeviceState::Listening => self.close_audio_channel(),
            _ => {}
        }
    }

    /// Push-to-talk: listen until explicitly stopped.
    pub fn start_listening(&mut self) {
        if self.state == DeviceState::Activating {
            self.request_state(DeviceState::Idle);
            return;
        }
        if self.transport.is_none() {
            tracing::error!("protocol not initialized");
            return;
        }
        match self.state {
            DeviceState::Idle => {
                let opened = self
                    .transport
                    .as_ref()
                    .is_some_and(|transport| transport.is_audio_channel_opened());
                if !opened {
                    self.request_state(DeviceState::Connecting);
                    if !self.open_audio_channel() {
                        return;
                    }
                }
                self.set_listening_mode(ListeningMode::ManualStop);
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::None);
                self.set_listening_mode(ListeningMode::ManualStop);
            }
            _ => {}
        }
    }

    pub fn stop_listening(&mut self) {
        if !matches!(
            self.state,
            DeviceState::Listening | DeviceState::Speaking | DeviceState::Idle
        ) {
            return;
        }
        if self.state == DeviceState::Listening {
            if let Some(transport) = self.transport.as_mut() {
                transport.send_stop_listening();
            }
            self.request_state(DeviceState::Idle);
        }
    }

    /// Acts as if the wake word had been spoken, with `wake_word` as the transcript.
    pub fn wake_word_invoke(&mut self, wake_word: &str) {
        match self.state {
            DeviceState::Idle => {
                self.toggle_chat_state();
                if let Some(transport) = self.transport.as_mut() {
                    if transport.is_audio_channel_opened() {
                        transport.send_wake_word_detected(wake_word);
                    }
                }
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::None),
            DeviceState::Listening => self.close_audio_channel(),
            _ => {}
        }
    }

    pub fn abort_speaking(&mut self, reason: AbortReason) {
        tracing::info!(reason = ?reason, "abort speaking");
        self.pipeline.set_aborted(true);
        if let Some(transport) = self.transport.as_mut() {
            transport.send_abort_speaking(reason);
        }
    }

    fn handle_wake_word(&mut self, wake_word: String) {
        match self.state {
            DeviceState::Idle => {
                if self.transport.is_none() {
                    tracing::error!("protocol not initialized");
                    return;
                }
                self.request_state(DeviceState::Connecting);
                let detector = self.parts.wake_word.clone();
                if let Some(detector) = &detector {
                    detector.encode_wake_word_data();
                }
                if !self.open_audio_channel() {
                    if let Some(detector) = &detector {
                        detector.start_detection();
                    }
                    return;
                }
                if let Some(transport) = self.transport.as_mut() {
                    if let Some(detector) = &detector {
                        while let Some(packet) = detector.take_wake_word_packet() {
                            transport.send_audio(packet);
                        }
                    }
                    transport.send_wake_word_detected(&wake_word);
                }
                let mode = self.default_listening_mode();
                self.set_listening_mode(mode);
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            DeviceState::Activating => self.request_state(DeviceState::Idle),
            _ => {}
        }
    }

    pub fn handle_inbound(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Tts { state, text } => match state {
                TtsState::Start => {
                    self.pipeline.set_aborted(false);
                    if matches!(self.state, DeviceState::Idle | DeviceState::Listening) {
                        self.request_state(DeviceState::Speaking);
                    }
                }
                TtsState::Stop => {
                    self.pipeline.wait_for_work();
                    if self.state != DeviceState::Speaking {
                        return;
                    }
                    if self.listening_mode == ListeningMode::ManualStop {
                        self.request_state(DeviceState::Idle);
                    } else {
                        self.pipeline.set_aborted(false);
                        self.pipeline.reset_decoder();
                        self.play_sound(Sound::Success);
                        thread::sleep(TTS_STOP_SETTLE);
                        self.request_state(DeviceState::Listening);
                    }
                }
                TtsState::SentenceStart => {
                    if let Some(text) = text {
                        tracing::info!("<< {}", text);
                        self.parts.display.set_chat_message("assistant", &text);
                    }
                }
                TtsState::Other => {}
            },
            InboundMessage::Stt { text: Some(text) } => {
                tracing::info!(">> {}", text);
                self.parts.display.set_chat_message("user", &text);
            }
            InboundMessage::Llm {
                emotion: Some(emotion),
            } => self.parts.display.set_emotion(&emotion),
            InboundMessage::Iot {
                commands: Some(commands),
            } => {
                tracing::info!(count = commands.len(), "received iot commands");
                for command in &commands {
                    self.parts.things.invoke(command);
                }
            }
            InboundMessage::System {
                command: Some(command),
            } => {
                tracing::info!("system command: {}", command);
                if command == "reboot" {
                    self.reboot();
                } else {
                    tracing::warn!("unknown system command: {}", command);
                }
            }
            InboundMessage::Alert {
                status: Some(status),
                message: Some(message),
                emotion: Some(emotion),
            } => self.alert(&status, &message, &emotion, Some(Sound::Vibration)),
            InboundMessage::Alert { .. } => {
                tracing::warn!("alert command requires status, message and emotion");
            }
            other => tracing::debug!("ignored control message: {:?}", other),
        }
    }

    pub fn alert(&mut self, status: &str, message: &str, emotion: &str, sound: Option<Sound>) {
        tracing::warn!("alert {}: {} [{}]", status, message, emotion);
        let display = &self.parts.display;
        display.set_status(status);
        display.set_emotion(emotion);
        display.set_chat_message("system", message);
        if let Some(sound) = sound {
            self.pipeline.reset_decoder();
            self.play_sound(sound);
        }
    }

    pub fn dismiss_alert(&mut self) {
        if self.state == DeviceState::Idle {
            let display = &self.parts.display;
            display.set_status(strings::STANDBY);
            display.set_emotion("neutral");
            display.set_chat_message("system", "");
        }
    }

    pub fn play_sound(&mut self, sound: Sound) {
        let Some(data) = self.parts.sounds.get(sound) else {
            tracing::debug!("sound cue {:?} not loaded", sound);
            return;
        };
        if let Err(err) = self.pipeline.enqueue_sound(data) {
            tracing::warn!("sound cue {:?} is corrupt: {}", sound, err);
        }
    }

    pub fn reboot(&mut self) {
        tracing::info!("rebooting");
        self.parts.board.reboot();
        self.shutdown_tx.send_replace(true);
        self.scheduler.shutdown();
    }

    /// Quiesces audio ahead of a firmware transfer.
    pub fn prepare_for_upgrade(&mut self) {
        self.parts.board.set_power_save_mode(false);
        if let Some(wake_word) = &self.parts.wake_word {
            wake_word.stop_detection();
        }
        self.parts.codec.enable_input(false);
        self.parts.codec.enable_output(false);
        self.pipeline.clear_queue();
        if let Err(err) = self.pipeline.restart_work_queue() {
            tracing::error!("failed to restart work queue: {}", err);
        }
    }

    fn finish_startup(&mut self, transport_started: bool) {
        self.request_state(DeviceState::Idle);
        if transport_started {
            let message = format!("{}{}", strings::VERSION, self.parts.ota.current_version());
            self.parts.display.show_notification(&message);
            self.parts.display.set_chat_message("system", "");
            self.pipeline.reset_decoder();
            self.play_sound(Sound::Success);
        }
    }

    pub fn can_enter_sleep_mode(&self) -> bool {
        if self.state != DeviceState::Idle {
            return false;
        }
        !self
            .transport
            .as_ref()
            .is_some_and(|transport| transport.is_audio_channel_opened())
    }
}

/// Turns transport and voice callbacks into control-loop tasks. Audio paths
/// go straight to the pipeline.
pub struct EventBridge {
    scheduler: Scheduler<Control>,
    pipeline: Arc<AudioPipeline>,
    cell: Arc<StateCell>,
}

impl TransportEventSink for EventBridge {
    fn on_json(&self, message: InboundMessage) {
        self.scheduler
            .schedule(move |control| control.handle_inbound(message));
    }

    fn on_audio(&self, packet: AudioPacket) {
        self.pipeline.push_network_audio(packet);
    }

    fn on_channel_closed(&self) {
        self.scheduler.schedule(|control| control.on_channel_closed());
    }

    fn on_network_error(&self, message: String) {
        self.scheduler
            .schedule(move |control| control.on_network_error(&message));
    }

    fn on_goodbye(&self, session_id: Option<String>) {
        self.scheduler
            .schedule(move |control| control.on_goodbye(session_id));
    }
}

impl VoiceEvents for EventBridge {
    fn on_wake_word_detected(&self, wake_word: String) {
        self.scheduler
            .schedule(move |control| control.handle_wake_word(wake_word));
    }

    fn on_processed_audio(&self, pcm: Vec<i16>) {
        self.pipeline.submit_encode(pcm);
    }

    fn on_vad_change(&self, speaking: bool) {
        if self.cell.get() == DeviceState::Listening {
            self.scheduler
                .schedule(move |control| control.set_voice_detected(speaking));
        }
    }
}

/// Cloneable handle to the control loop.
#[derive(Clone)]
pub struct Orchestrator {
    scheduler: Scheduler<Control>,
    cell: Arc<StateCell>,
    bridge: Arc<EventBridge>,
    ota: Arc<dyn Ota>,
    status_rx: watch::Receiver<StatusSnapshot>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    pub fn new(parts: Collaborators, realtime_chat: bool) -> Result<(Self, Control), StartupError> {
        let scheduler: Scheduler<Control> = Scheduler::new();
        let cell = Arc::new(StateCell::default());

        let sink_scheduler = scheduler.clone();
        let packet_sink: PacketSink = Arc::new(move |packet: AudioPacket| {
            sink_scheduler.schedule(move |control: &mut Control| control.send_audio(packet));
        });
        let pipeline = AudioPipeline::new(
            parts.codec.clone(),
            parts.codecs.clone(),
            parts.wake_word.clone(),
            parts.processor.clone(),
            cell.clone(),
            realtime_chat,
            packet_sink,
        )?;
        let bridge = Arc::new(EventBridge {
            scheduler: scheduler.clone(),
            pipeline: pipeline.clone(),
            cell: cell.clone(),
        });
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let status_tx = Arc::new(status_tx);
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let handle = Self {
            scheduler: scheduler.clone(),
            cell: cell.clone(),
            bridge: bridge.clone(),
            ota: parts.ota.clone(),
            status_rx,
            shutdown_tx: shutdown_tx.clone(),
        };
        let control = Control {
            state: DeviceState::Unknown,
            listening_mode: ListeningMode::AutoStop,
            realtime_chat,
            voice_detected: false,
            transport: None,
            pipeline,
            parts,
            cell,
            bridge,
            scheduler,
            status_tx,
            shutdown_tx,
        };
        Ok((handle, control))
    }

    pub fn device_state(&self) -> DeviceState {
        self.cell.get()
    }

    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_rx.clone()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn event_sink(&self) -> Arc<dyn TransportEventSink> {
        self.bridge.clone()
    }

    pub fn voice_events(&self) -> Arc<dyn VoiceEvents> {
        self.bridge.clone()
    }

    /// Stops the control loop; it tears down audio and the channel on its way out.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.scheduler.shutdown();
    }

    pub fn toggle_chat_state(&self) {
        self.scheduler.schedule(|control| control.toggle_chat_state());
    }

    pub fn start_listening(&self) {
        self.scheduler.schedule(|control| control.start_listening());
    }

    pub fn stop_listening(&self) {
        self.scheduler.schedule(|control| control.stop_listening());
    }

    pub fn wake_word_invoke(&self, wake_word: String) {
        self.scheduler
            .schedule(move |control| control.wake_word_invoke(&wake_word));
    }

    pub fn abort_speaking(&self, reason: AbortReason) {
        self.scheduler
            .schedule(move |control| control.abort_speaking(reason));
    }

    pub fn dismiss_alert(&self) {
        self.scheduler.schedule(|control| control.dismiss_alert());
    }

    /// Blocks for the control loop's answer; false if it is gone.
    pub fn can_enter_sleep_mode(&self) -> bool {
        self.scheduler
            .call(|control| control.can_enter_sleep_mode())
            .unwrap_or(false)
    }

    /// Startup sequence, run on a dedicated thread: audio, version check and
    /// activation, then the transport built by `connect`.
    pub fn start<F>(&self, connect: F)
    where
        F: FnOnce(&ServerSettings, Arc<dyn TransportEventSink>) -> Option<Box<dyn Transport>>,
    {
        self.scheduler.call(|control| control.start_audio());
        if let Err(err) = clock::spawn(self.clone()) {
            tracing::error!("failed to start clock: {}", err);
        }

        match update::check_new_version(self.ota.as_ref(), self) {
            UpdateOutcome::Rebooting => return,
            UpdateOutcome::GaveUp => {
                tracing::warn!("version check gave up; continuing with the installed firmware");
            }
            UpdateOutcome::Ready => {}
        }

        self.set_status(strings::LOADING_PROTOCOL);
        let settings = self.ota.server_settings();
        let started = match connect(&settings, self.event_sink()) {
            Some(mut transport) => {
                let started = transport.start();
                if !started {
                    tracing::warn!(transport = transport.name(), "transport did not start");
                }
                self.scheduler
                    .call(move |control| control.install_transport(transport));
                started
            }
            None => {
                tracing::error!("no transport available");
                false
            }
        };
        self.scheduler
            .schedule(move |control| control.finish_startup(started));
    }
}

impl UpdateHost for Orchestrator {
    fn device_state(&self) -> DeviceState {
        self.cell.get()
    }

    fn set_state(&self, state: DeviceState) {
        self.scheduler.call(move |control| control.request_state(state));
    }

    fn set_status(&self, status: &str) {
        let status = status.to_string();
        self.scheduler
            .call(move |control| control.parts.display.set_status(&status));
    }

    fn set_chat_message(&self, role: &str, message: &str) {
        let role = role.to_string();
        let message = message.to_string();
        self.scheduler
            .call(move |control| control.parts.display.set_chat_message(&role, &message));
    }

    fn alert(&self, status: &str, message: &str, emotion: &str, sound: Option<Sound>) {
        let status = status.to_string();
        let message = message.to_string();
        let emotion = emotion.to_string();
        self.scheduler
            .call(move |control| control.alert(&status, &message, &emotion, sound));
    }

    fn play_sound(&self, sound: Sound) {
        self.scheduler.call(move |control| control.play_sound(sound));
    }

    fn prepare_for_upgrade(&self) {
        self.scheduler.call(|control| control.prepare_for_upgrade());
    }

    fn reboot(&self) {
        self.scheduler.call(|control| control.reboot());
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        CodecCounters, FakeCodec, FakeCodecs, FakeProcessor, FakeThings, FakeWakeWord,
        RecordingBoard, RecordingDisplay, RecordingTransport, ScriptedOta, TEST_SESSION,
    };
    use serde_json::json;

    struct Rig {
        orchestrator: Orchestrator,
        control: Control,
        transport: RecordingTransport,
        display: Arc<RecordingDisplay>,
        board: Arc<RecordingBoard>,
        things: Arc<FakeThings>,
        wake: Arc<FakeWakeWord>,
        processor: Arc<FakeProcessor>,
        codec: Arc<FakeCodec>,
        counters: Arc<CodecCounters>,
    }

    fn rig_with(open_ok: bool, with_processor: bool) -> Rig {
        let display = Arc::new(RecordingDisplay::default());
        let board = Arc::new(RecordingBoard::default());
        let things = Arc::new(FakeThings::default());
        let wake = Arc::new(FakeWakeWord::default());
        let processor = Arc::new(FakeProcessor::default());
        let codec = Arc::new(FakeCodec::new(16_000, 16_000));
        let codecs = FakeCodecs::default();
        let counters = codecs.counters.clone();

        let parts = Collaborators {
            codec: codec.clone(),
            codecs: Arc::new(codecs),
            display: display.clone(),
            board: board.clone(),
            things: things.clone(),
            ota: Arc::new(ScriptedOta::default()),
            wake_word: Some(wake.clone() as Arc<dyn WakeWordDetector>),
            processor: if with_processor {
                Some(processor.clone() as Arc<dyn AudioProcessor>)
            } else {
                None
            },
            sounds: SoundBank::default(),
        };
        let (orchestrator, mut control) = Orchestrator::new(parts, false).unwrap();
        let transport = RecordingTransport::new(open_ok);
        control.install_transport(Box::new(transport.clone()));
        Rig {
            orchestrator,
            control,
            transport,
            display,
            board,
            things,
            wake,
            processor,
            codec,
            counters,
        }
    }

    fn rig() -> Rig {
        rig_with(true, false)
    }

    /// Idle with an open channel, listening in auto mode.
    fn listening_rig() -> Rig {
        let mut rig = rig();
        rig.control.request_state(DeviceState::Idle);
        rig.control.toggle_chat_state();
        assert_eq!(rig.control.state(), DeviceState::Listening);
        rig
    }

    #[test]
    fn same_state_twice_runs_entry_actions_once() {
        let mut rig = rig();
        rig.control.request_state(DeviceState::Idle);
        rig.control.request_state(DeviceState::Idle);

        assert_eq!(rig.wake.starts(), 1);
        assert_eq!(rig.display.statuses(), vec![strings::STANDBY.to_string()]);
        assert_eq!(rig.orchestrator.device_state(), DeviceState::Idle);
        assert_eq!(rig.orchestrator.status().borrow().state, DeviceState::Idle);
    }

    #[test]
    fn toggle_from_idle_opens_channel_and_listens() {
        let rig = listening_rig();

        assert_eq!(rig.transport.opens(), 1);
        assert_eq!(rig.board.power_save(), vec![false]);
        // two descriptors, full states on open, delta states on listening
        assert_eq!(rig.transport.sent("iot").len(), 4);

        let listens = rig.transport.sent("listen");
        assert_eq!(listens.len(), 1);
        assert_eq!(listens[0]["state"], "start");
        assert_eq!(listens[0]["mode"], "auto");
        assert_eq!(listens[0]["session_id"], TEST_SESSION);

        assert_eq!(rig.wake.stops(), 1);
        assert_eq!(rig.counters.encoder_resets(), 1);
        assert!(rig.orchestrator.status().borrow().channel_open);
    }

    #[test]
    fn failed_open_stays_connecting() {
        let mut rig = rig_with(false, false);
        rig.control.request_state(DeviceState::Idle);
        rig.control.toggle_chat_state();

        assert_eq!(rig.control.state(), DeviceState::Connecting);
        assert!(rig.transport.sent("listen").is_empty());
    }

    #[test]
    fn listening_after_speaking_in_auto_mode() {
        let mut rig = listening_rig();
        rig.control.request_state(DeviceState::Speaking);
        let resets = rig.counters.decoder_resets();

        rig.control.set_listening_mode(ListeningMode::AutoStop);
        assert_eq!(rig.control.state(), DeviceState::Listening);
        let listens = rig.transport.sent("listen");
        assert_eq!(listens.len(), 2);
        assert_eq!(listens[1]["mode"], "auto");

        // reply audio arriving while listening is queued, then discarded by playback
        assert!(rig.control.pipeline.push_network_audio(vec![1]));
        assert_eq!(
            rig.control.pipeline.playback_step(std::time::Instant::now()),
            pipeline::PlaybackStep::Discarded(1)
        );
        rig.control.request_state(DeviceState::Speaking);
        assert_eq!(rig.counters.decoder_resets(), resets + 1);
        assert!(rig.control.pipeline.push_network_audio(vec![1]));
    }

    #[test]
    fn processor_owns_listening_when_present() {
        let mut rig = rig_with(true, true);
        rig.control.request_state(DeviceState::Idle);
        rig.control.toggle_chat_state();
        assert_eq!(rig.processor.starts(), 1);
        assert_eq!(rig.transport.sent("listen").len(), 1);

        rig.control.request_state(DeviceState::Speaking);
        assert_eq!(rig.processor.stops(), 2);
        assert_eq!(rig.wake.starts(), 2);
    }

    #[test]
    fn network_error_forces_idle_with_alert() {
        let mut rig = listening_rig();
        rig.orchestrator
            .event_sink()
            .on_network_error("server error".into());
        rig.control.run_pending();

        assert_eq!(rig.control.state(), DeviceState::Idle);
        assert_eq!(rig.display.statuses().last().unwrap(), strings::ERROR);
        assert_eq!(rig.display.emotions().last().unwrap(), "sad");
        assert_eq!(
            rig.display.chat().last().unwrap(),
            &("system".to_string(), "server error".to_string())
        );
    }

    #[test]
    fn goodbye_closes_only_the_current_session() {
        let mut rig = listening_rig();
        let sink = rig.orchestrator.event_sink();

        sink.on_goodbye(Some("another".into()));
        rig.control.run_pending();
        assert_eq!(rig.transport.closes(), 0);

        sink.on_goodbye(Some(TEST_SESSION.into()));
        rig.control.run_pending();
        assert_eq!(rig.transport.closes(), 1);

        sink.on_goodbye(None);
        rig.control.run_pending();
        assert_eq!(rig.transport.closes(), 2);
    }

    #[test]
    fn channel_closed_returns_to_idle() {
        let mut rig = listening_rig();
        rig.orchestrator.event_sink().on_channel_closed();
        rig.control.run_pending();

        assert_eq!(rig.control.state(), DeviceState::Idle);
        assert_eq!(rig.board.power_save().last(), Some(&true));
        assert_eq!(
            rig.display.chat().last().unwrap(),
            &("system".to_string(), String::new())
        );
    }

    #[test]
    fn tts_stop_follows_listening_mode() {
        let mut rig = listening_rig();
        let start = || InboundMessage::Tts {
            state: TtsState::Start,
            text: None,
        };
        let stop = || InboundMessage::Tts {
            state: TtsState::Stop,
            text: None,
        };

        rig.control.handle_inbound(start());
        assert_eq!(rig.control.state(), DeviceState::Speaking);
        rig.control.handle_inbound(stop());
        assert_eq!(rig.control.state(), DeviceState::Listening);

        rig.control.set_listening_mode(ListeningMode::ManualStop);
        rig.control.handle_inbound(start());
        rig.control.handle_inbound(stop());
        assert_eq!(rig.control.state(), DeviceState::Idle);
    }

    #[test]
    fn tts_start_clears_abort() {
        let mut rig = listening_rig();
        rig.control.abort_speaking(AbortReason::None);
        assert!(rig.control.pipeline.is_aborted());
        rig.control.handle_inbound(InboundMessage::Tts {
            state: TtsState::Start,
            text: None,
        });
        assert!(!rig.control.pipeline.is_aborted());
    }

    #[test]
    fn inbound_text_reaches_display_and_things() {
        let mut rig = listening_rig();
        rig.control.handle_inbound(InboundMessage::Tts {
            state: TtsState::SentenceStart,
            text: Some("hello there".into()),
        });
        rig.control.handle_inbound(InboundMessage::Stt {
            text: Some("hi".into()),
        });
        rig.control.handle_inbound(InboundMessage::Llm {
            emotion: Some("happy".into()),
        });
        rig.control.handle_inbound(InboundMessage::Iot {
            commands: Some(vec![json!({"name": "Lamp"}), json!({"name": "Speaker"})]),
        });

        let chat = rig.display.chat();
        assert!(chat.contains(&("assistant".to_string(), "hello there".to_string())));
        assert!(chat.contains(&("user".to_string(), "hi".to_string())));
        assert_eq!(rig.display.emotions().last().unwrap(), "happy");
        assert_eq!(rig.things.invoked().len(), 2);
    }

    #[test]
    fn alert_needs_every_field() {
        let mut rig = rig();
        rig.control.handle_inbound(InboundMessage::Alert {
            status: Some("Warning".into()),
            message: Some("battery low".into()),
            emotion: None,
        });
        assert!(rig.display.statuses().is_empty());

        rig.control.handle_inbound(InboundMessage::Alert {
            status: Some("Warning".into()),
            message: Some("battery low".into()),
            emotion: Some("sad".into()),
        });
        assert_eq!(rig.display.statuses(), vec!["Warning".to_string()]);
        assert!(rig.codec.output_enabled());
    }

    #[test]
    fn system_reboot_stops_the_loop() {
        let mut rig = rig();
        let shutdown = rig.orchestrator.shutdown_signal();
        rig.control.handle_inbound(InboundMessage::System {
            command: Some("reboot".into()),
        });
        rig.control.handle_inbound(InboundMessage::System {
            command: Some("selfdestruct".into()),
        });

        assert_eq!(rig.board.reboots(), 1);
        assert!(*shutdown.borrow());
        assert!(rig.orchestrator.scheduler.is_shut_down());
    }

    #[test]
    fn wake_word_while_idle_replays_buffered_audio() {
        let mut rig = rig();
        rig.control.request_state(DeviceState::Idle);
        rig.wake.queue_packet(vec![9, 9]);

        rig.orchestrator
            .voice_events()
            .on_wake_word_detected("hey there".into());
        rig.control.run_pending();

        assert_eq!(rig.control.state(), DeviceState::Listening);
        assert_eq!(rig.wake.encoded(), 1);
        assert_eq!(rig.transport.audio(), vec![vec![9u8, 9]]);
        let listens = rig.transport.sent("listen");
        assert_eq!(listens[0]["state"], "detect");
        assert_eq!(listens[0]["text"], "hey there");
        assert_eq!(listens[1]["state"], "start");
    }

    #[test]
    fn wake_word_failure_restarts_detection() {
        let mut rig = rig_with(false, false);
        rig.control.request_state(DeviceState::Idle);
        let starts = rig.wake.starts();
        rig.control.handle_wake_word("hey".into());

        assert_eq!(rig.control.state(), DeviceState::Connecting);
        assert_eq!(rig.wake.starts(), starts + 1);
    }

    #[test]
    fn wake_word_while_speaking_aborts() {
        let mut rig = listening_rig();
        rig.control.request_state(DeviceState::Speaking);
        rig.control.handle_wake_word("hey".into());

        let aborts = rig.transport.sent("abort");
        assert_eq!(aborts.len(), 1);
        assert_eq!(aborts[0]["reason"], "wake_word_detected");
        assert!(rig.control.pipeline.is_aborted());
    }

    #[test]
    fn wake_word_while_activating_goes_idle() {
        let mut rig = rig();
        rig.control.request_state(DeviceState::Activating);
        rig.control.handle_wake_word("hey".into());
        assert_eq!(rig.control.state(), DeviceState::Idle);
    }

    #[test]
    fn stop_listening_sends_stop_and_goes_idle() {
        let mut rig = listening_rig();
        rig.control.stop_listening();

        let listens = rig.transport.sent("listen");
        assert_eq!(listens.last().unwrap()["state"], "stop");
        assert_eq!(rig.control.state(), DeviceState::Idle);
    }

    #[test]
    fn start_listening_uses_manual_mode() {
        let mut rig = rig();
        rig.control.request_state(DeviceState::Idle);
        rig.control.start_listening();

        assert_eq!(rig.control.listening_mode(), ListeningMode::ManualStop);
        assert_eq!(rig.transport.sent("listen")[0]["mode"], "manual");
    }

    #[test]
    fn toggle_while_listening_closes_channel() {
        let mut rig = listening_rig();
        rig.control.toggle_chat_state();
        assert_eq!(rig.transport.closes(), 1);
    }

    #[test]
    fn sleep_requires_idle_and_closed_channel() {
        let mut rig = rig();
        rig.control.request_state(DeviceState::Idle);
        assert!(rig.control.can_enter_sleep_mode());

        rig.control.toggle_chat_state();
        assert!(!rig.control.can_enter_sleep_mode());

        rig.control.request_state(DeviceState::Idle);
        assert!(!rig.control.can_enter_sleep_mode());
        rig.transport.set_connected(false);
        assert!(rig.control.can_enter_sleep_mode());
    }

    #[test]
    fn vad_changes_only_count_while_listening() {
        let mut rig = rig();
        let events = rig.orchestrator.voice_events();
        events.on_vad_change(true);
        assert_eq!(rig.control.run_pending(), 0);

        rig.control.request_state(DeviceState::Idle);
        rig.control.toggle_chat_state();
        events.on_vad_change(true);
        rig.control.run_pending();
        assert!(rig.control.voice_detected());
    }

    #[test]
    fn handle_methods_schedule_onto_the_loop() {
        let mut rig = rig();
        rig.control.request_state(DeviceState::Idle);
        rig.orchestrator.toggle_chat_state();
        assert_eq!(rig.control.state(), DeviceState::Idle);
        rig.control.run_pending();
        assert_eq!(rig.control.state(), DeviceState::Listening);

        rig.orchestrator.wake_word_invoke("hello".into());
        rig.control.run_pending();
        assert_eq!(rig.transport.closes(), 1);
    }

    #[test]
    fn encoded_capture_is_sent_from_the_loop() {
        let mut rig = listening_rig();
        rig.control.pipeline.submit_encode(vec![0; 480]);
        rig.control.pipeline.wait_for_work();
        assert!(rig.transport.audio().is_empty());

        rig.control.run_pending();
        assert_eq!(rig.transport.audio(), vec![480u16.to_be_bytes().to_vec()]);
    }

    #[test]
    fn startup_finish_announces_version() {
        let mut rig = rig();
        rig.control.finish_startup(true);

        assert_eq!(rig.control.state(), DeviceState::Idle);
        assert_eq!(rig.display.notifications(), vec!["Version 1.0.0".to_string()]);
        assert!(rig.codec.output_enabled());
    }

    #[test]
    fn upgrade_preparation_quiesces_audio() {
        let mut rig = rig();
        rig.control.request_state(DeviceState::Idle);
        rig.control.prepare_for_upgrade();

        assert!(!rig.codec.input_enabled());
        assert!(!rig.codec.output_enabled());
        assert_eq!(rig.wake.stops(), 1);
        assert_eq!(rig.board.power_save(), vec![false]);
        rig.control.pipeline.submit_encode(vec![0; 10]);
        rig.control.pipeline.wait_for_work();
    }

    #[test]
    fn update_host_calls_run_on_the_control_loop() {
        let rig = rig();
        let orchestrator = rig.orchestrator.clone();
        let display = rig.display.clone();
        let looper = rig.control.spawn().unwrap();

        orchestrator.set_state(DeviceState::Activating);
        assert_eq!(UpdateHost::device_state(&orchestrator), DeviceState::Activating);
        orchestrator.set_status("checking");
        assert_eq!(display.statuses().last().unwrap(), "checking");
        assert!(!orchestrator.can_enter_sleep_mode());

        orchestrator.shutdown();
        looper.join().unwrap();
        assert!(!orchestrator.can_enter_sleep_mode());
    }
}
