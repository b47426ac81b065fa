//! Session transports. Both implementations speak the same JSON control
//! protocol; they differ in how audio travels (UDP datagrams under AES-CTR
//! versus binary websocket frames).

pub mod crypto;
pub mod mqtt;
pub mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::audio::AudioPacket;
use crate::config::{DeviceConfig, TransportKind};
use crate::error::TransportError;
use crate::protocol::{
    AbortReason, InboundMessage, ListeningMode, OutboundMessage, ServerHello, custom_message,
    parse_inbound,
};

pub use mqtt::MqttTransport;
pub use websocket::WebsocketTransport;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) const DEFAULT_SERVER_SAMPLE_RATE: u32 = 24_000;
pub(crate) const DEFAULT_SERVER_FRAME_DURATION_MS: u32 = 60;

/// Events a transport raises from its own network tasks. Implementations must
/// not touch control state directly; they hand work to the control loop.
pub trait TransportEventSink: Send + Sync {
    fn on_json(&self, message: InboundMessage);
    fn on_audio(&self, packet: AudioPacket);
    fn on_channel_closed(&self);
    fn on_network_error(&self, message: String);
    /// Peer said goodbye; `session_id` is `None` for an unscoped goodbye.
    fn on_goodbye(&self, session_id: Option<String>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub server_sample_rate: u32,
    pub server_frame_duration_ms: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            server_sample_rate: DEFAULT_SERVER_SAMPLE_RATE,
            server_frame_duration_ms: DEFAULT_SERVER_FRAME_DURATION_MS,
        }
    }
}

impl Session {
    /// Adopts the negotiated parameters from the peer's hello.
    pub fn apply_hello(&mut self, hello: &ServerHello, transport: &str) -> Result<(), TransportError> {
        match hello.transport.as_deref() {
            Some(value) if value == transport => {}
            other => {
                return Err(TransportError::Protocol(format!(
                    "unsupported transport: {}",
                    other.unwrap_or("none")
                )));
            }
        }
        if let Some(session_id) = &hello.session_id {
            self.session_id = session_id.clone();
            tracing::info!(session_id = %self.session_id, "session established");
        }
        if let Some(params) = &hello.audio_params {
            if let Some(rate) = params.sample_rate {
                self.server_sample_rate = rate;
            }
            if let Some(frame) = params.frame_duration {
                self.server_frame_duration_ms = frame;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        *self = Session::default();
    }
}

/// Liveness flags shared between a transport and its network tasks.
#[derive(Debug)]
pub struct ChannelStatus {
    /// Audio frames handed to the network task and not yet on the wire.
    sending: AtomicUsize,
    error: AtomicBool,
    last_incoming: Mutex<Instant>,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            sending: AtomicUsize::new(0),
            error: AtomicBool::new(false),
            last_incoming: Mutex::new(Instant::now()),
        }
    }
}

impl ChannelStatus {
    pub fn mark_incoming(&self) {
        self.mark_incoming_at(Instant::now());
    }

    pub fn mark_incoming_at(&self, now: Instant) {
        *self.last_incoming.lock() = now;
    }

    pub fn is_timeout_at(&self, now: Instant) -> bool {
        let silent = now.saturating_duration_since(*self.last_incoming.lock());
        let timeout = silent > CHANNEL_TIMEOUT;
        if timeout {
            tracing::error!("channel timeout {} seconds", silent.as_secs());
        }
        timeout
    }

    pub fn is_open_at(&self, connected: bool, now: Instant) -> bool {
        connected && !self.has_error() && !self.is_timeout_at(now)
    }

    pub fn begin_send(&self) {
        self.sending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_send(&self) {
        let _ = self
            .sending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// True while an audio frame is still waiting for the socket.
    pub fn is_busy(&self) -> bool {
        self.sending.load(Ordering::SeqCst) > 0
    }

    pub fn set_error(&self, error: bool) {
        self.error.store(error, Ordering::SeqCst);
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Fresh state for a new channel.
    pub fn reset(&self) {
        self.sending.store(0, Ordering::SeqCst);
        self.set_error(false);
        self.mark_incoming();
    }
}

/// Flags the channel as failed and tells the sink.
pub(crate) fn report_error(status: &ChannelStatus, sink: &dyn TransportEventSink, message: &str) {
    tracing::error!("transport error: {}", message);
    status.set_error(true);
    sink.on_network_error(message.to_string());
}

/// Routes one inbound control message: hellos complete a pending handshake,
/// goodbyes go to the sink's close path, everything else is forwarded.
pub(crate) fn dispatch_text(
    text: &str,
    sink: &dyn TransportEventSink,
    hello: &crossbeam_channel::Sender<ServerHello>,
) {
    match parse_inbound(text) {
        Ok(InboundMessage::Hello(server_hello)) => {
            if hello.try_send(server_hello).is_err() {
                tracing::debug!("unsolicited server hello ignored");
            }
        }
        Ok(InboundMessage::Goodbye { session_id }) => {
            tracing::info!(
                session_id = session_id.as_deref().unwrap_or("null"),
                "received goodbye"
            );
            sink.on_goodbye(session_id);
        }
        Ok(message) => sink.on_json(message),
        Err(err) => tracing::warn!("invalid control message '{}': {}", text, err),
    }
}

pub trait Transport: Send {
    fn name(&self) -> &'static str;
    /// Brings up the control link, where the transport has one.
    fn start(&mut self) -> bool;
    /// Handshakes a new session; blocks up to `HANDSHAKE_TIMEOUT`.
    fn open_audio_channel(&mut self) -> bool;
    fn close_audio_channel(&mut self);
    fn send_audio(&mut self, packet: AudioPacket);
    fn send_text(&mut self, text: &str) -> bool;
    /// Whether the underlying link for audio is currently up.
    fn link_connected(&self) -> bool;
    fn status(&self) -> &Arc<ChannelStatus>;
    fn session(&self) -> &Session;

    fn session_id(&self) -> &str {
        &self.session().session_id
    }

    fn server_sample_rate(&self) -> u32 {
        self.session().server_sample_rate
    }

    fn server_frame_duration(&self) -> u32 {
        self.session().server_frame_duration_ms
    }

    /// A silent channel counts as closed without being torn down.
    fn is_audio_channel_opened(&self) -> bool {
        self.status().is_open_at(self.link_connected(), Instant::now())
    }

    fn is_audio_channel_busy(&self) -> bool {
        self.status().is_busy()
    }

    fn is_timeout(&self) -> bool {
        self.status().is_timeout_at(Instant::now())
    }

    fn send_start_listening(&mut self, mode: ListeningMode) {
        let text = OutboundMessage::start_listening(self.session_id(), mode).to_json();
        self.send_text(&text);
    }

    fn send_stop_listening(&mut self) {
        let text = OutboundMessage::stop_listening(self.session_id()).to_json();
        self.send_text(&text);
    }

    fn send_abort_speaking(&mut self, reason: AbortReason) {
        let text = OutboundMessage::abort(self.session_id(), reason).to_json();
        self.send_text(&text);
    }

    fn send_wake_word_detected(&mut self, wake_word: &str) {
        let text = OutboundMessage::wake_word_detected(self.session_id(), wake_word).to_json();
        self.send_text(&text);
    }

    /// One message per descriptor to keep each publish small.
    fn send_iot_descriptors(&mut self, descriptors: &[Value]) {
        for descriptor in descriptors {
            let text = OutboundMessage::iot_descriptor(self.session_id(), descriptor.clone()).to_json();
            self.send_text(&text);
        }
    }

    fn send_iot_states(&mut self, states: Value) {
        let text = OutboundMessage::iot_states(self.session_id(), states).to_json();
        self.send_text(&text);
    }

    fn send_custom_text(&mut self, text: &str) -> bool {
        self.send_text(text)
    }

    fn send_custom_message(&mut self, kind: &str, data: Value) -> bool {
        let text = custom_message(self.session_id(), kind, data);
        self.send_text(&text)
    }
}

/// Builds the transport the local configuration selects. Endpoints may
/// already carry overrides from the version service.
pub fn build_transport(
    config: &DeviceConfig,
    runtime: tokio::runtime::Handle,
    sink: Arc<dyn TransportEventSink>,
) -> Box<dyn Transport> {
    match config.transport {
        TransportKind::Websocket => Box::new(WebsocketTransport::new(
            config.websocket.clone(),
            config.device_id.clone(),
            config.client_id.clone(),
            runtime,
            sink,
        )),
        TransportKind::Mqtt => Box::new(MqttTransport::new(
            config.mqtt.clone(),
            config.client_id.clone(),
            runtime,
            sink,
        )),
    }
}
