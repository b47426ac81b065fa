use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Sample rate every capture path is normalised to before encoding.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
pub const FRAME_DURATION_MS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceState {
    Unknown = 0,
    Starting,
    WifiConfiguring,
    Idle,
    Connecting,
    Listening,
    Speaking,
    Upgrading,
    Activating,
    FatalError,
}

impl DeviceState {
    pub const ALL: [DeviceState; 10] = [
        DeviceState::Unknown,
        DeviceState::Starting,
        DeviceState::WifiConfiguring,
        DeviceState::Idle,
        DeviceState::Connecting,
        DeviceState::Listening,
        DeviceState::Speaking,
        DeviceState::Upgrading,
        DeviceState::Activating,
        DeviceState::FatalError,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(DeviceState::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Starting => "starting",
            DeviceState::WifiConfiguring => "configuring",
            DeviceState::Idle => "idle",
            DeviceState::Connecting => "connecting",
            DeviceState::Listening => "listening",
            DeviceState::Speaking => "speaking",
            DeviceState::Upgrading => "upgrading",
            DeviceState::Activating => "activating",
            DeviceState::FatalError => "fatal_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListeningMode {
    #[serde(rename = "auto")]
    AutoStop,
    #[serde(rename = "manual")]
    ManualStop,
    #[serde(rename = "realtime")]
    Realtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    None,
    WakeWordDetected,
}

impl AbortReason {
    fn wire_name(self) -> Option<&'static str> {
        match self {
            AbortReason::None => None,
            AbortReason::WakeWordDetected => Some("wake_word_detected"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: u32,
}

impl AudioParams {
    pub fn opus_capture() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
            frame_duration: FRAME_DURATION_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// Control messages the device sends to the dialogue service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Hello {
        version: u32,
        transport: String,
        audio_params: AudioParams,
    },
    Goodbye {
        session_id: String,
    },
    Listen {
        session_id: String,
        state: ListenState,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ListeningMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Abort {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Iot {
        session_id: String,
        update: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        descriptors: Option<Vec<Value>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        states: Option<Value>,
    },
}

impl OutboundMessage {
    pub fn hello(version: u32, transport: &str) -> Self {
        OutboundMessage::Hello {
            version,
            transport: transport.to_string(),
            audio_params: AudioParams::opus_capture(),
        }
    }

    pub fn start_listening(session_id: &str, mode: ListeningMode) -> Self {
        OutboundMessage::Listen {
            session_id: session_id.to_string(),
            state: ListenState::Start,
            mode: Some(mode),
            text: None,
        }
    }

    pub fn stop_listening(session_id: &str) -> Self {
        OutboundMessage::Listen {
            session_id: session_id.to_string(),
            state: ListenState::Stop,
            mode: None,
            text: None,
        }
    }

    pub fn wake_word_detected(session_id: &str, wake_word: &str) -> Self {
        OutboundMessage::Listen {
            session_id: session_id.to_string(),
            state: ListenState::Detect,
            mode: None,
            text: Some(wake_word.to_string()),
        }
    }

    pub fn abort(session_id: &str, reason: AbortReason) -> Self {
        OutboundMessage::Abort {
            session_id: session_id.to_string(),
            reason: reason.wire_name().map(str::to_string),
        }
    }

    pub fn goodbye(session_id: &str) -> Self {
        OutboundMessage::Goodbye {
            session_id: session_id.to_string(),
        }
    }

    pub fn iot_descriptor(session_id: &str, descriptor: Value) -> Self {
        OutboundMessage::Iot {
            session_id: session_id.to_string(),
            update: true,
            descriptors: Some(vec![descriptor]),
            states: None,
        }
    }

    pub fn iot_states(session_id: &str, states: Value) -> Self {
        OutboundMessage::Iot {
            session_id: session_id.to_string(),
            update: true,
            descriptors: None,
            states: Some(states),
        }
    }

    pub fn to_json(&self) -> String {
        // Serialising a closed set of owned strings and numbers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// `{session_id, type, custom_data}` passthrough used by `send_custom_message`.
pub fn custom_message(session_id: &str, kind: &str, data: Value) -> String {
    json!({
        "session_id": session_id,
        "type": kind,
        "custom_data": data,
    })
    .to_string()
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ServerAudioParams {
    pub sample_rate: Option<u32>,
    pub frame_duration: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UdpParams {
    pub server: String,
    pub port: u16,
    pub key: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ServerHello {
    pub transport: Option<String>,
    pub session_id: Option<String>,
    pub audio_params: Option<ServerAudioParams>,
    pub udp: Option<UdpParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    Other,
}

impl From<String> for TtsState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "start" => TtsState::Start,
            "stop" => TtsState::Stop,
            "sentence_start" => TtsState::SentenceStart,
            _ => TtsState::Other,
        }
    }
}

/// Control messages received from the dialogue service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Hello(ServerHello),
    Goodbye {
        session_id: Option<String>,
    },
    Tts {
        state: TtsState,
        text: Option<String>,
    },
    Stt {
        text: Option<String>,
    },
    Llm {
        emotion: Option<String>,
    },
    Iot {
        commands: Option<Vec<Value>>,
    },
    System {
        command: Option<String>,
    },
    Alert {
        status: Option<String>,
        message: Option<String>,
        emotion: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

pub fn parse_inbound(text: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Ping,
    Status,
    Toggle,
    StartListening,
    StopListening,
    WakeWord { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: DeviceState,
    pub listening_mode: ListeningMode,
    pub channel_open: bool,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: DeviceState::Unknown,
            listening_mode: ListeningMode::AutoStop,
            channel_open: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Ok { message: String },
    Status { status: StatusSnapshot },
    Error { message: String },
}

impl std::fmt::Display for ServerReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerReply::Ok { message } => write!(f, "ok: {}", message),
            ServerReply::Status { status } => write!(
                f,
                "{} ({:?}), audio channel {}",
                status.state.as_str(),
                status.listening_mode,
                if status.channel_open { "open" } else { "closed" }
            ),
            ServerReply::Error { message } => write!(f, "error: {}", message),
        }
    }
}
