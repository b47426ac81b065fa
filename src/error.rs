#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("server hello not received within {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("send failed: {0}")]
    Send(String),
    #[error("channel not open")]
    NotOpen,
    #[error("invalid message: {0}")]
    Protocol(String),
    #[error("audio packet rejected: {0}")]
    Packet(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoder init failed: {0}")]
    EncoderInit(String),
    #[error("decoder init failed: {0}")]
    DecoderInit(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("audio device error: {0}")]
    Device(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    #[error("version check request failed: {0}")]
    Request(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("activation still pending")]
    ActivationTimeout,
    #[error("firmware transfer failed: {0}")]
    Transfer(String),
    #[error("no firmware available")]
    NoFirmware,
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("truncated header at offset {0}")]
    TruncatedHeader(usize),
    #[error("truncated payload at offset {offset}: need {needed} bytes, {available} left")]
    TruncatedPayload {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown transport '{0}', expected websocket or mqtt")]
    UnknownTransport(String),
    #[error("invalid websocket url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("mqtt endpoint is not specified")]
    MissingMqttEndpoint,
}

/// Failures that stop the device from coming up at all.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures talking to a running device over its control socket.
#[derive(Debug, thiserror::Error)]
pub enum ControlClientError {
    #[error("cannot reach device at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("control socket i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("device closed the connection without replying")]
    NoReply,
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
}
