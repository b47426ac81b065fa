use std::path::PathBuf;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_WEBSOCKET_URL: &str = "ws://127.0.0.1:8000/xiaozhi/v1/";
pub const DEFAULT_MQTT_PORT: u16 = 8883;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Websocket,
    Mqtt,
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            "mqtt" | "mqtt+udp" => Ok(TransportKind::Mqtt),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WebsocketSettings {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub endpoint: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub publish_topic: String,
    pub subscribe_topic: String,
    #[serde(skip)]
    pub port: Option<u16>,
    #[serde(skip)]
    pub tls: bool,
}

impl MqttSettings {
    /// Host and port, taken from `endpoint` when it carries `host:port`.
    pub fn host_port(&self) -> (String, u16) {
        match self.endpoint.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (
                    self.endpoint.clone(),
                    self.port.unwrap_or(DEFAULT_MQTT_PORT),
                ),
            },
            None => (
                self.endpoint.clone(),
                self.port.unwrap_or(DEFAULT_MQTT_PORT),
            ),
        }
    }
}

/// Endpoint overrides handed out by the version service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerSettings {
    pub mqtt: Option<MqttSettings>,
    pub websocket: Option<WebsocketSettings>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub transport: TransportKind,
    pub websocket: WebsocketSettings,
    pub mqtt: MqttSettings,
    pub ota_url: Option<String>,
    pub device_id: String,
    pub client_id: String,
    pub firmware_version: String,
    pub assets_dir: PathBuf,
    pub firmware_path: PathBuf,
    pub realtime_chat: bool,
    pub capture_device: Option<String>,
    pub mock_audio_file: Option<PathBuf>,
    pub control_bind: String,
    pub gpio_button_pin: Option<u8>,
}

impl DeviceConfig {
    pub fn default_bind() -> String {
        "127.0.0.1:7878".to_string()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| {
            lookup(key).and_then(|value| {
                let trimmed = value.trim().to_string();
                if trimmed.is_empty() { None } else { Some(trimmed) }
            })
        };
        let string = |key: &str, default: &str| optional(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str, default: bool| {
            optional(key)
                .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };

        let transport = string("TRANSPORT", "websocket").parse()?;

        let config = Self {
            transport,
            websocket: WebsocketSettings {
                url: string("WEBSOCKET_URL", DEFAULT_WEBSOCKET_URL),
                token: string("WEBSOCKET_TOKEN", ""),
            },
            mqtt: MqttSettings {
                endpoint: string("MQTT_ENDPOINT", ""),
                port: optional("MQTT_PORT").and_then(|value| value.parse().ok()),
                client_id: string("MQTT_CLIENT_ID", ""),
                username: string("MQTT_USERNAME", ""),
                password: string("MQTT_PASSWORD", ""),
                publish_topic: string("MQTT_PUBLISH_TOPIC", ""),
                subscribe_topic: string("MQTT_SUBSCRIBE_TOPIC", ""),
                tls: flag("MQTT_TLS", true),
            },
            ota_url: optional("OTA_URL"),
            device_id: optional("DEVICE_ID").unwrap_or_else(generate_device_id),
            client_id: optional("CLIENT_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            firmware_version: string("FIRMWARE_VERSION", env!("CARGO_PKG_VERSION")),
            assets_dir: PathBuf::from(string("ASSETS_DIR", "assets")),
            firmware_path: PathBuf::from(string("FIRMWARE_PATH", "firmware.bin")),
            realtime_chat: flag("REALTIME_CHAT", false),
            capture_device: optional("CAPTURE_DEVICE"),
            mock_audio_file: optional("MOCK_AUDIO_FILE").map(PathBuf::from),
            control_bind: string("CONTROL_BIND", &Self::default_bind()),
            gpio_button_pin: optional("GPIO_BUTTON").and_then(|value| value.parse().ok()),
        };
        Ok(config)
    }

    /// Applies endpoint overrides from the version service. Empty override
    /// fields keep the locally configured value.
    pub fn apply_server_settings(&mut self, settings: &ServerSettings) {
        if let Some(mqtt) = &settings.mqtt {
            let target = &mut self.mqtt;
            for (slot, value) in [
                (&mut target.endpoint, &mqtt.endpoint),
                (&mut target.client_id, &mqtt.client_id),
                (&mut target.username, &mqtt.username),
                (&mut target.password, &mqtt.password),
                (&mut target.publish_topic, &mqtt.publish_topic),
                (&mut target.subscribe_topic, &mqtt.subscribe_topic),
            ] {
                if !value.is_empty() {
                    *slot = value.clone();
                }
            }
            tracing::info!("mqtt settings updated from version service");
        }
        if let Some(websocket) = &settings.websocket {
            if !websocket.url.is_empty() {
                self.websocket.url = websocket.url.clone();
            }
            if !websocket.token.is_empty() {
                self.websocket.token = websocket.token.clone();
            }
            tracing::info!("websocket settings updated from version service");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.transport {
            TransportKind::Websocket => {
                let parsed = url::Url::parse(&self.websocket.url).map_err(|err| ConfigError::InvalidUrl {
                    url: self.websocket.url.clone(),
                    reason: err.to_string(),
                })?;
                if !matches!(parsed.scheme(), "ws" | "wss") {
                    return Err(ConfigError::InvalidUrl {
                        url: self.websocket.url.clone(),
                        reason: format!("unsupported scheme '{}'", parsed.scheme()),
                    });
                }
                Ok(())
            }
            TransportKind::Mqtt => {
                if self.mqtt.endpoint.is_empty() {
                    Err(ConfigError::MissingMqttEndpoint)
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// MAC-style identifier for hosts without a radio to read one from.
fn generate_device_id() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[..6]);
    // locally administered, unicast
    mac[0] = (mac[0] | 0x02) & 0xfe;
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
