//! HTTP version service: version check, activation polling and firmware
//! download. The `Ota` trait is synchronous, so every request runs on the
//! shared tokio runtime through `block_on`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::time::sleep;

use crate::collaborators::Ota;
use crate::config::{DeviceConfig, MqttSettings, ServerSettings, WebsocketSettings};
use crate::error::OtaError;

const MAX_RETRY_ATTEMPTS: usize = 5;
const RETRY_BACKOFF_BASE_MS: u64 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

fn retry_backoff_duration(attempt: usize) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1);
    Duration::from_millis(RETRY_BACKOFF_BASE_MS.saturating_mul(factor))
}

async fn send_with_retry<F>(mut build: F) -> Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let response = build().send().await?;
        if response.status().is_server_error() && attempt < MAX_RETRY_ATTEMPTS {
            tracing::warn!(
                status = %response.status(),
                attempt,
                max_attempts = MAX_RETRY_ATTEMPTS,
                "request failed with 5xx, retrying"
            );
            sleep(retry_backoff_duration(attempt)).await;
            continue;
        }
        return Ok(response);
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FirmwareInfo {
    pub version: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ActivationInfo {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    pub challenge: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ServerTime {
    pub timestamp: Option<i64>,
    pub timezone_offset: Option<i32>,
}

/// Body of the version service's reply. Every block is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct VersionResponse {
    pub firmware: Option<FirmwareInfo>,
    pub activation: Option<ActivationInfo>,
    pub server_time: Option<ServerTime>,
    pub mqtt: Option<MqttSettings>,
    pub websocket: Option<WebsocketSettings>,
}

/// True when dotted version `candidate` is strictly newer than `current`.
/// Missing or non-numeric components count as zero.
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    let parse = |version: &str| -> Vec<u64> {
        version
            .trim()
            .trim_start_matches('v')
            .split('.')
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let candidate = parse(candidate);
    let current = parse(current);
    let len = candidate.len().max(current.len());
    for i in 0..len {
        let a = candidate.get(i).copied().unwrap_or(0);
        let b = current.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    false
}

#[derive(Debug, Default)]
struct VersionState {
    response: VersionResponse,
    new_version: bool,
}

pub struct HttpOta {
    client: reqwest::Client,
    runtime: Handle,
    url: String,
    device_id: String,
    client_id: String,
    current_version: String,
    firmware_path: PathBuf,
    state: Mutex<VersionState>,
}

impl HttpOta {
    pub fn new(url: String, config: &DeviceConfig, runtime: Handle) -> Result<Self, OtaError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("voxcore/{}", config.firmware_version))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| OtaError::Request(err.to_string()))?;
        Ok(Self {
            client,
            runtime,
            url,
            device_id: config.device_id.clone(),
            client_id: config.client_id.clone(),
            current_version: config.firmware_version.clone(),
            firmware_path: config.firmware_path.clone(),
            state: Mutex::new(VersionState::default()),
        })
    }

    fn activate_url(&self) -> String {
        format!("{}/activate", self.url.trim_end_matches('/'))
    }

    fn descriptor(&self) -> Value {
        json!({
            "version": 2,
            "uuid": self.client_id,
            "mac_address": self.device_id,
            "application": {
                "name": env!("CARGO_PKG_NAME"),
                "version": self.current_version,
            },
            "board": { "type": "host" },
        })
    }

    fn post(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Device-Id", &self.device_id)
            .header("Client-Id", &self.client_id)
            .header(ACCEPT_LANGUAGE, "en-US")
            .header(CONTENT_TYPE, "application/json")
            .json(body)
    }

    fn firmware_url(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .response
            .firmware
            .as_ref()
            .map(|firmware| firmware.url.clone())
            .filter(|url| !url.is_empty())
    }

    async fn download(
        &self,
        url: &str,
        progress: &mut dyn FnMut(u32, usize),
    ) -> Result<(), OtaError> {
        let response = send_with_retry(|| self.client.get(url))
            .await
            .map_err(|err| OtaError::Transfer(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(OtaError::Status(status.as_u16()));
        }
        let total = response.content_length().filter(|len| *len > 0);

        if let Some(parent) = self.firmware_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| OtaError::Transfer(err.to_string()))?;
        }
        let temp_path = self.firmware_path.with_extension("part");
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|err| OtaError::Transfer(err.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        let mut window_bytes: usize = 0;
        let mut window_start = Instant::now();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|err| OtaError::Transfer(err.to_string()))?;
            file.write_all(&bytes)
                .await
                .map_err(|err| OtaError::Transfer(err.to_string()))?;
            received += bytes.len() as u64;
            window_bytes += bytes.len();
            if window_start.elapsed() >= PROGRESS_INTERVAL {
                progress(percent(received, total), window_bytes);
                window_bytes = 0;
                window_start = Instant::now();
            }
        }
        file.flush()
            .await
            .map_err(|err| OtaError::Transfer(err.to_string()))?;
        if let Some(total) = total {
            if received != total {
                return Err(OtaError::Transfer(format!(
                    "expected {} bytes, received {}",
                    total, received
                )));
            }
        }
        progress(100, window_bytes);

        tokio::fs::rename(&temp_path, &self.firmware_path)
            .await
            .map_err(|err| OtaError::Transfer(err.to_string()))?;
        tracing::info!(
            bytes = received,
            path = %self.firmware_path.display(),
            "firmware downloaded"
        );
        Ok(())
    }
}

fn percent(received: u64, total: Option<u64>) -> u32 {
    match total {
        Some(total) => (received.saturating_mul(100) / total).min(100) as u32,
        None => 0,
    }
}

impl Ota for HttpOta {
    fn check_version(&self) -> Result<(), OtaError> {
        let body = self.descriptor();
        let text = self.runtime.block_on(async {
            let response = send_with_retry(|| self.post(&self.url, &body))
                .await
                .map_err(|err| OtaError::Request(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(OtaError::Status(status.as_u16()));
            }
            response
                .text()
                .await
                .map_err(|err| OtaError::Request(err.to_string()))
        })?;

        let response: VersionResponse = serde_json::from_str(&text)
            .map_err(|err| OtaError::InvalidResponse(err.to_string()))?;
        let new_version = response
            .firmware
            .as_ref()
            .is_some_and(|firmware| is_newer_version(&firmware.version, &self.current_version));
        if let Some(firmware) = &response.firmware {
            tracing::info!(
                current = %self.current_version,
                latest = %firmware.version,
                new_version,
                "version checked"
            );
        }
        *self.state.lock() = VersionState {
            response,
            new_version,
        };
        Ok(())
    }

    fn has_new_version(&self) -> bool {
        self.state.lock().new_version
    }

    fn firmware_version(&self) -> String {
        let state = self.state.lock();
        state
            .response
            .firmware
            .as_ref()
            .map(|firmware| firmware.version.clone())
            .unwrap_or_default()
    }

    fn current_version(&self) -> String {
        self.current_version.clone()
    }

    fn start_upgrade(&self, progress: &mut dyn FnMut(u32, usize)) -> Result<(), OtaError> {
        let Some(url) = self.firmware_url() else {
            return Err(OtaError::NoFirmware);
        };
        tracing::info!(url = %url, "starting firmware download");
        self.runtime.block_on(self.download(&url, progress))
    }

    fn mark_current_version_valid(&self) {
        tracing::info!(version = %self.current_version, "running firmware marked valid");
    }

    fn has_activation_code(&self) -> bool {
        let state = self.state.lock();
        state
            .response
            .activation
            .as_ref()
            .is_some_and(|activation| !activation.code.is_empty())
    }

    fn has_activation_challenge(&self) -> bool {
        let state = self.state.lock();
        state
            .response
            .activation
            .as_ref()
            .is_some_and(|activation| activation.challenge.is_some())
    }

    fn activation_code(&self) -> String {
        let state = self.state.lock();
        state
            .response
            .activation
            .as_ref()
            .map(|activation| activation.code.clone())
            .unwrap_or_default()
    }

    fn activation_message(&self) -> String {
        let state = self.state.lock();
        state
            .response
            .activation
            .as_ref()
            .map(|activation| activation.message.clone())
            .unwrap_or_default()
    }

    fn activate(&self) -> Result<(), OtaError> {
        let challenge = {
            let state = self.state.lock();
            state
                .response
                .activation
                .as_ref()
                .and_then(|activation| activation.challenge.clone())
        };
        let body = json!({ "challenge": challenge });
        let url = self.activate_url();
        let status = self.runtime.block_on(async {
            send_with_retry(|| self.post(&url, &body))
                .await
                .map(|response| response.status())
                .map_err(|err| OtaError::Request(err.to_string()))
        })?;
        match status {
            StatusCode::OK => {
                tracing::info!("activation confirmed");
                self.state.lock().response.activation = None;
                Ok(())
            }
            StatusCode::ACCEPTED => Err(OtaError::ActivationTimeout),
            other => Err(OtaError::Status(other.as_u16())),
        }
    }

    fn has_server_time(&self) -> bool {
        self.state.lock().response.server_time.is_some()
    }

    fn server_settings(&self) -> ServerSettings {
        let state = self.state.lock();
        ServerSettings {
            mqtt: state.response.mqtt.clone(),
            websocket: state.response.websocket.clone(),
        }
    }
}
