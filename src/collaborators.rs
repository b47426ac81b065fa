//! Interfaces to the parts of the device this crate drives but does not
//! implement, plus the host stand-ins used when running on a desktop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::audio::AudioPacket;
use crate::config::ServerSettings;
use crate::error::{CodecError, OtaError};

pub trait AudioCodec: Send + Sync {
    fn start(&self) -> Result<(), CodecError>;
    fn enable_input(&self, enable: bool);
    fn enable_output(&self, enable: bool);
    fn input_enabled(&self) -> bool;
    fn output_enabled(&self) -> bool;
    /// Fills `buffer` with interleaved samples at the native input rate.
    /// Returns false when nothing could be read.
    fn input_data(&self, buffer: &mut [i16]) -> bool;
    fn output_data(&self, pcm: &[i16]);
    fn input_sample_rate(&self) -> u32;
    fn output_sample_rate(&self) -> u32;
    fn input_channels(&self) -> usize;
}

/// Callbacks raised by the voice front end. Invoked off the control thread.
pub trait VoiceEvents: Send + Sync {
    fn on_wake_word_detected(&self, wake_word: String);
    fn on_processed_audio(&self, pcm: Vec<i16>);
    fn on_vad_change(&self, speaking: bool);
}

pub trait WakeWordDetector: Send + Sync {
    fn initialize(&self, codec: Arc<dyn AudioCodec>, events: Arc<dyn VoiceEvents>);
    fn start_detection(&self);
    fn stop_detection(&self);
    fn is_detection_running(&self) -> bool;
    fn feed_size(&self) -> usize;
    fn feed(&self, pcm: &[i16]);
    /// Encodes the audio buffered around the detection for replay to the server.
    fn encode_wake_word_data(&self);
    fn take_wake_word_packet(&self) -> Option<AudioPacket>;
}

pub trait AudioProcessor: Send + Sync {
    fn initialize(&self, codec: Arc<dyn AudioCodec>, realtime: bool, events: Arc<dyn VoiceEvents>);
    fn start(&self);
    fn stop(&self);
    fn is_running(&self) -> bool;
    fn feed_size(&self) -> usize;
    fn feed(&self, pcm: &[i16]);
}

/// Version check, activation and firmware transfer service.
pub trait Ota: Send + Sync {
    fn check_version(&self) -> Result<(), OtaError>;
    fn has_new_version(&self) -> bool;
    fn firmware_version(&self) -> String;
    fn current_version(&self) -> String;
    /// Streams the new firmware; `progress` receives `(percent, bytes_per_second)`.
    fn start_upgrade(&self, progress: &mut dyn FnMut(u32, usize)) -> Result<(), OtaError>;
    fn mark_current_version_valid(&self);
    fn has_activation_code(&self) -> bool;
    fn has_activation_challenge(&self) -> bool;
    fn activation_code(&self) -> String;
    fn activation_message(&self) -> String;
    /// `Err(OtaError::ActivationTimeout)` while the server still waits for the user.
    fn activate(&self) -> Result<(), OtaError>;
    fn has_server_time(&self) -> bool;

    fn server_settings(&self) -> ServerSettings {
        ServerSettings::default()
    }
}

pub trait Display: Send + Sync {
    fn set_status(&self, status: &str);
    fn set_emotion(&self, emotion: &str);
    fn set_chat_message(&self, role: &str, message: &str);
    fn show_notification(&self, message: &str);
}

pub trait Board: Send + Sync {
    fn set_power_save_mode(&self, enabled: bool);
    fn reboot(&self);
}

pub trait ThingRegistry: Send + Sync {
    fn descriptors(&self) -> Vec<Value>;
    /// States to report; with `delta` only those changed since the last report.
    fn states(&self, delta: bool) -> Option<Value>;
    fn invoke(&self, command: &Value);
}

#[derive(Debug, Default)]
pub struct LogDisplay;

impl Display for LogDisplay {
    fn set_status(&self, status: &str) {
        tracing::info!(status, "display status");
    }

    fn set_emotion(&self, emotion: &str) {
        tracing::debug!(emotion, "display emotion");
    }

    fn set_chat_message(&self, role: &str, message: &str) {
        if !message.is_empty() {
            tracing::info!("[{}] {}", role, message);
        }
    }

    fn show_notification(&self, message: &str) {
        tracing::info!("notification: {}", message);
    }
}

#[derive(Debug, Default)]
pub struct HostBoard {
    power_save: AtomicBool,
}

impl Board for HostBoard {
    fn set_power_save_mode(&self, enabled: bool) {
        if self.power_save.swap(enabled, Ordering::SeqCst) != enabled {
            tracing::debug!(enabled, "power save mode");
        }
    }

    fn reboot(&self) {
        tracing::warn!("reboot requested; host process will exit");
    }
}

#[derive(Debug, Default)]
pub struct NullThings;

impl ThingRegistry for NullThings {
    fn descriptors(&self) -> Vec<Value> {
        Vec::new()
    }

    fn states(&self, _delta: bool) -> Option<Value> {
        None
    }

    fn invoke(&self, command: &Value) {
        tracing::warn!("no device capability handles {}", command);
    }
}

/// Version service used when no OTA endpoint is configured.
#[derive(Debug, Clone)]
pub struct StaticOta {
    version: String,
}

impl StaticOta {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Ota for StaticOta {
    fn check_version(&self) -> Result<(), OtaError> {
        Ok(())
    }

    fn has_new_version(&self) -> bool {
        false
    }

    fn firmware_version(&self) -> String {
        self.version.clone()
    }

    fn current_version(&self) -> String {
        self.version.clone()
    }

    fn start_upgrade(&self, _progress: &mut dyn FnMut(u32, usize)) -> Result<(), OtaError> {
        Err(OtaError::NoFirmware)
    }

    fn mark_current_version_valid(&self) {}

    fn has_activation_code(&self) -> bool {
        false
    }

    fn has_activation_challenge(&self) -> bool {
        false
    }

    fn activation_code(&self) -> String {
        String::new()
    }

    fn activation_message(&self) -> String {
        String::new()
    }

    fn activate(&self) -> Result<(), OtaError> {
        Ok(())
    }

    fn has_server_time(&self) -> bool {
        false
    }
}

/// Codec with no hardware behind it: input is paced silence, output is discarded.
#[derive(Debug)]
pub struct SilentCodec {
    sample_rate: u32,
    input: AtomicBool,
    output: AtomicBool,
}

impl SilentCodec {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            input: AtomicBool::new(true),
            output: AtomicBool::new(false),
        }
    }
}

impl AudioCodec for SilentCodec {
    fn start(&self) -> Result<(), CodecError> {
        tracing::info!("audio codec: silent (host-audio disabled)");
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
        if !self.input_enabled() {
            return false;
        }
        let millis = buffer.len() as u64 * 1000 / self.sample_rate.max(1) as u64;
        std::thread::sleep(Duration::from_millis(millis));
        buffer.fill(0);
        true
    }

    fn output_data(&self, pcm: &[i16]) {
        let millis = pcm.len() as u64 * 1000 / self.sample_rate.max(1) as u64;
        std::thread::sleep(Duration::from_millis(millis));
    }

    fn input_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn input_channels(&self) -> usize {
        1
    }
}
