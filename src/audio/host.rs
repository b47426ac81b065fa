use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::{Condvar, Mutex};

use crate::audio::resample::convert_channels;
use crate::collaborators::AudioCodec;
use crate::error::CodecError;

const CAPTURE_BUFFER_SECONDS: usize = 1;
const PLAYBACK_AHEAD_MS: usize = 200;
const INPUT_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct HostCodecConfig {
    pub capture_device: Option<String>,
    pub mock_file: Option<PathBuf>,
    pub preferred_input_rate: u32,
}

#[derive(Default)]
struct CaptureBuffer {
    samples: Mutex<VecDeque<i16>>,
    ready: Condvar,
}

impl CaptureBuffer {
    fn push(&self, data: &[i16], limit: usize) {
        let mut samples = self.samples.lock();
        samples.extend(data.iter().copied());
        let overflow = samples.len().saturating_sub(limit);
        if overflow > 0 {
            samples.drain(..overflow);
        }
        self.ready.notify_all();
    }

    fn read(&self, buffer: &mut [i16], wait: Duration) -> bool {
        let mut samples = self.samples.lock();
        if samples.len() < buffer.len() {
            let _ = self
                .ready
                .wait_while_for(&mut samples, |s| s.len() < buffer.len(), wait);
        }
        if samples.len() < buffer.len() {
            return false;
        }
        let len = buffer.len();
        for (slot, sample) in buffer.iter_mut().zip(samples.drain(..len)) {
            *slot = sample;
        }
        true
    }
}

/// cpal-backed codec. Capture is downmixed to mono; playback is mono PCM fanned
/// out to every device channel.
pub struct HostCodec {
    config: HostCodecConfig,
    input_rate: AtomicU32,
    output_rate: AtomicU32,
    input_enabled: AtomicBool,
    output_enabled: AtomicBool,
    capture: Arc<CaptureBuffer>,
    playback: Arc<Mutex<VecDeque<i16>>>,
    shutdown: Mutex<Vec<std::sync::mpsc::Sender<()>>>,
}

impl HostCodec {
    pub fn new(config: HostCodecConfig) -> Self {
        let preferred = config.preferred_input_rate.max(8_000);
        Self {
            config,
            input_rate: AtomicU32::new(preferred),
            output_rate: AtomicU32::new(preferred),
            input_enabled: AtomicBool::new(true),
            output_enabled: AtomicBool::new(false),
            capture: Arc::new(CaptureBuffer::default()),
            playback: Arc::new(Mutex::new(VecDeque::new())),
            shutdown: Mutex::new(Vec::new()),
        }
    }

    fn capture_limit(&self) -> usize {
        self.input_rate.load(Ordering::SeqCst) as usize * CAPTURE_BUFFER_SECONDS
    }

    fn start_mock_input(&self, path: PathBuf) -> Result<(), CodecError> {
        let reader = hound::WavReader::open(&path)
            .map_err(|err| CodecError::Device(format!("failed to open mock wav: {}", err)))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;
        let mut samples = Vec::new();
        for sample in reader.into_samples::<i16>() {
            samples.push(sample.map_err(|err| CodecError::Device(err.to_string()))?);
        }
        let samples = convert_channels(&samples, channels, 1);
        self.input_rate.store(spec.sample_rate, Ordering::SeqCst);
        tracing::info!(
            "mock audio input '{}' ({} Hz, {} samples)",
            path.display(),
            spec.sample_rate,
            samples.len()
        );
        if samples.is_empty() {
            return Ok(());
        }

        let capture = self.capture.clone();
        let limit = self.capture_limit();
        let chunk = (spec.sample_rate as usize / 50).max(1);
        let pause = Duration::from_millis(20);
        std::thread::Builder::new()
            .name("mock-capture".into())
            .spawn(move || {
                loop {
                    for block in samples.chunks(chunk) {
                        capture.push(block, limit);
                        std::thread::sleep(pause);
                    }
                }
            })
            .map_err(|err| CodecError::Device(err.to_string()))?;
        Ok(())
    }

    fn start_live_input(&self) -> Result<(), CodecError> {
        let (info_tx, info_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let capture = self.capture.clone();
        let device_name = self.config.capture_device.clone();
        let preferred = self.input_rate.load(Ordering::SeqCst);

        std::thread::Builder::new()
            .name("cpal-input".into())
            .spawn(move || match build_input_stream(device_name.as_deref(), preferred, capture) {
                Ok((stream, rate)) => {
                    if let Err(err) = stream.play() {
                        let _ = info_tx.send(Err(format!("failed to start input stream: {}", err)));
                        return;
                    }
                    let _ = info_tx.send(Ok(rate));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(err) => {
                    let _ = info_tx.send(Err(err));
                }
            })
            .map_err(|err| CodecError::Device(err.to_string()))?;

        let rate = info_rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| CodecError::Device("timed out starting input stream".into()))?
            .map_err(CodecError::Device)?;
        self.input_rate.store(rate, Ordering::SeqCst);
        self.shutdown.lock().push(shutdown_tx);
        Ok(())
    }

    fn start_output(&self) -> Result<(), CodecError> {
        let (info_tx, info_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let playback = self.playback.clone();

        std::thread::Builder::new()
            .name("cpal-output".into())
            .spawn(move || match build_output_stream(playback) {
                Ok((stream, rate)) => {
                    if let Err(err) = stream.play() {
                        let _ = info_tx.send(Err(format!("failed to start output stream: {}", err)));
                        return;
                    }
                    let _ = info_tx.send(Ok(rate));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(err) => {
                    let _ = info_tx.send(Err(err));
                }
            })
            .map_err(|err| CodecError::Device(err.to_string()))?;

        let rate = info_rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| CodecError::Device("timed out starting output stream".into()))?
            .map_err(CodecError::Device)?;
        self.output_rate.store(rate, Ordering::SeqCst);
        self.shutdown.lock().push(shutdown_tx);
        Ok(())
    }
}

impl Drop for HostCodec {
    fn drop(&mut self) {
        for tx in self.shutdown.lock().drain(..) {
            let _ = tx.send(());
        }
    }
}

impl AudioCodec for HostCodec {
    fn start(&self) -> Result<(), CodecError> {
        match self.config.mock_file.clone() {
            Some(path) => self.start_mock_input(path)?,
            None => self.start_live_input()?,
        }
        self.start_output()?;
        tracing::info!(
            input_rate = self.input_sample_rate(),
            output_rate = self.output_sample_rate(),
            "host audio started"
        );
        Ok(())
    }

    fn enable_input(&self, enable: bool) {
        if self.input_enabled.swap(enable, Ordering::SeqCst) != enable {
            tracing::debug!(enable, "audio input");
            if !enable {
                self.capture.samples.lock().clear();
            }
        }
    }

    fn enable_output(&self, enable: bool) {
        if self.output_enabled.swap(enable, Ordering::SeqCst) != enable {
            tracing::debug!(enable, "audio output");
            if !enable {
                self.playback.lock().clear();
            }
        }
    }

    fn input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::SeqCst)
    }

    fn output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    fn input_data(&self, buffer: &mut [i16]) -> bool {
        if !self.input_enabled() {
            return false;
        }
        self.capture.read(buffer, INPUT_WAIT)
    }

    fn output_data(&self, pcm: &[i16]) {
        if !self.output_enabled() {
            return;
        }
        let ahead = self.output_sample_rate() as usize * PLAYBACK_AHEAD_MS / 1000;
        while self.output_enabled() && self.playback.lock().len() > ahead {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.playback.lock().extend(pcm.iter().copied());
    }

    fn input_sample_rate(&self) -> u32 {
        self.input_rate.load(Ordering::SeqCst)
    }

    fn output_sample_rate(&self) -> u32 {
        self.output_rate.load(Ordering::SeqCst)
    }

    fn input_channels(&self) -> usize {
        1
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    preferred_rate: u32,
    capture: Arc<CaptureBuffer>,
) -> Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();

    let available_devices = host
        .input_devices()
        .map_err(|err| format!("failed to list input devices: {}", err))?
        .map(|d| d.name().unwrap_or("unknown".to_string()))
        .collect::<Vec<_>>();
    tracing::info!("available input devices: {:?}", available_devices);

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|err| format!("failed to list input devices: {}", err))?
            .find(|device| device.name().map(|n| n.contains(name)).unwrap_or(false))
            .ok_or_else(|| format!("input device '{}' not found.", name))?,
        None => host
            .default_input_device()
            .ok_or_else(|| "no default input device available".to_string())?,
    };

    let default_config = device
        .default_input_config()
        .map_err(|err| format!("failed to get default input config: {}", err))?;
    let input_config = pick_input_config(&device, preferred_rate).unwrap_or(default_config);
    let sample_format = input_config.sample_format();
    let stream_config: cpal::StreamConfig = input_config.into();
    let channels = stream_config.channels as usize;
    let sample_rate = stream_config.sample_rate.0;
    let limit = sample_rate as usize * CAPTURE_BUFFER_SECONDS;

    tracing::info!(
        "using input device: '{}' with config: {:?}",
        device.name().unwrap_or("unknown".to_string()),
        stream_config
    );

    let err_fn = |err| tracing::warn!("audio capture error: {}", err);

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _| {
                let converted: Vec<i16> = data
                    .iter()
                    .map(|s| (s * i16::MAX as f32).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
                    .collect();
                capture.push(&convert_channels(&converted, channels, 1), limit);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _| {
                capture.push(&convert_channels(data, channels, 1), limit);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I32 => device.build_input_stream(
            &stream_config,
            move |data: &[i32], _| {
                let converted: Vec<i16> = data.iter().map(|s| (*s >> 16) as i16).collect();
                capture.push(&convert_channels(&converted, channels, 1), limit);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(format!("unsupported input sample format {:?}", other));
        }
    }
    .map_err(|err| format!("failed to build input stream: {}", err))?;

    Ok((stream, sample_rate))
}

fn pick_input_config(device: &cpal::Device, target_rate: u32) -> Option<cpal::SupportedStreamConfig> {
    let mut configs = device.supported_input_configs().ok()?;
    configs.find_map(|config| {
        let min = config.min_sample_rate().0;
        let max = config.max_sample_rate().0;
        if min <= target_rate
            && target_rate <= max
            && [
                cpal::SampleFormat::F32,
                cpal::SampleFormat::I16,
                cpal::SampleFormat::I32,
            ]
            .contains(&config.sample_format())
        {
            Some(config.with_sample_rate(cpal::SampleRate(target_rate)))
        } else {
            None
        }
    })
}

fn build_output_stream(playback: Arc<Mutex<VecDeque<i16>>>) -> Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no default output device available".to_string())?;
    let output_config = device
        .default_output_config()
        .map_err(|err| format!("failed to get default output config: {}", err))?;
    let sample_format = output_config.sample_format();
    let stream_config: cpal::StreamConfig = output_config.into();
    let channels = stream_config.channels.max(1) as usize;
    let sample_rate = stream_config.sample_rate.0;

    tracing::info!(
        "using output device: '{}' with config: {:?}",
        device.name().unwrap_or("unknown".to_string()),
        stream_config
    );

    let err_fn = |err| tracing::warn!("audio playback error: {}", err);

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _| {
                let mut queue = playback.lock();
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0) as f32 / i16::MAX as f32;
                    frame.fill(sample);
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _| {
                let mut queue = playback.lock();
                for frame in data.chunks_mut(channels) {
                    frame.fill(queue.pop_front().unwrap_or(0));
                }
            },
            err_fn,
            None,
        ),
        other => {
            return Err(format!("unsupported output sample format {:?}", other));
        }
    }
    .map_err(|err| format!("failed to build output stream: {}", err))?;

    Ok((stream, sample_rate))
}
