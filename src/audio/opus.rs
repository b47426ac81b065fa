//! Opus encode/decode service. The orchestrator only sees the traits so the
//! pipeline can run against in-memory codecs in tests.

use crate::audio::{AudioPacket, samples_for};
use crate::error::CodecError;

/// Encoder complexity used for realtime chat, where latency matters more than quality.
pub const REALTIME_COMPLEXITY: i32 = 0;
pub const DEFAULT_COMPLEXITY: i32 = 3;

pub trait SpeechEncoder: Send {
    /// Buffers `pcm` and returns every complete frame encoded so far.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<AudioPacket>, CodecError>;
    fn reset_state(&mut self);
    fn set_complexity(&mut self, complexity: i32) -> Result<(), CodecError>;
}

pub trait SpeechDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError>;
    fn reset_state(&mut self);
    fn sample_rate(&self) -> u32;
    fn frame_duration_ms(&self) -> u32;
}

pub trait CodecFactory: Send + Sync {
    fn encoder(
        &self,
        sample_rate: u32,
        channels: u16,
        frame_duration_ms: u32,
    ) -> Result<Box<dyn SpeechEncoder>, CodecError>;

    fn decoder(
        &self,
        sample_rate: u32,
        channels: u16,
        frame_duration_ms: u32,
    ) -> Result<Box<dyn SpeechDecoder>, CodecError>;
}

/// Splits an arbitrary PCM stream into fixed-size frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frame_size: usize,
    pending: Vec<i16>,
}

impl FrameBuffer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, pcm: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(pcm);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            frames.push(self.pending.drain(..self.frame_size).collect());
        }
        frames
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

pub struct OpusEncoder {
    encoder: ::opus::Encoder,
    frames: FrameBuffer,
    encode_buffer: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(sample_rate: u32, channels: u16, frame_duration_ms: u32) -> Result<Self, CodecError> {
        let encoder = ::opus::Encoder::new(sample_rate, opus_channels(channels)?, ::opus::Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        let frame_size = samples_for(sample_rate, frame_duration_ms) * channels as usize;
        Ok(Self {
            encoder,
            frames: FrameBuffer::new(frame_size),
            encode_buffer: vec![0u8; 4000],
        })
    }
}

impl SpeechEncoder for OpusEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<AudioPacket>, CodecError> {
        let mut packets = Vec::new();
        for frame in self.frames.push(pcm) {
            let size = self
                .encoder
                .encode(&frame, &mut self.encode_buffer)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            packets.push(self.encode_buffer[..size].to_vec());
        }
        Ok(packets)
    }

    fn reset_state(&mut self) {
        self.frames.clear();
        if let Err(err) = self.encoder.reset_state() {
            tracing::warn!("opus encoder reset failed: {}", err);
        }
    }

    fn set_complexity(&mut self, complexity: i32) -> Result<(), CodecError> {
        self.encoder
            .set_complexity(complexity)
            .map_err(|e| CodecError::EncoderInit(format!("failed to set complexity: {}", e)))
    }
}

pub struct OpusDecoder {
    decoder: ::opus::Decoder,
    sample_rate: u32,
    channels: u16,
    frame_duration_ms: u32,
    decode_buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16, frame_duration_ms: u32) -> Result<Self, CodecError> {
        let decoder = ::opus::Decoder::new(sample_rate, opus_channels(channels)?)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;
        // 120 ms is the longest frame opus produces.
        let decode_buffer = vec![0i16; samples_for(sample_rate, 120) * channels as usize];
        Ok(Self {
            decoder,
            sample_rate,
            channels,
            frame_duration_ms,
            decode_buffer,
        })
    }
}

impl SpeechDecoder for OpusDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        let samples = self
            .decoder
            .decode(packet, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let total = samples * self.channels as usize;
        Ok(self.decode_buffer[..total].to_vec())
    }

    fn reset_state(&mut self) {
        if let Err(err) = self.decoder.reset_state() {
            tracing::warn!("opus decoder reset failed: {}", err);
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame_duration_ms(&self) -> u32 {
        self.frame_duration_ms
    }
}

fn opus_channels(channels: u16) -> Result<::opus::Channels, CodecError> {
    match channels {
        1 => Ok(::opus::Channels::Mono),
        2 => Ok(::opus::Channels::Stereo),
        other => Err(CodecError::EncoderInit(format!(
            "unsupported channel count: {}",
            other
        ))),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpusCodecs;

impl CodecFactory for OpusCodecs {
    fn encoder(
        &self,
        sample_rate: u32,
        channels: u16,
        frame_duration_ms: u32,
    ) -> Result<Box<dyn SpeechEncoder>, CodecError> {
        Ok(Box::new(OpusEncoder::new(sample_rate, channels, frame_duration_ms)?))
    }

    fn decoder(
        &self,
        sample_rate: u32,
        channels: u16,
        frame_duration_ms: u32,
    ) -> Result<Box<dyn SpeechDecoder>, CodecError> {
        Ok(Box::new(OpusDecoder::new(sample_rate, channels, frame_duration_ms)?))
    }
}
