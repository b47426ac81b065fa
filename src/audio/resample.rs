/// Streaming linear-interpolation resampler over interleaved `i16` frames.
///
/// Keeps the tail of the previous block so consecutive calls interpolate
/// across block boundaries.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    pos: f32,
    carry: Vec<f32>,
}

impl LinearResampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Self {
        Self {
            input_rate,
            output_rate,
            channels: channels.max(1),
            pos: 0.0,
            carry: Vec::new(),
        }
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.carry.clear();
    }

    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if input.is_empty() {
            return Vec::new();
        }
        if self.input_rate == self.output_rate {
            return input.to_vec();
        }

        let mut combined = Vec::with_capacity(self.carry.len() + input.len());
        combined.extend_from_slice(&self.carry);
        combined.extend(input.iter().map(|s| *s as f32));

        let total_frames = combined.len() / self.channels;
        if total_frames < 2 {
            self.carry = combined;
            return Vec::new();
        }

        let step = self.input_rate as f32 / self.output_rate as f32;
        let mut output = Vec::new();
        let mut pos = self.pos;

        while pos + 1.0 < total_frames as f32 {
            let base = pos.floor() as usize;
            let frac = pos - base as f32;
            let idx0 = base * self.channels;
            let idx1 = (base + 1) * self.channels;
            for ch in 0..self.channels {
                let s0 = combined[idx0 + ch];
                let s1 = combined[idx1 + ch];
                output.push(to_i16(s0 + (s1 - s0) * frac));
            }
            pos += step;
        }

        let keep_frame = pos.floor() as usize;
        let keep_index = (keep_frame * self.channels).min(combined.len());
        self.carry = combined[keep_index..].to_vec();
        self.pos = pos - keep_frame as f32;
        output
    }
}

fn to_i16(sample: f32) -> i16 {
    sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn convert_channels(input: &[i16], input_channels: usize, output_channels: usize) -> Vec<i16> {
    if input_channels == output_channels || input_channels == 0 {
        return input.to_vec();
    }

    let frames = input.len() / input_channels;
    let mut output = Vec::with_capacity(frames * output_channels);

    for frame in 0..frames {
        let start = frame * input_channels;
        let frame_slice = &input[start..start + input_channels];
        if output_channels == 1 {
            let sum: i32 = frame_slice.iter().map(|s| *s as i32).sum();
            output.push((sum / input_channels as i32) as i16);
        } else if input_channels == 1 {
            output.extend(std::iter::repeat_n(frame_slice[0], output_channels));
        } else {
            for ch in 0..output_channels {
                output.push(frame_slice[ch.min(input_channels - 1)]);
            }
        }
    }

    output
}

/// Normalises raw capture frames to 16 kHz. With a second (reference/echo)
/// channel the two channels are split, resampled independently and
/// re-interleaved so the reference stays aligned with the microphone.
#[derive(Debug)]
pub struct CaptureNormalizer {
    input_rate: u32,
    target_rate: u32,
    input_channels: usize,
    mic: LinearResampler,
    reference: LinearResampler,
}

impl CaptureNormalizer {
    pub fn new(input_rate: u32, input_channels: usize, target_rate: u32) -> Self {
        Self {
            input_rate,
            target_rate,
            input_channels: input_channels.max(1),
            mic: LinearResampler::new(input_rate, target_rate, 1),
            reference: LinearResampler::new(input_rate, target_rate, 1),
        }
    }

    pub fn needs_resampling(&self) -> bool {
        self.input_rate != self.target_rate
    }

    /// Raw samples to request from the device for `samples` output samples per channel.
    pub fn raw_len_for(&self, samples: usize) -> usize {
        let per_channel = samples as u64 * self.input_rate as u64 / self.target_rate.max(1) as u64;
        per_channel as usize * self.input_channels
    }

    pub fn process(&mut self, raw: &[i16]) -> Vec<i16> {
        if !self.needs_resampling() {
            return raw.to_vec();
        }
        if self.input_channels == 2 {
            let (mic, reference) = deinterleave(raw);
            let mic = self.mic.process(&mic);
            let reference = self.reference.process(&reference);
            interleave(&mic, &reference)
        } else {
            self.mic.process(raw)
        }
    }
}

pub fn deinterleave(data: &[i16]) -> (Vec<i16>, Vec<i16>) {
    let frames = data.len() / 2;
    let mut left = Vec::with_capacity(frames);
    let mut right = Vec::with_capacity(frames);
    for frame in data.chunks_exact(2) {
        left.push(frame[0]);
        right.push(frame[1]);
    }
    (left, right)
}

pub fn interleave(left: &[i16], right: &[i16]) -> Vec<i16> {
    let frames = left.len().min(right.len());
    let mut output = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        output.push(left[i]);
        output.push(right[i]);
    }
    output
}
