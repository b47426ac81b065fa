pub mod opus;
pub mod resample;

#[cfg(feature = "host-audio")]
pub mod host;

use std::time::Duration;

/// One encoded frame. Moved from the encoder into the transport, never cloned.
pub type AudioPacket = Vec<u8>;

/// Decode queue budget; `300 / frame_duration` packets are retained.
pub const DECODE_QUEUE_WINDOW_MS: u32 = 300;

/// Capture reads this much audio per encode submission when no processor is configured.
pub const CAPTURE_CHUNK_MS: u32 = 30;

/// Output is powered down after this much continuous idle silence.
pub const OUTPUT_SILENCE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn decode_queue_capacity(frame_duration_ms: u32) -> usize {
    (DECODE_QUEUE_WINDOW_MS / frame_duration_ms.max(1)).max(1) as usize
}

pub fn samples_for(sample_rate: u32, duration_ms: u32) -> usize {
    (sample_rate as u64 * duration_ms as u64 / 1000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_matches_window() {
        assert_eq!(decode_queue_capacity(60), 5);
        assert_eq!(decode_queue_capacity(20), 15);
        assert_eq!(decode_queue_capacity(0), 300);
    }

    #[test]
    fn sample_counts() {
        assert_eq!(samples_for(16_000, 30), 480);
        assert_eq!(samples_for(16_000, 60), 960);
        assert_eq!(samples_for(24_000, 60), 1440);
    }
}
