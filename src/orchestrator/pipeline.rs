//! Capture and playback loops plus the codec state they share with the
//! control loop. Codec work always runs on the work queue; the loops only
//! move packets and PCM around.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::assets::read_p3;
use crate::audio::opus::{
    CodecFactory, DEFAULT_COMPLEXITY, REALTIME_COMPLEXITY, SpeechDecoder, SpeechEncoder,
};
use crate::audio::resample::{CaptureNormalizer, LinearResampler};
use crate::audio::{
    AudioPacket, CAPTURE_CHUNK_MS, OUTPUT_SILENCE_TIMEOUT, decode_queue_capacity, samples_for,
};
use crate::collaborators::{AudioCodec, AudioProcessor, WakeWordDetector};
use crate::error::{AssetError, StartupError};
use crate::protocol::{CAPTURE_SAMPLE_RATE, DeviceState, FRAME_DURATION_MS};
use crate::queue::{Overflow, SignalQueue};
use crate::transport::ChannelStatus;
use crate::work_queue::WorkQueue;

use super::StateCell;

const WORK_QUEUE_NAME: &str = "audio-work";
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Receives each encoded capture packet, from the work queue thread.
pub type PacketSink = Arc<dyn Fn(AudioPacket) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStep {
    /// A decode is still running.
    Busy,
    /// Nothing queued.
    Idle,
    /// Nothing queued for too long while idle; output switched off.
    PoweredDown,
    /// Listening: queued reply audio was thrown away.
    Discarded(usize),
    /// One packet handed to the work queue.
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStep {
    WakeWord,
    Processor,
    Encode,
    Idle,
}

struct DecoderSlot {
    decoder: Box<dyn SpeechDecoder>,
    resampler: Option<LinearResampler>,
}

pub struct AudioPipeline {
    codec: Arc<dyn AudioCodec>,
    codecs: Arc<dyn CodecFactory>,
    wake_word: Option<Arc<dyn WakeWordDetector>>,
    processor: Option<Arc<dyn AudioProcessor>>,
    cell: Arc<StateCell>,
    decode_queue: SignalQueue<AudioPacket>,
    decoder: Mutex<DecoderSlot>,
    encoder: Mutex<Box<dyn SpeechEncoder>>,
    work: Mutex<Option<WorkQueue>>,
    busy_decoding: AtomicBool,
    aborted: AtomicBool,
    running: AtomicBool,
    last_output: Mutex<Instant>,
    channel: Mutex<Option<Arc<ChannelStatus>>>,
    packet_sink: PacketSink,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AudioPipeline {
    pub fn new(
        codec: Arc<dyn AudioCodec>,
        codecs: Arc<dyn CodecFactory>,
        wake_word: Option<Arc<dyn WakeWordDetector>>,
        processor: Option<Arc<dyn AudioProcessor>>,
        cell: Arc<StateCell>,
        realtime_chat: bool,
        packet_sink: PacketSink,
    ) -> Result<Arc<Self>, StartupError> {
        let decoder = codecs.decoder(codec.output_sample_rate(), 1, FRAME_DURATION_MS)?;
        let mut encoder = codecs.encoder(CAPTURE_SAMPLE_RATE, 1, FRAME_DURATION_MS)?;
        let complexity = if realtime_chat {
            REALTIME_COMPLEXITY
        } else {
            DEFAULT_COMPLEXITY
        };
        encoder.set_complexity(complexity)?;

        Ok(Arc::new(Self {
            codec,
            codecs,
            wake_word,
            processor,
            cell,
            decode_queue: SignalQueue::bounded(decode_queue_capacity(FRAME_DURATION_MS)),
            decoder: Mutex::new(DecoderSlot {
                decoder,
                resampler: None,
            }),
            encoder: Mutex::new(encoder),
            work: Mutex::new(Some(WorkQueue::new(WORK_QUEUE_NAME)?)),
            busy_decoding: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_output: Mutex::new(Instant::now()),
            channel: Mutex::new(None),
            packet_sink,
            threads: Mutex::new(Vec::new()),
        }))
    }

    pub fn set_channel(&self, status: Arc<ChannelStatus>) {
        *self.channel.lock() = Some(status);
    }

    pub fn set_aborted(&self, aborted: bool) {
        self.aborted.store(aborted, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn queued_packets(&self) -> usize {
        self.decode_queue.len()
    }

    fn work_queue(&self) -> Option<WorkQueue> {
        self.work.lock().clone()
    }

    /// Completion barrier over all codec work submitted so far.
    pub fn wait_for_work(&self) {
        if let Some(work) = self.work_queue() {
            work.wait_for_completion();
        }
    }

    /// Drains the work queue, tears it down and starts a fresh one.
    pub fn restart_work_queue(&self) -> std::io::Result<()> {
        let old = self.work.lock().take();
        if let Some(old) = old {
            old.wait_for_completion();
            old.shutdown();
        }
        let fresh = WorkQueue::new(WORK_QUEUE_NAME)?;
        *self.work.lock() = Some(fresh);
        Ok(())
    }

    /// Inbound audio from the transport, accepted in any state and dropped
    /// once the queue holds its window's worth of packets. Stale reply audio
    /// is discarded by the playback loop while listening.
    pub fn push_network_audio(&self, packet: AudioPacket) -> bool {
        let accepted = self.decode_queue.push(packet, Overflow::DropNewest);
        if !accepted {
            tracing::trace!("decode queue full; packet dropped");
        }
        accepted
    }

    pub fn clear_queue(&self) {
        self.decode_queue.clear();
    }

    pub fn reset_decoder(&self) {
        self.decoder.lock().decoder.reset_state();
        self.decode_queue.clear();
        *self.last_output.lock() = Instant::now();
        self.codec.enable_output(true);
    }

    pub fn reset_encoder(&self) {
        self.encoder.lock().reset_state();
    }

    /// Rebuilds the decoder for a new stream format, adding a resampler when
    /// the stream rate differs from the output device.
    pub fn set_decode_format(&self, sample_rate: u32, frame_duration_ms: u32) {
        let mut slot = self.decoder.lock();
        if slot.decoder.sample_rate() == sample_rate
            && slot.decoder.frame_duration_ms() == frame_duration_ms
        {
            return;
        }
        match self.codecs.decoder(sample_rate, 1, frame_duration_ms) {
            Ok(decoder) => slot.decoder = decoder,
            Err(err) => {
                tracing::error!("failed to create decoder for {} Hz: {}", sample_rate, err);
                return;
            }
        }
        let output_rate = self.codec.output_sample_rate();
        slot.resampler = if sample_rate != output_rate {
            tracing::info!("resampling playback from {} to {}", sample_rate, output_rate);
            Some(LinearResampler::new(sample_rate, output_rate, 1))
        } else {
            None
        };
    }

    /// Queues a sound cue behind whatever is still playing. Blocks until the
    /// previous audio has drained; cues are never truncated by the window.
    pub fn enqueue_sound(&self, data: &[u8]) -> Result<usize, AssetError> {
        let packets = read_p3(data)?;
        self.codec.enable_output(true);
        self.decode_queue.wait_until_empty();
        self.wait_for_work();
        self.set_decode_format(CAPTURE_SAMPLE_RATE, FRAME_DURATION_MS);
        let count = packets.len();
        for packet in packets {
            if !self.decode_queue.push(packet, Overflow::Block) {
                break;
            }
        }
        Ok(count)
    }

    /// One pass of the playback loop.
    pub fn playback_step(self: &Arc<Self>, now: Instant) -> PlaybackStep {
        if self.busy_decoding.load(Ordering::SeqCst) {
            return PlaybackStep::Busy;
        }

        let state = self.cell.get();
        if state == DeviceState::Listening {
            let discarded = self.decode_queue.take_all().len();
            return PlaybackStep::Discarded(discarded);
        }

        let Some(packet) = self.decode_queue.pop() else {
            if state == DeviceState::Idle {
                let silent = now.saturating_duration_since(*self.last_output.lock());
                if silent > OUTPUT_SILENCE_TIMEOUT && self.codec.output_enabled() {
                    tracing::debug!("output idle for {} seconds; powering down", silent.as_secs());
                    self.codec.enable_output(false);
                    return PlaybackStep::PoweredDown;
                }
            }
            return PlaybackStep::Idle;
        };

        let Some(work) = self.work_queue() else {
            tracing::debug!("work queue unavailable; packet dropped");
            return PlaybackStep::Idle;
        };

        self.busy_decoding.store(true, Ordering::SeqCst);
        let pipeline = self.clone();
        work.submit(move || {
            pipeline.decode_and_play(&packet);
            pipeline.busy_decoding.store(false, Ordering::SeqCst);
        });
        PlaybackStep::Submitted
    }

    fn decode_and_play(&self, packet: &[u8]) {
        if self.is_aborted() {
            return;
        }
        let pcm = {
            let mut slot = self.decoder.lock();
            let pcm = match slot.decoder.decode(packet) {
                Ok(pcm) => pcm,
                Err(err) => {
                    tracing::warn!("failed to decode audio: {}", err);
                    return;
                }
            };
            match slot.resampler.as_mut() {
                Some(resampler) => resampler.process(&pcm),
                None => pcm,
            }
        };
        self.codec.output_data(&pcm);
        *self.last_output.lock() = Instant::now();
    }

    /// Hands captured 16 kHz PCM to the encoder, unless the channel is still
    /// busy sending, in which case the chunk is dropped.
    pub fn submit_encode(self: &Arc<Self>, pcm: Vec<i16>) {
        let Some(work) = self.work_queue() else {
            return;
        };
        let pipeline = self.clone();
        work.submit(move || {
            if pipeline.channel_busy() {
                return;
            }
            let packets = match pipeline.encoder.lock().encode(&pcm) {
                Ok(packets) => packets,
                Err(err) => {
                    tracing::warn!("failed to encode audio: {}", err);
                    return;
                }
            };
            for packet in packets {
                (pipeline.packet_sink)(packet);
            }
        });
    }

    fn channel_busy(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .is_some_and(|status| status.is_busy())
    }

    /// One pass of the capture loop: feed the active consumer.
    pub fn capture_step(self: &Arc<Self>, normalizer: &mut CaptureNormalizer) -> CaptureStep {
        if let Some(wake_word) = self.wake_word.as_ref().filter(|w| w.is_detection_running()) {
            if let Some(pcm) = self.read_audio(normalizer, wake_word.feed_size()) {
                wake_word.feed(&pcm);
            }
            return CaptureStep::WakeWord;
        }
        if let Some(processor) = self.processor.as_ref().filter(|p| p.is_running()) {
            if let Some(pcm) = self.read_audio(normalizer, processor.feed_size()) {
                processor.feed(&pcm);
            }
            return CaptureStep::Processor;
        }
        if self.processor.is_none() && self.cell.get() == DeviceState::Listening {
            let samples = samples_for(CAPTURE_SAMPLE_RATE, CAPTURE_CHUNK_MS);
            if let Some(pcm) = self.read_audio(normalizer, samples) {
                self.submit_encode(pcm);
            }
            return CaptureStep::Encode;
        }
        CaptureStep::Idle
    }

    fn read_audio(&self, normalizer: &mut CaptureNormalizer, samples: usize) -> Option<Vec<i16>> {
        let mut raw = vec![0i16; normalizer.raw_len_for(samples)];
        if !self.codec.input_data(&mut raw) {
            return None;
        }
        Some(normalizer.process(&raw))
    }

    pub fn spawn_threads(self: &Arc<Self>) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let capture = {
            let pipeline = self.clone();
            thread::Builder::new()
                .name("audio-capture".to_string())
                .spawn(move || pipeline.capture_loop())?
        };
        let playback = {
            let pipeline = self.clone();
            thread::Builder::new()
                .name("audio-playback".to_string())
                .spawn(move || pipeline.playback_loop())?
        };
        self.threads.lock().extend([capture, playback]);
        Ok(())
    }

    fn capture_loop(self: Arc<Self>) {
        let mut normalizer = CaptureNormalizer::new(
            self.codec.input_sample_rate(),
            self.codec.input_channels(),
            CAPTURE_SAMPLE_RATE,
        );
        if normalizer.needs_resampling() {
            tracing::info!(
                "resampling capture from {} to {}",
                self.codec.input_sample_rate(),
                CAPTURE_SAMPLE_RATE
            );
        }
        let idle = Duration::from_millis(CAPTURE_CHUNK_MS as u64);
        while self.running.load(Ordering::SeqCst) {
            if self.capture_step(&mut normalizer) == CaptureStep::Idle {
                thread::sleep(idle);
            }
        }
        tracing::debug!("capture loop stopped");
    }

    fn playback_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if !self.codec.output_enabled() {
                thread::sleep(IDLE_POLL);
                continue;
            }
            if self.playback_step(Instant::now()) != PlaybackStep::Submitted {
                thread::sleep(IDLE_POLL);
            }
        }
        tracing::debug!("playback loop stopped");
    }

    /// Stops both loops and the work queue. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.decode_queue.close();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("audio thread panicked");
            }
        }
        let work = self.work.lock().take();
        if let Some(work) = work {
            work.shutdown();
        }
    }
}
