//! Adapts captured audio into fixed 20 ms frames of 48 kHz stereo S16LE,
//! the format voice sinks consume.
//!
//! Pipeline per read: capture one block at the device rate → gain → mono
//! fan-out → (sinc resample) → S16LE bytes. The sink pulls frames on its
//! own cadence through a shared [`FrameSourceHandle`]; the session keeps
//! the right to release the source at any time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

use super::capture::CaptureDevice;
use super::resample::StereoResampler;

pub const OUTPUT_RATE: u32 = 48_000;
pub const OUTPUT_CHANNELS: usize = 2;
pub const FRAME_DURATION_MS: u32 = 20;
pub const GAIN: f32 = 0.8;

/// Interleaved samples in one output frame (960 frames × 2 channels).
pub const FRAME_SAMPLES: usize =
    (OUTPUT_RATE * FRAME_DURATION_MS / 1000) as usize * OUTPUT_CHANNELS;
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

const MAX_READ_ATTEMPTS: u32 = 3;
const MAX_BLOCKS_PER_FRAME: usize = 4;

/// Frames (per channel) covering one frame duration at `rate`.
pub fn frames_per_duration(rate: u32) -> usize {
    ((rate as u64 * FRAME_DURATION_MS as u64 + 500) / 1000) as usize
}

/// Scale by `gain` and bring any channel layout to interleaved stereo:
/// mono is duplicated, extra channels beyond two are dropped.
pub fn to_stereo(samples: &[i16], channels: usize, gain: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len() / channels.max(1) * 2);
    if channels <= 1 {
        for &s in samples {
            let v = s as f32 * gain;
            out.push(v);
            out.push(v);
        }
    } else {
        for frame in samples.chunks_exact(channels) {
            out.push(frame[0] as f32 * gain);
            out.push(frame[1] as f32 * gain);
        }
    }
    out
}

pub struct AudioFrameSource {
    capture: Box<dyn CaptureDevice>,
    input_rate: u32,
    channels: usize,
    input_frames: usize,
    gain: f32,
    read_buf: Vec<i16>,
    resampler: Option<StereoResampler>,
    pending: VecDeque<f32>,
    read_errors: u64,
}

impl AudioFrameSource {
    /// Takes ownership of an opened capture device. On error the device is
    /// dropped, and so closed, before returning.
    pub fn new(capture: Box<dyn CaptureDevice>) -> Result<Self> {
        let input_rate = capture.sample_rate();
        let channels = capture.channels() as usize;
        if input_rate == 0 || channels == 0 {
            bail!("capture device reported {}Hz / {} channels", input_rate, channels);
        }

        let input_frames = frames_per_duration(input_rate);
        let resampler = if input_rate != OUTPUT_RATE {
            log::info!("Using sinc resampler {}Hz -> {}Hz", input_rate, OUTPUT_RATE);
            Some(StereoResampler::new(input_rate, OUTPUT_RATE, input_frames)?)
        } else {
            log::info!("Capture already at {}Hz, not resampling", OUTPUT_RATE);
            None
        };

        Ok(Self {
            capture,
            input_rate,
            channels,
            input_frames,
            gain: GAIN,
            read_buf: vec![0; input_frames * channels],
            resampler,
            pending: VecDeque::with_capacity(FRAME_SAMPLES * 2),
            read_errors: 0,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    #[cfg(test)]
    pub fn read_errors(&self) -> u64 {
        self.read_errors
    }

    /// One output frame, always `FRAME_BYTES` long. Device faults are
    /// absorbed: whatever could not be read becomes silence.
    pub fn read(&mut self) -> Vec<u8> {
        let mut blocks = 0;
        while self.pending.len() < FRAME_SAMPLES && blocks < MAX_BLOCKS_PER_FRAME {
            let stereo = self.capture_block();
            match &mut self.resampler {
                Some(resampler) => {
                    let mut resampled = Vec::with_capacity(FRAME_SAMPLES + 64);
                    match resampler.process_interleaved(&stereo, &mut resampled) {
                        Ok(()) => self.pending.extend(resampled),
                        Err(e) => {
                            log::warn!("Resampling failed, emitting silence: {}", e);
                            self.pending.extend(std::iter::repeat_n(0.0, FRAME_SAMPLES));
                        }
                    }
                }
                None => self.pending.extend(stereo),
            }
            blocks += 1;
        }
        if self.pending.len() < FRAME_SAMPLES {
            self.pending.resize(FRAME_SAMPLES, 0.0);
        }

        let mut bytes = Vec::with_capacity(FRAME_BYTES);
        for sample in self.pending.drain(..FRAME_SAMPLES) {
            let value = sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Read one frame duration from the device, gain applied, as stereo.
    fn capture_block(&mut self) -> Vec<f32> {
        self.read_buf.fill(0);
        let wanted = self.input_frames;
        let mut filled = 0;
        let mut failures = 0;

        while filled < wanted && failures < MAX_READ_ATTEMPTS {
            let start = filled * self.channels;
            match self.capture.read(&mut self.read_buf[start..]) {
                Ok(0) => failures += 1,
                Ok(frames) => filled += frames.min(wanted - filled),
                Err(e) => {
                    failures += 1;
                    self.read_errors += 1;
                    if self.read_errors == 1 || self.read_errors % 100 == 0 {
                        log::warn!("Capture error #{}: {}, recovering...", self.read_errors, e);
                    }
                    if let Err(e2) = self.capture.recover() {
                        log::error!("{}", e2);
                        break;
                    }
                }
            }
        }

        to_stereo(&self.read_buf, self.channels, self.gain)
    }
}

impl Drop for AudioFrameSource {
    fn drop(&mut self) {
        log::info!(
            "Destroying frame source ({}Hz, {}ch, {} read errors)",
            self.input_rate,
            self.channels,
            self.read_errors
        );
    }
}

/// Shared pull handle given to the sink. The session releases the source
/// through it; afterwards every read returns `None`.
#[derive(Clone)]
pub struct FrameSourceHandle {
    inner: Arc<Mutex<Option<AudioFrameSource>>>,
}

impl FrameSourceHandle {
    pub fn new(source: AudioFrameSource) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(source))) }
    }

    pub fn read_frame(&self) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.as_mut().map(AudioFrameSource::read)
    }

    /// Drop the source, closing its device. Returns false if it was already
    /// released.
    pub fn release(&self) -> bool {
        let taken = self.inner.lock().unwrap_or_else(|p| p.into_inner()).take();
        let released = taken.is_some();
        drop(taken);
        released
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).is_none()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Constant-amplitude capture that counts reads and closes.
    pub(crate) struct FakeCapture {
        pub rate: u32,
        pub channels: u32,
        pub amplitude: i16,
        pub fail_every: Option<usize>,
        pub max_frames_per_read: usize,
        pub reads: Arc<AtomicUsize>,
        pub recoveries: Arc<AtomicUsize>,
        pub closes: Arc<AtomicUsize>,
    }

    impl FakeCapture {
        pub(crate) fn new(rate: u32, channels: u32, amplitude: i16) -> Self {
            Self {
                rate,
                channels,
                amplitude,
                fail_every: None,
                max_frames_per_read: usize::MAX,
                reads: Arc::new(AtomicUsize::new(0)),
                recoveries: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl CaptureDevice for FakeCapture {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn channels(&self) -> u32 {
            self.channels
        }

        fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(every) = self.fail_every {
                if n % every == 0 {
                    bail!("overrun");
                }
            }
            let frames = (buf.len() / self.channels as usize).min(self.max_frames_per_read);
            buf[..frames * self.channels as usize].fill(self.amplitude);
            Ok(frames)
        }

        fn recover(&mut self) -> Result<()> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Drop for FakeCapture {
        fn drop(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn samples(frame: &[u8]) -> Vec<i16> {
        frame
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn frame_constants() {
        assert_eq!(FRAME_SAMPLES, 1920);
        assert_eq!(FRAME_BYTES, 3840);
        assert_eq!(frames_per_duration(44_100), 882);
        assert_eq!(frames_per_duration(48_000), 960);
    }

    #[test]
    fn mono_fans_out_to_identical_channels() {
        let input = [100i16, -200, 300, 0, i16::MAX];
        let stereo = to_stereo(&input, 1, 1.0);
        assert_eq!(stereo.len(), input.len() * 2);
        for (i, frame) in stereo.chunks_exact(2).enumerate() {
            assert_eq!(frame[0], frame[1]);
            assert_eq!(frame[0], input[i] as f32);
        }
    }

    #[test]
    fn extra_channels_are_dropped() {
        let input = [1i16, 2, 3, 4, 5, 6];
        assert_eq!(to_stereo(&input, 3, 1.0), vec![1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn passthrough_applies_gain_only() {
        let capture = FakeCapture::new(48_000, 2, 10_000);
        let mut source = AudioFrameSource::new(Box::new(capture)).unwrap();
        assert!(!source.is_resampling());

        let frame = source.read();
        assert_eq!(frame.len(), FRAME_BYTES);
        assert!(samples(&frame).iter().all(|&s| s == 8_000));
    }

    #[test]
    fn mono_passthrough_is_duplicated() {
        let capture = FakeCapture::new(48_000, 1, -5_000);
        let mut source = AudioFrameSource::new(Box::new(capture)).unwrap();
        let pcm = samples(&source.read());
        assert_eq!(pcm.len(), FRAME_SAMPLES);
        for frame in pcm.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
            assert_eq!(frame[0], -4_000);
        }
    }

    #[test]
    fn resampled_frames_have_fixed_size_and_scaled_amplitude() {
        let capture = FakeCapture::new(44_100, 1, 10_000);
        let mut source = AudioFrameSource::new(Box::new(capture)).unwrap();
        assert!(source.is_resampling());

        let mut last = Vec::new();
        for _ in 0..25 {
            last = source.read();
            assert_eq!(last.len(), FRAME_BYTES);
        }
        for frame in samples(&last).chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
            let expected = 10_000.0 * GAIN;
            let err = (frame[0] as f32 - expected).abs() / expected;
            assert!(err < 0.02, "sample {} too far from {}", frame[0], expected);
        }
    }

    #[test]
    fn upsampling_from_16k_keeps_frame_size() {
        let capture = FakeCapture::new(16_000, 2, 1_000);
        let mut source = AudioFrameSource::new(Box::new(capture)).unwrap();
        for _ in 0..10 {
            assert_eq!(source.read().len(), FRAME_BYTES);
        }
    }

    #[test]
    fn short_reads_are_accumulated() {
        let mut capture = FakeCapture::new(48_000, 2, 1_000);
        capture.max_frames_per_read = 100;
        let reads = capture.reads.clone();
        let mut source = AudioFrameSource::new(Box::new(capture)).unwrap();
        let pcm = samples(&source.read());
        assert!(pcm.iter().all(|&s| s == 800));
        assert_eq!(reads.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn read_errors_are_tolerated() {
        let mut capture = FakeCapture::new(48_000, 1, 1_000);
        capture.fail_every = Some(1);
        let recoveries = capture.recoveries.clone();
        let mut source = AudioFrameSource::new(Box::new(capture)).unwrap();

        let frame = source.read();
        assert_eq!(frame.len(), FRAME_BYTES);
        assert!(samples(&frame).iter().all(|&s| s == 0));
        assert!(recoveries.load(Ordering::SeqCst) > 0);
        assert!(source.read_errors() > 0);
    }

    #[test]
    fn failed_construction_closes_device() {
        let capture = FakeCapture::new(48_000, 0, 0);
        let closes = capture.closes.clone();
        assert!(AudioFrameSource::new(Box::new(capture)).is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_closes_exactly_once() {
        let capture = FakeCapture::new(48_000, 2, 1_000);
        let closes = capture.closes.clone();
        let handle = FrameSourceHandle::new(AudioFrameSource::new(Box::new(capture)).unwrap());
        let sink_side = handle.clone();

        assert!(sink_side.read_frame().is_some());
        assert!(handle.release());
        assert!(!handle.release());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(sink_side.read_frame().is_none());
        assert!(sink_side.is_released());
    }
}
