use anyhow::{Result, anyhow};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Two-channel sinc resampler fed with fixed-size interleaved blocks. Filter
/// history lives in `inner`, so consecutive blocks join without clicks.
pub struct StereoResampler {
    inner: SincFixedIn<f32>,
    chunk_frames: usize,
    channels: [Vec<f32>; 2],
}

impl StereoResampler {
    pub fn new(input_rate: u32, output_rate: u32, chunk_frames: usize) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 || chunk_frames == 0 {
            return Err(anyhow!(
                "invalid resampler setup: {}Hz -> {}Hz, chunk {}",
                input_rate,
                output_rate,
                chunk_frames
            ));
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = output_rate as f64 / input_rate as f64;

        //           ratio,  drift, params, chunk_size, channels
        let inner = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_frames, 2)
            .map_err(|e| anyhow!("failed to construct sinc resampler: {e}"))?;

        Ok(Self {
            inner,
            chunk_frames,
            channels: [Vec::with_capacity(chunk_frames), Vec::with_capacity(chunk_frames)],
        })
    }

    /// Resample one block of `chunk_frames` interleaved stereo frames and
    /// append the interleaved result to `out`. Short blocks are padded with
    /// silence.
    pub fn process_interleaved(&mut self, interleaved: &[f32], out: &mut Vec<f32>) -> Result<()> {
        for channel in self.channels.iter_mut() {
            channel.clear();
        }
        for frame in interleaved.chunks_exact(2).take(self.chunk_frames) {
            self.channels[0].push(frame[0]);
            self.channels[1].push(frame[1]);
        }
        for channel in self.channels.iter_mut() {
            channel.resize(self.chunk_frames, 0.0);
        }

        let waves = self
            .inner
            .process(&self.channels[..], None)
            .map_err(|e| anyhow!("resampler process failed: {e}"))?;

        out.reserve(waves[0].len() * 2);
        for (left, right) in waves[0].iter().zip(waves[1].iter()) {
            out.push(*left);
            out.push(*right);
        }
        Ok(())
    }
}
