//! ALSA PCM devices: the capture side of the frame source and the playback
//! side of the local sink.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::capture::CaptureDevice;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)
            .with_context(|| format!("Failed to apply hw params on '{}'", device))?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

/// Capture stream read by the frame source. Dropping it closes the device.
pub struct AlsaCapture {
    device: String,
    pcm: PCM,
    params: AlsaParams,
}

impl AlsaCapture {
    /// `frames_per_read` becomes the period size so one read is one frame.
    pub fn open(
        device: &str,
        sample_rate: u32,
        channels: u32,
        frames_per_read: usize,
    ) -> Result<Self> {
        let (pcm, params) =
            open_pcm(device, Direction::Capture, sample_rate, channels, Some(frames_per_read))?;
        pcm.prepare().context("Failed to prepare capture device")?;
        Ok(Self { device: device.to_string(), pcm, params })
    }
}

impl CaptureDevice for AlsaCapture {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn channels(&self) -> u32 {
        self.params.channels
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        let io = self.pcm.io_i16()?;
        Ok(io.readi(buf)?)
    }

    fn recover(&mut self) -> Result<()> {
        self.pcm.prepare().context("Failed to recover PCM capture")?;
        Ok(())
    }
}

impl Drop for AlsaCapture {
    fn drop(&mut self) {
        log::info!("Closing capture device '{}'", self.device);
    }
}

/// Playback stream used by the local sink.
pub struct AlsaPlayback {
    pcm: PCM,
    params: AlsaParams,
}

impl AlsaPlayback {
    pub fn open(
        device: &str,
        sample_rate: u32,
        channels: u32,
        period_size: Option<usize>,
    ) -> Result<Self> {
        let (pcm, params) =
            open_pcm(device, Direction::Playback, sample_rate, channels, period_size)?;
        Ok(Self { pcm, params })
    }

    pub fn params(&self) -> &AlsaParams {
        &self.params
    }

    /// Write all interleaved samples, recovering from XRUNs. Gives up after
    /// three consecutive failed recoveries.
    pub fn write_all(&self, samples: &[i16]) -> Result<()> {
        let io = self.pcm.io_i16()?;
        let channels = self.params.channels as usize;
        let total_frames = samples.len() / channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&samples[offset..total_frames * channels]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    self.pcm.prepare().context("Failed to recover PCM playback")?;
                    if retry_count >= 3 {
                        anyhow::bail!(
                            "playback kept failing, dropped {} frames",
                            total_frames - frames_written
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn drain(&self) {
        if let Err(e) = self.pcm.drain() {
            log::debug!("PCM drain failed: {}", e);
        }
    }
}
