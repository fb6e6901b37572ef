use anyhow::Result;

use crate::config::CaptureConfig;

use super::alsa_device::AlsaCapture;

/// Raw interleaved i16 input at the device's native rate.
pub trait CaptureDevice: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u32;
    /// Read interleaved samples into `buf`; returns frames read, which may be
    /// fewer than `buf` holds.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize>;
    /// Bring the device back after a read error such as an overrun.
    fn recover(&mut self) -> Result<()>;
}

/// Opens the capture device for a session once its decoder is ready.
pub trait CaptureOpener: Send + Sync {
    fn open(
        &self,
        config: &CaptureConfig,
        frames_per_read: usize,
    ) -> Result<Box<dyn CaptureDevice>>;
}

pub struct AlsaCaptureOpener;

impl CaptureOpener for AlsaCaptureOpener {
    fn open(
        &self,
        config: &CaptureConfig,
        frames_per_read: usize,
    ) -> Result<Box<dyn CaptureDevice>> {
        let capture = AlsaCapture::open(
            &config.device,
            config.sample_rate,
            config.channels,
            frames_per_read,
        )?;
        Ok(Box::new(capture))
    }
}
