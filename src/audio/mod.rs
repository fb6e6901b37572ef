//! audio - Capture, resampling and playback for streamed sessions
//!
//! Pulls PCM from the ALSA loopback that a decoder plays into, converts it
//! to fixed 20 ms stereo frames at 48 kHz, and optionally plays those frames
//! on a local ALSA device.

mod alsa_device;
mod capture;
pub(crate) mod frame_source;
mod playback_sink;
mod resample;

pub use capture::{AlsaCaptureOpener, CaptureDevice, CaptureOpener};
pub use frame_source::{
    AudioFrameSource, FRAME_BYTES, FrameSourceHandle, frames_per_duration,
};
pub use playback_sink::LocalPlaybackSink;
