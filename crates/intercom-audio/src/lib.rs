//! Audio engines and buffering for intercom calls.
//!
//! ## Pipeline
//! Each call direction is bridged by a [`FrameBuffer`]:
//! - speaker side: the network receive task pushes frames, the CPAL output
//!   callback pulls samples without blocking (underruns become silence)
//! - mic side: the CPAL input callback pushes frames without blocking
//!   (overflow drops the oldest frame), the network send task pulls
//!
//! The CPAL stream itself lives on a dedicated blocking thread because the
//! stream handle is not `Send`; cancellation is observed on a short tick.

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use buffer::{FrameBuffer, Pulled};
pub use capture::CpalCapture;
pub use playback::CpalPlayback;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no usable audio device: {0}")]
    DeviceUnavailable(String),
    #[error("audio device i/o: {0}")]
    DeviceIo(String),
    #[error("audio buffer closed")]
    BufferClosed,
}

/// Playback engine: drains a speaker buffer into an output device.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `buffer` until `cancel` fires or the buffer is closed and
    /// drained. Closes the buffer and releases the device on every exit
    /// path, so a pending drain can always complete.
    async fn run_playback(
        &self,
        buffer: Arc<FrameBuffer>,
        cancel: CancellationToken,
    ) -> Result<(), AudioError>;
}

/// Capture engine: fills a mic buffer from an input device.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Record into `buffer` until `cancel` fires. Closes the buffer and
    /// releases the device on every exit path.
    async fn run_capture(
        &self,
        buffer: Arc<FrameBuffer>,
        cancel: CancellationToken,
    ) -> Result<(), AudioError>;
}
