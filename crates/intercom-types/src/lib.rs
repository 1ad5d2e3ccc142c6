//! Shared primitives for the intercom crates.

/// Project-wide sample rate for all call audio.
pub const SAMPLE_RATE_HZ: u32 = 8_000;

/// Nominal samples per frame (~200 ms at 8 kHz).
pub const FRAME_SAMPLES: usize = 1_600;

/// One block of mono `f32` PCM samples.
///
/// Frames carry no timestamp; ordering is whatever the carrying stream
/// delivers. The empty frame doubles as the call handshake sentinel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    /// The handshake sentinel: a frame with no samples.
    pub fn handshake() -> Self {
        Self::default()
    }

    pub fn is_handshake(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Vec<f32>> for AudioFrame {
    fn from(samples: Vec<f32>) -> Self {
        Self::new(samples)
    }
}
