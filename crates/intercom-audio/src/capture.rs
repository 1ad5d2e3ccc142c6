//! Microphone capture engine (CPAL input stream).
//!
//! The input callback downmixes the device channels to mono `f32`, chunks
//! the result into project-size frames, and pushes them into the mic
//! [`FrameBuffer`] without blocking. Overflow drops the oldest frame; the
//! total is logged when the stream closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use tokio_util::sync::CancellationToken;

use intercom_types::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE_HZ};

use crate::buffer::FrameBuffer;
use crate::{AudioError, AudioSource, device};

const POLL: Duration = Duration::from_millis(50);

/// [`AudioSource`] backed by a CPAL input device.
pub struct CpalCapture {
    device: Option<String>,
}

impl CpalCapture {
    /// `device` is an optional substring to select the input device;
    /// `None` uses the host default.
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }

    /// Resolve the device and config once, without opening a stream.
    pub fn probe(&self) -> Result<String, AudioError> {
        let host = cpal::default_host();
        let device = device::pick_input_device(&host, self.device.as_deref())?;
        device::pick_input_config(&device, SAMPLE_RATE_HZ)?;
        let desc = device
            .description()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
        Ok(desc.to_string())
    }
}

#[async_trait]
impl AudioSource for CpalCapture {
    async fn run_capture(
        &self,
        buffer: Arc<FrameBuffer>,
        cancel: CancellationToken,
    ) -> Result<(), AudioError> {
        let hint = self.device.clone();
        let worker_buffer = buffer.clone();
        let joined =
            tokio::task::spawn_blocking(move || capture_session(hint, worker_buffer, cancel)).await;
        match joined {
            Ok(result) => result,
            Err(e) => {
                buffer.close();
                Err(AudioError::DeviceIo(format!("capture worker died: {e}")))
            }
        }
    }
}

/// Runs on a dedicated blocking thread; `cpal::Stream` is not `Send`.
fn capture_session(
    hint: Option<String>,
    buffer: Arc<FrameBuffer>,
    cancel: CancellationToken,
) -> Result<(), AudioError> {
    let result = run_stream(hint, &buffer, &cancel);
    buffer.close();
    if buffer.dropped_frames() > 0 {
        tracing::warn!(
            dropped_frames = buffer.dropped_frames(),
            "mic frames dropped on overflow"
        );
    }
    result
}

fn run_stream(
    hint: Option<String>,
    buffer: &Arc<FrameBuffer>,
    cancel: &CancellationToken,
) -> Result<(), AudioError> {
    let host = cpal::default_host();
    let device = device::pick_input_device(&host, hint.as_deref())?;
    let config = device::pick_input_config(&device, SAMPLE_RATE_HZ)?;
    let stream_config: cpal::StreamConfig = config.clone().into();
    if let Ok(desc) = device.description() {
        tracing::info!(
            device = %desc,
            rate_hz = stream_config.sample_rate,
            channels = stream_config.channels,
            "mic stream open"
        );
    }

    let failed = Arc::new(AtomicBool::new(false));
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &stream_config, buffer, failed.clone())
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(&device, &stream_config, buffer, failed.clone())
        }
        cpal::SampleFormat::I32 => {
            build_stream::<i32>(&device, &stream_config, buffer, failed.clone())
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(&device, &stream_config, buffer, failed.clone())
        }
        other => Err(AudioError::DeviceUnavailable(format!(
            "unsupported sample format: {other:?}"
        ))),
    }?;
    stream
        .play()
        .map_err(|e| AudioError::DeviceIo(e.to_string()))?;

    // Record until the call ends. Returning drops the stream and releases
    // the device handle.
    loop {
        if cancel.is_cancelled() || buffer.is_closed() {
            return Ok(());
        }
        if failed.load(Ordering::Relaxed) {
            return Err(AudioError::DeviceIo("input stream failed".into()));
        }
        thread::sleep(POLL);
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffer: &Arc<FrameBuffer>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = (config.channels as usize).max(1);
    let buffer = buffer.clone();
    let mut pending: Vec<f32> = Vec::with_capacity(2 * FRAME_SAMPLES);

    let err_failed = failed;
    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                for frame in data.chunks(channels) {
                    let mut acc = 0.0f32;
                    for s in frame {
                        acc += <f32 as cpal::Sample>::from_sample::<T>(*s);
                    }
                    pending.push(acc / channels as f32);
                }
                while pending.len() >= FRAME_SAMPLES {
                    let samples: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                    if buffer.try_push(AudioFrame::new(samples)).is_err() {
                        // Buffer closed: the call is over, stop chunking.
                        pending.clear();
                        return;
                    }
                }
            },
            move |err| {
                tracing::warn!("input stream error: {err}");
                err_failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| AudioError::DeviceIo(e.to_string()))?;
    Ok(stream)
}
