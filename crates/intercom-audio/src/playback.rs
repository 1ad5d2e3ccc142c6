//! Speaker playback engine (CPAL output stream).
//!
//! The output callback pulls from the speaker [`FrameBuffer`] without
//! blocking, maps the mono call audio to however many channels the device
//! wants, and converts `f32` to the device sample format. Shortfalls are
//! filled with silence so the device never stalls on the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use tokio_util::sync::CancellationToken;

use intercom_types::SAMPLE_RATE_HZ;

use crate::buffer::FrameBuffer;
use crate::{AudioError, AudioSink, device};

const POLL: Duration = Duration::from_millis(50);

/// [`AudioSink`] backed by a CPAL output device.
pub struct CpalPlayback {
    device: Option<String>,
}

impl CpalPlayback {
    /// `device` is an optional substring to select the output device;
    /// `None` uses the host default.
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }

    /// Resolve the device and config once, without opening a stream.
    ///
    /// Stations call this at startup so a missing speaker is fatal before
    /// the first call rather than during it.
    pub fn probe(&self) -> Result<String, AudioError> {
        let host = cpal::default_host();
        let device = device::pick_output_device(&host, self.device.as_deref())?;
        device::pick_output_config(&device, SAMPLE_RATE_HZ)?;
        let desc = device
            .description()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
        Ok(desc.to_string())
    }
}

#[async_trait]
impl AudioSink for CpalPlayback {
    async fn run_playback(
        &self,
        buffer: Arc<FrameBuffer>,
        cancel: CancellationToken,
    ) -> Result<(), AudioError> {
        let hint = self.device.clone();
        let worker_buffer = buffer.clone();
        let joined =
            tokio::task::spawn_blocking(move || playback_session(hint, worker_buffer, cancel))
                .await;
        match joined {
            Ok(result) => result,
            Err(e) => {
                buffer.close();
                Err(AudioError::DeviceIo(format!("playback worker died: {e}")))
            }
        }
    }
}

/// Runs on a dedicated blocking thread; `cpal::Stream` is not `Send`.
fn playback_session(
    hint: Option<String>,
    buffer: Arc<FrameBuffer>,
    cancel: CancellationToken,
) -> Result<(), AudioError> {
    let result = run_stream(hint, &buffer, &cancel);
    // Closing the buffer is what lets a blocked producer and the peer's
    // drain logic observe end-of-data, so it happens on every exit path.
    buffer.close();
    result
}

fn run_stream(
    hint: Option<String>,
    buffer: &Arc<FrameBuffer>,
    cancel: &CancellationToken,
) -> Result<(), AudioError> {
    let host = cpal::default_host();
    let device = device::pick_output_device(&host, hint.as_deref())?;
    let config = device::pick_output_config(&device, SAMPLE_RATE_HZ)?;
    let stream_config: cpal::StreamConfig = config.clone().into();
    if let Ok(desc) = device.description() {
        tracing::info!(
            device = %desc,
            rate_hz = stream_config.sample_rate,
            channels = stream_config.channels,
            "speaker stream open"
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

    // Returning drops the stream and releases the device handle.
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if failed.load(Ordering::Relaxed) {
            return Err(AudioError::DeviceIo("output stream failed".into()));
        }
        if buffer.is_drained() {
            return Ok(());
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
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = (config.channels as usize).max(1);
    let buffer = buffer.clone();
    let mut mono: Vec<f32> = Vec::new();
    let underrun_warned = AtomicBool::new(false);

    let err_failed = failed;
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                let pulled = buffer.pull_now(&mut mono);
                for (i, out) in data.chunks_exact_mut(channels).enumerate() {
                    let sample = if i < pulled.samples { mono[i] } else { 0.0 };
                    for ch in out {
                        *ch = <T as cpal::Sample>::from_sample::<f32>(sample);
                    }
                }
                if pulled.samples < frames
                    && !pulled.end
                    && !underrun_warned.swap(true, Ordering::Relaxed)
                {
                    tracing::warn!(
                        queued_frames = buffer.len_frames(),
                        "speaker underrun: filling with silence"
                    );
                }
            },
            move |err| {
                tracing::warn!("output stream error: {err}");
                err_failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| AudioError::DeviceIo(e.to_string()))?;
    Ok(stream)
}
