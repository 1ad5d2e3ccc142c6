//! Bounded frame queue bridging push-side and pull-side audio.
//!
//! ## Design
//! - **Bounded** by a frame capacity to cap memory and latency under
//!   backpressure.
//! - A `done` flag is stored under the same mutex as the queue so close and
//!   data operations cannot race.
//! - Pull preserves frame boundaries across mismatched slice sizes via a
//!   `carry` of leftover samples; at rest `carry` is always shorter than one
//!   frame because it is only refilled from a single popped frame.
//! - Async waiters park on `tokio::sync::Notify`; the real-time device
//!   callbacks use the non-blocking `pull_now`/`try_push` instead.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use intercom_types::AudioFrame;

use crate::AudioError;

/// How long a pull waits on an empty queue before reporting end-of-data.
/// A stall this long means the producer has died silently.
pub const DEFAULT_STALL: Duration = Duration::from_secs(5);

/// Result of a pull: how many samples were copied, and whether the buffer is
/// finished (closed and fully drained, or stalled past the bounded wait).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulled {
    pub samples: usize,
    pub end: bool,
}

pub struct FrameBuffer {
    capacity: usize,
    stall: Duration,
    inner: Mutex<Inner>,
    data_ready: Notify,
    space_ready: Notify,
    dropped: AtomicU64,
}

struct Inner {
    frames: VecDeque<AudioFrame>,
    carry: Vec<f32>,
    done: bool,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_stall(capacity, DEFAULT_STALL)
    }

    pub fn with_stall(capacity: usize, stall: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            stall,
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                carry: Vec::new(),
                done: false,
            }),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue one frame, waiting cooperatively while the queue is full.
    ///
    /// Fails with [`AudioError::BufferClosed`] once [`close`](Self::close)
    /// has been called; a close while waiting also fails the push.
    pub async fn push(&self, frame: AudioFrame) -> Result<(), AudioError> {
        let mut frame = frame;
        loop {
            let notified = self.space_ready.notified();
            {
                let mut g = self.inner.lock().unwrap();
                if g.done {
                    return Err(AudioError::BufferClosed);
                }
                if g.frames.len() < self.capacity {
                    g.frames.push_back(std::mem::take(&mut frame));
                    drop(g);
                    self.data_ready.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Non-blocking push for the capture callback: on a full queue the
    /// oldest frame is dropped so capture latency stays bounded.
    pub fn try_push(&self, frame: AudioFrame) -> Result<(), AudioError> {
        let mut g = self.inner.lock().unwrap();
        if g.done {
            return Err(AudioError::BufferClosed);
        }
        if g.frames.len() >= self.capacity {
            g.frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        g.frames.push_back(frame);
        drop(g);
        self.data_ready.notify_waiters();
        Ok(())
    }

    /// Fill `buf` with as many samples as are available: first the carry,
    /// then at most one queued frame (the remainder becomes the new carry).
    ///
    /// Waits only when nothing is immediately available, bounded by the
    /// stall window; a timeout reports end-of-data rather than deadlocking.
    /// Partial fills are returned as-is so the consumer can keep pace.
    pub async fn pull(&self, buf: &mut [f32]) -> Pulled {
        if buf.is_empty() {
            let g = self.inner.lock().unwrap();
            return Pulled {
                samples: 0,
                end: drained(&g),
            };
        }
        let deadline = tokio::time::Instant::now() + self.stall;
        loop {
            let notified = self.data_ready.notified();
            {
                let mut g = self.inner.lock().unwrap();
                let copied = fill_from(&mut g, buf);
                if copied > 0 {
                    let end = drained(&g);
                    drop(g);
                    self.space_ready.notify_waiters();
                    return Pulled {
                        samples: copied,
                        end,
                    };
                }
                if g.done {
                    return Pulled {
                        samples: 0,
                        end: true,
                    };
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Pulled {
                    samples: 0,
                    end: true,
                };
            }
        }
    }

    /// Non-blocking pull for the playback callback. Never waits; the caller
    /// fills the shortfall with silence.
    pub fn pull_now(&self, buf: &mut [f32]) -> Pulled {
        let mut g = self.inner.lock().unwrap();
        let copied = fill_from(&mut g, buf);
        let end = drained(&g);
        drop(g);
        if copied > 0 {
            self.space_ready.notify_waiters();
        }
        Pulled {
            samples: copied,
            end,
        }
    }

    /// Mark the buffer finished and wake all waiters.
    ///
    /// After this, pushes fail and pulls report end-of-data once the
    /// remaining frames drain. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        drop(g);
        self.data_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Closed and nothing left to pull.
    pub fn is_drained(&self) -> bool {
        let g = self.inner.lock().unwrap();
        drained(&g)
    }

    pub fn len_frames(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    /// Frames discarded by `try_push` overflow since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn drained(g: &Inner) -> bool {
    g.done && g.frames.is_empty() && g.carry.is_empty()
}

fn fill_from(g: &mut Inner, buf: &mut [f32]) -> usize {
    let mut copied = 0;
    if !g.carry.is_empty() {
        let n = g.carry.len().min(buf.len());
        buf[..n].copy_from_slice(&g.carry[..n]);
        g.carry.drain(..n);
        copied = n;
    }
    if copied < buf.len() {
        if let Some(frame) = g.frames.pop_front() {
            let samples = frame.into_samples();
            let n = samples.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&samples[..n]);
            g.carry.extend_from_slice(&samples[n..]);
            copied += n;
        }
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use intercom_types::FRAME_SAMPLES;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[tokio::test]
    async fn round_trip_preserves_sample_order_across_slice_sizes() {
        let buf = FrameBuffer::with_stall(8, Duration::from_millis(100));
        let mut pushed = Vec::new();
        for i in 0..3 {
            let samples = ramp(i * FRAME_SAMPLES, FRAME_SAMPLES);
            pushed.extend_from_slice(&samples);
            buf.push(AudioFrame::new(samples)).await.unwrap();
        }
        buf.close();

        let mut pulled = Vec::new();
        let mut slice = [0.0f32; 700];
        loop {
            let got = buf.pull(&mut slice).await;
            pulled.extend_from_slice(&slice[..got.samples]);
            // carry never holds a full frame between pulls
            assert!(buf.inner.lock().unwrap().carry.len() < FRAME_SAMPLES);
            if got.end {
                break;
            }
        }
        assert_eq!(pulled, pushed);
    }

    #[tokio::test]
    async fn pull_returns_partial_rather_than_waiting() {
        let buf = FrameBuffer::new(4);
        buf.push(AudioFrame::new(ramp(0, 100))).await.unwrap();

        let mut slice = [0.0f32; 400];
        let got = buf.pull(&mut slice).await;
        assert_eq!(got.samples, 100);
        assert!(!got.end);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_pulls_report_end_of_data() {
        let buf = FrameBuffer::new(4);
        buf.close();
        buf.close();
        assert!(matches!(
            buf.push(AudioFrame::new(vec![1.0])).await,
            Err(AudioError::BufferClosed)
        ));

        let mut slice = [0.0f32; 16];
        let got = buf.pull(&mut slice).await;
        assert_eq!(got, Pulled { samples: 0, end: true });
        let again = buf.pull(&mut slice).await;
        assert_eq!(again, Pulled { samples: 0, end: true });
    }

    #[tokio::test]
    async fn close_drains_queued_frames_before_end_of_data() {
        let buf = FrameBuffer::new(4);
        buf.push(AudioFrame::new(vec![1.0, 2.0])).await.unwrap();
        buf.close();

        let mut slice = [0.0f32; 2];
        let got = buf.pull(&mut slice).await;
        assert_eq!(got, Pulled { samples: 2, end: true });
        assert_eq!(slice, [1.0, 2.0]);
    }

    #[tokio::test]
    async fn push_blocks_on_full_queue_until_space_frees() {
        let buf = Arc::new(FrameBuffer::new(1));
        buf.push(AudioFrame::new(vec![1.0])).await.unwrap();

        let pusher = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.push(AudioFrame::new(vec![2.0])).await })
        };
        tokio::task::yield_now().await;
        assert!(!pusher.is_finished());

        let mut slice = [0.0f32; 1];
        assert_eq!(buf.pull(&mut slice).await.samples, 1);
        pusher.await.unwrap().unwrap();
        assert_eq!(buf.len_frames(), 1);
    }

    #[tokio::test]
    async fn push_waiting_on_full_queue_fails_when_closed() {
        let buf = Arc::new(FrameBuffer::new(1));
        buf.push(AudioFrame::new(vec![1.0])).await.unwrap();

        let pusher = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.push(AudioFrame::new(vec![2.0])).await })
        };
        tokio::task::yield_now().await;
        buf.close();
        assert!(matches!(
            pusher.await.unwrap(),
            Err(AudioError::BufferClosed)
        ));
    }

    #[tokio::test]
    async fn try_push_drops_the_oldest_frame_when_full() {
        let buf = FrameBuffer::new(2);
        buf.try_push(AudioFrame::new(vec![1.0])).unwrap();
        buf.try_push(AudioFrame::new(vec![2.0])).unwrap();
        buf.try_push(AudioFrame::new(vec![3.0])).unwrap();
        assert_eq!(buf.dropped_frames(), 1);

        let mut slice = [0.0f32; 1];
        assert_eq!(buf.pull(&mut slice).await.samples, 1);
        assert_eq!(slice[0], 2.0);
    }

    #[tokio::test]
    async fn stalled_pull_reports_end_of_data_instead_of_deadlocking() {
        let buf = FrameBuffer::with_stall(4, Duration::from_millis(20));
        let mut slice = [0.0f32; 16];
        let got = buf.pull(&mut slice).await;
        assert_eq!(got, Pulled { samples: 0, end: true });
    }

    #[test]
    fn pull_now_on_empty_open_buffer_is_not_end_of_data() {
        let buf = FrameBuffer::new(4);
        let mut slice = [0.0f32; 16];
        let got = buf.pull_now(&mut slice);
        assert_eq!(got, Pulled { samples: 0, end: false });
    }
}
