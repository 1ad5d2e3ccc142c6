//! In-memory call streams for tests and loopback wiring.

use async_trait::async_trait;
use tokio::sync::mpsc;

use intercom_types::AudioFrame;

use crate::{CallStream, FrameReceiver, FrameSender, WireError};

const CHANNEL_FRAMES: usize = 32;

/// Build a connected pair of in-memory call streams.
///
/// Frames sent on one stream arrive on the other, per-half FIFO. Dropping a
/// stream (or calling `close_send`) half-closes toward the peer.
pub fn pair() -> (MemoryCallStream, MemoryCallStream) {
    let (a_tx, a_rx) = mpsc::channel(CHANNEL_FRAMES);
    let (b_tx, b_rx) = mpsc::channel(CHANNEL_FRAMES);
    (
        MemoryCallStream {
            tx: a_tx,
            rx: b_rx,
        },
        MemoryCallStream {
            tx: b_tx,
            rx: a_rx,
        },
    )
}

pub struct MemoryCallStream {
    tx: mpsc::Sender<AudioFrame>,
    rx: mpsc::Receiver<AudioFrame>,
}

impl CallStream for MemoryCallStream {
    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        (
            Box::new(MemoryFrameSender { tx: Some(self.tx) }),
            Box::new(MemoryFrameReceiver { rx: self.rx }),
        )
    }
}

pub struct MemoryFrameSender {
    tx: Option<mpsc::Sender<AudioFrame>>,
}

#[async_trait]
impl FrameSender for MemoryFrameSender {
    async fn send(&mut self, frame: &AudioFrame) -> Result<(), WireError> {
        let Some(tx) = &self.tx else {
            return Err(WireError::Closed);
        };
        tx.send(frame.clone()).await.map_err(|_| WireError::Closed)
    }

    async fn close_send(&mut self) {
        self.tx.take();
    }
}

pub struct MemoryFrameReceiver {
    rx: mpsc::Receiver<AudioFrame>,
}

#[async_trait]
impl FrameReceiver for MemoryFrameReceiver {
    async fn recv(&mut self) -> Result<Option<AudioFrame>, WireError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_frames_both_ways() {
        let (left, right) = pair();
        let (mut ltx, mut lrx) = Box::new(left).split();
        let (mut rtx, mut rrx) = Box::new(right).split();

        ltx.send(&AudioFrame::new(vec![1.0])).await.unwrap();
        rtx.send(&AudioFrame::new(vec![2.0])).await.unwrap();

        assert_eq!(rrx.recv().await.unwrap().unwrap().samples(), &[1.0]);
        assert_eq!(lrx.recv().await.unwrap().unwrap().samples(), &[2.0]);
    }

    #[tokio::test]
    async fn close_send_half_closes_toward_the_peer() {
        let (left, right) = pair();
        let (mut ltx, _lrx) = Box::new(left).split();
        let (_rtx, mut rrx) = Box::new(right).split();

        ltx.close_send().await;
        assert!(rrx.recv().await.unwrap().is_none());
        assert!(matches!(
            ltx.send(&AudioFrame::handshake()).await,
            Err(WireError::Closed)
        ));
    }
}
