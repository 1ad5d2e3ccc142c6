//! Wire protocol for intercom call streams.
//!
//! A call rides one TCP connection. Each direction carries:
//! - prelude (once, at connection start): magic `ICOM` + version `u16 LE`
//! - then repeated frames: `len: u32 LE` + `len` mono `f32 LE` samples
//!
//! `len == 0` is the call handshake sentinel. There is no terminator frame:
//! shutting down the write half is the end-of-stream signal, and the remote
//! observes it as a clean half-close at a frame boundary.

pub mod memory;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use intercom_types::{AudioFrame, FRAME_SAMPLES};

pub const MAGIC: [u8; 4] = *b"ICOM";
pub const VERSION: u16 = 1;

/// Upper bound on a single frame, to reject corrupt or hostile peers.
pub const MAX_FRAME_SAMPLES: usize = 32 * FRAME_SAMPLES;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large: {0} samples")]
    FrameTooLarge(usize),
    #[error("stream closed")]
    Closed,
}

/// Send half of a call stream.
#[async_trait]
pub trait FrameSender: Send {
    /// Enqueue one frame to the wire.
    async fn send(&mut self, frame: &AudioFrame) -> Result<(), WireError>;

    /// Half-close the local send side. Idempotent and infallible; the remote
    /// observes end-of-stream once in-flight frames drain.
    async fn close_send(&mut self);
}

/// Receive half of a call stream.
#[async_trait]
pub trait FrameReceiver: Send {
    /// Return the next frame, or `None` when the peer has half-closed.
    async fn recv(&mut self) -> Result<Option<AudioFrame>, WireError>;
}

/// A bidirectional call stream that can be split into its two halves.
///
/// Per-half ordering is FIFO; the halves are otherwise independent.
/// Dropping both halves tears the underlying transport down.
pub trait CallStream: Send {
    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>);
}

/// Opens call streams to remote stations.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: SocketAddr) -> Result<Box<dyn CallStream>, WireError>;
}

/// TCP implementation of [`CallStream`].
pub struct TcpCallStream {
    read: BufReader<OwnedReadHalf>,
    write: BufWriter<OwnedWriteHalf>,
}

impl TcpCallStream {
    /// Wrap an accepted connection: exchange preludes and validate the peer's.
    pub async fn accept(stream: TcpStream) -> Result<Self, WireError> {
        Self::negotiate(stream).await
    }

    /// Dial a peer and exchange preludes.
    pub async fn connect(peer: SocketAddr) -> Result<Self, WireError> {
        let stream = TcpStream::connect(peer).await?;
        Self::negotiate(stream).await
    }

    async fn negotiate(stream: TcpStream) -> Result<Self, WireError> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut this = Self {
            read: BufReader::new(read),
            write: BufWriter::new(write),
        };
        this.write_prelude().await?;
        this.read_prelude().await?;
        Ok(this)
    }

    async fn write_prelude(&mut self) -> Result<(), WireError> {
        self.write.write_all(&MAGIC).await?;
        self.write.write_all(&VERSION.to_le_bytes()).await?;
        self.write.flush().await?;
        Ok(())
    }

    async fn read_prelude(&mut self) -> Result<(), WireError> {
        let mut magic = [0u8; 4];
        self.read.read_exact(&mut magic).await?;
        if magic != MAGIC {
            return Err(WireError::BadMagic);
        }
        let mut ver = [0u8; 2];
        self.read.read_exact(&mut ver).await?;
        let version = u16::from_le_bytes(ver);
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        Ok(())
    }
}

impl CallStream for TcpCallStream {
    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        (
            Box::new(TcpFrameSender {
                write: self.write,
                closed: false,
            }),
            Box::new(TcpFrameReceiver { read: self.read }),
        )
    }
}

struct TcpFrameSender {
    write: BufWriter<OwnedWriteHalf>,
    closed: bool,
}

#[async_trait]
impl FrameSender for TcpFrameSender {
    async fn send(&mut self, frame: &AudioFrame) -> Result<(), WireError> {
        if self.closed {
            return Err(WireError::Closed);
        }
        let samples = frame.samples();
        if samples.len() > MAX_FRAME_SAMPLES {
            return Err(WireError::FrameTooLarge(samples.len()));
        }
        let mut payload = Vec::with_capacity(4 + samples.len() * 4);
        payload.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        for s in samples {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        self.write.write_all(&payload).await?;
        self.write.flush().await?;
        Ok(())
    }

    async fn close_send(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.write.flush().await;
        let _ = self.write.get_mut().shutdown().await;
    }
}

struct TcpFrameReceiver {
    read: BufReader<OwnedReadHalf>,
}

impl TcpFrameReceiver {
    /// Read a frame length, distinguishing a clean half-close (EOF at a frame
    /// boundary) from a truncated header.
    async fn read_len(&mut self) -> Result<Option<u32>, WireError> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(WireError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof inside frame header",
                )));
            }
            filled += n;
        }
        Ok(Some(u32::from_le_bytes(buf)))
    }
}

#[async_trait]
impl FrameReceiver for TcpFrameReceiver {
    async fn recv(&mut self) -> Result<Option<AudioFrame>, WireError> {
        let Some(len) = self.read_len().await? else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_FRAME_SAMPLES {
            return Err(WireError::FrameTooLarge(len));
        }
        let mut bytes = vec![0u8; len * 4];
        self.read.read_exact(&mut bytes).await?;
        let samples = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Some(AudioFrame::new(samples)))
    }
}

/// Default [`Dialer`]: TCP with a connect + prelude bound.
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, peer: SocketAddr) -> Result<Box<dyn CallStream>, WireError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpCallStream::connect(peer))
            .await
            .map_err(|_| {
                WireError::Io(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
            })??;
        Ok(Box::new(stream))
    }
}
