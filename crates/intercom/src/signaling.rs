//! Signaling listener for inbound calls.
//!
//! One TCP connection is one call attempt. The listener wraps each accepted
//! socket in the wire codec, derives caller identity from the socket peer
//! address and callee identity from the local authority, and hands the
//! stream to the call manager. No per-connection state lives here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use intercom_proto::TcpCallStream;

use crate::manager::CallManager;

/// Bound on the codec prelude exchange so a silent client cannot pin an
/// accept slot.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SignalingServer {
    listener: TcpListener,
    local: SocketAddr,
}

impl SignalingServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        Ok(Self { listener, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept loop; returns when `cancel` fires.
    pub async fn run(self, manager: Arc<CallManager>, cancel: CancellationToken) {
        tracing::info!(bind = %self.local, "signaling listening");
        loop {
            let (socket, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!("accept error: {err}");
                        continue;
                    }
                },
            };

            let manager = manager.clone();
            let authority = self.local.to_string();
            tokio::spawn(async move {
                let negotiated =
                    tokio::time::timeout(NEGOTIATE_TIMEOUT, TcpCallStream::accept(socket)).await;
                let stream = match negotiated {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(err)) => {
                        tracing::warn!(peer = %peer, error = %err, "connection rejected");
                        return;
                    }
                    Err(_) => {
                        tracing::warn!(peer = %peer, "connection rejected: prelude timeout");
                        return;
                    }
                };
                if let Err(err) = manager
                    .serve(Box::new(stream), peer.to_string(), authority)
                    .await
                {
                    tracing::debug!(peer = %peer, error = %err, "inbound call ended with error");
                }
            });
        }
        tracing::info!("signaling stopped");
    }
}
