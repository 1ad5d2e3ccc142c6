//! One in-flight call: identity, direction, monotonic status, cancellation.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sortable, printable call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outgoing => f.write_str("outgoing"),
            Direction::Incoming => f.write_str("incoming"),
        }
    }
}

/// Call lifecycle; only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallStatus {
    Pending,
    Active,
    Terminating,
}

pub struct Call {
    id: CallId,
    peer: String,
    direction: Direction,
    status: Mutex<CallStatus>,
    cancel: CancellationToken,
}

impl Call {
    pub fn new(peer: String, direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            id: CallId::new(),
            peer,
            direction,
            status: Mutex::new(CallStatus::Pending),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> CallStatus {
        *self.status.lock().unwrap()
    }

    /// Move the status forward. Returns whether it changed; a request to
    /// move backward (or stay) is a no-op.
    pub fn advance(&self, to: CallStatus) -> bool {
        let mut g = self.status.lock().unwrap();
        if to > *g {
            *g = to;
            true
        } else {
            false
        }
    }

    /// Pending or active.
    pub fn is_live(&self) -> bool {
        self.status() < CallStatus::Terminating
    }

    /// End the call: status to terminating, cancellation tripped. Safe to
    /// call any number of times.
    pub fn hangup(&self) {
        self.advance(CallStatus::Terminating);
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
