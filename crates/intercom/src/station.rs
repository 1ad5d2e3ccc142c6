//! Composition root: one physical intercom unit.
//!
//! The station owns the status bitmask and the call manager and routes
//! button presses through a small policy layer. Everything hardware-shaped
//! (buttons, lamps, audio devices, transport) is injected.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::io::{Button, InputSource};
use crate::manager::CallManager;
use crate::status::{StationFlags, StationStatus};

pub struct Station {
    status: Arc<StationStatus>,
    manager: Arc<CallManager>,
    peers: Vec<SocketAddr>,
}

impl Station {
    pub fn new(
        status: Arc<StationStatus>,
        manager: Arc<CallManager>,
        peers: Vec<SocketAddr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            status,
            manager,
            peers,
        })
    }

    pub fn status(&self) -> &Arc<StationStatus> {
        &self.status
    }

    pub fn manager(&self) -> &Arc<CallManager> {
        &self.manager
    }

    /// Group-call everything this station knows about.
    pub fn dial_peers(&self) {
        self.manager.clone().call_all(&self.peers);
    }

    /// Button policy.
    ///
    /// Group-call doubles as "accept" while a call is ringing under
    /// do-not-disturb; end-call doubles as "reject" there and as the
    /// do-not-disturb toggle when the station is idle.
    pub fn handle_button(&self, button: Button) {
        match button {
            Button::GroupCall => {
                if self.status.has(StationFlags::DO_NOT_DISTURB)
                    && self.status.has(StationFlags::INCOMING_CALL)
                {
                    tracing::debug!("group-call button: accepting incoming call");
                    self.manager.accept();
                } else if self.status.has(StationFlags::CALL_CONNECTED)
                    || self.status.has(StationFlags::OUTGOING_CALL)
                {
                    tracing::debug!("group-call button: call already outgoing or connected");
                } else {
                    tracing::debug!("group-call button: calling all peers");
                    self.dial_peers();
                }
            }
            Button::EndCall => {
                if self.status.has(StationFlags::DO_NOT_DISTURB)
                    && self.status.has(StationFlags::INCOMING_CALL)
                {
                    tracing::debug!("end-call button: rejecting incoming call");
                    self.manager.reject();
                } else if self.manager.has_calls() {
                    tracing::debug!("end-call button: hanging up");
                    self.manager.hangup_all();
                } else {
                    tracing::debug!("end-call button: toggling do-not-disturb");
                    self.status.toggle(StationFlags::DO_NOT_DISTURB);
                }
            }
        }
    }

    /// Pump button events into the policy until the source ends or the
    /// station shuts down.
    pub async fn run_inputs(
        self: Arc<Self>,
        mut inputs: Box<dyn InputSource>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = inputs.next_event() => event,
            };
            match event {
                Some(event) => self.handle_button(event.button),
                None => break,
            }
        }
        tracing::debug!("input pump stopped");
    }
}
