//! Station-wide status bitmask.
//!
//! Mutations take the lock, apply the change, release, and only then notify
//! the output sink with a copied snapshot, so a sink can never deadlock or
//! feed back into the status it was handed. Output updates may race later
//! mutations; the last update wins visually.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;

use crate::io::OutputSink;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StationFlags: u8 {
        const ERROR = 1;
        const DO_NOT_DISTURB = 1 << 1;
        const INCOMING_CALL = 1 << 2;
        const OUTGOING_CALL = 1 << 3;
        const CALL_CONNECTED = 1 << 4;
    }
}

/// How long a transient call failure lights the error lamp.
pub const ERROR_FLASH: Duration = Duration::from_millis(500);

pub struct StationStatus {
    flags: Mutex<StationFlags>,
    outputs: Arc<dyn OutputSink>,
}

impl StationStatus {
    pub fn new(outputs: Arc<dyn OutputSink>) -> Arc<Self> {
        Arc::new(Self {
            flags: Mutex::new(StationFlags::empty()),
            outputs,
        })
    }

    pub fn has(&self, flags: StationFlags) -> bool {
        self.flags.lock().unwrap().contains(flags)
    }

    pub fn snapshot(&self) -> StationFlags {
        *self.flags.lock().unwrap()
    }

    pub fn set(&self, flags: StationFlags) {
        self.mutate(|f| f.insert(flags));
    }

    pub fn clear(&self, flags: StationFlags) {
        self.mutate(|f| f.remove(flags));
    }

    pub fn toggle(&self, flags: StationFlags) {
        self.mutate(|f| f.toggle(flags));
    }

    /// Light the error lamp briefly for a call failure the user did not
    /// initiate, then revert.
    pub fn flash_error(self: Arc<Self>) {
        let status = self;
        tokio::spawn(async move {
            status.set(StationFlags::ERROR);
            tokio::time::sleep(ERROR_FLASH).await;
            status.clear(StationFlags::ERROR);
        });
    }

    fn mutate(&self, apply: impl FnOnce(&mut StationFlags)) {
        let snapshot = {
            let mut g = self.flags.lock().unwrap();
            apply(&mut g);
            // A connected call supersedes the ringing states.
            if g.contains(StationFlags::CALL_CONNECTED) {
                g.remove(StationFlags::INCOMING_CALL | StationFlags::OUTGOING_CALL);
            }
            *g
        };
        self.outputs.update(snapshot);
    }
}
