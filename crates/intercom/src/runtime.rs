//! Process supervisor: lifecycle, fatal errors, graceful shutdown.
//!
//! Exit codes: `0` for a clean shutdown (root context cancelled), `1` for a
//! fatal error, `2` for an OS-signal shutdown. A second signal during
//! shutdown exits `2` immediately.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CallError;
use crate::io::InputSource;
use crate::signaling::SignalingServer;
use crate::station::Station;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_SIGNAL: i32 = 2;

/// How long shutdown waits for in-flight calls to quiesce.
const SHUTDOWN_QUIESCE: Duration = Duration::from_secs(6);

pub struct Runtime {
    pub station: std::sync::Arc<Station>,
    pub server: SignalingServer,
    pub inputs: Box<dyn InputSource>,
    pub fatal_rx: mpsc::Receiver<CallError>,
    /// Place a group call to the configured peers once at startup.
    pub auto_dial: bool,
}

impl Runtime {
    /// Run until the root context is cancelled, a fatal error arrives, or
    /// the OS asks us to stop. Returns the process exit code.
    pub async fn run(self, root: CancellationToken) -> i32 {
        let Runtime {
            station,
            server,
            inputs,
            mut fatal_rx,
            auto_dial,
        } = self;

        let manager = station.manager().clone();
        let server_task = tokio::spawn(server.run(manager.clone(), root.child_token()));
        let inputs_task = tokio::spawn(station.clone().run_inputs(inputs, root.child_token()));

        if auto_dial {
            station.dial_peers();
        }

        let exit = tokio::select! {
            _ = root.cancelled() => {
                tracing::info!("root context cancelled");
                EXIT_OK
            }
            Some(err) = fatal_rx.recv() => {
                tracing::error!(error = %err, "shutting down on fatal error");
                EXIT_FATAL
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received; shutting down (press again to force)");
                tokio::spawn(async {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::warn!("second interrupt; exiting immediately");
                    std::process::exit(EXIT_SIGNAL);
                });
                EXIT_SIGNAL
            }
        };

        // Stop accepting, end calls, then wait for everything to drain.
        manager.hangup_all();
        root.cancel();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_QUIESCE;
        while manager.has_calls() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if manager.has_calls() {
            tracing::warn!("calls failed to quiesce before shutdown deadline");
        }
        let _ = server_task.await;
        let _ = inputs_task.await;
        tracing::info!(exit, "station stopped");
        exit
    }
}
