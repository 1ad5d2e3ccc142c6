//! Intercom station daemon.
//!
//! Listens for calls from peer stations, places group calls on the
//! group-call button, and streams call audio between the network and the
//! local speaker/microphone.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use intercom::cli::Args;
use intercom::config::StationConfig;
use intercom::io::{LampOutputs, TerminalInputs};
use intercom::manager::{CallManager, CallTiming};
use intercom::runtime::{EXIT_FATAL, Runtime};
use intercom::signaling::SignalingServer;
use intercom::station::Station;
use intercom::status::{StationFlags, StationStatus};
use intercom_audio::{CpalCapture, CpalPlayback, device};
use intercom_proto::TcpDialer;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.list_devices {
        return match device::list_host_devices() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(error = %err, "device listing failed");
                ExitCode::from(EXIT_FATAL as u8)
            }
        };
    }

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "startup failed");
            ExitCode::from(EXIT_FATAL as u8)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = StationConfig::from_args(&args)?;

    // A station without working audio is useless; fail before the first
    // call rather than during it.
    let playback = CpalPlayback::new(config.speaker.clone());
    let speaker = playback.probe().context("speaker unavailable")?;
    let capture = CpalCapture::new(config.microphone.clone());
    let microphone = capture.probe().context("microphone unavailable")?;
    tracing::info!(speaker = %speaker, microphone = %microphone, "audio devices ready");

    let status = StationStatus::new(Arc::new(LampOutputs));
    if config.do_not_disturb {
        status.set(StationFlags::DO_NOT_DISTURB);
    }

    let (fatal_tx, fatal_rx) = mpsc::channel(1);
    let manager = CallManager::new(
        status.clone(),
        Arc::new(playback),
        Arc::new(capture),
        Arc::new(TcpDialer::default()),
        CallTiming::default(),
        Some(fatal_tx),
    );
    let station = Station::new(status, manager, config.peers.clone());

    let server = SignalingServer::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;

    let code = Runtime {
        station,
        server,
        inputs: Box::new(TerminalInputs::new()),
        fatal_rx,
        auto_dial: config.dial,
    }
    .run(CancellationToken::new())
    .await;
    Ok(ExitCode::from(code as u8))
}
