//! Command-line interface definitions.
//!
//! This module contains the `clap`-powered CLI surface (args + defaults).
//! It intentionally has no call logic so the rest of the crate stays
//! reusable.

use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "intercom")]
pub struct Args {
    /// Peer stations: full socket addresses, bare IPs, or last-octet
    /// shorthand on this station's /24 subnet
    pub peers: Vec<String>,

    /// Signaling bind address
    #[arg(long, default_value = "0.0.0.0:20000")]
    pub bind: SocketAddr,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub speaker: Option<String>,

    /// Use a specific input device by substring match
    #[arg(long)]
    pub microphone: Option<String>,

    /// Place a group call to the configured peers at startup
    #[arg(long)]
    pub dial: bool,

    /// Start with do-not-disturb set
    #[arg(long)]
    pub do_not_disturb: bool,

    /// List audio devices and exit
    #[arg(long)]
    pub list_devices: bool,
}
