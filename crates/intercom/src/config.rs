//! Station configuration resolved from the CLI.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result, bail};

use crate::cli::Args;

/// Default signaling port for the whole fleet.
pub const DEFAULT_PORT: u16 = 20_000;

#[derive(Debug, Clone)]
pub struct StationConfig {
    pub bind: SocketAddr,
    pub peers: Vec<SocketAddr>,
    pub speaker: Option<String>,
    pub microphone: Option<String>,
    pub dial: bool,
    pub do_not_disturb: bool,
}

impl StationConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let peers = args
            .peers
            .iter()
            .map(|p| resolve_peer(p, args.bind.ip()).with_context(|| format!("peer {p:?}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            bind: args.bind,
            peers,
            speaker: args.speaker.clone(),
            microphone: args.microphone.clone(),
            dial: args.dial,
            do_not_disturb: args.do_not_disturb,
        })
    }
}

/// Expand a peer argument.
///
/// Accepted forms, in order: a full socket address, a bare IP (default
/// port), or a bare last octet placed on the station's /24 subnet. The
/// subnet comes from the bind address when it is a concrete IPv4 address,
/// else the conventional `192.168.0.0/24`.
pub fn resolve_peer(arg: &str, local: IpAddr) -> Result<SocketAddr> {
    let arg = arg.trim();
    if let Ok(addr) = arg.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = arg.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }
    if let Ok(octet) = arg.parse::<u8>() {
        let base = match local {
            IpAddr::V4(v4) if !v4.is_unspecified() => v4.octets(),
            _ => [192, 168, 0, 0],
        };
        let ip = Ipv4Addr::new(base[0], base[1], base[2], octet);
        return Ok(SocketAddr::new(IpAddr::V4(ip), DEFAULT_PORT));
    }
    bail!("unrecognized peer address: {arg}")
}
