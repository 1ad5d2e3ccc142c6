//! Intercom station runtime.
//!
//! A station is one physical intercom unit: two buttons, two lamps, a
//! speaker, a microphone, and a signaling port. This crate wires those into
//! the call runtime: the station status bitmask, the call manager with its
//! per-call four-task audio pipeline, the signaling listener for inbound
//! calls, and the process supervisor.
//!
//! Hardware specifics live behind small traits ([`io::InputSource`],
//! [`io::OutputSink`], and the audio engine traits from `intercom-audio`);
//! concrete implementations are injected at the composition root
//! ([`station::Station`]).

pub mod call;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod manager;
pub mod runtime;
pub mod signaling;
pub mod station;
pub mod status;
