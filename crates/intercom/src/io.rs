//! Station inputs and outputs.
//!
//! The hardware surface is two buttons and two lamps. Both sit behind small
//! traits so the call runtime never touches GPIO directly: buttons arrive as
//! debounced [`ButtonEvent`]s from an [`InputSource`], and every status
//! change is pushed to an [`OutputSink`]. The implementations here are the
//! terminal stand-ins used on a dev machine; a GPIO adapter plugs into the
//! same seams.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

use crate::status::StationFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    GroupCall,
    EndCall,
}

/// One debounced falling-edge press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub button: Button,
}

/// Source of button presses (physical buttons, terminal, tests).
#[async_trait]
pub trait InputSource: Send {
    /// The next press, or `None` when the source is exhausted.
    async fn next_event(&mut self) -> Option<ButtonEvent>;
}

/// Receives the full status bitmask after every change.
///
/// The snapshot is passed by value: a sink can render it but cannot mutate
/// the station's status through it.
pub trait OutputSink: Send + Sync {
    fn update(&self, status: StationFlags);
}

/// Terminal stand-in for the two buttons: `call`/`c` presses group-call,
/// `end`/`e` presses end-call.
pub struct TerminalInputs {
    lines: Lines<BufReader<Stdin>>,
}

impl TerminalInputs {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for TerminalInputs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputSource for TerminalInputs {
    async fn next_event(&mut self) -> Option<ButtonEvent> {
        loop {
            let line = self.lines.next_line().await.ok().flatten()?;
            match line.trim() {
                "c" | "call" => {
                    return Some(ButtonEvent {
                        button: Button::GroupCall,
                    });
                }
                "e" | "end" => {
                    return Some(ButtonEvent {
                        button: Button::EndCall,
                    });
                }
                "" => continue,
                other => tracing::info!(input = %other, "unknown command (use 'call' or 'end')"),
            }
        }
    }
}

/// Channel-fed input source for tests and remote control.
pub struct ChannelInputs {
    rx: mpsc::Receiver<ButtonEvent>,
}

impl ChannelInputs {
    pub fn new() -> (mpsc::Sender<ButtonEvent>, Self) {
        let (tx, rx) = mpsc::channel(8);
        (tx, Self { rx })
    }
}

#[async_trait]
impl InputSource for ChannelInputs {
    async fn next_event(&mut self) -> Option<ButtonEvent> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lamp {
    Off,
    On,
    /// 500 ms blink.
    Blink,
}

/// Map the status bitmask to the two indicator lamps (green, yellow).
pub fn lamp_states(status: StationFlags) -> (Lamp, Lamp) {
    let green = if status.contains(StationFlags::ERROR) {
        Lamp::On
    } else if status.contains(StationFlags::CALL_CONNECTED) {
        Lamp::On
    } else if status.contains(StationFlags::INCOMING_CALL) {
        Lamp::Blink
    } else {
        Lamp::Off
    };
    let yellow = if status.contains(StationFlags::ERROR) {
        Lamp::On
    } else if status.contains(StationFlags::OUTGOING_CALL) {
        Lamp::Blink
    } else if status.contains(StationFlags::DO_NOT_DISTURB)
        && !status.contains(StationFlags::CALL_CONNECTED)
    {
        Lamp::On
    } else {
        Lamp::Off
    };
    (green, yellow)
}

/// Renders the lamp model through the log; the GPIO adapter drives real
/// LEDs from the same mapping.
pub struct LampOutputs;

impl OutputSink for LampOutputs {
    fn update(&self, status: StationFlags) {
        let (green, yellow) = lamp_states(status);
        tracing::info!(?green, ?yellow, status = ?status, "station status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_station_has_both_lamps_off() {
        assert_eq!(lamp_states(StationFlags::empty()), (Lamp::Off, Lamp::Off));
    }

    #[test]
    fn do_not_disturb_lights_yellow_until_connected() {
        assert_eq!(
            lamp_states(StationFlags::DO_NOT_DISTURB),
            (Lamp::Off, Lamp::On)
        );
        assert_eq!(
            lamp_states(StationFlags::DO_NOT_DISTURB | StationFlags::CALL_CONNECTED),
            (Lamp::On, Lamp::Off)
        );
    }

    #[test]
    fn incoming_blinks_green_and_outgoing_blinks_yellow() {
        assert_eq!(
            lamp_states(StationFlags::INCOMING_CALL),
            (Lamp::Blink, Lamp::Off)
        );
        assert_eq!(
            lamp_states(StationFlags::OUTGOING_CALL),
            (Lamp::Off, Lamp::Blink)
        );
    }

    #[test]
    fn connected_is_green_solid() {
        assert_eq!(
            lamp_states(StationFlags::CALL_CONNECTED),
            (Lamp::On, Lamp::Off)
        );
    }

    #[test]
    fn error_lights_both_lamps() {
        assert_eq!(
            lamp_states(StationFlags::ERROR | StationFlags::INCOMING_CALL),
            (Lamp::On, Lamp::On)
        );
    }

    #[tokio::test]
    async fn channel_inputs_deliver_presses_in_order() {
        let (tx, mut inputs) = ChannelInputs::new();
        tx.send(ButtonEvent {
            button: Button::GroupCall,
        })
        .await
        .unwrap();
        tx.send(ButtonEvent {
            button: Button::EndCall,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(inputs.next_event().await.unwrap().button, Button::GroupCall);
        assert_eq!(inputs.next_event().await.unwrap().button, Button::EndCall);
        assert!(inputs.next_event().await.is_none());
    }
}
