//! Digital-input extension device

use std::sync::Arc;

use loxlink_core::command::Command;
use parking_lot::Mutex;
use tracing::debug;

use crate::devices::DeviceSink;
use crate::state::LifecycleState;

/// Command byte carrying an input bitmask in Val32.
pub const INPUT_EVENT: u8 = 0x80;

#[derive(Debug, Default)]
struct Shared {
    inputs: u32,
    pending: Option<u32>,
}

/// Simulated digital-input bank
///
/// The engine owns the sink; the paired [`DigitalInputHandle`] lets the
/// application (or a test) flip inputs from outside the device task. Edges
/// are reported on the next engine tick while Online, and the full state is
/// re-announced whenever the device comes Online.
#[derive(Debug)]
pub struct DigitalInput {
    shared: Arc<Mutex<Shared>>,
}

impl DigitalInput {
    /// Create the sink plus its external handle.
    pub fn new() -> (Self, DigitalInputHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            DigitalInputHandle { shared },
        )
    }
}

impl DeviceSink for DigitalInput {
    fn on_state(&mut self, state: LifecycleState) {
        if state == LifecycleState::Online {
            // Re-announce the current mask after (re)connecting.
            let mut shared = self.shared.lock();
            shared.pending = Some(shared.inputs);
        }
    }

    fn poll_outbound(&mut self) -> Option<(Command, [u8; 7])> {
        let mask = self.shared.lock().pending.take()?;
        let mut data = [0u8; 7];
        data[3..7].copy_from_slice(&mask.to_le_bytes());
        debug!(mask = format_args!("{mask:#010x}"), "digital input event queued");
        Some((Command::from(INPUT_EVENT), data))
    }
}

/// Application-side handle to a [`DigitalInput`]
#[derive(Debug, Clone)]
pub struct DigitalInputHandle {
    shared: Arc<Mutex<Shared>>,
}

impl DigitalInputHandle {
    /// Set the input bitmask; a change queues an event frame.
    pub fn set_inputs(&self, mask: u32) {
        let mut shared = self.shared.lock();
        if shared.inputs != mask {
            shared.inputs = mask;
            shared.pending = Some(mask);
        }
    }

    /// Current input bitmask.
    pub fn inputs(&self) -> u32 {
        self.shared.lock().inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_queues_one_event() {
        let (mut sink, handle) = DigitalInput::new();
        assert!(sink.poll_outbound().is_none());

        handle.set_inputs(0b1010);
        let (command, data) = sink.poll_outbound().unwrap();
        assert_eq!(command.byte(), INPUT_EVENT);
        assert_eq!(u32::from_le_bytes(data[3..7].try_into().unwrap()), 0b1010);

        // No repeat without a change.
        assert!(sink.poll_outbound().is_none());
        handle.set_inputs(0b1010);
        assert!(sink.poll_outbound().is_none());
    }

    #[test]
    fn going_online_reannounces() {
        let (mut sink, handle) = DigitalInput::new();
        handle.set_inputs(0x5);
        sink.poll_outbound();

        sink.on_state(LifecycleState::Online);
        let (_, data) = sink.poll_outbound().unwrap();
        assert_eq!(u32::from_le_bytes(data[3..7].try_into().unwrap()), 0x5);
    }
}
