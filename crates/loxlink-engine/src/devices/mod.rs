//! Concrete device sinks
//!
//! The protocol engine is device-agnostic; what a frame *means* for the
//! simulated hardware is the sink's business. A sink receives lifecycle
//! callbacks and a chance at every control frame the core does not consume,
//! and may queue outbound control frames of its own (a digital input
//! reporting an edge, say).

mod digital_input;
mod led_spot;
mod rgbw;

pub use digital_input::{DigitalInput, DigitalInputHandle, INPUT_EVENT};
pub use led_spot::{LedSpot, SET_LEVEL};
pub use rgbw::{RgbwDimmer, SET_COMPOSITE};

use loxlink_core::command::Command;
use loxlink_core::config::ConfigRecord;
use loxlink_core::frame::{FragmentedNatFrame, NatFrame};

use crate::state::LifecycleState;

/// Hardware-side behaviour plugged into a device core
///
/// Every method has a no-op default so simple sinks stay small. Control
/// hooks run only while the device is Online; a Parked device answers
/// lifecycle commands but its sink never sees control traffic.
pub trait DeviceSink: Send {
    /// Lifecycle state changed.
    fn on_state(&mut self, _state: LifecycleState) {}

    /// A configuration record was applied.
    fn on_config(&mut self, _record: &ConfigRecord) {}

    /// The identify visual signal was switched.
    fn on_identify(&mut self, _active: bool) {}

    /// A verified firmware image's version should be adopted.
    fn on_firmware_applied(&mut self, _version: u32) {}

    /// A simple control frame for this device; return true when consumed.
    fn on_control(&mut self, _frame: &NatFrame) -> bool {
        false
    }

    /// A reassembled fragmented control payload; return true when consumed.
    fn on_fragmented_control(&mut self, _frame: &FragmentedNatFrame) -> bool {
        false
    }

    /// An outbound control frame the sink wants transmitted, if any.
    ///
    /// Polled once per engine tick while the device is Online.
    fn poll_outbound(&mut self) -> Option<(Command, [u8; 7])> {
        None
    }
}

/// A sink that ignores everything; useful for bare protocol tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl DeviceSink for NullSink {}
