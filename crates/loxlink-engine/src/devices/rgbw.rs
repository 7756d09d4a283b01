//! RGBW 24V dimmer (Tree)

use loxlink_core::frame::NatFrame;
use tracing::{debug, info};

use crate::devices::DeviceSink;
use crate::state::LifecycleState;

/// Control byte setting all four channels at once; the packed value rides
/// in Val32, red in the low byte.
pub const SET_COMPOSITE: u8 = 0x88;

/// Simulated RGBW dimmer: remembers the last commanded channel values
#[derive(Debug, Default)]
pub struct RgbwDimmer {
    channels: [u8; 4],
    identifying: bool,
}

impl RgbwDimmer {
    /// A dimmer with all channels dark.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last commanded `[r, g, b, w]`.
    pub fn channels(&self) -> [u8; 4] {
        self.channels
    }
}

impl DeviceSink for RgbwDimmer {
    fn on_state(&mut self, state: LifecycleState) {
        debug!(%state, "rgbw dimmer state change");
        if state == LifecycleState::Offline {
            self.channels = [0; 4];
        }
    }

    fn on_identify(&mut self, active: bool) {
        // A real dimmer blinks; remembering the flag is our whole effect.
        self.identifying = active;
        info!(active, "rgbw identify signal");
    }

    fn on_control(&mut self, frame: &NatFrame) -> bool {
        if frame.command.byte() != SET_COMPOSITE {
            return false;
        }
        self.channels = frame.val32().to_le_bytes();
        debug!(
            r = self.channels[0],
            g = self.channels[1],
            b = self.channels[2],
            w = self.channels[3],
            "rgbw channels set"
        );
        true
    }
}
