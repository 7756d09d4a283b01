//! LED spot (Tree), RGBW or warm-white

use loxlink_core::frame::NatFrame;
use tracing::debug;

use crate::devices::rgbw::SET_COMPOSITE;
use crate::devices::DeviceSink;
use crate::state::LifecycleState;

/// Control byte setting a single warm-white level in B0.
pub const SET_LEVEL: u8 = 0x89;

/// Simulated LED spot
#[derive(Debug, Default)]
pub struct LedSpot {
    levels: [u8; 4],
    warm_white_only: bool,
}

impl LedSpot {
    /// An RGBW spot.
    pub fn rgbw() -> Self {
        Self::default()
    }

    /// A warm-white spot; composite commands collapse onto one channel.
    pub fn warm_white() -> Self {
        Self {
            levels: [0; 4],
            warm_white_only: true,
        }
    }

    /// Last commanded levels.
    pub fn levels(&self) -> [u8; 4] {
        self.levels
    }
}

impl DeviceSink for LedSpot {
    fn on_state(&mut self, state: LifecycleState) {
        if state == LifecycleState::Offline {
            self.levels = [0; 4];
        }
    }

    fn on_control(&mut self, frame: &NatFrame) -> bool {
        match frame.command.byte() {
            SET_COMPOSITE if !self.warm_white_only => {
                self.levels = frame.val32().to_le_bytes();
            }
            SET_COMPOSITE => {
                // White channel only.
                self.levels = [0, 0, 0, frame.val32().to_le_bytes()[3]];
            }
            SET_LEVEL => {
                self.levels[3] = frame.b0();
            }
            _ => return false,
        }
        debug!(levels = ?self.levels, "led spot levels set");
        true
    }
}
