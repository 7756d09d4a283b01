//! Engine timing knobs
//!
//! Real devices pace some transmissions; the defaults reproduce timing
//! observed on hardware but stay configurable for tests and faster buses.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and capacity knobs for one extension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTuning {
    /// Pause between `FragmentData` chunks of an outbound transfer
    #[serde(with = "humantime_serde", default = "default_fragment_gap")]
    pub fragment_gap: Duration,

    /// Pause between child offers in the identify-unknown cascade
    #[serde(with = "humantime_serde", default = "default_offer_cascade_gap")]
    pub offer_cascade_gap: Duration,

    /// Upper bound on buffered out-of-sequence frames
    #[serde(default = "default_reorder_capacity")]
    pub reorder_capacity: usize,
}

fn default_fragment_gap() -> Duration {
    Duration::from_millis(100)
}

fn default_offer_cascade_gap() -> Duration {
    Duration::from_millis(50)
}

fn default_reorder_capacity() -> usize {
    100
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            fragment_gap: default_fragment_gap(),
            offer_cascade_gap: default_offer_cascade_gap(),
            reorder_capacity: default_reorder_capacity(),
        }
    }
}

impl EngineTuning {
    /// Tuning with all pacing removed, for tests that drive time themselves.
    pub fn immediate() -> Self {
        Self {
            fragment_gap: Duration::ZERO,
            offer_cascade_gap: Duration::ZERO,
            reorder_capacity: default_reorder_capacity(),
        }
    }
}
