//! CAN adapter boundary
//!
//! The engine never touches a serial port or a raw CAN socket itself; it
//! talks to any [`CanAdapter`] implementation. Concrete drivers (USB-CAN
//! bridge, SocketCAN) live with the application. The adapter tags every
//! received frame with a monotonically increasing sequence number so the
//! engine can restore bus order regardless of driver buffering.

use std::sync::Arc;

use async_trait::async_trait;
use loxlink_core::frame::{CanFrame, NatFrame};
use loxlink_core::Result;
use tracing::trace;

/// A received CAN frame plus its adapter-assigned sequence number
#[derive(Debug, Clone, Copy)]
pub struct CanRxEvent {
    /// The raw frame as read from the bus
    pub frame: CanFrame,
    /// Monotonic per-adapter sequence; gaps mean frames were lost
    pub sequence: u64,
}

/// Driver-side interface to the physical CAN bus
///
/// `send_frame` must be safe to call concurrently; the engine serialises
/// its own sends per extension but sniffers and sibling extensions may
/// share one adapter.
#[async_trait]
pub trait CanAdapter: Send + Sync {
    /// Transmit one 29-bit extended frame with DLC 8.
    async fn send_frame(&self, id: u32, data: [u8; 8]) -> Result<()>;

    /// Begin delivering received frames.
    async fn start_receive(&self) -> Result<()>;

    /// Stop delivering received frames.
    async fn stop_receive(&self) -> Result<()>;

    /// Adapter name for logging.
    fn name(&self) -> &str;
}

/// Send-side handle shared by an extension and its Tree children
///
/// Children never talk to the adapter directly; every outbound NAT frame
/// funnels through the owning extension's port.
#[derive(Clone)]
pub struct LinkPort {
    adapter: Arc<dyn CanAdapter>,
}

impl LinkPort {
    /// Wrap an adapter.
    pub fn new(adapter: Arc<dyn CanAdapter>) -> Self {
        Self { adapter }
    }

    /// Encode and transmit a NAT frame.
    pub async fn send(&self, frame: &NatFrame) -> Result<()> {
        let can = frame.encode();
        trace!(
            adapter = self.adapter.name(),
            id = format_args!("{:#010x}", can.id),
            command = %frame.command,
            nat = frame.nat_id,
            device = frame.device_id,
            "tx"
        );
        self.adapter.send_frame(can.id, can.data).await
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> &Arc<dyn CanAdapter> {
        &self.adapter
    }
}

impl std::fmt::Debug for LinkPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkPort")
            .field("adapter", &self.adapter.name())
            .finish()
    }
}
