//! Device base: identity, per-device state and the send path
//!
//! [`DeviceCore`] bundles everything one NAT endpoint owns - the lifecycle
//! state machine, the fragment assembler, the firmware session, the applied
//! configuration and the frame counters. Both an extension itself and every
//! Tree child behind it are a `DeviceCore`; the difference is the
//! [`DeviceRole`], which decides how outbound frames are addressed.
//!
//! All mutation happens from the owning extension's task, one frame at a
//! time, so none of this needs interior locking.

use std::sync::Arc;

use loxlink_core::command::{Command, ResetReason, UNASSIGNED_NAT};
use loxlink_core::config::{ConfigRecord, CryptoConfig};
use loxlink_core::frame::NatFrame;
use loxlink_core::Result;
use tokio::time::Instant;
use tracing::debug;

use crate::adapter::LinkPort;
use crate::devices::DeviceSink;
use crate::fragment::{self, AssemblyOutcome, FragmentAssembler};
use crate::firmware::UpdateSession;
use crate::state::{LifecycleState, StateMachine, TimerAction};
use crate::tuning::EngineTuning;

/// Who a device core is on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Speaks NAT directly; `DeviceId` is always 0
    Extension,
    /// Addressed through a parent Tree extension
    TreeChild,
}

/// Static identity of an emulated device
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Serial number
    pub serial: u32,
    /// Device-type code (see `loxlink_core::command::device_type`)
    pub device_type: u16,
    /// Hardware revision
    pub hardware_version: u8,
    /// Firmware version; replaced after a verified update
    pub firmware_version: u32,
    /// 12-byte STM32 device ID used in the crypto handshakes
    pub stm32_id: [u8; 12],
}

impl DeviceIdentity {
    /// Identity with the Tree-device convention for the STM32 ID: the
    /// serial repeated three times.
    pub fn new(serial: u32, device_type: u16, hardware_version: u8, firmware_version: u32) -> Self {
        let serial_bytes = serial.to_le_bytes();
        let mut stm32_id = [0u8; 12];
        for chunk in stm32_id.chunks_mut(4) {
            chunk.copy_from_slice(&serial_bytes);
        }
        Self {
            serial,
            device_type,
            hardware_version,
            firmware_version,
            stm32_id,
        }
    }

    /// Override the STM32 device ID.
    pub fn with_stm32_id(mut self, stm32_id: [u8; 12]) -> Self {
        self.stm32_id = stm32_id;
        self
    }
}

/// Per-device frame counters
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStats {
    /// Frames delivered to this device
    pub received: u64,
    /// Frames transmitted by this device
    pub sent: u64,
    /// Frames dropped before dispatch
    pub dropped: u64,
    /// Fragmented payloads discarded on CRC mismatch
    pub crc_failures: u64,
}

/// Addressing context for one send: the shared port plus, for Tree
/// children, the parent extension's current NAT.
#[derive(Debug)]
pub struct SendCtx<'a> {
    /// Shared adapter port
    pub port: &'a LinkPort,
    /// Parent extension NAT; `None` when the sender is the extension
    pub parent_nat: Option<u8>,
}

/// Everything one NAT endpoint owns
pub struct DeviceCore {
    pub(crate) identity: DeviceIdentity,
    pub(crate) crypto: Arc<CryptoConfig>,
    pub(crate) role: DeviceRole,
    pub(crate) branch_tag: u8,
    pub(crate) assignment: Option<u8>,
    pub(crate) state: StateMachine,
    pub(crate) assembler: FragmentAssembler,
    pub(crate) firmware: UpdateSession,
    pub(crate) config: ConfigRecord,
    pub(crate) stats: DeviceStats,
    pub(crate) identifying: bool,
    pub(crate) reset_reason: ResetReason,
    pub(crate) tuning: EngineTuning,
}

impl DeviceCore {
    /// New core booting Offline with the default configuration.
    pub fn new(
        identity: DeviceIdentity,
        crypto: Arc<CryptoConfig>,
        role: DeviceRole,
        branch_tag: u8,
        tuning: EngineTuning,
    ) -> Self {
        let config = ConfigRecord::default();
        let state = StateMachine::new(config.offline_timeout(), config.keepalive_interval());
        Self {
            identity,
            crypto,
            role,
            branch_tag,
            assignment: None,
            state,
            assembler: FragmentAssembler::new(),
            firmware: UpdateSession::new(),
            config,
            stats: DeviceStats::default(),
            identifying: false,
            reset_reason: ResetReason::PowerOnReset,
            tuning,
        }
    }

    /// Static identity.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        self.state.state()
    }

    /// Assigned NAT (extensions) or DeviceNat (Tree children), if any.
    pub fn assignment(&self) -> Option<u8> {
        self.assignment
    }

    /// Frame counters.
    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    /// Applied configuration.
    pub fn config(&self) -> &ConfigRecord {
        &self.config
    }

    /// Whether the identify visual signal is active.
    pub fn is_identifying(&self) -> bool {
        self.identifying
    }

    /// NAT and device address outbound frames carry right now.
    pub(crate) fn wire_address(&self, ctx: &SendCtx<'_>) -> (u8, u8) {
        match self.role {
            DeviceRole::Extension => (self.assignment.unwrap_or(UNASSIGNED_NAT), 0),
            DeviceRole::TreeChild => (
                ctx.parent_nat.unwrap_or(UNASSIGNED_NAT),
                self.assignment.unwrap_or(0),
            ),
        }
    }

    pub(crate) async fn send_simple(
        &mut self,
        ctx: &SendCtx<'_>,
        command: Command,
        data: [u8; 7],
    ) -> Result<()> {
        let (nat_id, device_id) = self.wire_address(ctx);
        let frame = NatFrame::device(nat_id, device_id, command).with_data(data);
        ctx.port.send(&frame).await?;
        self.stats.sent += 1;
        Ok(())
    }

    pub(crate) async fn send_fragmented(
        &mut self,
        ctx: &SendCtx<'_>,
        command: Command,
        data: &[u8],
    ) -> Result<()> {
        let (nat_id, device_id) = self.wire_address(ctx);
        let frames = fragment::emit(
            ctx.port,
            nat_id,
            device_id,
            command,
            data,
            self.tuning.fragment_gap,
        )
        .await?;
        self.stats.sent += frames as u64;
        Ok(())
    }

    /// Process one inbound frame already routed to this device.
    pub async fn handle_frame(
        &mut self,
        frame: &NatFrame,
        sink: &mut dyn DeviceSink,
        ctx: &SendCtx<'_>,
    ) -> Result<()> {
        self.stats.received += 1;
        self.state.touch();

        if frame.command.is_fragment_transport() {
            return match self.assembler.on_frame(frame) {
                AssemblyOutcome::Pending => Ok(()),
                AssemblyOutcome::CrcMismatch => {
                    self.stats.crc_failures += 1;
                    Ok(())
                }
                AssemblyOutcome::Complete(payload) => {
                    self.dispatch_fragmented(&payload, sink, ctx).await
                }
            };
        }

        self.dispatch_simple(frame, sink, ctx).await
    }

    /// Run the device's timers; sends whatever became due.
    pub async fn on_tick(
        &mut self,
        now: Instant,
        sink: &mut dyn DeviceSink,
        ctx: &SendCtx<'_>,
    ) -> Result<()> {
        for action in self.state.tick(now) {
            match action {
                TimerAction::SendOffer => self.emit_offer(ctx).await?,
                TimerAction::SendKeepAlive => self.send_alive(ctx).await?,
                TimerAction::WentOffline => sink.on_state(LifecycleState::Offline),
            }
        }

        if self.state.state() == LifecycleState::Online {
            while let Some((command, data)) = sink.poll_outbound() {
                self.send_simple(ctx, command, data).await?;
            }
        }

        Ok(())
    }

    /// Emit one `NatOfferRequest` for this device.
    ///
    /// Extensions announce `[0x00, type_lo, type_hi, serial]`; Tree devices
    /// repeat the type high byte in position 0, matching real hardware.
    pub async fn emit_offer(&mut self, ctx: &SendCtx<'_>) -> Result<()> {
        let type_bytes = self.identity.device_type.to_le_bytes();
        let serial = self.identity.serial.to_le_bytes();
        let lead = match self.role {
            DeviceRole::Extension => 0x00,
            DeviceRole::TreeChild => type_bytes[1],
        };
        let data = [
            lead,
            type_bytes[0],
            type_bytes[1],
            serial[0],
            serial[1],
            serial[2],
            serial[3],
        ];

        let (nat_id, _) = self.wire_address(ctx);
        // Offers always go out with DeviceId 0, assigned or not.
        let frame = NatFrame::device(nat_id, 0, Command::NatOfferRequest).with_data(data);
        ctx.port.send(&frame).await?;
        self.stats.sent += 1;
        debug!(serial = format_args!("{:#010x}", self.identity.serial), "offer emitted");
        Ok(())
    }

    /// Send the keep-alive: reason byte, config version, config CRC.
    pub(crate) async fn send_alive(&mut self, ctx: &SendCtx<'_>) -> Result<()> {
        let mut data = [0u8; 7];
        data[0] = ResetReason::AlivePackage as u8;
        data[1..3].copy_from_slice(&u16::from(self.config.version).to_le_bytes());
        data[3..7].copy_from_slice(&self.config.digest().to_le_bytes());
        self.send_simple(ctx, Command::Alive, data).await
    }

    /// The 20-byte version block shared by `StartInfo` and `VersionInfo`.
    pub(crate) fn version_block(&self, reason: ResetReason) -> Vec<u8> {
        let mut block = Vec::with_capacity(20);
        block.extend_from_slice(&self.identity.firmware_version.to_le_bytes());
        block.extend_from_slice(&[0u8; 4]);
        block.extend_from_slice(&self.config.digest().to_le_bytes());
        block.extend_from_slice(&self.identity.serial.to_le_bytes());
        block.push(reason as u8);
        block.extend_from_slice(&self.identity.device_type.to_le_bytes());
        block.push(self.identity.hardware_version);
        block
    }

    /// Announce the device after it went Online.
    pub(crate) async fn send_start_info(&mut self, ctx: &SendCtx<'_>) -> Result<()> {
        let block = self.version_block(self.reset_reason);
        self.send_fragmented(ctx, Command::StartInfo, &block).await
    }

    /// Stop semantics: an Online device says goodbye with `SetOffline`;
    /// in-flight fragmented sessions are discarded.
    pub async fn shutdown(&mut self, ctx: &SendCtx<'_>) -> Result<()> {
        self.assembler.reset();
        self.firmware.clear();
        if self.state.state() == LifecycleState::Online {
            self.send_simple(ctx, Command::SetOffline, [0; 7]).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCore")
            .field("serial", &format_args!("{:#010x}", self.identity.serial))
            .field("role", &self.role)
            .field("state", &self.state.state())
            .field("assignment", &self.assignment)
            .finish_non_exhaustive()
    }
}
