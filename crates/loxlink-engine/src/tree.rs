//! Extension host and Tree router
//!
//! An [`Extension`] is the only NAT endpoint the Link bus sees for itself
//! and all of its Tree children. It owns the inbound task: frames arrive
//! from the adapter, pass the reorder buffer, and are routed to the
//! extension core, one child, or everyone, in that order of precedence.
//! Children are plain values owned by the extension - when the extension
//! stops, they stop.
//!
//! Routing for a frame addressed to our NAT (or the broadcast NAT):
//!
//! 1. `DeviceId 0` - the extension itself, plus serial-matched forwarding
//!    of `NatOfferConfirm` to children.
//! 2. `DeviceId 0xFF` - the extension handles first (so an assignment is
//!    visible before fan-out), then every child.
//! 3. anything else - the first child that claims the address.

use std::sync::Arc;

use loxlink_core::command::{Command, BROADCAST_DEVICE, BROADCAST_NAT, UNASSIGNED_NAT};
use loxlink_core::config::CryptoConfig;
use loxlink_core::frame::{CanFrame, Direction, NatFrame};
use loxlink_core::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{CanAdapter, CanRxEvent, LinkPort};
use crate::device::{DeviceCore, DeviceIdentity, DeviceRole, DeviceStats, SendCtx};
use crate::devices::DeviceSink;
use crate::reorder::ReorderBuffer;
use crate::state::LifecycleState;
use crate::tuning::EngineTuning;

/// Physical branch of a Tree extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeBranch {
    /// Left branch, reported as `0x80`
    Left,
    /// Right branch, reported as `0x01`
    Right,
}

impl TreeBranch {
    /// Branch tag as used in search responses and CAN-error replies.
    pub fn tag(self) -> u8 {
        match self {
            TreeBranch::Left => 0x80,
            TreeBranch::Right => 0x01,
        }
    }
}

struct TreeChild {
    core: DeviceCore,
    sink: Box<dyn DeviceSink>,
}

/// Control messages for a running extension task
enum ExtensionCommand {
    GetStats(oneshot::Sender<ExtensionStats>),
    Shutdown,
}

/// Counters for an extension and its children
#[derive(Debug, Clone, Default)]
pub struct ExtensionStats {
    /// The extension's own counters
    pub extension: DeviceStats,
    /// Per-child counters keyed by serial
    pub children: Vec<(u32, DeviceStats)>,
    /// Frames lost to reorder-buffer overflow
    pub reorder_dropped: u64,
}

/// Handle for controlling a running [`Extension`]
#[derive(Clone)]
pub struct ExtensionHandle {
    command_tx: mpsc::Sender<ExtensionCommand>,
}

impl ExtensionHandle {
    /// Snapshot the frame counters.
    pub async fn stats(&self) -> Result<ExtensionStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(ExtensionCommand::GetStats(tx))
            .await
            .map_err(|_| loxlink_core::LinkError::ChannelClosed)?;
        rx.await.map_err(|_| loxlink_core::LinkError::ChannelClosed)
    }

    /// Stop the extension: children and extension say goodbye, the adapter
    /// stops receiving, the task ends.
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(ExtensionCommand::Shutdown)
            .await
            .map_err(|_| loxlink_core::LinkError::ChannelClosed)
    }
}

/// One emulated extension and its Tree children
pub struct Extension {
    core: DeviceCore,
    sink: Box<dyn DeviceSink>,
    children: Vec<TreeChild>,
    port: LinkPort,
    adapter: Arc<dyn CanAdapter>,
    rx: mpsc::Receiver<CanRxEvent>,
    reorder: ReorderBuffer,
    command_rx: mpsc::Receiver<ExtensionCommand>,
    tuning: EngineTuning,
}

impl Extension {
    /// Build an extension around an adapter and its receive channel.
    ///
    /// The extension's STM32 device ID comes from the configured crypto
    /// master blob when it decodes; Tree children keep the serial-derived
    /// default.
    pub fn new(
        identity: DeviceIdentity,
        crypto: Arc<CryptoConfig>,
        sink: Box<dyn DeviceSink>,
        adapter: Arc<dyn CanAdapter>,
        rx: mpsc::Receiver<CanRxEvent>,
        tuning: EngineTuning,
    ) -> (Self, ExtensionHandle) {
        let mut identity = identity;
        if let Ok(master) = crypto.master_device_id_bytes() {
            identity.stm32_id = master;
        }

        let core = DeviceCore::new(
            identity,
            crypto,
            DeviceRole::Extension,
            0x00,
            tuning.clone(),
        );
        let (command_tx, command_rx) = mpsc::channel(16);
        let reorder = ReorderBuffer::new(tuning.reorder_capacity);
        let port = LinkPort::new(adapter.clone());

        let extension = Self {
            core,
            sink,
            children: Vec::new(),
            port,
            adapter,
            rx,
            reorder,
            command_rx,
            tuning,
        };
        (extension, ExtensionHandle { command_tx })
    }

    /// Attach a Tree child on the given branch.
    pub fn add_child(
        &mut self,
        identity: DeviceIdentity,
        branch: TreeBranch,
        sink: Box<dyn DeviceSink>,
    ) {
        info!(
            serial = format_args!("{:#010x}", identity.serial),
            branch = ?branch,
            "tree child attached"
        );
        let core = DeviceCore::new(
            identity,
            Arc::clone(&self.core.crypto),
            DeviceRole::TreeChild,
            branch.tag(),
            self.tuning.clone(),
        );
        self.children.push(TreeChild {
            core,
            sink,
        });
    }

    /// The extension's own core (handy for inspection in tests).
    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    /// Lifecycle state of the child with the given serial.
    pub fn child_state(&self, serial: u32) -> Option<LifecycleState> {
        self.children
            .iter()
            .find(|child| child.core.identity().serial == serial)
            .map(|child| child.core.lifecycle())
    }

    /// Assignment of the child with the given serial.
    pub fn child_assignment(&self, serial: u32) -> Option<u8> {
        self.children
            .iter()
            .find(|child| child.core.identity().serial == serial)
            .and_then(|child| child.core.assignment())
    }

    /// Run until shutdown. Frames dispatch strictly in adapter-sequence
    /// order, one at a time; timers tick once a second.
    pub async fn run(mut self) -> Result<()> {
        info!(
            serial = format_args!("{:#010x}", self.core.identity().serial),
            children = self.children.len(),
            "extension starting"
        );
        self.adapter.start_receive().await?;

        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.rx.recv() => {
                    match received {
                        Some(event) => {
                            for can in self.reorder.push(event.sequence, event.frame) {
                                self.process_frame(can).await;
                            }
                        }
                        None => {
                            warn!("adapter receive channel closed");
                            break;
                        }
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(ExtensionCommand::GetStats(tx)) => {
                            let _ = tx.send(self.stats());
                        }
                        Some(ExtensionCommand::Shutdown) => {
                            info!("extension shutdown requested");
                            break;
                        }
                        // Every handle dropped: nobody can stop us later.
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.stop().await
    }

    /// Deliver one raw CAN frame through the routing rules.
    ///
    /// Handler failures are logged and swallowed; nothing a peer sends may
    /// kill the processing loop.
    pub async fn process_frame(&mut self, can: CanFrame) {
        let frame = match NatFrame::decode(&can) {
            Ok(frame) => frame,
            Err(_) => {
                trace!(id = format_args!("{:#010x}", can.id), "non-NAT frame ignored");
                return;
            }
        };

        // Our own transmissions and other devices' replies.
        if frame.direction != Direction::ServerToDevice {
            return;
        }

        let accepted = match self.core.assignment() {
            Some(nat) => frame.nat_id == nat || frame.nat_id == BROADCAST_NAT,
            None => frame.nat_id == UNASSIGNED_NAT || frame.nat_id == BROADCAST_NAT,
        };
        if !accepted {
            trace!(nat = frame.nat_id, "frame for another extension");
            return;
        }

        match frame.device_id {
            0 => {
                self.handle_locally(&frame).await;

                // An assignment for somebody else's serial: one of ours?
                if frame.command == Command::NatOfferConfirm
                    && frame.val32() != self.core.identity().serial
                {
                    self.route_to_child(&frame).await;
                }
                if frame.command == Command::IdentifyUnknown {
                    self.offer_cascade().await;
                }
            }
            BROADCAST_DEVICE => {
                // Local handling first so e.g. a broadcast assignment is in
                // effect before children see the frame.
                self.handle_locally(&frame).await;

                if frame.command == Command::IdentifyUnknown {
                    self.offer_cascade().await;
                } else {
                    self.fan_out(&frame).await;
                }
            }
            _ => {
                self.route_to_child(&frame).await;
            }
        }
    }

    async fn handle_locally(&mut self, frame: &NatFrame) {
        let ctx = SendCtx {
            port: &self.port,
            parent_nat: None,
        };
        if let Err(err) = self.core.handle_frame(frame, self.sink.as_mut(), &ctx).await {
            error!(error = %err, command = %frame.command, "extension handler failed");
        }
    }

    /// Broadcast fan-out: every child sees the frame.
    ///
    /// Children exist on the bus only under an Online parent.
    async fn fan_out(&mut self, frame: &NatFrame) {
        if self.core.lifecycle() != LifecycleState::Online {
            return;
        }
        let parent_nat = self.core.assignment();
        for child in &mut self.children {
            let ctx = SendCtx {
                port: &self.port,
                parent_nat,
            };
            if let Err(err) = child.core.handle_frame(frame, child.sink.as_mut(), &ctx).await {
                error!(
                    error = %err,
                    serial = format_args!("{:#010x}", child.core.identity().serial),
                    "child handler failed"
                );
            }
        }
    }

    /// Deliver to the first child claiming the address.
    async fn route_to_child(&mut self, frame: &NatFrame) {
        if self.core.lifecycle() != LifecycleState::Online {
            debug!(command = %frame.command, "child traffic while the extension is not online");
            return;
        }
        let parent_nat = self.core.assignment();
        for child in &mut self.children {
            let claimed = match child.core.assignment() {
                Some(nat) if frame.device_id == nat => true,
                _ => {
                    (frame.device_id & 0x80 != 0
                        && child.core.lifecycle() == LifecycleState::Parked)
                        || (frame.command == Command::NatOfferConfirm
                            && frame.val32() == child.core.identity().serial)
                }
            };
            if !claimed {
                continue;
            }

            let ctx = SendCtx {
                port: &self.port,
                parent_nat,
            };
            if let Err(err) = child.core.handle_frame(frame, child.sink.as_mut(), &ctx).await {
                error!(
                    error = %err,
                    serial = format_args!("{:#010x}", child.core.identity().serial),
                    "child handler failed"
                );
            }
            return;
        }
        debug!(
            device = frame.device_id,
            command = %frame.command,
            "no child claimed the frame"
        );
    }

    /// `IdentifyUnknown` cascade: an Online extension walks its children
    /// and has every unassigned one announce itself, paced apart so the
    /// Miniserver can keep up.
    async fn offer_cascade(&mut self) {
        if self.core.lifecycle() != LifecycleState::Online {
            return;
        }

        let parent_nat = self.core.assignment();
        let mut first = true;
        for child in &mut self.children {
            child.core.state.on_identify_unknown();
            if child.core.lifecycle() != LifecycleState::Offline {
                continue;
            }
            if !first && !self.tuning.offer_cascade_gap.is_zero() {
                tokio::time::sleep(self.tuning.offer_cascade_gap).await;
            }
            first = false;

            let ctx = SendCtx {
                port: &self.port,
                parent_nat,
            };
            if let Err(err) = child.core.emit_offer(&ctx).await {
                error!(error = %err, "child offer failed");
            }
        }
    }

    /// Advance every timer; children only live while the parent is Online.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        let ctx = SendCtx {
            port: &self.port,
            parent_nat: None,
        };
        if let Err(err) = self.core.on_tick(now, self.sink.as_mut(), &ctx).await {
            error!(error = %err, "extension tick failed");
        }

        if self.core.lifecycle() != LifecycleState::Online {
            return;
        }
        let parent_nat = self.core.assignment();
        for child in &mut self.children {
            let ctx = SendCtx {
                port: &self.port,
                parent_nat,
            };
            if let Err(err) = child.core.on_tick(now, child.sink.as_mut(), &ctx).await {
                error!(error = %err, "child tick failed");
            }
        }
    }

    fn stats(&self) -> ExtensionStats {
        ExtensionStats {
            extension: self.core.stats(),
            children: self
                .children
                .iter()
                .map(|child| (child.core.identity().serial, child.core.stats()))
                .collect(),
            reorder_dropped: self.reorder.dropped(),
        }
    }

    async fn stop(mut self) -> Result<()> {
        let parent_nat = self.core.assignment();
        for child in &mut self.children {
            let ctx = SendCtx {
                port: &self.port,
                parent_nat,
            };
            if let Err(err) = child.core.shutdown(&ctx).await {
                warn!(error = %err, "child goodbye failed");
            }
        }

        let ctx = SendCtx {
            port: &self.port,
            parent_nat: None,
        };
        if let Err(err) = self.core.shutdown(&ctx).await {
            warn!(error = %err, "extension goodbye failed");
        }

        self.adapter.stop_receive().await?;
        info!("extension stopped");
        Ok(())
    }
}
