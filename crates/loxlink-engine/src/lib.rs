//! Loxone-Link NAT protocol engine
//!
//! This crate emulates Loxone-Link devices well enough that a Miniserver
//! will discover, assign, authenticate, configure and control them as if
//! they were real hardware. It sits between a CAN adapter (any
//! implementation of [`adapter::CanAdapter`]) and pluggable device sinks
//! that model the simulated hardware.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Extension                              │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  ┌─────────────┐   ┌───────────────┐   ┌──────────────────┐    │
//! │  │ CAN adapter │──►│ ReorderBuffer │──►│ DeviceCore       │    │
//! │  │ (rx events) │   │ (by sequence) │   │  dispatch        │    │
//! │  └─────────────┘   └───────────────┘   │  assembler       │    │
//! │        ▲                               │  state machine   │    │
//! │        │            ┌──────────────┐   │  firmware        │    │
//! │        └────────────│ LinkPort     │◄──┴──────┬───────────┘    │
//! │                     └──────────────┘          │ fan-out        │
//! │                                        ┌──────▼───────────┐    │
//! │                                        │ Tree children    │    │
//! │                                        │ (DeviceCore each)│    │
//! │                                        └──────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One tokio task per extension owns everything mutable; frames are
//! processed strictly in adapter-sequence order, one at a time.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use loxlink_engine::{Extension, EngineTuning};
//! use loxlink_engine::device::DeviceIdentity;
//! use loxlink_engine::devices::RgbwDimmer;
//!
//! let (rx_tx, rx) = tokio::sync::mpsc::channel(64);
//! let adapter = Arc::new(my_adapter);     // implements CanAdapter
//! let identity = DeviceIdentity::new(0x12345678, loxlink_core::command::device_type::TREE_BASE_EXTENSION, 2, 10031108);
//! let (mut extension, handle) = Extension::new(identity, crypto, adapter, rx, EngineTuning::default());
//! extension.add_child(child_identity, TreeBranch::Left, Box::new(RgbwDimmer::new()));
//! tokio::spawn(extension.run());
//! ```

pub mod adapter;
pub mod device;
pub mod devices;
pub mod fragment;
pub mod firmware;
pub mod reorder;
pub mod state;
pub mod test_utils;
pub mod tree;
pub mod tuning;

mod handlers;

pub use adapter::{CanAdapter, CanRxEvent, LinkPort};
pub use device::{DeviceCore, DeviceIdentity, DeviceRole, DeviceStats};
pub use devices::DeviceSink;
pub use state::LifecycleState;
pub use tree::{Extension, ExtensionHandle, ExtensionStats, TreeBranch};
pub use tuning::EngineTuning;
