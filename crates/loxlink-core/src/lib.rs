//! Loxone-Link NAT protocol: wire-level building blocks
//!
//! This crate contains the pure, I/O-free pieces of the Loxone-Link NAT
//! protocol as spoken between a Miniserver and its extensions over CAN:
//!
//! - [`frame`] - the 29-bit CAN frame ↔ NAT frame codec
//! - [`command`] - NAT command bytes and protocol constants
//! - [`crc`] - STM32-hardware-compatible CRC32
//! - [`crypto`] - key-derivation hashes and the AES-128-CBC schedules used
//!   by the device-ID exchange and the authentication challenge
//! - [`config`] - parsed Miniserver configuration records and the boot-time
//!   crypto material
//! - [`error`] - shared error type
//!
//! Everything here is deterministic and synchronous; the stateful protocol
//! engine (lifecycle, fragmentation, routing) lives in `loxlink-engine`.
//!
//! # Example
//!
//! ```rust
//! use loxlink_core::frame::NatFrame;
//! use loxlink_core::command::Command;
//!
//! let frame = NatFrame::device(0x84, 0, Command::NatOfferRequest);
//! let can = frame.encode();
//! assert_eq!(NatFrame::decode(&can).unwrap(), frame);
//! ```

pub mod command;
pub mod config;
pub mod crc;
pub mod crypto;
pub mod error;
pub mod frame;

pub use command::{Command, ResetReason, UNASSIGNED_NAT};
pub use config::{ConfigRecord, CryptoConfig};
pub use error::{LinkError, Result};
pub use frame::{CanFrame, Direction, FragmentedNatFrame, NatFrame};
