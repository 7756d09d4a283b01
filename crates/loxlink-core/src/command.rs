//! NAT command bytes and protocol constants
//!
//! The command byte lives in the low 8 bits of the 29-bit CAN identifier.
//! [`Command`] covers every command the engine handles; bytes outside the
//! table round-trip through [`Command::Unknown`] so dispatch can log and
//! drop them without losing the original value.

use std::fmt::{self, Display};

/// NAT address used by devices that have not been assigned a slot yet.
///
/// Until a `NatOfferConfirm` arrives, a device must not transmit under any
/// other NAT.
pub const UNASSIGNED_NAT: u8 = 0x84;

/// NAT address that addresses every extension on the bus.
pub const BROADCAST_NAT: u8 = 0xFF;

/// Device sub-address that addresses every device behind an extension.
pub const BROADCAST_DEVICE: u8 = 0xFF;

/// NAT protocol command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Miniserver asks a specific serial for its version block
    VersionRequest,
    /// Device announces itself after going online (fragmented, 20 bytes)
    StartInfo,
    /// Version block reply to `VersionRequest` (fragmented, 20 bytes)
    VersionInfo,
    /// Device acknowledges an applied configuration
    ConfigEqual,
    /// Liveness probe
    Ping,
    /// Liveness reply
    Pong,
    /// Keep-alive carrying config version and CRC
    Alive,
    /// Device announces it is going away on shutdown
    SetOffline,
    /// Miniserver restart notice: suppress offers until re-identify
    ExtensionsOffline,
    /// Wall-clock broadcast, informational only
    TimeSync,
    /// Enter/leave the visual identify state
    Identify,
    /// Configuration record push (fragmented)
    SendConfig,
    /// ASCII web-service request/response (fragmented)
    WebServiceRequest,
    /// CAN bus diagnostics counters reply
    CanDiagnosticsReply,
    /// CAN bus diagnostics counters request
    CanDiagnosticsRequest,
    /// CAN error counters reply
    CanErrorReply,
    /// CAN error counters request
    CanErrorRequest,
    /// Legacy encrypted device-ID exchange (fragmented)
    CryptDeviceIdRequest,
    /// AES challenge (fragmented)
    CryptChallengeAuthRequest,
    /// AES challenge reply (fragmented)
    CryptChallengeAuthReply,
    /// Firmware update mini-protocol (fragmented)
    FirmwareUpdate,
    /// Header of a fragmented transfer
    FragmentStart,
    /// Data chunk of a fragmented transfer
    FragmentData,
    /// Miniserver probes for devices without a NAT
    IdentifyUnknown,
    /// Enumerate devices on an extension
    SearchDevicesRequest,
    /// Enumeration reply, one per device
    SearchDevicesResponse,
    /// Miniserver assigns a NAT (or parks the device)
    NatOfferConfirm,
    /// Device requests a NAT assignment
    NatOfferRequest,
    /// Any byte outside the table above
    Unknown(u8),
}

impl Command {
    /// The raw command byte as it appears on the wire.
    pub fn byte(self) -> u8 {
        match self {
            Command::VersionRequest => 0x01,
            Command::StartInfo => 0x02,
            Command::VersionInfo => 0x03,
            Command::ConfigEqual => 0x04,
            Command::Ping => 0x05,
            Command::Pong => 0x06,
            Command::Alive => 0x08,
            Command::SetOffline => 0x09,
            Command::ExtensionsOffline => 0x0A,
            Command::TimeSync => 0x0C,
            Command::Identify => 0x10,
            Command::SendConfig => 0x11,
            Command::WebServiceRequest => 0x12,
            Command::CanDiagnosticsReply => 0x16,
            Command::CanDiagnosticsRequest => 0x17,
            Command::CanErrorReply => 0x18,
            Command::CanErrorRequest => 0x19,
            Command::CryptDeviceIdRequest => 0x99,
            Command::CryptChallengeAuthRequest => 0x9C,
            Command::CryptChallengeAuthReply => 0x9D,
            Command::FirmwareUpdate => 0xEF,
            Command::FragmentStart => 0xF0,
            Command::FragmentData => 0xF1,
            Command::IdentifyUnknown => 0xF4,
            Command::SearchDevicesRequest => 0xFB,
            Command::SearchDevicesResponse => 0xFC,
            Command::NatOfferConfirm => 0xFD,
            Command::NatOfferRequest => 0xFE,
            Command::Unknown(byte) => byte,
        }
    }

    /// Whether this command is consumed by the fragment assembler instead of
    /// the dispatch tables.
    pub fn is_fragment_transport(self) -> bool {
        matches!(self, Command::FragmentStart | Command::FragmentData)
    }
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte {
            0x01 => Command::VersionRequest,
            0x02 => Command::StartInfo,
            0x03 => Command::VersionInfo,
            0x04 => Command::ConfigEqual,
            0x05 => Command::Ping,
            0x06 => Command::Pong,
            0x08 => Command::Alive,
            0x09 => Command::SetOffline,
            0x0A => Command::ExtensionsOffline,
            0x0C => Command::TimeSync,
            0x10 => Command::Identify,
            0x11 => Command::SendConfig,
            0x12 => Command::WebServiceRequest,
            0x16 => Command::CanDiagnosticsReply,
            0x17 => Command::CanDiagnosticsRequest,
            0x18 => Command::CanErrorReply,
            0x19 => Command::CanErrorRequest,
            0x99 => Command::CryptDeviceIdRequest,
            0x9C => Command::CryptChallengeAuthRequest,
            0x9D => Command::CryptChallengeAuthReply,
            0xEF => Command::FirmwareUpdate,
            0xF0 => Command::FragmentStart,
            0xF1 => Command::FragmentData,
            0xF4 => Command::IdentifyUnknown,
            0xFB => Command::SearchDevicesRequest,
            0xFC => Command::SearchDevicesResponse,
            0xFD => Command::NatOfferConfirm,
            0xFE => Command::NatOfferRequest,
            other => Command::Unknown(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command.byte()
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unknown(byte) => write!(f, "Unknown({byte:#04x})"),
            other => write!(f, "{:?}({:#04x})", other, other.byte()),
        }
    }
}

/// Why a device last (re)booted, as reported in `StartInfo`/`VersionInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetReason {
    Undefined = 0x00,
    MiniserverStart = 0x01,
    Pairing = 0x02,
    AliveRequested = 0x03,
    Reconnect = 0x04,
    AlivePackage = 0x05,
    ReconnectBroadcast = 0x06,
    PowerOnReset = 0x20,
    StandbyReset = 0x21,
    WatchdogReset = 0x22,
    SoftwareReset = 0x23,
    PinReset = 0x24,
    WindowWatchdogReset = 0x25,
    LowPowerReset = 0x26,
}

/// Device-type codes advertised in offers and version blocks
pub mod device_type {
    /// Digital-input extension on the Link bus
    pub const DI_EXTENSION: u16 = 0x0014;
    /// Tree base extension (hosts Tree devices)
    pub const TREE_BASE_EXTENSION: u16 = 0x0013;
    /// RGBW 24V dimmer, Tree
    pub const RGBW_DIMMER_TREE: u16 = 0x800C;
    /// LED spot RGBW, Tree
    pub const LED_SPOT_RGBW_TREE: u16 = 0x8016;
    /// LED spot warm-white, Tree
    pub const LED_SPOT_WW_TREE: u16 = 0x8017;
    /// Touch, Tree
    pub const TOUCH_TREE: u16 = 0x8003;
    /// Motion sensor, Tree
    pub const MOTION_TREE: u16 = 0x8002;
}
