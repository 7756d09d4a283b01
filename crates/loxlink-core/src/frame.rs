//! CAN frame ↔ NAT frame codec
//!
//! NAT frames ride in 29-bit extended CAN frames with an 8-byte payload.
//! The identifier packs (MSB first):
//!
//! - bits 28-24: fixed `10000` - the NAT prefix
//! - bits 22-21: direction, `11` for server→device, `00` for device→server
//! - bit 20: fragmented-transfer flag
//! - bits 19-12: NAT id (extension slot)
//! - bits 11-8: reserved
//! - bits 7-0: command byte
//!
//! Data byte 0 carries the device sub-address; the remaining seven bytes are
//! the NAT payload. The payload is always seven bytes on the wire; logically
//! shorter payloads leave the tail zeroed.

use crate::command::Command;
use crate::error::{LinkError, Result};

/// Bits that identify a NAT frame on the CAN bus.
const NAT_PREFIX: u32 = 0x1000_0000;
const NAT_PREFIX_MASK: u32 = 0xF800_0000;
const DIRECTION_BITS: u32 = 0x0060_0000;
const FRAGMENTED_BIT: u32 = 0x0010_0000;

/// A raw 29-bit extended CAN frame as exchanged with the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// 29-bit extended identifier
    pub id: u32,
    /// Payload, always transmitted with DLC 8
    pub data: [u8; 8],
    /// Data length code; NAT frames always use 8
    pub dlc: u8,
}

impl CanFrame {
    /// Create a frame with DLC 8.
    pub fn new(id: u32, data: [u8; 8]) -> Self {
        Self { id, data, dlc: 8 }
    }

    /// Whether the identifier carries the NAT prefix.
    pub fn is_nat(&self) -> bool {
        self.id & NAT_PREFIX_MASK == NAT_PREFIX
    }
}

/// Who is speaking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Emitted by an extension or Tree device
    DeviceToServer,
    /// Emitted by the Miniserver
    ServerToDevice,
}

/// A decoded NAT frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatFrame {
    /// Extension slot address
    pub nat_id: u8,
    /// Sub-address within the slot; 0 is the extension itself
    pub device_id: u8,
    /// Command byte
    pub command: Command,
    /// Seven payload bytes, zero-filled when logically shorter
    pub data: [u8; 7],
    /// Who emitted the frame
    pub direction: Direction,
    /// Set on `FragmentStart`/`FragmentData` transport frames
    pub fragmented: bool,
}

impl NatFrame {
    /// A device→server frame with a zeroed payload.
    pub fn device(nat_id: u8, device_id: u8, command: Command) -> Self {
        Self {
            nat_id,
            device_id,
            command,
            data: [0; 7],
            direction: Direction::DeviceToServer,
            fragmented: false,
        }
    }

    /// A server→device frame with a zeroed payload.
    pub fn server(nat_id: u8, device_id: u8, command: Command) -> Self {
        Self {
            nat_id,
            device_id,
            command,
            data: [0; 7],
            direction: Direction::ServerToDevice,
            fragmented: false,
        }
    }

    /// Replace the payload.
    pub fn with_data(mut self, data: [u8; 7]) -> Self {
        self.data = data;
        self
    }

    /// Mark the frame as fragment transport.
    pub fn with_fragmented(mut self, fragmented: bool) -> Self {
        self.fragmented = fragmented;
        self
    }

    /// First payload byte.
    pub fn b0(&self) -> u8 {
        self.data[0]
    }

    /// Little-endian u16 at payload bytes 1-2.
    pub fn val16(&self) -> u16 {
        u16::from_le_bytes([self.data[1], self.data[2]])
    }

    /// Little-endian u32 at payload bytes 3-6.
    pub fn val32(&self) -> u32 {
        u32::from_le_bytes([self.data[3], self.data[4], self.data[5], self.data[6]])
    }

    /// Set the first payload byte.
    pub fn set_b0(&mut self, value: u8) {
        self.data[0] = value;
    }

    /// Store a little-endian u16 at payload bytes 1-2.
    pub fn set_val16(&mut self, value: u16) {
        self.data[1..3].copy_from_slice(&value.to_le_bytes());
    }

    /// Store a little-endian u32 at payload bytes 3-6.
    pub fn set_val32(&mut self, value: u32) {
        self.data[3..7].copy_from_slice(&value.to_le_bytes());
    }

    /// Pack into a CAN frame.
    pub fn encode(&self) -> CanFrame {
        let mut id = NAT_PREFIX;
        if self.direction == Direction::ServerToDevice {
            id |= DIRECTION_BITS;
        }
        if self.fragmented {
            id |= FRAGMENTED_BIT;
        }
        id |= u32::from(self.nat_id) << 12;
        id |= u32::from(self.command.byte());

        let mut data = [0u8; 8];
        data[0] = self.device_id;
        data[1..8].copy_from_slice(&self.data);

        CanFrame::new(id, data)
    }

    /// Unpack a CAN frame, rejecting anything without the NAT prefix.
    pub fn decode(can: &CanFrame) -> Result<Self> {
        if !can.is_nat() {
            return Err(LinkError::NotANatFrame { id: can.id });
        }

        let direction = if can.id & DIRECTION_BITS == DIRECTION_BITS {
            Direction::ServerToDevice
        } else {
            Direction::DeviceToServer
        };

        let mut data = [0u8; 7];
        data.copy_from_slice(&can.data[1..8]);

        Ok(Self {
            nat_id: ((can.id >> 12) & 0xFF) as u8,
            device_id: can.data[0],
            command: Command::from((can.id & 0xFF) as u8),
            data,
            direction,
            fragmented: can.id & FRAGMENTED_BIT != 0,
        })
    }
}

/// A logical payload reassembled from a fragmented transfer
///
/// Exists only between a `FragmentStart` and the `FragmentData` that
/// completes the announced size; the assembler discards it on CRC failure
/// before it ever reaches dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentedNatFrame {
    /// Extension slot the transfer was addressed to
    pub nat_id: u8,
    /// Device sub-address the transfer was addressed to
    pub device_id: u8,
    /// The command the payload belongs to (from the `FragmentStart` header)
    pub command: Command,
    /// Reassembled payload bytes
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_packs_the_documented_layout() {
        let mut frame = NatFrame::server(0x07, 0x11, Command::NatOfferConfirm);
        frame.set_b0(0x07);
        let can = frame.encode();

        assert_eq!(can.id & NAT_PREFIX_MASK, NAT_PREFIX);
        assert_eq!(can.id & 0xFF, 0xFD);
        assert_eq!((can.id >> 12) & 0xFF, 0x07);
        assert_eq!(can.id & DIRECTION_BITS, DIRECTION_BITS);
        assert_eq!(can.id & FRAGMENTED_BIT, 0);
        assert_eq!(can.dlc, 8);
        assert_eq!(can.data[0], 0x11);
        assert_eq!(can.data[1], 0x07);
    }

    #[test]
    fn decode_rejects_foreign_ids() {
        let can = CanFrame::new(0x0400_0123, [0; 8]);
        assert!(matches!(
            NatFrame::decode(&can),
            Err(LinkError::NotANatFrame { id: 0x0400_0123 })
        ));
    }

    #[test]
    fn device_frames_clear_the_direction_bits() {
        let can = NatFrame::device(0x84, 0, Command::NatOfferRequest).encode();
        assert_eq!(can.id & DIRECTION_BITS, 0);
        let decoded = NatFrame::decode(&can).unwrap();
        assert_eq!(decoded.direction, Direction::DeviceToServer);
    }

    #[test]
    fn fragmented_bit_round_trips() {
        let frame = NatFrame::server(0x07, 0, Command::FragmentStart).with_fragmented(true);
        let decoded = NatFrame::decode(&frame.encode()).unwrap();
        assert!(decoded.fragmented);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn nat_round_trip_all_fields() {
        let mut frame = NatFrame::device(0x3A, 0x11, Command::Alive);
        frame.set_b0(0x05);
        frame.set_val16(0x0384);
        frame.set_val32(0xDEAD_BEEF);

        let decoded = NatFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.b0(), 0x05);
        assert_eq!(decoded.val16(), 0x0384);
        assert_eq!(decoded.val32(), 0xDEAD_BEEF);
    }

    #[test]
    fn can_round_trip_syntactically_valid_ids() {
        // Every combination of direction, fragment bit, NAT and command bits
        // survives decode → encode unchanged.
        for &(dir, frag, nat, cmd) in &[
            (true, false, 0x00u8, 0x05u8),
            (false, true, 0x84, 0xF1),
            (true, true, 0xFF, 0xF0),
            (false, false, 0x07, 0xFE),
        ] {
            let mut id = NAT_PREFIX | u32::from(nat) << 12 | u32::from(cmd);
            if dir {
                id |= DIRECTION_BITS;
            }
            if frag {
                id |= FRAGMENTED_BIT;
            }
            let can = CanFrame::new(id, [0x11, 1, 2, 3, 4, 5, 6, 7]);
            let decoded = NatFrame::decode(&can).unwrap();
            assert_eq!(decoded.encode(), can);
        }
    }

    #[test]
    fn val_views_are_little_endian() {
        let can = CanFrame::new(NAT_PREFIX | 0x08, [0, 0xAA, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
        let frame = NatFrame::decode(&can).unwrap();
        assert_eq!(frame.b0(), 0xAA);
        assert_eq!(frame.val16(), 0x1234);
        assert_eq!(frame.val32(), 0x1234_5678);
    }
}
