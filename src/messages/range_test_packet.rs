//! # Range Test Packet
//!
//! The 5-byte application payload carried inside every proprietary test frame,
//! whatever the PHY family.
//!
//! ## Layout
//!
//! - Bytes 0-1: packet counter (little-endian u16)
//! - Byte 2: destination device id
//! - Byte 3: source device id
//! - Byte 4: repeat marker (unused by the receiver)
//!
//! Payload lengths above the minimum are padded with an alternating `0xAA, 0x55`
//! remainder.

use super::FrameError;

/// Smallest payload: exactly one [`RangeTestPacket`].
pub const PAYLOAD_LEN_MIN: u8 = RangeTestPacket::ENCODED_LEN as u8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeTestPacket {
    pub pkt_counter: u16,
    pub dest_id: u8,
    pub src_id: u8,
    pub repeat: u8,
}

impl RangeTestPacket {
    pub const ENCODED_LEN: usize = 5;

    pub const fn new(pkt_counter: u16, dest_id: u8, src_id: u8, repeat: u8) -> Self {
        RangeTestPacket {
            pkt_counter,
            dest_id,
            src_id,
            repeat,
        }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let counter = self.pkt_counter.to_le_bytes();
        [counter[0], counter[1], self.dest_id, self.src_id, self.repeat]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(FrameError::TooShort);
        }
        Ok(RangeTestPacket {
            pkt_counter: u16::from_le_bytes([bytes[0], bytes[1]]),
            dest_id: bytes[2],
            src_id: bytes[3],
            repeat: bytes[4],
        })
    }

    /// True when the packet was sent by our peer to us.
    ///
    /// # Arguments
    /// * `own_src_id` - this device's id, expected as the packet destination
    /// * `own_dest_id` - the peer's id, expected as the packet source
    pub fn is_addressed_to(&self, own_src_id: u8, own_dest_id: u8) -> bool {
        self.dest_id == own_src_id && self.src_id == own_dest_id
    }
}

/// Fills `remainder` with the alternating padding pattern.
pub fn fill_remainder(remainder: &mut [u8]) {
    for (index, byte) in remainder.iter_mut().enumerate() {
        *byte = if index % 2 == 1 { 0x55 } else { 0xAA };
    }
}
