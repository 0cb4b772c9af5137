//! # Radio Frame Module
//!
//! Wire formats of the proprietary test frames, one variant per frame family.
//!
//! ## BLE (ADV_NONCONN_IND)
//!
//! ```text
//! [0x02, len, adv_addr(6), 0x02 0x01 0x06, mlen, 0xFF, company(2), 0x01, packet(5), remainder]
//! ```
//! `len` counts every byte after the 2-byte PDU header and `mlen` covers the
//! manufacturer specific AD structure after its length byte.
//!
//! ## IEEE 802.15.4 data frame
//!
//! ```text
//! [PHR, frame_control(2), seq, dest_pan(2), dest_addr(2), src_addr(2), packet(5), remainder]
//! ```
//! The PHR counts the MHR, the payload and the 2-byte CRC appended by the radio.
//! The CRC is never part of the buffer written to (or read from) the radio FIFO.

use super::range_test_packet::{RangeTestPacket, fill_remainder};
use super::{COMPANY_ID, FrameError, PAYLOAD_LEN_MIN};
use crate::phy::FrameFamily;

/// Largest frame buffer any family produces.
pub const RADIO_FRAME_SIZE: usize = 64;

const ADV_NONCONN_IND: u8 = 0x02;
const BLE_PDU_HEADER_LEN: usize = 2;
const BLE_ADV_ADDRESS_LEN: usize = 6;
const AD_TYPE_FLAGS: u8 = 0x01;
const AD_FLAGS_LE_GENERAL_NO_BREDR: u8 = 0x06;
const AD_TYPE_MANUFACTURER_SPECIFIC: u8 = 0xFF;
const MANUFACTURER_STRUCT_VERSION: u8 = 0x01;
/// Header + address + flags AD + manufacturer AD length/type/company/version.
const BLE_PACKET_OFFSET: usize = BLE_PDU_HEADER_LEN + BLE_ADV_ADDRESS_LEN + 3 + 5;
/// Manufacturer AD bytes that precede the range test packet, after the length byte.
const BLE_MANUFACTURER_OVERHEAD: u8 = 4;

/// Data frame, PAN id compression, short destination and source, 2006 frame version.
pub const IEEE802154_FRAME_CONTROL: u16 = 0x0001 | 0x0040 | 0x0800 | 0x2000 | 0x8000;
const IEEE802154_PHR_LEN: usize = 1;
const IEEE802154_MHR_LEN: usize = 9;
const IEEE802154_CRC_LEN: u8 = 2;
const IEEE802154_BROADCAST: u16 = 0xFFFF;

/// Repeat marker written by each family.
const BLE_REPEAT_MARKER: u8 = 0xFF;
const IEEE802154_REPEAT_MARKER: u8 = 0x00;

/// Encoded frame, ready for the radio TX FIFO.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RadioFrameBuffer {
    pub data: [u8; RADIO_FRAME_SIZE],
    pub length: usize,
}

impl RadioFrameBuffer {
    const fn empty() -> Self {
        RadioFrameBuffer {
            data: [0; RADIO_FRAME_SIZE],
            length: 0,
        }
    }

    /// Copies raw frame bytes into a transmit buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() > RADIO_FRAME_SIZE {
            return Err(FrameError::TooLong);
        }
        let mut buffer = RadioFrameBuffer::empty();
        buffer.data[..bytes.len()].copy_from_slice(bytes);
        buffer.length = bytes.len();
        Ok(buffer)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.length]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BleAdvFrame {
    pub adv_address: [u8; 6],
    pub packet: RangeTestPacket,
    pub payload_length: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ieee802154DataFrame {
    pub sequence_number: u8,
    pub dest_pan_id: u16,
    pub dest_address: u16,
    pub src_address: u16,
    pub packet: RangeTestPacket,
    pub payload_length: u8,
}

/// A proprietary test frame of either family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioFrame {
    Ble(BleAdvFrame),
    Ieee802154(Ieee802154DataFrame),
}

impl RadioFrame {
    /// Builds the frame a transmitter sends for packet counter `pkt_counter`.
    pub fn for_transmit(family: FrameFamily, pkt_counter: u16, dest_id: u8, src_id: u8, payload_length: u8, adv_address: [u8; 6]) -> Self {
        match family {
            FrameFamily::Ble => RadioFrame::Ble(BleAdvFrame {
                adv_address,
                packet: RangeTestPacket::new(pkt_counter, dest_id, src_id, BLE_REPEAT_MARKER),
                payload_length,
            }),
            FrameFamily::Ieee802154 => RadioFrame::Ieee802154(Ieee802154DataFrame {
                sequence_number: pkt_counter as u8,
                dest_pan_id: IEEE802154_BROADCAST,
                dest_address: IEEE802154_BROADCAST,
                src_address: 0x0000,
                packet: RangeTestPacket::new(pkt_counter, dest_id, src_id, IEEE802154_REPEAT_MARKER),
                payload_length,
            }),
        }
    }

    pub fn family(&self) -> FrameFamily {
        match self {
            RadioFrame::Ble(_) => FrameFamily::Ble,
            RadioFrame::Ieee802154(_) => FrameFamily::Ieee802154,
        }
    }

    pub fn packet(&self) -> &RangeTestPacket {
        match self {
            RadioFrame::Ble(frame) => &frame.packet,
            RadioFrame::Ieee802154(frame) => &frame.packet,
        }
    }

    pub fn payload_length(&self) -> u8 {
        match self {
            RadioFrame::Ble(frame) => frame.payload_length,
            RadioFrame::Ieee802154(frame) => frame.payload_length,
        }
    }

    /// Serializes the frame into a fixed-width buffer.
    ///
    /// # Returns
    /// * `Err(FrameError::PayloadLength)` if the payload length is outside the family bounds
    pub fn encode(&self) -> Result<RadioFrameBuffer, FrameError> {
        let payload_length = self.payload_length();
        if payload_length < PAYLOAD_LEN_MIN || payload_length > self.family().payload_len_max() {
            return Err(FrameError::PayloadLength(payload_length));
        }

        let mut buffer = RadioFrameBuffer::empty();
        let data = &mut buffer.data;
        let mut i = 0;
        match self {
            RadioFrame::Ble(frame) => {
                data[i] = ADV_NONCONN_IND;
                data[i + 1] = (BLE_PACKET_OFFSET - BLE_PDU_HEADER_LEN) as u8 + payload_length;
                i += BLE_PDU_HEADER_LEN;
                data[i..i + BLE_ADV_ADDRESS_LEN].copy_from_slice(&frame.adv_address);
                i += BLE_ADV_ADDRESS_LEN;
                data[i..i + 3].copy_from_slice(&[0x02, AD_TYPE_FLAGS, AD_FLAGS_LE_GENERAL_NO_BREDR]);
                i += 3;
                data[i] = BLE_MANUFACTURER_OVERHEAD + payload_length;
                data[i + 1] = AD_TYPE_MANUFACTURER_SPECIFIC;
                data[i + 2..i + 4].copy_from_slice(&COMPANY_ID.to_le_bytes());
                data[i + 4] = MANUFACTURER_STRUCT_VERSION;
                i += 5;
                data[i..i + RangeTestPacket::ENCODED_LEN].copy_from_slice(&frame.packet.encode());
                i += RangeTestPacket::ENCODED_LEN;
            }
            RadioFrame::Ieee802154(frame) => {
                data[i] = IEEE802154_MHR_LEN as u8 + payload_length + IEEE802154_CRC_LEN;
                i += IEEE802154_PHR_LEN;
                data[i..i + 2].copy_from_slice(&IEEE802154_FRAME_CONTROL.to_le_bytes());
                data[i + 2] = frame.sequence_number;
                data[i + 3..i + 5].copy_from_slice(&frame.dest_pan_id.to_le_bytes());
                data[i + 5..i + 7].copy_from_slice(&frame.dest_address.to_le_bytes());
                data[i + 7..i + 9].copy_from_slice(&frame.src_address.to_le_bytes());
                i += IEEE802154_MHR_LEN;
                data[i..i + RangeTestPacket::ENCODED_LEN].copy_from_slice(&frame.packet.encode());
                i += RangeTestPacket::ENCODED_LEN;
            }
        }
        let remainder = (payload_length - PAYLOAD_LEN_MIN) as usize;
        fill_remainder(&mut data[i..i + remainder]);
        buffer.length = i + remainder;
        Ok(buffer)
    }

    /// Parses a received frame of the expected family.
    pub fn decode(family: FrameFamily, bytes: &[u8]) -> Result<Self, FrameError> {
        match family {
            FrameFamily::Ble => decode_ble(bytes).map(RadioFrame::Ble),
            FrameFamily::Ieee802154 => decode_ieee802154(bytes).map(RadioFrame::Ieee802154),
        }
    }
}

fn decode_ble(bytes: &[u8]) -> Result<BleAdvFrame, FrameError> {
    if bytes.len() < BLE_PACKET_OFFSET + RangeTestPacket::ENCODED_LEN {
        return Err(FrameError::TooShort);
    }
    if bytes[0] & 0x0F != ADV_NONCONN_IND {
        return Err(FrameError::UnknownFrame);
    }
    let pdu_length = bytes[1] as usize;
    if bytes.len() < BLE_PDU_HEADER_LEN + pdu_length {
        return Err(FrameError::LengthMismatch);
    }
    let manufacturer = &bytes[BLE_PDU_HEADER_LEN + BLE_ADV_ADDRESS_LEN + 3..];
    if manufacturer[1] != AD_TYPE_MANUFACTURER_SPECIFIC || u16::from_le_bytes([manufacturer[2], manufacturer[3]]) != COMPANY_ID {
        return Err(FrameError::UnknownFrame);
    }
    let payload_length = manufacturer[0]
        .checked_sub(BLE_MANUFACTURER_OVERHEAD)
        .filter(|&length| length >= PAYLOAD_LEN_MIN)
        .ok_or(FrameError::LengthMismatch)?;

    let mut adv_address = [0u8; 6];
    adv_address.copy_from_slice(&bytes[BLE_PDU_HEADER_LEN..BLE_PDU_HEADER_LEN + BLE_ADV_ADDRESS_LEN]);
    Ok(BleAdvFrame {
        adv_address,
        packet: RangeTestPacket::decode(&bytes[BLE_PACKET_OFFSET..])?,
        payload_length,
    })
}

fn decode_ieee802154(bytes: &[u8]) -> Result<Ieee802154DataFrame, FrameError> {
    let packet_offset = IEEE802154_PHR_LEN + IEEE802154_MHR_LEN;
    if bytes.len() < packet_offset + RangeTestPacket::ENCODED_LEN {
        return Err(FrameError::TooShort);
    }
    let payload_length = bytes[0]
        .checked_sub(IEEE802154_MHR_LEN as u8 + IEEE802154_CRC_LEN)
        .filter(|&length| length >= PAYLOAD_LEN_MIN)
        .ok_or(FrameError::LengthMismatch)?;
    if bytes.len() < packet_offset + payload_length as usize {
        return Err(FrameError::LengthMismatch);
    }
    let mhr = &bytes[IEEE802154_PHR_LEN..packet_offset];
    if u16::from_le_bytes([mhr[0], mhr[1]]) != IEEE802154_FRAME_CONTROL {
        return Err(FrameError::UnknownFrame);
    }
    Ok(Ieee802154DataFrame {
        sequence_number: mhr[2],
        dest_pan_id: u16::from_le_bytes([mhr[3], mhr[4]]),
        dest_address: u16::from_le_bytes([mhr[5], mhr[6]]),
        src_address: u16::from_le_bytes([mhr[7], mhr[8]]),
        packet: RangeTestPacket::decode(&bytes[packet_offset..])?,
        payload_length,
    })
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    const ADDRESS: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    #[test]
    fn ble_frame_layout_matches_advertising_pdu() {
        let frame = RadioFrame::for_transmit(FrameFamily::Ble, 0x0102, 1, 2, 7, ADDRESS);
        let buffer = frame.encode().expect("encode");
        let bytes = buffer.as_bytes();
        assert_eq!(bytes.len(), 16 + 7);
        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes[1] as usize, bytes.len() - 2);
        assert_eq!(&bytes[2..8], &ADDRESS);
        assert_eq!(&bytes[8..11], &[0x02, 0x01, 0x06]);
        assert_eq!(&bytes[11..16], &[4 + 7, 0xFF, 0xFF, 0x02, 0x01]);
        assert_eq!(&bytes[16..21], &[0x02, 0x01, 1, 2, 0xFF]);
        assert_eq!(&bytes[21..], &[0xAA, 0x55]);
    }

    #[test]
    fn ieee802154_frame_layout() {
        let frame = RadioFrame::for_transmit(FrameFamily::Ieee802154, 0x0203, 5, 6, 5, ADDRESS);
        let buffer = frame.encode().expect("encode");
        let bytes = buffer.as_bytes();
        assert_eq!(bytes.len(), 1 + 9 + 5);
        assert_eq!(bytes[0], 9 + 5 + 2);
        assert_eq!(&bytes[1..3], &[0x41, 0xA8]);
        assert_eq!(bytes[3], 0x03);
        assert_eq!(&bytes[4..10], &[0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(&bytes[10..15], &[0x03, 0x02, 5, 6, 0x00]);
    }

    #[test]
    fn decoded_frames_carry_the_sent_packet() {
        for family in [FrameFamily::Ble, FrameFamily::Ieee802154] {
            let frame = RadioFrame::for_transmit(family, 42, 3, 4, 24, ADDRESS);
            let buffer = frame.encode().expect("encode");
            let decoded = RadioFrame::decode(family, buffer.as_bytes()).expect("decode");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn payload_length_outside_family_bounds_is_rejected() {
        let frame = RadioFrame::for_transmit(FrameFamily::Ble, 1, 0, 0, 25, ADDRESS);
        match frame.encode() {
            Err(FrameError::PayloadLength(25)) => {}
            other => panic!("Expected PayloadLength, got: {:?}", other.map(|b| b.length)),
        }
        let short = RadioFrame::for_transmit(FrameFamily::Ieee802154, 1, 0, 0, 4, ADDRESS);
        assert!(short.encode().is_err());
    }

    #[test]
    fn wrong_family_is_not_decoded() {
        let buffer = RadioFrame::for_transmit(FrameFamily::Ieee802154, 9, 0, 0, 10, ADDRESS).encode().expect("encode");
        assert!(RadioFrame::decode(FrameFamily::Ble, buffer.as_bytes()).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let buffer = RadioFrame::for_transmit(FrameFamily::Ieee802154, 9, 0, 0, 20, ADDRESS).encode().expect("encode");
        match RadioFrame::decode(FrameFamily::Ieee802154, &buffer.as_bytes()[..18]) {
            Err(FrameError::LengthMismatch) => {}
            other => panic!("Expected LengthMismatch, got: {:?}", other),
        }
    }
}
