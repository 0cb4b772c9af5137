//! Advertising payloads published through the short-range protocol stack.
//!
//! Both payloads start with the flags AD structure and the shortened local name
//! `DMPxxxx`, where `xxxx` is the upper-case hex of the first two device address
//! bytes read as a little-endian u16.

use super::{COMPANY_ID, FrameError};

/// Legacy advertising data limit.
pub const ADVERTISING_DATA_MAX: usize = 31;

/// 128-bit service UUID advertised while connectable.
pub const RANGE_TEST_SERVICE_UUID: [u8; 16] = [
    0x63, 0x7e, 0x17, 0x3b, 0x39, 0x9e, 0x20, 0x9f, 0x62, 0x4d, 0xe6, 0x17, 0x49, 0xa6, 0x0a, 0x53,
];

/// Connectable advertising interval (100 ms in 0.625 ms units).
pub const CONNECTABLE_ADVERTISING_INTERVAL: u16 = 160;
/// Realtime data is pushed at the fastest legacy interval.
pub const REALTIME_ADVERTISING_INTERVAL: u16 = 32;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_SHORTENED_NAME: u8 = 0x08;
const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
const AD_TYPE_MANUFACTURER_SPECIFIC: u8 = 0xFF;
const NAME_PREFIX: &[u8; 3] = b"DMP";

pub type AdvertisingData = heapless::Vec<u8, ADVERTISING_DATA_MAX>;

/// Latest receiver sample pushed to observers during an RX run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RealtimeAdvertisement {
    pub rssi: i8,
    pub count: u16,
    pub received: u16,
}

impl RealtimeAdvertisement {
    pub fn encode(&self, device_address: &[u8; 6]) -> Result<AdvertisingData, FrameError> {
        let mut data = header(device_address)?;
        let count = self.count.to_le_bytes();
        let received = self.received.to_le_bytes();
        let company = COMPANY_ID.to_le_bytes();
        data.extend_from_slice(&[
            9,
            AD_TYPE_MANUFACTURER_SPECIFIC,
            company[0],
            company[1],
            0x00,
            self.rssi as u8,
            count[0],
            count[1],
            received[0],
            received[1],
        ])
        .map_err(|_| FrameError::TooLong)?;
        Ok(data)
    }

    /// Parses the manufacturer specific part back, as an observer would.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let manufacturer = find_ad_structure(data, AD_TYPE_MANUFACTURER_SPECIFIC).ok_or(FrameError::UnknownFrame)?;
        if manufacturer.len() < 8 || u16::from_le_bytes([manufacturer[0], manufacturer[1]]) != COMPANY_ID {
            return Err(FrameError::UnknownFrame);
        }
        Ok(RealtimeAdvertisement {
            rssi: manufacturer[3] as i8,
            count: u16::from_le_bytes([manufacturer[4], manufacturer[5]]),
            received: u16::from_le_bytes([manufacturer[6], manufacturer[7]]),
        })
    }
}

/// Advertising data of the connectable configuration service.
pub fn connectable_advertisement(device_address: &[u8; 6]) -> Result<AdvertisingData, FrameError> {
    let mut data = header(device_address)?;
    data.push(1 + RANGE_TEST_SERVICE_UUID.len() as u8).map_err(|_| FrameError::TooLong)?;
    data.push(AD_TYPE_INCOMPLETE_UUID128).map_err(|_| FrameError::TooLong)?;
    data.extend_from_slice(&RANGE_TEST_SERVICE_UUID).map_err(|_| FrameError::TooLong)?;
    Ok(data)
}

/// Shortened local name derived from the device address.
pub fn local_name(device_address: &[u8; 6]) -> [u8; 7] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let id = u16::from_le_bytes([device_address[0], device_address[1]]);
    let mut name = [0u8; 7];
    name[..3].copy_from_slice(NAME_PREFIX);
    for (index, shift) in [12u16, 8, 4, 0].iter().enumerate() {
        name[3 + index] = HEX[((id >> shift) & 0x0F) as usize];
    }
    name
}

fn header(device_address: &[u8; 6]) -> Result<AdvertisingData, FrameError> {
    let mut data = AdvertisingData::new();
    let name = local_name(device_address);
    data.extend_from_slice(&[2, AD_TYPE_FLAGS, 0x04 | 0x02]).map_err(|_| FrameError::TooLong)?;
    data.push(1 + name.len() as u8).map_err(|_| FrameError::TooLong)?;
    data.push(AD_TYPE_SHORTENED_NAME).map_err(|_| FrameError::TooLong)?;
    data.extend_from_slice(&name).map_err(|_| FrameError::TooLong)?;
    Ok(data)
}

fn find_ad_structure(data: &[u8], ad_type: u8) -> Option<&[u8]> {
    let mut index = 0;
    while index < data.len() {
        let length = data[index] as usize;
        if length == 0 || index + 1 + length > data.len() {
            return None;
        }
        if data[index + 1] == ad_type {
            return Some(&data[index + 2..index + 1 + length]);
        }
        index += 1 + length;
    }
    None
}
