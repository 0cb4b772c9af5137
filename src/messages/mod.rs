//! # Messages Module
//!
//! Byte-level formats exchanged with the radio and with remote observers.
//!
//! ## Key Types
//!
//! - `RangeTestPacket`: the 5-byte payload shared by every PHY family
//! - `RadioFrame`: tagged frame variants (BLE advertising PDU, IEEE 802.15.4 data frame)
//!   with explicit encode/decode into fixed-width buffers
//! - `RealtimeAdvertisement`: receiver statistics published as advertising data

pub mod advertisement;
pub mod radio_frame;
pub mod range_test_packet;

pub use advertisement::{AdvertisingData, RealtimeAdvertisement, connectable_advertisement};
pub use radio_frame::{RADIO_FRAME_SIZE, RadioFrame, RadioFrameBuffer};
pub use range_test_packet::{PAYLOAD_LEN_MIN, RangeTestPacket};

/// Company identifier carried in manufacturer specific data.
pub const COMPANY_ID: u16 = 0x02FF;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame shorter than its fixed header")]
    TooShort,
    #[error("frame does not fit its buffer")]
    TooLong,
    #[error("frame type or signature not recognized")]
    UnknownFrame,
    #[error("length field disagrees with the frame size")]
    LengthMismatch,
    #[error("payload length {0} outside the PHY bounds")]
    PayloadLength(u8),
}
