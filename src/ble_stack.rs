//! Short-range protocol stack seam.
//!
//! The stack itself is a black box: it raises [`BleEvent`]s and accepts the commands of
//! [`ProtocolStack`]. This module also owns the attribute ids exposed to the remote
//! observer and the activation bookkeeping (advertising, connection handle) that an
//! RX run toggles to free airtime.

use log::{Level, log};

use crate::indication_queue::NotificationTransport;
use crate::messages::advertisement::{CONNECTABLE_ADVERTISING_INTERVAL, connectable_advertisement};
use crate::radio_devices::{RadioEvent, RxFrame};

/// Bit set on an attribute id to address its valid range descriptor.
pub const VALID_RANGE_DESCRIPTOR: u16 = 0x8000;

/// Largest attribute value exchanged with the observer (the PHY list).
pub const ATTRIBUTE_VALUE_MAX: usize = 96;
/// Largest write request payload.
pub const WRITE_VALUE_MAX: usize = 4;

pub type AttributeValue = heapless::Vec<u8, ATTRIBUTE_VALUE_MAX>;
pub type WriteValue = heapless::Vec<u8, WRITE_VALUE_MAX>;

/// Attributes of the range test service, with stable ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Characteristic {
    PktsSent = 0x0001,
    PktsReq = 0x0002,
    Channel = 0x0003,
    Phy = 0x0004,
    RadioMode = 0x0005,
    TxPower = 0x0006,
    DestId = 0x0007,
    SrcId = 0x0008,
    Payload = 0x0009,
    MaSize = 0x000A,
    Log = 0x000B,
    IsRunning = 0x000C,
    Per = 0x0010,
    Ma = 0x0011,
    PktsCnt = 0x0012,
    PktsRcvd = 0x0013,
    PhyList = 0x0014,
    Frequency = 0x0015,
}

impl Characteristic {
    pub const ALL: [Characteristic; 18] = [
        Characteristic::PktsSent,
        Characteristic::PktsReq,
        Characteristic::Channel,
        Characteristic::Phy,
        Characteristic::RadioMode,
        Characteristic::TxPower,
        Characteristic::DestId,
        Characteristic::SrcId,
        Characteristic::Payload,
        Characteristic::MaSize,
        Characteristic::Log,
        Characteristic::IsRunning,
        Characteristic::Per,
        Characteristic::Ma,
        Characteristic::PktsCnt,
        Characteristic::PktsRcvd,
        Characteristic::PhyList,
        Characteristic::Frequency,
    ];

    pub const fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|characteristic| characteristic.id() == id)
    }

    /// Width of the little-endian integer encoding, 0 for the text attribute.
    pub const fn width(self) -> usize {
        match self {
            Characteristic::PktsSent
            | Characteristic::PktsReq
            | Characteristic::Channel
            | Characteristic::Phy
            | Characteristic::TxPower
            | Characteristic::Per
            | Characteristic::Ma
            | Characteristic::PktsCnt
            | Characteristic::PktsRcvd
            | Characteristic::Frequency => 2,
            Characteristic::RadioMode
            | Characteristic::DestId
            | Characteristic::SrcId
            | Characteristic::Payload
            | Characteristic::MaSize
            | Characteristic::Log
            | Characteristic::IsRunning => 1,
            Characteristic::PhyList => 0,
        }
    }

    /// Range descriptor id of this characteristic.
    pub const fn valid_range_id(self) -> u16 {
        VALID_RANGE_DESCRIPTOR | self.id()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvertisingMode {
    Connectable,
    NonConnectable,
}

/// What a characteristic status event reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharacteristicStatus {
    /// The subscriber confirmed the outstanding indication.
    Confirmation,
    /// The subscriber changed its client configuration.
    ClientConfig { indications_enabled: bool },
}

/// Airtime the stack asks for to run one of its link-layer operations.
#[derive(Clone, Debug, PartialEq)]
pub enum AirtimeRequest {
    Listen { channel: u16 },
    Transmit { channel: u16, pdu: RxFrame },
}

/// Events raised by the short-range protocol stack.
#[derive(Clone, Debug, PartialEq)]
pub enum BleEvent {
    ConnectionOpened { connection: u8 },
    ConnectionClosed { connection: u8 },
    WriteRequest { characteristic: u16, value: WriteValue },
    ReadRequest { attribute: u16 },
    CharacteristicStatus { characteristic: u16, status: CharacteristicStatus },
    /// The procedure guarding the outstanding indication timed out.
    IndicationTimeout,
    /// The stack needs the radio; granted through the coexistence scheduler.
    Airtime(AirtimeRequest),
}

/// Commands accepted by the short-range protocol stack.
pub trait ProtocolStack: NotificationTransport {
    fn send_read_response(&mut self, attribute: u16, value: &[u8]);
    fn send_write_response(&mut self, characteristic: u16, code: u8);
    /// Updates a locally stored attribute, e.g. a range descriptor.
    fn write_attribute(&mut self, attribute: u16, value: &[u8]);
    fn start_advertising(&mut self, data: &[u8], mode: AdvertisingMode, interval: u16);
    fn stop_advertising(&mut self);
    fn close_connection(&mut self, connection: u8);
    /// Hands back the radio event that ended one of the stack's own operations.
    fn on_airtime_event(&mut self, _event: &RadioEvent) {}
}

impl<T: ProtocolStack + ?Sized> ProtocolStack for &mut T {
    fn send_read_response(&mut self, attribute: u16, value: &[u8]) {
        (**self).send_read_response(attribute, value)
    }

    fn send_write_response(&mut self, characteristic: u16, code: u8) {
        (**self).send_write_response(characteristic, code)
    }

    fn write_attribute(&mut self, attribute: u16, value: &[u8]) {
        (**self).write_attribute(attribute, value)
    }

    fn start_advertising(&mut self, data: &[u8], mode: AdvertisingMode, interval: u16) {
        (**self).start_advertising(data, mode, interval)
    }

    fn stop_advertising(&mut self) {
        (**self).stop_advertising()
    }

    fn close_connection(&mut self, connection: u8) {
        (**self).close_connection(connection)
    }

    fn on_airtime_event(&mut self, event: &RadioEvent) {
        (**self).on_airtime_event(event)
    }
}

/// Connection and advertising bookkeeping of the short-range role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShortRangeLink {
    connection: Option<u8>,
    deactivated: bool,
}

impl ShortRangeLink {
    pub const fn new() -> Self {
        ShortRangeLink {
            connection: None,
            deactivated: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated
    }

    pub fn on_connection_opened(&mut self, connection: u8) {
        log!(Level::Info, "Connection {} opened", connection);
        self.connection = Some(connection);
    }

    /// Forgets the connection and advertises again unless the role was deactivated.
    pub fn on_connection_closed<S: ProtocolStack>(&mut self, stack: &mut S, device_address: &[u8; 6]) {
        log!(Level::Info, "Connection closed");
        self.connection = None;
        if !self.deactivated {
            start_connectable(stack, device_address);
        }
    }

    /// Frees the airtime for a receive run: closes the connection or stops advertising.
    pub fn deactivate<S: ProtocolStack>(&mut self, stack: &mut S) {
        self.deactivated = true;
        match self.connection {
            Some(connection) => stack.close_connection(connection),
            None => stack.stop_advertising(),
        }
    }

    /// Returns to connectable advertising if nobody is connected.
    pub fn activate<S: ProtocolStack>(&mut self, stack: &mut S, device_address: &[u8; 6]) {
        self.deactivated = false;
        if self.connection.is_none() {
            stack.stop_advertising();
            start_connectable(stack, device_address);
        }
    }
}

/// Starts connectable advertising of the configuration service.
pub fn start_connectable<S: ProtocolStack>(stack: &mut S, device_address: &[u8; 6]) {
    match connectable_advertisement(device_address) {
        Ok(data) => stack.start_advertising(&data, AdvertisingMode::Connectable, CONNECTABLE_ADVERTISING_INTERVAL),
        Err(error) => log!(Level::Error, "Connectable advertisement not built: {}", error),
    }
}
