//! # Test State
//!
//! The single aggregate describing the configured test and its progress.
//!
//! ## Access
//!
//! One [`SharedTestState`] instance exists per device. It is guarded as a whole by a
//! critical-section mutex; no field is ever touched without the lock.
//!
//! - Written by the controller task only: every field. Radio events reach the
//!   controller through the event channel, so radio-derived fields (`stats`,
//!   `packets_crc_error`, `rssi_latch`, `per`, `ma`, `packets_sent`) and operator
//!   settings share one writer.
//! - Read by any task through [`SharedTestState::snapshot`], which copies the
//!   aggregate out under the lock.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::messages::PAYLOAD_LEN_MIN;
use crate::phy::{self, FrameFamily, PHY_DEFAULT, PhyDescriptor, PhyId};
use crate::stats::PacketStatistics;

/// Packets requested value meaning "transmit until stopped".
pub const PKTS_REQUESTED_REPEAT: u16 = 0xFFFF;
/// In repeat mode the sent counter wraps back to 1 after this value.
pub const PKTS_SENT_REPEAT_WRAP: u16 = 50_000;
/// Choices offered by the packets requested button.
pub const PKTS_REQUESTED_OPTIONS: [u16; 8] = [500, 1000, 2500, 5000, 10000, 25000, 50000, PKTS_REQUESTED_REPEAT];
pub const PKTS_REQUESTED_DEFAULT_INDEX: usize = 1;

/// Highest link-level id.
pub const DEVICE_ID_MAX: u8 = 32;

/// Value read back from `pkts_rcvd` before the first packet of a run.
pub const PKTS_RCVD_INVALID: u16 = 0xFFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RadioMode {
    /// Interactive mode of the operator UI; a run cannot be started from it.
    Trx = 0,
    Rx = 1,
    Tx = 2,
}

impl RadioMode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(RadioMode::Trx),
            1 => Some(RadioMode::Rx),
            2 => Some(RadioMode::Tx),
            _ => None,
        }
    }
}

/// Settings a device starts with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestDefaults {
    pub phy: PhyId,
    pub radio_mode: RadioMode,
    pub dest_id: u8,
    pub src_id: u8,
    /// Index into [`PKTS_REQUESTED_OPTIONS`].
    pub packets_requested_index: usize,
    pub ma_window_size: u8,
}

impl TestDefaults {
    pub const DEVICE: TestDefaults = TestDefaults {
        phy: PHY_DEFAULT,
        radio_mode: RadioMode::Rx,
        dest_id: 0,
        src_id: 0,
        packets_requested_index: PKTS_REQUESTED_DEFAULT_INDEX,
        ma_window_size: 32,
    };
}

impl Default for TestDefaults {
    fn default() -> Self {
        TestDefaults::DEVICE
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TestState {
    pub phy: PhyId,
    pub channel: u16,
    pub radio_mode: RadioMode,
    /// Transmit power in 0.1 dBm.
    pub tx_power: i16,
    pub dest_id: u8,
    pub src_id: u8,
    pub payload_length: u8,
    pub packets_requested: u16,
    pub packets_sent: u16,
    pub packets_crc_error: u16,
    pub stats: PacketStatistics,
    /// Window used when the statistics are next cleared.
    pub ma_window_size: u8,
    pub logging_enabled: bool,
    pub is_running: bool,
    /// RSSI of the last accepted packet.
    pub rssi_latch: i8,
    /// Packet error rate in percent, recomputed per accepted packet.
    pub per: f32,
    /// Moving average loss in percent, recomputed per accepted packet.
    pub ma: f32,
}

impl Default for TestState {
    fn default() -> Self {
        Self::new(&TestDefaults::default())
    }
}

impl TestState {
    /// Device defaults on the default PHY, usable in `static` initializers.
    pub const POWER_ON: TestState = TestState::on_phy(
        PHY_DEFAULT,
        FrameFamily::Ieee802154,
        &TestDefaults::DEVICE,
        PKTS_REQUESTED_OPTIONS[PKTS_REQUESTED_DEFAULT_INDEX],
    );

    pub fn new(defaults: &TestDefaults) -> Self {
        let phy = phy::supported(defaults.phy).unwrap_or(&phy::PHY_TABLE[PHY_DEFAULT as usize]);
        let packets_requested = PKTS_REQUESTED_OPTIONS
            .get(defaults.packets_requested_index)
            .copied()
            .unwrap_or(PKTS_REQUESTED_OPTIONS[PKTS_REQUESTED_DEFAULT_INDEX]);
        Self::on_phy(phy.id, phy.family, defaults, packets_requested)
    }

    const fn on_phy(phy: PhyId, family: FrameFamily, defaults: &TestDefaults, packets_requested: u16) -> Self {
        TestState {
            phy,
            channel: family.default_channel(),
            radio_mode: defaults.radio_mode,
            tx_power: family.default_tx_power(),
            dest_id: if defaults.dest_id > DEVICE_ID_MAX { DEVICE_ID_MAX } else { defaults.dest_id },
            src_id: if defaults.src_id > DEVICE_ID_MAX { DEVICE_ID_MAX } else { defaults.src_id },
            payload_length: PAYLOAD_LEN_MIN,
            packets_requested,
            packets_sent: 0,
            packets_crc_error: 0,
            stats: PacketStatistics::new(defaults.ma_window_size),
            ma_window_size: defaults.ma_window_size,
            logging_enabled: false,
            is_running: false,
            rssi_latch: 0,
            per: 0.0,
            ma: 0.0,
        }
    }

    /// Descriptor of the selected PHY.
    pub fn phy_descriptor(&self) -> &'static PhyDescriptor {
        phy::descriptor(self.phy).unwrap_or(&phy::PHY_TABLE[PHY_DEFAULT as usize])
    }

    pub fn frame_family(&self) -> FrameFamily {
        self.phy_descriptor().family
    }

    pub fn repeats_forever(&self) -> bool {
        self.packets_requested == PKTS_REQUESTED_REPEAT
    }

    /// Canonical baseline of a new run. Operator settings are kept.
    pub fn reset_run(&mut self) {
        self.packets_sent = 0;
        self.packets_crc_error = 0;
        self.stats.reset(self.ma_window_size);
        self.rssi_latch = 0;
        self.per = 0.0;
        self.ma = 0.0;
    }

    /// Next transmit counter; wraps in repeat mode.
    pub fn next_packet_counter(&self) -> u16 {
        if self.repeats_forever() && self.packets_sent >= PKTS_SENT_REPEAT_WRAP {
            1
        } else {
            self.packets_sent.wrapping_add(1)
        }
    }

    /// True once the TX side reached the requested count.
    pub fn tx_complete(&self) -> bool {
        !self.repeats_forever() && self.packets_sent >= self.packets_requested
    }

    /// True once the RX side saw the last requested sequence number.
    pub fn rx_complete(&self) -> bool {
        !self.repeats_forever() && self.stats.sequence_count() >= self.packets_requested
    }

    /// `pkts_rcvd` as read by the observer.
    pub fn packets_received_reading(&self) -> u16 {
        if self.stats.has_packets() {
            self.stats.received()
        } else {
            PKTS_RCVD_INVALID
        }
    }
}

/// Test state behind the critical-section mutex.
pub struct SharedTestState(Mutex<CriticalSectionRawMutex, RefCell<TestState>>);

impl SharedTestState {
    pub const fn new(state: TestState) -> Self {
        SharedTestState(Mutex::new(RefCell::new(state)))
    }

    /// Runs `f` with exclusive access to the state.
    ///
    /// Must not be nested: the inner call would find the state already borrowed.
    pub fn lock<U>(&self, f: impl FnOnce(&mut TestState) -> U) -> U {
        self.0.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn snapshot(&self) -> TestState {
        self.0.lock(|cell| *cell.borrow())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn device_defaults() {
        let state = TestState::default();
        assert_eq!(state.phy, 4);
        assert_eq!(state.channel, 11);
        assert_eq!(state.radio_mode, RadioMode::Rx);
        assert_eq!(state.tx_power, 80);
        assert_eq!(state.payload_length, 5);
        assert_eq!(state.packets_requested, 1000);
        assert_eq!(state.ma_window_size, 32);
        assert!(!state.logging_enabled);
        assert!(!state.is_running);
        assert_eq!(state.packets_received_reading(), PKTS_RCVD_INVALID);
    }

    #[test]
    fn power_on_matches_runtime_defaults() {
        assert_eq!(TestState::POWER_ON, TestState::default());
    }

    #[test]
    fn unsupported_default_phy_falls_back() {
        let defaults = TestDefaults {
            phy: 42,
            packets_requested_index: 99,
            ..TestDefaults::default()
        };
        let state = TestState::new(&defaults);
        assert_eq!(state.phy, PHY_DEFAULT);
        assert_eq!(state.packets_requested, 1000);
    }

    #[test]
    fn repeat_mode_counter_wraps_to_one() {
        let mut state = TestState::default();
        state.packets_requested = PKTS_REQUESTED_REPEAT;
        state.packets_sent = PKTS_SENT_REPEAT_WRAP;
        assert_eq!(state.next_packet_counter(), 1);
        assert!(!state.tx_complete());

        state.packets_requested = 1000;
        state.packets_sent = 999;
        assert_eq!(state.next_packet_counter(), 1000);
        state.packets_sent = 1000;
        assert!(state.tx_complete());
    }

    #[test]
    fn reset_run_keeps_settings() {
        let mut state = TestState::default();
        state.dest_id = 3;
        state.packets_sent = 17;
        state.packets_crc_error = 2;
        state.stats.on_packet_received(9, state.ma_window_size);
        state.reset_run();
        assert_eq!(state.dest_id, 3);
        assert_eq!(state.packets_sent, 0);
        assert_eq!(state.packets_crc_error, 0);
        assert!(!state.stats.has_packets());
    }

    #[test]
    fn snapshot_copies_locked_state() {
        let shared = SharedTestState::new(TestState::default());
        shared.lock(|state| state.packets_sent = 12);
        let snapshot = shared.snapshot();
        shared.lock(|state| state.packets_sent = 13);
        assert_eq!(snapshot.packets_sent, 12);
        assert_eq!(shared.snapshot().packets_sent, 13);
    }
}
