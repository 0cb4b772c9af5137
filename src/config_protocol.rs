//! # Configuration Protocol
//!
//! Remote reads and writes against the fixed table of test settings, and the
//! physical-button path that advances the same settings locally.
//!
//! ## Key Components
//!
//! - [`ConfigItem`]: one implementation per setting; getter, declared valid range,
//!   local advance rule and the apply function with its side effects
//! - [`CONFIG_ITEMS`]: the ordered item table, in operator menu order
//! - [`ConfigChangeQueue`]: accepted writes waiting for the controller, in two lanes
//! - [`ConfigProtocol`]: the request handlers
//!
//! ## Ordering
//!
//! Writes are validated synchronously and answered at once with a [`WriteResult`];
//! only accepted values are queued. [`ConfigProtocol::apply_pending`] applies one
//! change per call, taking the local lane before the remote lane, so a button press
//! and a remote write arriving in the same interval are applied local first.

use heapless::Deque;
use log::{Level, log};

use crate::ble_stack::{AttributeValue, Characteristic, VALID_RANGE_DESCRIPTOR};
use crate::indication_queue::{IndicationEntry, IndicationError, IndicationQueue};
use crate::messages::PAYLOAD_LEN_MIN;
use crate::phy::{self, PHY_FREQUENCY_MHZ, PHY_TABLE, TX_POWER_INC, TX_POWER_MAX, TX_POWER_MIN};
use crate::stats::MA_WINDOW_SIZES;
use crate::test_state::{DEVICE_ID_MAX, PKTS_REQUESTED_OPTIONS, RadioMode, TestState};

/// Capacity of each change lane.
pub const CONFIG_CHANGE_QUEUE_SIZE: usize = 8;

/// Settings reachable through the operator menu and the remote table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigItemId {
    RadioMode,
    Phy,
    TxPower,
    Frequency,
    Channel,
    PayloadLength,
    PacketsRequested,
    DestId,
    SrcId,
    MaWindow,
    Logging,
    Running,
}

/// Inclusive declared range, signed so that TX power fits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidRange {
    pub min: i32,
    pub max: i32,
}

impl ValidRange {
    pub const fn new(min: i32, max: i32) -> Self {
        ValidRange { min, max }
    }

    pub fn contains(&self, value: i32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Side effect an applied change asks the controller to carry out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyEffect {
    None,
    /// Radio must be reconfigured; channel, power and payload were re-derived.
    PhyChanged,
    TxPowerChanged,
    ChannelChanged,
    StartRun,
    StopRun,
}

pub trait ConfigItem: Sync {
    fn id(&self) -> ConfigItemId;

    fn characteristic(&self) -> Characteristic;

    /// Current value in its wire representation (i16 values as their u16 bits).
    fn get(&self, state: &TestState) -> u16;

    /// Declared range checked on remote writes. `None` leaves writes unchecked.
    fn valid_range(&self, _state: &TestState) -> Option<ValidRange> {
        None
    }

    fn signed(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        true
    }

    /// Full validation of a remote value; defaults to the declared range.
    fn accepts(&self, raw: u16, state: &TestState) -> bool {
        if !self.writable() {
            return false;
        }
        let value = if self.signed() { raw as i16 as i32 } else { raw as i32 };
        self.valid_range(state).is_none_or(|range| range.contains(value))
    }

    /// Value the button moves to from the current one.
    fn next(&self, state: &TestState) -> u16;

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect;
}

struct RadioModeItem;

impl ConfigItem for RadioModeItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::RadioMode
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::RadioMode
    }

    fn get(&self, state: &TestState) -> u16 {
        state.radio_mode as u16
    }

    fn valid_range(&self, _state: &TestState) -> Option<ValidRange> {
        Some(ValidRange::new(RadioMode::Rx as i32, RadioMode::Tx as i32))
    }

    fn next(&self, state: &TestState) -> u16 {
        match state.radio_mode {
            RadioMode::Rx => RadioMode::Tx as u16,
            RadioMode::Tx | RadioMode::Trx => RadioMode::Rx as u16,
        }
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        if let Some(mode) = RadioMode::from_u16(raw) {
            state.radio_mode = mode;
        }
        ApplyEffect::None
    }
}

struct PhyItem;

impl ConfigItem for PhyItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::Phy
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::Phy
    }

    fn get(&self, state: &TestState) -> u16 {
        state.phy as u16
    }

    fn valid_range(&self, _state: &TestState) -> Option<ValidRange> {
        Some(ValidRange::new(0, PHY_TABLE.len() as i32 - 1))
    }

    fn accepts(&self, raw: u16, state: &TestState) -> bool {
        self.valid_range(state).is_some_and(|range| range.contains(raw as i32))
            && u8::try_from(raw).ok().and_then(phy::supported).is_some()
    }

    fn next(&self, state: &TestState) -> u16 {
        phy::next_supported(state.phy) as u16
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        let Some(descriptor) = u8::try_from(raw).ok().and_then(phy::supported) else {
            log!(Level::Warn, "Ignoring unsupported PHY {}", raw);
            return ApplyEffect::None;
        };
        state.phy = descriptor.id;
        state.channel = descriptor.family.default_channel();
        state.tx_power = descriptor.family.default_tx_power();
        let (min, max) = descriptor.payload_len_range();
        if state.payload_length > max {
            state.payload_length = min;
        }
        ApplyEffect::PhyChanged
    }
}

struct TxPowerItem;

impl ConfigItem for TxPowerItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::TxPower
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::TxPower
    }

    fn get(&self, state: &TestState) -> u16 {
        state.tx_power as u16
    }

    fn valid_range(&self, _state: &TestState) -> Option<ValidRange> {
        Some(ValidRange::new(TX_POWER_MIN as i32, TX_POWER_MAX as i32))
    }

    fn signed(&self) -> bool {
        true
    }

    fn next(&self, state: &TestState) -> u16 {
        let next = state.tx_power.saturating_add(TX_POWER_INC);
        (if next > TX_POWER_MAX { TX_POWER_MIN } else { next }) as u16
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        state.tx_power = raw as i16;
        ApplyEffect::TxPowerChanged
    }
}

struct FrequencyItem;

impl ConfigItem for FrequencyItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::Frequency
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::Frequency
    }

    fn get(&self, _state: &TestState) -> u16 {
        PHY_FREQUENCY_MHZ
    }

    fn writable(&self) -> bool {
        false
    }

    fn next(&self, state: &TestState) -> u16 {
        self.get(state)
    }

    fn apply(&self, _state: &mut TestState, _raw: u16) -> ApplyEffect {
        ApplyEffect::None
    }
}

struct ChannelItem;

impl ConfigItem for ChannelItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::Channel
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::Channel
    }

    fn get(&self, state: &TestState) -> u16 {
        state.channel
    }

    fn valid_range(&self, state: &TestState) -> Option<ValidRange> {
        let (min, max) = state.frame_family().channel_range();
        Some(ValidRange::new(min as i32, max as i32))
    }

    fn next(&self, state: &TestState) -> u16 {
        let (min, max) = state.frame_family().channel_range();
        if state.channel >= max || state.channel < min { min } else { state.channel + 1 }
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        let (min, max) = state.frame_family().channel_range();
        state.channel = raw.clamp(min, max);
        ApplyEffect::ChannelChanged
    }
}

struct PayloadLengthItem;

impl ConfigItem for PayloadLengthItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::PayloadLength
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::Payload
    }

    fn get(&self, state: &TestState) -> u16 {
        state.payload_length as u16
    }

    fn valid_range(&self, state: &TestState) -> Option<ValidRange> {
        let (min, max) = state.phy_descriptor().payload_len_range();
        Some(ValidRange::new(min as i32, max as i32))
    }

    fn next(&self, state: &TestState) -> u16 {
        let (min, max) = state.phy_descriptor().payload_len_range();
        if state.payload_length >= max { min as u16 } else { state.payload_length as u16 + 1 }
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        state.payload_length = raw.clamp(PAYLOAD_LEN_MIN as u16, state.frame_family().payload_len_max() as u16) as u8;
        ApplyEffect::None
    }
}

struct PacketsRequestedItem;

impl ConfigItem for PacketsRequestedItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::PacketsRequested
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::PktsReq
    }

    fn get(&self, state: &TestState) -> u16 {
        state.packets_requested
    }

    fn next(&self, state: &TestState) -> u16 {
        PKTS_REQUESTED_OPTIONS
            .iter()
            .position(|&option| option == state.packets_requested)
            .map(|index| PKTS_REQUESTED_OPTIONS[(index + 1) % PKTS_REQUESTED_OPTIONS.len()])
            .unwrap_or(PKTS_REQUESTED_OPTIONS[0])
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        state.packets_requested = raw;
        ApplyEffect::None
    }
}

struct DeviceIdItem {
    id: ConfigItemId,
}

impl DeviceIdItem {
    fn field<'a>(&self, state: &'a mut TestState) -> &'a mut u8 {
        if self.id == ConfigItemId::DestId { &mut state.dest_id } else { &mut state.src_id }
    }
}

impl ConfigItem for DeviceIdItem {
    fn id(&self) -> ConfigItemId {
        self.id
    }

    fn characteristic(&self) -> Characteristic {
        if self.id == ConfigItemId::DestId { Characteristic::DestId } else { Characteristic::SrcId }
    }

    fn get(&self, state: &TestState) -> u16 {
        (if self.id == ConfigItemId::DestId { state.dest_id } else { state.src_id }) as u16
    }

    fn valid_range(&self, _state: &TestState) -> Option<ValidRange> {
        Some(ValidRange::new(0, DEVICE_ID_MAX as i32))
    }

    fn next(&self, state: &TestState) -> u16 {
        let current = self.get(state);
        if current >= DEVICE_ID_MAX as u16 { 0 } else { current + 1 }
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        *self.field(state) = raw.min(DEVICE_ID_MAX as u16) as u8;
        ApplyEffect::None
    }
}

struct MaWindowItem;

impl ConfigItem for MaWindowItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::MaWindow
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::MaSize
    }

    fn get(&self, state: &TestState) -> u16 {
        state.ma_window_size as u16
    }

    fn valid_range(&self, _state: &TestState) -> Option<ValidRange> {
        Some(ValidRange::new(MA_WINDOW_SIZES[0] as i32, MA_WINDOW_SIZES[MA_WINDOW_SIZES.len() - 1] as i32))
    }

    fn accepts(&self, raw: u16, _state: &TestState) -> bool {
        MA_WINDOW_SIZES.iter().any(|&size| size as u16 == raw)
    }

    fn next(&self, state: &TestState) -> u16 {
        MA_WINDOW_SIZES
            .iter()
            .position(|&size| size == state.ma_window_size)
            .map(|index| MA_WINDOW_SIZES[(index + 1) % MA_WINDOW_SIZES.len()])
            .unwrap_or(MA_WINDOW_SIZES[0]) as u16
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        if let Some(&size) = MA_WINDOW_SIZES.iter().find(|&&size| size as u16 == raw) {
            state.ma_window_size = size;
        }
        ApplyEffect::None
    }
}

struct LoggingItem;

impl ConfigItem for LoggingItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::Logging
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::Log
    }

    fn get(&self, state: &TestState) -> u16 {
        state.logging_enabled as u16
    }

    fn valid_range(&self, _state: &TestState) -> Option<ValidRange> {
        Some(ValidRange::new(0, 1))
    }

    fn next(&self, state: &TestState) -> u16 {
        !state.logging_enabled as u16
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        state.logging_enabled = raw != 0;
        ApplyEffect::None
    }
}

struct RunningItem;

impl ConfigItem for RunningItem {
    fn id(&self) -> ConfigItemId {
        ConfigItemId::Running
    }

    fn characteristic(&self) -> Characteristic {
        Characteristic::IsRunning
    }

    fn get(&self, state: &TestState) -> u16 {
        state.is_running as u16
    }

    fn valid_range(&self, _state: &TestState) -> Option<ValidRange> {
        Some(ValidRange::new(0, 1))
    }

    fn next(&self, state: &TestState) -> u16 {
        !state.is_running as u16
    }

    fn apply(&self, state: &mut TestState, raw: u16) -> ApplyEffect {
        let running = raw != 0;
        if running == state.is_running {
            return ApplyEffect::None;
        }
        state.is_running = running;
        if running { ApplyEffect::StartRun } else { ApplyEffect::StopRun }
    }
}

/// Items in operator menu order.
pub static CONFIG_ITEMS: [&dyn ConfigItem; 12] = [
    &RadioModeItem,
    &PhyItem,
    &TxPowerItem,
    &FrequencyItem,
    &ChannelItem,
    &PayloadLengthItem,
    &PacketsRequestedItem,
    &DeviceIdItem { id: ConfigItemId::DestId },
    &DeviceIdItem { id: ConfigItemId::SrcId },
    &MaWindowItem,
    &LoggingItem,
    &RunningItem,
];

pub fn item(id: ConfigItemId) -> Option<&'static dyn ConfigItem> {
    CONFIG_ITEMS.iter().copied().find(|item| item.id() == id)
}

pub fn item_for_characteristic(characteristic: Characteristic) -> Option<&'static dyn ConfigItem> {
    CONFIG_ITEMS.iter().copied().find(|item| item.characteristic() == characteristic)
}

/// Response to a remote write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResult {
    Accepted,
    OutOfRange,
    /// The remote lane is full; answered like a rejected value.
    QueueFull,
}

impl WriteResult {
    /// Write response code on the wire.
    pub const fn code(self) -> u8 {
        match self {
            WriteResult::Accepted => 0x00,
            WriteResult::OutOfRange | WriteResult::QueueFull => 0xFF,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigChange {
    pub item: ConfigItemId,
    pub value: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
}

/// Pending changes, one lane per input source.
pub struct ConfigChangeQueue {
    local: Deque<ConfigChange, CONFIG_CHANGE_QUEUE_SIZE>,
    remote: Deque<ConfigChange, CONFIG_CHANGE_QUEUE_SIZE>,
}

impl Default for ConfigChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigChangeQueue {
    pub const fn new() -> Self {
        ConfigChangeQueue {
            local: Deque::new(),
            remote: Deque::new(),
        }
    }

    /// Returns the change back when its lane is full.
    pub fn push(&mut self, source: ChangeSource, change: ConfigChange) -> Result<(), ConfigChange> {
        match source {
            ChangeSource::Local => self.local.push_back(change),
            ChangeSource::Remote => self.remote.push_back(change),
        }
    }

    /// Oldest local change, else oldest remote change.
    pub fn pop(&mut self) -> Option<(ChangeSource, ConfigChange)> {
        self.local
            .pop_front()
            .map(|change| (ChangeSource::Local, change))
            .or_else(|| self.remote.pop_front().map(|change| (ChangeSource::Remote, change)))
    }

    pub fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    pub fn clear(&mut self) {
        self.local.clear();
        self.remote.clear();
    }
}

/// A change that went through its apply function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppliedChange {
    pub source: ChangeSource,
    pub change: ConfigChange,
    pub effect: ApplyEffect,
}

#[derive(Default)]
pub struct ConfigProtocol {
    queue: ConfigChangeQueue,
}

impl ConfigProtocol {
    pub const fn new() -> Self {
        ConfigProtocol {
            queue: ConfigChangeQueue::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Validates a remote write and queues it if accepted.
    ///
    /// State is never touched here; accepted values are applied by
    /// [`ConfigProtocol::apply_pending`].
    ///
    /// # Arguments
    /// * `state` - current test state, for ranges that depend on the PHY
    /// * `characteristic_id` - attribute id of the write request
    /// * `raw` - little-endian value in the width of the characteristic
    pub fn remote_write(&mut self, state: &TestState, characteristic_id: u16, raw: &[u8]) -> WriteResult {
        let Some(characteristic) = Characteristic::from_id(characteristic_id) else {
            log!(Level::Warn, "Write to unknown characteristic {:#06x}", characteristic_id);
            return WriteResult::OutOfRange;
        };
        let Some(item) = item_for_characteristic(characteristic).filter(|item| item.writable()) else {
            log!(Level::Warn, "Write to read-only characteristic {:?}", characteristic);
            return WriteResult::OutOfRange;
        };
        let value = match (characteristic.width(), raw) {
            (1, [value, ..]) => *value as u16,
            (2, [low, high, ..]) => u16::from_le_bytes([*low, *high]),
            _ => {
                log!(Level::Warn, "Short write to {:?}: {} bytes", characteristic, raw.len());
                return WriteResult::OutOfRange;
            }
        };
        if !item.accepts(value, state) {
            log!(Level::Debug, "Write {:?} = {} out of range", characteristic, value);
            return WriteResult::OutOfRange;
        }
        match self.queue.push(ChangeSource::Remote, ConfigChange { item: item.id(), value }) {
            Ok(()) => WriteResult::Accepted,
            Err(change) => {
                log!(Level::Warn, "Remote change queue full, rejecting {:?}", change.item);
                WriteResult::QueueFull
            }
        }
    }

    /// Serves a read of a characteristic or of a `0x8000 | id` range descriptor.
    ///
    /// Returns `None` for ids outside the table and for items without a range.
    pub fn remote_read(&self, state: &TestState, attribute_id: u16) -> Option<AttributeValue> {
        let mut value = AttributeValue::new();
        if attribute_id & VALID_RANGE_DESCRIPTOR != 0 {
            let characteristic = Characteristic::from_id(attribute_id & !VALID_RANGE_DESCRIPTOR)?;
            let range = item_for_characteristic(characteristic)?.valid_range(state)?;
            push_width(&mut value, range.min as u16, characteristic.width())?;
            push_width(&mut value, range.max as u16, characteristic.width())?;
            return Some(value);
        }

        let characteristic = Characteristic::from_id(attribute_id)?;
        let reading = match characteristic {
            Characteristic::PhyList => {
                value.extend_from_slice(phy::phy_list().as_bytes()).ok()?;
                return Some(value);
            }
            Characteristic::PktsSent => state.packets_sent,
            Characteristic::Per => (state.per * 10.0) as u16,
            Characteristic::Ma => (state.ma * 10.0) as u16,
            Characteristic::PktsCnt => state.stats.sequence_count(),
            Characteristic::PktsRcvd => state.packets_received_reading(),
            _ => item_for_characteristic(characteristic)?.get(state),
        };
        push_width(&mut value, reading, characteristic.width())?;
        Some(value)
    }

    /// Moves `item` to its next value through the local lane.
    ///
    /// # Returns
    /// The value the item advances to. It is applied by the next
    /// [`ConfigProtocol::apply_pending`] call.
    pub fn local_advance(&mut self, state: &TestState, item_id: ConfigItemId) -> u16 {
        let Some(item) = item(item_id) else {
            return 0;
        };
        let value = item.next(state);
        if !item.writable() {
            return value;
        }
        if let Err(change) = self.queue.push(ChangeSource::Local, ConfigChange { item: item_id, value }) {
            log!(Level::Warn, "Local change queue full, dropping {:?}", change.item);
        }
        value
    }

    /// Applies at most one pending change and indicates the resulting values.
    ///
    /// # Returns
    /// * `Ok(Some(applied))` - the change applied, with the effect left to the caller
    /// * `Ok(None)` - nothing was pending
    /// * `Err(IndicationError)` - the indication queue overflowed
    pub fn apply_pending(
        &mut self,
        state: &mut TestState,
        indications: &mut IndicationQueue,
    ) -> Result<Option<AppliedChange>, IndicationError> {
        let Some((source, change)) = self.queue.pop() else {
            return Ok(None);
        };
        let Some(item) = item(change.item) else {
            return Ok(None);
        };
        let effect = item.apply(state, change.value);
        log!(Level::Debug, "Applied {:?} = {} from {:?} ({:?})", change.item, item.get(state), source, effect);

        indications.enqueue(IndicationEntry::new(item.characteristic(), item.get(state)))?;
        if effect == ApplyEffect::PhyChanged {
            for dependent in [ConfigItemId::TxPower, ConfigItemId::Channel, ConfigItemId::PayloadLength] {
                if let Some(dependent) = self::item(dependent) {
                    indications.enqueue(IndicationEntry::new(dependent.characteristic(), dependent.get(state)))?;
                }
            }
        }
        Ok(Some(AppliedChange { source, change, effect }))
    }
}

fn push_width(value: &mut AttributeValue, reading: u16, width: usize) -> Option<()> {
    value.extend_from_slice(&reading.to_le_bytes()[..width.min(2)]).ok()
}
