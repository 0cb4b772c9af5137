//! Recording collaborators shared by the unit tests.

use embassy_time::Duration;

use crate::ble_stack::{AdvertisingMode, ProtocolStack};
use crate::indication_queue::{NotificationTransport, TransportError};
use crate::phy::{PhyDescriptor, PhyId};
use crate::radio_devices::{RadioDriver, RadioError, RadioEvent, RadioState, SchedulerRequest};
use crate::timers::{TestTimers, TimerId};

#[derive(Clone, Debug, PartialEq)]
pub enum RadioCall {
    ConfigurePhy(PhyId),
    SetTxPower(i16),
    StartRx(u16, SchedulerRequest),
    WriteTxFifo(Vec<u8>),
    StartTx(u16, SchedulerRequest),
    Idle(bool),
    Yield,
}

/// Radio that records every call and accepts everything.
#[derive(Debug)]
pub struct MockRadio {
    pub calls: Vec<RadioCall>,
    /// Never reach the idle state.
    pub stuck_busy: bool,
    /// Fail every `start_tx` with [`RadioError::Rejected`].
    pub reject_tx: bool,
    state: RadioState,
    tx_power: i16,
}

impl Default for MockRadio {
    fn default() -> Self {
        MockRadio {
            calls: Vec::new(),
            stuck_busy: false,
            reject_tx: false,
            state: RadioState::Idle,
            tx_power: 0,
        }
    }
}

impl MockRadio {
    /// Frames written to the TX FIFO, in order.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                RadioCall::WriteTxFifo(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&RadioCall) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }
}

impl RadioDriver for MockRadio {
    fn configure_phy(&mut self, phy: &PhyDescriptor) -> Result<(), RadioError> {
        self.calls.push(RadioCall::ConfigurePhy(phy.id));
        Ok(())
    }

    fn set_tx_power(&mut self, tenths_dbm: i16) -> Result<(), RadioError> {
        self.calls.push(RadioCall::SetTxPower(tenths_dbm));
        self.tx_power = tenths_dbm;
        Ok(())
    }

    fn tx_power(&self) -> i16 {
        self.tx_power
    }

    fn start_rx(&mut self, channel: u16, request: &SchedulerRequest) -> Result<(), RadioError> {
        self.calls.push(RadioCall::StartRx(channel, *request));
        self.state = RadioState::Rx;
        Ok(())
    }

    fn write_tx_fifo(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        self.calls.push(RadioCall::WriteTxFifo(bytes.to_vec()));
        Ok(())
    }

    fn start_tx(&mut self, channel: u16, request: &SchedulerRequest) -> Result<(), RadioError> {
        self.calls.push(RadioCall::StartTx(channel, *request));
        if self.reject_tx {
            return Err(RadioError::Rejected);
        }
        self.state = RadioState::Tx;
        Ok(())
    }

    fn idle(&mut self, wait: bool) {
        self.calls.push(RadioCall::Idle(wait));
        if !self.stuck_busy {
            self.state = RadioState::Idle;
        }
    }

    fn state(&self) -> RadioState {
        if self.stuck_busy { RadioState::Tx } else { self.state }
    }

    fn yield_radio(&mut self) {
        self.calls.push(RadioCall::Yield);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StackCall {
    ReadResponse(u16, Vec<u8>),
    WriteResponse(u16, u8),
    WriteAttribute(u16, Vec<u8>),
    StartAdvertising(Vec<u8>, AdvertisingMode, u16),
    StopAdvertising,
    CloseConnection(u8),
    AirtimeEvent(RadioEvent),
}

/// Protocol stack that records commands. Indications are kept apart in `indications`.
#[derive(Debug, Default)]
pub struct MockStack {
    pub calls: Vec<StackCall>,
    pub indications: Vec<(u16, Vec<u8>)>,
    pub refuse_indications: bool,
}

impl MockStack {
    pub fn write_responses(&self) -> Vec<(u16, u8)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                StackCall::WriteResponse(characteristic, code) => Some((*characteristic, *code)),
                _ => None,
            })
            .collect()
    }
}

impl NotificationTransport for MockStack {
    fn send_indication(&mut self, characteristic: u16, value: &[u8]) -> Result<(), TransportError> {
        if self.refuse_indications {
            return Err(TransportError);
        }
        self.indications.push((characteristic, value.to_vec()));
        Ok(())
    }
}

impl ProtocolStack for MockStack {
    fn send_read_response(&mut self, attribute: u16, value: &[u8]) {
        self.calls.push(StackCall::ReadResponse(attribute, value.to_vec()));
    }

    fn send_write_response(&mut self, characteristic: u16, code: u8) {
        self.calls.push(StackCall::WriteResponse(characteristic, code));
    }

    fn write_attribute(&mut self, attribute: u16, value: &[u8]) {
        self.calls.push(StackCall::WriteAttribute(attribute, value.to_vec()));
    }

    fn start_advertising(&mut self, data: &[u8], mode: AdvertisingMode, interval: u16) {
        self.calls.push(StackCall::StartAdvertising(data.to_vec(), mode, interval));
    }

    fn stop_advertising(&mut self) {
        self.calls.push(StackCall::StopAdvertising);
    }

    fn close_connection(&mut self, connection: u8) {
        self.calls.push(StackCall::CloseConnection(connection));
    }

    fn on_airtime_event(&mut self, event: &RadioEvent) {
        self.calls.push(StackCall::AirtimeEvent(event.clone()));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerCall {
    Periodic(TimerId, Duration, u16),
    OneShot(TimerId, Duration, u16),
    Stop(TimerId),
}

#[derive(Debug, Default)]
pub struct MockTimers {
    pub calls: Vec<TimerCall>,
}

impl MockTimers {
    /// Epoch of the most recent arm of `timer`, if it is still armed.
    pub fn armed_epoch(&self, timer: TimerId) -> Option<u16> {
        match self.calls.iter().rev().find(|call| match call {
            TimerCall::Periodic(id, _, _) | TimerCall::OneShot(id, _, _) | TimerCall::Stop(id) => *id == timer,
        }) {
            Some(TimerCall::Periodic(_, _, epoch)) | Some(TimerCall::OneShot(_, _, epoch)) => Some(*epoch),
            _ => None,
        }
    }

    pub fn last_one_shot(&self, timer: TimerId) -> Option<Duration> {
        self.calls.iter().rev().find_map(|call| match call {
            TimerCall::OneShot(id, after, _) if *id == timer => Some(*after),
            _ => None,
        })
    }
}

impl TestTimers for MockTimers {
    fn start_periodic(&mut self, timer: TimerId, period: Duration, epoch: u16) {
        self.calls.push(TimerCall::Periodic(timer, period, epoch));
    }

    fn start_one_shot(&mut self, timer: TimerId, after: Duration, epoch: u16) {
        self.calls.push(TimerCall::OneShot(timer, after, epoch));
    }

    fn stop(&mut self, timer: TimerId) {
        self.calls.push(TimerCall::Stop(timer));
    }
}
