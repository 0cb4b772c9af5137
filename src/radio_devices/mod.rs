//! Radio device abstraction and implementations
//!
//! The test never talks to radio hardware directly. Everything goes through the
//! [`RadioDriver`] trait and every operation carries a [`SchedulerRequest`] that the
//! driver's arbiter uses to share the radio with the short-range protocol stack.
//! Completion is always asynchronous: the driver reports a [`RadioEvent`] later.
//!
//! - `simulator`: host-side loopback device with configurable loss (`radio-device-simulator`)

#[cfg(feature = "radio-device-simulator")]
pub mod simulator;

#[cfg(feature = "radio-device-simulator")]
pub use simulator::{SimulatedRadio, radio_device_task};

use crate::messages::RADIO_FRAME_SIZE;
use crate::phy::PhyDescriptor;

/// What the radio is asked to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Rx,
    Tx,
    /// Transmit at an absolute radio time.
    ScheduledTx { at_time_us: u32 },
}

/// Arbitration hints attached to every radio operation.
///
/// Lower `priority` values win. `slip_time_us` is how long the operation may be
/// postponed, `transaction_time_us` how long it is expected to hold the radio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerRequest {
    pub priority: u8,
    pub slip_time_us: u32,
    pub transaction_time_us: u32,
    pub kind: RequestKind,
}

/// Radio state as reported by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioState {
    Inactive,
    Idle,
    Rx,
    Tx,
}

/// Status codes of the driver's multiprotocol scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// The running operation was pre-empted by a higher priority one.
    EventInterrupted,
    /// The operation could not be placed in the schedule.
    ScheduleFail,
    Unsupported,
    ScheduledTxFail,
    SingleTxFail,
    CcaCsmaTxFail,
    CcaLbtTxFail,
    ScheduledRxFail,
    TxStreamFail,
    AverageRssiFail,
    InternalError,
}

impl SchedulerStatus {
    pub const COUNT: usize = 11;

    pub const fn index(self) -> usize {
        self as usize
    }

    /// True for statuses that mean "this operation of mine did not get the radio".
    pub const fn requests_retry(self) -> bool {
        matches!(self, SchedulerStatus::EventInterrupted | SchedulerStatus::ScheduleFail)
    }
}

/// Received frame bytes, without CRC.
pub type RxFrame = heapless::Vec<u8, RADIO_FRAME_SIZE>;

/// Events raised by the radio driver.
#[derive(Clone, Debug, PartialEq)]
pub enum RadioEvent {
    PacketReceived { data: RxFrame, rssi: i8 },
    RxFrameError,
    RxAborted,
    RxFifoOverflow,
    RxAddressFiltered,
    PacketSent,
    TxAborted,
    TxBlocked,
    TxUnderflow,
    SchedulerStatus(SchedulerStatus),
    ConfigScheduled,
    ConfigUnscheduled,
}

impl RadioEvent {
    /// Terminal events end the operation that held the radio.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RadioEvent::ConfigScheduled | RadioEvent::ConfigUnscheduled)
    }
}

/// Errors returned synchronously by driver calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("radio busy, idle transition not acknowledged")]
    Busy,
    #[error("invalid radio configuration")]
    InvalidConfiguration,
    #[error("operation rejected by the driver")]
    Rejected,
}

/// Trait defining the interface for radio device implementations
///
/// Calls only submit work. The outcome of `start_rx`/`start_tx` arrives later as a
/// [`RadioEvent`]; an `Err` here means the request never reached the arbiter.
///
/// Note: Initialization is not part of this trait as it is highly implementation-dependent
/// with different hardware requirements and setup parameters. A driver value is
/// handed over already initialized.
///
/// # Examples
/// ```rust,ignore
/// fn send<R: RadioDriver>(radio: &mut R, frame: &[u8], request: &SchedulerRequest) -> Result<(), RadioError> {
///     radio.write_tx_fifo(frame)?;
///     radio.start_tx(11, request)
/// }
/// ```
pub trait RadioDriver {
    /// Loads the channel plan and modulation of `phy`. The radio must be idle.
    fn configure_phy(&mut self, phy: &PhyDescriptor) -> Result<(), RadioError>;

    /// Sets the transmit power in 0.1 dBm.
    fn set_tx_power(&mut self, tenths_dbm: i16) -> Result<(), RadioError>;

    /// Transmit power the radio actually applied, in 0.1 dBm.
    fn tx_power(&self) -> i16;

    fn start_rx(&mut self, channel: u16, request: &SchedulerRequest) -> Result<(), RadioError>;

    /// Replaces the TX FIFO content with `bytes`.
    fn write_tx_fifo(&mut self, bytes: &[u8]) -> Result<(), RadioError>;

    fn start_tx(&mut self, channel: u16, request: &SchedulerRequest) -> Result<(), RadioError>;

    /// Stops any operation. With `wait` the call returns after the transition completed.
    fn idle(&mut self, wait: bool);

    fn state(&self) -> RadioState;

    /// Hands the radio back to the arbiter so the next pending operation can run.
    fn yield_radio(&mut self);
}

impl<R: RadioDriver + ?Sized> RadioDriver for &mut R {
    fn configure_phy(&mut self, phy: &PhyDescriptor) -> Result<(), RadioError> {
        (**self).configure_phy(phy)
    }

    fn set_tx_power(&mut self, tenths_dbm: i16) -> Result<(), RadioError> {
        (**self).set_tx_power(tenths_dbm)
    }

    fn tx_power(&self) -> i16 {
        (**self).tx_power()
    }

    fn start_rx(&mut self, channel: u16, request: &SchedulerRequest) -> Result<(), RadioError> {
        (**self).start_rx(channel, request)
    }

    fn write_tx_fifo(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        (**self).write_tx_fifo(bytes)
    }

    fn start_tx(&mut self, channel: u16, request: &SchedulerRequest) -> Result<(), RadioError> {
        (**self).start_tx(channel, request)
    }

    fn idle(&mut self, wait: bool) {
        (**self).idle(wait)
    }

    fn state(&self) -> RadioState {
        (**self).state()
    }

    fn yield_radio(&mut self) {
        (**self).yield_radio()
    }
}
