//! # Coexistence Scheduler
//!
//! Serializes the radio operations of the two protocol roles onto one radio driver.
//!
//! ## Guarantees
//!
//! 1. Every terminal radio event yields the radio before the handler returns, whatever
//!    the outcome. Without the yield the other role never gets the radio again.
//! 2. A request of one role is held back while the other role's operation is active
//!    with the same or a better (numerically lower) priority, and is issued on yield.
//!    Better priority requests go straight to the driver, whose arbiter pre-empts.
//! 3. Scheduler statuses meaning "my operation did not get the radio" ask for a
//!    re-arm; every other status is only counted.
//! 4. PHY and channel changes idle the radio first and only proceed once the driver
//!    reports the idle state.

use log::{Level, log};

use crate::messages::RadioFrameBuffer;
use crate::phy::PhyDescriptor;
use crate::radio_devices::{RadioDriver, RadioError, RadioEvent, RadioState, RequestKind, SchedulerRequest, SchedulerStatus};

/// Background operations: advertising and idle listening.
pub const PRIORITY_BACKGROUND: u8 = 200;
/// Operations of an active throughput test.
pub const PRIORITY_TEST: u8 = 100;

/// Slip and transaction hints of the proprietary test operations.
pub const TEST_SLIP_TIME_US: u32 = 100_000;
pub const TEST_TRANSACTION_TIME_US: u32 = 2_500;

/// How many times the idle state is polled after a blocking idle request.
const IDLE_ACK_POLLS: u8 = 8;

/// Protocol role owning a radio operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    ShortRange,
    Proprietary,
}

impl Role {
    const fn index(self) -> usize {
        match self {
            Role::ShortRange => 0,
            Role::Proprietary => 1,
        }
    }
}

/// Type of the operation that held the radio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Rx,
    Tx,
}

/// What the caller should do after an event went through the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disposition {
    /// The radio was yielded while handling the event.
    pub yielded: bool,
    /// The interrupted operation should be submitted again.
    pub rearm: bool,
    /// Operation that was active when the event arrived.
    pub operation: Option<(Role, OperationKind)>,
}

/// Counters of radio events that are only observed, never acted on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RadioCounters {
    pub scheduler_status: [u16; SchedulerStatus::COUNT],
    pub tx_underflow: u16,
    pub rx_aborted: u16,
    pub rx_fifo_overflow: u16,
    pub rx_address_filtered: u16,
    pub config_scheduled: u16,
    pub config_unscheduled: u16,
}

impl RadioCounters {
    pub fn status(&self, status: SchedulerStatus) -> u16 {
        self.scheduler_status[status.index()]
    }
}

#[derive(Clone)]
enum Operation {
    Rx { channel: u16 },
    Tx { channel: u16, frame: RadioFrameBuffer },
}

#[derive(Clone)]
struct Grant {
    role: Role,
    request: SchedulerRequest,
    operation: Operation,
}

#[derive(Clone, Copy)]
struct Active {
    role: Role,
    priority: u8,
    kind: OperationKind,
}

/// Builds the hints of an RX operation.
pub const fn rx_request(priority: u8) -> SchedulerRequest {
    SchedulerRequest {
        priority,
        slip_time_us: TEST_SLIP_TIME_US,
        transaction_time_us: TEST_TRANSACTION_TIME_US,
        kind: RequestKind::Rx,
    }
}

/// Builds the hints of a TX operation, optionally at an absolute time.
pub const fn tx_request(priority: u8, scheduled_at_us: Option<u32>) -> SchedulerRequest {
    SchedulerRequest {
        priority,
        slip_time_us: TEST_SLIP_TIME_US,
        transaction_time_us: TEST_TRANSACTION_TIME_US,
        kind: match scheduled_at_us {
            Some(at_time_us) => RequestKind::ScheduledTx { at_time_us },
            None => RequestKind::Tx,
        },
    }
}

pub struct CoexistenceScheduler<R: RadioDriver> {
    radio: R,
    active: Option<Active>,
    pending: [Option<Grant>; 2],
    counters: RadioCounters,
}

impl<R: RadioDriver> CoexistenceScheduler<R> {
    pub fn new(radio: R) -> Self {
        CoexistenceScheduler {
            radio,
            active: None,
            pending: [None, None],
            counters: RadioCounters::default(),
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn counters(&self) -> &RadioCounters {
        &self.counters
    }

    /// Role and kind of the operation currently holding the radio.
    pub fn active_operation(&self) -> Option<(Role, OperationKind)> {
        self.active.map(|active| (active.role, active.kind))
    }

    /// True when a request of `role` waits for the other role to yield.
    pub fn has_pending(&self, role: Role) -> bool {
        self.pending[role.index()].is_some()
    }

    /// Drops a held request of `role` without touching the active operation.
    pub fn cancel_pending(&mut self, role: Role) {
        if self.pending[role.index()].take().is_some() {
            log!(Level::Debug, "Dropped held {:?} request", role);
        }
    }

    pub fn request_rx(&mut self, role: Role, priority: u8, channel: u16) -> Result<(), RadioError> {
        self.submit(Grant {
            role,
            request: rx_request(priority),
            operation: Operation::Rx { channel },
        })
    }

    pub fn request_tx(
        &mut self,
        role: Role,
        priority: u8,
        channel: u16,
        frame: &RadioFrameBuffer,
        scheduled_at_us: Option<u32>,
    ) -> Result<(), RadioError> {
        self.submit(Grant {
            role,
            request: tx_request(priority, scheduled_at_us),
            operation: Operation::Tx {
                channel,
                frame: frame.clone(),
            },
        })
    }

    fn submit(&mut self, grant: Grant) -> Result<(), RadioError> {
        if let Some(active) = self.active {
            if active.role != grant.role && active.priority <= grant.request.priority {
                log!(
                    Level::Debug,
                    "Holding {:?} request (priority {}) behind active {:?} operation",
                    grant.role,
                    grant.request.priority,
                    active.role
                );
                let index = grant.role.index();
                self.pending[index] = Some(grant);
                return Ok(());
            }
        }
        self.issue(grant)
    }

    fn issue(&mut self, grant: Grant) -> Result<(), RadioError> {
        let kind = match &grant.operation {
            Operation::Rx { channel } => {
                self.radio.start_rx(*channel, &grant.request)?;
                OperationKind::Rx
            }
            Operation::Tx { channel, frame } => {
                self.radio.write_tx_fifo(frame.as_bytes())?;
                self.radio.start_tx(*channel, &grant.request)?;
                OperationKind::Tx
            }
        };
        self.active = Some(Active {
            role: grant.role,
            priority: grant.request.priority,
            kind,
        });
        Ok(())
    }

    /// Routes one radio event through the scheduler.
    ///
    /// Terminal events always yield the radio and then grant the best pending request.
    pub fn on_radio_event(&mut self, event: &RadioEvent) -> Disposition {
        let operation = self.active_operation();
        let mut rearm = false;
        match event {
            RadioEvent::SchedulerStatus(status) => rearm = self.on_scheduler_status(*status),
            RadioEvent::TxUnderflow => self.counters.tx_underflow = self.counters.tx_underflow.saturating_add(1),
            RadioEvent::RxAborted => self.counters.rx_aborted = self.counters.rx_aborted.saturating_add(1),
            RadioEvent::RxFifoOverflow => self.counters.rx_fifo_overflow = self.counters.rx_fifo_overflow.saturating_add(1),
            RadioEvent::RxAddressFiltered => {
                self.counters.rx_address_filtered = self.counters.rx_address_filtered.saturating_add(1)
            }
            RadioEvent::ConfigScheduled => self.counters.config_scheduled = self.counters.config_scheduled.saturating_add(1),
            RadioEvent::ConfigUnscheduled => {
                self.counters.config_unscheduled = self.counters.config_unscheduled.saturating_add(1)
            }
            RadioEvent::TxAborted | RadioEvent::TxBlocked => rearm = true,
            RadioEvent::PacketReceived { .. } | RadioEvent::RxFrameError | RadioEvent::PacketSent => {}
        }

        let yielded = event.is_terminal();
        if yielded {
            self.radio.yield_radio();
            self.active = None;
            self.grant_pending();
        }
        Disposition { yielded, rearm, operation }
    }

    /// Maps a scheduler status to a re-arm decision, counting every status.
    pub fn on_scheduler_status(&mut self, status: SchedulerStatus) -> bool {
        let counter = &mut self.counters.scheduler_status[status.index()];
        *counter = counter.saturating_add(1);
        if status.requests_retry() {
            log!(Level::Debug, "Scheduler status {:?}, re-arming", status);
            true
        } else {
            log!(Level::Debug, "Scheduler status {:?} counted ({})", status, *counter);
            false
        }
    }

    fn grant_pending(&mut self) {
        let best = self
            .pending
            .iter()
            .enumerate()
            .filter_map(|(index, grant)| grant.as_ref().map(|grant| (index, grant.request.priority)))
            .min_by_key(|&(_, priority)| priority)
            .map(|(index, _)| index);
        if let Some(grant) = best.and_then(|index| self.pending[index].take()) {
            let role = grant.role;
            if let Err(error) = self.issue(grant) {
                log!(Level::Warn, "Pending {:?} request failed to start: {}", role, error);
            }
        }
    }

    /// Idles the radio and drops held requests of the proprietary role.
    pub fn idle(&mut self) {
        self.radio.idle(true);
        self.active = None;
        self.pending[Role::Proprietary.index()] = None;
    }

    /// Idles the radio, waits for the acknowledgement and loads the new PHY.
    pub fn reconfigure(&mut self, phy: &PhyDescriptor, tx_power: i16) -> Result<(), RadioError> {
        self.idle();
        self.wait_for_idle()?;
        self.radio.configure_phy(phy)?;
        self.radio.set_tx_power(tx_power)
    }

    /// Applies a transmit power change. Power can be changed without idling.
    pub fn set_tx_power(&mut self, tx_power: i16) -> Result<(), RadioError> {
        self.radio.set_tx_power(tx_power)
    }

    fn wait_for_idle(&mut self) -> Result<(), RadioError> {
        for _ in 0..IDLE_ACK_POLLS {
            if self.radio.state() == RadioState::Idle {
                return Ok(());
            }
            self.radio.idle(true);
        }
        log!(Level::Error, "Radio did not acknowledge idle, state {:?}", self.radio.state());
        Err(RadioError::Busy)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::messages::RadioFrame;
    use crate::phy::{FrameFamily, PHY_TABLE};
    use crate::test_support::{MockRadio, RadioCall};

    fn frame() -> RadioFrameBuffer {
        RadioFrame::for_transmit(FrameFamily::Ieee802154, 1, 0, 0, 5, [0; 6]).encode().expect("encode")
    }

    fn yields(radio: &MockRadio) -> usize {
        radio.calls.iter().filter(|call| **call == RadioCall::Yield).count()
    }

    #[test]
    fn every_terminal_event_yields() {
        let events = [
            RadioEvent::PacketReceived {
                data: heapless::Vec::new(),
                rssi: -50,
            },
            RadioEvent::RxFrameError,
            RadioEvent::RxAborted,
            RadioEvent::RxFifoOverflow,
            RadioEvent::RxAddressFiltered,
            RadioEvent::PacketSent,
            RadioEvent::TxAborted,
            RadioEvent::TxBlocked,
            RadioEvent::TxUnderflow,
            RadioEvent::SchedulerStatus(SchedulerStatus::InternalError),
            RadioEvent::SchedulerStatus(SchedulerStatus::EventInterrupted),
        ];
        let mut scheduler = CoexistenceScheduler::new(MockRadio::default());
        for (index, event) in events.iter().enumerate() {
            let disposition = scheduler.on_radio_event(event);
            assert!(disposition.yielded, "event {:?} did not yield", event);
            assert_eq!(yields(scheduler.radio()), index + 1);
        }
    }

    #[test]
    fn config_events_are_counted_without_yield() {
        let mut scheduler = CoexistenceScheduler::new(MockRadio::default());
        let disposition = scheduler.on_radio_event(&RadioEvent::ConfigScheduled);
        scheduler.on_radio_event(&RadioEvent::ConfigUnscheduled);
        assert!(!disposition.yielded);
        assert_eq!(yields(scheduler.radio()), 0);
        assert_eq!(scheduler.counters().config_scheduled, 1);
        assert_eq!(scheduler.counters().config_unscheduled, 1);
    }

    #[test]
    fn preemption_statuses_request_rearm_others_only_count() {
        let mut scheduler = CoexistenceScheduler::new(MockRadio::default());
        assert!(scheduler.on_scheduler_status(SchedulerStatus::EventInterrupted));
        assert!(scheduler.on_scheduler_status(SchedulerStatus::ScheduleFail));
        assert!(!scheduler.on_scheduler_status(SchedulerStatus::CcaCsmaTxFail));
        assert!(!scheduler.on_scheduler_status(SchedulerStatus::CcaCsmaTxFail));
        assert_eq!(scheduler.counters().status(SchedulerStatus::CcaCsmaTxFail), 2);
        assert_eq!(scheduler.counters().status(SchedulerStatus::ScheduleFail), 1);
    }

    #[test]
    fn tx_writes_fifo_before_starting() {
        let mut scheduler = CoexistenceScheduler::new(MockRadio::default());
        let buffer = frame();
        scheduler.request_tx(Role::Proprietary, PRIORITY_TEST, 11, &buffer, None).expect("tx");
        let calls = &scheduler.radio().calls;
        assert_eq!(calls[0], RadioCall::WriteTxFifo(buffer.as_bytes().to_vec()));
        assert_eq!(calls[1], RadioCall::StartTx(11, tx_request(PRIORITY_TEST, None)));
        assert_eq!(scheduler.active_operation(), Some((Role::Proprietary, OperationKind::Tx)));
    }

    #[test]
    fn lower_priority_request_waits_for_yield() {
        let mut scheduler = CoexistenceScheduler::new(MockRadio::default());
        scheduler.request_rx(Role::Proprietary, PRIORITY_TEST, 11).expect("rx");
        scheduler.request_rx(Role::ShortRange, PRIORITY_BACKGROUND, 37).expect("held");
        assert!(scheduler.has_pending(Role::ShortRange));
        assert_eq!(scheduler.radio().calls.len(), 1);

        scheduler.on_radio_event(&RadioEvent::RxFrameError);
        assert!(!scheduler.has_pending(Role::ShortRange));
        let calls = &scheduler.radio().calls;
        assert_eq!(calls[1], RadioCall::Yield);
        assert_eq!(calls[2], RadioCall::StartRx(37, rx_request(PRIORITY_BACKGROUND)));
        assert_eq!(scheduler.active_operation(), Some((Role::ShortRange, OperationKind::Rx)));
    }

    #[test]
    fn cancelled_request_is_not_granted_on_yield() {
        let mut scheduler = CoexistenceScheduler::new(MockRadio::default());
        scheduler.request_tx(Role::Proprietary, PRIORITY_TEST, 11, &frame(), None).expect("tx");
        scheduler.request_rx(Role::ShortRange, PRIORITY_BACKGROUND, 38).expect("held");
        scheduler.cancel_pending(Role::ShortRange);
        assert!(!scheduler.has_pending(Role::ShortRange));

        scheduler.on_radio_event(&RadioEvent::PacketSent);
        assert_eq!(scheduler.radio().calls.last(), Some(&RadioCall::Yield));
        assert_eq!(scheduler.active_operation(), None);
    }

    #[test]
    fn higher_priority_request_goes_straight_to_the_driver() {
        let mut scheduler = CoexistenceScheduler::new(MockRadio::default());
        scheduler.request_rx(Role::ShortRange, PRIORITY_BACKGROUND, 37).expect("rx");
        scheduler.request_tx(Role::Proprietary, PRIORITY_TEST, 11, &frame(), None).expect("tx");
        assert!(!scheduler.has_pending(Role::Proprietary));
        assert_eq!(scheduler.active_operation(), Some((Role::Proprietary, OperationKind::Tx)));
    }

    #[test]
    fn interrupted_tx_reports_operation_and_rearm() {
        let mut scheduler = CoexistenceScheduler::new(MockRadio::default());
        scheduler.request_tx(Role::Proprietary, PRIORITY_TEST, 11, &frame(), Some(5000)).expect("tx");
        let disposition = scheduler.on_radio_event(&RadioEvent::SchedulerStatus(SchedulerStatus::EventInterrupted));
        assert!(disposition.rearm);
        assert_eq!(disposition.operation, Some((Role::Proprietary, OperationKind::Tx)));
        assert_eq!(scheduler.active_operation(), None);
    }

    #[test]
    fn reconfigure_idles_before_loading_phy() {
        let mut scheduler = CoexistenceScheduler::new(MockRadio::default());
        scheduler.request_rx(Role::Proprietary, PRIORITY_TEST, 11).expect("rx");
        scheduler.reconfigure(&PHY_TABLE[0], 100).expect("reconfigure");
        let calls = &scheduler.radio().calls;
        let idle = calls.iter().position(|call| *call == RadioCall::Idle(true)).expect("idle issued");
        let configure = calls.iter().position(|call| *call == RadioCall::ConfigurePhy(0)).expect("phy configured");
        assert!(idle < configure);
        assert_eq!(calls.last(), Some(&RadioCall::SetTxPower(100)));
    }

    #[test]
    fn reconfigure_fails_when_idle_is_never_acknowledged() {
        let mut radio = MockRadio::default();
        radio.stuck_busy = true;
        let mut scheduler = CoexistenceScheduler::new(radio);
        match scheduler.reconfigure(&PHY_TABLE[4], 80) {
            Err(RadioError::Busy) => {}
            other => panic!("Expected Busy, got: {:?}", other),
        }
        assert!(!scheduler.radio().calls.iter().any(|call| matches!(call, RadioCall::ConfigurePhy(_))));
    }
}
