//! # Test-Run Controller
//!
//! Owns the test state machine and the single event loop of the device. Every
//! radio, stack, timer and button event is handled here, in arrival order.
//!
//! ## States
//!
//! - `Stopped`
//! - `Running(Tx)`: each cadence tick arms one transmit. A completed transmit
//!   submits the next packet at once if a tick arrived meanwhile. The run ends when
//!   `packets_sent` reaches `packets_requested`.
//! - `Running(Rx)`: each accepted packet feeds the statistics and the realtime
//!   advertisement; the completion timeout is re-armed with the remaining count.
//!   The run ends on the last sequence number or on the timeout. The short-range
//!   role is deactivated for the duration of the run. Receive is started at test
//!   priority and re-armed after each event at background priority.
//!
//! Airtime requested by the short-range stack goes through the coexistence scheduler
//! at background priority. Radio events ending such an operation are handed back to
//! the stack and never reach the test logic.
//!
//! ## Failures
//!
//! A transmit reported aborted, blocked or pre-empted is resubmitted once with the
//! same counter. A second failure drops that counter. Receive is never retried.
//! Indication faults and radio configuration faults are returned from
//! [`TestRunController::step`] as [`ControllerError`]; the caller halts.

use embassy_time::Duration;
use log::{Level, log};

use crate::ble_stack::{
    AdvertisingMode, AirtimeRequest, BleEvent, Characteristic, CharacteristicStatus, ProtocolStack, ShortRangeLink,
    start_connectable,
};
use crate::coex_scheduler::{CoexistenceScheduler, OperationKind, PRIORITY_BACKGROUND, PRIORITY_TEST, Role};
use crate::config_protocol::{AppliedChange, ApplyEffect, ConfigItemId, ConfigProtocol};
use crate::indication_queue::{IndicationEntry, IndicationError, IndicationQueue};
use crate::messages::advertisement::REALTIME_ADVERTISING_INTERVAL;
use crate::messages::{RadioFrame, RadioFrameBuffer, RealtimeAdvertisement};
use crate::radio_devices::{RadioDriver, RadioError, RadioEvent};
use crate::test_state::{RadioMode, SharedTestState, TestState};
use crate::timers::{ChannelTimers, TestTimers, TimerExpired, TimerId};
use crate::{AppEvent, Button, EventQueueReceiver, RangeTestConfiguration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("indication delivery failed: {0}")]
    Indication(#[from] IndicationError),
    #[error("radio configuration failed: {0}")]
    Radio(#[from] RadioError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunRole {
    Tx,
    Rx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running(RunRole),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Timeout,
    Operator,
    /// The transmit frame could not be built.
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TxFlags {
    /// No packet is in flight.
    ready: bool,
    /// A cadence tick is waiting for a packet.
    scheduled: bool,
    /// The packet in flight is already a retry.
    retry: bool,
}

impl TxFlags {
    const IDLE: TxFlags = TxFlags {
        ready: true,
        scheduled: false,
        retry: false,
    };
    const STOPPED: TxFlags = TxFlags {
        ready: false,
        scheduled: false,
        retry: false,
    };
}

/// Controller as spawned on a device: driver and stack behind trait objects.
pub type DeviceController = TestRunController<&'static mut dyn RadioDriver, &'static mut dyn ProtocolStack, ChannelTimers>;

pub struct TestRunController<R: RadioDriver, S: ProtocolStack, T: TestTimers> {
    state: &'static SharedTestState,
    config: RangeTestConfiguration,
    scheduler: CoexistenceScheduler<R>,
    stack: S,
    timers: T,
    link: ShortRangeLink,
    indications: IndicationQueue,
    protocol: ConfigProtocol,
    run: RunState,
    tx: TxFlags,
    epochs: [u16; TimerId::COUNT],
    halted: bool,
}

impl<R: RadioDriver, S: ProtocolStack, T: TestTimers> TestRunController<R, S, T> {
    pub fn new(state: &'static SharedTestState, config: RangeTestConfiguration, radio: R, stack: S, timers: T) -> Self {
        TestRunController {
            state,
            config,
            scheduler: CoexistenceScheduler::new(radio),
            stack,
            timers,
            link: ShortRangeLink::new(),
            indications: IndicationQueue::new(),
            protocol: ConfigProtocol::new(),
            run: RunState::Stopped,
            tx: TxFlags::STOPPED,
            epochs: [0; TimerId::COUNT],
            halted: false,
        }
    }

    pub fn run_state(&self) -> RunState {
        self.run
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn snapshot(&self) -> TestState {
        self.state.snapshot()
    }

    pub fn scheduler(&self) -> &CoexistenceScheduler<R> {
        &self.scheduler
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn timers(&self) -> &T {
        &self.timers
    }

    pub fn indications(&self) -> &IndicationQueue {
        &self.indications
    }

    /// Loads the configured PHY and starts connectable advertising.
    ///
    /// # Returns
    /// * `Err(ControllerError::Radio)` if the radio refused the configuration
    pub fn start(&mut self) -> Result<(), ControllerError> {
        let state = self.state.snapshot();
        self.scheduler.reconfigure(state.phy_descriptor(), state.tx_power)?;
        self.publish_ranges(&state);
        start_connectable(&mut self.stack, &self.config.device_address);
        log!(
            Level::Info,
            "Range test ready: PHY {} channel {} power {}",
            state.phy_descriptor().name,
            state.channel,
            state.tx_power
        );
        Ok(())
    }

    /// True while a config change or an indication waits without any new event.
    pub fn has_pending_work(&self) -> bool {
        !self.halted && (self.protocol.has_pending() || self.indications.ready_to_send())
    }

    /// Handles `event` if given, then applies one pending change and drains one indication.
    pub fn step(&mut self, event: Option<AppEvent>) -> Result<(), ControllerError> {
        if self.halted {
            return Ok(());
        }
        if let Some(event) = event {
            self.handle_event(event)?;
        }
        self.process()
    }

    /// Stops everything after a fatal error. Later events are ignored.
    pub fn halt(&mut self) {
        log!(Level::Error, "Range test controller halted");
        self.halted = true;
        self.run = RunState::Stopped;
        self.tx = TxFlags::STOPPED;
        self.scheduler.idle();
        for timer in TimerId::ALL {
            self.disarm(timer);
        }
    }

    fn handle_event(&mut self, event: AppEvent) -> Result<(), ControllerError> {
        match event {
            AppEvent::Radio(event) => self.handle_radio_event(event),
            AppEvent::Ble(event) => self.handle_ble_event(event),
            AppEvent::Timer(expired) => self.handle_timer(expired),
            AppEvent::Button(button) => {
                self.handle_button(button);
                Ok(())
            }
        }
    }

    fn process(&mut self) -> Result<(), ControllerError> {
        let shared = self.state;
        let applied = shared.lock(|state| self.protocol.apply_pending(state, &mut self.indications))?;
        if let Some(applied) = applied {
            self.on_applied(applied)?;
        }
        if let Some(entry) = self.indications.drain_one(&mut self.stack)? {
            log!(Level::Trace, "Indication {:#06x} in flight", entry.characteristic);
        }
        Ok(())
    }

    fn handle_radio_event(&mut self, event: RadioEvent) -> Result<(), ControllerError> {
        let disposition = self.scheduler.on_radio_event(&event);
        if let Some((Role::ShortRange, kind)) = disposition.operation {
            if event.is_terminal() {
                log!(Level::Trace, "Short-range {:?} ended with {:?}", kind, event);
                self.stack.on_airtime_event(&event);
                return Ok(());
            }
        }
        match event {
            RadioEvent::PacketReceived { data, rssi } => {
                if self.run == RunState::Running(RunRole::Rx) {
                    self.on_packet_received(&data, rssi)?;
                    self.rearm_rx();
                }
            }
            RadioEvent::RxFrameError => {
                if self.run == RunState::Running(RunRole::Rx) {
                    self.state.lock(|state| state.packets_crc_error = state.packets_crc_error.saturating_add(1));
                    self.rearm_rx();
                }
            }
            RadioEvent::RxAborted | RadioEvent::RxFifoOverflow | RadioEvent::RxAddressFiltered => self.rearm_rx(),
            RadioEvent::PacketSent => self.on_packet_sent()?,
            RadioEvent::TxAborted | RadioEvent::TxBlocked | RadioEvent::TxUnderflow => self.on_tx_failure()?,
            RadioEvent::SchedulerStatus(status) => match disposition.operation {
                Some((Role::Proprietary, OperationKind::Tx)) if disposition.rearm => self.on_tx_failure()?,
                Some((Role::Proprietary, OperationKind::Rx)) if disposition.rearm => {
                    log!(Level::Debug, "RX lost the radio ({:?}), waiting for the next event", status)
                }
                _ => {}
            },
            RadioEvent::ConfigScheduled | RadioEvent::ConfigUnscheduled => {}
        }
        Ok(())
    }

    fn on_packet_received(&mut self, data: &[u8], rssi: i8) -> Result<(), ControllerError> {
        let snapshot = self.state.snapshot();
        let packet = match RadioFrame::decode(snapshot.frame_family(), data) {
            Ok(frame) => *frame.packet(),
            Err(error) => {
                log!(Level::Debug, "Ignoring undecodable frame: {}", error);
                return Ok(());
            }
        };
        if !packet.is_addressed_to(snapshot.src_id, snapshot.dest_id) {
            log!(
                Level::Warn,
                "Filtered packet {} from {} to {}",
                packet.pkt_counter,
                packet.src_id,
                packet.dest_id
            );
            return Ok(());
        }

        let state = self.state.lock(|state| {
            let window = state.ma_window_size;
            state.stats.on_packet_received(packet.pkt_counter, window);
            state.rssi_latch = rssi;
            state.per = state.stats.packet_error_rate();
            state.ma = state.stats.moving_average_percent();
            *state
        });
        if state.logging_enabled {
            log::info!(
                "RX rssi {} count {} received {} PER {:.1} MA {:.1}",
                rssi,
                state.stats.sequence_count(),
                state.stats.received(),
                state.per,
                state.ma
            );
        }

        let sample = RealtimeAdvertisement {
            rssi,
            count: state.stats.sequence_count(),
            received: state.stats.received(),
        };
        match sample.encode(&self.config.device_address) {
            Ok(data) => self.stack.start_advertising(&data, AdvertisingMode::NonConnectable, REALTIME_ADVERTISING_INTERVAL),
            Err(error) => log!(Level::Warn, "Realtime advertisement not built: {}", error),
        }

        if state.rx_complete() {
            self.stop_run(StopReason::Completed, true)
        } else {
            let remaining = state.packets_requested.saturating_sub(state.stats.sequence_count());
            self.arm_one_shot(TimerId::RunTimeout, self.rx_timeout(remaining));
            Ok(())
        }
    }

    /// Re-arms receive after a radio event, competing with short-range traffic.
    fn rearm_rx(&mut self) {
        self.start_rx(PRIORITY_BACKGROUND);
    }

    fn start_rx(&mut self, priority: u8) {
        if self.run != RunState::Running(RunRole::Rx) {
            return;
        }
        let channel = self.state.snapshot().channel;
        if let Err(error) = self.scheduler.request_rx(Role::Proprietary, priority, channel) {
            log!(Level::Warn, "RX restart on channel {} failed: {}", channel, error);
        }
    }

    fn rx_timeout(&self, remaining: u16) -> Duration {
        self.config.tx_period * (remaining as u32 + 2)
    }

    fn on_packet_sent(&mut self) -> Result<(), ControllerError> {
        if self.run != RunState::Running(RunRole::Tx) || self.tx.ready {
            log!(Level::Warn, "Ignoring packet sent without a transmit in flight");
            return Ok(());
        }
        self.tx.ready = true;
        self.tx.retry = false;
        if self.state.snapshot().tx_complete() {
            return self.stop_run(StopReason::Completed, true);
        }
        self.try_transmit()
    }

    fn on_tx_failure(&mut self) -> Result<(), ControllerError> {
        if self.run != RunState::Running(RunRole::Tx) || self.tx.ready {
            log!(Level::Debug, "Ignoring TX failure without a transmit in flight");
            return Ok(());
        }
        self.tx.ready = true;
        if !self.tx.retry {
            log!(Level::Debug, "Retrying packet {}", self.state.snapshot().packets_sent);
            self.tx.retry = true;
            self.tx.scheduled = true;
            return self.try_transmit();
        }

        self.tx.retry = false;
        let state = self.state.snapshot();
        log!(Level::Warn, "Packet {} dropped after retry", state.packets_sent);
        if state.tx_complete() {
            self.stop_run(StopReason::Completed, true)
        } else {
            Ok(())
        }
    }

    fn try_transmit(&mut self) -> Result<(), ControllerError> {
        if self.run != RunState::Running(RunRole::Tx) || !self.tx.ready || !self.tx.scheduled {
            return Ok(());
        }
        let retry = self.tx.retry;
        let state = self.state.snapshot();
        if !retry && state.tx_complete() {
            return Ok(());
        }

        let counter = if retry { state.packets_sent } else { state.next_packet_counter() };
        let frame = RadioFrame::for_transmit(
            state.frame_family(),
            counter,
            state.dest_id,
            state.src_id,
            state.payload_length,
            self.config.device_address,
        );
        let buffer = match frame.encode() {
            Ok(buffer) => buffer,
            Err(error) => {
                log!(Level::Error, "Packet {} not encoded: {}", counter, error);
                return self.stop_run(StopReason::Aborted, true);
            }
        };

        self.tx.scheduled = false;
        self.tx.ready = false;
        if !retry {
            self.state.lock(|state| state.packets_sent = counter);
        }
        match self.scheduler.request_tx(Role::Proprietary, PRIORITY_TEST, state.channel, &buffer, None) {
            Ok(()) => Ok(()),
            Err(error) => {
                log!(Level::Warn, "Packet {} not submitted: {}", counter, error);
                self.on_tx_failure()
            }
        }
    }

    fn handle_timer(&mut self, expired: TimerExpired) -> Result<(), ControllerError> {
        if expired.epoch != self.epochs[expired.timer.index()] {
            log!(Level::Warn, "Ignoring stale {:?} expiry", expired.timer);
            return Ok(());
        }
        match (expired.timer, self.run) {
            (TimerId::TxCadence, RunState::Running(RunRole::Tx)) => {
                self.tx.scheduled = true;
                self.try_transmit()
            }
            (TimerId::RunTimeout, RunState::Running(RunRole::Rx)) => self.stop_run(StopReason::Timeout, true),
            (TimerId::PktsSentIndication, RunState::Running(RunRole::Tx)) => {
                let sent = self.state.snapshot().packets_sent;
                self.indications.enqueue(IndicationEntry::new(Characteristic::PktsSent, sent))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_ble_event(&mut self, event: BleEvent) -> Result<(), ControllerError> {
        match event {
            BleEvent::ConnectionOpened { connection } => {
                self.link.on_connection_opened(connection);
                self.indications.on_connection_opened();
            }
            BleEvent::ConnectionClosed { .. } => {
                self.link.on_connection_closed(&mut self.stack, &self.config.device_address);
                self.indications.on_connection_closed();
                self.disarm(TimerId::PktsSentIndication);
            }
            BleEvent::WriteRequest { characteristic, value } => {
                let state = self.state.snapshot();
                let result = self.protocol.remote_write(&state, characteristic, &value);
                self.stack.send_write_response(characteristic, result.code());
            }
            BleEvent::ReadRequest { attribute } => {
                let state = self.state.snapshot();
                match self.protocol.remote_read(&state, attribute) {
                    Some(value) => self.stack.send_read_response(attribute, &value),
                    None => {
                        log!(Level::Warn, "Read of unknown attribute {:#06x}", attribute);
                        self.stack.send_read_response(attribute, &[]);
                    }
                }
            }
            BleEvent::CharacteristicStatus { status: CharacteristicStatus::Confirmation, .. } => self.indications.on_confirmation(),
            BleEvent::CharacteristicStatus {
                characteristic,
                status: CharacteristicStatus::ClientConfig { indications_enabled },
            } => {
                self.indications.set_client_config(characteristic, indications_enabled);
                if characteristic == Characteristic::PktsSent.id() {
                    if !indications_enabled {
                        self.disarm(TimerId::PktsSentIndication);
                    } else if self.run == RunState::Running(RunRole::Tx) {
                        self.arm_periodic(TimerId::PktsSentIndication, self.config.pkts_sent_indication_period);
                    }
                }
            }
            BleEvent::IndicationTimeout => self.indications.on_timeout(),
            BleEvent::Airtime(request) => self.request_airtime(request),
        }
        Ok(())
    }

    fn request_airtime(&mut self, request: AirtimeRequest) {
        let result = match request {
            AirtimeRequest::Listen { channel } => self.scheduler.request_rx(Role::ShortRange, PRIORITY_BACKGROUND, channel),
            AirtimeRequest::Transmit { channel, pdu } => match RadioFrameBuffer::from_bytes(&pdu) {
                Ok(frame) => self.scheduler.request_tx(Role::ShortRange, PRIORITY_BACKGROUND, channel, &frame, None),
                Err(error) => {
                    log!(Level::Warn, "Short-range PDU not queued: {}", error);
                    return;
                }
            },
        };
        if let Err(error) = result {
            log!(Level::Warn, "Short-range airtime request failed: {}", error);
        }
    }

    fn handle_button(&mut self, button: Button) {
        let state = self.state.snapshot();
        let item = match button {
            Button::Advance(item) => item,
            Button::ToggleRun => ConfigItemId::Running,
        };
        let value = self.protocol.local_advance(&state, item);
        log!(Level::Debug, "Button advanced {:?} to {}", item, value);
    }

    fn on_applied(&mut self, applied: AppliedChange) -> Result<(), ControllerError> {
        match applied.effect {
            ApplyEffect::None => {}
            ApplyEffect::PhyChanged => {
                let state = self.state.snapshot();
                if self.run == RunState::Running(RunRole::Tx) && !self.tx.ready {
                    log!(Level::Warn, "PHY change drops packet {} in flight", state.packets_sent);
                    self.tx = TxFlags::IDLE;
                }
                self.scheduler.reconfigure(state.phy_descriptor(), state.tx_power)?;
                self.publish_ranges(&state);
                self.start_rx(PRIORITY_TEST);
            }
            ApplyEffect::TxPowerChanged => {
                let tx_power = self.state.snapshot().tx_power;
                if let Err(error) = self.scheduler.set_tx_power(tx_power) {
                    log!(Level::Warn, "TX power {} not applied: {}", tx_power, error);
                }
            }
            ApplyEffect::ChannelChanged => {
                if self.run == RunState::Running(RunRole::Rx) {
                    self.scheduler.idle();
                    self.start_rx(PRIORITY_TEST);
                }
            }
            ApplyEffect::StartRun => self.start_run()?,
            ApplyEffect::StopRun => self.stop_run(StopReason::Operator, false)?,
        }
        Ok(())
    }

    /// Range descriptors kept in the stack's attribute table.
    fn publish_ranges(&mut self, state: &TestState) {
        for characteristic in [Characteristic::Channel, Characteristic::Payload] {
            if let Some(range) = self.protocol.remote_read(state, characteristic.valid_range_id()) {
                self.stack.write_attribute(characteristic.valid_range_id(), &range);
            }
        }
    }

    fn start_run(&mut self) -> Result<(), ControllerError> {
        let state = self.state.snapshot();
        let role = match state.radio_mode {
            RadioMode::Tx => RunRole::Tx,
            RadioMode::Rx => RunRole::Rx,
            RadioMode::Trx => {
                log!(Level::Warn, "Run requested in TRX mode, ignoring");
                self.state.lock(|state| state.is_running = false);
                self.indications.enqueue(IndicationEntry::new(Characteristic::IsRunning, 0))?;
                return Ok(());
            }
        };
        if self.run != RunState::Stopped {
            return Ok(());
        }

        self.state.lock(|state| {
            state.reset_run();
            state.is_running = true;
        });
        self.run = RunState::Running(role);
        self.tx = TxFlags::IDLE;
        log!(
            Level::Info,
            "{:?} run started: {} packets, PHY {}, channel {}",
            role,
            state.packets_requested,
            state.phy_descriptor().name,
            state.channel
        );

        match role {
            RunRole::Tx => {
                self.arm_periodic(TimerId::TxCadence, self.config.tx_period);
                if self.indications.client_config_enabled(Characteristic::PktsSent.id()) {
                    self.arm_periodic(TimerId::PktsSentIndication, self.config.pkts_sent_indication_period);
                }
            }
            RunRole::Rx => {
                self.link.deactivate(&mut self.stack);
                self.scheduler.cancel_pending(Role::ShortRange);
                self.arm_one_shot(TimerId::RunTimeout, self.rx_timeout(state.packets_requested));
                self.start_rx(PRIORITY_TEST);
            }
        }
        Ok(())
    }

    fn stop_run(&mut self, reason: StopReason, announce: bool) -> Result<(), ControllerError> {
        let RunState::Running(role) = self.run else {
            return Ok(());
        };
        self.run = RunState::Stopped;
        self.tx = TxFlags::STOPPED;
        self.scheduler.idle();
        for timer in TimerId::ALL {
            self.disarm(timer);
        }
        let state = self.state.lock(|state| {
            state.is_running = false;
            *state
        });
        log!(
            Level::Info,
            "{:?} run stopped ({:?}): sent {}, count {}, received {}, PER {:.1}",
            role,
            reason,
            state.packets_sent,
            state.stats.sequence_count(),
            state.stats.received(),
            state.per
        );

        if role == RunRole::Rx {
            self.link.activate(&mut self.stack, &self.config.device_address);
        }
        if announce {
            self.indications.enqueue(IndicationEntry::new(Characteristic::IsRunning, 0))?;
        }
        Ok(())
    }

    fn next_epoch(&mut self, timer: TimerId) -> u16 {
        let epoch = &mut self.epochs[timer.index()];
        *epoch = epoch.wrapping_add(1);
        *epoch
    }

    fn arm_periodic(&mut self, timer: TimerId, period: Duration) {
        let epoch = self.next_epoch(timer);
        self.timers.start_periodic(timer, period, epoch);
    }

    fn arm_one_shot(&mut self, timer: TimerId, after: Duration) {
        let epoch = self.next_epoch(timer);
        self.timers.start_one_shot(timer, after, epoch);
    }

    fn disarm(&mut self, timer: TimerId) {
        self.next_epoch(timer);
        self.timers.stop(timer);
    }
}

/// Controller task: consumes the event queue until a fatal error halts the controller.
#[embassy_executor::task(pool_size = crate::MAX_DEVICE_COUNT)]
pub(crate) async fn controller_task(mut controller: DeviceController, events: EventQueueReceiver) -> ! {
    log!(Level::Info, "Controller task started");
    while !controller.is_halted() {
        let event = if controller.has_pending_work() {
            events.try_receive().ok()
        } else {
            Some(events.receive().await)
        };
        if let Err(error) = controller.step(event) {
            log!(Level::Error, "Fatal range test error: {}", error);
            controller.halt();
        } else if controller.has_pending_work() {
            embassy_futures::yield_now().await;
        }
    }
    loop {
        core::future::pending::<()>().await;
    }
}
