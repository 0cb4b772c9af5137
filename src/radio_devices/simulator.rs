//! # Radio Device Simulator - Host Loopback Radio
//!
//! A [`RadioDriver`] that needs no hardware. Frames written by one simulated radio
//! travel over an "air" channel to a peer and come out of the peer's event queue as
//! [`RadioEvent::PacketReceived`], so a transmitting and a receiving controller can
//! be run against each other in one process.
//!
//! ## Architecture
//!
//! ```text
//!  SimulatedRadio (A) ──AirQueue──► radio_device_task (B) ──► B's EventQueue
//!         │                                  │
//!         └── PacketSent ──► A's EventQueue  └── ListenWindow (B)
//! ```
//!
//! - **SimulatedRadio**: owned by the controller. `start_tx` completes at once: the
//!   frame is put on the air unless the loss roll drops it, then `PacketSent` is
//!   posted to the own event queue.
//! - **ListenWindow**: where the receiving radio is tuned. Shared between the radio
//!   and its device task behind a critical-section mutex.
//! - **radio_device_task**: takes frames off the air and delivers those that match
//!   the listen window. A delivered frame closes the window; the controller re-arms
//!   receive after every event, like real hardware.
//!
//! ## Loss Simulation
//!
//! Each transmitted frame is dropped with probability `loss_percent / 100`, decided
//! by a seeded WyRand generator, so a run is reproducible.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender, TrySendError};
use log::{Level, log};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use super::{RadioDriver, RadioError, RadioEvent, RadioState, RxFrame, SchedulerRequest};
use crate::phy::{PHY_DEFAULT, PhyDescriptor, PhyId, TX_POWER_MAX, TX_POWER_MIN};
use crate::{AppEvent, EventQueueSender, MAX_DEVICE_COUNT};

/// Frames in flight towards one simulated radio.
pub const AIR_QUEUE_SIZE: usize = 16;

/// Path loss applied to the transmit power, in dB.
const PATH_LOSS_DB: i16 = 70;

pub type AirQueue = Channel<CriticalSectionRawMutex, AirFrame, AIR_QUEUE_SIZE>;
pub type AirQueueSender = Sender<'static, CriticalSectionRawMutex, AirFrame, AIR_QUEUE_SIZE>;
pub type AirQueueReceiver = Receiver<'static, CriticalSectionRawMutex, AirFrame, AIR_QUEUE_SIZE>;

/// A frame on the simulated air, tagged with where it was sent.
#[derive(Clone, Debug, PartialEq)]
pub struct AirFrame {
    pub phy: PhyId,
    pub channel: u16,
    pub data: RxFrame,
    pub rssi: i8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Tuning {
    phy: PhyId,
    channel: u16,
}

/// Receive window of one simulated radio.
pub struct ListenWindow(Mutex<CriticalSectionRawMutex, Cell<Option<Tuning>>>);

impl Default for ListenWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenWindow {
    pub const fn new() -> Self {
        ListenWindow(Mutex::new(Cell::new(None)))
    }

    fn tune(&self, tuning: Option<Tuning>) {
        self.0.lock(|cell| cell.set(tuning));
    }

    pub fn is_open(&self) -> bool {
        self.0.lock(|cell| cell.get().is_some())
    }

    /// Hands `frame` to the controller if the window is open on its PHY and channel.
    ///
    /// # Returns
    /// * `true` if the frame was posted; the window is closed afterwards
    pub fn deliver(&self, frame: AirFrame, events: &EventQueueSender) -> bool {
        let expected = Some(Tuning {
            phy: frame.phy,
            channel: frame.channel,
        });
        let caught = self.0.lock(|cell| {
            if cell.get() == expected {
                cell.set(None);
                true
            } else {
                false
            }
        });
        if !caught {
            log!(Level::Trace, "Nobody listening on channel {}, frame dropped", frame.channel);
            return false;
        }
        if let Err(TrySendError::Full(_)) = events.try_send(AppEvent::Radio(RadioEvent::PacketReceived {
            data: frame.data,
            rssi: frame.rssi,
        })) {
            log!(Level::Warn, "Event queue full, received frame dropped");
            return false;
        }
        true
    }
}

/// Simulated radio device, owned by the controller.
pub struct SimulatedRadio {
    air: AirQueueSender,
    events: EventQueueSender,
    window: &'static ListenWindow,
    phy: PhyId,
    tx_power: i16,
    state: RadioState,
    tx_fifo: RxFrame,
    loss_percent: u8,
    rng: WyRand,
}

impl SimulatedRadio {
    /// Creates a simulated radio.
    ///
    /// # Arguments
    /// * `air` - Air queue of the peer radio
    /// * `events` - Event queue of the controller that owns this radio
    /// * `window` - Listen window shared with this radio's [`radio_device_task`]
    /// * `loss_percent` - Share of transmitted frames dropped on the air, 0..=100
    /// * `rng_seed` - Seed of the loss generator
    pub fn new(air: AirQueueSender, events: EventQueueSender, window: &'static ListenWindow, loss_percent: u8, rng_seed: u64) -> Self {
        SimulatedRadio {
            air,
            events,
            window,
            phy: PHY_DEFAULT,
            tx_power: 0,
            state: RadioState::Idle,
            tx_fifo: RxFrame::new(),
            loss_percent: loss_percent.min(100),
            rng: WyRand::seed_from_u64(rng_seed),
        }
    }

    fn post(&self, event: RadioEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(AppEvent::Radio(event)) {
            log!(Level::Warn, "Event queue full, dropping {:?}", event);
        }
    }

    fn rssi(&self) -> i8 {
        (self.tx_power / 10 - PATH_LOSS_DB).clamp(i8::MIN as i16, i8::MAX as i16) as i8
    }

    fn lost(&mut self) -> bool {
        self.rng.next_u32() % 100 < u32::from(self.loss_percent)
    }
}

impl RadioDriver for SimulatedRadio {
    fn configure_phy(&mut self, phy: &PhyDescriptor) -> Result<(), RadioError> {
        if self.state != RadioState::Idle {
            return Err(RadioError::Busy);
        }
        if !phy.supported {
            return Err(RadioError::InvalidConfiguration);
        }
        self.phy = phy.id;
        log!(Level::Debug, "Simulated radio on PHY {}", phy.name);
        Ok(())
    }

    fn set_tx_power(&mut self, tenths_dbm: i16) -> Result<(), RadioError> {
        if !(TX_POWER_MIN..=TX_POWER_MAX).contains(&tenths_dbm) {
            return Err(RadioError::InvalidConfiguration);
        }
        self.tx_power = tenths_dbm;
        Ok(())
    }

    fn tx_power(&self) -> i16 {
        self.tx_power
    }

    fn start_rx(&mut self, channel: u16, _request: &SchedulerRequest) -> Result<(), RadioError> {
        self.window.tune(Some(Tuning { phy: self.phy, channel }));
        self.state = RadioState::Rx;
        Ok(())
    }

    fn write_tx_fifo(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        self.tx_fifo = RxFrame::from_slice(bytes).map_err(|_| RadioError::InvalidConfiguration)?;
        Ok(())
    }

    fn start_tx(&mut self, channel: u16, _request: &SchedulerRequest) -> Result<(), RadioError> {
        self.window.tune(None);
        if self.tx_fifo.is_empty() {
            self.state = RadioState::Idle;
            self.post(RadioEvent::TxUnderflow);
            return Ok(());
        }

        let data = core::mem::take(&mut self.tx_fifo);
        if self.lost() {
            log!(Level::Trace, "Simulated loss of a {} byte frame", data.len());
        } else {
            let frame = AirFrame {
                phy: self.phy,
                channel,
                data,
                rssi: self.rssi(),
            };
            if let Err(TrySendError::Full(_)) = self.air.try_send(frame) {
                log!(Level::Warn, "Air queue full, frame lost");
            }
        }
        self.state = RadioState::Idle;
        self.post(RadioEvent::PacketSent);
        Ok(())
    }

    fn idle(&mut self, _wait: bool) {
        self.window.tune(None);
        self.state = RadioState::Idle;
    }

    fn state(&self) -> RadioState {
        self.state
    }

    fn yield_radio(&mut self) {
        self.window.tune(None);
        self.state = RadioState::Idle;
    }
}

/// Simulated radio device task - delivers frames from the air.
///
/// # Arguments
/// * `air` - Air queue the peer radio transmits into
/// * `window` - Listen window of the local radio
/// * `events` - Event queue of the local controller
#[embassy_executor::task(pool_size = MAX_DEVICE_COUNT)]
pub async fn radio_device_task(air: AirQueueReceiver, window: &'static ListenWindow, events: EventQueueSender) -> ! {
    log!(Level::Info, "Simulated radio device task started");
    loop {
        let frame = air.receive().await;
        window.deliver(frame, &events);
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::controller::{RunRole, RunState, TestRunController};
    use crate::messages::RadioFrame;
    use crate::phy::FrameFamily;
    use crate::radio_devices::RequestKind;
    use crate::test_state::{RadioMode, SharedTestState, TestState};
    use crate::test_support::{MockStack, MockTimers};
    use crate::timers::{TimerExpired, TimerId};
    use crate::{Button, EventQueue, RangeTestConfiguration};

    const REQUEST: SchedulerRequest = SchedulerRequest {
        priority: 100,
        slip_time_us: 0,
        transaction_time_us: 0,
        kind: RequestKind::Tx,
    };

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    struct Bench {
        events: &'static EventQueue,
        air: &'static AirQueue,
        window: &'static ListenWindow,
    }

    impl Bench {
        fn new() -> Self {
            Bench {
                events: leak(Channel::new()),
                air: leak(Channel::new()),
                window: leak(ListenWindow::new()),
            }
        }

        /// Radio whose frames go to `peer`.
        fn radio(&self, peer: &Bench, loss_percent: u8, seed: u64) -> SimulatedRadio {
            SimulatedRadio::new(peer.air.sender(), self.events.sender(), self.window, loss_percent, seed)
        }

        fn deliver_air(&self) {
            while let Ok(frame) = self.air.try_receive() {
                self.window.deliver(frame, &self.events.sender());
            }
        }
    }

    fn frame_bytes(counter: u16) -> Vec<u8> {
        let buffer = RadioFrame::for_transmit(FrameFamily::Ieee802154, counter, 0, 0, 5, [1; 6])
            .encode()
            .expect("encode");
        buffer.as_bytes().to_vec()
    }

    #[test]
    fn transmit_reaches_the_peer_and_reports_sent() {
        let a = Bench::new();
        let b = Bench::new();
        let mut radio = a.radio(&b, 0, 1);
        radio.set_tx_power(100).expect("power");
        radio.write_tx_fifo(&frame_bytes(1)).expect("fifo");
        radio.start_tx(11, &REQUEST).expect("tx");

        assert_eq!(a.events.try_receive(), Ok(AppEvent::Radio(RadioEvent::PacketSent)));
        let frame = b.air.try_receive().expect("frame on air");
        assert_eq!(frame.channel, 11);
        assert_eq!(frame.rssi, -60);
        assert_eq!(frame.data.as_slice(), frame_bytes(1).as_slice());
        assert_eq!(radio.state(), RadioState::Idle);
    }

    #[test]
    fn full_loss_still_reports_sent() {
        let a = Bench::new();
        let b = Bench::new();
        let mut radio = a.radio(&b, 100, 7);
        for counter in 1..=5 {
            radio.write_tx_fifo(&frame_bytes(counter)).expect("fifo");
            radio.start_tx(11, &REQUEST).expect("tx");
        }
        assert!(b.air.try_receive().is_err());
        let mut sent = 0;
        while let Ok(event) = a.events.try_receive() {
            assert_eq!(event, AppEvent::Radio(RadioEvent::PacketSent));
            sent += 1;
        }
        assert_eq!(sent, 5);
    }

    #[test]
    fn empty_fifo_underflows() {
        let a = Bench::new();
        let b = Bench::new();
        let mut radio = a.radio(&b, 0, 1);
        radio.start_tx(11, &REQUEST).expect("tx");
        assert_eq!(a.events.try_receive(), Ok(AppEvent::Radio(RadioEvent::TxUnderflow)));
    }

    #[test]
    fn window_catches_one_frame_on_its_channel() {
        let b = Bench::new();
        let a = Bench::new();
        let mut radio = b.radio(&a, 0, 1);
        radio.start_rx(12, &REQUEST).expect("rx");

        let frame = |channel| AirFrame {
            phy: PHY_DEFAULT,
            channel,
            data: RxFrame::from_slice(&frame_bytes(1)).expect("fits"),
            rssi: -50,
        };
        assert!(!b.window.deliver(frame(11), &b.events.sender()));
        assert!(b.window.deliver(frame(12), &b.events.sender()));
        assert!(!b.window.is_open());
        assert!(!b.window.deliver(frame(12), &b.events.sender()));

        match b.events.try_receive() {
            Ok(AppEvent::Radio(RadioEvent::PacketReceived { rssi, .. })) => assert_eq!(rssi, -50),
            other => panic!("Expected PacketReceived, got: {:?}", other),
        }
    }

    #[test]
    fn device_task_side_delivers_from_the_air_queue() {
        let a = Bench::new();
        let b = Bench::new();
        let mut tx = a.radio(&b, 0, 3);
        let mut rx = b.radio(&a, 0, 4);
        rx.start_rx(11, &REQUEST).expect("rx");
        tx.write_tx_fifo(&frame_bytes(7)).expect("fifo");
        tx.start_tx(11, &REQUEST).expect("tx");

        let delivered = futures::executor::block_on(async {
            let frame = b.air.receive().await;
            b.window.deliver(frame, &b.events.sender())
        });
        assert!(delivered);
        match b.events.try_receive() {
            Ok(AppEvent::Radio(RadioEvent::PacketReceived { data, .. })) => {
                let packet = *RadioFrame::decode(FrameFamily::Ieee802154, &data).expect("decode").packet();
                assert_eq!(packet.pkt_counter, 7);
            }
            other => panic!("Expected PacketReceived, got: {:?}", other),
        }
    }

    #[test]
    fn phy_change_refused_while_receiving() {
        let b = Bench::new();
        let a = Bench::new();
        let mut radio = b.radio(&a, 0, 1);
        radio.start_rx(11, &REQUEST).expect("rx");
        assert_eq!(radio.configure_phy(&crate::phy::PHY_TABLE[0]), Err(RadioError::Busy));
        radio.idle(true);
        assert!(!b.window.is_open());
        assert_eq!(radio.configure_phy(&crate::phy::PHY_TABLE[0]), Ok(()));
    }

    type SimController = TestRunController<SimulatedRadio, MockStack, MockTimers>;

    fn device(bench: &Bench, peer: &Bench, mode: RadioMode, requested: u16, loss_percent: u8) -> SimController {
        let state: &'static SharedTestState = leak(SharedTestState::new(TestState::default()));
        state.lock(|state| {
            state.radio_mode = mode;
            state.packets_requested = requested;
        });
        let mut controller = TestRunController::new(
            state,
            RangeTestConfiguration::default(),
            bench.radio(peer, loss_percent, 42),
            MockStack::default(),
            MockTimers::default(),
        );
        controller.start().expect("start");
        controller.step(Some(AppEvent::Button(Button::ToggleRun))).expect("toggle run");
        controller
    }

    fn pump(controller: &mut SimController, bench: &Bench) {
        bench.deliver_air();
        while let Ok(event) = bench.events.try_receive() {
            controller.step(Some(event)).expect("step");
        }
    }

    fn tick(controller: &mut SimController) {
        let epoch = controller.timers().armed_epoch(TimerId::TxCadence).expect("cadence armed");
        controller
            .step(Some(AppEvent::Timer(TimerExpired {
                timer: TimerId::TxCadence,
                epoch,
            })))
            .expect("tick");
    }

    #[test]
    fn transmitter_and_receiver_complete_a_run() {
        let _ = env_logger::Builder::new().filter_level(log::LevelFilter::Debug).is_test(true).try_init();
        let tx_bench = Bench::new();
        let rx_bench = Bench::new();
        let mut receiver = device(&rx_bench, &tx_bench, RadioMode::Rx, 3, 0);
        let mut transmitter = device(&tx_bench, &rx_bench, RadioMode::Tx, 3, 0);
        assert_eq!(receiver.run_state(), RunState::Running(RunRole::Rx));
        assert_eq!(transmitter.run_state(), RunState::Running(RunRole::Tx));

        for _ in 0..3 {
            tick(&mut transmitter);
            pump(&mut receiver, &rx_bench);
            pump(&mut transmitter, &tx_bench);
        }

        assert_eq!(transmitter.run_state(), RunState::Stopped);
        assert_eq!(transmitter.snapshot().packets_sent, 3);
        assert_eq!(receiver.run_state(), RunState::Stopped);
        let rx = receiver.snapshot();
        assert_eq!(rx.stats.received(), 3);
        assert_eq!(rx.stats.sequence_count(), 3);
        assert_eq!(rx.per, 0.0);
    }

    #[test]
    fn lossy_air_shows_up_as_packet_errors() {
        let tx_bench = Bench::new();
        let rx_bench = Bench::new();
        let mut receiver = device(&rx_bench, &tx_bench, RadioMode::Rx, 200, 0);
        let mut transmitter = device(&tx_bench, &rx_bench, RadioMode::Tx, 200, 30);

        for _ in 0..100 {
            tick(&mut transmitter);
            pump(&mut receiver, &rx_bench);
            pump(&mut transmitter, &tx_bench);
        }

        let rx = receiver.snapshot();
        assert_eq!(transmitter.snapshot().packets_sent, 100);
        assert!(rx.stats.received() < 100);
        assert!(rx.stats.received() > 40);
        assert!(rx.per > 0.0);
    }
}
