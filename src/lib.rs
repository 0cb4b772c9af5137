//! # Dual-Protocol Range Test
//!
//! Measures proprietary-radio link quality while a short-range protocol stack shares
//! the same radio. A device either transmits a numbered packet sequence or receives
//! it and computes the packet error rate and a moving-average loss. An observer
//! connected over the short-range link reads and writes the test parameters and is
//! told about every change through acknowledged indications.
//!
//! ## Architecture
//!
//! All events enter one channel and are handled by one task, in arrival order:
//!
//! ```text
//!  radio driver ──┐
//!  protocol stack ┼──► EventQueue ──► controller_task ──► TestRunController
//!  timer_task ────┤                          │
//!  buttons ───────┘                          └──► TimerCommandQueue ──► timer_task
//! ```
//!
//! ## Key Components
//!
//! - [`stats`]: sequence-gap accounting, PER and moving-average loss
//! - [`coex_scheduler`]: priority-annotated radio requests and completion dispatch
//! - [`indication_queue`]: one-in-flight acknowledged notification FIFO
//! - [`config_protocol`]: remotely and locally editable configuration items
//! - [`controller`]: the test-run state machine
//! - [`timers`]: cadence, completion timeout and periodic indication timers
//!
//! ## Memory
//!
//! With the `embedded` feature every queue and the shared test state live in
//! `static` storage. With `std` they are leaked from the heap on `initialize`, so
//! several devices can run in one process.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod ble_stack;
pub mod coex_scheduler;
pub mod config_protocol;
pub mod controller;
pub mod indication_queue;
pub mod messages;
pub mod phy;
pub mod radio_devices;
pub mod stats;
pub mod test_state;
pub mod timers;

#[cfg(all(test, feature = "std"))]
pub(crate) mod test_support;

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use embassy_time::Duration;
use log::{Level, log};

pub use crate::ble_stack::{BleEvent, Characteristic, ProtocolStack};
pub use crate::config_protocol::ConfigItemId;
pub use crate::controller::{ControllerError, DeviceController, RunRole, RunState, TestRunController};
pub use crate::radio_devices::{RadioDriver, RadioEvent};
pub use crate::test_state::{RadioMode, SharedTestState, TestDefaults, TestState};
pub use crate::timers::TimerExpired;

use crate::controller::controller_task;
use crate::timers::{ChannelTimers, TimerCommandQueue, timer_task};

/// Devices one process can host. Each one owns a controller and a timer task.
#[cfg(feature = "std")]
pub(crate) const MAX_DEVICE_COUNT: usize = 4;
#[cfg(not(feature = "std"))]
pub(crate) const MAX_DEVICE_COUNT: usize = 1;

pub const EVENT_QUEUE_SIZE: usize = 32;
pub type EventQueue = Channel<CriticalSectionRawMutex, AppEvent, EVENT_QUEUE_SIZE>;
pub type EventQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, AppEvent, EVENT_QUEUE_SIZE>;
pub type EventQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, AppEvent, EVENT_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static EVENT_QUEUE: EventQueue = Channel::new();
#[cfg(feature = "embedded")]
static TIMER_COMMAND_QUEUE: TimerCommandQueue = Channel::new();
#[cfg(feature = "embedded")]
static TEST_STATE: SharedTestState = SharedTestState::new(TestState::POWER_ON);

/// Default TX cadence.
pub const TX_PERIOD_DEFAULT: Duration = Duration::from_millis(10);
/// Default period of the `pkts_sent` indication during a TX run.
pub const PKTS_SENT_INDICATION_PERIOD_DEFAULT: Duration = Duration::from_secs(1);

/// Operator buttons of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Button {
    /// Moves the item to its next value.
    Advance(ConfigItemId),
    /// Starts or stops a run.
    ToggleRun,
}

/// Everything the controller task consumes.
#[derive(Clone, Debug, PartialEq)]
pub enum AppEvent {
    Radio(RadioEvent),
    Ble(BleEvent),
    Timer(TimerExpired),
    Button(Button),
}

/// Runtime configuration, fixed for the life of a device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeTestConfiguration {
    /// Interval between transmitted packets.
    pub tx_period: Duration,
    pub pkts_sent_indication_period: Duration,
    /// Public address of the short-range stack. Also names the device in advertisements.
    pub device_address: [u8; 6],
    /// Settings loaded on every start. Nothing is persisted.
    pub initial: TestDefaults,
}

impl Default for RangeTestConfiguration {
    fn default() -> Self {
        RangeTestConfiguration {
            tx_period: TX_PERIOD_DEFAULT,
            pkts_sent_indication_period: PKTS_SENT_INDICATION_PERIOD_DEFAULT,
            device_address: [0; 6],
            initial: TestDefaults::DEVICE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("task spawn failed")]
    TaskSpawnFailed,
    #[error("range test already initialized")]
    AlreadyInitialized,
    #[error("radio refused the initial configuration")]
    RadioConfiguration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendEventError {
    #[error("event queue full")]
    ChannelFull,
    #[error("range test not initialized")]
    NotInited,
}

enum RangeTestManagerState {
    Uninitialized,
    Initialized {
        event_queue_sender: EventQueueSender,
        test_state: &'static SharedTestState,
    },
}

/// Entry point of a device: wires the queues and spawns the tasks.
///
/// # Examples
/// ```rust,ignore
/// let mut manager = RangeTestManager::new();
/// manager.initialize(RangeTestConfiguration::default(), spawner, radio, stack)?;
/// manager.post_event(AppEvent::Button(Button::ToggleRun))?;
/// ```
pub struct RangeTestManager {
    state: RangeTestManagerState,
}

impl Default for RangeTestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeTestManager {
    pub const fn new() -> Self {
        RangeTestManager {
            state: RangeTestManagerState::Uninitialized,
        }
    }

    #[cfg(feature = "embedded")]
    pub fn initialize(
        &mut self,
        config: RangeTestConfiguration,
        spawner: Spawner,
        radio: &'static mut dyn RadioDriver,
        stack: &'static mut dyn ProtocolStack,
    ) -> Result<(), InitError> {
        self.initialize_common(config, spawner, radio, stack, &EVENT_QUEUE, &TIMER_COMMAND_QUEUE, &TEST_STATE)
    }

    #[cfg(feature = "std")]
    pub fn initialize(
        &mut self,
        config: RangeTestConfiguration,
        spawner: Spawner,
        radio: &'static mut dyn RadioDriver,
        stack: &'static mut dyn ProtocolStack,
    ) -> Result<(), InitError> {
        let event_queue = Self::leak_event_queue();
        self.initialize_with_queue(config, spawner, radio, stack, event_queue)
    }

    /// Allocates an event queue up front, for drivers that must hold its sender
    /// before the manager is initialized.
    #[cfg(feature = "std")]
    pub fn leak_event_queue() -> &'static EventQueue {
        Box::leak(Box::new(Channel::new()))
    }

    /// Like [`initialize`](Self::initialize), posting into a queue the caller allocated
    /// with [`leak_event_queue`](Self::leak_event_queue).
    #[cfg(feature = "std")]
    pub fn initialize_with_queue(
        &mut self,
        config: RangeTestConfiguration,
        spawner: Spawner,
        radio: &'static mut dyn RadioDriver,
        stack: &'static mut dyn ProtocolStack,
        event_queue: &'static EventQueue,
    ) -> Result<(), InitError> {
        let timer_command_queue: &'static TimerCommandQueue = Box::leak(Box::new(Channel::new()));
        let test_state: &'static SharedTestState = Box::leak(Box::new(SharedTestState::new(TestState::POWER_ON)));
        self.initialize_common(config, spawner, radio, stack, event_queue, timer_command_queue, test_state)
    }

    #[allow(clippy::too_many_arguments)]
    fn initialize_common(
        &mut self,
        config: RangeTestConfiguration,
        spawner: Spawner,
        radio: &'static mut dyn RadioDriver,
        stack: &'static mut dyn ProtocolStack,
        event_queue: &'static EventQueue,
        timer_command_queue: &'static TimerCommandQueue,
        test_state: &'static SharedTestState,
    ) -> Result<(), InitError> {
        if let RangeTestManagerState::Initialized { .. } = self.state {
            return Err(InitError::AlreadyInitialized);
        }

        let RangeTestConfiguration { initial, device_address, .. } = config;
        test_state.lock(|state| *state = TestState::new(&initial));

        let mut controller: DeviceController =
            TestRunController::new(test_state, config, radio, stack, ChannelTimers::new(timer_command_queue.sender()));
        if let Err(error) = controller.start() {
            log!(Level::Error, "Range test start failed: {}", error);
            return Err(InitError::RadioConfiguration);
        }

        if spawner.spawn(timer_task(timer_command_queue.receiver(), event_queue.sender())).is_err() {
            return Err(InitError::TaskSpawnFailed);
        }
        log!(Level::Debug, "Timer task spawned");

        if spawner.spawn(controller_task(controller, event_queue.receiver())).is_err() {
            return Err(InitError::TaskSpawnFailed);
        }
        log!(Level::Debug, "Controller task spawned");
        log!(
            Level::Info,
            "Range test initialized, device {:02X}{:02X}",
            device_address[1],
            device_address[0]
        );

        self.state = RangeTestManagerState::Initialized {
            event_queue_sender: event_queue.sender(),
            test_state,
        };
        Ok(())
    }

    /// Queues an event for the controller without waiting.
    pub fn post_event(&self, event: AppEvent) -> Result<(), SendEventError> {
        let event_queue_sender = match &self.state {
            RangeTestManagerState::Uninitialized => return Err(SendEventError::NotInited),
            RangeTestManagerState::Initialized { event_queue_sender, .. } => event_queue_sender,
        };
        match event_queue_sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                log!(Level::Warn, "Event queue full, dropping {:?}", event);
                Err(SendEventError::ChannelFull)
            }
        }
    }

    /// Sender for drivers that raise their own events.
    pub fn event_sender(&self) -> Option<EventQueueSender> {
        match &self.state {
            RangeTestManagerState::Uninitialized => None,
            RangeTestManagerState::Initialized { event_queue_sender, .. } => Some(*event_queue_sender),
        }
    }

    /// Copy of the current test state.
    pub fn snapshot(&self) -> Option<TestState> {
        match &self.state {
            RangeTestManagerState::Uninitialized => None,
            RangeTestManagerState::Initialized { test_state, .. } => Some(test_state.snapshot()),
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_uses_device_defaults() {
        let config = RangeTestConfiguration::default();
        assert_eq!(config.tx_period, Duration::from_millis(10));
        assert_eq!(config.pkts_sent_indication_period, Duration::from_secs(1));
        assert_eq!(config.initial, TestDefaults::default());
    }

    #[test]
    fn manager_post_event_not_inited() {
        let manager = RangeTestManager::new();
        match manager.post_event(AppEvent::Button(Button::ToggleRun)) {
            Err(SendEventError::NotInited) => {}
            other => panic!("Expected NotInited, got: {:?}", other),
        }
    }

    #[test]
    fn manager_has_no_state_before_initialize() {
        let manager = RangeTestManager::default();
        assert!(manager.snapshot().is_none());
        assert!(manager.event_sender().is_none());
    }

    #[test]
    fn leaked_queues_are_independent() {
        let first = RangeTestManager::leak_event_queue();
        let second = RangeTestManager::leak_event_queue();
        first.try_send(AppEvent::Button(Button::ToggleRun)).expect("first queue has room");
        assert!(second.try_receive().is_err());
        assert_eq!(first.try_receive(), Ok(AppEvent::Button(Button::ToggleRun)));
    }
}
