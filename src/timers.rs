//! Test timers.
//!
//! The controller arms three timers: the TX cadence, the RX completion timeout and
//! the periodic `pkts_sent` indication. Commands go to [`timer_task`] through a
//! channel; expiries come back as [`AppEvent::Timer`] on the event queue. The timer
//! task never touches the radio.
//!
//! Every arm carries an epoch chosen by the controller. An expiry already queued
//! when its timer was re-armed or stopped carries the old epoch and is dropped by
//! the controller.

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender, TrySendError};
use embassy_time::{Duration, Instant, Timer};
use log::{Level, log};

use crate::{AppEvent, EventQueueSender};

pub const TIMER_COMMAND_QUEUE_SIZE: usize = 8;

pub type TimerCommandQueue = Channel<CriticalSectionRawMutex, TimerCommand, TIMER_COMMAND_QUEUE_SIZE>;
pub type TimerCommandQueueSender = Sender<'static, CriticalSectionRawMutex, TimerCommand, TIMER_COMMAND_QUEUE_SIZE>;
pub type TimerCommandQueueReceiver = Receiver<'static, CriticalSectionRawMutex, TimerCommand, TIMER_COMMAND_QUEUE_SIZE>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerId {
    TxCadence,
    RunTimeout,
    PktsSentIndication,
}

impl TimerId {
    pub const COUNT: usize = 3;
    pub const ALL: [TimerId; TimerId::COUNT] = [TimerId::TxCadence, TimerId::RunTimeout, TimerId::PktsSentIndication];

    pub const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerExpired {
    pub timer: TimerId,
    pub epoch: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerCommand {
    /// Arms `timer` to fire after `after`, then every `period` if one is given.
    Start {
        timer: TimerId,
        epoch: u16,
        after: Duration,
        period: Option<Duration>,
    },
    Stop {
        timer: TimerId,
    },
}

/// Timer service used by the controller.
pub trait TestTimers {
    fn start_periodic(&mut self, timer: TimerId, period: Duration, epoch: u16);
    fn start_one_shot(&mut self, timer: TimerId, after: Duration, epoch: u16);
    fn stop(&mut self, timer: TimerId);
}

/// [`TestTimers`] backed by the command channel of [`timer_task`].
pub struct ChannelTimers {
    commands: TimerCommandQueueSender,
}

impl ChannelTimers {
    pub fn new(commands: TimerCommandQueueSender) -> Self {
        ChannelTimers { commands }
    }

    fn send(&self, command: TimerCommand) {
        if let Err(TrySendError::Full(command)) = self.commands.try_send(command) {
            log!(Level::Warn, "Timer command queue full, dropping {:?}", command);
        }
    }
}

impl TestTimers for ChannelTimers {
    fn start_periodic(&mut self, timer: TimerId, period: Duration, epoch: u16) {
        self.send(TimerCommand::Start {
            timer,
            epoch,
            after: period,
            period: Some(period),
        });
    }

    fn start_one_shot(&mut self, timer: TimerId, after: Duration, epoch: u16) {
        self.send(TimerCommand::Start {
            timer,
            epoch,
            after,
            period: None,
        });
    }

    fn stop(&mut self, timer: TimerId) {
        self.send(TimerCommand::Stop { timer });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    deadline: Instant,
    period: Option<Duration>,
    epoch: u16,
}

/// Deadlines of the armed timers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerSlots {
    slots: [Option<Slot>; TimerId::COUNT],
}

impl TimerSlots {
    pub const fn new() -> Self {
        TimerSlots {
            slots: [None; TimerId::COUNT],
        }
    }

    pub fn apply(&mut self, command: TimerCommand, now: Instant) {
        match command {
            TimerCommand::Start {
                timer,
                epoch,
                after,
                period,
            } => {
                self.slots[timer.index()] = Some(Slot {
                    deadline: now + after,
                    period,
                    epoch,
                })
            }
            TimerCommand::Stop { timer } => self.slots[timer.index()] = None,
        }
    }

    pub fn is_armed(&self, timer: TimerId) -> bool {
        self.slots[timer.index()].is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(|slot| slot.deadline).min()
    }

    /// Collects every timer due at `now`; periodic ones are re-armed, one-shots cleared.
    pub fn expire(&mut self, now: Instant) -> heapless::Vec<TimerExpired, { TimerId::COUNT }> {
        let mut expired = heapless::Vec::new();
        for timer in TimerId::ALL {
            let entry = &mut self.slots[timer.index()];
            let Some(slot) = entry.as_mut() else {
                continue;
            };
            if slot.deadline > now {
                continue;
            }
            let _ = expired.push(TimerExpired { timer, epoch: slot.epoch });
            let period = slot.period;
            match period {
                Some(period) => {
                    slot.deadline += period;
                    if slot.deadline <= now {
                        slot.deadline = now + period;
                    }
                }
                None => *entry = None,
            }
        }
        expired
    }
}

/// Timer task: waits for the nearest deadline or the next command.
#[embassy_executor::task(pool_size = crate::MAX_DEVICE_COUNT)]
pub(crate) async fn timer_task(commands: TimerCommandQueueReceiver, events: EventQueueSender) -> ! {
    let mut slots = TimerSlots::new();
    loop {
        let command = match slots.next_deadline() {
            Some(deadline) => match select(commands.receive(), Timer::at(deadline)).await {
                Either::First(command) => Some(command),
                Either::Second(()) => None,
            },
            None => Some(commands.receive().await),
        };

        let now = Instant::now();
        if let Some(command) = command {
            slots.apply(command, now);
        }
        for expired in slots.expire(now) {
            if let Err(TrySendError::Full(_)) = events.try_send(AppEvent::Timer(expired)) {
                log!(Level::Warn, "Event queue full, timer {:?} expiry dropped", expired.timer);
            }
        }
    }
}
