//! # Indication Queue
//!
//! Delivers attribute-change indications to the single remote subscriber, one at a
//! time. An entry stays at the head of the queue until the subscriber confirms it;
//! only then is the next one sent.
//!
//! ## State machine
//!
//! `Idle -> Ongoing -> {Success, Failure}`, and `Success -> Idle` when the confirmed
//! head is removed. `Failure` is terminal: the transport gave up after its own
//! timeout, which means the subscriber is unresponsive, and the queue halts.
//!
//! Duplicate updates of the same attribute are kept in FIFO order. A full queue is
//! a producer bug and is reported as [`IndicationError::QueueFull`].

use heapless::Deque;
use log::{Level, log};

use crate::ble_stack::Characteristic;

pub const INDICATION_QUEUE_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndicationEntry {
    pub characteristic: u16,
    pub value: u16,
}

impl IndicationEntry {
    pub const fn new(characteristic: Characteristic, value: u16) -> Self {
        IndicationEntry {
            characteristic: characteristic.id(),
            value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndicationStatus {
    Idle,
    Ongoing,
    Success,
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// No subscriber, or the subscriber did not enable indications for the attribute.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IndicationError {
    #[error("indication queue full")]
    QueueFull,
    #[error("indication not confirmed by the subscriber")]
    TransportFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("notification transport rejected the indication")]
pub struct TransportError;

/// Sends one indication. Confirmation and timeout arrive later as stack events.
pub trait NotificationTransport {
    fn send_indication(&mut self, characteristic: u16, value: &[u8]) -> Result<(), TransportError>;
}

impl<T: NotificationTransport + ?Sized> NotificationTransport for &mut T {
    fn send_indication(&mut self, characteristic: u16, value: &[u8]) -> Result<(), TransportError> {
        (**self).send_indication(characteristic, value)
    }
}

pub struct IndicationQueue {
    entries: Deque<IndicationEntry, INDICATION_QUEUE_SIZE>,
    status: IndicationStatus,
    connected: bool,
    client_config: u32,
}

impl Default for IndicationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicationQueue {
    pub const fn new() -> Self {
        IndicationQueue {
            entries: Deque::new(),
            status: IndicationStatus::Idle,
            connected: false,
            client_config: 0,
        }
    }

    pub fn status(&self) -> IndicationStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The "indication pending" signal: something waits and nothing is in flight.
    pub fn ready_to_send(&self) -> bool {
        !self.entries.is_empty() && matches!(self.status, IndicationStatus::Idle | IndicationStatus::Success)
    }

    pub fn client_config_enabled(&self, characteristic: u16) -> bool {
        characteristic < 32 && self.client_config & (1 << characteristic) != 0
    }

    pub fn set_client_config(&mut self, characteristic: u16, indications_enabled: bool) {
        if characteristic >= 32 {
            log!(Level::Warn, "Client config for unknown characteristic {:#06x}", characteristic);
            return;
        }
        if indications_enabled {
            self.client_config |= 1 << characteristic;
        } else {
            self.client_config &= !(1 << characteristic);
        }
    }

    /// Queues an indication for the subscriber.
    ///
    /// # Returns
    /// * `Ok(EnqueueOutcome::Rejected)` when nobody is subscribed to the attribute
    /// * `Err(IndicationError::QueueFull)` when the producer outran the subscriber
    pub fn enqueue(&mut self, entry: IndicationEntry) -> Result<EnqueueOutcome, IndicationError> {
        if !self.connected || Characteristic::from_id(entry.characteristic).is_none() || !self.client_config_enabled(entry.characteristic) {
            return Ok(EnqueueOutcome::Rejected);
        }
        self.entries.push_back(entry).map_err(|_| {
            log!(Level::Error, "Indication queue full, dropping {:#06x}", entry.characteristic);
            IndicationError::QueueFull
        })?;
        Ok(EnqueueOutcome::Queued)
    }

    /// Sends the head entry if the previous indication resolved.
    ///
    /// # Returns
    /// * `Ok(Some(entry))` - the entry just handed to the transport
    /// * `Ok(None)` - an indication is still in flight, or nothing is queued
    /// * `Err(IndicationError::TransportFailure)` - a previous indication failed
    pub fn drain_one<T: NotificationTransport>(&mut self, transport: &mut T) -> Result<Option<IndicationEntry>, IndicationError> {
        match self.status {
            IndicationStatus::Ongoing => return Ok(None),
            IndicationStatus::Failure => return Err(IndicationError::TransportFailure),
            IndicationStatus::Success => {
                self.entries.pop_front();
                self.status = IndicationStatus::Idle;
            }
            IndicationStatus::Idle => {}
        }

        let Some(entry) = self.entries.front().copied() else {
            return Ok(None);
        };
        let width = Characteristic::from_id(entry.characteristic).map(Characteristic::width).unwrap_or(2);
        let bytes = entry.value.to_le_bytes();
        if transport.send_indication(entry.characteristic, &bytes[..width.min(2)]).is_err() {
            self.status = IndicationStatus::Failure;
            return Err(IndicationError::TransportFailure);
        }
        log!(Level::Debug, "Indication {:#06x} = {} sent", entry.characteristic, entry.value);
        self.status = IndicationStatus::Ongoing;
        Ok(Some(entry))
    }

    /// The subscriber confirmed the indication in flight.
    pub fn on_confirmation(&mut self) {
        if self.status == IndicationStatus::Ongoing {
            self.status = IndicationStatus::Success;
        } else {
            log!(Level::Warn, "Unexpected indication confirmation in state {:?}", self.status);
        }
    }

    /// The transport timed out waiting for the confirmation.
    pub fn on_timeout(&mut self) {
        if self.status == IndicationStatus::Ongoing {
            log!(Level::Error, "Indication confirmation timed out");
            self.status = IndicationStatus::Failure;
        }
    }

    pub fn on_connection_opened(&mut self) {
        self.clear();
        self.connected = true;
    }

    /// Drops everything: queued entries, the in-flight state and all client configs.
    pub fn on_connection_closed(&mut self) {
        self.clear();
        self.connected = false;
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.status = IndicationStatus::Idle;
        self.client_config = 0;
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::test_support::MockStack;

    fn subscribed_queue(characteristics: &[Characteristic]) -> IndicationQueue {
        let mut queue = IndicationQueue::new();
        queue.on_connection_opened();
        for characteristic in characteristics {
            queue.set_client_config(characteristic.id(), true);
        }
        queue
    }

    #[test]
    fn rejected_without_subscriber() {
        let mut queue = IndicationQueue::new();
        let outcome = queue.enqueue(IndicationEntry::new(Characteristic::Phy, 1));
        assert_eq!(outcome, Ok(EnqueueOutcome::Rejected));
        assert!(queue.is_empty());
    }

    #[test]
    fn rejected_when_client_config_disabled() {
        let mut queue = subscribed_queue(&[Characteristic::Phy]);
        assert_eq!(queue.enqueue(IndicationEntry::new(Characteristic::Channel, 11)), Ok(EnqueueOutcome::Rejected));
        assert_eq!(queue.enqueue(IndicationEntry::new(Characteristic::Phy, 4)), Ok(EnqueueOutcome::Queued));
    }

    #[test]
    fn at_most_one_indication_in_flight() {
        let mut queue = subscribed_queue(&[Characteristic::Phy, Characteristic::Channel]);
        let mut stack = MockStack::default();
        queue.enqueue(IndicationEntry::new(Characteristic::Phy, 4)).expect("enqueue");
        assert_eq!(queue.drain_one(&mut stack), Ok(Some(IndicationEntry::new(Characteristic::Phy, 4))));

        for channel in 11..15 {
            queue.enqueue(IndicationEntry::new(Characteristic::Channel, channel)).expect("enqueue");
            assert_eq!(queue.drain_one(&mut stack), Ok(None));
        }
        assert_eq!(stack.indications.len(), 1);

        queue.on_confirmation();
        assert_eq!(queue.drain_one(&mut stack), Ok(Some(IndicationEntry::new(Characteristic::Channel, 11))));
        assert_eq!(stack.indications.len(), 2);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn values_use_characteristic_width() {
        let mut queue = subscribed_queue(&[Characteristic::TxPower, Characteristic::Log]);
        let mut stack = MockStack::default();
        queue.enqueue(IndicationEntry::new(Characteristic::TxPower, (-150i16) as u16)).expect("enqueue");
        queue.enqueue(IndicationEntry::new(Characteristic::Log, 1)).expect("enqueue");
        queue.drain_one(&mut stack).expect("drain");
        queue.on_confirmation();
        queue.drain_one(&mut stack).expect("drain");
        assert_eq!(stack.indications[0], (Characteristic::TxPower.id(), (-150i16).to_le_bytes().to_vec()));
        assert_eq!(stack.indications[1], (Characteristic::Log.id(), vec![1]));
    }

    #[test]
    fn duplicates_are_preserved_in_order() {
        let mut queue = subscribed_queue(&[Characteristic::PktsSent]);
        let mut stack = MockStack::default();
        for value in [1, 1, 2] {
            queue.enqueue(IndicationEntry::new(Characteristic::PktsSent, value)).expect("enqueue");
        }
        let mut sent = Vec::new();
        while let Ok(Some(entry)) = queue.drain_one(&mut stack) {
            sent.push(entry.value);
            queue.on_confirmation();
        }
        assert_eq!(sent, vec![1, 1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.status(), IndicationStatus::Idle);
    }

    #[test]
    fn full_queue_is_an_error() {
        let mut queue = subscribed_queue(&[Characteristic::PktsSent]);
        for value in 0..INDICATION_QUEUE_SIZE as u16 {
            queue.enqueue(IndicationEntry::new(Characteristic::PktsSent, value)).expect("enqueue");
        }
        assert_eq!(queue.enqueue(IndicationEntry::new(Characteristic::PktsSent, 99)), Err(IndicationError::QueueFull));
    }

    #[test]
    fn timeout_halts_the_queue() {
        let mut queue = subscribed_queue(&[Characteristic::Phy]);
        let mut stack = MockStack::default();
        queue.enqueue(IndicationEntry::new(Characteristic::Phy, 1)).expect("enqueue");
        queue.drain_one(&mut stack).expect("drain");
        queue.on_timeout();
        assert_eq!(queue.status(), IndicationStatus::Failure);
        assert_eq!(queue.drain_one(&mut stack), Err(IndicationError::TransportFailure));
        assert_eq!(stack.indications.len(), 1);
    }

    #[test]
    fn transport_refusal_is_a_failure() {
        let mut queue = subscribed_queue(&[Characteristic::Phy]);
        let mut stack = MockStack::default();
        stack.refuse_indications = true;
        queue.enqueue(IndicationEntry::new(Characteristic::Phy, 1)).expect("enqueue");
        assert_eq!(queue.drain_one(&mut stack), Err(IndicationError::TransportFailure));
        assert_eq!(queue.status(), IndicationStatus::Failure);
    }

    #[test]
    fn disconnect_clears_entries_and_client_configs() {
        let mut queue = subscribed_queue(&[Characteristic::Phy]);
        let mut stack = MockStack::default();
        queue.enqueue(IndicationEntry::new(Characteristic::Phy, 1)).expect("enqueue");
        queue.enqueue(IndicationEntry::new(Characteristic::Phy, 2)).expect("enqueue");
        queue.drain_one(&mut stack).expect("drain");
        queue.on_connection_closed();
        assert!(queue.is_empty());
        assert_eq!(queue.status(), IndicationStatus::Idle);

        queue.on_connection_opened();
        assert!(!queue.client_config_enabled(Characteristic::Phy.id()));
        assert_eq!(queue.enqueue(IndicationEntry::new(Characteristic::Phy, 3)), Ok(EnqueueOutcome::Rejected));
    }
}
