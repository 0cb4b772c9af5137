//! # Packet Statistics Engine
//!
//! Converts the raw (lossy, restartable) packet counter stream of the peer into
//! loss statistics: a rebased sequence count, the number of packets received,
//! the packet error rate and a windowed moving average of recent losses.
//!
//! ## Key Components
//!
//! - **MovingAverage**: one bit per recent packet slot, packed into four 32-bit words.
//!   A set bit marks a lost slot, a cleared bit a received one. The window is 32, 64
//!   or 128 slots.
//! - **PacketStatistics**: sequence rebasing and gap accounting on top of the
//!   moving average.
//!
//! ## Rebasing
//!
//! The first packet of a run defines the offset (`seq - 1`), so the first accepted
//! packet always has the rebased count 1. A raw counter that is not above the current
//! rebased count means the peer restarted its run, and the engine starts over. A raw
//! counter above the rebased count is a forward gap, even when it lies below the
//! newest raw counter. 16-bit counter wraparound is not special-cased.

/// Moving-average window sizes selectable by the operator.
pub const MA_WINDOW_SIZES: [u8; 3] = [32, 64, 128];

/// Largest moving-average window, in packet slots.
pub const MA_WINDOW_MAX: u8 = 128;

const MA_HISTORY_WORDS: usize = MA_WINDOW_MAX as usize / 32;

/// Bit-ring history of the most recent packet slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MovingAverage {
    history: [u32; MA_HISTORY_WORDS],
    finger: u8,
    window_size: u8,
}

impl MovingAverage {
    /// Creates an empty history with the given window size.
    ///
    /// Sizes that are not one of [`MA_WINDOW_SIZES`] fall back to the smallest window.
    pub const fn new(window_size: u8) -> Self {
        MovingAverage {
            history: [0; MA_HISTORY_WORDS],
            finger: 0,
            window_size: sanitize_window(window_size),
        }
    }

    /// Changes the active window without touching the history.
    ///
    /// Slots beyond a smaller window are ignored by [`MovingAverage::get`] but kept,
    /// so switching back to a larger window sees them again.
    pub fn resize(&mut self, window_size: u8) {
        self.window_size = sanitize_window(window_size);
        if self.finger >= self.window_size {
            self.finger = 0;
        }
    }

    /// Clears the whole history and activates `window_size`.
    pub fn clear(&mut self, window_size: u8) {
        self.history = [0; MA_HISTORY_WORDS];
        self.finger = 0;
        self.window_size = sanitize_window(window_size);
    }

    /// Active window size in packet slots.
    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    /// Slot the next packet is recorded in.
    pub fn finger(&self) -> u8 {
        self.finger
    }

    /// Records `count` consecutive lost slots starting at the finger.
    ///
    /// A loss burst at least as long as the window marks every slot of the window and
    /// leaves the finger where it is.
    pub fn record_loss(&mut self, count: u16) {
        if count >= self.window_size as u16 {
            let words = self.active_words();
            for word in self.history.iter_mut().take(words) {
                *word = u32::MAX;
            }
            return;
        }
        for _ in 0..count {
            let (word, bit) = self.slot();
            self.history[word] |= bit;
            self.advance();
        }
    }

    /// Records the slot at the finger as received.
    pub fn record_received(&mut self) {
        let (word, bit) = self.slot();
        self.history[word] &= !bit;
        self.advance();
    }

    /// Number of lost slots currently inside the window.
    pub fn get(&self) -> u8 {
        self.history.iter().take(self.active_words()).map(|word| word.count_ones()).sum::<u32>() as u8
    }

    /// Lost slots as a percentage of the window.
    pub fn percent(&self) -> f32 {
        100.0 * self.get() as f32 / self.window_size as f32
    }

    fn active_words(&self) -> usize {
        (self.window_size as usize) >> 5
    }

    fn slot(&self) -> (usize, u32) {
        let finger = self.finger as usize;
        (finger >> 5, 1u32 << (finger & 0x1F))
    }

    fn advance(&mut self) {
        self.finger += 1;
        if self.finger >= self.window_size {
            self.finger = 0;
        }
    }
}

const fn sanitize_window(window_size: u8) -> u8 {
    match window_size {
        32 | 64 | 128 => window_size,
        _ => MA_WINDOW_SIZES[0],
    }
}

/// Result of feeding one accepted packet into the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiveOutcome {
    /// Counter of the packet relative to the first packet of the run (first packet is 1).
    pub rebased_count: u16,
    /// Packets received in the current run, including this one.
    pub received: u16,
    /// Slots recorded as lost in front of this packet.
    pub lost: u16,
    /// True when this packet started a new run (first packet or peer restart).
    pub restarted: bool,
}

/// Loss accounting over the peer's packet counter stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PacketStatistics {
    sequence_count: u16,
    sequence_offset: u16,
    received: u16,
    run_started: bool,
    moving_average: MovingAverage,
}

impl PacketStatistics {
    /// Creates an engine with no packet seen yet.
    pub const fn new(window_size: u8) -> Self {
        PacketStatistics {
            sequence_count: 0,
            sequence_offset: 0,
            received: 0,
            run_started: false,
            moving_average: MovingAverage::new(window_size),
        }
    }

    /// Returns to the "no packet yet" baseline and activates `window_size`.
    pub fn reset(&mut self, window_size: u8) {
        self.sequence_count = 0;
        self.sequence_offset = 0;
        self.received = 0;
        self.run_started = false;
        self.moving_average.clear(window_size);
    }

    /// Feeds one structurally valid, address-filtered packet counter.
    ///
    /// # Arguments
    /// * `seq` - raw packet counter carried by the packet
    /// * `window_size` - configured moving-average window, activated when the run (re)starts
    pub fn on_packet_received(&mut self, seq: u16, window_size: u8) -> ReceiveOutcome {
        let mut restarted = false;
        let mut previous_count = self.sequence_count;
        if !self.run_started || seq <= self.sequence_count {
            self.sequence_offset = seq.wrapping_sub(1);
            self.received = 0;
            self.moving_average.clear(window_size);
            self.run_started = true;
            previous_count = 0;
            restarted = true;
        }

        self.received = self.received.saturating_add(1);
        self.sequence_count = seq.wrapping_sub(self.sequence_offset);

        let gap = self.sequence_count.wrapping_sub(previous_count);
        let lost = gap.saturating_sub(1);
        if lost > 0 {
            self.moving_average.record_loss(lost);
        }
        self.moving_average.record_received();

        ReceiveOutcome {
            rebased_count: self.sequence_count,
            received: self.received,
            lost,
            restarted,
        }
    }

    /// Packet error rate in percent. Zero before the first packet.
    pub fn packet_error_rate(&self) -> f32 {
        if self.sequence_count == 0 {
            return 0.0;
        }
        let missing = self.sequence_count.saturating_sub(self.received);
        100.0 * missing as f32 / self.sequence_count as f32
    }

    /// Moving average of losses in percent of the active window.
    pub fn moving_average_percent(&self) -> f32 {
        self.moving_average.percent()
    }

    /// Loss history of the current run.
    pub fn moving_average(&self) -> &MovingAverage {
        &self.moving_average
    }

    /// Rebased counter of the newest accepted packet.
    pub fn sequence_count(&self) -> u16 {
        self.sequence_count
    }

    /// Raw counter of the first packet of the run, minus one.
    pub fn sequence_offset(&self) -> u16 {
        self.sequence_offset
    }

    /// Packets received in the current run.
    pub fn received(&self) -> u16 {
        self.received
    }

    /// True once the first packet of the run was accepted.
    pub fn has_packets(&self) -> bool {
        self.run_started
    }
}
