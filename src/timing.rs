// timing.rs — Host side of the GPU timing ring.
//
// Each compression records a begin/end timestamp pair into one of
// QUERY_RING_DEPTH slots, chosen by `frame_id % QUERY_RING_DEPTH`. A slot
// is read back QUERY_RING_DEPTH frames after it was written, so by the time
// we wait on it the GPU has almost always finished with it:
//
//   frame:   0   1   2   3   4   5   6   7 ...
//   write:   s0  s1  s2  s3  s4  s0  s1  s2
//   read:                    s0  s1  s2  s3      (after frame_id advances)
//
// Per-slot state machine:
//
//   Idle ──begin──▶ Began ──end──▶ Ended ──record──▶ Idle
//                     │              │
//                     └──abandon─────┴──▶ Idle   (call failed mid-flight)
//
// Elapsed times go into a RunningAverage that publishes its mean every
// TIMING_PUBLISH_INTERVAL samples and then starts over.

/// Number of timestamp slots in flight.
pub const QUERY_RING_DEPTH: usize = 5;

/// Non-disjoint samples averaged before a new value is published.
pub const TIMING_PUBLISH_INTERVAL: u32 = 100;

// ---------------------------------------------------------------------------
// TimestampSample
// ---------------------------------------------------------------------------

/// One resolved begin/end pair plus the tick frequency needed to read it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestampSample {
    pub begin: u64,
    pub end: u64,
    /// Ticks per second.
    pub frequency: u64,
    /// Set when the interval cannot be trusted (counter reset, clock change).
    pub disjoint: bool,
}

impl TimestampSample {
    /// Elapsed GPU time in milliseconds, or `None` for a disjoint sample.
    pub fn elapsed_ms(&self) -> Option<f64> {
        if self.disjoint || self.frequency == 0 || self.end < self.begin {
            return None;
        }
        Some((self.end - self.begin) as f64 * 1000.0 / self.frequency as f64)
    }
}

// ---------------------------------------------------------------------------
// RunningAverage
// ---------------------------------------------------------------------------

/// Accumulates samples and publishes their mean once enough have arrived.
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: u32,
    interval: u32,
}

impl RunningAverage {
    pub fn new(interval: u32) -> Self {
        RunningAverage {
            sum: 0.0,
            count: 0,
            interval: interval.max(1),
        }
    }

    /// Add a sample. Returns the freshly published mean when the interval fills.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        self.sum += value;
        self.count += 1;
        if self.count < self.interval {
            return None;
        }
        let mean = self.sum / self.count as f64;
        self.sum = 0.0;
        self.count = 0;
        Some(mean)
    }
}

// ---------------------------------------------------------------------------
// TimingRing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Began { frame: u64 },
    Ended { frame: u64 },
}

/// Frame counter and slot bookkeeping for the timestamp query ring.
#[derive(Debug, Clone)]
pub struct TimingRing {
    frame_id: u64,
    slots: [SlotState; QUERY_RING_DEPTH],
    average: RunningAverage,
}

impl Default for TimingRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingRing {
    pub fn new() -> Self {
        TimingRing {
            frame_id: 0,
            slots: [SlotState::Idle; QUERY_RING_DEPTH],
            average: RunningAverage::new(TIMING_PUBLISH_INTERVAL),
        }
    }

    /// Number of compressions completed so far.
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn current_slot(&self) -> usize {
        (self.frame_id % QUERY_RING_DEPTH as u64) as usize
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    /// Claim the current slot for this frame's begin timestamp.
    pub fn begin(&mut self) -> usize {
        let slot = self.current_slot();
        if let SlotState::Ended { frame } = self.slots[slot] {
            log::debug!("timing slot {slot} from frame {frame} overwritten before it was read");
        }
        self.slots[slot] = SlotState::Began {
            frame: self.frame_id,
        };
        slot
    }

    pub fn end(&mut self, slot: usize) {
        if let SlotState::Began { frame } = self.slots[slot] {
            self.slots[slot] = SlotState::Ended { frame };
        }
    }

    /// Forget a slot whose compression failed before completing.
    pub fn abandon(&mut self, slot: usize) {
        self.slots[slot] = SlotState::Idle;
    }

    /// Mark the current frame complete.
    ///
    /// Returns the slot written `QUERY_RING_DEPTH` frames ago when it holds a
    /// finished sample that should now be read.
    pub fn advance(&mut self) -> Option<usize> {
        self.frame_id += 1;
        if self.frame_id < QUERY_RING_DEPTH as u64 {
            return None;
        }
        let slot = self.current_slot();
        match self.slots[slot] {
            SlotState::Ended { .. } => Some(slot),
            _ => None,
        }
    }

    /// Consume the sample read from `slot`. Returns a newly published mean in ms.
    pub fn record(&mut self, slot: usize, sample: TimestampSample) -> Option<f64> {
        self.slots[slot] = SlotState::Idle;
        match sample.elapsed_ms() {
            Some(ms) => self.average.push(ms),
            None => {
                log::debug!("discarding disjoint timing sample from slot {slot}");
                None
            }
        }
    }
}
