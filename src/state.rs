//! Global run state shared between the main loop and the two ISRs.
//!
//! Everything here is a naturally-aligned atomic; the only ordered protocol
//! in the crate is the ring buffer's (see `queue`). The stop model follows
//! the protocol's stopped-state machine: an asynchronous fault or an
//! emergency stop latches `is_stopped` with a cause and a type, all
//! activating orders fail until the host acknowledges, and a clear is only
//! possible for recoverable stop types.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopCause {
    Reset = 0,
    EndstopHit = 1,
    MovementError = 2,
    ThermalError = 3,
    DeviceFault = 4,
    ElectricalError = 5,
    FirmwareError = 6,
    UserRequest = 7,
    Other = 8,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopType {
    OneTimeOrCleared = 0,
    Persists = 1,
    Unrecoverable = 2,
}

pub struct SystemState {
    is_stopped: AtomicBool,
    stop_acknowledged: AtomicBool,
    stop_cause: AtomicU8,
    stop_type: AtomicU8,

    /// Soft stop: decelerate through underrun avoidance, then drain the
    /// queue once the step rate is low enough.
    come_to_stop_and_flush: AtomicBool,

    /// Exit speed of the most recently enqueued move; seeds the next
    /// move's entry speed. Written by the producer, cleared by the
    /// consumer on flush (only while the queue is empty).
    last_enqueued_final_speed: AtomicU16,

    /// True iff the last enqueued movement item was a checkpoint marker.
    /// Consumed by the first subsequent linear move.
    is_checkpoint_last: AtomicBool,

    /// Nominal time (µs) and step events of all enqueued-but-not-started
    /// moves. The producer adds on enqueue; the movement ISR subtracts as
    /// each move starts. Feeds the underrun predicate.
    queued_us_remaining: AtomicU32,
    queued_steps_remaining: AtomicU32,

    /// Latched stepper-enable outputs, one bit per axis. Written by the
    /// movement ISR only; the main loop just reads.
    stepper_enable_bits: AtomicU8,
}

impl SystemState {
    pub const fn new() -> Self {
        Self {
            is_stopped: AtomicBool::new(false),
            stop_acknowledged: AtomicBool::new(false),
            stop_cause: AtomicU8::new(StopCause::Reset as u8),
            stop_type: AtomicU8::new(StopType::OneTimeOrCleared as u8),
            come_to_stop_and_flush: AtomicBool::new(false),
            last_enqueued_final_speed: AtomicU16::new(0),
            is_checkpoint_last: AtomicBool::new(false),
            queued_us_remaining: AtomicU32::new(0),
            queued_steps_remaining: AtomicU32::new(0),
            stepper_enable_bits: AtomicU8::new(0),
        }
    }

    //
    // Stop model
    //

    pub fn is_stopped(&self) -> bool {
        self.is_stopped.load(Ordering::Relaxed)
    }

    /// Latch the stopped state with a cause. Later causes do not overwrite
    /// an unacknowledged earlier one.
    pub fn request_stop(&self, cause: StopCause, stop_type: StopType) {
        if !self.is_stopped.swap(true, Ordering::Relaxed) {
            self.stop_cause.store(cause as u8, Ordering::Relaxed);
            self.stop_type.store(stop_type as u8, Ordering::Relaxed);
            self.stop_acknowledged.store(false, Ordering::Relaxed);
        }
    }

    pub fn emergency_stop(&self) {
        self.request_stop(StopCause::UserRequest, StopType::OneTimeOrCleared);
    }

    pub fn stop_cause(&self) -> StopCause {
        StopCause::try_from(self.stop_cause.load(Ordering::Relaxed)).unwrap_or(StopCause::Other)
    }

    pub fn stop_type(&self) -> StopType {
        StopType::try_from(self.stop_type.load(Ordering::Relaxed))
            .unwrap_or(StopType::Unrecoverable)
    }

    pub fn is_stop_acknowledged(&self) -> bool {
        self.stop_acknowledged.load(Ordering::Relaxed)
    }

    /// Host acknowledgement of the stop. Returns what it acknowledged.
    pub fn acknowledge_stop(&self) -> (StopCause, StopType) {
        self.stop_acknowledged.store(true, Ordering::Relaxed);
        (self.stop_cause(), self.stop_type())
    }

    /// Clear an acknowledged, recoverable stop. Returns false if the stop
    /// persists (unacknowledged, or not clearable).
    pub fn clear_stop(&self) -> bool {
        if !self.is_stopped() {
            return true;
        }
        if !self.is_stop_acknowledged() || self.stop_type() == StopType::Unrecoverable {
            return false;
        }
        if self.stop_type() == StopType::Persists {
            return false;
        }
        self.is_stopped.store(false, Ordering::Relaxed);
        true
    }

    //
    // Soft stop / flush
    //

    pub fn request_come_to_stop_and_flush(&self) {
        self.come_to_stop_and_flush.store(true, Ordering::Relaxed);
    }

    pub fn come_to_stop_requested(&self) -> bool {
        self.come_to_stop_and_flush.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_come_to_stop(&self) {
        self.come_to_stop_and_flush.store(false, Ordering::Relaxed);
    }

    //
    // Enqueue chain state
    //

    pub fn last_enqueued_final_speed(&self) -> u16 {
        self.last_enqueued_final_speed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_enqueued_final_speed(&self, rate: u16) {
        self.last_enqueued_final_speed.store(rate, Ordering::Relaxed);
    }

    pub fn is_checkpoint_last(&self) -> bool {
        self.is_checkpoint_last.load(Ordering::Relaxed)
    }

    pub(crate) fn set_checkpoint_last(&self, value: bool) {
        self.is_checkpoint_last.store(value, Ordering::Relaxed);
    }

    //
    // Queue depth (underrun predicate inputs)
    //

    pub fn queued_us_remaining(&self) -> u32 {
        self.queued_us_remaining.load(Ordering::Relaxed)
    }

    pub fn queued_steps_remaining(&self) -> u32 {
        self.queued_steps_remaining.load(Ordering::Relaxed)
    }

    pub(crate) fn add_queued(&self, us: u32, steps: u32) {
        self.queued_us_remaining.fetch_add(us, Ordering::Relaxed);
        self.queued_steps_remaining.fetch_add(steps, Ordering::Relaxed);
    }

    pub(crate) fn consume_queued(&self, us: u32, steps: u32) {
        // saturating: a flush can remove blocks the counters still carry
        let _ = self
            .queued_us_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(us))
            });
        let _ = self
            .queued_steps_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(steps))
            });
    }

    pub(crate) fn reset_queued(&self) {
        self.queued_us_remaining.store(0, Ordering::Relaxed);
        self.queued_steps_remaining.store(0, Ordering::Relaxed);
    }

    //
    // Stepper enable latch
    //

    pub fn stepper_enable_bits(&self) -> u8 {
        self.stepper_enable_bits.load(Ordering::Relaxed)
    }

    pub fn stepper_enabled(&self, axis: u8) -> bool {
        self.stepper_enable_bits() & (1 << axis) != 0
    }

    pub(crate) fn set_stepper_enabled(&self, axis: u8, enabled: bool) {
        let bit = 1u8 << axis;
        if enabled {
            self.stepper_enable_bits.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.stepper_enable_bits.fetch_and(!bit, Ordering::Relaxed);
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}
