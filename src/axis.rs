//! Per-axis configuration and live stepping state, plus the endstop table.
//!
//! One `AxisConfig` per motorized degree of freedom, fixed after the
//! configuration freeze; one `AxisRuntime` per axis, mutated only by the
//! movement ISR. Bitmask sizing matches the wire protocol's short forms:
//! up to 8 axes and 8 endstop inputs.

use crate::port::PortBit;

pub const MAX_AXES: usize = 8;
pub const MAX_ENDSTOPS: usize = 8;

/// Fixed configuration for one axis.
#[derive(Clone, Copy)]
pub struct AxisConfig {
    pub enable: PortBit,
    pub enable_invert: bool,

    pub dir: PortBit,
    /// false = high means increasing position.
    pub dir_invert: bool,

    pub step: PortBit,
    /// false = step pulse is active high.
    pub step_invert: bool,

    /// Peak step rate (steps/s). Zero means "not configured"; such an axis
    /// cannot be the primary axis of a move.
    pub max_rate: u16,
    /// Fallback rate the axis can sustain indefinitely when the queue runs
    /// shallow.
    pub underrun_max_rate: u16,
    /// Acceleration used to reach/leave the underrun rate.
    pub underrun_accel_rate: u32,

    /// Endstops that halt this axis when moving in the negative direction.
    pub min_endstops: u8,
    /// Endstops that halt this axis when moving in the positive direction.
    pub max_endstops: u8,
}

impl AxisConfig {
    pub fn has_underrun_params(&self) -> bool {
        self.underrun_max_rate != 0 && self.underrun_accel_rate != 0
    }
}

/// ISR-owned live state for one axis.
#[derive(Clone, Copy, Default)]
pub struct AxisRuntime {
    /// Signed Bresenham accumulator. Initialized to `-total_steps/2` at the
    /// start of each move so fractional axes step symmetrically around the
    /// move midpoint.
    pub step_event_counter: i32,
    /// Net pulses emitted, signed by direction.
    pub position: i32,
}

/// One endstop input switch.
#[derive(Clone, Copy)]
pub struct EndstopConfig {
    pub input: PortBit,
}

/// Underrun-avoidance thresholds, configured per system.
///
/// The predicate holds when the queue is shallow both by record count and by
/// buffered execution time: `(count < low_level && time < high_time) ||
/// time < low_time`.
#[derive(Clone, Copy)]
pub struct UnderrunWatermarks {
    pub low_level: u16,
    pub high_level: u16,
    pub low_time_us: u32,
    pub high_time_us: u32,
}

impl Default for UnderrunWatermarks {
    fn default() -> Self {
        // Conservative defaults: worry below 4 queued blocks unless half a
        // second of motion is buffered.
        Self {
            low_level: 4,
            high_level: 16,
            low_time_us: 100_000,
            high_time_us: 500_000,
        }
    }
}
