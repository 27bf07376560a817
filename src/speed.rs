//! Step-rate to timer-compare mapping.
//!
//! The movement timer is a free-running counter at 2 MHz (1 tick = 0.5 µs).
//! Above 10 kHz the ISR emits 2 step events per fire, above 20 kHz 4, so
//! the interrupt rate itself never exceeds 10 kHz. The rate-to-interval
//! division is replaced by two interpolated lookup tables, built at compile
//! time from the timer clock: a fine-grained table for low rates and a
//! coarse one for high rates.

/// Timer input frequency after prescaling.
pub const TIMER_HZ: u32 = 2_000_000;

/// Hard ceiling on step events per second.
pub const MAX_STEP_FREQUENCY: u16 = 40_000;

/// Lowest representable rate; also the offset subtracted before the table
/// lookup (a 2-tick minimum period at the bottom of the slow table).
const MIN_RATE: u16 = 32;

/// Never program a compare interval shorter than this (50 µs), regardless
/// of the requested rate.
const MIN_TIMER_INTERVAL: u16 = 100;

/// High-rate region: one entry per 256 steps/s, `(interval, span)` where
/// `span` is the interval drop to the next entry.
static SPEED_TABLE_FAST: [[u16; 2]; 256] = build_table::<256>();

/// Low-rate region: one entry per 8 steps/s.
static SPEED_TABLE_SLOW: [[u16; 2]; 256] = build_table::<8>();

const fn build_table<const STEP: u32>() -> [[u16; 2]; 256] {
    let mut table = [[0u16; 2]; 256];
    let mut i = 0;
    while i < 256 {
        let rate = MIN_RATE as u32 + i as u32 * STEP;
        let interval = TIMER_HZ / rate;
        let next = TIMER_HZ / (rate + STEP);
        table[i as usize] = [interval as u16, (interval - next) as u16];
        i += 1;
    }
    table
}

/// Map a step rate to `(timer_interval, step_loops)`.
///
/// `step_loops` is how many step events the ISR must emit per fire at this
/// rate (1, 2 or 4).
pub fn rate_to_timer(step_rate: u16) -> (u16, u8) {
    let mut rate = step_rate.min(MAX_STEP_FREQUENCY);

    let step_loops = if rate > 20_000 {
        rate >>= 2;
        4
    } else if rate > 10_000 {
        rate >>= 1;
        2
    } else {
        1
    };

    let rate = rate.max(MIN_RATE) - MIN_RATE;

    let timer = if rate >= 8 * 256 {
        let [interval, span] = SPEED_TABLE_FAST[(rate >> 8) as usize];
        interval - (((rate & 0xFF) as u32 * span as u32) >> 8) as u16
    } else {
        let [interval, span] = SPEED_TABLE_SLOW[(rate >> 3) as usize];
        interval - (((rate & 0x07) as u32 * span as u32) >> 3) as u16
    };

    (timer.max(MIN_TIMER_INTERVAL), step_loops)
}

/// Just the loops-per-fire multiplier for a rate, without touching the
/// timer mapping.
pub fn step_loops_for(step_rate: u16) -> u8 {
    let rate = step_rate.min(MAX_STEP_FREQUENCY);
    if rate > 20_000 {
        4
    } else if rate > 10_000 {
        2
    } else {
        1
    }
}
