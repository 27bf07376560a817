//! The movement interrupt: pops command records from the ring buffer and
//! executes them.
//!
//! Runs from a free-running 2 MHz hardware counter. `tick` is the ISR
//! body; its return value is the next compare interval in ticks (0.5 µs),
//! which the platform glue writes to the timer. While idle the ISR
//! reschedules at 1 ms so serial receive still gets polled.
//!
//! Like its Grbl/Marlin ancestors, linear moves run a trapezoid speed
//! curve:
//!
//! ```text
//!         __________________________
//!        /|                        |\     _________________
//!       / |                        | \   /|               |\
//!      /  |                        |  \ / |               | \
//!     /   |                        |   |  |               |  \
//!    +----+------------------------+---+--+---------------+---+
//!    |Phase1        Phase2       Phase3|
//!    |              BLOCK 1            |      BLOCK 2
//! ```
//!
//! Phase 1 accelerates from the previous block's exit speed, phase 2
//! coasts at the nominal rate, phase 3 decelerates to the block's final
//! rate. Step emission is a multi-axis Bresenham keyed to the longest
//! axis; speed is recalculated once per ISR fire, after the step pulses,
//! so recalculation jitter never lands between pulses.
//!
//! Underrun avoidance: when the queue is too shallow to trust that the
//! next block arrives in time, the block is re-shaped on the fly to cruise
//! at the primary axis's sustainable underrun rate, and to reach the
//! block's exit speed (or zero, if nothing else is queued) using
//! precalculated decel distances. If the speed bottoms out too early in
//! the block, the ISR "hops": accelerates for half the remaining steps and
//! decelerates for the other half, arriving at the exit speed exactly at
//! the block end. When the condition clears the block accelerates back to
//! nominal and leaves underrun mode.

use crate::axis::{AxisConfig, AxisRuntime, EndstopConfig, UnderrunWatermarks, MAX_AXES};
use crate::devices::{BuzzerShared, HeaterTargets, SoftPwmShared};
use crate::queue::QueueConsumer;
use crate::records::{LinearMove, OutputState, Record};
use crate::speed::{rate_to_timer, step_loops_for};
use crate::state::{StopCause, StopType, SystemState};
use crate::util::mul_u24x24_h16;

/// Speeds at or below this are "stopped enough" for the soft flush.
pub const ALLOWED_SPEED_DIFF: u16 = 4;

/// Idle reschedule interval: 1 ms at the 2 MHz counter, so serial RX is
/// still checked regularly.
pub const IDLE_INTERRUPT_RATE: u16 = 2_000;

/// After this many back-to-back non-suspending records in one entry, yield
/// for 50 µs to bound worst-case ISR latency.
const RECORD_BURST_LIMIT: u8 = 4;
const RECORD_YIELD_INTERVAL: u16 = 100;

fn serial_poll_noop() {}

/// Per-move execution state, alive while a `LinearMove` record is in
/// progress.
struct MoveState {
    cmd: LinearMove,
    step_events_remaining: u16,
    step_events_next_phase: u16,
    in_phase_1: bool,
    in_phase_2: bool,
    in_phase_3: bool,
    acceleration_time: u32,
    initial_rate: u16,
    nominal_rate: u16,
    nominal_rate_timer: u16,
    nominal_rate_step_loops: u8,
    nominal_block_time: u16,
    stopped_axes: u8,
}

enum Active {
    Move(MoveState),
    Delay { deadline_us: u32 },
}

#[derive(Default)]
struct UnderrunState {
    /// Whether the predicate currently holds.
    condition: bool,
    /// Latched once underrun shaping has begun; clears only when the step
    /// rate re-attains nominal.
    active: bool,
    accel_sign: i8,
    accel_start_rate: u16,
    accel_time: u32,
    /// Nonzero only during the end-of-block hop.
    hop_steps: u16,
    /// Decel distance from the underrun plateau to the block's final rate.
    steps_to_final: u16,
    /// Decel distance from the underrun plateau to a full stop.
    steps_to_stop: u16,
    /// The plateau: the primary axis's sustainable rate.
    max_rate: u16,
    accel_rate: u32,
}

pub struct MovementIsr<'a> {
    consumer: QueueConsumer<'a>,
    axes: &'a [AxisConfig],
    endstops: &'a [EndstopConfig],
    watermarks: &'a UnderrunWatermarks,
    shared: &'a SystemState,
    pwm_outputs: &'a SoftPwmShared,
    buzzers: &'a BuzzerShared,
    heater_targets: &'a HeaterTargets,

    runtime: [AxisRuntime; MAX_AXES],

    endstop_enable: u8,
    endstop_trigger_level: u8,
    endstop_hit: u8,

    /// Last direction written to each axis's direction port, one bit per
    /// axis number; avoids redundant port writes.
    current_directions: u8,

    // Speed state persists across moves: the exit rate of one block is the
    // entry rate of the next.
    step_rate: u16,
    step_loops: u8,
    final_rate: u16,

    underrun: UnderrunState,
    active: Option<Active>,

    /// Non-blocking serial RX drain, called every entry and between step
    /// loops.
    serial_poll: fn(),
    next_ocr: u16,
}

impl<'a> MovementIsr<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: QueueConsumer<'a>,
        axes: &'a [AxisConfig],
        endstops: &'a [EndstopConfig],
        endstop_trigger_level: u8,
        watermarks: &'a UnderrunWatermarks,
        shared: &'a SystemState,
        pwm_outputs: &'a SoftPwmShared,
        buzzers: &'a BuzzerShared,
        heater_targets: &'a HeaterTargets,
    ) -> Self {
        Self {
            consumer,
            axes,
            endstops,
            watermarks,
            shared,
            pwm_outputs,
            buzzers,
            heater_targets,
            runtime: [AxisRuntime::default(); MAX_AXES],
            endstop_enable: 0,
            endstop_trigger_level,
            endstop_hit: 0,
            current_directions: 0,
            step_rate: 0,
            step_loops: 1,
            final_rate: 0,
            underrun: UnderrunState::default(),
            active: None,
            serial_poll: serial_poll_noop,
            next_ocr: IDLE_INTERRUPT_RATE,
        }
    }

    pub fn set_serial_poll(&mut self, hook: fn()) {
        self.serial_poll = hook;
    }

    /// Immediate-order form of endstop enable (the queued record form goes
    /// through the ring).
    pub fn set_endstop_enabled(&mut self, endstop: u8, enabled: bool) {
        let bit = 1u8 << endstop;
        if enabled {
            self.endstop_enable |= bit;
        } else {
            self.endstop_enable &= !bit;
        }
    }

    /// Current step rate on the Bresenham clock (steps/s).
    pub fn step_rate(&self) -> u16 {
        self.step_rate
    }

    /// Net pulses emitted on `axis`, signed by direction.
    pub fn position(&self, axis: u8) -> i32 {
        self.runtime
            .get(axis as usize)
            .map(|r| r.position)
            .unwrap_or(0)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.consumer.is_empty()
    }

    /// The ISR body. `now_us` is the running microsecond clock (used by
    /// delay records). Returns the next timer compare interval in 0.5 µs
    /// ticks.
    pub fn tick(&mut self, now_us: u32) -> u16 {
        let mut started: u8 = 0;

        // Resume a suspended record first.
        if self.active.is_some() && !self.shared.is_stopped() {
            if self.run_active(now_us) {
                (self.serial_poll)();
                return self.next_ocr;
            }
            self.active = None;
            self.consumer.pop_finished();
        }

        (self.serial_poll)();

        loop {
            let stopped = self.shared.is_stopped();
            let flushing = self.shared.come_to_stop_requested();
            let must_idle = stopped || (flushing && self.step_rate <= ALLOWED_SPEED_DIFF);

            if !must_idle && started >= RECORD_BURST_LIMIT {
                // Let other interrupts run before the next batch.
                self.active = None;
                self.consumer.clear_in_progress();
                self.next_ocr = RECORD_YIELD_INTERVAL;
                return self.next_ocr;
            }

            let decoded = if must_idle {
                None
            } else {
                // Decode to an owned record so the ring slot can be
                // released independently of execution.
                self.consumer.peek_record().map(Record::decode)
            };

            let Some(decoded) = decoded else {
                // Queue empty, or we are required to stop here.
                self.active = None;
                if stopped || flushing {
                    self.dump_queue();
                }
                self.consumer.clear_in_progress();
                self.consumer.reset_count();
                self.next_ocr = IDLE_INTERRUPT_RATE;
                return self.next_ocr;
            };

            started += 1;
            match decoded {
                Err(_) => {
                    error!("unknown command in movement ISR");
                    self.consumer.pop_finished();
                }
                Ok(record) => {
                    if self.start_record(record, now_us) {
                        // Suspending record (move or delay): stay on it.
                        (self.serial_poll)();
                        return self.next_ocr;
                    }
                    self.consumer.pop_finished();
                }
            }
        }
    }

    /// Begin executing a record. Returns true if it suspends (keeps the
    /// ISR's attention across fires).
    fn start_record(&mut self, record: Record, now_us: u32) -> bool {
        match record {
            Record::LinearMove(cmd) => {
                let mut mv = self.setup_new_move(cmd);
                self.update_directions_and_initial_counts(&mut mv);
                let running = self.pump_move(&mut mv);
                if running {
                    self.active = Some(Active::Move(mv));
                }
                running
            }
            Record::Delay { us } => {
                let deadline_us = now_us.wrapping_add(us);
                let running = self.handle_delay(deadline_us, now_us);
                if running {
                    self.active = Some(Active::Delay { deadline_us });
                }
                running
            }
            Record::SetOutputSwitch(entries) => {
                for e in entries.iter() {
                    match e.state {
                        OutputState::Low => e.port.clear(),
                        OutputState::High => e.port.set(),
                        // Tristating a pin is a pin-mode change the
                        // platform layer performs outside the ISR.
                        OutputState::Disabled => {}
                    }
                }
                false
            }
            Record::SetPwmOutput { device, value } => {
                self.pwm_outputs.set_power(device, value);
                false
            }
            Record::SetBuzzer { device, value } => {
                self.buzzers.set(device, value);
                false
            }
            Record::SetHeaterTarget {
                heater,
                temp_tenths,
            } => {
                self.heater_targets.set(heater, temp_tenths);
                false
            }
            Record::SetStepperEnable { stepper, enable } => {
                if stepper == 0xFF {
                    for axis in 0..self.axes.len() as u8 {
                        self.write_stepper_enable(axis, enable);
                    }
                } else {
                    self.write_stepper_enable(stepper, enable);
                }
                false
            }
            Record::SetEndstopEnable { mask, state } => {
                self.endstop_enable = (self.endstop_enable & !mask) | (state & mask);
                false
            }
            Record::SetActiveToolhead { .. } => false,
        }
    }

    fn run_active(&mut self, now_us: u32) -> bool {
        match self.active.take() {
            Some(Active::Move(mut mv)) => {
                if mv.step_events_remaining == 0 {
                    return false;
                }
                let running = self.pump_move(&mut mv);
                if running {
                    self.active = Some(Active::Move(mv));
                }
                running
            }
            Some(Active::Delay { deadline_us }) => {
                let running = self.handle_delay(deadline_us, now_us);
                if running {
                    self.active = Some(Active::Delay { deadline_us });
                }
                running
            }
            None => false,
        }
    }

    fn handle_delay(&mut self, deadline_us: u32, now_us: u32) -> bool {
        let remaining = deadline_us.wrapping_sub(now_us) as i32;
        if remaining <= 0 {
            return false;
        }
        self.next_ocr = if remaining > (IDLE_INTERRUPT_RATE / 2) as i32 {
            IDLE_INTERRUPT_RATE
        } else {
            // µs to ticks, floor of 5 µs
            ((remaining * 2) as u16).max(10)
        };
        true
    }

    fn dump_queue(&mut self) {
        self.consumer.flush();
        self.final_rate = 0;
        self.shared.set_last_enqueued_final_speed(0);
        self.shared.set_checkpoint_last(false);
        self.shared.reset_queued();
        self.shared.clear_come_to_stop();
    }

    //
    // Linear-move execution
    //

    fn setup_new_move(&mut self, cmd: LinearMove) -> MoveState {
        let initial_rate = self.final_rate;
        self.final_rate = cmd.final_rate;

        self.shared
            .consume_queued(cmd.nominal_block_time as u32 * 100, cmd.total_steps as u32);

        let mv = MoveState {
            step_events_remaining: cmd.total_steps,
            step_events_next_phase: cmd.steps_phase_2,
            in_phase_1: true,
            in_phase_2: false,
            in_phase_3: false,
            acceleration_time: 0,
            initial_rate,
            nominal_rate: cmd.nominal_rate,
            nominal_rate_timer: 0,
            nominal_rate_step_loops: self.step_loops,
            nominal_block_time: cmd.nominal_block_time,
            stopped_axes: 0,
            cmd,
        };

        // Underrun is evaluated at the start of every block; it may also
        // clear mid-block once more commands arrive.
        self.underrun.condition = self.check_underrun_condition(&mv);
        if !self.underrun.active && !self.underrun.condition {
            self.step_rate = initial_rate;
            self.step_loops = step_loops_for(initial_rate);
        } else if !self.underrun.condition
            && (self.step_rate as i32 - initial_rate as i32).unsigned_abs()
                <= ALLOWED_SPEED_DIFF as u32
        {
            // close enough to the planned entry speed: leave underrun mode
            self.underrun.active = false;
            self.step_rate = initial_rate;
            self.step_loops = step_loops_for(initial_rate);
        } else {
            self.setup_underrun_mode(&mv);
        }

        trace!("new move");
        mv
    }

    fn update_directions_and_initial_counts(&mut self, mv: &mut MoveState) {
        let total = mv.cmd.total_steps;
        let directions = mv.cmd.directions;
        let enabled = self.shared.stepper_enable_bits();

        for (pos, am) in mv.cmd.axes.iter().enumerate() {
            let cfg = &self.axes[am.axis as usize];
            let axis_bit = 1u8 << am.axis;

            // moving axes that are disabled get enabled on the spot
            if am.step_count > 0 && enabled & axis_bit == 0 {
                cfg.enable.write(!cfg.enable_invert);
                self.shared.set_stepper_enabled(am.axis, true);
            }

            self.runtime[am.axis as usize].step_event_counter = -((total >> 1) as i32);

            let positive = directions & (1 << pos) != 0;
            let cached = self.current_directions & axis_bit != 0;
            if positive != cached {
                cfg.dir.write(positive != cfg.dir_invert);
                if positive {
                    self.current_directions |= axis_bit;
                } else {
                    self.current_directions &= !axis_bit;
                }
            }
        }
    }

    fn pump_move(&mut self, mv: &mut MoveState) -> bool {
        // degenerate all-zero-count move
        if mv.step_events_remaining == 0 {
            return false;
        }

        if !self.check_endstops(mv) {
            return false;
        }

        // Multiple step events per fire at high rates.
        for _ in 0..self.step_loops {
            (self.serial_poll)();
            self.write_steps(mv);
            mv.step_events_remaining -= 1;
            if mv.step_events_remaining == 0 {
                break;
            }
        }

        // Recalculate after the pulses so differences in recalculation
        // time never skew the spacing of the steps just emitted.
        self.recalculate_speed(mv);
        true
    }

    fn write_steps(&mut self, mv: &MoveState) {
        let total = mv.cmd.total_steps as i32;
        for am in mv.cmd.axes.iter() {
            let idx = am.axis as usize;
            let rt = &mut self.runtime[idx];
            rt.step_event_counter += am.step_count as i32;
            if rt.step_event_counter > 0 {
                let cfg = &self.axes[idx];
                // The counter update sits between the two edges and sets
                // the minimum pulse width the drivers need.
                if !cfg.step_invert {
                    cfg.step.set();
                    rt.step_event_counter -= total;
                    cfg.step.clear();
                } else {
                    cfg.step.clear();
                    rt.step_event_counter -= total;
                    cfg.step.set();
                }
                rt.position += if self.current_directions & (1 << am.axis) != 0 {
                    1
                } else {
                    -1
                };
            }
        }
    }

    /// Sample the endstops this move cares about. Returns false when the
    /// move is over (all homing axes stopped). A debounced hit outside
    /// homing promotes to a global stop.
    fn check_endstops(&mut self, mv: &mut MoveState) -> bool {
        let mut to_check = mv.cmd.endstops_of_interest & self.endstop_enable;
        let mut index: u8 = 0;
        let directions = mv.cmd.directions;
        let num_axes = mv.cmd.num_axes;

        while to_check != 0 {
            if to_check & 1 != 0 {
                let bit = 1u8 << index;
                let new_hit = match self.endstops.get(index as usize) {
                    Some(es) => es.input.read() == (self.endstop_trigger_level & bit != 0),
                    None => false,
                };
                // two consecutive samples = a debounced hit
                if new_hit && self.endstop_hit & bit != 0 {
                    if mv.cmd.homing {
                        // stop every axis bound to this endstop in its
                        // current direction; others keep going
                        for (pos, am) in mv.cmd.axes.iter_mut().enumerate() {
                            let cfg = &self.axes[am.axis as usize];
                            let positive = directions & (1 << pos) != 0;
                            let mask = if positive {
                                cfg.max_endstops
                            } else {
                                cfg.min_endstops
                            };
                            if mask & bit != 0 {
                                if am.step_count != 0 {
                                    mv.stopped_axes += 1;
                                }
                                am.step_count = 0;
                                self.runtime[am.axis as usize].step_event_counter = 0;
                                if mv.stopped_axes == num_axes {
                                    return false;
                                }
                            }
                        }
                    } else {
                        self.shared
                            .request_stop(StopCause::EndstopHit, StopType::OneTimeOrCleared);
                        self.final_rate = 0;
                    }
                }
                if new_hit {
                    self.endstop_hit |= bit;
                } else {
                    self.endstop_hit &= !bit;
                }
            }
            to_check >>= 1;
            index += 1;
        }
        true
    }

    fn recalculate_speed(&mut self, mv: &mut MoveState) {
        if self.underrun.active || self.shared.come_to_stop_requested() {
            self.handle_underrun_condition(mv);
            return;
        }

        // phase transitions fire on step-count crossings
        if mv.in_phase_1
            && mv.step_events_remaining <= mv.step_events_next_phase
            && mv.step_events_remaining > mv.cmd.steps_phase_3
        {
            mv.in_phase_1 = false;
            mv.in_phase_2 = true;
            mv.step_events_next_phase = mv.cmd.steps_phase_3;
            let (timer, loops) = rate_to_timer(mv.nominal_rate);
            mv.nominal_rate_timer = timer;
            mv.nominal_rate_step_loops = loops;
            self.step_loops = loops;
        } else if !mv.in_phase_3 && mv.step_events_remaining <= mv.step_events_next_phase {
            // also covers a block with no coast phase (1 -> 3 directly)
            mv.in_phase_1 = false;
            mv.in_phase_2 = false;
            mv.in_phase_3 = true;
            mv.acceleration_time = 0;
        }

        if mv.in_phase_1 {
            let rise = mul_u24x24_h16(mv.acceleration_time, mv.cmd.acceleration_rate);
            self.step_rate = mv.initial_rate.saturating_add(rise).min(mv.nominal_rate);
            let (timer, loops) = rate_to_timer(self.step_rate);
            self.step_loops = loops;
            self.next_ocr = timer;
            mv.acceleration_time += timer as u32;
        } else if mv.in_phase_3 {
            let drop = mul_u24x24_h16(mv.acceleration_time, mv.cmd.deceleration_rate);
            let rate = if drop > mv.nominal_rate {
                // decel overshot below zero
                self.final_rate
            } else {
                (mv.nominal_rate - drop).max(self.final_rate)
            };
            self.step_rate = rate;
            let (timer, loops) = rate_to_timer(rate);
            self.step_loops = loops;
            self.next_ocr = timer;
            mv.acceleration_time += timer as u32;
        } else {
            // phase 2: hold the nominal rate
            debug_assert!(mv.in_phase_2);
            self.next_ocr = mv.nominal_rate_timer;
            self.step_loops = mv.nominal_rate_step_loops;
        }
    }

    //
    // Underrun avoidance
    //

    fn check_underrun_condition(&self, mv: &MoveState) -> bool {
        if self.shared.come_to_stop_requested() {
            return true;
        }
        if self.shared.is_checkpoint_last() {
            // the host deliberately ended the motion segment here
            return false;
        }
        let queue_count = self.consumer.current_count();
        let queued_time = self
            .shared
            .queued_us_remaining()
            .saturating_add(mv.nominal_block_time as u32 * 100);
        (queue_count < self.watermarks.low_level && queued_time < self.watermarks.high_time_us)
            || queued_time < self.watermarks.low_time_us
    }

    fn setup_underrun_mode(&mut self, mv: &MoveState) {
        let primary = &mv.cmd.axes[mv.cmd.primary_axis_index as usize];
        let cfg = &self.axes[primary.axis as usize];
        let u = &mut self.underrun;

        u.accel_rate = mv
            .cmd
            .acceleration_rate
            .max(mv.cmd.deceleration_rate)
            .max(cfg.underrun_accel_rate);
        u.max_rate = cfg.underrun_max_rate;
        u.steps_to_final = mv.cmd.steps_to_final_speed_from_underrun_rate;
        let plateau = u.max_rate.min(mv.nominal_rate) as u32;
        u.steps_to_stop = ((plateau * plateau) / u.accel_rate.max(1).saturating_mul(2))
            .min(u16::MAX as u32) as u16;
        u.hop_steps = 0;
        u.accel_sign = 0;
        u.active = true;
    }

    /// Pick a target rate for this fire and shape the speed toward it.
    /// None of the branches involve heavy math; this path only runs when
    /// the machine is already being slowed down.
    fn handle_underrun_condition(&mut self, mv: &mut MoveState) {
        self.underrun.condition = self.check_underrun_condition(mv);

        let target_rate;
        let mut is_final_rate = false;

        if self.underrun.condition {
            if !self.underrun.active {
                self.setup_underrun_mode(mv);
            }
            let u = &self.underrun;
            let queued_steps = self.shared.queued_steps_remaining();

            if self.step_rate > u.max_rate {
                // high-speed entry: always decelerate to the plateau first
                target_rate = u.max_rate;
            } else if queued_steps < u.steps_to_stop as u32
                && mv.step_events_remaining as u32 + queued_steps <= u.steps_to_stop as u32
            {
                // nothing behind this block: come to a complete stop in time
                target_rate = 0;
                is_final_rate = true;
            } else if self.shared.come_to_stop_requested()
                && mv.step_events_remaining <= u.steps_to_stop
            {
                target_rate = 0;
                is_final_rate = true;
            } else if mv.step_events_remaining <= u.steps_to_final {
                target_rate = self.final_rate.min(u.max_rate);
                is_final_rate = true;
            } else {
                target_rate = u.max_rate;
            }
        } else {
            // condition cleared: resume normal movement
            let u = &self.underrun;
            if mv.step_events_remaining <= u.steps_to_final {
                target_rate = self.final_rate;
                is_final_rate = true;
            } else if mv.step_events_remaining <= mv.cmd.steps_phase_3 {
                target_rate = self.final_rate.max(u.max_rate);
            } else {
                target_rate = mv.nominal_rate;
                if self.step_rate == mv.nominal_rate {
                    // re-attained nominal speed
                    self.underrun.active = false;
                }
            }
        }

        self.accelerate_to_underrun_target(mv, target_rate, is_final_rate);
    }

    fn accelerate_to_underrun_target(
        &mut self,
        mv: &MoveState,
        target_rate: u16,
        is_final_rate: bool,
    ) {
        let u = &mut self.underrun;
        let mut is_final_rate = is_final_rate;

        if is_final_rate && u.hop_steps != 0 {
            if mv.step_events_remaining > u.hop_steps {
                // first half of the hop: accelerate
                if u.accel_sign != 1 {
                    u.accel_time = 0;
                    u.accel_start_rate = self.step_rate;
                    u.accel_sign = 1;
                }
            } else if mv.step_events_remaining <= self.step_loops as u16 {
                // last fire: land exactly on the exit speed
                u.accel_sign = 0;
                self.step_rate = self.final_rate;
            } else if u.accel_sign != -1 {
                // second half: decelerate
                u.accel_time = 0;
                u.accel_start_rate = self.step_rate;
                u.accel_sign = -1;
            }
        } else if self.step_rate > target_rate {
            if u.accel_sign == 1 {
                // crossed the target from below: snap onto the plateau
                u.accel_sign = 0;
                self.step_rate = target_rate;
                is_final_rate = false;
            } else if u.accel_sign != -1 {
                u.accel_time = 0;
                u.accel_start_rate = self.step_rate;
                u.accel_sign = -1;
            }
        } else if self.step_rate < target_rate {
            if u.accel_sign == -1 {
                // crossed the target from above
                u.accel_sign = 0;
                self.step_rate = target_rate;
            } else if u.accel_sign != 1 {
                u.accel_time = 0;
                u.accel_start_rate = self.step_rate;
                u.accel_sign = 1;
            }
        } else {
            u.accel_sign = 0;
        }

        if is_final_rate
            && u.accel_sign == 0
            && self.step_rate < u.max_rate
            && mv.step_events_remaining > (self.step_loops as u16) << 1
        {
            // Reached a very low exit speed too early in the block.
            // Re-accelerate for half the remaining steps and decelerate
            // for the other half, arriving at block end on speed.
            u.accel_sign = 1;
            u.accel_time = 0;
            u.accel_start_rate = self.step_rate;
            u.hop_steps = mv.step_events_remaining >> 1;
        }

        if u.accel_sign > 0 {
            self.step_rate = u
                .accel_start_rate
                .saturating_add(mul_u24x24_h16(u.accel_time, u.accel_rate));
        } else if u.accel_sign < 0 {
            self.step_rate = u
                .accel_start_rate
                .saturating_sub(mul_u24x24_h16(u.accel_time, u.accel_rate));
        }

        let (timer, loops) = rate_to_timer(self.step_rate);
        self.step_loops = loops;
        self.next_ocr = timer;
        u.accel_time += timer as u32;
    }

    //
    // Stepper enable outputs
    //

    fn write_stepper_enable(&mut self, axis: u8, enable: bool) {
        let Some(cfg) = self.axes.get(axis as usize) else {
            return;
        };
        if self.shared.stepper_enabled(axis) == enable {
            return;
        }
        cfg.enable.write(enable != cfg.enable_invert);
        self.shared.set_stepper_enabled(axis, enable);
    }
}
