//! Producer-side command handling: the payload walker for
//! `ORDER_QUEUE_COMMAND_BLOCKS`, the linear-move validator/compiler, and
//! the wrapped simple orders.
//!
//! Every sub-block is validated against the frozen device tables before
//! anything is written to the ring; a failed block reports its index and a
//! reason and leaves no state behind. A validated linear move is compiled
//! into a ready-to-execute record: phase boundaries, acceleration rates
//! and underrun distances are all precomputed here so the ISR only ever
//! does table lookups and fixed-point multiplies.

use heapless::Vec;

use crate::axis::AxisConfig;
use crate::config::DeviceTables;
use crate::error::{AppError, BlockError, EnqueueError, QueueErrorType};
use crate::protocol::{
    DeviceType, QueueInfo, ORDER_ENABLE_DISABLE_ENDSTOPS, ORDER_ENABLE_DISABLE_STEPPERS,
    ORDER_SET_HEATER_TARGET_TEMP, ORDER_SET_OUTPUT_SWITCH_STATE, ORDER_SET_OUTPUT_TONE,
    ORDER_SET_PWM_OUTPUT_STATE, QUEUE_BLOCK_DELAY, QUEUE_BLOCK_LINEAR_MOVE,
    QUEUE_BLOCK_MOVEMENT_CHECKPOINT, QUEUE_BLOCK_ORDER_WRAPPER, TEMPERATURE_INVALID,
};
use crate::queue::QueueProducer;
use crate::records::{
    AxisMove, LinearMove, OutputBitState, OutputState, Record, MAX_OUTPUT_SWITCH_ENTRIES,
};
use crate::state::SystemState;
use crate::thermal::{validate_heater_target, HeaterConfig};

const MAX_ACCEL_RATE: u32 = 0x00FF_FFFF; // u24 record field

pub struct Enqueuer<'a> {
    producer: QueueProducer<'a>,
    axes: &'a [AxisConfig],
    devices: &'a DeviceTables,
    heaters: &'a [HeaterConfig],
    num_input_switches: u8,
    shared: &'a SystemState,
}

impl<'a> Enqueuer<'a> {
    pub fn new(
        producer: QueueProducer<'a>,
        axes: &'a [AxisConfig],
        devices: &'a DeviceTables,
        heaters: &'a [HeaterConfig],
        num_input_switches: u8,
        shared: &'a SystemState,
    ) -> Self {
        Self {
            producer,
            axes,
            devices,
            heaters,
            num_input_switches,
            shared,
        }
    }

    pub fn queue_info(&self) -> QueueInfo {
        self.producer.info()
    }

    /// `ORDER_CLEAR_COMMAND_QUEUE`: decelerate to a crawl, then drain.
    pub fn clear_queue(&mut self) {
        self.shared.request_come_to_stop_and_flush();
    }

    /// Walk and enqueue an `ORDER_QUEUE_COMMAND_BLOCKS` payload: a
    /// concatenation of `[length, type, body...]` sub-blocks, each
    /// validated independently. Stops at the first failing block.
    pub fn enqueue_command_blocks(&mut self, payload: &[u8]) -> Result<QueueInfo, EnqueueError> {
        let mut rest = payload;
        let mut index: u8 = 0;

        while !rest.is_empty() {
            let length = rest[0] as usize;
            if length < 1 || rest.len() < 1 + length {
                return Err(self.fail(BlockError::malformed("insufficient bytes"), index));
            }
            let block = &rest[1..1 + length];
            let kind = block[0];

            let result = match kind {
                QUEUE_BLOCK_LINEAR_MOVE => self.enqueue_linear_move(&block[1..]),
                QUEUE_BLOCK_MOVEMENT_CHECKPOINT => {
                    // marks the end of motion as deliberate; enqueues
                    // nothing and always succeeds
                    self.shared.set_checkpoint_last(true);
                    Ok(())
                }
                QUEUE_BLOCK_DELAY => self.enqueue_delay(&block[1..]),
                QUEUE_BLOCK_ORDER_WRAPPER => {
                    if length < 2 {
                        return Err(self.fail(BlockError::malformed("insufficient bytes"), index));
                    }
                    let order = block[1];
                    let body = &block[2..];
                    match order {
                        ORDER_SET_OUTPUT_SWITCH_STATE => self.enqueue_set_output_switch(body),
                        ORDER_SET_PWM_OUTPUT_STATE => self.enqueue_set_pwm_output(body),
                        ORDER_SET_OUTPUT_TONE => self.enqueue_set_buzzer(body),
                        ORDER_SET_HEATER_TARGET_TEMP => self.enqueue_set_heater_target(body),
                        ORDER_ENABLE_DISABLE_STEPPERS => self.enqueue_set_stepper_enable(body),
                        ORDER_ENABLE_DISABLE_ENDSTOPS => self.enqueue_set_endstop_enable(body),
                        _ => Err(BlockError::in_block(
                            AppError::UnknownOrder,
                            "order not permitted in queue",
                        )),
                    }
                }
                _ => {
                    return Err(EnqueueError {
                        error_type: QueueErrorType::UnknownBlock,
                        block_index: index,
                        code: AppError::UnknownOrder,
                        reason: "unknown command block",
                        info: self.producer.info(),
                    })
                }
            };

            if let Err(e) = result {
                return Err(self.fail(e, index));
            }
            rest = &rest[1 + length..];
            index += 1;
        }

        Ok(self.producer.info())
    }

    fn fail(&self, e: BlockError, index: u8) -> EnqueueError {
        debug!("enqueue block failed");
        EnqueueError {
            error_type: e.kind,
            block_index: index,
            code: e.code,
            reason: e.reason,
            info: self.producer.info(),
        }
    }

    fn push_record(&mut self, record: &Record) -> Result<(), BlockError> {
        let len = record.encoded_len();
        let Some(slot) = self.producer.reserve(len) else {
            return Err(BlockError::full());
        };
        record.encode(slot);
        if !self.producer.commit() {
            // a consumer flush raced this enqueue
            return Err(BlockError::in_block(
                AppError::Failed,
                "queue flushed during enqueue",
            ));
        }
        Ok(())
    }

    //
    // Linear move
    //

    fn enqueue_linear_move(&mut self, body: &[u8]) -> Result<(), BlockError> {
        let parsed = self.validate_linear_move(body)?;
        self.compile_linear_move(&parsed)
    }

    /// Parse and validate a linear-move body without mutating anything.
    fn validate_linear_move<'b>(&self, body: &'b [u8]) -> Result<ParsedMove<'b>, BlockError> {
        let mut expected: usize = 7; // minimum short-form header

        if body.len() < 2 {
            return Err(BlockError::malformed("insufficient bytes"));
        }

        let long_axis_mask = body[0] & 0x80 != 0;
        let (axes_selected, directions, long_counts, mut at) = if long_axis_mask {
            expected += 2;
            if body.len() < 4 {
                return Err(BlockError::malformed("insufficient bytes"));
            }
            let axes = ((body[0] as u16 & 0x7F) << 8) | body[1] as u16;
            let dirs = ((body[2] as u16 & 0x7F) << 8) | body[3] as u16;
            (axes, dirs, body[2] & 0x80 != 0, 4usize)
        } else {
            let axes = body[0] as u16;
            let dirs = (body[1] & 0x7F) as u16;
            (axes, dirs, body[1] & 0x80 != 0, 2usize)
        };
        if long_counts {
            expected += 2;
        }
        if body.len() < expected {
            return Err(BlockError::malformed("insufficient bytes"));
        }

        let primary_axis = body[at] & 0x0F;
        let homing = body[at] & 0x10 != 0;
        let nominal_frac = body[at + 1];
        let final_frac = body[at + 2];
        at += 3;

        let (accel_count, decel_count) = if long_counts {
            let a = ((body[at] as u16) << 8) | body[at + 1] as u16;
            let d = ((body[at + 2] as u16) << 8) | body[at + 3] as u16;
            at += 4;
            (a, d)
        } else {
            let a = body[at] as u16;
            let d = body[at + 1] as u16;
            at += 2;
            (a, d)
        };

        // Walk the axis mask: every selected axis must exist, and the
        // primary must carry rate and underrun configuration.
        let mut num_axes: u8 = 0;
        let mut primary_index: i8 = -1;
        let mut tmp = axes_selected;
        let mut axis_number: u8 = 0;
        while tmp != 0 {
            if tmp & 1 != 0 {
                let Some(cfg) = self.axes.get(axis_number as usize) else {
                    return Err(BlockError::in_block(
                        AppError::InvalidDeviceNumber,
                        "invalid axis included",
                    ));
                };
                if axis_number == primary_axis {
                    if cfg.max_rate == 0 {
                        return Err(BlockError::in_block(
                            AppError::InvalidDeviceNumber,
                            "maximum movement rate not configured for primary axis",
                        ));
                    }
                    if !cfg.has_underrun_params() {
                        return Err(BlockError::in_block(
                            AppError::InvalidDeviceNumber,
                            "underrun avoidance parameters not configured for primary axis",
                        ));
                    }
                    primary_index = num_axes as i8;
                }
                num_axes += 1;
            }
            tmp >>= 1;
            axis_number += 1;
        }

        if num_axes == 0 {
            return Err(BlockError::in_block(
                AppError::BadParameterValue,
                "no axis selected",
            ));
        }
        if primary_index < 0 {
            return Err(BlockError::in_block(
                AppError::BadParameterValue,
                "invalid primary axis specified",
            ));
        }
        if nominal_frac < final_frac {
            return Err(BlockError::in_block(
                AppError::BadParameterValue,
                "nominal < final speed",
            ));
        }
        if nominal_frac == 0 {
            return Err(BlockError::in_block(
                AppError::BadParameterValue,
                "nominal speed is zero",
            ));
        }

        let max_rate = self.axes[primary_axis as usize].max_rate as u32;
        let nominal_rate = (max_rate * nominal_frac as u32 / 255) as u16;
        if nominal_rate < self.shared.last_enqueued_final_speed() {
            return Err(BlockError::in_block(
                AppError::BadParameterValue,
                "nominal < initial speed",
            ));
        }

        expected += if long_counts {
            2 * num_axes as usize
        } else {
            num_axes as usize
        };
        if body.len() < expected {
            return Err(BlockError::malformed("insufficient bytes"));
        }
        let counts = &body[at..];

        let primary_steps = read_count(counts, primary_index as usize, long_counts);
        if accel_count > primary_steps {
            return Err(BlockError::in_block(
                AppError::BadParameterValue,
                "invalid acceleration count",
            ));
        }
        if decel_count > primary_steps {
            return Err(BlockError::in_block(
                AppError::BadParameterValue,
                "invalid deceleration count",
            ));
        }
        if accel_count as u32 + decel_count as u32 > primary_steps as u32 {
            return Err(BlockError::in_block(
                AppError::BadParameterValue,
                "overlapped acceleration counts",
            ));
        }

        Ok(ParsedMove {
            axes_selected,
            directions,
            long_counts,
            primary_axis,
            primary_index: primary_index as u8,
            homing,
            nominal_frac,
            final_frac,
            accel_count,
            decel_count,
            counts,
        })
    }

    /// Build the ready-to-execute record and publish it.
    fn compile_linear_move(&mut self, p: &ParsedMove) -> Result<(), BlockError> {
        let mut axes: Vec<AxisMove, { crate::axis::MAX_AXES }> = Vec::new();
        let mut directions_out: u16 = 0;
        let mut endstops_of_interest: u8 = 0;
        let mut max_steps: u16 = 0;
        let mut primary_steps: u16 = 0;

        let mut tmp = p.axes_selected;
        let mut axis_number: u8 = 0;
        let mut index: usize = 0;
        while tmp != 0 {
            if tmp & 1 != 0 {
                let step_count = read_count(p.counts, index, p.long_counts);
                let cfg = &self.axes[axis_number as usize];
                if step_count > max_steps {
                    max_steps = step_count;
                }
                if axis_number == p.primary_axis {
                    primary_steps = step_count;
                }
                // direction bits are re-indexed by record position; the
                // endstop set follows the direction of travel
                if p.directions & (1 << axis_number) != 0 {
                    directions_out |= 1 << index;
                    endstops_of_interest |= cfg.max_endstops;
                } else {
                    endstops_of_interest |= cfg.min_endstops;
                }
                axes.push(AxisMove {
                    axis: axis_number,
                    step_count,
                })
                .map_err(|_| BlockError::in_block(AppError::Failed, "too many axes"))?;
                index += 1;
            }
            tmp >>= 1;
            axis_number += 1;
        }

        let primary_cfg = &self.axes[p.primary_axis as usize];
        let nominal_rate = (primary_cfg.max_rate as u32 * p.nominal_frac as u32 / 255) as u16;
        let final_rate = (primary_cfg.max_rate as u32 * p.final_frac as u32 / 255) as u16;
        let initial_rate = self.shared.last_enqueued_final_speed();

        // Phase boundaries live on the Bresenham clock (the longest axis);
        // accel/decel counts arrive on the primary axis and are scaled up
        // when another axis dominates.
        let (steps_phase_2, steps_phase_3) = if max_steps == primary_steps {
            (primary_steps - p.accel_count, p.decel_count)
        } else {
            let scale = |count: u16| -> u16 {
                if primary_steps == 0 {
                    0
                } else {
                    (max_steps as u32 * count as u32 / primary_steps as u32) as u16
                }
            };
            (max_steps - scale(p.accel_count), scale(p.decel_count))
        };

        // a = (v² − u²) / (2·d)
        let acceleration_rate = if steps_phase_2 != max_steps {
            let d = (max_steps - steps_phase_2) as u32;
            (((nominal_rate as u32 * nominal_rate as u32)
                - (initial_rate as u32 * initial_rate as u32))
                / d
                / 2)
            .min(MAX_ACCEL_RATE)
        } else {
            0
        };
        let deceleration_rate = if steps_phase_3 != 0 {
            (((nominal_rate as u32 * nominal_rate as u32) - (final_rate as u32 * final_rate as u32))
                / steps_phase_3 as u32
                / 2)
            .min(MAX_ACCEL_RATE)
        } else {
            0
        };

        // t = (v − u)/a per ramp plus d/v for the coast, in 100 µs units
        let mut block_time: u32 = 0;
        if acceleration_rate != 0 {
            block_time += (nominal_rate - initial_rate) as u32 * 10_000 / acceleration_rate;
        }
        if steps_phase_2 != steps_phase_3 {
            block_time += steps_phase_2.saturating_sub(steps_phase_3) as u32 * 10_000
                / nominal_rate.max(1) as u32;
        }
        if deceleration_rate != 0 {
            block_time += (nominal_rate - final_rate) as u32 * 10_000 / deceleration_rate;
        }
        let nominal_block_time = block_time.min(u16::MAX as u32) as u16;

        // d = (v² − u²) / (2·a): how far the ISR needs to reach the exit
        // speed from the underrun plateau
        let underrun_rate = nominal_rate.min(primary_cfg.underrun_max_rate) as u32;
        let steps_to_final = if underrun_rate > final_rate as u32 {
            (((underrun_rate * underrun_rate) - (final_rate as u32 * final_rate as u32))
                / primary_cfg.underrun_accel_rate.max(1).saturating_mul(2))
            .min(u16::MAX as u32) as u16
        } else {
            0
        };

        let record = Record::LinearMove(LinearMove {
            num_axes: axes.len() as u8,
            directions: directions_out,
            homing: p.homing,
            endstops_of_interest,
            primary_axis_index: p.primary_index,
            total_steps: max_steps,
            steps_phase_2,
            steps_phase_3,
            nominal_rate,
            final_rate,
            acceleration_rate,
            deceleration_rate,
            nominal_block_time,
            steps_to_final_speed_from_underrun_rate: steps_to_final,
            axes,
        });
        self.push_record(&record)?;

        self.shared.set_last_enqueued_final_speed(final_rate);
        self.shared.set_checkpoint_last(false);
        self.shared
            .add_queued(nominal_block_time as u32 * 100, max_steps as u32);
        Ok(())
    }

    //
    // Simple queued commands
    //

    fn enqueue_delay(&mut self, body: &[u8]) -> Result<(), BlockError> {
        if body.len() != 2 {
            return Err(BlockError::in_block(
                AppError::BadParameterFormat,
                "insufficient bytes",
            ));
        }
        // wire value is in 10 µs units
        let us = (((body[0] as u32) << 8) | body[1] as u32) * 10;
        self.push_record(&Record::Delay { us })
    }

    fn enqueue_set_output_switch(&mut self, body: &[u8]) -> Result<(), BlockError> {
        if body.is_empty() || body.len() % 3 != 0 {
            return Err(BlockError::in_block(
                AppError::BadParameterFormat,
                "insufficient bytes",
            ));
        }
        let mut entries: Vec<OutputBitState, MAX_OUTPUT_SWITCH_ENTRIES> = Vec::new();
        for chunk in body.chunks_exact(3) {
            let device_type = chunk[0];
            let device = chunk[1];
            let state = chunk[2];
            if device_type != DeviceType::SwitchOutput as u8 {
                return Err(BlockError::in_block(
                    AppError::InvalidDeviceType,
                    "not an output switch",
                ));
            }
            if !self.devices.output_switch_in_use(device) {
                return Err(BlockError::in_block(
                    AppError::InvalidDeviceNumber,
                    "output switch not in use",
                ));
            }
            let state = OutputState::try_from(state).map_err(|_| {
                BlockError::in_block(AppError::BadParameterValue, "bad switch state")
            })?;
            entries
                .push(OutputBitState {
                    device,
                    port: self.devices.output_switches[device as usize].port,
                    state,
                })
                .map_err(|_| BlockError::in_block(AppError::Failed, "too many switches"))?;
        }
        self.push_record(&Record::SetOutputSwitch(entries))
    }

    fn enqueue_set_pwm_output(&mut self, body: &[u8]) -> Result<(), BlockError> {
        if body.len() < 4 {
            return Err(BlockError::in_block(
                AppError::BadParameterFormat,
                "insufficient bytes",
            ));
        }
        if body[0] != DeviceType::PwmOutput as u8 {
            return Err(BlockError::in_block(
                AppError::InvalidDeviceType,
                "not a PWM output",
            ));
        }
        let device = body[1];
        if !self.devices.pwm_output_in_use(device) {
            return Err(BlockError::in_block(
                AppError::InvalidDeviceNumber,
                "PWM output not in use",
            ));
        }
        // 16-bit value on the wire; the low byte is ignored
        self.push_record(&Record::SetPwmOutput {
            device,
            value: body[2],
        })
    }

    fn enqueue_set_buzzer(&mut self, body: &[u8]) -> Result<(), BlockError> {
        if body.len() < 4 {
            return Err(BlockError::in_block(
                AppError::BadParameterFormat,
                "insufficient bytes",
            ));
        }
        if body[0] != DeviceType::Buzzer as u8 {
            return Err(BlockError::in_block(
                AppError::InvalidDeviceType,
                "not a buzzer",
            ));
        }
        let device = body[1];
        if !self.devices.buzzer_in_use(device) {
            return Err(BlockError::in_block(
                AppError::InvalidDeviceNumber,
                "buzzer not in use",
            ));
        }
        self.push_record(&Record::SetBuzzer {
            device,
            value: body[2],
        })
    }

    fn enqueue_set_heater_target(&mut self, body: &[u8]) -> Result<(), BlockError> {
        if body.len() < 3 {
            return Err(BlockError::in_block(
                AppError::BadParameterFormat,
                "insufficient bytes",
            ));
        }
        let heater = body[0];
        let temp_tenths = (((body[1] as u16) << 8) | body[2] as u16) as i16;
        validate_heater_target(self.heaters, heater, temp_tenths)?;
        if self.shared.is_stopped() && temp_tenths != TEMPERATURE_INVALID {
            return Err(BlockError::in_block(
                AppError::CannotActivateDevice,
                "cannot activate device when stopped",
            ));
        }
        self.push_record(&Record::SetHeaterTarget {
            heater,
            temp_tenths,
        })
    }

    fn enqueue_set_stepper_enable(&mut self, body: &[u8]) -> Result<(), BlockError> {
        match body.len() {
            // empty body disables all steppers
            0 => self.push_record(&Record::SetStepperEnable {
                stepper: 0xFF,
                enable: false,
            }),
            2 => {
                let stepper = body[0];
                let enable = body[1] != 0;
                if stepper as usize >= self.axes.len() {
                    return Err(BlockError::in_block(
                        AppError::InvalidDeviceNumber,
                        "stepper not in use",
                    ));
                }
                if self.shared.is_stopped() && enable {
                    return Err(BlockError::in_block(
                        AppError::CannotActivateDevice,
                        "cannot activate device when stopped",
                    ));
                }
                self.push_record(&Record::SetStepperEnable { stepper, enable })
            }
            _ => Err(BlockError::in_block(
                AppError::BadParameterFormat,
                "insufficient bytes",
            )),
        }
    }

    fn enqueue_set_endstop_enable(&mut self, body: &[u8]) -> Result<(), BlockError> {
        if body.len() % 2 != 0 {
            return Err(BlockError::in_block(
                AppError::BadParameterFormat,
                "insufficient bytes",
            ));
        }
        let mut mask: u8 = 0;
        let mut state: u8 = 0;
        for pair in body.chunks_exact(2) {
            let device = pair[0];
            if device >= self.num_input_switches || device >= 8 {
                return Err(BlockError::in_block(
                    AppError::InvalidDeviceNumber,
                    "input switch not in use",
                ));
            }
            mask |= 1 << device;
            if pair[1] != 0 {
                state |= 1 << device;
            }
        }
        self.push_record(&Record::SetEndstopEnable { mask, state })
    }
}

struct ParsedMove<'b> {
    axes_selected: u16,
    directions: u16,
    long_counts: bool,
    primary_axis: u8,
    primary_index: u8,
    homing: bool,
    nominal_frac: u8,
    final_frac: u8,
    accel_count: u16,
    decel_count: u16,
    counts: &'b [u8],
}

fn read_count(counts: &[u8], index: usize, long: bool) -> u16 {
    if long {
        ((counts[2 * index] as u16) << 8) | counts[2 * index + 1] as u16
    } else {
        counts[index] as u16
    }
}
