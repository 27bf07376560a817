//! Shared test rig: a software machine with axes, endstops and devices
//! wired to an in-memory register file, driven tick by tick through the
//! public enqueue and ISR interfaces.

#![allow(dead_code)]

use darter::axis::{AxisConfig, EndstopConfig, UnderrunWatermarks};
use darter::config::{DeviceTables, OutputSwitchConfig};
use darter::devices::{BuzzerShared, HeaterTargets, SoftPwmShared};
use darter::enqueue::Enqueuer;
use darter::motion_isr::MovementIsr;
use darter::protocol::{
    QUEUE_BLOCK_DELAY, QUEUE_BLOCK_LINEAR_MOVE, QUEUE_BLOCK_MOVEMENT_CHECKPOINT,
    QUEUE_BLOCK_ORDER_WRAPPER,
};
use darter::queue::{self, QueueState};
use darter::state::SystemState;
use darter::thermal::{ControlMode, HeaterConfig};
use darter::PortBit;

pub fn leak<T>(v: T) -> &'static mut T {
    Box::leak(Box::new(v))
}

/// Register-file layout: axis `n` owns bytes `4n..4n+3`
/// (enable/dir/step), endstop `i` reads byte `32 + i`, output switch 0
/// drives byte 40.
pub const REG_AXIS_STRIDE: usize = 4;
pub const REG_ENDSTOP_BASE: usize = 32;
pub const REG_OUTPUT_SWITCH: usize = 40;

#[derive(Clone, Copy)]
pub struct AxisSpec {
    pub max_rate: u16,
    pub underrun_rate: u16,
    pub underrun_accel: u32,
    pub min_endstops: u8,
    pub max_endstops: u8,
}

impl Default for AxisSpec {
    fn default() -> Self {
        Self {
            max_rate: 10_000,
            underrun_rate: 500,
            underrun_accel: 10_000,
            min_endstops: 0,
            max_endstops: 0,
        }
    }
}

pub struct RigOptions {
    pub axes: Vec<AxisSpec>,
    /// Trigger level per endstop input.
    pub endstops: Vec<bool>,
    pub watermarks: UnderrunWatermarks,
    pub queue_size: usize,
}

impl RigOptions {
    pub fn single_axis(spec: AxisSpec) -> Self {
        Self {
            axes: vec![spec],
            endstops: vec![],
            watermarks: no_underrun(),
            queue_size: 512,
        }
    }
}

/// Watermarks that can never trip the underrun predicate.
pub fn no_underrun() -> UnderrunWatermarks {
    UnderrunWatermarks {
        low_level: 0,
        high_level: 0,
        low_time_us: 0,
        high_time_us: 0,
    }
}

pub struct Rig {
    pub shared: &'static SystemState,
    pub enq: Enqueuer<'static>,
    pub isr: MovementIsr<'static>,
    pub heater_targets: &'static HeaterTargets,
    pub pwm: &'static SoftPwmShared,
    pub heater_pwm: &'static SoftPwmShared,
    pub buzzers: &'static BuzzerShared,
    pub now_us: u32,
    regs: *mut u8,
}

impl Rig {
    pub fn new(opts: RigOptions) -> Self {
        let regs: &'static mut [u8; 64] = leak([0u8; 64]);
        let regs = regs.as_mut_ptr();

        let mut axes = Vec::new();
        for (n, spec) in opts.axes.iter().enumerate() {
            let base = n * REG_AXIS_STRIDE;
            axes.push(AxisConfig {
                enable: PortBit::new(unsafe { regs.add(base) }, 1),
                enable_invert: false,
                dir: PortBit::new(unsafe { regs.add(base + 1) }, 1),
                dir_invert: false,
                step: PortBit::new(unsafe { regs.add(base + 2) }, 1),
                step_invert: false,
                max_rate: spec.max_rate,
                underrun_max_rate: spec.underrun_rate,
                underrun_accel_rate: spec.underrun_accel,
                min_endstops: spec.min_endstops,
                max_endstops: spec.max_endstops,
            });
        }
        let axes: &'static [AxisConfig] = leak(axes).as_slice();

        let mut endstops = Vec::new();
        let mut trigger_level = 0u8;
        for (i, level) in opts.endstops.iter().enumerate() {
            endstops.push(EndstopConfig {
                input: PortBit::new(unsafe { regs.add(REG_ENDSTOP_BASE + i) }, 1),
            });
            if *level {
                trigger_level |= 1 << i;
            }
        }
        let num_endstops = endstops.len() as u8;
        let endstops: &'static [EndstopConfig] = leak(endstops).as_slice();

        let mut devices = DeviceTables::new();
        devices
            .output_switches
            .push(OutputSwitchConfig {
                port: PortBit::new(unsafe { regs.add(REG_OUTPUT_SWITCH) }, 1),
            })
            .ok();
        devices.num_pwm_outputs = 2;
        devices.num_buzzers = 1;
        let devices: &'static DeviceTables = leak(devices);

        let heaters: &'static [HeaterConfig] = leak(vec![HeaterConfig {
            output: PortBit::new(unsafe { regs.add(REG_OUTPUT_SWITCH + 1) }, 1),
            sensor: 0,
            max_temp: 275.0,
            power_on_level: 255,
            mode: ControlMode::BangBang { hysteresis: 2.0 },
        }])
        .as_slice();

        let shared: &'static SystemState = leak(SystemState::new());
        let watermarks: &'static UnderrunWatermarks = leak(opts.watermarks);
        let queue_state: &'static QueueState = leak(QueueState::new());
        let storage: &'static mut [u8] = leak(vec![0u8; opts.queue_size]).as_mut_slice();
        let (producer, consumer) = queue::split(queue_state, storage);

        let heater_targets: &'static HeaterTargets = leak(HeaterTargets::new());
        let pwm: &'static SoftPwmShared = leak(SoftPwmShared::new());
        let heater_pwm: &'static SoftPwmShared = leak(SoftPwmShared::new());
        let buzzers: &'static BuzzerShared = leak(BuzzerShared::new());

        let enq = Enqueuer::new(producer, axes, devices, heaters, num_endstops, shared);
        let isr = MovementIsr::new(
            consumer,
            axes,
            endstops,
            trigger_level,
            watermarks,
            shared,
            pwm,
            buzzers,
            heater_targets,
        );

        Self {
            shared,
            enq,
            isr,
            heater_targets,
            pwm,
            heater_pwm,
            buzzers,
            now_us: 0,
            regs,
        }
    }

    pub fn reg(&self, idx: usize) -> u8 {
        unsafe { self.regs.add(idx).read_volatile() }
    }

    pub fn set_reg(&self, idx: usize, value: u8) {
        unsafe { self.regs.add(idx).write_volatile(value) }
    }

    pub fn set_endstop_input(&self, endstop: usize, level: bool) {
        self.set_reg(REG_ENDSTOP_BASE + endstop, if level { 1 } else { 0 });
    }

    /// One ISR fire; advances simulated time by the returned interval.
    pub fn tick(&mut self) -> u16 {
        let ocr = self.isr.tick(self.now_us);
        self.now_us = self.now_us.wrapping_add((ocr as u32 + 1) / 2);
        ocr
    }

    /// Drive until the ISR is idle. The observer runs after every fire.
    pub fn run_to_idle(&mut self, max_fires: u32, mut observe: impl FnMut(&MovementIsr, u32)) {
        for _ in 0..max_fires {
            self.tick();
            observe(&self.isr, self.now_us);
            if self.isr.is_idle() {
                return;
            }
        }
        panic!("movement ISR did not go idle within {max_fires} fires");
    }
}

//
// Wire payload builders (ORDER_QUEUE_COMMAND_BLOCKS sub-blocks)
//

pub struct MoveSpec {
    pub axes_mask: u8,
    /// Direction bits indexed by axis number; bit set = positive.
    pub directions: u8,
    pub primary_axis: u8,
    pub homing: bool,
    pub nominal_frac: u8,
    pub final_frac: u8,
    pub accel_count: u16,
    pub decel_count: u16,
    pub counts: Vec<u16>,
}

/// Short axis mask, long (16-bit) step counts.
pub fn linear_move_block(spec: &MoveSpec) -> Vec<u8> {
    assert!(spec.directions < 0x80);
    let mut body = vec![
        spec.axes_mask,
        spec.directions | 0x80, // bit 7: long step counts
        spec.primary_axis | if spec.homing { 0x10 } else { 0 },
        spec.nominal_frac,
        spec.final_frac,
    ];
    body.extend_from_slice(&spec.accel_count.to_be_bytes());
    body.extend_from_slice(&spec.decel_count.to_be_bytes());
    for c in &spec.counts {
        body.extend_from_slice(&c.to_be_bytes());
    }
    let mut block = vec![(body.len() + 1) as u8, QUEUE_BLOCK_LINEAR_MOVE];
    block.extend(body);
    block
}

pub fn checkpoint_block() -> Vec<u8> {
    vec![1, QUEUE_BLOCK_MOVEMENT_CHECKPOINT]
}

/// Delay in 10 µs wire units.
pub fn delay_block(units: u16) -> Vec<u8> {
    let b = units.to_be_bytes();
    vec![3, QUEUE_BLOCK_DELAY, b[0], b[1]]
}

pub fn wrapped_order_block(order: u8, body: &[u8]) -> Vec<u8> {
    let mut block = vec![(body.len() + 2) as u8, QUEUE_BLOCK_ORDER_WRAPPER, order];
    block.extend_from_slice(body);
    block
}
