//! Shared device-command plumbing.
//!
//! Queue records executed in the movement ISR need to hand values to other
//! contexts: soft-PWM duty cycles to the thermal ISR, heater setpoints to
//! the main-loop control pass, buzzer values to the platform layer. Each of
//! those hand-offs is a small bank of atomics defined here.

use core::sync::atomic::{AtomicI16, AtomicU8, Ordering};

use crate::protocol::TEMPERATURE_INVALID;

pub const SOFT_PWM_MAX_DEVICES: usize = 8;
pub const MAX_HEATERS: usize = 4;
pub const MAX_BUZZERS: usize = 4;

/// Target duty cycles for one soft-PWM group (0..=128 internally; a raw
/// 0xFF request maps to 128, "always on").
pub struct SoftPwmShared {
    power: [AtomicU8; SOFT_PWM_MAX_DEVICES],
}

impl SoftPwmShared {
    pub const fn new() -> Self {
        const ZERO: AtomicU8 = AtomicU8::new(0);
        Self {
            power: [ZERO; SOFT_PWM_MAX_DEVICES],
        }
    }

    /// Set duty from a raw 8-bit request.
    pub fn set_power(&self, device: u8, raw: u8) {
        if (device as usize) < SOFT_PWM_MAX_DEVICES {
            let duty = if raw == 0xFF { 0x80 } else { raw / 2 };
            self.power[device as usize].store(duty, Ordering::Relaxed);
        }
    }

    /// Set an already-scaled duty (0..=128).
    pub fn set_duty(&self, device: u8, duty: u8) {
        if (device as usize) < SOFT_PWM_MAX_DEVICES {
            self.power[device as usize].store(duty.min(0x80), Ordering::Relaxed);
        }
    }

    pub fn duty(&self, device: u8) -> u8 {
        self.power
            .get(device as usize)
            .map(|p| p.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for SoftPwmShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Heater setpoints in tenths of a degree; `TEMPERATURE_INVALID` disables a
/// heater. Written by queued commands (movement ISR) and immediate orders;
/// read by the main-loop heater update.
pub struct HeaterTargets {
    targets: [AtomicI16; MAX_HEATERS],
}

impl HeaterTargets {
    pub const fn new() -> Self {
        const OFF: AtomicI16 = AtomicI16::new(TEMPERATURE_INVALID);
        Self {
            targets: [OFF; MAX_HEATERS],
        }
    }

    pub fn set(&self, heater: u8, tenths: i16) {
        if let Some(t) = self.targets.get(heater as usize) {
            t.store(tenths, Ordering::Relaxed);
        }
    }

    pub fn get(&self, heater: u8) -> i16 {
        self.targets
            .get(heater as usize)
            .map(|t| t.load(Ordering::Relaxed))
            .unwrap_or(TEMPERATURE_INVALID)
    }

    pub fn invalidate(&self, heater: u8) {
        self.set(heater, TEMPERATURE_INVALID);
    }
}

impl Default for HeaterTargets {
    fn default() -> Self {
        Self::new()
    }
}

/// Buzzer drive values, consumed by the platform layer.
pub struct BuzzerShared {
    value: [AtomicU8; MAX_BUZZERS],
}

impl BuzzerShared {
    pub const fn new() -> Self {
        const ZERO: AtomicU8 = AtomicU8::new(0);
        Self {
            value: [ZERO; MAX_BUZZERS],
        }
    }

    pub fn set(&self, device: u8, value: u8) {
        if let Some(v) = self.value.get(device as usize) {
            v.store(value, Ordering::Relaxed);
        }
    }

    pub fn get(&self, device: u8) -> u8 {
        self.value
            .get(device as usize)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for BuzzerShared {
    fn default() -> Self {
        Self::new()
    }
}
