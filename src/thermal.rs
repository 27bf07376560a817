//! Temperature sensing and heater control (main-loop side).
//!
//! The sampler ISR (see `thermal_isr`) accumulates oversampled ADC readings
//! and publishes a batch through [`ThermalShared`]. The main loop converts
//! the batch to temperatures via per-sensor lookup tables and runs one
//! control pass per heater: bang-bang with hysteresis, or PID with a
//! filtered derivative term. A reading that is invalid or above the
//! heater's limit forces the heater off and surfaces a [`ThermalFault`];
//! the caller promotes that to a global stop.

use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use num_traits::Float;

use crate::devices::{HeaterTargets, SoftPwmShared, MAX_HEATERS};
use crate::error::{AppError, BlockError};
use crate::protocol::TEMPERATURE_INVALID;

pub const MAX_SENSORS: usize = 8;

/// ADC sweeps accumulated per published reading.
pub const OVERSAMPLENR: u16 = 16;

/// Raw-batch hand-off between the sampler ISR and the main loop.
///
/// The ISR only writes `raw` while `ready` is clear; the main loop
/// snapshots and converts while it is set, then clears it inside a
/// critical section.
pub struct ThermalShared {
    ready: AtomicBool,
    raw: [AtomicU16; MAX_SENSORS],
}

impl ThermalShared {
    pub const fn new() -> Self {
        const ZERO: AtomicU16 = AtomicU16::new(0);
        Self {
            ready: AtomicBool::new(false),
            raw: [ZERO; MAX_SENSORS],
        }
    }

    pub fn batch_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// ISR side: publish a completed oversampling batch, unless the main
    /// loop has not consumed the previous one yet.
    pub fn publish(&self, accum: &[u16]) -> bool {
        let consumed = !self.ready.load(Ordering::Relaxed);
        if consumed {
            for (slot, &v) in self.raw.iter().zip(accum) {
                slot.store(v, Ordering::Relaxed);
            }
        }
        self.ready.store(true, Ordering::Release);
        consumed
    }

    pub fn raw(&self, sensor: usize) -> u16 {
        self.raw
            .get(sensor)
            .map(|r| r.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn consume(&self) {
        critical_section::with(|_| self.ready.store(false, Ordering::Release));
    }
}

impl Default for ThermalShared {
    fn default() -> Self {
        Self::new()
    }
}

//
// Sensor conversion
//

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SensorKind {
    /// 100 kΩ NTC (β≈4092) with a 4.7 kΩ pullup.
    Thermistor100k,
    /// 10 kΩ NTC (β≈3950) with a 4.7 kΩ pullup.
    Thermistor10k,
}

#[derive(Clone, Copy)]
pub struct SensorConfig {
    /// ADC channel the sensor is wired to.
    pub channel: u8,
    pub kind: SensorKind,
}

/// (oversampled raw reading, temperature in tenths of °C), raw ascending.
type TempTable = &'static [(u16, i16)];

static THERMISTOR_100K: TempTable = &[
    (464, 3000),
    (597, 2800),
    (776, 2600),
    (1034, 2400),
    (1396, 2200),
    (1907, 2000),
    (2660, 1800),
    (3718, 1600),
    (5198, 1400),
    (7121, 1200),
    (9390, 1000),
    (11697, 800),
    (13653, 600),
    (15006, 400),
    (15630, 250),
    (16004, 100),
    (16153, 0),
];

static THERMISTOR_10K: TempTable = &[
    (116, 2500),
    (254, 2000),
    (665, 1500),
    (1301, 1200),
    (2117, 1000),
    (3478, 800),
    (5660, 600),
    (8675, 400),
    (11134, 250),
    (13281, 100),
    (14364, 0),
];

impl SensorKind {
    fn table(self) -> TempTable {
        match self {
            SensorKind::Thermistor100k => THERMISTOR_100K,
            SensorKind::Thermistor10k => THERMISTOR_10K,
        }
    }
}

/// Convert an oversampled raw reading to tenths of a degree, linearly
/// interpolated between table rows. Readings outside the table are
/// reported invalid (open or shorted sensor).
pub fn convert_raw(kind: SensorKind, raw: u16) -> i16 {
    let table = kind.table();
    let first = table[0];
    let last = table[table.len() - 1];
    if raw < first.0 || raw > last.0 {
        return TEMPERATURE_INVALID;
    }
    for pair in table.windows(2) {
        let (r0, t0) = pair[0];
        let (r1, t1) = pair[1];
        if raw <= r1 {
            let num = (raw - r0) as i32 * (t1 - t0) as i32;
            return (t0 as i32 + num / (r1 - r0) as i32) as i16;
        }
    }
    TEMPERATURE_INVALID
}

/// Main-loop view of the sensor array.
pub struct SensorBank<'a> {
    sensors: &'a [SensorConfig],
    shared: &'a ThermalShared,
    current_tenths: [i16; MAX_SENSORS],
}

impl<'a> SensorBank<'a> {
    pub fn new(sensors: &'a [SensorConfig], shared: &'a ThermalShared) -> Self {
        Self {
            sensors,
            shared,
            current_tenths: [TEMPERATURE_INVALID; MAX_SENSORS],
        }
    }

    /// Convert a published batch, if any. Returns true when fresh readings
    /// were taken.
    pub fn update(&mut self) -> bool {
        if !self.shared.batch_ready() {
            return false;
        }
        for (i, s) in self.sensors.iter().enumerate() {
            self.current_tenths[i] = convert_raw(s.kind, self.shared.raw(i));
        }
        self.shared.consume();
        true
    }

    pub fn temperature_tenths(&self, sensor: u8) -> i16 {
        self.current_tenths
            .get(sensor as usize)
            .copied()
            .unwrap_or(TEMPERATURE_INVALID)
    }

    pub fn num_sensors(&self) -> u8 {
        self.sensors.len() as u8
    }
}

//
// Heater control
//

#[derive(Clone, Copy)]
pub struct PidParams {
    pub kp: f32,
    /// Pre-scaled by the sampling period (Ki · dt).
    pub ki: f32,
    /// Pre-scaled by the sampling period (Kd / dt).
    pub kd: f32,
    /// Derivative low-pass coefficient (0..1); dTerm keeps `k1` of its
    /// previous value each pass.
    pub k1: f32,
    /// Outside `target ± functional_range` the output saturates and the
    /// integrator resets.
    pub functional_range: f32,
    /// Output ceiling (raw power units).
    pub max_power: u8,
}

impl PidParams {
    /// Build from unscaled gains and the sampling period.
    pub fn from_gains(kp: f32, ki: f32, kd: f32, dt: f32) -> Self {
        Self {
            kp,
            ki: ki * dt,
            kd: kd / dt,
            k1: 0.95,
            functional_range: 10.0,
            max_power: 255,
        }
    }

    pub fn gains_configured(&self) -> bool {
        self.kp != 0.0 && self.ki != 0.0 && self.kd != 0.0
    }
}

#[derive(Clone, Copy)]
pub enum ControlMode {
    BangBang { hysteresis: f32 },
    Pid(PidParams),
}

#[derive(Clone, Copy)]
pub struct HeaterConfig {
    pub output: crate::port::PortBit,
    /// Index into the sensor table.
    pub sensor: u8,
    /// Above this reading (°C) the heater faults.
    pub max_temp: f32,
    /// Drive level used for bang-bang "on" and PID range saturation.
    pub power_on_level: u8,
    pub mode: ControlMode,
}

/// Sampling period of the temperature pipeline in seconds: one sweep is
/// `max(n, 8)` sampler ticks at ~1 kHz, oversampled `OVERSAMPLENR` times.
pub fn pid_dt(num_sensors: u8) -> f32 {
    let sweep_ms = (num_sensors.max(8) as u32) * OVERSAMPLENR as u32;
    sweep_ms as f32 / 1000.0
}

/// Check a requested heater setpoint (tenths) against the configuration,
/// without changing anything. Used by the enqueue validator before a
/// `SetHeaterTarget` record is accepted.
pub fn validate_heater_target(
    heaters: &[HeaterConfig],
    heater: u8,
    temp_tenths: i16,
) -> Result<(), BlockError> {
    let Some(cfg) = heaters.get(heater as usize) else {
        return Err(BlockError::in_block(
            AppError::InvalidDeviceNumber,
            "heater not in use",
        ));
    };
    if temp_tenths == TEMPERATURE_INVALID {
        // switching a heater off is always legal
        return Ok(());
    }
    if cfg.max_temp <= 0.0 {
        return Err(BlockError::in_block(
            AppError::Failed,
            "heater max temperature not configured",
        ));
    }
    if let ControlMode::Pid(p) = cfg.mode {
        if !p.gains_configured() {
            return Err(BlockError::in_block(
                AppError::Failed,
                "PID gains not configured",
            ));
        }
    }
    let temp = temp_tenths as f32 / 10.0;
    if temp < 0.0 || temp > cfg.max_temp {
        return Err(BlockError::in_block(
            AppError::BadParameterValue,
            "target outside heater range",
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThermalFaultKind {
    InvalidReading,
    OverTemperature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThermalFault {
    pub heater: u8,
    pub kind: ThermalFaultKind,
}

#[derive(Clone, Copy, Default)]
struct PidState {
    i_state: f32,
    d_term: f32,
    last_temp: f32,
    /// Integrator clamp, `max_power / Ki`.
    i_state_max: f32,
    /// Cached `Kd · (1 − K1)`.
    kd_k2: f32,
}

#[derive(Clone, Copy, Default)]
struct HeaterState {
    is_heating: bool,
    pid: PidState,
}

pub struct HeaterBank<'a> {
    heaters: &'a [HeaterConfig],
    targets: &'a HeaterTargets,
    pwm: &'a SoftPwmShared,
    state: [HeaterState; MAX_HEATERS],
}

impl<'a> HeaterBank<'a> {
    pub fn new(
        heaters: &'a [HeaterConfig],
        targets: &'a HeaterTargets,
        pwm: &'a SoftPwmShared,
    ) -> Self {
        let mut state = [HeaterState::default(); MAX_HEATERS];
        for (i, h) in heaters.iter().enumerate() {
            if let ControlMode::Pid(p) = h.mode {
                state[i].pid.i_state_max = if p.ki != 0.0 {
                    p.max_power as f32 / p.ki
                } else {
                    0.0
                };
                state[i].pid.kd_k2 = p.kd * (1.0 - p.k1);
            }
        }
        Self {
            heaters,
            targets,
            pwm,
            state,
        }
    }

    /// One control pass over every heater with a valid target. Returns the
    /// first fault encountered, after forcing the offending heater off.
    pub fn update(&mut self, sensors: &SensorBank) -> Option<ThermalFault> {
        let mut fault = None;
        let heaters = self.heaters;
        for (i, cfg) in heaters.iter().enumerate() {
            let target_tenths = self.targets.get(i as u8);
            if target_tenths == TEMPERATURE_INVALID {
                continue;
            }
            let target = target_tenths as f32 / 10.0;

            let reading = sensors.temperature_tenths(cfg.sensor);
            if reading == TEMPERATURE_INVALID || reading as f32 / 10.0 > cfg.max_temp {
                let kind = if reading == TEMPERATURE_INVALID {
                    ThermalFaultKind::InvalidReading
                } else {
                    ThermalFaultKind::OverTemperature
                };
                error!("heater fault");
                self.targets.invalidate(i as u8);
                self.set_power(i, 0);
                if fault.is_none() {
                    fault = Some(ThermalFault {
                        heater: i as u8,
                        kind,
                    });
                }
                continue;
            }
            let current = reading as f32 / 10.0;

            match cfg.mode {
                ControlMode::BangBang { hysteresis } => {
                    if self.state[i].is_heating {
                        if current > target + hysteresis {
                            self.set_power(i, 0);
                        }
                    } else if current < target - hysteresis {
                        self.set_power(i, cfg.power_on_level);
                    }
                }
                ControlMode::Pid(p) => {
                    let power = self.pid_pass(i, &p, cfg.power_on_level, target, current);
                    self.set_power(i, power);
                }
            }
        }
        fault
    }

    fn pid_pass(
        &mut self,
        heater: usize,
        p: &PidParams,
        power_on_level: u8,
        target: f32,
        current: f32,
    ) -> u8 {
        let pid = &mut self.state[heater].pid;
        let error = target - current;

        let power = if Float::abs(error) > p.functional_range {
            pid.i_state = 0.0;
            if error > 0.0 {
                power_on_level
            } else {
                0
            }
        } else {
            pid.i_state = (pid.i_state + error).clamp(0.0, pid.i_state_max);
            pid.d_term = (current - pid.last_temp) * pid.kd_k2 + p.k1 * pid.d_term;

            let output = p.kp * error + p.ki * pid.i_state - pid.d_term;
            if output >= p.max_power as f32 {
                p.max_power
            } else if output <= 0.0 {
                0
            } else {
                output as u8
            }
        };
        pid.last_temp = current;
        power
    }

    fn set_power(&mut self, heater: usize, power: u8) {
        self.state[heater].is_heating = power > 0;
        self.pwm.set_power(heater as u8, power);
    }

    pub fn is_heating(&self, heater: u8) -> bool {
        self.state
            .get(heater as usize)
            .map(|s| s.is_heating)
            .unwrap_or(false)
    }
}
