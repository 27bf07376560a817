//! Configuration tables for the motion side of the core.
//!
//! The external configuration component resolves named keys and calls the
//! typed setters here; the tables are then frozen before the first enqueue.
//! After the freeze every table is immutable and shared freely between the
//! main loop and the ISRs without locking; any late setter call fails with
//! `ConfigError::Frozen`.

use heapless::Vec;

use crate::axis::{AxisConfig, EndstopConfig, UnderrunWatermarks, MAX_AXES, MAX_ENDSTOPS};
use crate::error::ConfigError;
use crate::port::PortBit;

pub const MAX_OUTPUT_SWITCHES: usize = 8;

/// Output-switch pin table, plus in-use counts for the device classes the
/// enqueue validator has to check but the core does not otherwise drive.
pub struct DeviceTables {
    pub output_switches: Vec<OutputSwitchConfig, MAX_OUTPUT_SWITCHES>,
    pub num_pwm_outputs: u8,
    pub num_buzzers: u8,
}

#[derive(Clone, Copy)]
pub struct OutputSwitchConfig {
    pub port: PortBit,
}

impl DeviceTables {
    pub const fn new() -> Self {
        Self {
            output_switches: Vec::new(),
            num_pwm_outputs: 0,
            num_buzzers: 0,
        }
    }

    pub fn output_switch_in_use(&self, device: u8) -> bool {
        (device as usize) < self.output_switches.len()
    }

    pub fn pwm_output_in_use(&self, device: u8) -> bool {
        device < self.num_pwm_outputs
    }

    pub fn buzzer_in_use(&self, device: u8) -> bool {
        device < self.num_buzzers
    }
}

impl Default for DeviceTables {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CoreConfig {
    axes: Vec<AxisConfig, MAX_AXES>,
    endstops: Vec<EndstopConfig, MAX_ENDSTOPS>,
    endstop_trigger_level: u8,
    watermarks: UnderrunWatermarks,
    devices: DeviceTables,
    frozen: bool,
}

impl CoreConfig {
    pub const fn new() -> Self {
        Self {
            axes: Vec::new(),
            endstops: Vec::new(),
            endstop_trigger_level: 0,
            watermarks: UnderrunWatermarks {
                low_level: 4,
                high_level: 16,
                low_time_us: 100_000,
                high_time_us: 500_000,
            },
            devices: DeviceTables::new(),
            frozen: false,
        }
    }

    fn writable(&self) -> Result<(), ConfigError> {
        if self.frozen {
            Err(ConfigError::Frozen)
        } else {
            Ok(())
        }
    }

    /// Register an axis; returns its number.
    pub fn add_axis(&mut self, axis: AxisConfig) -> Result<u8, ConfigError> {
        self.writable()?;
        let number = self.axes.len() as u8;
        self.axes.push(axis).map_err(|_| ConfigError::TooMany)?;
        Ok(number)
    }

    pub fn set_axis_max_rate(&mut self, axis: u8, rate: u16) -> Result<(), ConfigError> {
        self.writable()?;
        self.axis_mut(axis)?.max_rate = rate;
        Ok(())
    }

    pub fn set_underrun_params(
        &mut self,
        axis: u8,
        max_rate: u16,
        accel_rate: u32,
    ) -> Result<(), ConfigError> {
        self.writable()?;
        if max_rate == 0 || accel_rate == 0 {
            return Err(ConfigError::OutOfRange);
        }
        let a = self.axis_mut(axis)?;
        a.underrun_max_rate = max_rate;
        a.underrun_accel_rate = accel_rate;
        Ok(())
    }

    /// Register an endstop input switch; returns its number.
    pub fn add_endstop(&mut self, input: PortBit, trigger_level: bool) -> Result<u8, ConfigError> {
        self.writable()?;
        let number = self.endstops.len() as u8;
        self.endstops
            .push(EndstopConfig { input })
            .map_err(|_| ConfigError::TooMany)?;
        if trigger_level {
            self.endstop_trigger_level |= 1 << number;
        }
        Ok(number)
    }

    /// Bind `endstop` to stop `axis` when it moves in the negative
    /// direction.
    pub fn set_min_endstop(&mut self, axis: u8, endstop: u8) -> Result<(), ConfigError> {
        self.writable()?;
        if endstop as usize >= self.endstops.len() {
            return Err(ConfigError::InvalidDevice);
        }
        self.axis_mut(axis)?.min_endstops |= 1 << endstop;
        Ok(())
    }

    /// Bind `endstop` to stop `axis` when it moves in the positive
    /// direction.
    pub fn set_max_endstop(&mut self, axis: u8, endstop: u8) -> Result<(), ConfigError> {
        self.writable()?;
        if endstop as usize >= self.endstops.len() {
            return Err(ConfigError::InvalidDevice);
        }
        self.axis_mut(axis)?.max_endstops |= 1 << endstop;
        Ok(())
    }

    pub fn set_underrun_queue_low_level(&mut self, blocks: u16) -> Result<(), ConfigError> {
        self.writable()?;
        self.watermarks.low_level = blocks;
        Ok(())
    }

    pub fn set_underrun_queue_high_level(&mut self, blocks: u16) -> Result<(), ConfigError> {
        self.writable()?;
        self.watermarks.high_level = blocks;
        Ok(())
    }

    pub fn set_underrun_queue_low_time_ms(&mut self, ms: u16) -> Result<(), ConfigError> {
        self.writable()?;
        self.watermarks.low_time_us = ms as u32 * 1_000;
        Ok(())
    }

    pub fn set_underrun_queue_high_time_ms(&mut self, ms: u16) -> Result<(), ConfigError> {
        self.writable()?;
        self.watermarks.high_time_us = ms as u32 * 1_000;
        Ok(())
    }

    pub fn add_output_switch(&mut self, port: PortBit) -> Result<u8, ConfigError> {
        self.writable()?;
        let number = self.devices.output_switches.len() as u8;
        self.devices
            .output_switches
            .push(OutputSwitchConfig { port })
            .map_err(|_| ConfigError::TooMany)?;
        Ok(number)
    }

    pub fn set_num_pwm_outputs(&mut self, n: u8) -> Result<(), ConfigError> {
        self.writable()?;
        self.devices.num_pwm_outputs = n;
        Ok(())
    }

    pub fn set_num_buzzers(&mut self, n: u8) -> Result<(), ConfigError> {
        self.writable()?;
        self.devices.num_buzzers = n;
        Ok(())
    }

    /// End of configuration: tables become immutable.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn axis_mut(&mut self, axis: u8) -> Result<&mut AxisConfig, ConfigError> {
        self.axes
            .get_mut(axis as usize)
            .ok_or(ConfigError::InvalidDevice)
    }

    //
    // Read side (used after the freeze)
    //

    pub fn axes(&self) -> &[AxisConfig] {
        &self.axes
    }

    pub fn endstops(&self) -> &[EndstopConfig] {
        &self.endstops
    }

    pub fn endstop_trigger_level(&self) -> u8 {
        self.endstop_trigger_level
    }

    pub fn watermarks(&self) -> &UnderrunWatermarks {
        &self.watermarks
    }

    pub fn devices(&self) -> &DeviceTables {
        &self.devices
    }

    pub fn num_input_switches(&self) -> u8 {
        self.endstops.len() as u8
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_axis() -> AxisConfig {
        let port = PortBit::new(Box::leak(Box::new(0u8)), 1);
        AxisConfig {
            enable: port,
            enable_invert: false,
            dir: port,
            dir_invert: false,
            step: port,
            step_invert: false,
            max_rate: 0,
            underrun_max_rate: 0,
            underrun_accel_rate: 0,
            min_endstops: 0,
            max_endstops: 0,
        }
    }

    #[test]
    fn frozen_tables_reject_mutation() {
        let mut cfg = CoreConfig::new();
        let n = cfg.add_axis(dummy_axis()).unwrap();
        cfg.set_axis_max_rate(n, 10_000).unwrap();
        cfg.freeze();
        assert_eq!(cfg.set_axis_max_rate(n, 5_000), Err(ConfigError::Frozen));
        assert_eq!(cfg.add_axis(dummy_axis()), Err(ConfigError::Frozen));
        assert_eq!(cfg.axes()[0].max_rate, 10_000);
    }

    #[test]
    fn underrun_params_must_be_nonzero() {
        let mut cfg = CoreConfig::new();
        let n = cfg.add_axis(dummy_axis()).unwrap();
        assert_eq!(
            cfg.set_underrun_params(n, 0, 10_000),
            Err(ConfigError::OutOfRange)
        );
        cfg.set_underrun_params(n, 500, 10_000).unwrap();
        assert!(cfg.axes()[0].has_underrun_params());
    }

    #[test]
    fn endstop_bindings() {
        let mut cfg = CoreConfig::new();
        let a = cfg.add_axis(dummy_axis()).unwrap();
        let es = cfg
            .add_endstop(PortBit::new(Box::leak(Box::new(0u8)), 2), true)
            .unwrap();
        cfg.set_min_endstop(a, es).unwrap();
        assert_eq!(cfg.axes()[0].min_endstops, 1 << es);
        assert_eq!(cfg.endstop_trigger_level() & (1 << es), 1 << es);
        assert_eq!(cfg.set_min_endstop(a, 7), Err(ConfigError::InvalidDevice));
    }
}
