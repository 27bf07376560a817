//! The second timer ISR: soft PWM multiplexing and oversampled ADC
//! temperature acquisition.
//!
//! Fires at ~1 kHz, interleaved with the platform's millisecond tick so
//! the two never collide. Soft PWM runs two device groups (heaters and
//! generic PWM outputs) from a single 7-bit phase counter: at phase zero
//! each device latches its target duty and asserts its output; the output
//! is cleared when the phase count passes the latched duty. Duty targets
//! arrive through `SoftPwmShared` from the heater loop and from queued
//! commands.
//!
//! Temperature sampling drives one ADC conversion pipeline across all
//! sensors. With four or fewer sensors, setup and read alternate on
//! even/odd ticks; with five or more, each tick reads the previous
//! sensor and starts the next. A full sweep of all sensors is accumulated
//! `OVERSAMPLENR` times and then published to the main loop.

use crate::devices::{SoftPwmShared, SOFT_PWM_MAX_DEVICES};
use crate::port::PortBit;
use crate::thermal::{SensorConfig, ThermalShared, MAX_SENSORS, OVERSAMPLENR};

/// Start-conversion / read-result access to the platform ADC.
pub trait AdcSampler {
    /// Select `channel` and begin a conversion.
    fn start(&mut self, channel: u8);
    /// Fetch the completed conversion result (10-bit).
    fn read(&mut self) -> u16;
}

/// One soft-PWM device group.
pub struct SoftPwmGroup<'a> {
    shared: &'a SoftPwmShared,
    outputs: [Option<PortBit>; SOFT_PWM_MAX_DEVICES],
    device_mask: u8,
    counts: [u8; SOFT_PWM_MAX_DEVICES],
    isr_count: u8,
    /// Each increment of this doubles the PWM frequency and halves the
    /// resolution; at zero there are 128 control positions.
    scale: u8,
}

impl<'a> SoftPwmGroup<'a> {
    pub fn new(shared: &'a SoftPwmShared, scale: u8) -> Self {
        Self {
            shared,
            outputs: [None; SOFT_PWM_MAX_DEVICES],
            device_mask: 0,
            counts: [0; SOFT_PWM_MAX_DEVICES],
            isr_count: 0,
            scale,
        }
    }

    /// Put `device`'s output pin under soft-PWM control.
    pub fn attach(&mut self, device: u8, output: PortBit) {
        if (device as usize) < SOFT_PWM_MAX_DEVICES {
            self.outputs[device as usize] = Some(output);
            self.device_mask |= 1 << device;
        }
    }

    pub fn detach(&mut self, device: u8) {
        if (device as usize) < SOFT_PWM_MAX_DEVICES {
            self.outputs[device as usize] = None;
            self.device_mask &= !(1 << device);
        }
    }

    fn tick(&mut self) {
        let mut mask = self.device_mask;
        if mask == 0 {
            return;
        }
        let mut i = 0usize;
        while mask != 0 {
            if mask & 1 != 0 {
                if let Some(out) = self.outputs[i] {
                    if self.isr_count == 0 {
                        // phase start: latch the duty and assert
                        let duty = self.shared.duty(i as u8);
                        self.counts[i] = duty;
                        if duty > 0 {
                            out.set();
                        }
                    } else if self.counts[i] <= self.isr_count {
                        out.clear();
                    }
                }
            }
            mask >>= 1;
            i += 1;
        }
        self.isr_count = self.isr_count.wrapping_add(1 << self.scale) & 0x7F;
    }
}

pub struct ThermalIsr<'a, A: AdcSampler> {
    adc: A,
    sensors: &'a [SensorConfig],
    shared: &'a ThermalShared,
    heaters: SoftPwmGroup<'a>,
    pwm_outputs: SoftPwmGroup<'a>,
    accum: [u16; MAX_SENSORS],
    sweep_count: u8,
    sensor_index: u8,
}

impl<'a, A: AdcSampler> ThermalIsr<'a, A> {
    pub fn new(
        adc: A,
        sensors: &'a [SensorConfig],
        shared: &'a ThermalShared,
        heaters: SoftPwmGroup<'a>,
        pwm_outputs: SoftPwmGroup<'a>,
    ) -> Self {
        Self {
            adc,
            sensors,
            shared,
            heaters,
            pwm_outputs,
            accum: [0; MAX_SENSORS],
            sweep_count: 0,
            sensor_index: 0,
        }
    }

    /// The ISR body: one soft-PWM phase step plus one slot of the ADC
    /// schedule.
    pub fn tick(&mut self) {
        self.heaters.tick();
        self.pwm_outputs.tick();
        self.update_sensor_raw_values();
    }

    fn update_sensor_raw_values(&mut self) {
        let num = self.sensors.len() as u8;
        if num == 0 {
            return;
        }

        if num <= 4 {
            // prepare and read on alternate cycles; 8 slots per sweep
            let sensor = self.sensor_index / 2;
            if sensor < num {
                if self.sensor_index & 1 == 0 {
                    self.adc.start(self.sensors[sensor as usize].channel);
                } else {
                    self.accum[sensor as usize] += self.adc.read();
                }
            }
            self.sensor_index += 1;
            if self.sensor_index >= 8 {
                self.sweep_count += 1;
                self.sensor_index = 0;
            }
        } else {
            // pipelined: read the previous sensor, start the next.
            // slot 0 reads the last sensor only when the schedule has no
            // idle slots (8 or more sensors).
            if num >= 8 || (self.sensor_index > 0 && self.sensor_index <= num) {
                let sensor = if self.sensor_index > 0 {
                    self.sensor_index - 1
                } else {
                    num - 1
                };
                self.accum[sensor as usize] += self.adc.read();
            }
            if self.sensor_index < num {
                self.adc.start(self.sensors[self.sensor_index as usize].channel);
            }
            self.sensor_index += 1;
            if self.sensor_index >= num.max(8) {
                self.sweep_count += 1;
                self.sensor_index = 0;
            }
        }

        if self.sweep_count as u16 >= OVERSAMPLENR {
            // publish unless the main loop is still holding the previous
            // batch; either way restart accumulation
            self.shared.publish(&self.accum[..self.sensors.len()]);
            for a in &mut self.accum {
                *a = 0;
            }
            self.sweep_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thermal::SensorKind;

    /// ADC double that returns a fixed value per channel and records the
    /// start/read pairing.
    struct FakeAdc {
        value: [u16; 16],
        started: Option<u8>,
        unmatched_reads: u32,
    }

    impl FakeAdc {
        fn new() -> Self {
            Self {
                value: [0; 16],
                started: None,
                unmatched_reads: 0,
            }
        }
    }

    impl AdcSampler for FakeAdc {
        fn start(&mut self, channel: u8) {
            self.started = Some(channel);
        }
        fn read(&mut self) -> u16 {
            match self.started.take() {
                Some(ch) => self.value[ch as usize],
                None => {
                    self.unmatched_reads += 1;
                    0
                }
            }
        }
    }

    fn sensor(channel: u8) -> SensorConfig {
        SensorConfig {
            channel,
            kind: SensorKind::Thermistor100k,
        }
    }

    #[test]
    fn soft_pwm_duty_cycle() {
        let mut reg = 0u8;
        let out = PortBit::new(&mut reg, 0x01);
        let shared = SoftPwmShared::new();
        let mut group = SoftPwmGroup::new(&shared, 0);
        group.attach(0, out);
        shared.set_power(0, 100); // duty 50/128

        let mut high_ticks = 0;
        for _ in 0..128 {
            group.tick();
            if out.read() {
                high_ticks += 1;
            }
        }
        assert_eq!(high_ticks, 50);

        // always-on request never clears the pin
        shared.set_power(0, 0xFF);
        let mut high_ticks = 0;
        for _ in 0..128 {
            group.tick();
            if out.read() {
                high_ticks += 1;
            }
        }
        assert_eq!(high_ticks, 128);

        // zero duty: the pin drops on the next phase tick and stays low
        shared.set_power(0, 0);
        let mut high_ticks = 0;
        for _ in 0..128 {
            group.tick();
            if out.read() {
                high_ticks += 1;
            }
        }
        assert!(high_ticks <= 1, "high for {high_ticks} ticks");
        assert!(!out.read());
    }

    #[test]
    fn pwm_groups_are_independent() {
        let mut reg = 0u8;
        let heater_pin = PortBit::new(&mut reg, 0x01);
        let fan_pin = PortBit::new(&mut reg, 0x02);
        let heater_shared = SoftPwmShared::new();
        let fan_shared = SoftPwmShared::new();
        let mut heaters = SoftPwmGroup::new(&heater_shared, 0);
        let mut fans = SoftPwmGroup::new(&fan_shared, 0);
        heaters.attach(0, heater_pin);
        fans.attach(0, fan_pin);
        heater_shared.set_power(0, 0xFF);
        fan_shared.set_power(0, 0);

        for _ in 0..128 {
            heaters.tick();
            fans.tick();
        }
        assert!(heater_pin.read());
        assert!(!fan_pin.read());
    }

    #[test]
    fn few_sensors_oversample_and_publish() {
        let sensors = [sensor(3), sensor(5)];
        let shared = ThermalShared::new();
        let heater_shared = SoftPwmShared::new();
        let pwm_shared = SoftPwmShared::new();
        let mut adc = FakeAdc::new();
        adc.value[3] = 500;
        adc.value[5] = 700;
        let mut isr = ThermalIsr::new(
            adc,
            &sensors,
            &shared,
            SoftPwmGroup::new(&heater_shared, 0),
            SoftPwmGroup::new(&pwm_shared, 0),
        );

        // one sweep is 8 ticks; a batch is OVERSAMPLENR sweeps
        for _ in 0..(8 * OVERSAMPLENR) {
            isr.tick();
        }
        assert!(shared.batch_ready());
        assert_eq!(shared.raw(0), 500 * OVERSAMPLENR);
        assert_eq!(shared.raw(1), 700 * OVERSAMPLENR);
        assert_eq!(isr.adc.unmatched_reads, 0);
    }

    #[test]
    fn many_sensors_pipeline_reads() {
        let sensors = [
            sensor(0),
            sensor(1),
            sensor(2),
            sensor(3),
            sensor(4),
            sensor(5),
        ];
        let shared = ThermalShared::new();
        let heater_shared = SoftPwmShared::new();
        let pwm_shared = SoftPwmShared::new();
        let mut adc = FakeAdc::new();
        for (ch, v) in adc.value.iter_mut().enumerate() {
            *v = 100 + ch as u16;
        }
        let mut isr = ThermalIsr::new(
            adc,
            &sensors,
            &shared,
            SoftPwmGroup::new(&heater_shared, 0),
            SoftPwmGroup::new(&pwm_shared, 0),
        );

        // sweep length is max(6, 8) = 8 ticks
        for _ in 0..(8 * OVERSAMPLENR) {
            isr.tick();
        }
        assert!(shared.batch_ready());
        for i in 0..6u16 {
            assert_eq!(shared.raw(i as usize), (100 + i) * OVERSAMPLENR);
        }
    }

    #[test]
    fn unconsumed_batch_is_not_overwritten() {
        let sensors = [sensor(0)];
        let shared = ThermalShared::new();
        let heater_shared = SoftPwmShared::new();
        let pwm_shared = SoftPwmShared::new();
        let mut adc = FakeAdc::new();
        adc.value[0] = 100;
        let mut isr = ThermalIsr::new(
            adc,
            &sensors,
            &shared,
            SoftPwmGroup::new(&heater_shared, 0),
            SoftPwmGroup::new(&pwm_shared, 0),
        );

        for _ in 0..(8 * OVERSAMPLENR) {
            isr.tick();
        }
        assert_eq!(shared.raw(0), 100 * OVERSAMPLENR);

        // second batch with a different reading, first never consumed
        isr.adc.value[0] = 900;
        for _ in 0..(8 * OVERSAMPLENR) {
            isr.tick();
        }
        assert_eq!(shared.raw(0), 100 * OVERSAMPLENR);
    }
}
