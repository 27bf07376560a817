//! Queue command records: the tagged-union byte layout stored in the ring
//! buffer.
//!
//! The producer encodes a validated, ready-to-execute record directly into
//! a reserved ring slot; the movement ISR decodes the bytes back into an
//! owned value (fixed-capacity, no allocation) when the record starts.
//! All multi-byte fields are little-endian. Every record begins with a
//! one-byte type tag; tag 0 is reserved for the ring's skip marker and
//! never appears in a record.

use heapless::Vec;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::axis::MAX_AXES;
use crate::error::RecordDecodeError;
use crate::port::PortBit;

pub const MAX_OUTPUT_SWITCH_ENTRIES: usize = 8;

const PTR_BYTES: usize = core::mem::size_of::<usize>();

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
pub enum RecordType {
    LinearMove = 0x01,
    Delay = 0x02,
    SetOutputSwitch = 0x03,
    SetPwmOutput = 0x04,
    SetBuzzer = 0x05,
    SetHeaterTarget = 0x06,
    SetActiveToolhead = 0x07,
    SetStepperEnable = 0x08,
    SetEndstopEnable = 0x09,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
pub enum OutputState {
    Low = 0,
    High = 1,
    /// Pin released; the platform layer tristates it outside the ISR.
    Disabled = 2,
}

/// One output-switch write, with the port resolved at enqueue time so the
/// ISR touches no device tables.
#[derive(Clone, Copy, Debug)]
pub struct OutputBitState {
    pub device: u8,
    pub port: PortBit,
    pub state: OutputState,
}

/// Per-axis share of a linear move. `step_count` is mutated in place by the
/// homing endstop logic.
#[derive(Clone, Copy, Debug)]
pub struct AxisMove {
    pub axis: u8,
    pub step_count: u16,
}

/// A compiled linear move, as produced by the enqueue validator.
///
/// `directions` and `primary_axis_index` are indexed by position within
/// `axes`, not by axis number. Rates are steps/s on the Bresenham clock
/// (the longest axis); the acceleration rates are in the fixed-point form
/// consumed by the ISR's `rate += (accel * ticks) >> 24` update.
#[derive(Clone, Debug)]
pub struct LinearMove {
    pub num_axes: u8,
    pub directions: u16,
    pub homing: bool,
    pub endstops_of_interest: u8,
    pub primary_axis_index: u8,
    pub total_steps: u16,
    pub steps_phase_2: u16,
    pub steps_phase_3: u16,
    pub nominal_rate: u16,
    pub final_rate: u16,
    pub acceleration_rate: u32,
    pub deceleration_rate: u32,
    /// Nominal execution time in 100 µs units, saturated.
    pub nominal_block_time: u16,
    pub steps_to_final_speed_from_underrun_rate: u16,
    pub axes: Vec<AxisMove, MAX_AXES>,
}

#[derive(Clone, Debug)]
pub enum Record {
    LinearMove(LinearMove),
    Delay { us: u32 },
    SetOutputSwitch(Vec<OutputBitState, MAX_OUTPUT_SWITCH_ENTRIES>),
    SetPwmOutput { device: u8, value: u8 },
    SetBuzzer { device: u8, value: u8 },
    SetHeaterTarget { heater: u8, temp_tenths: i16 },
    SetStepperEnable { stepper: u8, enable: bool },
    SetEndstopEnable { mask: u8, state: u8 },
    SetActiveToolhead { toolhead: u8 },
}

/// Bytes of a linear-move record before the per-axis entries.
const LINEAR_MOVE_HEADER: usize = 27;
const AXIS_ENTRY: usize = 3;

impl Record {
    /// Encoded size including the type tag (the ring's length byte is not
    /// part of the record).
    pub fn encoded_len(&self) -> u8 {
        let len = match self {
            Record::LinearMove(m) => LINEAR_MOVE_HEADER + AXIS_ENTRY * m.axes.len(),
            Record::Delay { .. } => 5,
            Record::SetOutputSwitch(entries) => 2 + entries.len() * (3 + PTR_BYTES),
            Record::SetPwmOutput { .. } => 3,
            Record::SetBuzzer { .. } => 3,
            Record::SetHeaterTarget { .. } => 4,
            Record::SetStepperEnable { .. } => 3,
            Record::SetEndstopEnable { .. } => 3,
            Record::SetActiveToolhead { .. } => 2,
        };
        len as u8
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            Record::LinearMove(_) => RecordType::LinearMove,
            Record::Delay { .. } => RecordType::Delay,
            Record::SetOutputSwitch(_) => RecordType::SetOutputSwitch,
            Record::SetPwmOutput { .. } => RecordType::SetPwmOutput,
            Record::SetBuzzer { .. } => RecordType::SetBuzzer,
            Record::SetHeaterTarget { .. } => RecordType::SetHeaterTarget,
            Record::SetStepperEnable { .. } => RecordType::SetStepperEnable,
            Record::SetEndstopEnable { .. } => RecordType::SetEndstopEnable,
            Record::SetActiveToolhead { .. } => RecordType::SetActiveToolhead,
        }
    }

    /// Serialize into `buf`, which must be exactly `encoded_len` bytes (a
    /// ring reservation of that size).
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.encoded_len() as usize);
        let mut w = Writer { buf, at: 0 };
        w.u8(self.record_type() as u8);
        match self {
            Record::LinearMove(m) => {
                w.u8(m.num_axes);
                w.u16(m.directions);
                w.u8(m.homing as u8);
                w.u8(m.endstops_of_interest);
                w.u8(m.primary_axis_index);
                w.u16(m.total_steps);
                w.u16(m.steps_phase_2);
                w.u16(m.steps_phase_3);
                w.u16(m.nominal_rate);
                w.u16(m.final_rate);
                w.u24(m.acceleration_rate);
                w.u24(m.deceleration_rate);
                w.u16(m.nominal_block_time);
                w.u16(m.steps_to_final_speed_from_underrun_rate);
                for am in &m.axes {
                    w.u8(am.axis);
                    w.u16(am.step_count);
                }
            }
            Record::Delay { us } => w.u32(*us),
            Record::SetOutputSwitch(entries) => {
                w.u8(entries.len() as u8);
                for e in entries.iter() {
                    let (addr, mask) = e.port.to_raw();
                    w.u8(e.device);
                    w.usize(addr);
                    w.u8(mask);
                    w.u8(e.state as u8);
                }
            }
            Record::SetPwmOutput { device, value } | Record::SetBuzzer { device, value } => {
                w.u8(*device);
                w.u8(*value);
            }
            Record::SetHeaterTarget {
                heater,
                temp_tenths,
            } => {
                w.u8(*heater);
                w.u16(*temp_tenths as u16);
            }
            Record::SetStepperEnable { stepper, enable } => {
                w.u8(*stepper);
                w.u8(*enable as u8);
            }
            Record::SetEndstopEnable { mask, state } => {
                w.u8(*mask);
                w.u8(*state);
            }
            Record::SetActiveToolhead { toolhead } => w.u8(*toolhead),
        }
        debug_assert_eq!(w.at, w.buf.len());
    }

    /// Rebuild a record from ring bytes (tag first).
    pub fn decode(bytes: &[u8]) -> Result<Record, RecordDecodeError> {
        let mut r = Reader { buf: bytes, at: 0 };
        let tag = r.u8()?;
        let kind = RecordType::try_from(tag).map_err(|_| RecordDecodeError::UnknownTag(tag))?;
        let record = match kind {
            RecordType::LinearMove => {
                let num_axes = r.u8()?;
                let directions = r.u16()?;
                let homing = r.u8()? != 0;
                let endstops_of_interest = r.u8()?;
                let primary_axis_index = r.u8()?;
                let total_steps = r.u16()?;
                let steps_phase_2 = r.u16()?;
                let steps_phase_3 = r.u16()?;
                let nominal_rate = r.u16()?;
                let final_rate = r.u16()?;
                let acceleration_rate = r.u24()?;
                let deceleration_rate = r.u24()?;
                let nominal_block_time = r.u16()?;
                let steps_to_final = r.u16()?;
                let mut axes = Vec::new();
                for _ in 0..num_axes {
                    let axis = r.u8()?;
                    let step_count = r.u16()?;
                    axes.push(AxisMove { axis, step_count })
                        .map_err(|_| RecordDecodeError::Truncated)?;
                }
                Record::LinearMove(LinearMove {
                    num_axes,
                    directions,
                    homing,
                    endstops_of_interest,
                    primary_axis_index,
                    total_steps,
                    steps_phase_2,
                    steps_phase_3,
                    nominal_rate,
                    final_rate,
                    acceleration_rate,
                    deceleration_rate,
                    nominal_block_time,
                    steps_to_final_speed_from_underrun_rate: steps_to_final,
                    axes,
                })
            }
            RecordType::Delay => Record::Delay { us: r.u32()? },
            RecordType::SetOutputSwitch => {
                let n = r.u8()?;
                let mut entries = Vec::new();
                for _ in 0..n {
                    let device = r.u8()?;
                    let addr = r.usize()?;
                    let mask = r.u8()?;
                    let state = OutputState::try_from(r.u8()?)
                        .map_err(|_| RecordDecodeError::Truncated)?;
                    entries
                        .push(OutputBitState {
                            device,
                            port: PortBit::from_raw(addr, mask),
                            state,
                        })
                        .map_err(|_| RecordDecodeError::Truncated)?;
                }
                Record::SetOutputSwitch(entries)
            }
            RecordType::SetPwmOutput => Record::SetPwmOutput {
                device: r.u8()?,
                value: r.u8()?,
            },
            RecordType::SetBuzzer => Record::SetBuzzer {
                device: r.u8()?,
                value: r.u8()?,
            },
            RecordType::SetHeaterTarget => Record::SetHeaterTarget {
                heater: r.u8()?,
                temp_tenths: r.u16()? as i16,
            },
            RecordType::SetStepperEnable => Record::SetStepperEnable {
                stepper: r.u8()?,
                enable: r.u8()? != 0,
            },
            RecordType::SetEndstopEnable => Record::SetEndstopEnable {
                mask: r.u8()?,
                state: r.u8()?,
            },
            RecordType::SetActiveToolhead => Record::SetActiveToolhead { toolhead: r.u8()? },
        };
        Ok(record)
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.buf[self.at] = v;
        self.at += 1;
    }
    fn u16(&mut self, v: u16) {
        self.buf[self.at..self.at + 2].copy_from_slice(&v.to_le_bytes());
        self.at += 2;
    }
    fn u24(&mut self, v: u32) {
        let b = v.to_le_bytes();
        self.buf[self.at..self.at + 3].copy_from_slice(&b[..3]);
        self.at += 3;
    }
    fn u32(&mut self, v: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }
    fn usize(&mut self, v: usize) {
        self.buf[self.at..self.at + PTR_BYTES].copy_from_slice(&v.to_le_bytes());
        self.at += PTR_BYTES;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], RecordDecodeError> {
        if self.at + n > self.buf.len() {
            return Err(RecordDecodeError::Truncated);
        }
        let s = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(s)
    }
    fn u8(&mut self) -> Result<u8, RecordDecodeError> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, RecordDecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
    fn u24(&mut self) -> Result<u32, RecordDecodeError> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }
    fn u32(&mut self) -> Result<u32, RecordDecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn usize(&mut self) -> Result<usize, RecordDecodeError> {
        let b = self.take(PTR_BYTES)?;
        let mut raw = [0u8; PTR_BYTES];
        raw.copy_from_slice(b);
        Ok(usize::from_le_bytes(raw))
    }
}
