//! Pacemaker wire-protocol constants.
//!
//! Framing (sync/CRC/sequence) and order dispatch live outside the core;
//! these are the values both sides of that boundary share: order codes, the
//! queue sub-block grammar, device classes, and the response triple the
//! host uses for queue flow control.

use num_enum::{IntoPrimitive, TryFromPrimitive};

//
// Packet framing
//

pub const SYNC_BYTE_ORDER: u8 = 0x23;
pub const SYNC_BYTE_RESPONSE: u8 = 0x42;

pub const CONTROL_BYTE_SEQUENCE_MASK: u8 = 0x0F;
pub const CONTROL_BYTE_ORDER_HOST_RESET_BIT: u8 = 0x10;
pub const CONTROL_BYTE_RESPONSE_EVENT_BIT: u8 = 0x10;
pub const CONTROL_BYTE_RESPONSE_DEBUG_BIT: u8 = 0x80;

pub const MAX_ORDER_PAYLOAD: usize = 265;

//
// Order codes (the subset the core is driven by)
//

pub const ORDER_RESUME: u8 = 0x00;
pub const ORDER_SET_HEATER_TARGET_TEMP: u8 = 0x06;
pub const ORDER_SET_OUTPUT_SWITCH_STATE: u8 = 0x08;
pub const ORDER_SET_PWM_OUTPUT_STATE: u8 = 0x09;
pub const ORDER_EMERGENCY_STOP: u8 = 0x0C;
pub const ORDER_ENABLE_DISABLE_STEPPERS: u8 = 0x0E;
pub const ORDER_ENABLE_DISABLE_ENDSTOPS: u8 = 0x10;
pub const ORDER_SET_OUTPUT_TONE: u8 = 0x11;
pub const ORDER_QUEUE_COMMAND_BLOCKS: u8 = 0x12;
pub const ORDER_CONFIGURE_AXIS_MOVEMENT_RATES: u8 = 0x13;
pub const ORDER_CLEAR_COMMAND_QUEUE: u8 = 0x17;
pub const ORDER_CONFIGURE_UNDERRUN_PARAMS: u8 = 0x19;

//
// Queue sub-block types (payload grammar of ORDER_QUEUE_COMMAND_BLOCKS)
//

pub const QUEUE_BLOCK_ORDER_WRAPPER: u8 = 0x01;
pub const QUEUE_BLOCK_DELAY: u8 = 0x02;
pub const QUEUE_BLOCK_LINEAR_MOVE: u8 = 0x03;
pub const QUEUE_BLOCK_MOVEMENT_CHECKPOINT: u8 = 0x04;

/// Device classes as referenced by wrapped orders.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
pub enum DeviceType {
    SwitchInput = 0x1,
    SwitchOutput = 0x2,
    PwmOutput = 0x3,
    Stepper = 0x4,
    Heater = 0x5,
    TempSensor = 0x6,
    Buzzer = 0x7,
}

/// Sentinel for "no temperature" in tenths of a degree.
pub const TEMPERATURE_INVALID: i16 = 0x7FFF;

/// Queue occupancy reported on every enqueue response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueInfo {
    pub remaining_slots: u16,
    pub current_count: u16,
    pub total_count: u16,
}
