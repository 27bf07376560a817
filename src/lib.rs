//! Firmware core of a Pacemaker-protocol motion controller.
//!
//! A host machine streams queued commands (linear moves, delays, output
//! toggles, heater setpoints) over a serial link; this crate buffers them in
//! a lock-free ring shared with a high-frequency timer ISR, and executes
//! them in real time against stepper, heater, endstop and PWM hardware.
//!
//! The crate is hardware-agnostic: all pin access goes through [`PortBit`]
//! and ADC access through [`thermal_isr::AdcSampler`], so the same code runs
//! on target and under the host test suite. Platform glue owns the timers
//! and vectors; the two ISR bodies are [`motion_isr::MovementIsr::tick`]
//! (movement, variable rate up to 40 kHz of step events) and
//! [`thermal_isr::ThermalIsr::tick`] (soft PWM + temperature sampling,
//! ~1 kHz). Because ISRs on these targets cannot carry user data, the glue
//! parks both halves in [`util::IsrCell`] statics at boot.
//!
//! Module map:
//! - `queue`: single-producer/single-consumer command ring buffer
//! - `records`: tagged-union queue record encoding
//! - `axis`: per-axis configuration and live stepping state
//! - `enqueue`: command-block validation and move compilation
//! - `motion_isr`: the movement state machine (Bresenham + trapezoid +
//!   underrun avoidance)
//! - `speed`: step-rate to timer-compare mapping
//! - `thermal` / `thermal_isr`: heater control loop, soft PWM, ADC sampling
//! - `state`: stop model and the shared atomics plane
//! - `protocol`: wire-level constants the core is driven through

#![cfg_attr(not(test), no_std)]

cfg_if::cfg_if! {
    if #[cfg(feature = "rtt")] {
        use defmt_rtt as _;
        use panic_probe as _;
    }
}

#[macro_use]
mod fmt;

pub mod axis;
pub mod config;
pub mod devices;
pub mod enqueue;
pub mod error;
pub mod motion_isr;
pub mod port;
pub mod protocol;
pub mod queue;
pub mod records;
pub mod speed;
pub mod state;
pub mod thermal;
pub mod thermal_isr;
pub mod util;

pub use port::PortBit;
pub use state::SystemState;
