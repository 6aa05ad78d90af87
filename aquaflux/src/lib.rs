/**
Aquaflux drives the actuators of a hydroponic control system: relay boards,
PWM drivers, peristaltic dosing pumps and network smart plugs. Every output,
whatever its hardware, is switched through one contract, so the process
that schedules dosing and lighting never needs to know which bus or
protocol sits underneath.
*/

/// Components in the system are created by grouping together
/// devices into a logical unit that performs some function
/// for the overall control system.
pub mod components;
/// Devices that are an atomic unit, and can be composed
/// with other devices into components to perform some function.
pub mod devices;
/// Error type shared by the whole crate.
pub mod error;
/// Message structure for communication into and out of the
/// control system.
pub mod messages;
/// Development utilities for working with serialisation and
/// test fixtures.
pub mod utils;
