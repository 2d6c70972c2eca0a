//! Hardware device access.
//!
//! Only the serial port is driven this early in bring-up; all kernel
//! diagnostics flow through it.

pub mod serial;
