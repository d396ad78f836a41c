//! In-process stand-ins for rig hardware.

pub mod simulated;
