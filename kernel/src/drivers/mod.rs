//! Device layer: the simulated disk and the keyboard line reader.

pub mod disk;
pub mod term;
