//! Event stream, interrupt handling and the suspend/resume gate.

pub mod events;
pub mod interrupt;
pub mod resume;
