//! Protocol module - serial DFU wire definitions.

pub mod constants;
pub mod frame;
pub mod opcode;

pub use constants::*;
pub use frame::{Frame, FrameError, Response};
pub use opcode::{OpCode, OpStatus};
