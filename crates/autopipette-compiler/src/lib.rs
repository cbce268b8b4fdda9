//! Pipetting compiler: turns liquid-handling operations into G-code.
//!
//! [`AutoPipette`] owns the deck (named coordinates and plates), the tip
//! pool, the tracked machine state and an instruction buffer. Operations
//! append instructions and update state; callers drain the buffer with
//! [`AutoPipette::take_instructions`] and ship it however they like.

pub mod compiler;
pub mod error;
pub mod gcode;
pub mod params;
pub mod split;

pub use compiler::{
    chunk_volumes, to_gcode, AspirateOptions, AutoPipette, DispenseOptions, Location,
    MachineState, PipetteOptions, MAX_PREWET, MAX_TRANSFER_CHUNKS, VOLUME_EPSILON,
};
pub use error::{CompilerError, ErrorKind, Result};
pub use params::{PipetteParams, Setting};
pub use split::{parse_splits, LeftoverPolicy, Split};
