//! Deck geometry and liquid models for the autopipette.
//!
//! Everything the compiler needs to know about the physical deck lives here:
//! - [`Coordinate`] positions in machine space
//! - [`Well`] vessels and their [`DipStrategy`]
//! - [`Plate`] grids with a round-robin cursor, including tip boxes and the
//!   waste container
//! - [`TipPool`] which merges registered tip boxes into one tip source
//! - [`VolumeConverter`] which maps microliters to plunger steps
//!
//! This crate performs no I/O.

pub mod coordinate;
pub mod error;
pub mod plate;
pub mod tipbox;
pub mod volume;
pub mod well;

pub use coordinate::Coordinate;
pub use error::{LabwareError, Result};
pub use plate::{Plate, PlateKind, PlateSpec};
pub use tipbox::TipPool;
pub use volume::{VolumeConverter, DEFAULT_CALIBRATION};
pub use well::{DipStrategy, Well};
