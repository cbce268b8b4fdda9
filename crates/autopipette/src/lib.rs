//! Gantry autopipette control.
//!
//! Pipetting commands compile to G-code, which is uploaded to the motion
//! firmware's bridge and started as a print job.
//!
//! # Crate Structure
//!
//! - [`labware`]: coordinates, plates, wells, tip pools and the volume
//!   calibration
//! - [`compiler`]: the stateful G-code compiler for pipetting operations
//! - [`transport`]: WebSocket JSON-RPC client for the bridge with reconnect
//!   and upload
//! - [`control`]: text commands, protocol files, job hand-off and the TOML
//!   machine configuration

/// Re-export labware types.
pub mod labware {
    pub use autopipette_labware::*;
}

/// Re-export compiler types.
pub mod compiler {
    pub use autopipette_compiler::*;
}

/// Re-export transport types.
pub mod transport {
    pub use autopipette_transport::*;
}

/// Re-export command layer types.
pub mod control {
    pub use autopipette_control::*;
}
