//! Command layer for the autopipette.
//!
//! Text commands are parsed by [`command`], executed against the compiler by
//! the [`Dispatcher`], and the resulting G-code is handed to the bridge by
//! the [`GcodeManager`]. Protocol files run many commands as one job.
//! [`MachineConfig`] loads the TOML file everything is built from.

pub mod bridge;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gcode_manager;
pub mod protocol;

pub use bridge::Bridge;
pub use command::{parse_line, tokenize, Command, HomeTarget, ListTarget, Parsed, Switch};
pub use config::{LocationConfig, MachineConfig, NetworkConfig, DEFAULT_PORT};
pub use dispatcher::{
    Dispatcher, Reply, EMERGENCY_STOP, FIRMWARE_RESTART, PRINT_CANCEL, PRINT_PAUSE, PRINT_RESUME,
};
pub use error::{ConfigError, DispatchError, Result};
pub use gcode_manager::{GcodeManager, Job, Submission, PRINT_START};
pub use protocol::{parse_protocol, read_protocol, CollectScope, ProtocolReport, MAX_PROTOCOL_DEPTH};
