use std::io;
use std::path::PathBuf;

use autopipette_compiler::CompilerError;
use autopipette_labware::LabwareError;
use autopipette_transport::{TransportError, UploadError};

/// Errors raised while loading a machine configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML or does not match the expected layout.
    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: Box<toml::de::Error>,
    },

    /// Machine parameters failed validation.
    #[error("invalid parameters: {0}")]
    Params(#[source] CompilerError),

    /// Calibration arrays cannot be fitted.
    #[error("invalid calibration: {0}")]
    Calibration(#[source] LabwareError),

    /// A location entry is unusable.
    #[error("location '{name}': {reason}")]
    Location { name: String, reason: String },

    /// Two locations share a name.
    #[error("duplicate location '{0}'")]
    DuplicateLocation(String),

    /// The profile name is not listed under `[profiles]`.
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),
}

/// Errors raised while dispatching a command line.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The line could not be parsed into a command.
    #[error("{0}")]
    Usage(String),

    /// The leading token names no known command.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Motion was requested before homing.
    #[error("machine is not homed; run 'home' first")]
    NotHomed,

    /// The command needs the bridge but the dispatcher runs offline.
    #[error("'{0}' needs a bridge connection")]
    Offline(String),

    /// A G-code job could not be handed to the bridge; it is kept for retry.
    #[error("job '{job}' was not started: {reason} (use 'retry' to resubmit)")]
    Handoff { job: String, reason: String },

    /// `retry` was issued with no failed job pending.
    #[error("no pending job to retry")]
    NothingToRetry,

    /// A protocol line failed; nothing from the protocol was transmitted.
    #[error("protocol line {line}: {source}")]
    Protocol {
        line: usize,
        #[source]
        source: Box<DispatchError>,
    },

    /// Protocols may include one another only this deep.
    #[error("protocol nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    /// A local file could not be read or written.
    #[error("{action} {}: {source}", path.display())]
    File {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Compiler(#[from] CompilerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Request parameters were not valid JSON.
    #[error("invalid JSON parameters: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// The innermost error, looking through protocol line wrappers.
    pub fn root(&self) -> &DispatchError {
        match self {
            Self::Protocol { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
