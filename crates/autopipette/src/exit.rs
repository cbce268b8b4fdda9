use std::fmt;
use std::io;

use autopipette_compiler::{CompilerError, ErrorKind};
use autopipette_control::{ConfigError, DispatchError};
use autopipette_transport::{TransportError, UploadError};

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    CliError::new(transport_code(&err), format!("{context}: {err}"))
}

fn transport_code(err: &TransportError) -> i32 {
    match err {
        TransportError::Timeout { .. } => TIMEOUT,
        TransportError::Json(_)
        | TransportError::MalformedReply(_)
        | TransportError::InvalidAddress { .. } => DATA_INVALID,
        TransportError::Runtime(_) => INTERNAL,
        TransportError::Upload(err) => upload_code(err),
        _ => TRANSPORT_ERROR,
    }
}

fn upload_code(err: &UploadError) -> i32 {
    match err {
        UploadError::Timeout(_) => TIMEOUT,
        UploadError::InvalidName(_) => USAGE,
        UploadError::WorkerGone => INTERNAL,
        _ => TRANSPORT_ERROR,
    }
}

pub fn config_error(context: &str, err: ConfigError) -> CliError {
    match err {
        ConfigError::Read { source, .. } => io_error(context, source),
        ConfigError::UnknownProfile(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

fn compiler_code(err: &CompilerError) -> i32 {
    match err.kind() {
        ErrorKind::Validation => DATA_INVALID,
        _ => FAILURE,
    }
}

/// Exit code for a failed command line.
pub fn dispatch_code(err: &DispatchError) -> i32 {
    match err.root() {
        DispatchError::Usage(_) | DispatchError::UnknownCommand(_) => USAGE,
        DispatchError::Json(_) => DATA_INVALID,
        DispatchError::Offline(_) | DispatchError::Handoff { .. } => TRANSPORT_ERROR,
        DispatchError::Compiler(err) => compiler_code(err),
        DispatchError::Transport(err) => transport_code(err),
        DispatchError::Upload(err) => upload_code(err),
        DispatchError::Config(ConfigError::Read { .. }) | DispatchError::File { .. } => FAILURE,
        DispatchError::Config(_) => DATA_INVALID,
        DispatchError::NestingTooDeep(_) => DATA_INVALID,
        DispatchError::NotHomed
        | DispatchError::NothingToRetry
        | DispatchError::Protocol { .. } => FAILURE,
    }
}

pub fn dispatch_error(err: DispatchError) -> CliError {
    CliError::new(dispatch_code(&err), err.to_string())
}
