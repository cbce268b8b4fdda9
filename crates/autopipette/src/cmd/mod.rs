use std::path::{Path, PathBuf};
use std::time::Duration;

use autopipette_control::{Dispatcher, MachineConfig};
use autopipette_transport::BridgeClient;
use clap::{Args, Subcommand};
use tracing::{info, warn};

use crate::exit::{config_error, dispatch_error, transport_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod compile;
pub mod exec;
pub mod run;
pub mod shell;
pub mod version;
pub mod vol_to_steps;

/// Options shared by every subcommand.
#[derive(Debug)]
pub struct Context {
    pub config: Option<PathBuf>,
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read commands from stdin, one per line.
    Shell(ShellArgs),
    /// Execute a single command line.
    Exec(ExecArgs),
    /// Run a protocol file as one job.
    Run(RunArgs),
    /// Compile a protocol file to G-code without a bridge.
    Compile(CompileArgs),
    /// Convert a volume (uL) to plunger steps with the configured calibration.
    VolToSteps(VolToStepsArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, ctx: &Context) -> CliResult<i32> {
    match command {
        Command::Shell(args) => shell::run(args, ctx),
        Command::Exec(args) => exec::run(args, ctx),
        Command::Run(args) => run::run(args, ctx),
        Command::Compile(args) => compile::run(args, ctx),
        Command::VolToSteps(args) => vol_to_steps::run(args, ctx),
        Command::Version(args) => version::run(args),
    }
}

/// How to reach the bridge and where to keep job files.
#[derive(Args, Debug)]
pub struct SessionArgs {
    /// Directory for generated job files.
    #[arg(long, value_name = "DIR", default_value = "jobs", env = "AUTOPIPETTE_JOB_DIR")]
    pub job_dir: PathBuf,
    /// How long to wait for the bridge connection (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub connect_timeout: String,
    /// Do not connect to the bridge; jobs are written and kept for retry.
    #[arg(long)]
    pub offline: bool,
}

#[derive(Args, Debug)]
pub struct ShellArgs {
    #[command(flatten)]
    pub session: SessionArgs,
    /// Stop at the first failing line instead of reporting and continuing.
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub session: SessionArgs,
    /// The command line, e.g. `pipette 10 wellA wellB --keep_tip`.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub line: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub session: SessionArgs,
    /// Protocol file: one command per line, `#` starts a comment.
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Protocol file to compile.
    pub file: PathBuf,
    /// Write the G-code here instead of stdout.
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VolToStepsArgs {
    /// Volume in uL, or steps with `--inverse`.
    #[arg(allow_negative_numbers = true)]
    pub value: f64,
    /// Convert steps back to a volume.
    #[arg(long)]
    pub inverse: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn load_config(path: Option<&Path>) -> CliResult<MachineConfig> {
    match path {
        Some(path) => MachineConfig::load(path).map_err(|err| config_error("configuration", err)),
        None => {
            info!("no configuration file given, using defaults");
            Ok(MachineConfig::default())
        }
    }
}

/// Build a dispatcher, connecting to the bridge unless `--offline`.
///
/// A bridge that does not come up within the connect timeout is not fatal:
/// the client keeps reconnecting in the background and failed jobs stay
/// pending for `retry`.
pub fn open_dispatcher(args: &SessionArgs, ctx: &Context) -> CliResult<Dispatcher> {
    let config = load_config(ctx.config.as_deref())?;
    let bridge = if args.offline {
        None
    } else {
        let timeout = parse_duration(&args.connect_timeout)?;
        let mut client_config = config.client_config();
        client_config.connect_timeout = timeout;
        let client =
            BridgeClient::start(client_config).map_err(|err| transport_error("bridge", err))?;
        if !client.wait_connected(timeout) {
            warn!(
                address = %client.config().address,
                "bridge not reachable yet; jobs will be kept for retry"
            );
        }
        Some(client)
    };
    Dispatcher::new(config, bridge, &args.job_dir).map_err(dispatch_error)
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").expect("2s"), Duration::from_secs(2));
        assert_eq!(
            parse_duration("150ms").expect("150ms"),
            Duration::from_millis(150)
        );
        assert_eq!(parse_duration("3").expect("3"), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }
}
