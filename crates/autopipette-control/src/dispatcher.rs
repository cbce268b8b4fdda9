use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use autopipette_compiler::{
    parse_splits, AspirateOptions, AutoPipette, CompilerError, DispenseOptions, Location,
    PipetteOptions,
};
use autopipette_labware::{Coordinate, PlateSpec};
use autopipette_transport::BridgeClient;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::bridge::Bridge;
use crate::command::{
    parse_line, AspirateArgs, Command, DispenseArgs, HomeTarget, ListTarget, Parsed, PipetteArgs,
    PlateArgs, Switch,
};
use crate::config::MachineConfig;
use crate::error::{DispatchError, Result};
use crate::gcode_manager::{GcodeManager, Submission};
use crate::protocol::ProtocolReport;

pub const EMERGENCY_STOP: &str = "printer.emergency_stop";
pub const PRINT_PAUSE: &str = "printer.print.pause";
pub const PRINT_RESUME: &str = "printer.print.resume";
pub const PRINT_CANCEL: &str = "printer.print.cancel";
pub const FIRMWARE_RESTART: &str = "printer.firmware_restart";

/// What a command produced, for the caller to display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Reply {
    /// Nothing to report.
    Done,
    Message(String),
    /// Compiled instructions were collected or submitted.
    Job(Submission),
    /// Result of a raw JSON-RPC request.
    Json(Value),
    List(Vec<String>),
    Protocol(ProtocolReport),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => Ok(()),
            Self::Message(text) => f.write_str(text),
            Self::Job(Submission::Collected { lines }) => write!(f, "collected {lines} lines"),
            Self::Job(Submission::Started {
                job,
                server_path,
                lines,
            }) => write!(f, "started {job} ({lines} lines) as {server_path}"),
            Self::Json(value) => write!(f, "{value}"),
            Self::List(items) => f.write_str(&items.join("\n")),
            Self::Protocol(report) => write!(f, "{report}"),
        }
    }
}

/// Routes text commands to the compiler and the bridge.
///
/// The dispatcher owns the compiler; it checks motion preconditions, drains
/// the instruction buffer after every command and hands the result to the
/// [`GcodeManager`]. Without a bridge it still compiles, but jobs can only
/// be collected or kept for retry.
pub struct Dispatcher<B = BridgeClient> {
    pub(crate) config: MachineConfig,
    pub(crate) compiler: AutoPipette,
    pub(crate) bridge: Option<B>,
    pub(crate) jobs: GcodeManager,
    pub(crate) depth: usize,
}

impl<B: Bridge> Dispatcher<B> {
    pub fn new(config: MachineConfig, bridge: Option<B>, job_dir: impl Into<PathBuf>) -> Result<Self> {
        let compiler = config.build_compiler()?;
        let jobs = GcodeManager::new(job_dir, config.request_timeout(), config.upload_timeout());
        Ok(Self {
            config,
            compiler,
            bridge,
            jobs,
            depth: 0,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn compiler(&self) -> &AutoPipette {
        &self.compiler
    }

    pub fn compiler_mut(&mut self) -> &mut AutoPipette {
        &mut self.compiler
    }

    pub fn bridge(&self) -> Option<&B> {
        self.bridge.as_ref()
    }

    pub fn jobs(&self) -> &GcodeManager {
        &self.jobs
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// Parse and execute one line.
    pub fn dispatch(&mut self, line: &str) -> Result<Reply> {
        match parse_line(line)? {
            Parsed::Empty => Ok(Reply::Done),
            Parsed::Help(text) => Ok(Reply::Message(text.trim_end().to_string())),
            Parsed::Command(command) => self.execute(command),
        }
    }

    pub fn execute(&mut self, command: Command) -> Result<Reply> {
        debug!(command = command.name(), "dispatching");
        if command.needs_homing() && !self.compiler.state().homed {
            return Err(DispatchError::NotHomed);
        }

        match command {
            Command::Home { target } => {
                match target {
                    HomeTarget::All => self.compiler.home_all(),
                    HomeTarget::X => self.compiler.home_x(),
                    HomeTarget::Y => self.compiler.home_y(),
                    HomeTarget::Z => self.compiler.home_z(),
                    HomeTarget::Pipette => self.compiler.home_pipette(),
                    HomeTarget::Servo => self.compiler.home_servo(),
                }
                self.flush()
            }
            Command::Set { setting, value } => {
                self.compiler.set(setting, value)?;
                self.flush_or(format!("set {setting} = {value}"))
            }
            Command::Coor { name, x, y, z } => {
                let at = Coordinate::new(x, y, z);
                self.compiler.add_location(&name, at)?;
                Ok(Reply::Message(format!("location {name} at {at}")))
            }
            Command::Plate(args) => self.define_plate(args),
            Command::Move { x, y, z } => {
                self.compiler.move_to(Coordinate::new(x, y, z))?;
                self.flush()
            }
            Command::MoveLoc { name, row, col } => {
                self.compiler.move_to_location(&name, row, col)?;
                self.flush()
            }
            Command::MoveRel { x, y, z } => {
                self.compiler.move_relative(x, y, z)?;
                self.flush()
            }
            Command::NextTip { tipbox } => {
                if tipbox.is_none() {
                    self.require_tip_source()?;
                }
                self.compiler.next_tip(tipbox.as_deref())?;
                self.flush()
            }
            Command::EjectTip => {
                self.require_waste()?;
                self.compiler.dispose_tip()?;
                self.flush()
            }
            Command::Tipbox { name } => {
                self.compiler.set_active_tipbox(name.as_deref())?;
                Ok(Reply::Message(match name {
                    Some(name) => format!("tips now come from {name}"),
                    None => "tips now come from the pooled tip boxes".to_string(),
                }))
            }
            Command::Pipette(args) => self.pipette(args),
            Command::Aspirate(args) => self.aspirate(args),
            Command::Dispense(args) => self.dispense(args),
            Command::Trigger { channel, state } => {
                self.compiler.set_trigger(&channel, state == Switch::On)?;
                self.flush()
            }
            Command::Print { message } => {
                self.compiler.print_message(&message.join(" "))?;
                self.flush()
            }
            Command::Run { file } => Ok(Reply::Protocol(self.run_protocol(&file)?)),
            Command::ResetPlate { name } => match name {
                Some(name) => {
                    self.compiler.reset_plate(&name)?;
                    Ok(Reply::Message(format!("plate {name} reset")))
                }
                None => {
                    self.compiler.reset_all_plates();
                    Ok(Reply::Message("all plates reset".to_string()))
                }
            },
            Command::VolToSteps { volume } => {
                let steps = self.compiler.vol_to_steps(volume)?;
                Ok(Reply::Message(format!("{volume} uL = {steps:.3} steps")))
            }
            Command::Ls { what } => Ok(Reply::List(self.list(what))),
            Command::Send { method, params } => {
                let params = parse_params(params.as_deref())?;
                let timeout = self.request_timeout();
                let result = self.require_bridge("send")?.request(&method, params, timeout)?;
                Ok(Reply::Json(result))
            }
            Command::Notify { method, params } => {
                let params = parse_params(params.as_deref())?;
                self.require_bridge("notify")?.notify(&method, params)?;
                Ok(Reply::Message(format!("notified {method}")))
            }
            Command::Upload { name, path } => {
                let bytes = std::fs::read(&path).map_err(|source| DispatchError::File {
                    action: "failed to read",
                    path: path.clone(),
                    source,
                })?;
                let timeout = self.config.upload_timeout();
                let server_path = self.require_bridge("upload")?.upload(&name, bytes, timeout)?;
                Ok(Reply::Message(format!("uploaded {} as {server_path}", path.display())))
            }
            Command::Messages => {
                let events = self.require_bridge("messages")?.drain_events();
                Ok(Reply::List(events.iter().map(ToString::to_string).collect()))
            }
            Command::Stop => self.control("stop", EMERGENCY_STOP),
            Command::Pause => self.control("pause", PRINT_PAUSE),
            Command::Resume => self.control("resume", PRINT_RESUME),
            Command::Cancel => self.control("cancel", PRINT_CANCEL),
            Command::Restart => self.control("restart", FIRMWARE_RESTART),
            Command::Retry => {
                let bridge = self.bridge.as_ref().map(|b| b as &dyn Bridge);
                Ok(Reply::Job(self.jobs.retry(bridge)?))
            }
            Command::ResetState => {
                self.compiler.reset_state();
                Ok(Reply::Message("machine state reset; home before moving".to_string()))
            }
            Command::Profile { name } => self.switch_profile(&name),
        }
    }

    /// Hand any buffered instructions to the job manager.
    pub(crate) fn flush(&mut self) -> Result<Reply> {
        let lines = self.compiler.take_instructions();
        if lines.is_empty() {
            return Ok(Reply::Done);
        }
        let bridge = self.bridge.as_ref().map(|b| b as &dyn Bridge);
        Ok(Reply::Job(self.jobs.submit(bridge, lines)?))
    }

    fn flush_or(&mut self, message: String) -> Result<Reply> {
        match self.flush()? {
            Reply::Done => Ok(Reply::Message(message)),
            other => Ok(other),
        }
    }

    fn require_bridge(&self, command: &str) -> Result<&B> {
        self.bridge
            .as_ref()
            .ok_or_else(|| DispatchError::Offline(command.to_string()))
    }

    fn require_tip_source(&self) -> Result<()> {
        if self.compiler.has_tip_source() {
            Ok(())
        } else {
            Err(CompilerError::NoTipbox.into())
        }
    }

    fn require_waste(&self) -> Result<()> {
        if self.compiler.has_waste() {
            Ok(())
        } else {
            Err(CompilerError::NoWasteContainer.into())
        }
    }

    fn control(&self, command: &str, method: &str) -> Result<Reply> {
        let timeout = self.request_timeout();
        self.require_bridge(command)?
            .request(method, Value::Null, timeout)?;
        info!(method, "control request sent");
        Ok(Reply::Message(format!("{command} sent")))
    }

    fn define_plate(&mut self, args: PlateArgs) -> Result<Reply> {
        let origin = match self.compiler.location(&args.name) {
            None => return Err(CompilerError::NotALocation(args.name).into()),
            Some(Location::Point(at)) => *at,
            Some(Location::Plate(plate)) => match plate.wells().first() {
                Some(well) => well.coordinate(),
                None => return Err(CompilerError::NotALocation(args.name).into()),
            },
        };
        let spec = PlateSpec {
            kind: args.kind,
            rows: args.rows,
            cols: args.cols,
            spacing_row: args.spacing_row,
            spacing_col: args.spacing_col,
            dip_top: args.dip_top,
            dip_btm: args.dip_btm,
            diameter: args.diameter,
            strategy: args.strategy,
        };
        let plate = spec.build(origin).map_err(CompilerError::from)?;
        let summary = format!(
            "plate {} ({}, {}x{}) at {origin}",
            args.name,
            plate.kind(),
            plate.rows(),
            plate.cols()
        );
        self.compiler.add_plate(&args.name, plate)?;
        Ok(Reply::Message(summary))
    }

    fn pipette(&mut self, args: PipetteArgs) -> Result<Reply> {
        if !self.compiler.state().has_tip && args.tipbox.is_none() {
            self.require_tip_source()?;
        }
        if !args.keep_tip {
            self.require_waste()?;
        }
        let splits = match args.splits.as_deref() {
            Some(text) => parse_splits(text)?,
            None => Vec::new(),
        };
        let opts = PipetteOptions {
            src_row: args.src_row,
            src_col: args.src_col,
            dest_row: args.dest_row,
            dest_col: args.dest_col,
            keep_tip: args.keep_tip,
            prewet: args.prewet,
            extra_air: args.extra_air,
            after_air: args.after_air,
            serum: args.serum,
            wiggle: args.wiggle,
            touch: args.touch,
            tipbox: args.tipbox,
            dispense_volume: args.dispense_volume,
            splits,
            leftover: args.leftover,
        };
        self.compiler
            .pipette(args.volume, &args.source, &args.dest, &opts)?;
        self.flush()
    }

    fn aspirate(&mut self, args: AspirateArgs) -> Result<Reply> {
        if !self.compiler.state().has_tip && args.tipbox.is_none() {
            self.require_tip_source()?;
        }
        let opts = AspirateOptions {
            row: args.row,
            col: args.col,
            prewet: args.prewet,
            extra_air: args.extra_air,
            after_air: args.after_air,
            serum: args.serum,
            tipbox: args.tipbox,
        };
        self.compiler.aspirate(args.volume, &args.source, &opts)?;
        self.flush()
    }

    fn dispense(&mut self, args: DispenseArgs) -> Result<Reply> {
        let opts = DispenseOptions {
            row: args.row,
            col: args.col,
            absolute_target: args.target,
            wiggle: args.wiggle,
            touch: args.touch,
        };
        self.compiler.dispense(args.volume, &args.dest, &opts)?;
        self.flush()
    }

    fn list(&self, what: ListTarget) -> Vec<String> {
        match what {
            ListTarget::Locations => self
                .compiler
                .locations()
                .map(|(name, location)| match location {
                    Location::Point(at) => format!("{name}: {at}"),
                    Location::Plate(plate) => format!(
                        "{name}: {} {}x{} at {} (next well {})",
                        plate.kind(),
                        plate.rows(),
                        plate.cols(),
                        plate
                            .wells()
                            .first()
                            .map(|w| w.coordinate().to_string())
                            .unwrap_or_default(),
                        plate.cursor()
                    ),
                })
                .collect(),
            ListTarget::Plates => self.compiler.plate_names().map(str::to_string).collect(),
            ListTarget::Settings => self.compiler.params().summary(),
            ListTarget::State => {
                let state = self.compiler.state();
                let mut lines = vec![
                    format!("homed: {}", state.homed),
                    format!("has_tip: {}", state.has_tip),
                    format!("has_liquid: {}", state.has_liquid),
                    format!(
                        "held_volume: {}",
                        self.compiler.held_volume().unwrap_or(0.0)
                    ),
                    format!(
                        "tip_source: {}",
                        self.compiler.active_tipbox().unwrap_or("pool")
                    ),
                    format!(
                        "bridge: {}",
                        match &self.bridge {
                            None => "offline",
                            Some(b) if b.is_connected() => "connected",
                            Some(_) => "disconnected",
                        }
                    ),
                ];
                if let Some(job) = self.jobs.pending() {
                    lines.push(format!("pending_job: {}", job.name));
                }
                lines
            }
        }
    }

    fn switch_profile(&mut self, name: &str) -> Result<Reply> {
        let path = self.config.profile_path(name)?;
        let config = MachineConfig::load(&path)?;
        let compiler = config.build_compiler()?;
        self.config = config;
        self.compiler = compiler;
        info!(profile = name, path = %path.display(), "profile loaded");
        Ok(Reply::Message(format!(
            "profile {name} loaded from {}; home before moving",
            path.display()
        )))
    }
}

fn parse_params(text: Option<&str>) -> Result<Value> {
    match text {
        None => Ok(Value::Null),
        Some(text) => Ok(serde_json::from_str(text)?),
    }
}
