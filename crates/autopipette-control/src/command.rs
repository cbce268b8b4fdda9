//! Text command grammar.
//!
//! A line is split into shell-like words and parsed with clap, so every
//! command gets typed arguments, defaults and `help` for free.

use std::path::PathBuf;

use autopipette_compiler::{LeftoverPolicy, Setting};
use autopipette_labware::{DipStrategy, PlateKind};
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::error::{DispatchError, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum HomeTarget {
    #[default]
    All,
    X,
    Y,
    Z,
    Pipette,
    Servo,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum ListTarget {
    #[default]
    Locations,
    Plates,
    Settings,
    State,
}

#[derive(Parser, Debug)]
#[command(
    name = "autopipette",
    no_binary_name = true,
    disable_version_flag = true,
    about = "Pipette control commands"
)]
struct CommandLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
#[command(rename_all = "snake_case")]
pub enum Command {
    /// Home axes or pipette motors.
    Home {
        #[arg(value_enum, default_value_t = HomeTarget::All)]
        target: HomeTarget,
    },
    /// Change a pipette parameter.
    #[command(allow_negative_numbers = true)]
    Set { setting: Setting, value: f64 },
    /// Register a named coordinate.
    #[command(allow_negative_numbers = true)]
    Coor { name: String, x: f64, y: f64, z: f64 },
    /// Turn a named coordinate into a plate.
    Plate(PlateArgs),
    /// Move to an absolute position.
    #[command(allow_negative_numbers = true)]
    Move { x: f64, y: f64, z: f64 },
    /// Move to a named location.
    MoveLoc {
        name: String,
        #[arg(long)]
        row: Option<usize>,
        #[arg(long)]
        col: Option<usize>,
    },
    /// Move relative to the current position.
    #[command(allow_negative_numbers = true)]
    MoveRel {
        #[arg(long, default_value_t = 0.0)]
        x: f64,
        #[arg(long, default_value_t = 0.0)]
        y: f64,
        #[arg(long, default_value_t = 0.0)]
        z: f64,
    },
    /// Pick up the next tip.
    NextTip {
        #[arg(long)]
        tipbox: Option<String>,
    },
    /// Eject the tip into the waste container.
    EjectTip,
    /// Pin a tip box as the tip source; without a name, use the pool.
    Tipbox { name: Option<String> },
    /// Transfer liquid from a source to one or more destinations.
    Pipette(PipetteArgs),
    /// Draw liquid into the tip.
    Aspirate(AspirateArgs),
    /// Expel liquid from the tip.
    Dispense(DispenseArgs),
    /// Switch an auxiliary output.
    Trigger { channel: String, state: Switch },
    /// Show a message on the machine display.
    #[command(alias = "gcode_print")]
    Print {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        message: Vec<String>,
    },
    /// Run a protocol file.
    Run { file: PathBuf },
    /// Rewind a plate, or every plate when no name is given.
    ResetPlate { name: Option<String> },
    /// Convert a volume to plunger steps.
    VolToSteps { volume: f64 },
    /// List locations, plates, settings or state.
    Ls {
        #[arg(value_enum, default_value_t = ListTarget::Locations)]
        what: ListTarget,
    },
    /// Send a JSON-RPC request.
    Send {
        method: String,
        /// JSON parameters.
        params: Option<String>,
    },
    /// Send a JSON-RPC notification.
    Notify {
        method: String,
        /// JSON parameters.
        params: Option<String>,
    },
    /// Upload a local G-code file.
    Upload { name: String, path: PathBuf },
    /// Show bridge events nobody handled.
    Messages,
    /// Emergency stop.
    Stop,
    Pause,
    Resume,
    Cancel,
    /// Restart the firmware.
    Restart,
    /// Re-submit the last job that failed to start.
    Retry,
    /// Forget tip, liquid and homing state.
    ResetState,
    /// Switch to a configuration profile.
    Profile { name: String },
}

impl Command {
    /// The command word as typed.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Home { .. } => "home",
            Self::Set { .. } => "set",
            Self::Coor { .. } => "coor",
            Self::Plate(_) => "plate",
            Self::Move { .. } => "move",
            Self::MoveLoc { .. } => "move_loc",
            Self::MoveRel { .. } => "move_rel",
            Self::NextTip { .. } => "next_tip",
            Self::EjectTip => "eject_tip",
            Self::Tipbox { .. } => "tipbox",
            Self::Pipette(_) => "pipette",
            Self::Aspirate(_) => "aspirate",
            Self::Dispense(_) => "dispense",
            Self::Trigger { .. } => "trigger",
            Self::Print { .. } => "print",
            Self::Run { .. } => "run",
            Self::ResetPlate { .. } => "reset_plate",
            Self::VolToSteps { .. } => "vol_to_steps",
            Self::Ls { .. } => "ls",
            Self::Send { .. } => "send",
            Self::Notify { .. } => "notify",
            Self::Upload { .. } => "upload",
            Self::Messages => "messages",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Restart => "restart",
            Self::Retry => "retry",
            Self::ResetState => "reset_state",
            Self::Profile { .. } => "profile",
        }
    }

    /// Commands that move the machine and therefore need homing first.
    pub fn needs_homing(&self) -> bool {
        matches!(
            self,
            Self::Move { .. }
                | Self::MoveLoc { .. }
                | Self::MoveRel { .. }
                | Self::NextTip { .. }
                | Self::EjectTip
                | Self::Pipette(_)
                | Self::Aspirate(_)
                | Self::Dispense(_)
        )
    }
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct PlateArgs {
    /// Existing coordinate that becomes the first well.
    pub name: String,
    #[arg(value_name = "TYPE")]
    pub kind: PlateKind,
    #[arg(long, alias = "row", default_value_t = 1)]
    pub rows: usize,
    #[arg(long, alias = "col", default_value_t = 1)]
    pub cols: usize,
    #[arg(long = "spacing_row", default_value_t = 0.0)]
    pub spacing_row: f64,
    #[arg(long = "spacing_col", default_value_t = 0.0)]
    pub spacing_col: f64,
    #[arg(long = "dip_top", default_value_t = 0.0)]
    pub dip_top: f64,
    #[arg(long = "dip_btm")]
    pub dip_btm: Option<f64>,
    #[arg(long)]
    pub diameter: Option<f64>,
    #[arg(long, default_value = "simple")]
    pub strategy: DipStrategy,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct PipetteArgs {
    pub volume: f64,
    pub source: String,
    pub dest: String,
    #[arg(long = "src_row")]
    pub src_row: Option<usize>,
    #[arg(long = "src_col")]
    pub src_col: Option<usize>,
    #[arg(long = "dest_row")]
    pub dest_row: Option<usize>,
    #[arg(long = "dest_col")]
    pub dest_col: Option<usize>,
    #[arg(long = "keep_tip")]
    pub keep_tip: bool,
    /// Wetting cycles before the draw; a bare flag means one.
    #[arg(long, num_args = 0..=1, default_value_t = 0, default_missing_value = "1")]
    pub prewet: u8,
    #[arg(long)]
    pub wiggle: bool,
    #[arg(long)]
    pub touch: bool,
    #[arg(long)]
    pub serum: bool,
    #[arg(long = "extra_air")]
    pub extra_air: Option<f64>,
    #[arg(long = "after_air")]
    pub after_air: Option<f64>,
    #[arg(long)]
    pub tipbox: Option<String>,
    /// Dispense only this much at the destination.
    #[arg(long = "dispense_vol", short = 'd')]
    pub dispense_volume: Option<f64>,
    /// Multi-destination legs: `DEST:VOL[@ROW,COL];...`.
    #[arg(long)]
    pub splits: Option<String>,
    #[arg(long, default_value = "waste")]
    pub leftover: LeftoverPolicy,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct AspirateArgs {
    pub volume: f64,
    pub source: String,
    #[arg(long)]
    pub row: Option<usize>,
    #[arg(long)]
    pub col: Option<usize>,
    #[arg(long, num_args = 0..=1, default_value_t = 0, default_missing_value = "1")]
    pub prewet: u8,
    #[arg(long)]
    pub serum: bool,
    #[arg(long = "extra_air")]
    pub extra_air: Option<f64>,
    #[arg(long = "after_air")]
    pub after_air: Option<f64>,
    #[arg(long)]
    pub tipbox: Option<String>,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct DispenseArgs {
    pub volume: f64,
    pub dest: String,
    #[arg(long)]
    pub row: Option<usize>,
    #[arg(long)]
    pub col: Option<usize>,
    /// Total volume that should have left the tip afterwards.
    #[arg(long)]
    pub target: Option<f64>,
    #[arg(long)]
    pub wiggle: bool,
    #[arg(long)]
    pub touch: bool,
}

/// Result of parsing one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// Blank line.
    Empty,
    /// The user asked for help; the text is ready to show.
    Help(String),
    Command(Command),
}

/// Parse one command line.
pub fn parse_line(line: &str) -> Result<Parsed> {
    let mut words = tokenize(line)?;
    let Some(first) = words.first_mut() else {
        return Ok(Parsed::Empty);
    };
    *first = first.to_ascii_lowercase();
    let verb = first.clone();

    match CommandLine::try_parse_from(&words) {
        Ok(parsed) => Ok(Parsed::Command(parsed.command)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                Ok(Parsed::Help(err.render().to_string()))
            }
            ErrorKind::InvalidSubcommand => Err(DispatchError::UnknownCommand(verb)),
            _ => Err(DispatchError::Usage(err.render().to_string().trim_end().to_string())),
        },
    }
}

/// Split a line into words, honoring single quotes, double quotes and
/// backslash escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(DispatchError::Usage("unterminated single quote".into())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => {
                                return Err(DispatchError::Usage("unterminated double quote".into()))
                            }
                        },
                        Some(c) => current.push(c),
                        None => return Err(DispatchError::Usage("unterminated double quote".into())),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(DispatchError::Usage("dangling escape at end of line".into())),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> Command {
        match parse_line(line).expect("line should parse") {
            Parsed::Command(command) => command,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn tokenizes_quotes_and_escapes() {
        let words = tokenize(r#"send printer.gcode.script '{"script": "G28"}'"#).expect("tokens");
        assert_eq!(words, vec!["send", "printer.gcode.script", r#"{"script": "G28"}"#]);

        let words = tokenize(r#"print "hello \"lab\"" a\ b ''"#).expect("tokens");
        assert_eq!(words, vec!["print", "hello \"lab\"", "a b", ""]);

        assert!(tokenize("print 'oops").is_err());
        assert!(tokenize("  \t ").expect("blank").is_empty());
    }

    #[test]
    fn blank_line_is_empty() {
        assert_eq!(parse_line("   ").expect("blank"), Parsed::Empty);
    }

    #[test]
    fn home_defaults_to_all() {
        assert_eq!(command("home"), Command::Home { target: HomeTarget::All });
        assert_eq!(command("HOME z"), Command::Home { target: HomeTarget::Z });
    }

    #[test]
    fn parses_settings_by_name() {
        assert_eq!(
            command("set speed_xy 5000"),
            Command::Set {
                setting: Setting::SpeedXy,
                value: 5000.0
            }
        );
        assert!(matches!(parse_line("set warp_speed 9"), Err(DispatchError::Usage(_))));
    }

    #[test]
    fn negative_coordinates_are_values() {
        assert_eq!(
            command("move_rel --x -5 --z 2.5"),
            Command::MoveRel {
                x: -5.0,
                y: 0.0,
                z: 2.5
            }
        );
        assert_eq!(
            command("coor park -10 20 0"),
            Command::Coor {
                name: "park".to_string(),
                x: -10.0,
                y: 20.0,
                z: 0.0
            }
        );
    }

    #[test]
    fn parses_pipette_options() {
        let Command::Pipette(args) = command(
            "pipette 30 reservoir plate --dest_row 1 --dest_col 2 --keep_tip --prewet --wiggle -d 10",
        ) else {
            panic!("expected pipette");
        };
        assert_eq!(args.volume, 30.0);
        assert_eq!(args.source, "reservoir");
        assert_eq!(args.dest, "plate");
        assert_eq!((args.dest_row, args.dest_col), (Some(1), Some(2)));
        assert!(args.keep_tip && args.wiggle);
        assert_eq!(args.prewet, 1);
        assert_eq!(args.dispense_volume, Some(10.0));
        assert_eq!(args.leftover, LeftoverPolicy::Waste);

        let Command::Pipette(args) = command(
            "pipette 40 res x --splits 'a:10;b:20@0,1' --leftover source --prewet 3",
        ) else {
            panic!("expected pipette");
        };
        assert_eq!(args.splits.as_deref(), Some("a:10;b:20@0,1"));
        assert_eq!(args.leftover, LeftoverPolicy::Source);
        assert_eq!(args.prewet, 3);
    }

    #[test]
    fn parses_plate_definition() {
        let Command::Plate(args) = command(
            "plate res singleton --dip_top 30 --dip_btm 60 --diameter 20 --strategy cylinder",
        ) else {
            panic!("expected plate");
        };
        assert_eq!(args.kind, PlateKind::Singleton);
        assert_eq!(args.strategy, DipStrategy::Cylinder);
        assert_eq!(args.dip_btm, Some(60.0));

        let Command::Plate(args) = command("plate tips tipbox --row 8 --col 12") else {
            panic!("expected plate");
        };
        assert_eq!((args.rows, args.cols), (8, 12));
    }

    #[test]
    fn print_joins_words() {
        assert_eq!(
            command("print batch 3 - done"),
            Command::Print {
                message: vec!["batch", "3", "-", "done"]
                    .into_iter()
                    .map(String::from)
                    .collect()
            }
        );
        assert_eq!(command("gcode_print hi").name(), "print");
    }

    #[test]
    fn unknown_command_is_named() {
        match parse_line("fly 10") {
            Err(DispatchError::UnknownCommand(verb)) => assert_eq!(verb, "fly"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn help_is_returned_as_text() {
        match parse_line("help").expect("help parses") {
            Parsed::Help(text) => assert!(text.contains("pipette")),
            other => panic!("expected help, got {other:?}"),
        }
    }

    #[test]
    fn motion_commands_need_homing() {
        assert!(command("move 1 2 3").needs_homing());
        assert!(command("eject_tip").needs_homing());
        assert!(!command("home").needs_homing());
        assert!(!command("print hi").needs_homing());
    }
}
