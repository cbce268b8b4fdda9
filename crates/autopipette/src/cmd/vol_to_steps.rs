use autopipette_compiler::CompilerError;
use serde::Serialize;

use crate::cmd::{load_config, Context, VolToStepsArgs};
use crate::exit::{config_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct Conversion {
    volume_ul: f64,
    steps: f64,
}

pub fn run(args: VolToStepsArgs, ctx: &Context) -> CliResult<i32> {
    let config = load_config(ctx.config.as_deref())?;
    let compiler = config
        .build_compiler()
        .map_err(|err| config_error("configuration", err))?;
    let invalid = |err: CompilerError| CliError::new(DATA_INVALID, err.to_string());

    let conversion = if args.inverse {
        Conversion {
            volume_ul: compiler.steps_to_vol(args.value).map_err(invalid)?,
            steps: args.value,
        }
    } else {
        Conversion {
            volume_ul: args.value,
            steps: compiler.vol_to_steps(args.value).map_err(invalid)?,
        }
    };

    match ctx.format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&conversion).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table | OutputFormat::Pretty => println!(
            "{:.3} uL = {:.3} steps",
            conversion.volume_ul, conversion.steps
        ),
    }
    Ok(SUCCESS)
}
