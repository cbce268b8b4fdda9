use autopipette_control::Reply;

use crate::cmd::{open_dispatcher, Context, RunArgs};
use crate::exit::{dispatch_error, CliResult, SUCCESS};
use crate::output::print_reply;

pub fn run(args: RunArgs, ctx: &Context) -> CliResult<i32> {
    let mut dispatcher = open_dispatcher(&args.session, ctx)?;
    let report = dispatcher
        .run_protocol(&args.file)
        .map_err(dispatch_error)?;
    print_reply(&Reply::Protocol(report), ctx.format);
    Ok(SUCCESS)
}
