use crate::cmd::{open_dispatcher, Context, ExecArgs};
use crate::exit::{dispatch_error, CliResult, SUCCESS};
use crate::output::print_reply;

pub fn run(args: ExecArgs, ctx: &Context) -> CliResult<i32> {
    let mut dispatcher = open_dispatcher(&args.session, ctx)?;
    let line = args.line.join(" ");
    let reply = dispatcher.dispatch(&line).map_err(dispatch_error)?;
    print_reply(&reply, ctx.format);
    Ok(SUCCESS)
}
