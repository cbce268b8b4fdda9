use autopipette_control::{Dispatcher, Reply};
use autopipette_transport::BridgeClient;

use crate::cmd::{load_config, CompileArgs, Context};
use crate::exit::{dispatch_error, io_error, CliResult, SUCCESS};
use crate::output::{print_raw, print_reply};

pub fn run(args: CompileArgs, ctx: &Context) -> CliResult<i32> {
    let config = load_config(ctx.config.as_deref())?;
    // Collect mode never writes job files, so the job directory goes unused.
    let mut dispatcher: Dispatcher<BridgeClient> =
        Dispatcher::new(config, None, std::env::temp_dir()).map_err(dispatch_error)?;
    let job = dispatcher
        .compile_protocol(&args.file)
        .map_err(dispatch_error)?;
    let text = job.text();

    match &args.output {
        None => print_raw(text.as_bytes()),
        Some(path) => {
            std::fs::write(path, &text)
                .map_err(|err| io_error(&format!("failed writing {}", path.display()), err))?;
            print_reply(
                &Reply::Message(format!(
                    "compiled {} ({} lines) to {}",
                    job.name,
                    job.lines.len(),
                    path.display()
                )),
                ctx.format,
            );
        }
    }
    Ok(SUCCESS)
}
