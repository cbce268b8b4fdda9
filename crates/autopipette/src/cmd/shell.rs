use std::io::{BufRead, IsTerminal, Write};

use tracing::warn;

use crate::cmd::{open_dispatcher, Context, ShellArgs};
use crate::exit::{dispatch_error, io_error, CliResult, FAILURE, SUCCESS};
use crate::output::print_reply;

const PROMPT: &str = "autopipette> ";

pub fn run(args: ShellArgs, ctx: &Context) -> CliResult<i32> {
    let mut dispatcher = open_dispatcher(&args.session, ctx)?;
    let stdin = std::io::stdin();
    let interactive = stdin.is_terminal();
    let mut failures = 0usize;

    let mut lines = stdin.lock().lines();
    loop {
        if interactive {
            eprint!("{PROMPT}");
            let _ = std::io::stderr().flush();
        }
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.map_err(|err| io_error("failed reading stdin", err))?;
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            continue;
        }
        if matches!(trimmed, "exit" | "quit") {
            break;
        }

        match dispatcher.dispatch(trimmed) {
            Ok(reply) => print_reply(&reply, ctx.format),
            Err(err) if args.fail_fast => return Err(dispatch_error(err)),
            Err(err) => {
                failures += 1;
                eprintln!("error: {err}");
            }
        }
    }

    if let Some(job) = dispatcher.jobs().pending() {
        warn!(job = %job.name, dir = %dispatcher.jobs().job_dir().display(), "exiting with an unsent job");
    }
    Ok(if failures == 0 { SUCCESS } else { FAILURE })
}
