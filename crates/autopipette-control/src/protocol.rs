//! Protocol files: one dispatcher command per line.
//!
//! A protocol runs in collect mode. Every command's instructions land in one
//! buffer that is prefixed with the configuration header and shipped as a
//! single job at the end. The first failing line aborts the run; the
//! collected instructions are discarded and the compiler is rolled back, so
//! the tracked machine state still matches the machine.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use autopipette_compiler::AutoPipette;
use serde::Serialize;
use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::config::MachineConfig;
use crate::dispatcher::{Dispatcher, Reply};
use crate::error::{DispatchError, Result};
use crate::gcode_manager::{Job, Submission};

/// Protocols may run other protocols this deep.
pub const MAX_PROTOCOL_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolReport {
    pub name: String,
    /// Command lines executed.
    pub commands: usize,
    /// G-code lines produced, header excluded.
    pub lines: usize,
    /// Absent when an enclosing protocol collects the output.
    pub submission: Option<Submission>,
}

impl fmt::Display for ProtocolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol {}: {} commands, {} lines",
            self.name, self.commands, self.lines
        )?;
        match &self.submission {
            Some(Submission::Started { job, .. }) => write!(f, ", started as {job}"),
            Some(Submission::Collected { .. }) | None => Ok(()),
        }
    }
}

/// Read a protocol, keeping each command with its 1-based line number.
/// Blank lines and `#` comments are skipped.
pub fn read_protocol(path: &Path) -> Result<Vec<(usize, String)>> {
    let text = std::fs::read_to_string(path).map_err(|source| DispatchError::File {
        action: "failed to read protocol",
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_protocol(&text))
}

pub fn parse_protocol(text: &str) -> Vec<(usize, String)> {
    text.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| (number, line.to_string()))
        .collect()
}

fn protocol_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty() && !stem.starts_with('.'))
        .unwrap_or_else(|| "protocol".to_string())
}

/// Collect mode for the lifetime of the scope.
///
/// The scope that switched collect mode on owns the buffer. Dropping it
/// without [`CollectScope::finish`] discards what was collected and restores
/// the compiler and configuration captured at the start.
pub struct CollectScope<'a, B: Bridge> {
    dispatcher: &'a mut Dispatcher<B>,
    snapshot: Option<(AutoPipette, MachineConfig)>,
    finished: bool,
}

impl<'a, B: Bridge> CollectScope<'a, B> {
    pub fn begin(dispatcher: &'a mut Dispatcher<B>) -> Self {
        let snapshot = dispatcher
            .jobs
            .begin_collect()
            .then(|| (dispatcher.compiler.clone(), dispatcher.config.clone()));
        Self {
            dispatcher,
            snapshot,
            finished: false,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.snapshot.is_some()
    }

    /// End collection. Returns the collected lines if this scope owns them.
    pub fn finish(mut self) -> Option<Vec<String>> {
        self.finished = true;
        self.snapshot
            .take()
            .map(|_| self.dispatcher.jobs.end_collect())
    }
}

impl<B: Bridge> Deref for CollectScope<'_, B> {
    type Target = Dispatcher<B>;

    fn deref(&self) -> &Self::Target {
        self.dispatcher
    }
}

impl<B: Bridge> DerefMut for CollectScope<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.dispatcher
    }
}

impl<B: Bridge> Drop for CollectScope<'_, B> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some((compiler, config)) = self.snapshot.take() {
            let discarded = self.dispatcher.jobs.end_collect();
            self.dispatcher.compiler = compiler;
            self.dispatcher.config = config;
            warn!(discarded = discarded.len(), "collect aborted, compiler state rolled back");
        }
    }
}

impl<B: Bridge> Dispatcher<B> {
    /// Run a protocol file and ship its instructions as one job.
    pub fn run_protocol(&mut self, path: &Path) -> Result<ProtocolReport> {
        let commands = read_protocol(path)?;
        let name = protocol_name(path);
        info!(protocol = %name, commands = commands.len(), "running protocol");

        let header = self.compiler.header();
        let (collected, count) = self.collect_lines(&commands)?;
        let Some(lines) = collected else {
            return Ok(ProtocolReport {
                name,
                commands: commands.len(),
                lines: count,
                submission: None,
            });
        };

        let produced = lines.len();
        let submission = if lines.is_empty() {
            None
        } else {
            let mut job_lines = header;
            job_lines.extend(lines);
            let bridge = self.bridge.as_ref().map(|b| b as &dyn Bridge);
            Some(self.jobs.send(bridge, Job::new(name.clone(), job_lines))?)
        };
        Ok(ProtocolReport {
            name,
            commands: commands.len(),
            lines: produced,
            submission,
        })
    }

    /// Compile a protocol into a job without sending it.
    ///
    /// The job carries the configuration header. Nothing is written or
    /// transmitted.
    pub fn compile_protocol(&mut self, path: &Path) -> Result<Job> {
        let commands = read_protocol(path)?;
        let name = protocol_name(path);
        let mut lines = self.compiler.header();
        let (collected, _) = self.collect_lines(&commands)?;
        lines.extend(collected.unwrap_or_default());
        Ok(Job::new(name, lines))
    }

    /// Execute numbered commands in collect mode. Returns the collected
    /// lines when this call owns collection, and the number of lines
    /// produced either way.
    fn collect_lines(
        &mut self,
        commands: &[(usize, String)],
    ) -> Result<(Option<Vec<String>>, usize)> {
        if self.depth >= MAX_PROTOCOL_DEPTH {
            return Err(DispatchError::NestingTooDeep(MAX_PROTOCOL_DEPTH));
        }
        self.depth += 1;
        let outcome = self.collect_inner(commands);
        self.depth -= 1;
        outcome
    }

    fn collect_inner(
        &mut self,
        commands: &[(usize, String)],
    ) -> Result<(Option<Vec<String>>, usize)> {
        let mut scope = CollectScope::begin(self);
        let mut produced = 0;
        for (number, line) in commands {
            let reply = scope.dispatch(line).map_err(|err| {
                warn!(line = number, error = %err, "protocol aborted");
                DispatchError::Protocol {
                    line: *number,
                    source: Box::new(err),
                }
            })?;
            match reply {
                Reply::Job(Submission::Collected { lines }) => produced += lines,
                Reply::Protocol(report) => produced += report.lines,
                _ => {}
            }
        }
        Ok((scope.finish(), produced))
    }
}
