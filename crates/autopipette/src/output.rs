use std::io::{IsTerminal, Write};

use autopipette_control::{Reply, Submission};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

pub fn print_reply(reply: &Reply, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(reply).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            if let Some(table) = reply_table(reply) {
                println!("{table}");
            }
        }
        OutputFormat::Pretty => {
            if *reply != Reply::Done {
                println!("{reply}");
            }
        }
    }
}

fn reply_table(reply: &Reply) -> Option<Table> {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    match reply {
        Reply::Done => return None,
        Reply::Message(text) => {
            table.set_header(vec!["MESSAGE"]).add_row(vec![text.clone()]);
        }
        Reply::List(items) => {
            table.set_header(vec!["#", "ITEM"]);
            for (idx, item) in items.iter().enumerate() {
                table.add_row(vec![idx.to_string(), item.clone()]);
            }
        }
        Reply::Json(value) => {
            let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            table.set_header(vec!["RESULT"]).add_row(vec![text]);
        }
        Reply::Job(submission) => {
            table.set_header(vec!["STATUS", "JOB", "LINES", "SERVER PATH"]);
            table.add_row(submission_row(submission));
        }
        Reply::Protocol(report) => {
            table.set_header(vec!["PROTOCOL", "COMMANDS", "LINES", "STATUS"]);
            let status = match &report.submission {
                Some(Submission::Started { server_path, .. }) => format!("started {server_path}"),
                Some(Submission::Collected { .. }) | None => "collected".to_string(),
            };
            table.add_row(vec![
                report.name.clone(),
                report.commands.to_string(),
                report.lines.to_string(),
                status,
            ]);
        }
    }
    Some(table)
}

fn submission_row(submission: &Submission) -> Vec<String> {
    match submission {
        Submission::Collected { lines } => vec![
            "collected".to_string(),
            "-".to_string(),
            lines.to_string(),
            "-".to_string(),
        ],
        Submission::Started {
            job,
            server_path,
            lines,
        } => vec![
            "started".to_string(),
            job.clone(),
            lines.to_string(),
            server_path.clone(),
        ],
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}
