use std::io::{self, Write};

use serde::Serialize;

use crate::grouper::RejectedFile;
use crate::progress::{BatchState, BatchSummary};
use crate::session::UploadSession;
use crate::validator::ValidationReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &ValidationReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_session(session: &UploadSession) -> io::Result<()> {
        Self::print_json(session)
    }

    pub fn print_sessions(sessions: &[SessionListing]) -> io::Result<()> {
        Self::print_json(&sessions)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionListing {
    pub batch_id: String,
    pub created_at: String,
    pub samples: usize,
    pub succeeded: usize,
    pub failed: Vec<String>,
    pub summary: BatchSummary,
}

impl SessionListing {
    pub fn from_session(session: &UploadSession) -> Self {
        let state = BatchState::from_session(session);
        Self {
            batch_id: session.batch_id.clone(),
            created_at: session.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            samples: session.samples.len(),
            succeeded: state.succeeded(),
            failed: state.failed_samples(),
            summary: state.summary(),
        }
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_rejected(rejected: &[RejectedFile]) {
        for file in rejected {
            println!("{YELLOW}skipped {}: {}{RESET}", file.name, file.reason);
        }
    }

    pub fn print_report(report: &ValidationReport) {
        println!(
            "{CYAN}Pre-upload check ({}): {} of {} samples valid{RESET}",
            report.technology,
            report.valid_count(),
            report.samples.len()
        );
        for verdict in &report.samples {
            if verdict.valid {
                println!("{GREEN}  ok   {}{RESET}", verdict.sample);
                continue;
            }
            let reason = verdict
                .issue
                .as_ref()
                .map(|issue| issue.message.as_str())
                .unwrap_or("invalid");
            println!("{RED}  fail {}: {reason}{RESET}", verdict.sample);
            for result in verdict.files.iter().filter(|result| !result.is_valid) {
                let detail = result
                    .message
                    .clone()
                    .or_else(|| result.error.map(|kind| kind.describe().to_string()))
                    .unwrap_or_default();
                println!("{RED}         {}: {detail}{RESET}", result.file_name);
            }
        }
        for warning in &report.warnings {
            println!("{YELLOW}  note {}: {}{RESET}", warning.file_name, warning.kind.describe());
        }
        if report.invalid_bytes > 0 {
            println!(
                "{YELLOW}  {} excluded from upload{RESET}",
                format_bytes(report.invalid_bytes)
            );
        }
        if let Some(summary) = &report.summary {
            println!("{RED}{}{RESET}", summary.message);
        }
    }

    pub fn print_upload_summary(session: &UploadSession) {
        let state = BatchState::from_session(session);
        println!("{CYAN}Upload batch {}{RESET}", session.batch_id);
        for sample in &session.samples {
            match &sample.failure {
                Some(failure) => println!(
                    "{RED}  {} {} ({:?}): {}{RESET}",
                    sample.name, sample.status, failure.kind, failure.message
                ),
                None => println!(
                    "{GREEN}  {} {} ({}){RESET}",
                    sample.name,
                    sample.status,
                    format_bytes(sample.total_bytes())
                ),
            }
        }
        match state.summary() {
            BatchSummary::AllSucceeded => {
                println!("{GREEN}All {} samples uploaded.{RESET}", state.succeeded());
            }
            BatchSummary::PartialFailure => {
                println!(
                    "{YELLOW}{} uploaded, {} failed. Retry with: sample-upload resume {} --all-failed{RESET}",
                    state.succeeded(),
                    state.failed(),
                    session.batch_id
                );
            }
            BatchSummary::AllFailed => {
                println!(
                    "{RED}All {} samples failed. Retry with: sample-upload resume {} --all-failed{RESET}",
                    state.failed(),
                    session.batch_id
                );
            }
            BatchSummary::InProgress => {
                println!(
                    "{YELLOW}{} samples still pending.{RESET}",
                    state.in_progress()
                );
            }
        }
    }

    pub fn print_sessions(sessions: &[SessionListing]) {
        if sessions.is_empty() {
            println!("No upload sessions stored.");
            return;
        }
        for listing in sessions {
            let color = match listing.summary {
                BatchSummary::AllSucceeded => GREEN,
                BatchSummary::AllFailed => RED,
                _ => YELLOW,
            };
            println!(
                "{color}{}  {}  {}/{} uploaded{RESET}",
                listing.batch_id, listing.created_at, listing.succeeded, listing.samples
            );
            if !listing.failed.is_empty() {
                println!("{color}    failed: {}{RESET}", listing.failed.join(", "));
            }
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
