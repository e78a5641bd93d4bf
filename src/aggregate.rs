//! Merging execution results into a report.

use std::process::ExitCode;

use crate::error::ErrorKind;
use crate::result::{ExecutionResult, Status};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    /// Position of the originating request.
    pub index: usize,
    pub target: String,
    pub status: Status,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub dispatch_errors: usize,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.dispatch_errors
    }
}

/// Ordered, complete view of one run, for whichever presentation consumes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    entries: Vec<ReportEntry>,
}

impl Report {
    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> Summary {
        self.entries
            .iter()
            .fold(Summary::default(), |mut summary, entry| {
                match entry.status {
                    Status::Succeeded => summary.succeeded += 1,
                    Status::Failed => summary.failed += 1,
                    Status::DispatchError => summary.dispatch_errors += 1,
                }
                summary
            })
    }

    pub fn all_succeeded(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.status == Status::Succeeded)
    }

    /// Non-zero as soon as one target failed or could not be dispatched to.
    pub fn exit_code(&self) -> ExitCode {
        if self.all_succeeded() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

/// Builds a report in input order. Output is copied whole, never truncated.
pub fn aggregate(results: &[ExecutionResult]) -> Report {
    let entries = results
        .iter()
        .enumerate()
        .map(|(index, result)| ReportEntry {
            index,
            target: result.resource().to_owned(),
            status: result.status(),
            exit_code: result.exit_code(),
            stdout: result.stdout().to_vec(),
            stderr: result.stderr().to_vec(),
            error_kind: result.error_kind(),
            error: result.error_detail().map(str::to_owned),
        })
        .collect();
    Report { entries }
}
