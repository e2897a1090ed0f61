//! Probe that delegates to an external check command.
//!
//! The command is expected to write a `ReportSnapshot` as JSON to a known
//! file. A stale report is removed first so an old file is never served as
//! the result of a new run.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Probe, ProbeError, ReportSnapshot};
use crate::host::{CommandError, CommandRunner, CommandSpec};

pub struct ExternalProbe<R: CommandRunner> {
    runner: R,
    command: CommandSpec,
    report_file: PathBuf,
}

impl<R: CommandRunner> ExternalProbe<R> {
    /// `report_file` is a host path; `timeout` bounds the whole command.
    pub fn new(
        runner: R,
        command: CommandSpec,
        report_file: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            command: command.timeout(timeout),
            report_file: report_file.into(),
        }
    }
}

impl<R: CommandRunner> Probe for ExternalProbe<R> {
    fn run(&self) -> Result<ReportSnapshot, ProbeError> {
        match fs::remove_file(&self.report_file) {
            Ok(()) => debug!(path = %self.report_file.display(), "removed stale report"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.report_file.display(), error = %e, "cannot remove stale report"),
        }

        match self.runner.run(&self.command) {
            Ok(_) => {}
            Err(CommandError::TimedOut { timeout, .. }) => return Err(ProbeError::TimedOut(timeout)),
            Err(e) => return Err(ProbeError::Failed(e.to_string())),
        }

        let content = fs::read_to_string(&self.report_file).map_err(|e| {
            ProbeError::NoReport(format!("{}: {e}", self.report_file.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ProbeError::NoReport(format!("{}: {e}", self.report_file.display()))
        })
    }
}
