//! Reversal Engine: the `rollback` operation.
//!
//! Rollback consumes the `InstallState` and the current ledger generation.
//! Every step is best-effort and reported on its own; a failing step never
//! stops the ones after it. The state file is left on disk for inspection.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::InstallConfig;
use crate::host::{CommandRunner, CommandSpec, Layout, RealFs, is_privileged};
use crate::install::{SERVICE_TIMEOUT, fstab, read_uuid};
use crate::ledger::{BackupRecord, Ledger, LedgerError};
use crate::probe::swap_active;
use crate::state::{InstallState, StateError, StateStore};
use crate::util::{remove_path, write_atomic};

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("rollback must run as root")]
    NotPrivileged,
    #[error("no install state found; nothing safe to roll back")]
    NothingToRollBack,
    #[error("the last install has already been rolled back")]
    AlreadyRolledBack,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Done,
    Skipped(String),
    /// A safety guard declined the step.
    Refused(String),
    Failed(String),
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Done => write!(f, "done"),
            StepStatus::Skipped(why) => write!(f, "skipped: {why}"),
            StepStatus::Refused(why) => write!(f, "refused: {why}"),
            StepStatus::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    pub steps: Vec<StepReport>,
}

impl RollbackReport {
    fn record(&mut self, step: impl Into<String>, status: StepStatus) {
        let step = step.into();
        match &status {
            StepStatus::Done => info!(step = %step, "done"),
            StepStatus::Skipped(why) => info!(step = %step, reason = %why, "skipped"),
            StepStatus::Refused(why) => warn!(step = %step, reason = %why, "refused"),
            StepStatus::Failed(err) => warn!(step = %step, error = %err, "failed"),
        }
        self.steps.push(StepReport { step, status });
    }

    pub fn status_of(&self, step: &str) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.step == step).map(|s| &s.status)
    }

    pub fn failures(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed(_)))
            .count()
    }
}

pub struct Rollback<R: CommandRunner> {
    config: InstallConfig,
    runner: R,
    privileged: Option<bool>,
}

impl<R: CommandRunner> Rollback<R> {
    pub fn new(config: InstallConfig, runner: R) -> Self {
        Self {
            config,
            runner,
            privileged: None,
        }
    }

    /// Overrides the effective-UID check.
    pub fn assume_privileged(mut self, privileged: bool) -> Self {
        self.privileged = Some(privileged);
        self
    }

    fn layout(&self) -> &Layout {
        &self.config.layout
    }

    fn command(&self, spec: CommandSpec) -> StepStatus {
        match self.runner.run(&spec.timeout(SERVICE_TIMEOUT)) {
            Ok(_) => StepStatus::Done,
            Err(e) => StepStatus::Failed(e.to_string()),
        }
    }

    pub fn run(&self) -> Result<RollbackReport, RollbackError> {
        if !self.privileged.unwrap_or_else(is_privileged) {
            return Err(RollbackError::NotPrivileged);
        }
        let store = StateStore::new(self.layout().host_path(&self.config.state_file));
        let state = store.load()?.ok_or(RollbackError::NothingToRollBack)?;
        let mut ledger = Ledger::open(self.layout().host_path(&self.config.ledger_file))?;
        if !ledger.entries().is_empty() && !ledger.is_open() {
            return Err(RollbackError::AlreadyRolledBack);
        }
        info!(installed = %state.timestamp, "rolling back");

        let mut report = RollbackReport::default();
        self.stop_service(&state, &ledger, &mut report);

        let api_dir = self.layout().host_path(&state.api_install_dir);
        let status = match remove_path(&api_dir) {
            Ok(true) => StepStatus::Done,
            Ok(false) => StepStatus::Skipped("not present".into()),
            Err(e) => StepStatus::Failed(e.to_string()),
        };
        report.record(format!("remove {}", state.api_install_dir.display()), status);

        let late = [&self.config.sysctl_file, &self.config.zram_config];
        let backups: Vec<BackupRecord> = ledger
            .backups()
            .filter(|r| !late.contains(&&r.original_path))
            .cloned()
            .collect();
        for record in &backups {
            report.record(
                format!("restore {}", record.original_path.display()),
                self.restore(record),
            );
        }

        let swapfile = self.remove_swapfile(&state, &ledger);
        let fstab = match &swapfile {
            _ if !ledger.added_fstab_entry(&self.config.fstab, &state.swapfile_path) => {
                StepStatus::Skipped("entry predates install".into())
            }
            StepStatus::Done | StepStatus::Skipped(_) => {
                match self.remove_fstab_entry(&state.swapfile_path) {
                    Ok(true) => StepStatus::Done,
                    Ok(false) => StepStatus::Skipped("not present".into()),
                    Err(e) => StepStatus::Failed(e),
                }
            }
            StepStatus::Refused(_) | StepStatus::Failed(_) => {
                StepStatus::Refused("swapfile was kept".into())
            }
        };
        report.record(format!("remove swapfile {}", state.swapfile_path.display()), swapfile);
        report.record(format!("remove fstab entry {}", state.swapfile_path.display()), fstab);

        for path in late {
            let status = match ledger.backup_for(path) {
                Some(record) => self.restore(record),
                None => match remove_path(&self.layout().host_path(path)) {
                    Ok(true) => StepStatus::Done,
                    Ok(false) => StepStatus::Skipped("not present".into()),
                    Err(e) => StepStatus::Failed(e.to_string()),
                },
            };
            report.record(format!("revert {}", path.display()), status);
        }
        report.record(
            "reload sysctl",
            self.command(CommandSpec::new("sysctl").arg("--system")),
        );
        report.record(
            format!("restart {}", self.config.zram_service),
            self.command(CommandSpec::new("systemctl").args(["restart", &self.config.zram_service])),
        );

        ledger.close_generation()?;
        info!(failures = report.failures(), "rollback complete");
        Ok(report)
    }

    fn stop_service(&self, state: &InstallState, ledger: &Ledger, report: &mut RollbackReport) {
        let unit_name = format!("{}.service", state.api_service_name);
        report.record(
            format!("stop {unit_name}"),
            self.command(CommandSpec::new("systemctl").args(["stop", &unit_name])),
        );
        report.record(
            format!("disable {unit_name}"),
            self.command(CommandSpec::new("systemctl").args(["disable", &unit_name])),
        );

        let unit: PathBuf = self.config.unit_dir.join(&unit_name);
        let status = if ledger.backup_for(&unit).is_some() {
            StepStatus::Skipped("original restored from backup".into())
        } else {
            match remove_path(&self.layout().host_path(&unit)) {
                Ok(true) => StepStatus::Done,
                Ok(false) => StepStatus::Skipped("not present".into()),
                Err(e) => StepStatus::Failed(e.to_string()),
            }
        };
        report.record(format!("remove {}", unit.display()), status);
        report.record(
            "daemon-reload",
            self.command(CommandSpec::new("systemctl").arg("daemon-reload")),
        );
    }

    /// Puts the backup back at its original path, replacing whatever lives there.
    fn restore(&self, record: &BackupRecord) -> StepStatus {
        let live = self.layout().host_path(&record.original_path);
        let backup = self.layout().host_path(&record.backup_path);
        if !backup.exists() {
            return StepStatus::Skipped(format!("backup {} missing", record.backup_path.display()));
        }
        if let Err(e) = remove_path(&live) {
            return StepStatus::Failed(e.to_string());
        }
        match fs::rename(&backup, &live) {
            Ok(()) => StepStatus::Done,
            Err(e) => StepStatus::Failed(e.to_string()),
        }
    }

    /// Deactivates and deletes the swapfile only if install created it and it
    /// still carries the recorded UUID.
    fn remove_swapfile(&self, state: &InstallState, ledger: &Ledger) -> StepStatus {
        if !ledger.was_created(&state.swapfile_path) {
            return StepStatus::Skipped("pre-existing swapfile".into());
        }
        let host = self.layout().host_path(&state.swapfile_path);
        if !host.exists() {
            return StepStatus::Refused("swapfile no longer exists".into());
        }
        let current = match read_uuid(&self.runner, &host) {
            Some(uuid) => uuid,
            None => return StepStatus::Refused("cannot read current UUID".into()),
        };
        if current != state.swapfile_uuid {
            return StepStatus::Refused(format!(
                "UUID {current} does not match recorded {}",
                state.swapfile_uuid
            ));
        }

        if swap_active(&RealFs, self.layout(), &state.swapfile_path) {
            if let Err(e) = self.runner.run(&CommandSpec::new("swapoff").path_arg(&host)) {
                return StepStatus::Failed(e.to_string());
            }
        }
        match fs::remove_file(&host) {
            Ok(()) => StepStatus::Done,
            Err(e) => StepStatus::Failed(e.to_string()),
        }
    }

    /// Returns `false` when the line was already gone.
    fn remove_fstab_entry(&self, swapfile: &Path) -> Result<bool, String> {
        let host = self.layout().host_path(&self.config.fstab);
        let current = match fs::read_to_string(&host) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(format!("{}: {e}", host.display())),
        };
        match fstab::without_entry(&current, swapfile) {
            Some(updated) => write_atomic(&host, updated.as_bytes())
                .map(|()| true)
                .map_err(|e| format!("{}: {e}", host.display())),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::fixture::{self, Fixture};
    use std::collections::BTreeMap;

    fn rollback(fx: &Fixture) -> Rollback<crate::host::MockRunner> {
        Rollback::new(fx.config.clone(), fx.runner.clone()).assume_privileged(true)
    }

    /// Snapshot without the state file and ledger, which rollback keeps.
    fn system_files(fx: &Fixture) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut files = fx.snapshot();
        files.retain(|path, _| !path.starts_with("var/lib/edgetune"));
        files
    }

    #[test]
    fn test_rollback_restores_pre_install_bytes() {
        let fx = Fixture::new();
        let before = system_files(&fx);
        fx.installer().run().unwrap();
        assert_ne!(system_files(&fx), before);

        let report = rollback(&fx).run().unwrap();
        assert_eq!(report.failures(), 0, "{:?}", report.steps);
        assert_eq!(system_files(&fx), before);
        assert_eq!(
            fs::read_to_string(fx.host("/etc/default/zramswap")).unwrap(),
            fixture::ORIGINAL_ZRAM
        );
        assert_eq!(
            fs::read_to_string(fx.host("/etc/fstab")).unwrap(),
            fixture::ORIGINAL_FSTAB
        );
        // State file stays for inspection
        assert!(fx.store().load().unwrap().is_some());
        assert!(!fx.ledger().is_open());
    }

    #[test]
    fn test_rollback_restores_preexisting_api_dir() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.host("/opt/edgetune")).unwrap();
        fs::write(fx.host("/opt/edgetune/config.toml"), "mine").unwrap();
        let before = system_files(&fx);

        fx.installer().run().unwrap();
        rollback(&fx).run().unwrap();
        assert_eq!(system_files(&fx), before);
    }

    #[test]
    fn test_uuid_mismatch_keeps_swapfile_and_fstab() {
        let fx = Fixture::new();
        fx.installer().run().unwrap();
        let fstab_installed = fs::read_to_string(fx.host("/etc/fstab")).unwrap();

        fx.runner.succeed("blkid", "5b1e2f00-0000-4000-8000-000000000000\n");
        let report = rollback(&fx).run().unwrap();

        assert!(matches!(
            report.status_of("remove swapfile /swapfile"),
            Some(StepStatus::Refused(_))
        ));
        assert!(matches!(
            report.status_of("remove fstab entry /swapfile"),
            Some(StepStatus::Refused(_))
        ));
        assert!(fx.host("/swapfile").exists());
        assert_eq!(fs::read_to_string(fx.host("/etc/fstab")).unwrap(), fstab_installed);
        assert_eq!(fx.runner.count("swapoff"), 0);
        assert!(fs::read_to_string(fx.host("/proc/swaps")).unwrap().contains("/swapfile"));
        // Other steps still ran
        assert_eq!(
            fs::read_to_string(fx.host("/etc/default/zramswap")).unwrap(),
            fixture::ORIGINAL_ZRAM
        );
    }

    #[test]
    fn test_matching_uuid_deactivates_before_delete() {
        let fx = Fixture::new();
        fx.installer().run().unwrap();
        assert!(fs::read_to_string(fx.host("/proc/swaps")).unwrap().contains("/swapfile"));

        let report = rollback(&fx).run().unwrap();
        assert_eq!(report.status_of("remove swapfile /swapfile"), Some(&StepStatus::Done));
        assert_eq!(fx.runner.count("swapoff"), 1);
        assert_eq!(
            fs::read_to_string(fx.host("/proc/swaps")).unwrap(),
            fixture::SWAPS_HEADER
        );
    }

    #[test]
    fn test_preexisting_swapfile_and_fstab_line_survive() {
        let fx = Fixture::new();
        let fstab = format!("{}/swapfile none swap sw 0 0\n", fixture::ORIGINAL_FSTAB);
        fs::write(fx.host("/etc/fstab"), &fstab).unwrap();
        fs::write(fx.host("/swapfile"), b"user swap").unwrap();
        let mut before = system_files(&fx);

        fx.installer().run().unwrap();
        let report = rollback(&fx).run().unwrap();

        assert_eq!(
            report.status_of("remove swapfile /swapfile"),
            Some(&StepStatus::Skipped("pre-existing swapfile".into()))
        );
        assert_eq!(
            report.status_of("remove fstab entry /swapfile"),
            Some(&StepStatus::Skipped("entry predates install".into()))
        );
        assert_eq!(fx.runner.count("swapoff"), 0);
        assert_eq!(fs::read(fx.host("/swapfile")).unwrap(), b"user swap");
        assert_eq!(fs::read_to_string(fx.host("/etc/fstab")).unwrap(), fstab);
        // Install activated it; it stays active for the user's fstab line.
        let mut after = system_files(&fx);
        after.remove(Path::new("proc/swaps"));
        before.remove(Path::new("proc/swaps"));
        assert_eq!(after, before);
    }

    #[test]
    fn test_preexisting_swapfile_keeps_file_drops_added_line() {
        let fx = Fixture::new();
        fs::write(fx.host("/swapfile"), b"user swap").unwrap();

        fx.installer().run().unwrap();
        assert!(fx.ledger().added_fstab_entry(Path::new("/etc/fstab"), Path::new("/swapfile")));
        let report = rollback(&fx).run().unwrap();

        assert_eq!(
            report.status_of("remove fstab entry /swapfile"),
            Some(&StepStatus::Done)
        );
        assert!(fx.host("/swapfile").exists());
        assert_eq!(
            fs::read_to_string(fx.host("/etc/fstab")).unwrap(),
            fixture::ORIGINAL_FSTAB
        );
    }

    #[test]
    fn test_missing_state_mutates_nothing() {
        let fx = Fixture::new();
        let before = fx.snapshot();
        let err = rollback(&fx).run().unwrap_err();
        assert!(matches!(err, RollbackError::NothingToRollBack));
        assert_eq!(fx.snapshot(), before);
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn test_second_rollback_is_refused() {
        let fx = Fixture::new();
        fx.installer().run().unwrap();
        rollback(&fx).run().unwrap();

        let calls = fx.runner.calls().len();
        let before = fx.snapshot();
        let err = rollback(&fx).run().unwrap_err();
        assert!(matches!(err, RollbackError::AlreadyRolledBack));
        assert_eq!(fx.runner.calls().len(), calls);
        assert_eq!(fx.snapshot(), before);
    }

    #[test]
    fn test_failing_step_does_not_stop_later_ones() {
        let fx = Fixture::new();
        fx.installer().run().unwrap();
        fx.runner.fail("systemctl", "unit not loaded");

        let report = rollback(&fx).run().unwrap();
        assert!(matches!(
            report.status_of("stop edgetune-perf.service"),
            Some(StepStatus::Failed(_))
        ));
        assert_eq!(report.status_of("remove /opt/edgetune"), Some(&StepStatus::Done));
        assert!(!fx.host("/swapfile").exists());
        assert!(!fx.host("/etc/sysctl.d/99-edgetune.conf").exists());
    }

    #[test]
    fn test_reinstall_after_rollback_opens_new_generation() {
        let fx = Fixture::new();
        fx.installer().run().unwrap();
        rollback(&fx).run().unwrap();
        fx.installer().run().unwrap();

        let ledger = fx.ledger();
        assert!(ledger.is_open());
        assert_eq!(ledger.backups().count(), 1);
        rollback(&fx).run().unwrap();
        assert_eq!(
            fs::read_to_string(fx.host("/etc/default/zramswap")).unwrap(),
            fixture::ORIGINAL_ZRAM
        );
    }
}
