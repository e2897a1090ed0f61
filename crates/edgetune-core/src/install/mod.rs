//! Mutation Engine: the `install` operation.
//!
//! The installer derives a tuning plan from the device's RAM, applies it as a
//! sequence of idempotent `Change`s through the `MutationEngine`, and writes
//! the `InstallState` only after every essential change succeeded.
//!
//! ```text
//! precondition ─► detect device ─► plan ─► already-installed check
//!                                             │
//!   zram config, zram restart, swapfile, fstab, sysctl, sysctl reload,
//!   api dir, unit file, daemon-reload, enable --now
//!                                             │
//!                                    InstallState (last)
//! ```

mod change;
#[cfg(test)]
pub(crate) mod fixture;
pub mod fstab;

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::InstallConfig;
use crate::host::{CommandRunner, CommandSpec, FileSystem, Layout, RealFs, is_privileged};
use crate::ledger::{Ledger, LedgerError};
use crate::probe::parser;
use crate::state::{InstallState, StateError, StateStore};

pub use change::{Change, ChangeOutcome, MutationEngine, MutationError, read_uuid};

/// Limit for service-manager and sysctl invocations.
pub(crate) const SERVICE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("install must run as root")]
    NotPrivileged,
    #[error("already installed with a different configuration ({0}); roll back first")]
    AlreadyInstalled(String),
    #[error("cannot detect device: {0}")]
    DeviceDetection(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("{step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: MutationError,
    },
}

/// Hardware facts the plan is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub total_ram_mb: u64,
}

impl DeviceInfo {
    pub fn detect(fs: &dyn FileSystem, layout: &Layout) -> Result<Self, InstallError> {
        let model = fs
            .read_to_string(&layout.host_path("/proc/device-tree/model"))
            .ok()
            .and_then(|s| parser::parse_device_model(&s))
            .unwrap_or_else(|| "unknown".to_string());
        let meminfo = fs
            .read_to_string(&layout.host_path("/proc/meminfo"))
            .map_err(|e| InstallError::DeviceDetection(format!("/proc/meminfo: {e}")))?;
        let total_kb = parser::parse_meminfo_total_kb(&meminfo)
            .ok_or_else(|| InstallError::DeviceDetection("no MemTotal in /proc/meminfo".into()))?;
        Ok(Self {
            model,
            total_ram_mb: total_kb / 1024,
        })
    }
}

/// Sizes derived from total RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningPlan {
    pub zram_percent: u32,
    pub swapfile_size_mb: u64,
}

impl TuningPlan {
    pub fn for_ram(total_ram_mb: u64) -> Self {
        let (zram_percent, swapfile_size_mb) = match total_ram_mb {
            0..=1024 => (75, 2048),
            1025..=2048 => (50, 2048),
            2049..=4096 => (50, 1024),
            _ => (25, 1024),
        };
        Self {
            zram_percent,
            swapfile_size_mb,
        }
    }

    fn with_overrides(self, config: &InstallConfig) -> Self {
        Self {
            zram_percent: config.zram_percent.unwrap_or(self.zram_percent),
            swapfile_size_mb: config.swapfile_size_mb.unwrap_or(self.swapfile_size_mb),
        }
    }
}

/// Result of a completed install.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub state: InstallState,
    pub applied: usize,
    pub unchanged: usize,
    /// Best-effort steps that failed.
    pub warnings: Vec<String>,
}

pub struct Installer<R: CommandRunner> {
    config: InstallConfig,
    runner: R,
    privileged: Option<bool>,
}

impl<R: CommandRunner> Installer<R> {
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

    pub fn run(&self) -> Result<InstallReport, InstallError> {
        if !self.privileged.unwrap_or_else(is_privileged) {
            return Err(InstallError::NotPrivileged);
        }
        let config = &self.config;
        let layout = &config.layout;

        let device = DeviceInfo::detect(&RealFs, layout)?;
        let plan = TuningPlan::for_ram(device.total_ram_mb).with_overrides(config);
        info!(
            model = %device.model,
            ram_mb = device.total_ram_mb,
            zram_percent = plan.zram_percent,
            swapfile_mb = plan.swapfile_size_mb,
            "tuning plan"
        );

        let store = StateStore::new(layout.host_path(&config.state_file));
        let mut ledger = Ledger::open(layout.host_path(&config.ledger_file))?;
        // A state file older than the open generation belongs to a rolled-back install.
        let previous = store.load()?.filter(|prev| {
            ledger.is_open()
                && ledger
                    .generation_started_at()
                    .is_none_or(|started| prev.timestamp >= started)
        });
        if let Some(prev) = &previous {
            let mut diffs = Vec::new();
            if prev.swapfile_path != config.swapfile {
                diffs.push(format!("swapfile {}", prev.swapfile_path.display()));
            }
            if prev.zram_percent != plan.zram_percent {
                diffs.push(format!("zram {}%", prev.zram_percent));
            }
            if prev.api_install_dir != config.api_install_dir {
                diffs.push(format!("api dir {}", prev.api_install_dir.display()));
            }
            if !diffs.is_empty() {
                return Err(InstallError::AlreadyInstalled(diffs.join(", ")));
            }
            info!("existing install matches plan, re-applying");
        }

        if ledger.begin_generation()? {
            info!(ledger = %ledger.path().display(), "opened ledger generation");
        }

        let mut report = InstallReport {
            state: InstallState {
                timestamp: Utc::now(),
                device_model: device.model,
                total_ram_mb: device.total_ram_mb,
                zram_percent: plan.zram_percent,
                swapfile_path: config.swapfile.clone(),
                swapfile_uuid: String::new(),
                swapfile_size_mb: plan.swapfile_size_mb,
                swappiness: config.swappiness,
                api_install_dir: config.api_install_dir.clone(),
                api_service_name: config.api_service_name.clone(),
            },
            applied: 0,
            unchanged: 0,
            warnings: Vec::new(),
        };

        let mut engine = MutationEngine::new(layout, &mut ledger, &self.runner);
        for change in self.changes(&plan) {
            match engine.apply(&change) {
                Ok(ChangeOutcome::Unchanged) => report.unchanged += 1,
                Ok(ChangeOutcome::Applied) => report.applied += 1,
                Ok(ChangeOutcome::Swap { uuid, created }) => {
                    info!(uuid = %uuid, created, "swapfile active");
                    report.state.swapfile_uuid = uuid;
                    report.applied += 1;
                }
                Err(source) if change.is_essential() => {
                    return Err(InstallError::Step {
                        step: change.to_string(),
                        source,
                    });
                }
                Err(e) => {
                    warn!(step = %change, error = %e, "best-effort step failed");
                    report.warnings.push(format!("{change}: {e}"));
                }
            }
        }

        if let Some(prev) = previous.filter(|p| p.same_install(&report.state)) {
            report.state.timestamp = prev.timestamp;
        }
        store.save(&report.state)?;
        info!(state = %store.path().display(), "install complete");
        Ok(report)
    }

    /// The ordered change list for `plan`.
    pub fn changes(&self, plan: &TuningPlan) -> Vec<Change> {
        let config = &self.config;
        let systemctl = |args: &[&str]| {
            Change::Run(
                CommandSpec::new("systemctl")
                    .args(args)
                    .timeout(SERVICE_TIMEOUT),
            )
        };
        let unit_name = format!("{}.service", config.api_service_name);

        vec![
            Change::WriteFile {
                path: config.zram_config.clone(),
                contents: zram_config(config, plan),
                mode: Some(0o644),
            },
            systemctl(&["restart", &config.zram_service]),
            Change::Swapfile {
                path: config.swapfile.clone(),
                size_mb: plan.swapfile_size_mb,
            },
            Change::FstabEntry {
                fstab: config.fstab.clone(),
                swapfile: config.swapfile.clone(),
                priority: config.swapfile_priority,
            },
            Change::WriteFile {
                path: config.sysctl_file.clone(),
                contents: sysctl_config(config),
                mode: Some(0o644),
            },
            Change::Run(
                CommandSpec::new("sysctl")
                    .arg("--system")
                    .timeout(SERVICE_TIMEOUT),
            ),
            Change::InstallDir {
                dir: config.api_install_dir.clone(),
                files: vec![config.api_binary.clone()],
            },
            Change::WriteFile {
                path: config.unit_file(),
                contents: unit_file(config),
                mode: Some(0o644),
            },
            systemctl(&["daemon-reload"]),
            systemctl(&["enable", "--now", &unit_name]),
        ]
    }
}

fn zram_config(config: &InstallConfig, plan: &TuningPlan) -> String {
    format!(
        "# Managed by edgetune\nALGO={}\nPERCENT={}\nPRIORITY={}\n",
        config.zram_algorithm, plan.zram_percent, config.zram_priority
    )
}

fn sysctl_config(config: &InstallConfig) -> String {
    format!(
        "# Managed by edgetune\nvm.swappiness = {}\nvm.vfs_cache_pressure = {}\nvm.page-cluster = 0\n",
        config.swappiness, config.vfs_cache_pressure
    )
}

fn unit_file(config: &InstallConfig) -> String {
    let exec = config.installed_binary();
    format!(
        "[Unit]\n\
         Description=edgetune diagnostics service\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={} --listen {} --cache-file {}\n\
         Restart=on-failure\n\
         Environment=RUST_LOG=info\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exec.display(),
        config.api_listen,
        config.cache_file.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockRunner;
    use crate::ledger::LedgerEntry;
    use super::fixture::{self, Fixture};
    use std::fs;
    use std::path::{Path, PathBuf};

    #[test]
    fn test_plan_table() {
        assert_eq!(TuningPlan::for_ram(512), TuningPlan { zram_percent: 75, swapfile_size_mb: 2048 });
        assert_eq!(TuningPlan::for_ram(1024), TuningPlan { zram_percent: 75, swapfile_size_mb: 2048 });
        assert_eq!(TuningPlan::for_ram(1848), TuningPlan { zram_percent: 50, swapfile_size_mb: 2048 });
        assert_eq!(TuningPlan::for_ram(3906), TuningPlan { zram_percent: 50, swapfile_size_mb: 1024 });
        assert_eq!(TuningPlan::for_ram(7812), TuningPlan { zram_percent: 25, swapfile_size_mb: 1024 });
    }

    #[test]
    fn test_detect_device() {
        let fx = Fixture::new();
        let info = DeviceInfo::detect(&RealFs, &fx.config.layout).unwrap();
        assert_eq!(info.model, "Raspberry Pi 4 Model B Rev 1.5");
        assert_eq!(info.total_ram_mb, 1848);

        fs::remove_file(fx.host("/proc/device-tree/model")).unwrap();
        let info = DeviceInfo::detect(&RealFs, &fx.config.layout).unwrap();
        assert_eq!(info.model, "unknown");
    }

    #[test]
    fn test_install_writes_state_last_and_complete() {
        let fx = Fixture::new();
        let report = fx.installer().run().unwrap();

        let state = fx.store().load().unwrap().unwrap();
        assert_eq!(state, report.state);
        assert_eq!(state.zram_percent, 50);
        assert_eq!(state.swapfile_size_mb, 2048);
        assert_eq!(state.swapfile_uuid, fixture::UUID);
        assert!(report.warnings.is_empty());

        assert!(fs::read_to_string(fx.host("/etc/default/zramswap")).unwrap().contains("PERCENT=50"));
        assert!(fs::read_to_string(fx.host("/etc/fstab")).unwrap().contains("/swapfile none swap"));
        assert!(fx.host("/opt/edgetune/edgetune-web").exists());
        assert!(fx.host("/etc/systemd/system/edgetune-perf.service").exists());
        assert_eq!(fx.runner.count_with("systemctl", "enable"), 1);
    }

    #[test]
    fn test_install_twice_is_idempotent() {
        let fx = Fixture::new();
        let first = fx.installer().run().unwrap();
        let second = fx.installer().run().unwrap();

        assert_eq!(first.state, second.state);
        assert_eq!(fx.store().load().unwrap(), Some(first.state));
        assert_eq!(fx.runner.count("fallocate"), 1);

        let ledger = fx.ledger();
        let generations = ledger
            .entries()
            .iter()
            .filter(|e| matches!(e, LedgerEntry::Generation(_)))
            .count();
        assert_eq!(generations, 1);
        // zramswap was the only pre-existing file
        let backups: Vec<_> = ledger.backups().map(|r| r.original_path.clone()).collect();
        assert_eq!(backups, vec![PathBuf::from("/etc/default/zramswap")]);
        assert_eq!(
            fs::read_to_string(fx.host("/etc/default/zramswap.bak")).unwrap(),
            fixture::ORIGINAL_ZRAM
        );
        assert!(!fx.host("/etc/default/zramswap.bak.bak").exists());
        let fstab = fs::read_to_string(fx.host("/etc/fstab")).unwrap();
        assert_eq!(fstab.matches("/swapfile").count(), 1);
    }

    #[test]
    fn test_not_privileged_mutates_nothing() {
        let fx = Fixture::new();
        let before = fx.snapshot();
        let err = fx.installer().assume_privileged(false).run().unwrap_err();
        assert!(matches!(err, InstallError::NotPrivileged));
        assert_eq!(fx.snapshot(), before);
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn test_differing_reinstall_is_refused() {
        let mut fx = Fixture::new();
        fx.installer().run().unwrap();
        fx.config.zram_percent = Some(25);
        let err = fx.installer().run().unwrap_err();
        assert!(matches!(err, InstallError::AlreadyInstalled(_)));
        assert_eq!(fx.store().load().unwrap().unwrap().zram_percent, 50);
    }

    #[test]
    fn test_failed_install_after_rollback_does_not_pin_old_plan() {
        let mut fx = Fixture::new();
        fx.installer().run().unwrap();
        crate::rollback::Rollback::new(fx.config.clone(), fx.runner.clone())
            .assume_privileged(true)
            .run()
            .unwrap();

        // Opens a generation but dies before writing state
        fx.runner.fail("blkid", "no such device");
        assert!(matches!(fx.installer().run(), Err(InstallError::Step { .. })));
        assert!(fx.ledger().is_open());
        assert_eq!(fx.store().load().unwrap().unwrap().zram_percent, 50);

        fx.runner.succeed("blkid", &format!("{}\n", fixture::UUID));
        fx.config.zram_percent = Some(25);
        let report = fx.installer().run().unwrap();
        assert_eq!(report.state.zram_percent, 25);
        assert_eq!(fx.store().load().unwrap().unwrap().zram_percent, 25);
    }

    #[test]
    fn test_essential_failure_leaves_no_state() {
        let fx = Fixture::new();
        fx.runner.fail("blkid", "no such device");
        let err = fx.installer().run().unwrap_err();
        assert!(matches!(err, InstallError::Step { .. }));
        assert!(fx.store().load().unwrap().is_none());
        // Later steps never ran
        assert!(!fx.host("/etc/sysctl.d/99-edgetune.conf").exists());
    }

    #[test]
    fn test_best_effort_failure_continues() {
        let fx = Fixture::new();
        fx.runner.fail("sysctl", "permission denied");
        let report = fx.installer().run().unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("sysctl --system"));
        assert!(fx.store().load().unwrap().is_some());
    }

    #[test]
    fn test_missing_binary_aborts() {
        let mut fx = Fixture::new();
        fx.config.api_binary = Path::new("/nonexistent/edgetune-web").to_path_buf();
        let err = fx.installer().run().unwrap_err();
        assert!(matches!(err, InstallError::Step { .. }));
        assert!(fx.store().load().unwrap().is_none());
    }

    #[test]
    fn test_unit_file_points_at_installed_binary() {
        let fx = Fixture::new();
        let installer = Installer::new(fx.config.clone(), MockRunner::new());
        let changes = installer.changes(&TuningPlan::for_ram(1848));
        assert_eq!(changes.len(), 10);
        let unit = changes
            .iter()
            .find_map(|c| match c {
                Change::WriteFile { path, contents, .. } if path.ends_with("edgetune-perf.service") => {
                    Some(contents.clone())
                }
                _ => None,
            })
            .unwrap();
        assert!(unit.contains("ExecStart=/opt/edgetune/edgetune-web --listen 0.0.0.0:8085"));
    }
}
