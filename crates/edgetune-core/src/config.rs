//! Configuration defaults for the installer, rollback and diagnostics service.
//!
//! Binaries build these from command-line flags (with environment fallbacks);
//! everything else in the library takes them by reference.

use std::path::PathBuf;
use std::time::Duration;

use crate::host::Layout;

pub const DEFAULT_STATE_FILE: &str = "/var/lib/edgetune/install-state.json";
pub const DEFAULT_LEDGER_FILE: &str = "/var/lib/edgetune/backups.log";
pub const DEFAULT_CACHE_FILE: &str = "/var/lib/edgetune/perf-report.json";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8085";

/// Paths and tunables used by `install` and `rollback`.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    /// Root prefix for every system path.
    pub layout: Layout,
    pub state_file: PathBuf,
    pub ledger_file: PathBuf,
    /// zram-tools configuration file.
    pub zram_config: PathBuf,
    /// Service restarted after the zram configuration changes.
    pub zram_service: String,
    pub zram_algorithm: String,
    pub zram_priority: i32,
    /// Overrides the RAM-derived zram percentage.
    pub zram_percent: Option<u32>,
    pub swapfile: PathBuf,
    /// Overrides the RAM-derived swapfile size.
    pub swapfile_size_mb: Option<u64>,
    pub swapfile_priority: i32,
    pub fstab: PathBuf,
    pub sysctl_file: PathBuf,
    pub swappiness: u32,
    pub vfs_cache_pressure: u32,
    /// Directory the diagnostics service binary is installed to.
    pub api_install_dir: PathBuf,
    /// Diagnostics service binary copied into `api_install_dir`.
    pub api_binary: PathBuf,
    pub api_service_name: String,
    pub api_listen: String,
    pub unit_dir: PathBuf,
    pub cache_file: PathBuf,
}

impl InstallConfig {
    /// Logical path of the diagnostics service unit.
    pub fn unit_file(&self) -> PathBuf {
        self.unit_dir.join(format!("{}.service", self.api_service_name))
    }

    /// Logical path of the installed diagnostics binary.
    pub fn installed_binary(&self) -> PathBuf {
        let name = self
            .api_binary
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "edgetune-web".into());
        self.api_install_dir.join(name)
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            ledger_file: PathBuf::from(DEFAULT_LEDGER_FILE),
            zram_config: PathBuf::from("/etc/default/zramswap"),
            zram_service: "zramswap".to_string(),
            zram_algorithm: "zstd".to_string(),
            zram_priority: 100,
            zram_percent: None,
            swapfile: PathBuf::from("/swapfile"),
            swapfile_size_mb: None,
            swapfile_priority: 10,
            fstab: PathBuf::from("/etc/fstab"),
            sysctl_file: PathBuf::from("/etc/sysctl.d/99-edgetune.conf"),
            swappiness: 100,
            vfs_cache_pressure: 50,
            api_install_dir: PathBuf::from("/opt/edgetune"),
            api_binary: PathBuf::from("/usr/local/bin/edgetune-web"),
            api_service_name: "edgetune-perf".to_string(),
            api_listen: DEFAULT_LISTEN.to_string(),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            cache_file: PathBuf::from(DEFAULT_CACHE_FILE),
        }
    }
}

/// Tunables for the diagnostics service.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Minimum spacing between accepted requests, across all clients.
    pub min_interval: Duration,
    /// Maximum age of a cached report.
    pub cache_ttl: Duration,
    /// Hard limit on a whole probe run.
    pub probe_timeout: Duration,
    /// Hard limit on the embedded benchmark.
    pub benchmark_timeout: Duration,
    /// Benchmark command line; `None` disables the benchmark.
    pub benchmark_command: Option<String>,
    /// Where each fresh report is persisted, if anywhere.
    pub cache_file: Option<PathBuf>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(120),
            benchmark_timeout: Duration::from_secs(60),
            benchmark_command: Some("sysbench cpu --time=5 run".to_string()),
            cache_file: None,
        }
    }
}
