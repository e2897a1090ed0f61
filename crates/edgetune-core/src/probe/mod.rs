//! Probe runner: gathers a `ReportSnapshot` from the device.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────── Probe (trait) ──────────────────────────┐
//! │                                                                   │
//! │  SystemProbe<F, R>                     ExternalProbe<R>           │
//! │  - /etc/hostname, /proc/*, /sys/*      - external check command   │
//! │  - zramctl, vcgencmd (optional)        - writes report JSON file  │
//! │  - benchmark under a hard timeout      - file read back & parsed  │
//! │        │            │                          │                  │
//! │   FileSystem   CommandRunner              CommandRunner           │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `SystemProbe` never fails as a whole: a missing tool degrades its field to
//! `Probed::Unavailable`, a failing or timed-out one to `Probed::Failed`.

pub mod external;
pub mod model;
pub mod parser;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::host::{CommandError, CommandRunner, CommandSpec, FileSystem, Layout};

pub use external::ExternalProbe;
pub use model::{CpuFreq, Probed, ReportSnapshot, SwapDevice, Thermal, ThrottleFlags};

/// Timeout for the small inspection tools (`zramctl`, `vcgencmd`, `hostname`).
const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Tool invocations per run, counting the `hostname` fallback.
const TOOL_CALLS: u32 = 4;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProbeError {
    /// The probe ran and reported failure.
    #[error("probe failed: {0}")]
    Failed(String),
    /// The probe outlived its hard timeout.
    #[error("probe timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),
    /// The probe reported success but left no readable report.
    #[error("probe produced no readable report: {0}")]
    NoReport(String),
}

/// Produces one report snapshot. Synchronous and potentially slow.
pub trait Probe: Send + Sync {
    fn run(&self) -> Result<ReportSnapshot, ProbeError>;
}

/// Probes the local device directly.
pub struct SystemProbe<F: FileSystem, R: CommandRunner> {
    fs: F,
    runner: R,
    layout: Layout,
    benchmark: Option<CommandSpec>,
}

impl<F: FileSystem, R: CommandRunner> SystemProbe<F, R> {
    pub fn new(fs: F, runner: R, layout: Layout) -> Self {
        Self {
            fs,
            runner,
            layout,
            benchmark: None,
        }
    }

    /// Enables the embedded benchmark, killed after `timeout`.
    pub fn with_benchmark(mut self, command: CommandSpec, timeout: Duration) -> Self {
        self.benchmark = Some(command.timeout(timeout));
        self
    }

    /// Worst-case wall time of one run: every tool and the benchmark hitting
    /// their timeouts.
    pub fn max_duration(&self) -> Duration {
        let benchmark = self
            .benchmark
            .as_ref()
            .and_then(|spec| spec.timeout)
            .unwrap_or_default();
        TOOL_TIMEOUT * TOOL_CALLS + benchmark
    }

    fn read(&self, path: &str) -> Result<String, std::io::Error> {
        self.fs.read_to_string(&self.layout.host_path(path))
    }

    fn read_probed<T>(&self, path: &str, parse: impl FnOnce(&str) -> Option<T>) -> Probed<T> {
        match self.read(path) {
            Ok(content) => match parse(&content) {
                Some(value) => Probed::available(value),
                None => Probed::failed(format!("unrecognised content in {path}")),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Probed::unavailable(format!("{path} not present"))
            }
            Err(e) => Probed::failed(format!("{path}: {e}")),
        }
    }

    fn tool(&self, spec: CommandSpec) -> Probed<String> {
        let spec = if spec.timeout.is_some() {
            spec
        } else {
            spec.timeout(TOOL_TIMEOUT)
        };
        match self.runner.run(&spec) {
            Ok(out) => Probed::available(out.stdout.trim_end().to_string()),
            Err(CommandError::NotFound { program }) => {
                Probed::unavailable(format!("{program} not installed"))
            }
            Err(e) => {
                debug!(command = %spec, error = %e, "probe tool failed");
                Probed::failed(e.to_string())
            }
        }
    }

    fn host(&self) -> Probed<String> {
        self.read_probed("/etc/hostname", |s| {
            let name = s.trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .or_else(|| self.tool(CommandSpec::new("hostname")))
    }

    fn cpu_freqs(&self) -> Probed<Vec<CpuFreq>> {
        let cpu_dir = self.layout.host_path("/sys/devices/system/cpu");
        let entries = match self.fs.read_dir(&cpu_dir) {
            Ok(entries) => entries,
            Err(_) => return Probed::unavailable("/sys/devices/system/cpu not present"),
        };

        let mut freqs: Vec<CpuFreq> = entries
            .iter()
            .filter_map(|path| {
                let cpu = parser::parse_cpu_index(path.file_name()?.to_str()?)?;
                let content = self
                    .fs
                    .read_to_string(&path.join("cpufreq/scaling_cur_freq"))
                    .ok()?;
                let mhz = parser::parse_cpu_freq_mhz(&content)?;
                Some(CpuFreq { cpu, mhz })
            })
            .collect();
        freqs.sort_by_key(|f| f.cpu);

        if freqs.is_empty() {
            Probed::unavailable("cpufreq not exposed")
        } else {
            Probed::available(freqs)
        }
    }

    fn zram_info(&self) -> Probed<String> {
        match self.tool(CommandSpec::new("zramctl")) {
            Probed::Available { value } if value.trim().is_empty() => {
                Probed::unavailable("no zram devices configured")
            }
            other => other,
        }
    }

    fn thermal(&self) -> Thermal {
        let vendor_temp = match self.tool(CommandSpec::new("vcgencmd").arg("measure_temp")) {
            Probed::Available { value } => match parser::parse_vcgencmd_temp(&value) {
                Some(t) => Probed::available(t),
                None => Probed::failed(format!("unrecognised vcgencmd output {value:?}")),
            },
            Probed::Unavailable { reason } => Probed::unavailable(reason),
            Probed::Failed { reason } => Probed::failed(reason),
        };
        let temp = vendor_temp.or_else(|| {
            self.read_probed(
                "/sys/class/thermal/thermal_zone0/temp",
                parser::parse_thermal_zone,
            )
        });

        let throttled_flags = match self.tool(CommandSpec::new("vcgencmd").arg("get_throttled")) {
            Probed::Available { value } => match parser::parse_throttled(&value) {
                Some(flags) => Probed::available(flags),
                None => Probed::failed(format!("unrecognised vcgencmd output {value:?}")),
            },
            Probed::Unavailable { reason } => Probed::unavailable(reason),
            Probed::Failed { reason } => Probed::failed(reason),
        };

        Thermal {
            temp,
            throttled_flags,
        }
    }

    fn benchmark(&self) -> Probed<String> {
        match &self.benchmark {
            Some(spec) => self.tool(spec.clone()),
            None => Probed::unavailable("benchmark disabled"),
        }
    }
}

impl<F: FileSystem, R: CommandRunner> Probe for SystemProbe<F, R> {
    fn run(&self) -> Result<ReportSnapshot, ProbeError> {
        let snapshot = ReportSnapshot {
            host: self.host(),
            kernel: self.read_probed("/proc/sys/kernel/osrelease", |s| {
                Some(s.trim().to_string()).filter(|k| !k.is_empty())
            }),
            ram_mb: self.read_probed("/proc/meminfo", |s| {
                parser::parse_meminfo_total_kb(s).map(|kb| kb / 1024)
            }),
            cpu_freqs: self.cpu_freqs(),
            zram_info: self.zram_info(),
            swap_info: self.read_probed("/proc/swaps", |s| Some(parser::parse_swaps(s))),
            thermal: self.thermal(),
            benchmark_output: self.benchmark(),
            timestamp: Utc::now(),
        };
        Ok(snapshot)
    }
}

/// `true` if `/proc/swaps` (under `layout`) lists `device` as active.
/// `device` is the logical path as the kernel lists it in `/proc/swaps`.
pub fn swap_active(fs: &dyn FileSystem, layout: &Layout, device: &Path) -> bool {
    fs.read_to_string(&layout.host_path("/proc/swaps"))
        .map(|content| {
            parser::parse_swaps(&content)
                .iter()
                .any(|s| Path::new(&s.name) == device)
        })
        .unwrap_or(false)
}
