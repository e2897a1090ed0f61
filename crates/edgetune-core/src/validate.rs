//! Validation report: read-only checks of a tuned device.
//!
//! The checks read the live system through `FileSystem` and take the
//! diagnostics endpoint result from the caller, which owns the HTTP client.

use std::fmt;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::{FileSystem, Layout};
use crate::probe::{ReportSnapshot, swap_active};
use crate::state::InstallState;
use crate::util::write_atomic;

/// Temperature above which the SoC is reported as running hot.
const HOT_CELSIUS: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Warn => "WARN",
            CheckStatus::Fail => "FAIL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl Check {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

/// What the diagnostics endpoint answered.
#[derive(Debug, Clone)]
pub enum EndpointResult {
    Report(ReportSnapshot),
    /// Non-200 answer with its JSON `error` code.
    Error { status: u16, code: String },
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<Check>,
    pub diagnostics: Option<ReportSnapshot>,
}

impl ValidationReport {
    pub fn build(
        fs: &dyn FileSystem,
        layout: &Layout,
        state: Option<&InstallState>,
        endpoint: Option<EndpointResult>,
    ) -> Self {
        let mut checks = vec![
            check_state(state),
            check_swapfile(fs, layout, state),
            check_zram(fs, layout),
            check_swappiness(fs, layout, state),
        ];

        let mut diagnostics = None;
        if let Some(result) = endpoint {
            match result {
                EndpointResult::Report(snapshot) => {
                    checks.push(Check::new(
                        "diagnostics_endpoint",
                        CheckStatus::Pass,
                        "report served",
                    ));
                    checks.push(check_thermal(&snapshot));
                    diagnostics = Some(snapshot);
                }
                EndpointResult::Error { status: 429, code } => checks.push(Check::new(
                    "diagnostics_endpoint",
                    CheckStatus::Warn,
                    format!("429 {code}"),
                )),
                EndpointResult::Error { status, code } => checks.push(Check::new(
                    "diagnostics_endpoint",
                    CheckStatus::Fail,
                    format!("{status} {code}"),
                )),
                EndpointResult::Unreachable(why) => checks.push(Check::new(
                    "diagnostics_endpoint",
                    CheckStatus::Fail,
                    why,
                )),
            }
        }

        Self {
            timestamp: Utc::now(),
            checks,
            diagnostics,
        }
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    /// `true` unless a check failed.
    pub fn passed(&self) -> bool {
        self.count(CheckStatus::Fail) == 0
    }

    /// Human-readable summary, one line per check.
    pub fn summary(&self) -> String {
        let mut out = format!("edgetune validation {}\n", self.timestamp.to_rfc3339());
        for check in &self.checks {
            out.push_str(&format!("[{}] {}: {}\n", check.status, check.name, check.detail));
        }
        out.push_str(&format!(
            "{} passed, {} warnings, {} failed\n",
            self.count(CheckStatus::Pass),
            self.count(CheckStatus::Warn),
            self.count(CheckStatus::Fail)
        ));
        out
    }

    /// Writes the JSON report and the summary (host paths).
    pub fn save(&self, json_path: &Path, summary_path: &Path) -> io::Result<()> {
        let mut json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        json.push(b'\n');
        write_atomic(json_path, &json)?;
        write_atomic(summary_path, self.summary().as_bytes())
    }
}

fn check_state(state: Option<&InstallState>) -> Check {
    match state {
        Some(s) => Check::new(
            "install_state",
            CheckStatus::Pass,
            format!("installed {} on {}", s.timestamp.to_rfc3339(), s.device_model),
        ),
        None => Check::new("install_state", CheckStatus::Fail, "no install state"),
    }
}

fn check_swapfile(fs: &dyn FileSystem, layout: &Layout, state: Option<&InstallState>) -> Check {
    let Some(state) = state else {
        return Check::new("swapfile_active", CheckStatus::Warn, "no install state");
    };
    if swap_active(fs, layout, &state.swapfile_path) {
        Check::new(
            "swapfile_active",
            CheckStatus::Pass,
            format!("{} active", state.swapfile_path.display()),
        )
    } else {
        Check::new(
            "swapfile_active",
            CheckStatus::Fail,
            format!("{} not in /proc/swaps", state.swapfile_path.display()),
        )
    }
}

fn check_zram(fs: &dyn FileSystem, layout: &Layout) -> Check {
    if fs.exists(&layout.host_path("/sys/block/zram0")) {
        Check::new("zram_device", CheckStatus::Pass, "/dev/zram0 present")
    } else {
        Check::new("zram_device", CheckStatus::Fail, "no zram device")
    }
}

fn check_swappiness(fs: &dyn FileSystem, layout: &Layout, state: Option<&InstallState>) -> Check {
    let live = match fs.read_to_string(&layout.host_path("/proc/sys/vm/swappiness")) {
        Ok(s) => match s.trim().parse::<u32>() {
            Ok(v) => v,
            Err(_) => return Check::new("swappiness", CheckStatus::Fail, "unparsable value"),
        },
        Err(e) => return Check::new("swappiness", CheckStatus::Fail, e.to_string()),
    };
    match state.map(|s| s.swappiness).filter(|v| *v > 0) {
        Some(expected) if expected == live => {
            Check::new("swappiness", CheckStatus::Pass, format!("vm.swappiness = {live}"))
        }
        Some(expected) => Check::new(
            "swappiness",
            CheckStatus::Warn,
            format!("vm.swappiness = {live}, expected {expected}"),
        ),
        None => Check::new("swappiness", CheckStatus::Warn, format!("vm.swappiness = {live}")),
    }
}

fn check_thermal(snapshot: &ReportSnapshot) -> Check {
    let thermal = &snapshot.thermal;
    if let Some(flags) = thermal.throttled_flags.value() {
        if flags.any_active() {
            return Check::new(
                "thermal",
                CheckStatus::Warn,
                format!("throttling active (0x{:x})", flags.raw),
            );
        }
    }
    match thermal.temp.value() {
        Some(t) if *t >= HOT_CELSIUS => {
            Check::new("thermal", CheckStatus::Warn, format!("{t:.1}°C"))
        }
        Some(t) => Check::new("thermal", CheckStatus::Pass, format!("{t:.1}°C")),
        None => Check::new("thermal", CheckStatus::Warn, "temperature unavailable"),
    }
}
