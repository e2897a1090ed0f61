//! Report snapshot model: one complete point-in-time view of the device.
//!
//! Every field fed by an optional source is a `Probed<T>`, so a degraded
//! reading is visible in the type (and on the wire) instead of being encoded
//! as a magic string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one capability-checked reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Probed<T> {
    Available { value: T },
    /// The source (tool, file) does not exist on this device.
    Unavailable { reason: String },
    /// The source exists but reading it failed or timed out.
    Failed { reason: String },
}

impl<T> Probed<T> {
    pub fn available(value: T) -> Self {
        Probed::Available { value }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Probed::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Probed::Failed {
            reason: reason.into(),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Probed::Available { value } => Some(value),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Probed::Available { .. })
    }

    /// Keeps `self` if available, otherwise evaluates `fallback`.
    pub fn or_else(self, fallback: impl FnOnce() -> Probed<T>) -> Probed<T> {
        match self {
            Probed::Available { .. } => self,
            _ => fallback(),
        }
    }
}

/// Top-level snapshot served by the diagnostics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct ReportSnapshot {
    /// When the probe finished.
    pub timestamp: DateTime<Utc>,
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub host: Probed<String>,
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub kernel: Probed<String>,
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub ram_mb: Probed<u64>,
    /// Current frequency per online CPU.
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub cpu_freqs: Probed<Vec<CpuFreq>>,
    /// `zramctl` table.
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub zram_info: Probed<String>,
    /// Active swap devices from `/proc/swaps`.
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub swap_info: Probed<Vec<SwapDevice>>,
    pub thermal: Thermal,
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub benchmark_output: Probed<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct CpuFreq {
    pub cpu: u32,
    pub mhz: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct SwapDevice {
    pub name: String,
    /// `partition` or `file`.
    pub kind: String,
    pub size_kb: u64,
    pub used_kb: u64,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct Thermal {
    /// SoC temperature in °C.
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub temp: Probed<f64>,
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub throttled_flags: Probed<ThrottleFlags>,
}

/// Decoded `vcgencmd get_throttled` bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct ThrottleFlags {
    pub raw: u32,
    pub under_voltage: bool,
    pub freq_capped: bool,
    pub throttled: bool,
    pub soft_temp_limit: bool,
    pub under_voltage_occurred: bool,
    pub freq_capping_occurred: bool,
    pub throttling_occurred: bool,
    pub soft_temp_limit_occurred: bool,
}

impl ThrottleFlags {
    pub fn from_raw(raw: u32) -> Self {
        let bit = |n: u32| raw & (1 << n) != 0;
        Self {
            raw,
            under_voltage: bit(0),
            freq_capped: bit(1),
            throttled: bit(2),
            soft_temp_limit: bit(3),
            under_voltage_occurred: bit(16),
            freq_capping_occurred: bit(17),
            throttling_occurred: bit(18),
            soft_temp_limit_occurred: bit(19),
        }
    }

    /// `true` if any current condition is active.
    pub fn any_active(&self) -> bool {
        self.raw & 0xF != 0
    }
}
