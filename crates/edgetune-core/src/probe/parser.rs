//! Parsers for `/proc`, `/sys` and vendor tool output.
//!
//! Pure functions over strings, so every format quirk can be pinned in a test.

use super::model::{SwapDevice, ThrottleFlags};

/// `MemTotal` from `/proc/meminfo`, in kB.
pub fn parse_meminfo_total_kb(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

/// Device-tree model string, with the trailing NUL stripped.
pub fn parse_device_model(content: &str) -> Option<String> {
    let model = content.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

/// Rows of `/proc/swaps` (header skipped).
pub fn parse_swaps(content: &str) -> Vec<SwapDevice> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            Some(SwapDevice {
                name: fields[0].to_string(),
                kind: fields[1].to_string(),
                size_kb: fields[2].parse().ok()?,
                used_kb: fields[3].parse().ok()?,
                priority: fields[4].parse().ok()?,
            })
        })
        .collect()
}

/// `temp=48.3'C` from `vcgencmd measure_temp`.
pub fn parse_vcgencmd_temp(output: &str) -> Option<f64> {
    output
        .trim()
        .strip_prefix("temp=")?
        .trim_end_matches("'C")
        .parse()
        .ok()
}

/// Millidegrees from `/sys/class/thermal/thermal_zone*/temp`.
pub fn parse_thermal_zone(content: &str) -> Option<f64> {
    content
        .trim()
        .parse::<i64>()
        .ok()
        .map(|milli| milli as f64 / 1000.0)
}

/// `throttled=0x50005` from `vcgencmd get_throttled`.
pub fn parse_throttled(output: &str) -> Option<ThrottleFlags> {
    let hex = output.trim().strip_prefix("throttled=")?;
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    u32::from_str_radix(hex, 16).ok().map(ThrottleFlags::from_raw)
}

/// kHz from `scaling_cur_freq`, converted to MHz.
pub fn parse_cpu_freq_mhz(content: &str) -> Option<u32> {
    content.trim().parse::<u64>().ok().map(|khz| (khz / 1000) as u32)
}

/// CPU index from a `/sys/devices/system/cpu/cpuN` directory name.
pub fn parse_cpu_index(name: &str) -> Option<u32> {
    name.strip_prefix("cpu")?.parse().ok()
}
