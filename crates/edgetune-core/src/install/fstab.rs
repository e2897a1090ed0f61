//! Line-level `/etc/fstab` edits for the swapfile entry.
//!
//! The fstab is shared with the rest of the system, so it is never backed up
//! and restored wholesale: install appends one line and rollback removes
//! exactly that line.

use std::path::Path;

/// The entry install adds for `swapfile`.
pub fn swap_entry(swapfile: &Path, priority: i32) -> String {
    format!("{} none swap sw,pri={} 0 0", swapfile.display(), priority)
}

/// `true` if any non-comment line mounts `swapfile`.
pub fn has_entry(fstab: &str, swapfile: &Path) -> bool {
    fstab.lines().any(|line| references(line, swapfile))
}

/// Returns `fstab` with `entry` appended, or `None` when the swapfile is already listed.
pub fn with_entry(fstab: &str, swapfile: &Path, priority: i32) -> Option<String> {
    if has_entry(fstab, swapfile) {
        return None;
    }
    let mut out = fstab.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&swap_entry(swapfile, priority));
    out.push('\n');
    Some(out)
}

/// Returns `fstab` without the lines mounting `swapfile`, or `None` when there are none.
pub fn without_entry(fstab: &str, swapfile: &Path) -> Option<String> {
    if !has_entry(fstab, swapfile) {
        return None;
    }
    let mut out = String::with_capacity(fstab.len());
    for line in fstab.lines().filter(|line| !references(line, swapfile)) {
        out.push_str(line);
        out.push('\n');
    }
    Some(out)
}

fn references(line: &str, swapfile: &Path) -> bool {
    let line = line.trim_start();
    if line.starts_with('#') {
        return false;
    }
    line.split_whitespace()
        .next()
        .is_some_and(|spec| Path::new(spec) == swapfile)
}
