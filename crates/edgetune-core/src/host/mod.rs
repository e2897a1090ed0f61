//! Host abstractions used by the engines and the probe runner.
//!
//! Everything that touches the device goes through one of these seams so the
//! engines can run against a temporary root and scripted commands in tests:
//!
//! ```text
//!   Installer / Rollback        SystemProbe / Validator
//!          │                            │
//!          ├──────────────┬─────────────┤
//!          ▼              ▼             ▼
//!       Layout      CommandRunner    FileSystem        Clock
//!    (root prefix)  (RealRunner,     (RealFs,        (SystemClock,
//!                    MockRunner)      MockFs)         ManualClock)
//! ```

mod clock;
mod command;
mod fs;
pub mod mock;

use std::path::{Path, PathBuf};

pub use clock::{Clock, SystemClock};
pub use command::{CommandError, CommandOutput, CommandRunner, CommandSpec, RealRunner};
pub use fs::{FileSystem, RealFs};
pub use mock::{ManualClock, MockFs, MockRunner};

/// Maps logical system paths (`/etc/fstab`) onto a root directory.
///
/// Persisted records always hold logical paths; only I/O uses host paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves a logical absolute path under the root.
    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative.as_os_str().is_empty() {
            return self.root.clone();
        }
        self.root.join(relative)
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new("/")
    }
}

/// Returns `true` when running with an effective UID of root.
pub fn is_privileged() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_default_root_is_identity() {
        let layout = Layout::default();
        assert_eq!(layout.host_path("/etc/fstab"), PathBuf::from("/etc/fstab"));
    }

    #[test]
    fn test_layout_prefixes_absolute_paths() {
        let layout = Layout::new("/tmp/img");
        assert_eq!(
            layout.host_path("/etc/sysctl.d/99-edgetune.conf"),
            PathBuf::from("/tmp/img/etc/sysctl.d/99-edgetune.conf")
        );
        assert_eq!(layout.host_path("/"), PathBuf::from("/tmp/img"));
    }
}
