//! In-memory host doubles: filesystem, command runner and clock.
//!
//! These let probes, engines and the diagnostics service run in CI without a
//! single-board computer attached.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::clock::Clock;
use super::command::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use super::fs::FileSystem;

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.insert(path);
    }

    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }

    /// A Raspberry Pi 4 with 2 GB RAM, four cores, zram and a swapfile active.
    pub fn raspberry_pi() -> Self {
        let mut fs = Self::new();
        fs.add_file("/etc/hostname", "edge-01\n");
        fs.add_file("/proc/sys/kernel/osrelease", "6.6.31+rpt-rpi-v8\n");
        fs.add_file(
            "/proc/meminfo",
            "MemTotal:        1893316 kB\nMemFree:          912344 kB\nMemAvailable:    1402112 kB\n",
        );
        fs.add_file(
            "/proc/device-tree/model",
            "Raspberry Pi 4 Model B Rev 1.5\0",
        );
        fs.add_file(
            "/proc/swaps",
            "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n\
             /dev/zram0                              partition\t946656\t\t1024\t\t100\n\
             /swapfile                               file\t\t2097148\t\t0\t\t10\n",
        );
        for (cpu, khz) in [(0, "1500000"), (1, "1500000"), (2, "600000"), (3, "1800000")] {
            fs.add_file(
                format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/scaling_cur_freq"),
                format!("{khz}\n"),
            );
        }
        fs.add_dir("/sys/devices/system/cpu/cpufreq");
        fs.add_file("/sys/devices/system/cpu/online", "0-3\n");
        fs.add_file("/sys/class/thermal/thermal_zone0/temp", "48212\n");
        fs.add_file("/proc/sys/vm/swappiness", "100\n");
        fs.add_dir("/sys/block/zram0");
        fs
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock file not found: {}", path.display()),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        if !self.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock directory not found: {}", path.display()),
            ));
        }
        let mut entries: Vec<PathBuf> = self
            .files
            .keys()
            .chain(self.directories.iter())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }
}

type Handler = Arc<dyn Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync>;

/// Scripted command runner.
///
/// Programs without a handler are reported as not installed. Every call is
/// recorded, including calls to missing programs.
#[derive(Clone, Default)]
pub struct MockRunner {
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (or replaces) the handler for `program`.
    pub fn on<F>(&self, program: &str, handler: F) -> &Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(program.to_string(), Arc::new(handler));
        self
    }

    /// Makes `program` succeed with the given stdout.
    pub fn succeed(&self, program: &str, stdout: &str) -> &Self {
        let stdout = stdout.to_string();
        self.on(program, move |_| Ok(CommandOutput::stdout(stdout.clone())))
    }

    /// Makes `program` exit with a non-zero status.
    pub fn fail(&self, program: &str, stderr: &str) -> &Self {
        let stderr = stderr.to_string();
        self.on(program, move |spec| {
            Err(CommandError::Failed {
                program: spec.program.clone(),
                code: Some(1),
                stderr: stderr.clone(),
            })
        })
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of recorded invocations of `program`.
    pub fn count(&self, program: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.program == program)
            .count()
    }

    /// Recorded invocations of `program` whose first argument is `first`.
    pub fn count_with(&self, program: &str, first: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.program == program && c.args.first().map(String::as_str) == Some(first))
            .count()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(spec.clone());
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&spec.program)
            .cloned();
        match handler {
            Some(handler) => handler(spec),
            None => Err(CommandError::NotFound {
                program: spec.program.clone(),
            }),
        }
    }
}

/// Manually advanced clock. Starts at an arbitrary fixed origin.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock to `secs` seconds after the origin.
    pub fn set_secs(&self, secs: f64) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) = Duration::from_secs_f64(secs);
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
