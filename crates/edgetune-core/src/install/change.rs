//! Discrete system changes and the engine that applies them.
//!
//! Each `Change` is idempotent: applying it a second time in the same ledger
//! generation neither rewrites identical content nor takes a second backup.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::fstab;
use crate::host::{CommandError, CommandRunner, CommandSpec, Layout, RealFs};
use crate::ledger::{BackupKind, BackupRecord, Ledger, LedgerError};
use crate::probe::swap_active;
use crate::util::{copy_dir_all, remove_path, write_atomic};

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("cannot resolve UUID of swapfile {}", .path.display())]
    UuidUnresolved { path: PathBuf },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> MutationError + '_ {
    move |source| MutationError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One system change. Paths are logical (unprefixed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Replace a file's content, backing up the original once.
    WriteFile {
        path: PathBuf,
        contents: String,
        mode: Option<u32>,
    },
    /// Create, format and activate a swapfile, then resolve its UUID.
    Swapfile { path: PathBuf, size_mb: u64 },
    /// Ensure `fstab` mounts `swapfile`.
    FstabEntry {
        fstab: PathBuf,
        swapfile: PathBuf,
        priority: i32,
    },
    /// Populate a directory with `files` (host paths), moving any original aside.
    InstallDir { dir: PathBuf, files: Vec<PathBuf> },
    /// Best-effort command.
    Run(CommandSpec),
}

impl Change {
    /// Essential changes abort the install on failure.
    pub fn is_essential(&self) -> bool {
        !matches!(self, Change::Run(_))
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::WriteFile { path, .. } => write!(f, "write {}", path.display()),
            Change::Swapfile { path, size_mb } => {
                write!(f, "swapfile {} ({size_mb} MB)", path.display())
            }
            Change::FstabEntry { fstab, swapfile, .. } => {
                write!(f, "{} entry for {}", fstab.display(), swapfile.display())
            }
            Change::InstallDir { dir, .. } => write!(f, "install {}", dir.display()),
            Change::Run(spec) => write!(f, "run {spec}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    Applied,
    /// Already in the desired state.
    Unchanged,
    Swap { uuid: String, created: bool },
}

/// Applies changes under a root layout, recording every original in the ledger.
pub struct MutationEngine<'a, R: CommandRunner> {
    layout: &'a Layout,
    ledger: &'a mut Ledger,
    runner: &'a R,
}

impl<'a, R: CommandRunner> MutationEngine<'a, R> {
    pub fn new(layout: &'a Layout, ledger: &'a mut Ledger, runner: &'a R) -> Self {
        Self {
            layout,
            ledger,
            runner,
        }
    }

    pub fn apply(&mut self, change: &Change) -> Result<ChangeOutcome, MutationError> {
        match change {
            Change::WriteFile {
                path,
                contents,
                mode,
            } => self.write_file(path, contents, *mode),
            Change::Swapfile { path, size_mb } => self.swapfile(path, *size_mb),
            Change::FstabEntry {
                fstab,
                swapfile,
                priority,
            } => self.fstab_entry(fstab, swapfile, *priority),
            Change::InstallDir { dir, files } => self.install_dir(dir, files),
            Change::Run(spec) => {
                self.runner.run(spec)?;
                Ok(ChangeOutcome::Applied)
            }
        }
    }

    /// Records how to reverse the upcoming change to `path`, at most once per generation.
    ///
    /// An existing original is preserved at `<path>.bak`: files are copied,
    /// directories moved. A `.bak` left behind by an interrupted run is
    /// adopted as is, since it holds the pre-install original.
    pub fn ensure_tracked(&mut self, path: &Path, kind: BackupKind) -> Result<(), MutationError> {
        if self.ledger.tracks(path) {
            return Ok(());
        }
        let host = self.layout.host_path(path);
        if !host.exists() {
            debug!(path = %path.display(), "recording new path");
            self.ledger.record_created(path)?;
            return Ok(());
        }

        let record = BackupRecord::new(path, kind);
        let host_bak = self.layout.host_path(&record.backup_path);
        if host_bak.exists() {
            info!(backup = %record.backup_path.display(), "adopting existing backup");
            if kind == BackupKind::Directory {
                remove_path(&host).map_err(io_err(&host))?;
            }
        } else {
            match kind {
                BackupKind::File => {
                    fs::copy(&host, &host_bak).map_err(io_err(&host_bak))?;
                }
                BackupKind::Directory => {
                    fs::rename(&host, &host_bak).map_err(io_err(&host_bak))?;
                }
            }
            info!(path = %path.display(), backup = %record.backup_path.display(), "backed up original");
        }
        self.ledger.record_backup(record)?;
        Ok(())
    }

    fn write_file(
        &mut self,
        path: &Path,
        contents: &str,
        mode: Option<u32>,
    ) -> Result<ChangeOutcome, MutationError> {
        self.ensure_tracked(path, BackupKind::File)?;
        let host = self.layout.host_path(path);
        if fs::read_to_string(&host).is_ok_and(|current| current == contents) {
            return Ok(ChangeOutcome::Unchanged);
        }
        write_atomic(&host, contents.as_bytes()).map_err(io_err(&host))?;
        if let Some(mode) = mode {
            set_mode(&host, mode)?;
        }
        Ok(ChangeOutcome::Applied)
    }

    fn swapfile(&mut self, path: &Path, size_mb: u64) -> Result<ChangeOutcome, MutationError> {
        let host = self.layout.host_path(path);
        let created = !host.exists();
        if created {
            if !self.ledger.tracks(path) {
                self.ledger.record_created(path)?;
            }
            info!(path = %path.display(), size_mb, "creating swapfile");
            self.runner.run(
                &CommandSpec::new("fallocate")
                    .arg("-l")
                    .arg(format!("{size_mb}M"))
                    .path_arg(&host),
            )?;
            set_mode(&host, 0o600)?;
            self.runner
                .run(&CommandSpec::new("mkswap").path_arg(&host))?;
        } else {
            debug!(path = %path.display(), "swapfile already present");
        }

        if !swap_active(&RealFs, self.layout, path) {
            self.runner.run(&CommandSpec::new("swapon").path_arg(&host))?;
        }

        let uuid = read_uuid(self.runner, &host)
            .ok_or_else(|| MutationError::UuidUnresolved {
                path: path.to_path_buf(),
            })?;
        Ok(ChangeOutcome::Swap { uuid, created })
    }

    fn fstab_entry(
        &mut self,
        fstab_path: &Path,
        swapfile: &Path,
        priority: i32,
    ) -> Result<ChangeOutcome, MutationError> {
        let host = self.layout.host_path(fstab_path);
        let current = match fs::read_to_string(&host) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err(&host)(e)),
        };
        match fstab::with_entry(&current, swapfile, priority) {
            Some(updated) => {
                if !self.ledger.added_fstab_entry(fstab_path, swapfile) {
                    self.ledger.record_fstab_entry(fstab_path, swapfile)?;
                }
                write_atomic(&host, updated.as_bytes()).map_err(io_err(&host))?;
                Ok(ChangeOutcome::Applied)
            }
            None => Ok(ChangeOutcome::Unchanged),
        }
    }

    fn install_dir(&mut self, dir: &Path, files: &[PathBuf]) -> Result<ChangeOutcome, MutationError> {
        self.ensure_tracked(dir, BackupKind::Directory)?;
        let host = self.layout.host_path(dir);
        fs::create_dir_all(&host).map_err(io_err(&host))?;
        for file in files {
            let name = file.file_name().ok_or_else(|| MutationError::Io {
                path: file.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a file path"),
            })?;
            let target = host.join(name);
            if file.is_dir() {
                copy_dir_all(file, &target).map_err(io_err(file))?;
            } else {
                fs::copy(file, &target).map_err(io_err(file))?;
                set_mode(&target, 0o755)?;
            }
        }
        Ok(ChangeOutcome::Applied)
    }
}

/// Filesystem UUID of a formatted swap area, if `blkid` can resolve it.
pub fn read_uuid<R: CommandRunner + ?Sized>(runner: &R, host_path: &Path) -> Option<String> {
    let spec = CommandSpec::new("blkid")
        .args(["-s", "UUID", "-o", "value"])
        .path_arg(host_path);
    match runner.run(&spec) {
        Ok(out) => Some(out.stdout.trim().to_string()).filter(|u| !u.is_empty()),
        Err(e) => {
            debug!(error = %e, "blkid failed");
            None
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), MutationError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err(path))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), MutationError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CommandOutput, MockRunner};
    use tempfile::tempdir;

    const UUID: &str = "0f6d1a8e-3c1b-4c55-9d2e-5d9b0d1e7a11";

    fn swap_runner() -> MockRunner {
        let runner = MockRunner::new();
        runner.on("fallocate", |spec| {
            fs::write(&spec.args[2], b"").unwrap();
            Ok(CommandOutput::default())
        });
        runner.succeed("mkswap", "");
        runner.succeed("swapon", "");
        runner.succeed("blkid", &format!("{UUID}\n"));
        runner
    }

    fn setup() -> (tempfile::TempDir, Layout, Ledger) {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let ledger = Ledger::open(layout.host_path("/var/lib/edgetune/backups.log")).unwrap();
        (dir, layout, ledger)
    }

    #[test]
    fn test_write_file_backs_up_once() {
        let (_dir, layout, mut ledger) = setup();
        let runner = MockRunner::new();
        fs::create_dir_all(layout.host_path("/etc/default")).unwrap();
        fs::write(layout.host_path("/etc/default/zramswap"), "PERCENT=20\n").unwrap();
        ledger.begin_generation().unwrap();

        let change = Change::WriteFile {
            path: PathBuf::from("/etc/default/zramswap"),
            contents: "PERCENT=50\n".to_string(),
            mode: None,
        };
        let mut engine = MutationEngine::new(&layout, &mut ledger, &runner);
        assert_eq!(engine.apply(&change).unwrap(), ChangeOutcome::Applied);
        assert_eq!(engine.apply(&change).unwrap(), ChangeOutcome::Unchanged);

        assert_eq!(
            fs::read_to_string(layout.host_path("/etc/default/zramswap.bak")).unwrap(),
            "PERCENT=20\n"
        );
        assert_eq!(ledger.backups().count(), 1);
    }

    #[test]
    fn test_write_file_records_new_path() {
        let (_dir, layout, mut ledger) = setup();
        let runner = MockRunner::new();
        ledger.begin_generation().unwrap();

        let path = PathBuf::from("/etc/sysctl.d/99-edgetune.conf");
        let change = Change::WriteFile {
            path: path.clone(),
            contents: "vm.swappiness = 100\n".to_string(),
            mode: Some(0o644),
        };
        MutationEngine::new(&layout, &mut ledger, &runner)
            .apply(&change)
            .unwrap();
        assert!(ledger.was_created(&path));
        assert!(!layout.host_path("/etc/sysctl.d/99-edgetune.conf.bak").exists());
    }

    #[test]
    fn test_existing_backup_is_adopted() {
        let (_dir, layout, mut ledger) = setup();
        let runner = MockRunner::new();
        fs::create_dir_all(layout.host_path("/etc/default")).unwrap();
        fs::write(layout.host_path("/etc/default/zramswap"), "half-written\n").unwrap();
        fs::write(layout.host_path("/etc/default/zramswap.bak"), "original\n").unwrap();
        ledger.begin_generation().unwrap();

        MutationEngine::new(&layout, &mut ledger, &runner)
            .ensure_tracked(Path::new("/etc/default/zramswap"), BackupKind::File)
            .unwrap();
        assert_eq!(
            fs::read_to_string(layout.host_path("/etc/default/zramswap.bak")).unwrap(),
            "original\n"
        );
        assert!(ledger.backup_for(Path::new("/etc/default/zramswap")).is_some());
    }

    #[test]
    fn test_swapfile_created_once() {
        let (_dir, layout, mut ledger) = setup();
        let runner = swap_runner();
        ledger.begin_generation().unwrap();

        let change = Change::Swapfile {
            path: PathBuf::from("/swapfile"),
            size_mb: 2048,
        };
        let mut engine = MutationEngine::new(&layout, &mut ledger, &runner);
        assert_eq!(
            engine.apply(&change).unwrap(),
            ChangeOutcome::Swap {
                uuid: UUID.to_string(),
                created: true
            }
        );
        assert_eq!(
            engine.apply(&change).unwrap(),
            ChangeOutcome::Swap {
                uuid: UUID.to_string(),
                created: false
            }
        );
        assert_eq!(runner.count("fallocate"), 1);
        assert_eq!(runner.count("mkswap"), 1);
        assert!(ledger.was_created(Path::new("/swapfile")));

        let call = runner.calls().into_iter().find(|c| c.program == "fallocate").unwrap();
        assert_eq!(call.args[1], "2048M");
    }

    #[test]
    fn test_swapfile_without_uuid_is_irrecoverable() {
        let (_dir, layout, mut ledger) = setup();
        let runner = swap_runner();
        runner.succeed("blkid", "\n");
        let change = Change::Swapfile {
            path: PathBuf::from("/swapfile"),
            size_mb: 1024,
        };
        let err = MutationEngine::new(&layout, &mut ledger, &runner)
            .apply(&change)
            .unwrap_err();
        assert!(matches!(err, MutationError::UuidUnresolved { .. }));
    }

    #[test]
    fn test_fstab_entry_appended_once() {
        let (_dir, layout, mut ledger) = setup();
        let runner = MockRunner::new();
        fs::create_dir_all(layout.host_path("/etc")).unwrap();
        fs::write(layout.host_path("/etc/fstab"), "proc /proc proc defaults 0 0\n").unwrap();
        ledger.begin_generation().unwrap();

        let change = Change::FstabEntry {
            fstab: PathBuf::from("/etc/fstab"),
            swapfile: PathBuf::from("/swapfile"),
            priority: 10,
        };
        let mut engine = MutationEngine::new(&layout, &mut ledger, &runner);
        assert_eq!(engine.apply(&change).unwrap(), ChangeOutcome::Applied);
        assert_eq!(engine.apply(&change).unwrap(), ChangeOutcome::Unchanged);
        assert_eq!(
            fs::read_to_string(layout.host_path("/etc/fstab")).unwrap(),
            "proc /proc proc defaults 0 0\n/swapfile none swap sw,pri=10 0 0\n"
        );
        assert!(ledger.added_fstab_entry(Path::new("/etc/fstab"), Path::new("/swapfile")));
        assert_eq!(ledger.entries().len(), 2);
    }

    #[test]
    fn test_existing_fstab_line_is_not_recorded() {
        let (_dir, layout, mut ledger) = setup();
        let runner = MockRunner::new();
        fs::create_dir_all(layout.host_path("/etc")).unwrap();
        fs::write(layout.host_path("/etc/fstab"), "/swapfile none swap sw 0 0\n").unwrap();
        ledger.begin_generation().unwrap();

        let change = Change::FstabEntry {
            fstab: PathBuf::from("/etc/fstab"),
            swapfile: PathBuf::from("/swapfile"),
            priority: 10,
        };
        let outcome = MutationEngine::new(&layout, &mut ledger, &runner)
            .apply(&change)
            .unwrap();
        assert_eq!(outcome, ChangeOutcome::Unchanged);
        assert!(!ledger.added_fstab_entry(Path::new("/etc/fstab"), Path::new("/swapfile")));
    }

    #[test]
    fn test_active_swapfile_under_root_is_not_reactivated() {
        let (_dir, layout, mut ledger) = setup();
        let runner = swap_runner();
        fs::create_dir_all(layout.host_path("/proc")).unwrap();
        fs::write(
            layout.host_path("/proc/swaps"),
            "Filename\tType\tSize\tUsed\tPriority\n/swapfile\tfile\t1048572\t0\t-2\n",
        )
        .unwrap();
        fs::write(layout.host_path("/swapfile"), b"").unwrap();

        let change = Change::Swapfile {
            path: PathBuf::from("/swapfile"),
            size_mb: 1024,
        };
        MutationEngine::new(&layout, &mut ledger, &runner)
            .apply(&change)
            .unwrap();
        assert_eq!(runner.count("swapon"), 0);
        assert!(!ledger.was_created(Path::new("/swapfile")));
    }

    #[test]
    fn test_install_dir_moves_original_aside() {
        let (dir, layout, mut ledger) = setup();
        let runner = MockRunner::new();
        let binary = dir.path().join("build/edgetune-web");
        fs::create_dir_all(binary.parent().unwrap()).unwrap();
        fs::write(&binary, "new-binary").unwrap();
        fs::create_dir_all(layout.host_path("/opt/edgetune")).unwrap();
        fs::write(layout.host_path("/opt/edgetune/old"), "old").unwrap();
        ledger.begin_generation().unwrap();

        let change = Change::InstallDir {
            dir: PathBuf::from("/opt/edgetune"),
            files: vec![binary],
        };
        let mut engine = MutationEngine::new(&layout, &mut ledger, &runner);
        engine.apply(&change).unwrap();
        engine.apply(&change).unwrap();

        assert!(layout.host_path("/opt/edgetune.bak/old").exists());
        assert!(!layout.host_path("/opt/edgetune/old").exists());
        assert_eq!(
            fs::read_to_string(layout.host_path("/opt/edgetune/edgetune-web")).unwrap(),
            "new-binary"
        );
        let record = ledger.backup_for(Path::new("/opt/edgetune")).unwrap();
        assert_eq!(record.kind, BackupKind::Directory);
        assert_eq!(ledger.backups().count(), 1);
    }

    #[test]
    fn test_run_is_not_essential() {
        let run = Change::Run(CommandSpec::new("systemctl").arg("daemon-reload"));
        assert!(!run.is_essential());
        assert_eq!(run.to_string(), "run systemctl daemon-reload");
        let runner = MockRunner::new();
        let (_dir, layout, mut ledger) = setup();
        let err = MutationEngine::new(&layout, &mut ledger, &runner)
            .apply(&run)
            .unwrap_err();
        assert!(matches!(err, MutationError::Command(e) if e.is_not_found()));
    }
}
