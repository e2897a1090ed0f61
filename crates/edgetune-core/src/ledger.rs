//! Append-only backup ledger.
//!
//! The ledger is the single record of which system paths an install touched
//! and how to reverse each one. Both engines consult it; neither relies on
//! scanning the filesystem for `.bak` siblings.
//!
//! # Format
//!
//! One entry per line:
//!
//! ```text
//! generation:2026-10-14T09:12:00Z
//! backup:/etc/default/zramswap\t/etc/default/zramswap.bak\tfile\t2026-10-14T09:12:00Z
//! created:/etc/sysctl.d/99-edgetune.conf\t2026-10-14T09:12:01Z
//! fstab:/etc/fstab\t/swapfile\t2026-10-14T09:12:02Z
//! rollback:2026-10-15T10:00:00Z
//! ```
//!
//! A bare `backup:<path>` line is also accepted and implies a `<path>.bak` file
//! backup. Entries after the last `generation:` line form the current
//! generation; a `rollback:` line closes it.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger {} line {line_no}: malformed entry {line:?}", .path.display())]
    Malformed {
        path: PathBuf,
        line_no: usize,
        line: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    File,
    Directory,
}

impl BackupKind {
    fn as_str(self) -> &'static str {
        match self {
            BackupKind::File => "file",
            BackupKind::Directory => "directory",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(BackupKind::File),
            "directory" => Some(BackupKind::Directory),
            _ => None,
        }
    }
}

/// A pre-install original preserved next to its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn new(original_path: impl Into<PathBuf>, kind: BackupKind) -> Self {
        let original_path = original_path.into();
        Self {
            backup_path: backup_path_for(&original_path),
            original_path,
            kind,
            created_at: Utc::now(),
        }
    }
}

/// Returns `<path>.bak`.
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".bak");
    PathBuf::from(s)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEntry {
    Generation(DateTime<Utc>),
    Backup(BackupRecord),
    Created {
        path: PathBuf,
        created_at: DateTime<Utc>,
    },
    /// A swap line appended to `fstab` (the file itself is never backed up).
    FstabEntry {
        fstab: PathBuf,
        swapfile: PathBuf,
        added_at: DateTime<Utc>,
    },
    Rollback(DateTime<Utc>),
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerEntry::Generation(at) => write!(f, "generation:{}", at.to_rfc3339()),
            LedgerEntry::Backup(r) => write!(
                f,
                "backup:{}\t{}\t{}\t{}",
                r.original_path.display(),
                r.backup_path.display(),
                r.kind.as_str(),
                r.created_at.to_rfc3339()
            ),
            LedgerEntry::Created { path, created_at } => {
                write!(f, "created:{}\t{}", path.display(), created_at.to_rfc3339())
            }
            LedgerEntry::FstabEntry {
                fstab,
                swapfile,
                added_at,
            } => write!(
                f,
                "fstab:{}\t{}\t{}",
                fstab.display(),
                swapfile.display(),
                added_at.to_rfc3339()
            ),
            LedgerEntry::Rollback(at) => write!(f, "rollback:{}", at.to_rfc3339()),
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Parses one ledger line. Returns `None` for malformed lines.
pub fn parse_entry(line: &str) -> Option<LedgerEntry> {
    let (tag, rest) = line.split_once(':')?;
    match tag {
        "generation" => parse_time(rest).map(LedgerEntry::Generation),
        "rollback" => parse_time(rest).map(LedgerEntry::Rollback),
        "created" => {
            let mut fields = rest.split('\t');
            let path = fields.next().filter(|p| !p.is_empty())?;
            let created_at = fields.next().and_then(parse_time)?;
            Some(LedgerEntry::Created {
                path: PathBuf::from(path),
                created_at,
            })
        }
        "fstab" => {
            let mut fields = rest.split('\t');
            let fstab = fields.next().filter(|p| !p.is_empty())?;
            let swapfile = fields.next().filter(|p| !p.is_empty())?;
            let added_at = fields.next().and_then(parse_time)?;
            Some(LedgerEntry::FstabEntry {
                fstab: PathBuf::from(fstab),
                swapfile: PathBuf::from(swapfile),
                added_at,
            })
        }
        "backup" => {
            let fields: Vec<&str> = rest.split('\t').collect();
            let original = PathBuf::from(fields.first().filter(|p| !p.is_empty())?);
            match fields.len() {
                // Legacy marker: implies a sibling `.bak` file.
                1 => Some(LedgerEntry::Backup(BackupRecord {
                    backup_path: backup_path_for(&original),
                    original_path: original,
                    kind: BackupKind::File,
                    created_at: DateTime::<Utc>::default(),
                })),
                4 => Some(LedgerEntry::Backup(BackupRecord {
                    original_path: original,
                    backup_path: PathBuf::from(fields[1]),
                    kind: BackupKind::parse(fields[2])?,
                    created_at: parse_time(fields[3])?,
                })),
                _ => None,
            }
        }
        _ => None,
    }
}

/// In-memory view of the ledger file. Appends are written through immediately.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    /// Loads the ledger at `path` (a host path). A missing file is an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };

        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_entry(line) {
                Some(entry) => entries.push(entry),
                None => {
                    return Err(LedgerError::Malformed {
                        path,
                        line_no: idx + 1,
                        line: line.to_string(),
                    });
                }
            }
        }
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Entries of the current generation (after the last `generation:` line,
    /// or all entries when the ledger predates generations).
    pub fn current_generation(&self) -> &[LedgerEntry] {
        let start = self
            .entries
            .iter()
            .rposition(|e| matches!(e, LedgerEntry::Generation(_)))
            .map_or(0, |i| i + 1);
        &self.entries[start..]
    }

    /// `true` when a generation has started and has not been rolled back.
    pub fn is_open(&self) -> bool {
        let started = self
            .entries
            .iter()
            .any(|e| matches!(e, LedgerEntry::Generation(_)))
            || !self.current_generation().is_empty();
        started
            && !self
                .current_generation()
                .iter()
                .any(|e| matches!(e, LedgerEntry::Rollback(_)))
    }

    /// Starts a new generation unless one is already open. Returns `true` if started.
    pub fn begin_generation(&mut self) -> Result<bool, LedgerError> {
        if self.is_open() {
            return Ok(false);
        }
        self.append(LedgerEntry::Generation(Utc::now()))?;
        Ok(true)
    }

    /// Closes the current generation.
    pub fn close_generation(&mut self) -> Result<(), LedgerError> {
        self.append(LedgerEntry::Rollback(Utc::now()))
    }

    pub fn backups(&self) -> impl Iterator<Item = &BackupRecord> {
        self.current_generation().iter().filter_map(|e| match e {
            LedgerEntry::Backup(r) => Some(r),
            _ => None,
        })
    }

    pub fn backup_for(&self, path: &Path) -> Option<&BackupRecord> {
        self.backups().find(|r| r.original_path == path)
    }

    pub fn was_created(&self, path: &Path) -> bool {
        self.current_generation()
            .iter()
            .any(|e| matches!(e, LedgerEntry::Created { path: p, .. } if p == path))
    }

    /// `true` if install appended the `swapfile` line to `fstab` in this generation.
    pub fn added_fstab_entry(&self, fstab: &Path, swapfile: &Path) -> bool {
        self.current_generation().iter().any(|e| {
            matches!(e, LedgerEntry::FstabEntry { fstab: f, swapfile: s, .. } if f == fstab && s == swapfile)
        })
    }

    /// Start of the open generation, if it has a `generation:` line.
    pub fn generation_started_at(&self) -> Option<DateTime<Utc>> {
        if !self.is_open() {
            return None;
        }
        self.entries.iter().rev().find_map(|e| match e {
            LedgerEntry::Generation(at) => Some(*at),
            _ => None,
        })
    }

    /// `true` if the current generation already accounts for `path`.
    pub fn tracks(&self, path: &Path) -> bool {
        self.backup_for(path).is_some() || self.was_created(path)
    }

    pub fn record_backup(&mut self, record: BackupRecord) -> Result<(), LedgerError> {
        self.append(LedgerEntry::Backup(record))
    }

    pub fn record_created(&mut self, path: impl Into<PathBuf>) -> Result<(), LedgerError> {
        self.append(LedgerEntry::Created {
            path: path.into(),
            created_at: Utc::now(),
        })
    }

    pub fn record_fstab_entry(
        &mut self,
        fstab: impl Into<PathBuf>,
        swapfile: impl Into<PathBuf>,
    ) -> Result<(), LedgerError> {
        self.append(LedgerEntry::FstabEntry {
            fstab: fstab.into(),
            swapfile: swapfile.into(),
            added_at: Utc::now(),
        })
    }

    fn append(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{}", entry).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        self.entries.push(entry);
        Ok(())
    }
}
