//! Temporary device root shared by the install and rollback tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::Installer;
use crate::config::InstallConfig;
use crate::host::{CommandOutput, Layout, MockRunner};
use crate::ledger::Ledger;
use crate::state::StateStore;

pub const UUID: &str = "0f6d1a8e-3c1b-4c55-9d2e-5d9b0d1e7a11";
pub const ORIGINAL_ZRAM: &str = "# stock zram-tools config\nPERCENT=50\nALGO=lz4\n";
pub const SWAPS_HEADER: &str = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n";
pub const ORIGINAL_FSTAB: &str = "proc /proc proc defaults 0 0\nPARTUUID=abc-01 /boot/firmware vfat defaults 0 2\n";

pub struct Fixture {
    pub dir: TempDir,
    pub config: InstallConfig,
    pub runner: MockRunner,
}

impl Fixture {
    /// A 2 GB Raspberry Pi root with a stock zram config and fstab.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let write = |path: &str, content: &str| {
            let host = layout.host_path(path);
            fs::create_dir_all(host.parent().unwrap()).unwrap();
            fs::write(host, content).unwrap();
        };
        write("/proc/meminfo", "MemTotal:        1893316 kB\nMemFree:  912344 kB\n");
        write("/proc/device-tree/model", "Raspberry Pi 4 Model B Rev 1.5\0");
        write("/etc/default/zramswap", ORIGINAL_ZRAM);
        write("/etc/fstab", ORIGINAL_FSTAB);
        write("/build/edgetune-web", "#!/bin/sh\n");
        write("/proc/swaps", SWAPS_HEADER);

        let config = InstallConfig {
            api_binary: layout.host_path("/build/edgetune-web"),
            layout: layout.clone(),
            ..InstallConfig::default()
        };

        let runner = MockRunner::new();
        runner.on("fallocate", |spec| {
            fs::write(&spec.args[2], b"swap").unwrap();
            Ok(CommandOutput::default())
        });
        runner.succeed("mkswap", "");
        // swapon/swapoff receive host paths; the kernel lists logical ones.
        let root = dir.path().to_path_buf();
        let swaps = layout.host_path("/proc/swaps");
        let (on_root, on_swaps) = (root.clone(), swaps.clone());
        runner.on("swapon", move |spec| {
            let device = logical(&on_root, &spec.args[0]);
            let mut content = fs::read_to_string(&on_swaps).unwrap();
            content.push_str(&format!("{}\tfile\t\t1048572\t\t0\t\t-2\n", device.display()));
            fs::write(&on_swaps, content).unwrap();
            Ok(CommandOutput::default())
        });
        runner.on("swapoff", move |spec| {
            let device = logical(&root, &spec.args[0]);
            let content: String = fs::read_to_string(&swaps)
                .unwrap()
                .lines()
                .filter(|line| line.split_whitespace().next() != Some(&*device.to_string_lossy()))
                .map(|line| format!("{line}\n"))
                .collect();
            fs::write(&swaps, content).unwrap();
            Ok(CommandOutput::default())
        });
        runner.succeed("blkid", &format!("{UUID}\n"));
        runner.succeed("systemctl", "");
        runner.succeed("sysctl", "");

        Self {
            dir,
            config,
            runner,
        }
    }

    pub fn host(&self, path: &str) -> PathBuf {
        self.config.layout.host_path(path)
    }

    pub fn installer(&self) -> Installer<MockRunner> {
        Installer::new(self.config.clone(), self.runner.clone()).assume_privileged(true)
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.config.layout.host_path(&self.config.state_file))
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::open(self.config.layout.host_path(&self.config.ledger_file)).unwrap()
    }

    /// Every file under the root with its content.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut files = BTreeMap::new();
        collect(self.dir.path(), self.dir.path(), &mut files);
        files
    }
}

fn logical(root: &Path, host: &str) -> PathBuf {
    Path::new("/").join(Path::new(host).strip_prefix(root).unwrap())
}

fn collect(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, Vec<u8>>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect(root, &path, files);
        } else {
            let rel = path.strip_prefix(root).unwrap().to_path_buf();
            files.insert(rel, fs::read(&path).unwrap());
        }
    }
}
