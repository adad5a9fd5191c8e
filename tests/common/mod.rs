//! Shared fakes for the integration tests: every host collaborator in memory, with call logs.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bootclone::access::{
    BitLockerStatus, Collaborators, Container, ContainerAccess, DriveInfo, ExternalToolRunner,
    FilesystemAccess, HostEnvironment, MbrDisk, MemoryDisk, OsVersion, RegistryEditor,
    ToolOutput, VolumeIo, VolumeSnapshotProvider, VolumeStream,
};
use bootclone::consts::{DISKPART, ONE_GIB};
use bootclone::{ClusterBitmap, MigrateError, Result};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("bootclone-test-{prefix}-{pid}-{t}-{id}"))
}

// ---------------- tools ----------------

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub args: Vec<String>,
    /// Content of the diskpart script passed with `/s`, read at call time.
    pub script: Option<String>,
}

/// Records every invocation and answers from a queue (success with empty output once drained).
#[derive(Default)]
pub struct RecordingTools {
    pub calls: RefCell<Vec<ToolCall>>,
    pub responses: RefCell<VecDeque<ToolOutput>>,
}

impl RecordingTools {
    pub fn respond(&self, code: i32, stdout: &str) {
        self.responses.borrow_mut().push_back(ToolOutput {
            code,
            stdout: stdout.to_string(),
        });
    }

    pub fn calls_to(&self, tool: &str) -> Vec<ToolCall> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.tool == tool)
            .cloned()
            .collect()
    }
}

impl ExternalToolRunner for RecordingTools {
    fn run(&self, tool: &str, args: &[&str]) -> Result<ToolOutput> {
        let script = if tool == DISKPART && args.first() == Some(&"/s") {
            args.get(1).and_then(|p| fs::read_to_string(p).ok())
        } else {
            None
        };
        self.calls.borrow_mut().push(ToolCall {
            tool: tool.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            script,
        });
        Ok(self.responses.borrow_mut().pop_front().unwrap_or(ToolOutput {
            code: 0,
            stdout: String::new(),
        }))
    }
}

// ---------------- snapshots ----------------

pub struct FakeSnapshots {
    pub supported: bool,
    pub fail_commit: bool,
    pub already_gone_on_complete: bool,
    pub device: String,
    pub log: RefCell<Vec<String>>,
}

impl FakeSnapshots {
    pub fn new(device: &str) -> Self {
        Self {
            supported: true,
            fail_commit: false,
            already_gone_on_complete: false,
            device: device.to_string(),
            log: RefCell::new(Vec::new()),
        }
    }

    pub fn count(&self, op: &str) -> usize {
        self.log.borrow().iter().filter(|e| e.as_str() == op).count()
    }
}

impl VolumeSnapshotProvider for FakeSnapshots {
    fn supports_volume(&self, _volume: &str) -> Result<bool> {
        Ok(self.supported)
    }

    fn begin(&self, _volume: &str) -> Result<String> {
        self.log.borrow_mut().push("begin".into());
        Ok("{snap-1}".into())
    }

    fn commit(&self, id: &str) -> Result<()> {
        self.log.borrow_mut().push("commit".into());
        if self.fail_commit {
            return Err(MigrateError::Snapshot(format!("commit of {} refused", id)));
        }
        Ok(())
    }

    fn complete(&self, id: &str) -> Result<()> {
        self.log.borrow_mut().push("complete".into());
        if self.already_gone_on_complete {
            return Err(MigrateError::SnapshotBadState(id.to_string()));
        }
        Ok(())
    }

    fn delete(&self, _id: &str) -> Result<()> {
        self.log.borrow_mut().push("delete".into());
        Ok(())
    }

    fn device_path(&self, _id: &str) -> Result<String> {
        Ok(self.device.clone())
    }
}

// ---------------- containers ----------------

/// Image files as in-memory MBR disks keyed by path.
#[derive(Default)]
pub struct MemoryContainers {
    pub disks: RefCell<HashMap<PathBuf, MemoryDisk>>,
}

impl MemoryContainers {
    /// Register a blank MBR disk of `len` bytes at `path`.
    pub fn add_blank(&self, path: &Path, len: usize) -> Result<MemoryDisk> {
        let disk = MemoryDisk::new(len);
        // writes the signature into the shared buffer
        MbrDisk::initialize(disk.clone())?;
        self.disks
            .borrow_mut()
            .insert(path.to_path_buf(), disk.clone());
        Ok(disk)
    }
}

impl ContainerAccess for MemoryContainers {
    fn open(&self, path: &Path) -> Result<Box<dyn Container + '_>> {
        let disk = self.disks.borrow().get(path).cloned().ok_or_else(|| {
            MigrateError::Configuration(format!("no image at {}", path.display()))
        })?;
        Ok(Box::new(MbrDisk::open(disk)?))
    }
}

// ---------------- filesystem ----------------

pub struct FakeFilesystem {
    pub volumes: RefCell<HashMap<String, MemoryDisk>>,
    pub bitmap: ClusterBitmap,
    /// Files that "exist" under mount points; removed entries disappear.
    pub files: RefCell<HashSet<PathBuf>>,
    pub removed: RefCell<Vec<PathBuf>>,
    pub mounts: Cell<u32>,
    pub unmounts: Cell<u32>,
}

impl FakeFilesystem {
    pub fn new(bitmap: ClusterBitmap) -> Self {
        Self {
            volumes: RefCell::new(HashMap::new()),
            bitmap,
            files: RefCell::new(HashSet::new()),
            removed: RefCell::new(Vec::new()),
            mounts: Cell::new(0),
            unmounts: Cell::new(0),
        }
    }

    pub fn add_volume(&self, device: &str, data: Vec<u8>) -> MemoryDisk {
        let disk = MemoryDisk::from_bytes(data);
        self.volumes
            .borrow_mut()
            .insert(device.to_string(), disk.clone());
        disk
    }
}

impl FilesystemAccess for FakeFilesystem {
    fn open_volume(&self, device: &str) -> Result<VolumeStream> {
        let disk = self.volumes.borrow().get(device).cloned().ok_or_else(|| {
            MigrateError::Configuration(format!("no volume {}", device))
        })?;
        Ok(Box::new(disk))
    }

    fn read_allocation_bitmap(&self, _volume: &mut dyn VolumeIo) -> Result<ClusterBitmap> {
        Ok(self.bitmap.clone())
    }

    fn mount(&self, _image: &Path, _dir: &Path) -> Result<()> {
        self.mounts.set(self.mounts.get() + 1);
        Ok(())
    }

    fn unmount(&self, _image: &Path, _dir: &Path) -> Result<()> {
        self.unmounts.set(self.unmounts.get() + 1);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<bool> {
        let existed = self.files.borrow_mut().remove(path);
        if existed {
            self.removed.borrow_mut().push(path.to_path_buf());
        }
        Ok(existed)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out: Vec<PathBuf> = self
            .files
            .borrow()
            .iter()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect();
        out.sort();
        Ok(out)
    }
}

// ---------------- registry ----------------

#[derive(Default)]
pub struct FakeRegistry {
    pub has_mapping: bool,
    pub fail: bool,
    pub calls: RefCell<Vec<(PathBuf, char, Option<char>)>>,
}

impl RegistryEditor for FakeRegistry {
    fn remap_drive_letter(&self, hive: &Path, from: char, to: Option<char>) -> Result<bool> {
        self.calls.borrow_mut().push((hive.to_path_buf(), from, to));
        if self.fail {
            return Err(MigrateError::Unsupported("hive is locked".into()));
        }
        Ok(self.has_mapping)
    }
}

// ---------------- host ----------------

pub struct FakeHost {
    pub os: OsVersion,
    pub bitlocker: BitLockerStatus,
    pub drives: Vec<DriveInfo>,
    pub system_letter: char,
    pub tools: HashSet<String>,
    pub existing: RefCell<HashSet<PathBuf>>,
}

pub fn ready_drive(letter: char, total: u64, free: u64) -> DriveInfo {
    DriveInfo {
        letter,
        ready: true,
        total_size: total,
        total_free: free,
        available_free: free,
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            os: OsVersion {
                major: 10,
                minor: 0,
                build: 19045,
                edition: None,
            },
            bitlocker: BitLockerStatus::Off,
            drives: vec![
                ready_drive('C', 100 * ONE_GIB, 70 * ONE_GIB),
                ready_drive('D', 500 * ONE_GIB, 400 * ONE_GIB),
            ],
            system_letter: 'C',
            tools: ["diskpart.exe", "bcdedit.exe"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            existing: RefCell::new(HashSet::new()),
        }
    }
}

impl HostEnvironment for FakeHost {
    fn os_version(&self) -> Result<OsVersion> {
        Ok(self.os.clone())
    }

    fn bitlocker_status(&self, _drive: char) -> Result<BitLockerStatus> {
        Ok(self.bitlocker)
    }

    fn system_drive(&self) -> Result<DriveInfo> {
        self.drive(self.system_letter)
    }

    fn drives(&self) -> Result<Vec<DriveInfo>> {
        Ok(self.drives.clone())
    }

    fn tools_directory(&self) -> PathBuf {
        PathBuf::from(r"C:\Windows\System32")
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.existing.borrow().contains(path)
    }

    fn tool_available(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }
}

// ---------------- bundle ----------------

/// All fakes of one test, borrowed as `Collaborators`.
pub struct FakeHostBundle {
    pub host: FakeHost,
    pub tools: RecordingTools,
    pub snapshots: FakeSnapshots,
    pub containers: MemoryContainers,
    pub filesystem: FakeFilesystem,
    pub registry: FakeRegistry,
}

impl FakeHostBundle {
    pub fn new(bitmap: ClusterBitmap) -> Self {
        Self {
            host: FakeHost::default(),
            tools: RecordingTools::default(),
            snapshots: FakeSnapshots::new("snapshot-device"),
            containers: MemoryContainers::default(),
            filesystem: FakeFilesystem::new(bitmap),
            registry: FakeRegistry {
                has_mapping: true,
                ..FakeRegistry::default()
            },
        }
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            host: &self.host,
            tools: &self.tools,
            snapshots: &self.snapshots,
            containers: &self.containers,
            filesystem: &self.filesystem,
            registry: &self.registry,
        }
    }
}

/// Deterministic volume bytes: cluster `i` is filled with `i + 1` when allocated, zeros otherwise.
pub fn volume_bytes(bitmap: &ClusterBitmap, clusters: u64) -> Vec<u8> {
    let cs = bitmap.bytes_per_cluster() as usize;
    let mut data = vec![0u8; clusters as usize * cs];
    for c in 0..clusters {
        if bitmap.is_set(c) {
            let start = c as usize * cs;
            data[start..start + cs].fill((c as u8).wrapping_add(1));
        }
    }
    data
}
