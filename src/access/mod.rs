//! Host collaborator boundaries.
//!
//! The migration core talks to the machine only through these traits:
//! - `ExternalToolRunner`: diskpart, bcdedit, reg, vssadmin...
//! - `VolumeSnapshotProvider`: point-in-time snapshots of a live volume
//! - `ContainerAccess` / `Container`: image files with an MBR partition table
//! - `FilesystemAccess`: raw volume streams, allocation bitmaps, mounted partitions
//! - `RegistryEditor`: offline hive edits
//! - `HostEnvironment`: OS, encryption and drive facts
//!
//! Real implementations live in the submodules; tests inject their own.

use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, Result};
use crate::extent::ClusterBitmap;
use crate::metrics::record_tool_run;

pub mod host;
pub mod mbr;
pub mod ntfs;
pub mod registry;
pub mod tool;
pub mod vdisk;
pub mod vss;

pub use host::LocalHost;
pub use mbr::{DiskDevice, MbrDisk, MbrImageAccess, MemoryDisk, PartitionStream};
pub use ntfs::{read_ntfs_bitmap, NtfsVolumes};
pub use registry::RegToolEditor;
pub use tool::{DiskpartScript, ProcessToolRunner};
pub use vdisk::VirtualDiskAccess;
pub use vss::VssSnapshots;

// ---------------- streams ----------------

/// Random-access byte stream over a volume, partition or image.
pub trait VolumeIo: Read + Write + Seek {}

impl<T: Read + Write + Seek + ?Sized> VolumeIo for T {}

pub type VolumeStream = Box<dyn VolumeIo>;

// ---------------- tools ----------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: i32,
    pub stdout: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub trait ExternalToolRunner {
    /// Run `tool` to completion and capture its standard output.
    fn run(&self, tool: &str, args: &[&str]) -> Result<ToolOutput>;

    /// Like `run`, but a non-zero exit code becomes `MigrateError::Tool`.
    fn run_checked(&self, tool: &str, args: &[&str]) -> Result<String> {
        let out = self.run(tool, args)?;
        record_tool_run(out.success());
        if !out.success() {
            log::error!("tool: {} exited with {}\n{}", tool, out.code, out.stdout);
            return Err(MigrateError::Tool {
                tool: tool.to_string(),
                code: out.code,
                output: out.stdout,
            });
        }
        log::debug!("tool: {} ok\n{}", tool, out.stdout);
        Ok(out.stdout)
    }
}

// ---------------- snapshots ----------------

pub trait VolumeSnapshotProvider {
    fn supports_volume(&self, volume: &str) -> Result<bool>;

    /// Start a snapshot of `volume`; the returned id is known even if `commit` fails later.
    fn begin(&self, volume: &str) -> Result<String>;

    fn commit(&self, id: &str) -> Result<()>;

    /// Signal end of use. `SnapshotBadState` when there is nothing left to complete.
    fn complete(&self, id: &str) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;

    /// Device path of a committed snapshot, openable through `FilesystemAccess::open_volume`.
    fn device_path(&self, id: &str) -> Result<String>;
}

// ---------------- containers ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Ntfs,
    Other(u8),
}

impl PartitionKind {
    pub fn type_byte(self) -> u8 {
        match self {
            PartitionKind::Ntfs => crate::consts::PART_TYPE_NTFS,
            PartitionKind::Other(b) => b,
        }
    }

    pub fn from_type_byte(b: u8) -> Self {
        if b == crate::consts::PART_TYPE_NTFS {
            PartitionKind::Ntfs
        } else {
            PartitionKind::Other(b)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Slot in the partition table.
    pub index: usize,
    pub kind: PartitionKind,
    pub first_sector: u64,
    pub sector_count: u64,
    pub active: bool,
}

pub trait Container {
    fn bytes_per_sector(&self) -> u64;

    /// Addressable size of the whole disk in bytes.
    fn capacity(&self) -> u64;

    fn partitions(&mut self) -> Result<Vec<PartitionInfo>>;

    /// Create a primary partition over sectors `first..=last`; returns its index.
    fn create_primary_partition(
        &mut self,
        first_sector: u64,
        last_sector: u64,
        kind: PartitionKind,
        active: bool,
    ) -> Result<usize>;

    fn open_partition(&mut self, index: usize) -> Result<VolumeStream>;
}

pub trait ContainerAccess {
    fn open(&self, path: &Path) -> Result<Box<dyn Container + '_>>;
}

// ---------------- filesystem ----------------

pub trait FilesystemAccess {
    /// Open a raw volume (device path or image file) for reading.
    fn open_volume(&self, device: &str) -> Result<VolumeStream>;

    fn read_allocation_bitmap(&self, volume: &mut dyn VolumeIo) -> Result<ClusterBitmap>;

    /// Mount the first partition of the image at `image` on directory `dir`.
    fn mount(&self, image: &Path, dir: &Path) -> Result<()>;

    fn unmount(&self, image: &Path, dir: &Path) -> Result<()>;

    /// Remove a file; `Ok(false)` when it did not exist.
    fn remove_file(&self, path: &Path) -> Result<bool>;

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>>;
}

// ---------------- registry ----------------

pub trait RegistryEditor {
    /// Move the `\DosDevices\<from>:` mapping of the offline `hive` to `<to>:`, or just delete it
    /// when `to` is None. `Ok(false)` when the hive carries no mapping for `from`.
    fn remap_drive_letter(&self, hive: &Path, from: char, to: Option<char>) -> Result<bool>;
}

// ---------------- host ----------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    /// Edition id (e.g. "Enterprise"); only queried where it matters.
    pub edition: Option<String>,
}

impl OsVersion {
    /// Native VHD boot: 6.1 and later, 6.1 itself only in Enterprise/Ultimate editions.
    pub fn supports_native_vhd_boot(&self) -> bool {
        if self.major < 6 || (self.major == 6 && self.minor == 0) {
            return false;
        }
        if self.major == 6 && self.minor == 1 {
            let ed = self
                .edition
                .as_deref()
                .unwrap_or_default()
                .to_ascii_lowercase();
            return ed.contains("enterprise") || ed.contains("ultimate");
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitLockerStatus {
    Off,
    On,
    EncryptionInProgress,
    DecryptionInProgress,
    Unknown,
}

impl BitLockerStatus {
    pub fn blocks_migration(self) -> bool {
        matches!(
            self,
            BitLockerStatus::On
                | BitLockerStatus::EncryptionInProgress
                | BitLockerStatus::DecryptionInProgress
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveInfo {
    pub letter: char,
    pub ready: bool,
    pub total_size: u64,
    /// Free space regardless of quotas.
    pub total_free: u64,
    /// Free space available to the current user.
    pub available_free: u64,
}

impl DriveInfo {
    pub fn used(&self) -> u64 {
        self.total_size.saturating_sub(self.total_free)
    }

    /// `X:\`
    pub fn root(&self) -> PathBuf {
        PathBuf::from(format!("{}:\\", self.letter))
    }
}

pub trait HostEnvironment {
    fn os_version(&self) -> Result<OsVersion>;

    fn bitlocker_status(&self, drive: char) -> Result<BitLockerStatus>;

    fn system_drive(&self) -> Result<DriveInfo>;

    fn drives(&self) -> Result<Vec<DriveInfo>>;

    fn drive(&self, letter: char) -> Result<DriveInfo> {
        let letter = letter.to_ascii_uppercase();
        self.drives()?
            .into_iter()
            .find(|d| d.letter == letter)
            .ok_or_else(|| MigrateError::Configuration(format!("drive {}: not found", letter)))
    }

    /// Directory holding the system tools (`diskpart.exe`, `bcdedit.exe`).
    fn tools_directory(&self) -> PathBuf;

    fn file_exists(&self, path: &Path) -> bool;

    fn tool_available(&self, tool: &str) -> bool {
        self.file_exists(&self.tools_directory().join(tool))
    }

    /// First drive letter (A..Z) not used by any drive.
    fn first_free_letter(&self) -> Result<Option<char>> {
        let used: Vec<char> = self.drives()?.iter().map(|d| d.letter).collect();
        Ok(('A'..='Z').find(|c| !used.contains(c)))
    }
}

/// Every collaborator a migration needs, borrowed for the lifetime of one pipeline.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub host: &'a dyn HostEnvironment,
    pub tools: &'a dyn ExternalToolRunner,
    pub snapshots: &'a dyn VolumeSnapshotProvider,
    pub containers: &'a dyn ContainerAccess,
    pub filesystem: &'a dyn FilesystemAccess,
    pub registry: &'a dyn RegistryEditor,
}

/// Drive letter of a Windows-style path (`D:\x` -> `D`).
pub fn drive_letter_of(path: &Path) -> Option<char> {
    let s = path.to_str()?;
    let mut chars = s.chars();
    let letter = chars.next()?;
    (letter.is_ascii_alphabetic() && chars.next() == Some(':')).then(|| letter.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_support_matrix() {
        let v = |major, minor, edition: Option<&str>| OsVersion {
            major,
            minor,
            build: 0,
            edition: edition.map(String::from),
        };
        assert!(!v(6, 0, None).supports_native_vhd_boot());
        assert!(!v(6, 1, Some("Professional")).supports_native_vhd_boot());
        assert!(v(6, 1, Some("Ultimate")).supports_native_vhd_boot());
        assert!(v(6, 1, Some("EnterpriseN")).supports_native_vhd_boot());
        assert!(v(6, 3, None).supports_native_vhd_boot());
        assert!(v(10, 0, None).supports_native_vhd_boot());
    }

    #[test]
    fn drive_letters() {
        assert_eq!(drive_letter_of(Path::new(r"d:\VHD_Boot")), Some('D'));
        assert_eq!(drive_letter_of(Path::new("/tmp/x")), None);
    }
}
