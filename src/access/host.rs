//! The local machine as a `HostEnvironment`.
//!
//! - drives: letters A..Z whose root exists, sizes from fs2
//! - OS version: `cmd /c ver`, edition from the registry when it decides support (6.1)
//! - BitLocker: `manage-bde -status <X>:`

use std::path::{Path, PathBuf};

use log::debug;

use crate::access::{BitLockerStatus, DriveInfo, ExternalToolRunner, HostEnvironment, OsVersion};
use crate::consts::{CMD, MANAGE_BDE, REG, REG_EDITION_KEY};
use crate::error::{MigrateError, Result};

/// `Microsoft Windows [Version 10.0.19045.3448]` -> (10, 0, 19045)
pub fn parse_ver_output(out: &str) -> Option<(u32, u32, u32)> {
    let start = out.find("Version ")? + "Version ".len();
    let rest = &out[start..];
    let end = rest.find(']').unwrap_or(rest.len());
    let mut nums = rest[..end].trim().split('.').map(|p| p.parse::<u32>().ok());
    let major = nums.next()??;
    let minor = nums.next()??;
    let build = nums.next().flatten().unwrap_or(0);
    Some((major, minor, build))
}

pub fn parse_bitlocker_status(out: &str) -> BitLockerStatus {
    let mut status = BitLockerStatus::Unknown;
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().to_ascii_lowercase();
        if key == "conversion status" {
            if value.contains("encryption in progress") {
                return BitLockerStatus::EncryptionInProgress;
            }
            if value.contains("decryption in progress") {
                return BitLockerStatus::DecryptionInProgress;
            }
            if value.contains("fully decrypted") {
                status = BitLockerStatus::Off;
            }
        } else if key == "protection status" && value.contains("protection on") {
            status = BitLockerStatus::On;
        }
    }
    status
}

pub struct LocalHost<'a> {
    tools: &'a dyn ExternalToolRunner,
    system_root: PathBuf,
}

impl<'a> LocalHost<'a> {
    pub fn new(tools: &'a dyn ExternalToolRunner) -> Self {
        let system_root = std::env::var("SystemRoot")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(r"C:\Windows"));
        Self { tools, system_root }
    }

    fn system_letter(&self) -> char {
        std::env::var("SystemDrive")
            .ok()
            .and_then(|s| s.chars().next())
            .or_else(|| self.system_root.to_str().and_then(|s| s.chars().next()))
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or('C')
    }

    fn edition(&self) -> Option<String> {
        let out = self
            .tools
            .run(REG, &["query", REG_EDITION_KEY, "/v", "EditionID"])
            .ok()?;
        out.stdout.lines().find_map(|line| {
            let mut t = line.split_whitespace();
            (t.next()? == "EditionID" && t.next()? == "REG_SZ").then(|| t.collect::<Vec<_>>().join(" "))
        })
    }
}

fn probe_drive(letter: char) -> Option<DriveInfo> {
    let root = format!("{}:\\", letter);
    let path = Path::new(&root);
    if !path.exists() {
        return None;
    }
    let sizes = (
        fs2::total_space(path),
        fs2::free_space(path),
        fs2::available_space(path),
    );
    Some(match sizes {
        (Ok(total), Ok(free), Ok(avail)) => DriveInfo {
            letter,
            ready: true,
            total_size: total,
            total_free: free,
            available_free: avail,
        },
        // present but not ready (empty card reader, locked volume)
        _ => DriveInfo {
            letter,
            ready: false,
            total_size: 0,
            total_free: 0,
            available_free: 0,
        },
    })
}

impl HostEnvironment for LocalHost<'_> {
    fn os_version(&self) -> Result<OsVersion> {
        let out = self.tools.run_checked(CMD, &["/c", "ver"])?;
        let (major, minor, build) = parse_ver_output(&out).ok_or_else(|| {
            MigrateError::Unsupported(format!("cannot parse OS version from '{}'", out.trim()))
        })?;
        let edition = if major == 6 && minor == 1 {
            self.edition()
        } else {
            None
        };
        debug!("host: os {}.{}.{} edition={:?}", major, minor, build, edition);
        Ok(OsVersion {
            major,
            minor,
            build,
            edition,
        })
    }

    fn bitlocker_status(&self, drive: char) -> Result<BitLockerStatus> {
        let vol = format!("{}:", drive);
        let out = self.tools.run(MANAGE_BDE, &["-status", &vol])?;
        if !out.success() {
            // tool missing on editions without BitLocker
            return Ok(BitLockerStatus::Unknown);
        }
        Ok(parse_bitlocker_status(&out.stdout))
    }

    fn system_drive(&self) -> Result<DriveInfo> {
        let letter = self.system_letter();
        probe_drive(letter)
            .ok_or_else(|| MigrateError::Unsupported(format!("system drive {}: not found", letter)))
    }

    fn drives(&self) -> Result<Vec<DriveInfo>> {
        Ok(('A'..='Z').filter_map(probe_drive).collect())
    }

    fn tools_directory(&self) -> PathBuf {
        self.system_root.join("System32")
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
