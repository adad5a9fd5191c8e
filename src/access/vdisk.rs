//! VHD/VHDX images through the OS virtual disk driver.
//!
//! Opening attaches the image with diskpart and reads `detail vdisk` for the backing disk
//! number and size; the physical drive is then handled as an MBR disk. Dropping the container
//! detaches the image again.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::access::mbr::MbrDisk;
use crate::access::{
    Container, ContainerAccess, DiskpartScript, ExternalToolRunner, PartitionInfo, PartitionKind,
    VolumeStream,
};
use crate::error::{IoContext, MigrateError, Result};

/// Facts parsed from `detail vdisk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdiskDetail {
    pub disk_number: u32,
    pub virtual_size: Option<u64>,
}

fn parse_size(s: &str) -> Option<u64> {
    let mut parts = s.split_whitespace();
    let num: f64 = parts.next()?.replace(',', ".").parse().ok()?;
    let mult: u64 = match parts.next().unwrap_or("B").to_ascii_uppercase().as_str() {
        "B" | "BYTES" => 1,
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        "TB" => 1 << 40,
        _ => return None,
    };
    Some((num * mult as f64) as u64)
}

pub fn parse_vdisk_detail(output: &str) -> Option<VdiskDetail> {
    let mut disk_number = None;
    let mut virtual_size = None;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if key.starts_with("associated disk") {
            disk_number = value.parse::<u32>().ok();
        } else if key == "virtual size" {
            virtual_size = parse_size(value);
        }
    }
    disk_number.map(|disk_number| VdiskDetail {
        disk_number,
        virtual_size,
    })
}

pub struct VirtualDiskAccess<'a> {
    tools: &'a dyn ExternalToolRunner,
}

impl<'a> VirtualDiskAccess<'a> {
    pub fn new(tools: &'a dyn ExternalToolRunner) -> Self {
        Self { tools }
    }
}

fn script_dir(image: &Path) -> &Path {
    image.parent().unwrap_or_else(|| Path::new("."))
}

impl ContainerAccess for VirtualDiskAccess<'_> {
    fn open(&self, path: &Path) -> Result<Box<dyn Container + '_>> {
        let out = DiskpartScript::attach_image(path).run(self.tools, script_dir(path))?;
        let mut attached = AttachedImage {
            disk: None,
            tools: self.tools,
            image: path.to_path_buf(),
        };

        let detail = parse_vdisk_detail(&out).ok_or_else(|| {
            MigrateError::Unsupported(format!(
                "cannot find the disk backing {}",
                path.display()
            ))
        })?;
        let device = format!(r"\\.\PhysicalDrive{}", detail.disk_number);
        debug!("vdisk: {} attached as {}", path.display(), device);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device)
            .op("open attached disk")?;
        let capacity = detail.virtual_size.unwrap_or(0);
        attached.disk = Some(MbrDisk::with_capacity(file, capacity));
        Ok(Box::new(attached))
    }
}

/// Attached image; detached on drop.
struct AttachedImage<'a> {
    disk: Option<MbrDisk<std::fs::File>>,
    tools: &'a dyn ExternalToolRunner,
    image: PathBuf,
}

impl AttachedImage<'_> {
    fn disk(&mut self) -> Result<&mut MbrDisk<std::fs::File>> {
        self.disk
            .as_mut()
            .ok_or_else(|| MigrateError::Unsupported("image is not attached".into()))
    }
}

impl Container for AttachedImage<'_> {
    fn bytes_per_sector(&self) -> u64 {
        self.disk.as_ref().map_or(0, |d| d.bytes_per_sector())
    }

    fn capacity(&self) -> u64 {
        self.disk.as_ref().map_or(0, |d| d.capacity())
    }

    fn partitions(&mut self) -> Result<Vec<PartitionInfo>> {
        self.disk()?.partitions()
    }

    fn create_primary_partition(
        &mut self,
        first_sector: u64,
        last_sector: u64,
        kind: PartitionKind,
        active: bool,
    ) -> Result<usize> {
        self.disk()?
            .create_primary_partition(first_sector, last_sector, kind, active)
    }

    fn open_partition(&mut self, index: usize) -> Result<VolumeStream> {
        self.disk()?.open_partition(index)
    }
}

impl Drop for AttachedImage<'_> {
    fn drop(&mut self) {
        // close the device handle before detaching
        self.disk = None;
        if let Err(e) =
            DiskpartScript::detach_image(&self.image).run(self.tools, script_dir(&self.image))
        {
            warn!("vdisk: detach of {} failed: {}", self.image.display(), e);
        }
    }
}
