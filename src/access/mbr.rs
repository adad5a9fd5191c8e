//! MBR-partitioned disks.
//!
//! Sector 0 layout:
//! - [446..510) four 16-byte primary entries:
//!   status(1) chs_first(3) type(1) chs_last(3) lba_first(u32 LE) sectors(u32 LE)
//! - [510..512) signature 55 AA
//!
//! CHS fields are written as FE FF FF (LBA addressing only). Partition streams own a duplicated
//! device handle and always seek before each transfer, so several can coexist with the disk.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::access::{Container, ContainerAccess, PartitionInfo, PartitionKind, VolumeStream};
use crate::consts::{
    MBR_PART_ENTRIES, MBR_PART_ENTRY_SIZE, MBR_PART_TABLE_OFF, MBR_SIGNATURE, MBR_SIGNATURE_OFF,
    SECTOR_SIZE,
};
use crate::error::{IoContext, MigrateError, Result};

const CHS_LBA_ONLY: [u8; 3] = [0xFE, 0xFF, 0xFF];

/// Backing store of a disk that can hand out independent handles.
pub trait DiskDevice: Read + Write + Seek + 'static {
    fn duplicate(&self) -> io::Result<Self>
    where
        Self: Sized;
}

impl DiskDevice for File {
    fn duplicate(&self) -> io::Result<Self> {
        self.try_clone()
    }
}

// ---------------- in-memory disk ----------------

/// Growable in-memory disk. Clones share the bytes but keep their own position.
#[derive(Debug, Clone, Default)]
pub struct MemoryDisk {
    data: Rc<RefCell<Vec<u8>>>,
    pos: u64,
}

impl MemoryDisk {
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0u8; len])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Rc::new(RefCell::new(bytes)),
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.borrow().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }
}

impl Read for MemoryDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.borrow();
        let len = data.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.borrow_mut();
        let start = self.pos as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.len())?;
        Ok(self.pos)
    }
}

impl DiskDevice for MemoryDisk {
    fn duplicate(&self) -> io::Result<Self> {
        Ok(Self {
            data: Rc::clone(&self.data),
            pos: 0,
        })
    }
}

fn resolve_seek(pos: SeekFrom, current: u64, len: u64) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::End(off) => len.checked_add_signed(off),
        SeekFrom::Current(off) => current.checked_add_signed(off),
    };
    target.ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "seek before start of stream"))
}

// ---------------- partition stream ----------------

/// Window `[base, base + len)` over a disk device.
pub struct PartitionStream<F: DiskDevice> {
    dev: F,
    base: u64,
    len: u64,
    pos: u64,
}

impl<F: DiskDevice> PartitionStream<F> {
    pub fn new(dev: F, base: u64, len: u64) -> Self {
        Self {
            dev,
            base,
            len,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<F: DiskDevice> Read for PartitionStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(self.len - self.pos) as usize;
        self.dev.seek(SeekFrom::Start(self.base + self.pos))?;
        let got = self.dev.read(&mut buf[..n])?;
        self.pos += got as u64;
        Ok(got)
    }
}

impl<F: DiskDevice> Write for PartitionStream<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.len {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "write past end of partition",
            ));
        }
        let n = (buf.len() as u64).min(self.len - self.pos) as usize;
        self.dev.seek(SeekFrom::Start(self.base + self.pos))?;
        let put = self.dev.write(&buf[..n])?;
        self.pos += put as u64;
        Ok(put)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dev.flush()
    }
}

impl<F: DiskDevice> Seek for PartitionStream<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.len)?;
        Ok(self.pos)
    }
}

// ---------------- MBR disk ----------------

pub struct MbrDisk<F: DiskDevice> {
    dev: F,
    capacity: u64,
    bytes_per_sector: u64,
}

impl<F: DiskDevice> MbrDisk<F> {
    /// Open a disk whose length is its capacity.
    pub fn open(mut dev: F) -> Result<Self> {
        let capacity = dev.seek(SeekFrom::End(0)).op("measure disk")?;
        Ok(Self::with_capacity(dev, capacity))
    }

    /// Open a device that cannot report its own length (raw physical drives).
    pub fn with_capacity(dev: F, capacity: u64) -> Self {
        Self {
            dev,
            capacity,
            bytes_per_sector: SECTOR_SIZE,
        }
    }

    /// Write an empty partition table (boot code bytes are kept).
    pub fn initialize(dev: F) -> Result<Self> {
        let mut disk = Self::open(dev)?;
        let mut mbr = disk.read_sector0()?;
        mbr[MBR_PART_TABLE_OFF..MBR_SIGNATURE_OFF].fill(0);
        mbr[MBR_SIGNATURE_OFF..MBR_SIGNATURE_OFF + 2].copy_from_slice(&MBR_SIGNATURE);
        disk.write_sector0(&mbr)?;
        if disk.capacity < SECTOR_SIZE {
            disk.capacity = SECTOR_SIZE;
        }
        Ok(disk)
    }

    pub fn into_inner(self) -> F {
        self.dev
    }

    fn read_sector0(&mut self) -> Result<[u8; SECTOR_SIZE as usize]> {
        let mut mbr = [0u8; SECTOR_SIZE as usize];
        self.dev.seek(SeekFrom::Start(0)).op("seek mbr")?;
        let mut filled = 0;
        while filled < mbr.len() {
            match self.dev.read(&mut mbr[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(MigrateError::io("read mbr", e)),
            }
        }
        Ok(mbr)
    }

    fn write_sector0(&mut self, mbr: &[u8; SECTOR_SIZE as usize]) -> Result<()> {
        self.dev.seek(SeekFrom::Start(0)).op("seek mbr")?;
        self.dev.write_all(mbr).op("write mbr")?;
        self.dev.flush().op("flush mbr")
    }

    fn table(&mut self) -> Result<([u8; SECTOR_SIZE as usize], [Option<PartitionInfo>; 4])> {
        let mbr = self.read_sector0()?;
        if mbr[MBR_SIGNATURE_OFF..MBR_SIGNATURE_OFF + 2] != MBR_SIGNATURE {
            return Err(MigrateError::Unsupported(
                "disk does not carry an MBR partition table".into(),
            ));
        }
        let mut out = [None; MBR_PART_ENTRIES];
        for (i, slot) in out.iter_mut().enumerate() {
            let off = MBR_PART_TABLE_OFF + i * MBR_PART_ENTRY_SIZE;
            let e = &mbr[off..off + MBR_PART_ENTRY_SIZE];
            let kind = e[4];
            let sectors = LittleEndian::read_u32(&e[12..16]) as u64;
            if kind == 0 || sectors == 0 {
                continue;
            }
            *slot = Some(PartitionInfo {
                index: i,
                kind: PartitionKind::from_type_byte(kind),
                first_sector: LittleEndian::read_u32(&e[8..12]) as u64,
                sector_count: sectors,
                active: e[0] == 0x80,
            });
        }
        Ok((mbr, out))
    }
}

impl<F: DiskDevice> Container for MbrDisk<F> {
    fn bytes_per_sector(&self) -> u64 {
        self.bytes_per_sector
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn partitions(&mut self) -> Result<Vec<PartitionInfo>> {
        let (_, table) = self.table()?;
        Ok(table.into_iter().flatten().collect())
    }

    fn create_primary_partition(
        &mut self,
        first_sector: u64,
        last_sector: u64,
        kind: PartitionKind,
        active: bool,
    ) -> Result<usize> {
        if first_sector == 0 || last_sector < first_sector {
            return Err(MigrateError::Configuration(format!(
                "invalid partition sectors {}..={}",
                first_sector, last_sector
            )));
        }
        let disk_sectors = self.capacity / self.bytes_per_sector;
        if last_sector >= disk_sectors {
            return Err(MigrateError::Configuration(format!(
                "partition end sector {} beyond disk of {} sectors",
                last_sector, disk_sectors
            )));
        }
        let count = last_sector - first_sector + 1;
        if last_sector > u32::MAX as u64 {
            return Err(MigrateError::Unsupported(
                "partition beyond the 2 TiB MBR limit".into(),
            ));
        }

        let (mut mbr, table) = self.table()?;
        for p in table.iter().flatten() {
            let p_last = p.first_sector + p.sector_count - 1;
            if first_sector <= p_last && p.first_sector <= last_sector {
                return Err(MigrateError::Configuration(format!(
                    "partition overlaps existing partition {}",
                    p.index
                )));
            }
        }
        let slot = table
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| MigrateError::Unsupported("partition table is full".into()))?;

        if active {
            for i in 0..MBR_PART_ENTRIES {
                mbr[MBR_PART_TABLE_OFF + i * MBR_PART_ENTRY_SIZE] = 0;
            }
        }
        let off = MBR_PART_TABLE_OFF + slot * MBR_PART_ENTRY_SIZE;
        let e = &mut mbr[off..off + MBR_PART_ENTRY_SIZE];
        e[0] = if active { 0x80 } else { 0x00 };
        e[1..4].copy_from_slice(&CHS_LBA_ONLY);
        e[4] = kind.type_byte();
        e[5..8].copy_from_slice(&CHS_LBA_ONLY);
        LittleEndian::write_u32(&mut e[8..12], first_sector as u32);
        LittleEndian::write_u32(&mut e[12..16], count as u32);
        self.write_sector0(&mbr)?;

        debug!(
            "mbr: created partition {} sectors {}..={} type={:#04x}",
            slot,
            first_sector,
            last_sector,
            kind.type_byte()
        );
        Ok(slot)
    }

    fn open_partition(&mut self, index: usize) -> Result<VolumeStream> {
        let (_, table) = self.table()?;
        let p = table
            .get(index)
            .copied()
            .flatten()
            .ok_or_else(|| MigrateError::Configuration(format!("no partition at index {}", index)))?;
        let dev = self.dev.duplicate().op("duplicate disk handle")?;
        Ok(Box::new(PartitionStream::new(
            dev,
            p.first_sector * self.bytes_per_sector,
            p.sector_count * self.bytes_per_sector,
        )))
    }
}

/// Opens raw (headerless) disk image files.
#[derive(Debug, Clone, Copy, Default)]
pub struct MbrImageAccess;

impl ContainerAccess for MbrImageAccess {
    fn open(&self, path: &Path) -> Result<Box<dyn Container + '_>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .op("open disk image")?;
        Ok(Box::new(MbrDisk::open(file)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_reopen_partition() {
        let dev = MemoryDisk::new(64 * 512);
        let mut disk = MbrDisk::initialize(dev.clone()).unwrap();
        assert!(disk.partitions().unwrap().is_empty());

        let idx = disk
            .create_primary_partition(1, 32, PartitionKind::Ntfs, false)
            .unwrap();
        assert_eq!(idx, 0);

        let mut reopened = MbrDisk::open(dev.duplicate().unwrap()).unwrap();
        let parts = reopened.partitions().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].first_sector, 1);
        assert_eq!(parts[0].sector_count, 32);
        assert_eq!(parts[0].kind, PartitionKind::Ntfs);

        let mut s = reopened.open_partition(0).unwrap();
        assert_eq!(s.seek(SeekFrom::End(0)).unwrap(), 32 * 512);
        s.seek(SeekFrom::Start(0)).unwrap();
        s.write_all(b"NTFS").unwrap();
        assert_eq!(&dev.to_vec()[512..516], b"NTFS");
    }

    #[test]
    fn overlap_and_bounds_are_rejected() {
        let mut disk = MbrDisk::initialize(MemoryDisk::new(64 * 512)).unwrap();
        disk.create_primary_partition(1, 10, PartitionKind::Ntfs, true)
            .unwrap();
        assert!(disk
            .create_primary_partition(10, 20, PartitionKind::Ntfs, false)
            .is_err());
        assert!(disk
            .create_primary_partition(11, 64, PartitionKind::Ntfs, false)
            .is_err());
        assert_eq!(
            disk.create_primary_partition(11, 63, PartitionKind::Other(0x83), false)
                .unwrap(),
            1
        );
    }

    #[test]
    fn raw_image_file_through_container_access() {
        let path = std::env::temp_dir().join(format!("bootclone-mbr-{}.img", std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(128 * 512).unwrap();
        MbrDisk::initialize(file).unwrap();

        {
            let mut c = MbrImageAccess.open(&path).unwrap();
            assert_eq!(c.capacity(), 128 * 512);
            c.create_primary_partition(1, 127, PartitionKind::Ntfs, true)
                .unwrap();
        }
        let mut c = MbrImageAccess.open(&path).unwrap();
        let parts = c.partitions().unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].active);
        assert_eq!(parts[0].sector_count, 127);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn blank_disk_has_no_table() {
        let mut disk = MbrDisk::open(MemoryDisk::new(4096)).unwrap();
        assert!(matches!(
            disk.partitions(),
            Err(MigrateError::Unsupported(_))
        ));
    }

    #[test]
    fn partition_stream_refuses_writes_past_end() {
        let mut s = PartitionStream::new(MemoryDisk::new(2048), 512, 512);
        s.seek(SeekFrom::Start(510)).unwrap();
        assert!(s.write_all(&[1, 2, 3, 4]).is_err());
        let mut buf = [0u8; 8];
        s.seek(SeekFrom::Start(508)).unwrap();
        assert_eq!(s.read(&mut buf).unwrap(), 4);
    }
}
