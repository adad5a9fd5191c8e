//! NTFS volumes: raw access, `$Bitmap` extraction, mounted-partition file operations.
//!
//! Reading the allocation bitmap needs only a handful of on-disk structures:
//! - boot sector: bytes/sector @0x0B, sectors/cluster @0x0D, total sectors @0x28,
//!   MFT cluster @0x30, clusters (or 2^-n bytes) per MFT record @0x40
//! - MFT record 6 (`$Bitmap`), after update-sequence fixups
//! - its unnamed `$DATA` attribute, resident or described by data runs
//!
//! Mounting goes through diskpart; removing and listing files is plain std::fs on the mount.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use crate::access::mbr::PartitionStream;
use crate::access::{DiskpartScript, ExternalToolRunner, FilesystemAccess, VolumeIo, VolumeStream};
use crate::consts::{
    NTFS_ATTR_DATA, NTFS_ATTR_END, NTFS_BITMAP_RECORD, NTFS_FILE_MAGIC, NTFS_MAX_RECORD_SIZE,
    NTFS_OEM_ID, SECTOR_SIZE,
};
use crate::error::{IoContext, MigrateError, Result};
use crate::extent::ClusterBitmap;

fn bad_geometry(what: &str) -> MigrateError {
    MigrateError::Unsupported(format!("NTFS boot sector: {}", what))
}

/// `2^exp`, rejecting exponents that do not fit a u64.
fn pow2(exp: u32, what: &str) -> Result<u64> {
    1u64.checked_shl(exp)
        .ok_or_else(|| bad_geometry(&format!("{} exponent {} out of range", what, exp)))
}

/// Volume geometry from the NTFS boot sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsGeometry {
    pub bytes_per_sector: u64,
    pub bytes_per_cluster: u64,
    pub total_sectors: u64,
    pub mft_cluster: u64,
    pub mft_record_size: u64,
}

impl NtfsGeometry {
    pub fn parse(boot: &[u8]) -> Result<Self> {
        if boot.len() < SECTOR_SIZE as usize || &boot[3..11] != NTFS_OEM_ID {
            return Err(MigrateError::Unsupported(
                "volume is not formatted with NTFS".into(),
            ));
        }
        let bytes_per_sector = LittleEndian::read_u16(&boot[0x0B..0x0D]) as u64;
        let spc_raw = boot[0x0D];
        let sectors_per_cluster = if spc_raw > 0x80 {
            pow2(256 - spc_raw as u32, "sectors per cluster")?
        } else {
            spc_raw as u64
        };
        let bytes_per_cluster = bytes_per_sector
            .checked_mul(sectors_per_cluster)
            .ok_or_else(|| bad_geometry("cluster size overflows"))?;
        let total_sectors = LittleEndian::read_u64(&boot[0x28..0x30]);
        let mft_cluster = LittleEndian::read_u64(&boot[0x30..0x38]);
        let rec = boot[0x40] as i8;
        let mft_record_size = if rec < 0 {
            pow2(rec.unsigned_abs() as u32, "MFT record size")?
        } else {
            (rec as u64)
                .checked_mul(bytes_per_cluster)
                .ok_or_else(|| bad_geometry("MFT record size overflows"))?
        };

        if bytes_per_sector == 0 || bytes_per_cluster == 0 {
            return Err(bad_geometry("zero sector or cluster size"));
        }
        if !(SECTOR_SIZE..=NTFS_MAX_RECORD_SIZE).contains(&mft_record_size) {
            return Err(bad_geometry("MFT record size out of range"));
        }
        Ok(Self {
            bytes_per_sector,
            bytes_per_cluster,
            total_sectors,
            mft_cluster,
            mft_record_size,
        })
    }

    /// Volume length; the backup boot sector sits one sector past `total_sectors`.
    pub fn volume_len(&self) -> u64 {
        self.total_sectors
            .saturating_add(1)
            .saturating_mul(self.bytes_per_sector)
    }
}

fn read_exact_at(volume: &mut dyn VolumeIo, offset: u64, buf: &mut [u8]) -> Result<()> {
    volume.seek(SeekFrom::Start(offset)).op("seek volume")?;
    volume.read_exact(buf).op("read volume")
}

/// Undo the update-sequence protection of an MFT record in place.
fn apply_fixups(rec: &mut [u8]) -> Result<()> {
    let usa_off = LittleEndian::read_u16(&rec[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&rec[6..8]) as usize;
    if usa_count < 2 || usa_off + usa_count * 2 > rec.len() {
        return Err(MigrateError::Unsupported("corrupt MFT record header".into()));
    }
    let stride = rec.len() / (usa_count - 1);
    let usn = [rec[usa_off], rec[usa_off + 1]];
    for i in 1..usa_count {
        let end = i * stride;
        if rec[end - 2..end] != usn {
            return Err(MigrateError::Unsupported(
                "MFT record failed update sequence check".into(),
            ));
        }
        let fix = usa_off + i * 2;
        let (a, b) = (rec[fix], rec[fix + 1]);
        rec[end - 2] = a;
        rec[end - 1] = b;
    }
    Ok(())
}

/// (cluster, length) runs; `None` cluster marks a sparse run.
fn parse_data_runs(mut runs: &[u8]) -> Result<Vec<(Option<u64>, u64)>> {
    let mut out = Vec::new();
    let mut lcn: i64 = 0;
    while let Some(&header) = runs.first() {
        if header == 0 {
            break;
        }
        let len_size = (header & 0x0F) as usize;
        let off_size = (header >> 4) as usize;
        if len_size == 0 || len_size > 8 || off_size > 8 || runs.len() < 1 + len_size + off_size {
            return Err(MigrateError::Unsupported("corrupt NTFS data run".into()));
        }
        let length = LittleEndian::read_uint(&runs[1..1 + len_size], len_size);
        if off_size == 0 {
            out.push((None, length));
        } else {
            let delta = LittleEndian::read_int(&runs[1 + len_size..1 + len_size + off_size], off_size);
            lcn += delta;
            if lcn < 0 {
                return Err(MigrateError::Unsupported("NTFS data run before volume start".into()));
            }
            out.push((Some(lcn as u64), length));
        }
        runs = &runs[1 + len_size + off_size..];
    }
    Ok(out)
}

/// Read the `$Bitmap` content of an NTFS volume.
pub fn read_ntfs_bitmap(volume: &mut dyn VolumeIo) -> Result<ClusterBitmap> {
    let mut boot = [0u8; SECTOR_SIZE as usize];
    read_exact_at(volume, 0, &mut boot)?;
    let geo = NtfsGeometry::parse(&boot)?;

    let rec_size = geo.mft_record_size as usize;
    let mut rec = vec![0u8; rec_size];
    let rec_off = geo
        .mft_cluster
        .checked_mul(geo.bytes_per_cluster)
        .and_then(|o| o.checked_add(NTFS_BITMAP_RECORD * geo.mft_record_size))
        .ok_or_else(|| bad_geometry("MFT location overflows"))?;
    read_exact_at(volume, rec_off, &mut rec)?;
    if &rec[0..4] != NTFS_FILE_MAGIC {
        return Err(MigrateError::Unsupported("$Bitmap MFT record is not in use".into()));
    }
    apply_fixups(&mut rec)?;

    let mut at = LittleEndian::read_u16(&rec[0x14..0x16]) as usize;
    while at + 16 <= rec.len() {
        let kind = LittleEndian::read_u32(&rec[at..at + 4]);
        if kind == NTFS_ATTR_END {
            break;
        }
        let attr_len = LittleEndian::read_u32(&rec[at + 4..at + 8]) as usize;
        if attr_len == 0 || at + attr_len > rec.len() {
            break;
        }
        let attr = &rec[at..at + attr_len];
        if attr.len() < 0x18 {
            return Err(MigrateError::Unsupported("corrupt MFT attribute".into()));
        }
        let non_resident = attr[8] != 0;
        let unnamed = attr[9] == 0;

        if kind == NTFS_ATTR_DATA && unnamed {
            let bits = if non_resident {
                if attr.len() < 0x40 {
                    return Err(MigrateError::Unsupported("corrupt non-resident $DATA".into()));
                }
                let runs_off = LittleEndian::read_u16(&attr[0x20..0x22]) as usize;
                let real_size = LittleEndian::read_u64(&attr[0x30..0x38]);
                let runs = attr
                    .get(runs_off..)
                    .ok_or_else(|| MigrateError::Unsupported("corrupt $DATA run list".into()))?;
                let mut data = Vec::with_capacity(real_size as usize);
                for (lcn, clusters) in parse_data_runs(runs)? {
                    let start = data.len();
                    data.resize(start + (clusters * geo.bytes_per_cluster) as usize, 0);
                    if let Some(lcn) = lcn {
                        read_exact_at(volume, lcn * geo.bytes_per_cluster, &mut data[start..])?;
                    }
                    if data.len() as u64 >= real_size {
                        break;
                    }
                }
                data.truncate(real_size as usize);
                data
            } else {
                let len = LittleEndian::read_u32(&attr[0x10..0x14]) as usize;
                let off = LittleEndian::read_u16(&attr[0x14..0x16]) as usize;
                attr.get(off..off + len)
                    .ok_or_else(|| MigrateError::Unsupported("corrupt resident $DATA".into()))?
                    .to_vec()
            };
            debug!(
                "ntfs: bitmap {} bytes, cluster={}",
                bits.len(),
                geo.bytes_per_cluster
            );
            return Ok(ClusterBitmap::new(bits, geo.bytes_per_cluster));
        }
        at += attr_len;
    }
    Err(MigrateError::Unsupported("$Bitmap has no data attribute".into()))
}

pub struct NtfsVolumes<'a> {
    tools: &'a dyn ExternalToolRunner,
}

impl<'a> NtfsVolumes<'a> {
    pub fn new(tools: &'a dyn ExternalToolRunner) -> Self {
        Self { tools }
    }
}

fn script_dir(image: &Path) -> &Path {
    image.parent().unwrap_or_else(|| Path::new("."))
}

impl FilesystemAccess for NtfsVolumes<'_> {
    fn open_volume(&self, device: &str) -> Result<VolumeStream> {
        let mut file = File::open(device).op("open volume")?;
        // raw devices do not always report a length; fall back to the NTFS geometry
        let len = match file.seek(SeekFrom::End(0)) {
            Ok(n) if n > 0 => n,
            _ => {
                let mut boot = [0u8; SECTOR_SIZE as usize];
                file.seek(SeekFrom::Start(0)).op("seek volume")?;
                file.read_exact(&mut boot).op("read boot sector")?;
                NtfsGeometry::parse(&boot)?.volume_len()
            }
        };
        file.seek(SeekFrom::Start(0)).op("seek volume")?;
        debug!("ntfs: opened {} len={}", device, len);
        Ok(Box::new(PartitionStream::new(file, 0, len)))
    }

    fn read_allocation_bitmap(&self, volume: &mut dyn VolumeIo) -> Result<ClusterBitmap> {
        read_ntfs_bitmap(volume)
    }

    fn mount(&self, image: &Path, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).op("create mount folder")?;
        info!("ntfs: mounting {} on {}", image.display(), dir.display());
        DiskpartScript::mount_partition(image, dir).run(self.tools, script_dir(image))?;
        Ok(())
    }

    fn unmount(&self, image: &Path, dir: &Path) -> Result<()> {
        DiskpartScript::unmount_partition(image, dir).run(self.tools, script_dir(image))?;
        if let Err(e) = fs::remove_dir(dir) {
            debug!("ntfs: leaving mount folder {}: {}", dir.display(), e);
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                // read-only attribute
                let mut perms = fs::metadata(path).op("stat file")?.permissions();
                perms.set_readonly(false);
                fs::set_permissions(path, perms).op("clear read-only")?;
                fs::remove_file(path).op("remove file")?;
                Ok(true)
            }
            Err(e) => Err(MigrateError::io("remove file", e)),
        }
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let rd = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MigrateError::io("list folder", e)),
        };
        let mut out = Vec::new();
        for entry in rd {
            out.push(entry.op("list folder")?.path());
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemoryDisk;
    use std::io::Write;

    const CLUSTER: usize = 4096;
    const RECORD: usize = 1024;

    fn boot_sector(total_sectors: u64, mft_cluster: u64) -> Vec<u8> {
        let mut b = vec![0u8; 512];
        b[3..11].copy_from_slice(NTFS_OEM_ID);
        LittleEndian::write_u16(&mut b[0x0B..0x0D], 512);
        b[0x0D] = 8;
        LittleEndian::write_u64(&mut b[0x28..0x30], total_sectors);
        LittleEndian::write_u64(&mut b[0x30..0x38], mft_cluster);
        b[0x40] = (-10i8) as u8; // 1024-byte records
        b
    }

    /// MFT record with a non-resident $DATA attribute, fixups applied as on disk.
    fn bitmap_record(runs: &[u8], real_size: u64) -> Vec<u8> {
        let mut r = vec![0u8; RECORD];
        r[0..4].copy_from_slice(NTFS_FILE_MAGIC);
        LittleEndian::write_u16(&mut r[4..6], 0x30);
        LittleEndian::write_u16(&mut r[6..8], 3);
        LittleEndian::write_u16(&mut r[0x14..0x16], 0x38);

        let a = 0x38;
        let attr_len = 0x40 + 16;
        LittleEndian::write_u32(&mut r[a..a + 4], NTFS_ATTR_DATA);
        LittleEndian::write_u32(&mut r[a + 4..a + 8], attr_len as u32);
        r[a + 8] = 1;
        LittleEndian::write_u16(&mut r[a + 0x20..a + 0x22], 0x40);
        LittleEndian::write_u64(&mut r[a + 0x30..a + 0x38], real_size);
        r[a + 0x40..a + 0x40 + runs.len()].copy_from_slice(runs);
        LittleEndian::write_u32(&mut r[a + attr_len..a + attr_len + 4], NTFS_ATTR_END);

        // update sequence: usn 0x0001, originals saved in the array
        r[0x30] = 1;
        for i in 1..3 {
            let end = i * 512;
            r[0x30 + i * 2] = r[end - 2];
            r[0x30 + i * 2 + 1] = r[end - 1];
            r[end - 2] = 1;
            r[end - 1] = 0;
        }
        r
    }

    #[test]
    fn reads_non_resident_bitmap() {
        let mut disk = MemoryDisk::new(16 * CLUSTER);
        disk.write_all(&boot_sector(16 * 8 - 1, 2)).unwrap();

        // bitmap content in cluster 10
        disk.seek(SeekFrom::Start(10 * CLUSTER as u64)).unwrap();
        disk.write_all(&[0b0000_0111, 0xFF]).unwrap();

        // one run: 1 cluster at lcn 10
        let rec = bitmap_record(&[0x11, 0x01, 0x0A, 0x00], 2);
        disk.seek(SeekFrom::Start((2 * CLUSTER + 6 * RECORD) as u64)).unwrap();
        disk.write_all(&rec).unwrap();

        let bm = read_ntfs_bitmap(&mut disk).unwrap();
        assert_eq!(bm.bytes_per_cluster(), CLUSTER as u64);
        assert_eq!(bm.as_bytes(), &[0b0000_0111, 0xFF]);
    }

    #[test]
    fn data_runs_decode_relative_offsets() {
        // 4 clusters @100, then 2 clusters @ 100-16=84, then sparse 3
        let runs = [0x21, 0x04, 0x64, 0x00, 0x11, 0x02, 0xF0, 0x01, 0x03, 0x00];
        let got = parse_data_runs(&runs).unwrap();
        assert_eq!(got, vec![(Some(100), 4), (Some(84), 2), (None, 3)]);
    }

    #[test]
    fn out_of_range_geometry_is_rejected() {
        // 2^(256-0x81) sectors per cluster
        let mut b = boot_sector(100, 2);
        b[0x0D] = 0x81;
        assert!(matches!(NtfsGeometry::parse(&b), Err(MigrateError::Unsupported(_))));

        // 2^128-byte records
        let mut b = boot_sector(100, 2);
        b[0x40] = 0x80;
        assert!(matches!(NtfsGeometry::parse(&b), Err(MigrateError::Unsupported(_))));

        // 4-byte records would not even hold the FILE magic and fixup header
        let mut b = boot_sector(100, 2);
        b[0x40] = (-2i8) as u8;
        let mut disk = MemoryDisk::new(4096);
        disk.write_all(&b).unwrap();
        assert!(matches!(
            read_ntfs_bitmap(&mut disk),
            Err(MigrateError::Unsupported(_))
        ));

        let geo = NtfsGeometry::parse(&boot_sector(100, 2)).unwrap();
        assert_eq!(geo.bytes_per_cluster, 4096);
        assert_eq!(geo.mft_record_size, 1024);
    }

    #[test]
    fn rejects_non_ntfs() {
        let mut disk = MemoryDisk::new(4096);
        assert!(matches!(
            read_ntfs_bitmap(&mut disk),
            Err(MigrateError::Unsupported(_))
        ));
    }
}
