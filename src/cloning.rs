//! Volume-to-volume clone on top of the sparse pump.
//!
//! Only allocated clusters are copied: the source allocation bitmap is turned into extents and
//! handed to `SparsePump`. Progress goes to the log at 1% steps.

use std::io::{Seek, SeekFrom};

use log::info;

use crate::access::{FilesystemAccess, VolumeIo};
use crate::error::{IoContext, MigrateError, Result};
use crate::extent::Extent;
use crate::pump::{CopyProgress, CopyResult, ProgressFn, SparsePump};

/// Logs a line each time another whole percent of `total` has been read.
struct PercentLog {
    total: u64,
    percent: u64,
}

impl PercentLog {
    fn new(total: u64) -> Self {
        Self { total, percent: 0 }
    }

    fn observe(&mut self, p: &CopyProgress) {
        if self.total == 0 {
            return;
        }
        let reached = (p.bytes_read.saturating_mul(100) / self.total).min(100);
        if reached > self.percent {
            self.percent = reached;
            info!(
                "clone: {}% ({} of {} bytes, {} written)",
                reached, p.bytes_read, self.total, p.bytes_written
            );
        }
    }
}

/// Clone the filesystem in `source` into `dest`.
///
/// `dest` must be at least as long as `source`. Both streams stay owned by the caller.
pub fn clone_volume(
    fs: &dyn FilesystemAccess,
    source: &mut dyn VolumeIo,
    dest: &mut dyn VolumeIo,
    pump: &SparsePump,
) -> Result<CopyResult> {
    let src_len = source.seek(SeekFrom::End(0)).op("measure source volume")?;
    let dst_len = dest.seek(SeekFrom::End(0)).op("measure destination volume")?;
    if dst_len < src_len {
        return Err(MigrateError::Configuration(format!(
            "destination volume ({} bytes) is smaller than the source ({} bytes)",
            dst_len, src_len
        )));
    }

    source.seek(SeekFrom::Start(0)).op("rewind source volume")?;
    let extents: Vec<Extent> = if pump.is_sparse() {
        let bitmap = fs.read_allocation_bitmap(source)?;
        bitmap.extents(src_len).collect()
    } else {
        Vec::new()
    };
    let total = if pump.is_sparse() {
        extents.iter().map(|e| e.length).sum()
    } else {
        src_len
    };
    info!(
        "clone: {} of {} bytes in use ({} extents)",
        total,
        src_len,
        extents.len()
    );

    let mut log = PercentLog::new(total);
    let mut observe = |p: &CopyProgress| log.observe(p);
    let progress: ProgressFn<'_> = &mut observe;
    let result = pump.run(source, dest, extents, Some(progress))?;
    info!(
        "clone: finished, read={} written={}",
        result.bytes_read, result.bytes_written
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_log_only_moves_forward() {
        let mut log = PercentLog::new(1000);
        let at = |n| CopyProgress {
            bytes_read: n,
            ..CopyProgress::default()
        };
        log.observe(&at(5));
        assert_eq!(log.percent, 0);
        log.observe(&at(250));
        assert_eq!(log.percent, 25);
        log.observe(&at(100));
        assert_eq!(log.percent, 25);
        log.observe(&at(5000));
        assert_eq!(log.percent, 100);
    }
}
