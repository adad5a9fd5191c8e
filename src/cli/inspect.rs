use anyhow::{anyhow, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

use crate::access::{FilesystemAccess, NtfsVolumes, ProcessToolRunner};
use crate::cloning::clone_volume;
use crate::extent::{bitmap_to_extents, total_length, ClusterBitmap};
use crate::metrics::metrics_snapshot;
use crate::pump::SparsePump;

pub(super) fn cmd_extents(bitmap: PathBuf, cluster_size: u64, volume_len: u64, json: bool) -> Result<i32> {
    if cluster_size == 0 {
        return Err(anyhow!("--cluster-size must be greater than 0"));
    }
    let bits = fs::read(&bitmap).with_context(|| format!("read bitmap {}", bitmap.display()))?;
    let bm = ClusterBitmap::new(bits, cluster_size);
    let extents = bitmap_to_extents(&bm, volume_len);

    if json {
        println!("{}", serde_json::to_string_pretty(&extents)?);
        return Ok(0);
    }
    for e in &extents {
        println!("{:>16} {:>16}", e.start, e.length);
    }
    println!(
        "{} extents, {} of {} bytes allocated",
        extents.len(),
        total_length(&extents),
        volume_len
    );
    Ok(0)
}

pub(super) fn cmd_clone(
    source: &str,
    dest: PathBuf,
    full: bool,
    chunk_size: usize,
    buffer_size: usize,
    json: bool,
) -> Result<i32> {
    let tools = ProcessToolRunner::new();
    let fs = NtfsVolumes::new(&tools);
    let pump = SparsePump::new()
        .with_chunk_size(chunk_size)
        .with_buffer_size(buffer_size)
        .with_sparse(!full);
    pump.validate()?;

    let mut src = fs.open_volume(source)?;
    let len = src.seek(SeekFrom::End(0))?;
    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&dest)
        .with_context(|| format!("create {}", dest.display()))?;
    out.set_len(len)?;

    let result = clone_volume(&fs, &mut *src, &mut out, &pump)?;
    if json {
        let report = serde_json::json!({
            "result": result,
            "counters": metrics_snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Cloned {} into {}: read {} bytes, wrote {} bytes (write ratio {:.2})",
            source,
            dest.display(),
            result.bytes_read,
            result.bytes_written,
            metrics_snapshot().write_ratio()
        );
    }
    Ok(0)
}
