//! Sparse stream pump: copies only the valid extents of a source into a seekable destination.
//!
//! Sparse mode, per extent:
//! - seek the source to the extent start and read forward in buffer-sized blocks;
//! - a read returning 0 bytes abandons the rest of that extent (unreadable regions of a live
//!   snapshot must not stall the copy);
//! - inside each block, runs of all-zero chunks are skipped and the remaining runs are written at
//!   the same offset in the destination.
//!
//! Afterwards a destination shorter than the source gets the final source byte written at the
//! final offset, so backends that refuse explicit resizing still end up at the right length.
//!
//! Non-sparse mode is a plain sequential copy from offset 0 with the same zero-read guard.
//!
//! Buffer/chunk constraint: a buffer larger than the chunk must be a multiple of it; a smaller
//! buffer is widened to one chunk. The write offsets below rely on exactly this.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use log::debug;
use serde::Serialize;

use crate::consts::{DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE};
use crate::error::{IoContext, MigrateError, Result};
use crate::extent::Extent;
use crate::metrics::{record_chunk_skipped, record_extent_abandoned, record_pump_transfer};

/// Cumulative counters reported after every buffer transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyProgress {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub source_position: u64,
    pub dest_position: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyResult {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Progress observer. Runs synchronously on the copy path, so it must return quickly.
pub type ProgressFn<'a> = &'a mut dyn FnMut(&CopyProgress);

#[derive(Debug, Clone)]
pub struct SparsePump {
    chunk_size: usize,
    buffer_size: usize,
    sparse: bool,
}

impl Default for SparsePump {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sparse: true,
        }
    }
}

impl SparsePump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-detection granularity; should match the destination's storage granularity.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_sparse(mut self, on: bool) -> Self {
        self.sparse = on;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size <= 1 {
            return Err(MigrateError::Configuration(format!(
                "chunk size {} is invalid, must be greater than 1",
                self.chunk_size
            )));
        }
        if self.sparse
            && self.buffer_size > self.chunk_size
            && self.buffer_size % self.chunk_size != 0
        {
            return Err(MigrateError::Configuration(format!(
                "buffer size {} is not a multiple of the sparse chunk size {}",
                self.buffer_size, self.chunk_size
            )));
        }
        Ok(())
    }

    /// Copy `extents` of `source` into `dest`, blocking until done.
    ///
    /// In non-sparse mode `extents` is ignored. Callers own and close both streams.
    pub fn run<S, D, I>(
        &self,
        source: &mut S,
        dest: &mut D,
        extents: I,
        mut on_progress: Option<ProgressFn<'_>>,
    ) -> Result<CopyResult>
    where
        S: Read + Seek + ?Sized,
        D: Write + Seek + ?Sized,
        I: IntoIterator<Item = Extent>,
    {
        self.validate()?;
        let result = if self.sparse {
            self.run_sparse(source, dest, extents, &mut on_progress)?
        } else {
            self.run_full(source, dest, &mut on_progress)?
        };
        dest.flush().op("flush destination")?;
        debug!(
            "pump: done sparse={}, read={}, written={}",
            self.sparse, result.bytes_read, result.bytes_written
        );
        Ok(result)
    }

    fn run_full<S, D>(
        &self,
        source: &mut S,
        dest: &mut D,
        on_progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<CopyResult>
    where
        S: Read + Seek + ?Sized,
        D: Write + Seek + ?Sized,
    {
        let mut buf = vec![0u8; self.buffer_size.max(1)];
        let mut stats = CopyResult::default();

        source.seek(SeekFrom::Start(0)).op("seek source")?;
        dest.seek(SeekFrom::Start(0)).op("seek destination")?;

        loop {
            let n = read_some(source, &mut buf)?;
            if n == 0 {
                break;
            }
            stats.bytes_read += n as u64;
            dest.write_all(&buf[..n]).op("write destination")?;
            stats.bytes_written += n as u64;
            record_pump_transfer(n as u64, n as u64);
            report(on_progress, &stats, source, dest)?;
        }
        Ok(stats)
    }

    fn run_sparse<S, D, I>(
        &self,
        source: &mut S,
        dest: &mut D,
        extents: I,
        on_progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<CopyResult>
    where
        S: Read + Seek + ?Sized,
        D: Write + Seek + ?Sized,
        I: IntoIterator<Item = Extent>,
    {
        let chunk = self.chunk_size;
        let mut buf = vec![0u8; self.buffer_size.max(chunk)];
        let mut stats = CopyResult::default();

        for extent in extents {
            source
                .seek(SeekFrom::Start(extent.start))
                .op("seek source")?;

            let mut offset = 0u64;
            while offset < extent.length {
                let n = (buf.len() as u64).min(extent.length - offset) as usize;
                let filled = read_up_to(source, &mut buf[..n])?;
                if filled > 0 {
                    stats.bytes_read += filled as u64;
                    let written =
                        write_nonzero_runs(dest, &buf[..filled], extent.start + offset, chunk)?;
                    stats.bytes_written += written;
                    offset += filled as u64;

                    record_pump_transfer(filled as u64, written);
                    report(on_progress, &stats, source, dest)?;
                }
                if filled < n {
                    debug!(
                        "pump: extent abandoned start={}, len={}, at={}",
                        extent.start, extent.length, offset
                    );
                    record_extent_abandoned();
                    break;
                }
            }
        }

        extend_to_source_length(source, dest)?;
        Ok(stats)
    }
}

/// Write every run of `data` that is not made of all-zero chunks at `base + run offset`.
fn write_nonzero_runs<D>(dest: &mut D, data: &[u8], base: u64, chunk: usize) -> Result<u64>
where
    D: Write + Seek + ?Sized,
{
    let mut written = 0u64;
    let mut pending = 0usize;
    let mut i = 0usize;

    while i < data.len() {
        let end = (i + chunk).min(data.len());
        if is_all_zeros(&data[i..end]) {
            if pending < i {
                write_at(dest, base + pending as u64, &data[pending..i])?;
                written += (i - pending) as u64;
            }
            pending = end;
            record_chunk_skipped();
        }
        i += chunk;
    }

    if pending < data.len() {
        write_at(dest, base + pending as u64, &data[pending..])?;
        written += (data.len() - pending) as u64;
    }
    Ok(written)
}

/// Grow `dest` to the source length by rewriting the last source byte.
fn extend_to_source_length<S, D>(source: &mut S, dest: &mut D) -> Result<()>
where
    S: Read + Seek + ?Sized,
    D: Write + Seek + ?Sized,
{
    let src_len = source.seek(SeekFrom::End(0)).op("measure source")?;
    let dst_len = dest.seek(SeekFrom::End(0)).op("measure destination")?;
    if src_len == 0 || dst_len >= src_len {
        return Ok(());
    }

    source
        .seek(SeekFrom::Start(src_len - 1))
        .op("seek source")?;
    let mut last = [0u8; 1];
    if read_up_to(source, &mut last)? == 1 {
        write_at(dest, src_len - 1, &last)?;
    }
    Ok(())
}

fn report<S, D>(
    on_progress: &mut Option<ProgressFn<'_>>,
    stats: &CopyResult,
    source: &mut S,
    dest: &mut D,
) -> Result<()>
where
    S: Seek + ?Sized,
    D: Seek + ?Sized,
{
    if let Some(cb) = on_progress.as_mut() {
        let progress = CopyProgress {
            bytes_read: stats.bytes_read,
            bytes_written: stats.bytes_written,
            source_position: source.stream_position().op("query source position")?,
            dest_position: dest.stream_position().op("query destination position")?,
        };
        cb(&progress);
    }
    Ok(())
}

#[inline]
fn is_all_zeros(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

fn write_at<D>(dest: &mut D, offset: u64, data: &[u8]) -> Result<()>
where
    D: Write + Seek + ?Sized,
{
    dest.seek(SeekFrom::Start(offset)).op("seek destination")?;
    dest.write_all(data).op("write destination")
}

/// Fill `buf` until it is full or the source returns 0 bytes; returns the bytes filled.
fn read_up_to<S>(source: &mut S, buf: &mut [u8]) -> Result<usize>
where
    S: Read + ?Sized,
{
    let mut filled = 0usize;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(MigrateError::io("read source", e)),
        }
    }
    Ok(filled)
}

fn read_some<S>(source: &mut S, buf: &mut [u8]) -> Result<usize>
where
    S: Read + ?Sized,
{
    loop {
        match source.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(MigrateError::io("read source", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn buffer_must_be_chunk_multiple_only_when_larger() {
        assert!(SparsePump::new().with_chunk_size(512).with_buffer_size(1000).validate().is_err());
        // smaller than a chunk: widened, accepted
        assert!(SparsePump::new().with_chunk_size(512).with_buffer_size(100).validate().is_ok());
        assert!(SparsePump::new().with_chunk_size(512).with_buffer_size(2048).validate().is_ok());
        assert!(SparsePump::new().with_chunk_size(1).validate().is_err());
    }

    #[test]
    fn zero_runs_inside_a_buffer_are_skipped() {
        let mut data = vec![0u8; 16];
        data[4..8].copy_from_slice(&[1, 2, 3, 4]);
        data[12] = 9;
        let mut dest = Cursor::new(vec![0xEEu8; 16]);
        let written = write_nonzero_runs(&mut dest, &data, 0, 4).unwrap();
        assert_eq!(written, 8);
        let out = dest.into_inner();
        assert_eq!(&out[0..4], &[0xEE; 4]);
        assert_eq!(&out[4..8], &[1, 2, 3, 4]);
        assert_eq!(&out[8..12], &[0xEE; 4]);
        assert_eq!(&out[12..16], &[9, 0, 0, 0]);
    }

    #[test]
    fn partial_trailing_chunk_is_handled() {
        let data = [7u8, 0, 0, 0, 0, 0];
        let mut dest = Cursor::new(Vec::new());
        let written = write_nonzero_runs(&mut dest, &data, 10, 4).unwrap();
        assert_eq!(written, 4);
        let out = dest.into_inner();
        assert_eq!(out.len(), 14);
        assert_eq!(out[10], 7);
    }
}
