use anyhow::Result;
use std::io::{Cursor, Read, Seek, SeekFrom};

use bootclone::{CopyProgress, Extent, MigrateError, SparsePump};

/// Source that reports end-of-data (0 bytes) inside `[hole_start, hole_end)`.
struct HoleySource {
    inner: Cursor<Vec<u8>>,
    hole_start: u64,
    hole_end: u64,
}

impl Read for HoleySource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = self.inner.position();
        if pos >= self.hole_start && pos < self.hole_end {
            return Ok(0);
        }
        // stop at the hole boundary
        let max = if pos < self.hole_start {
            ((self.hole_start - pos) as usize).min(buf.len())
        } else {
            buf.len()
        };
        self.inner.read(&mut buf[..max])
    }
}

impl Seek for HoleySource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[test]
fn zero_chunk_leaves_destination_untouched() -> Result<()> {
    let chunk = 512;
    let mut src = vec![0u8; 2 * chunk];
    src[chunk..].fill(0xAB);
    let mut source = Cursor::new(src);
    let mut dest = Cursor::new(vec![0xEEu8; 2 * chunk]);

    let pump = SparsePump::new().with_chunk_size(chunk).with_buffer_size(2 * chunk);
    let res = pump.run(
        &mut source,
        &mut dest,
        [Extent::new(0, 2 * chunk as u64)],
        None,
    )?;

    assert_eq!(res.bytes_read, 2 * chunk as u64);
    assert_eq!(res.bytes_written, chunk as u64);
    let out = dest.into_inner();
    assert!(out[..chunk].iter().all(|&b| b == 0xEE));
    assert!(out[chunk..].iter().all(|&b| b == 0xAB));
    Ok(())
}

#[test]
fn zero_read_abandons_only_that_extent() -> Result<()> {
    let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8 + 1).collect();
    let mut source = HoleySource {
        inner: Cursor::new(data.clone()),
        hole_start: 1024,
        hole_end: 2048,
    };
    let mut dest = Cursor::new(vec![0u8; 8192]);

    let pump = SparsePump::new().with_chunk_size(512).with_buffer_size(4096);
    let res = pump.run(
        &mut source,
        &mut dest,
        [Extent::new(0, 4096), Extent::new(4096, 4096)],
        None,
    )?;

    // first extent stops at the hole, second one is copied completely
    assert_eq!(res.bytes_read, 1024 + 4096);
    let out = dest.into_inner();
    assert_eq!(&out[..1024], &data[..1024]);
    assert!(out[1024..4096].iter().all(|&b| b == 0));
    assert_eq!(&out[4096..], &data[4096..]);
    Ok(())
}

#[test]
fn short_destination_is_extended_to_source_length() -> Result<()> {
    let mut src = vec![0u8; 3000];
    src[..10].fill(7);
    let mut source = Cursor::new(src);
    let mut dest = Cursor::new(Vec::new());

    let pump = SparsePump::new();
    pump.run(&mut source, &mut dest, [Extent::new(0, 512)], None)?;

    let out = dest.into_inner();
    assert_eq!(out.len(), 3000);
    assert!(out[..10].iter().all(|&b| b == 7));
    Ok(())
}

#[test]
fn full_copy_ignores_extents_and_reports_progress() -> Result<()> {
    let src: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
    let mut source = Cursor::new(src.clone());
    let mut dest = Cursor::new(Vec::new());

    let mut last = CopyProgress::default();
    let mut calls = 0;
    let mut observe = |p: &CopyProgress| {
        calls += 1;
        last = *p;
    };
    let pump = SparsePump::new().with_sparse(false).with_buffer_size(4096);
    let res = pump.run(
        &mut source,
        &mut dest,
        std::iter::empty(),
        Some(&mut observe),
    )?;

    assert_eq!(res.bytes_read, 10_000);
    assert_eq!(res.bytes_written, 10_000);
    assert_eq!(dest.into_inner(), src);
    assert_eq!(calls, 3);
    assert_eq!(last.bytes_read, 10_000);
    assert_eq!(last.source_position, 10_000);
    Ok(())
}

#[test]
fn invalid_chunk_and_buffer_sizes_are_rejected() -> Result<()> {
    let mut source = Cursor::new(vec![1u8; 16]);
    let mut dest = Cursor::new(Vec::new());

    let bad_chunk = SparsePump::new().with_chunk_size(1);
    let err = bad_chunk
        .run(&mut source, &mut dest, [Extent::new(0, 16)], None)
        .unwrap_err();
    assert!(matches!(err, MigrateError::Configuration(_)));

    let bad_buffer = SparsePump::new().with_chunk_size(512).with_buffer_size(1000);
    assert!(matches!(
        bad_buffer.validate(),
        Err(MigrateError::Configuration(_))
    ));

    // smaller than one chunk, or any size when not sparse, is fine
    assert!(SparsePump::new().with_chunk_size(512).with_buffer_size(100).validate().is_ok());
    assert!(SparsePump::new()
        .with_sparse(false)
        .with_chunk_size(512)
        .with_buffer_size(1000)
        .validate()
        .is_ok());
    Ok(())
}
