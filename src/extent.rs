//! Extent index: cluster allocation bitmap -> ordered byte ranges.
//!
//! - Bit order: byte-major, least significant bit first (cluster n = bit n&7 of byte n>>3),
//!   the same layout as the NTFS $Bitmap file.
//! - One extent per maximal run of set bits.
//! - The bitmap length is a multiple of 8 bits, so it can describe clusters past the end of the
//!   volume. Extents are clipped to the volume length; extents starting at or after it are dropped.
//! - Lazy and restartable: `extents()` hands out a fresh `Clone` iterator every call.

use serde::Serialize;

/// Half-open byte range `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Bit-per-cluster allocation map of a volume. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterBitmap {
    bits: Vec<u8>,
    bytes_per_cluster: u64,
}

impl ClusterBitmap {
    pub fn new(bits: Vec<u8>, bytes_per_cluster: u64) -> Self {
        Self {
            bits,
            bytes_per_cluster,
        }
    }

    pub fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_cluster
    }

    /// Number of clusters described (always a multiple of 8).
    pub fn cluster_count(&self) -> u64 {
        self.bits.len() as u64 * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    #[inline]
    pub fn is_set(&self, cluster: u64) -> bool {
        let idx = (cluster >> 3) as usize;
        match self.bits.get(idx) {
            Some(b) => b & (1u8 << (cluster & 7)) != 0,
            None => false,
        }
    }

    /// Extents of allocated clusters, clipped to `volume_len` bytes.
    pub fn extents(&self, volume_len: u64) -> Extents<'_> {
        Extents {
            bitmap: self,
            cluster: 0,
            volume_len,
        }
    }
}

/// Iterator over the allocated extents of a bitmap.
#[derive(Debug, Clone)]
pub struct Extents<'a> {
    bitmap: &'a ClusterBitmap,
    cluster: u64,
    volume_len: u64,
}

impl Iterator for Extents<'_> {
    type Item = Extent;

    fn next(&mut self) -> Option<Extent> {
        let total = self.bitmap.cluster_count();
        let bpc = self.bitmap.bytes_per_cluster;
        if bpc == 0 {
            return None;
        }

        while self.cluster < total && !self.bitmap.is_set(self.cluster) {
            // whole zero bytes are skipped at once
            if self.cluster & 7 == 0 && self.bitmap.bits[(self.cluster >> 3) as usize] == 0 {
                self.cluster += 8;
            } else {
                self.cluster += 1;
            }
        }
        if self.cluster >= total {
            return None;
        }

        let first = self.cluster;
        while self.cluster < total && self.bitmap.is_set(self.cluster) {
            self.cluster += 1;
        }

        let start = first.saturating_mul(bpc);
        if start >= self.volume_len {
            // every later run starts even further out
            self.cluster = total;
            return None;
        }
        let end = self.cluster.saturating_mul(bpc).min(self.volume_len);
        Some(Extent::new(start, end - start))
    }
}

/// Free-function form of [`ClusterBitmap::extents`], materialized.
pub fn bitmap_to_extents(bitmap: &ClusterBitmap, volume_len: u64) -> Vec<Extent> {
    bitmap.extents(volume_len).collect()
}

/// Sum of extent lengths.
pub fn total_length(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.length).sum()
}
