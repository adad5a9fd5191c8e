use anyhow::Result;
use oorandom::Rand64;

use bootclone::extent::total_length;
use bootclone::{bitmap_to_extents, ClusterBitmap, Extent};

#[test]
fn low_nibble_bitmap_gives_one_extent() -> Result<()> {
    let bm = ClusterBitmap::new(vec![0b0000_1111], 512);
    assert_eq!(bitmap_to_extents(&bm, 4096), vec![Extent::new(0, 2048)]);
    Ok(())
}

#[test]
fn empty_and_full_bitmaps() -> Result<()> {
    let zero = ClusterBitmap::new(vec![0u8; 16], 4096);
    assert!(bitmap_to_extents(&zero, 16 * 8 * 4096).is_empty());

    // 32 clusters of 4 KiB, but the volume ends inside cluster 30
    let full = ClusterBitmap::new(vec![0xFF; 4], 4096);
    let len = 30 * 4096 + 100;
    assert_eq!(bitmap_to_extents(&full, len), vec![Extent::new(0, len)]);
    Ok(())
}

/// Randomized: extents are non-empty, ascending, disjoint, inside the volume, and cover
/// exactly the set bits.
#[test]
fn random_bitmaps_keep_extent_invariants() -> Result<()> {
    let mut rng = Rand64::new(0x5EED_B007_C10E);
    for _ in 0..200 {
        let nbytes = (rng.rand_u64() % 64 + 1) as usize;
        let bits: Vec<u8> = (0..nbytes).map(|_| rng.rand_u64() as u8).collect();
        let cluster = 512u64 << (rng.rand_u64() % 4);
        let clusters = nbytes as u64 * 8;
        let volume_len = rng.rand_u64() % (clusters * cluster + 1);

        let bm = ClusterBitmap::new(bits, cluster);
        let extents = bitmap_to_extents(&bm, volume_len);

        let mut prev_end = None;
        for e in &extents {
            assert!(e.length > 0);
            assert!(e.end() <= volume_len);
            if let Some(p) = prev_end {
                // strictly after: adjacent runs would have been merged
                assert!(e.start > p);
            }
            prev_end = Some(e.end());
        }

        let expected: u64 = (0..clusters)
            .filter(|&c| bm.is_set(c))
            .map(|c| {
                let start = c * cluster;
                let end = (start + cluster).min(volume_len);
                end.saturating_sub(start)
            })
            .sum();
        assert_eq!(total_length(&extents), expected);
    }
    Ok(())
}
