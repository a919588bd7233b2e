//! Hierarchical-bin arithmetic shared by the binary record codec (C5, which
//! recomputes a record's bin on encode) and the index builder (C10, which
//! groups chunks by bin).
//!
//! The six-level interval tree and its minimum-bin formula are the standard
//! BAM/SAM binning scheme; spec.md §3 and §4.5 reference it as "the spec's
//! minimum-bin formula" without spelling out the shifts, so this module
//! supplies the textbook `reg2bin` computation that
//! `original_source/openge/src/util/bam_index.cpp` assumes samtools-compatible
//! callers already have.

/// The synthetic bin carrying per-reference mapped/unmapped counts and
/// first/last virtual offsets (spec.md §3 "Index").
pub const METADATA_BIN: u32 = 37450;

/// One past the largest real (non-metadata) bin id in the six-level tree.
pub const MAX_BIN: u32 = 37450;

/// Computes the minimum bin covering the half-open interval `[begin, end)`,
/// 0-based. Mirrors the samtools `reg2bin` algorithm.
pub fn reg2bin(begin: i64, end: i64) -> u32 {
    let end = end - 1;
    if (begin >> 14) == (end >> 14) {
        return (((1 << 15) - 1) / 7 + (begin >> 14)) as u32;
    }
    if (begin >> 17) == (end >> 17) {
        return (((1 << 12) - 1) / 7 + (begin >> 17)) as u32;
    }
    if (begin >> 20) == (end >> 20) {
        return (((1 << 9) - 1) / 7 + (begin >> 20)) as u32;
    }
    if (begin >> 23) == (end >> 23) {
        return (((1 << 6) - 1) / 7 + (begin >> 23)) as u32;
    }
    if (begin >> 26) == (end >> 26) {
        return (((1 << 3) - 1) / 7 + (begin >> 26)) as u32;
    }
    0
}

/// Size, in bases, of one linear-index tile (spec.md §3 "Index": 16 kb tiles).
pub const LINEAR_TILE_SHIFT: u32 = 14;
pub const LINEAR_TILE_SIZE: i64 = 1 << LINEAR_TILE_SHIFT;

/// Tile index for a 0-based coordinate.
pub fn tile_index(pos: i64) -> usize {
    (pos >> LINEAR_TILE_SHIFT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_record_round_trip_bin() {
        // scenario 1: pos=100 (0-based), 4M -> end=104, expect bin 4681
        assert_eq!(reg2bin(100, 104), 4681);
    }

    #[test]
    fn whole_chromosome_is_bin_zero() {
        assert_eq!(reg2bin(0, 1 << 29), 0);
    }

    #[test]
    fn tile_index_is_16kb_aligned() {
        assert_eq!(tile_index(0), 0);
        assert_eq!(tile_index(16384), 1);
        assert_eq!(tile_index(16383), 0);
    }
}
