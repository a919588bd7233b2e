//! C10: block index builder — accumulates the hierarchical-bin and linear
//! index while the encoder writes compressed blocks, then remaps every
//! recorded offset through the output stream's [`crate::bgzf::writer::RemapTable`]
//! and serializes the `.bai` file.
//!
//! Chunks are coalesced when consecutive offsets are within
//! `MIN_GAP` of each other, the linear index is updated per 16 kb
//! tile as records are observed, and any tile never touched by a record is
//! forward-filled from the nearest earlier tile once the index closes. The
//! synthetic metadata bin — `(data_start, data_stop)` then
//! `(mapped_reads, unmapped_reads)` as its two chunks — is written into bin
//! 37450.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bgzf::writer::RemapTable;
use crate::bin::{tile_index, LINEAR_TILE_SIZE, METADATA_BIN};
use crate::error::IndexError;
use crate::record::Record;

/// Samtools-compatible chunk-coalescing gap.
pub const MIN_GAP: u64 = 32768;

#[derive(Default, Clone, Copy)]
struct RefMetadata {
    mapped: u64,
    unmapped: u64,
    start: Option<u64>,
    stop: Option<u64>,
}

#[derive(Default)]
struct RefIndex {
    bins: BTreeMap<u32, Vec<(u64, u64)>>,
    linear: Vec<u64>,
}

impl RefIndex {
    fn add_chunk(&mut self, bin: u32, start: u64, stop: u64) {
        let chunks = self.bins.entry(bin).or_default();
        match chunks.last_mut() {
            Some(last) if start.saturating_sub(last.1) < MIN_GAP => last.1 = stop,
            _ => chunks.push((start, stop)),
        }
    }

    fn add_linear(&mut self, pos: i64, end: i64, start_vo: u64) {
        let ix_start = tile_index(pos);
        let ix_end = tile_index((end - 1).max(pos));
        if self.linear.len() <= ix_end {
            self.linear.resize(ix_end + 1, 0);
        }
        for slot in &mut self.linear[ix_start..=ix_end] {
            *slot = if *slot == 0 { start_vo } else { (*slot).min(start_vo) };
        }
    }

    /// Forward-only fill: a tile with no recorded offset inherits the
    /// nearest earlier tile's offset. Never back-fills a leading run of
    /// zeros.
    fn fill_missing(&mut self) {
        for i in 1..self.linear.len() {
            if self.linear[i] == 0 {
                self.linear[i] = self.linear[i - 1];
            }
        }
    }
}

/// Accumulates index state as records are encoded, in the same order the
/// output codec accepts them.
pub struct IndexBuilder {
    metadata: Vec<RefMetadata>,
    sequences: Vec<RefIndex>,
    n_no_coor: u64,
}

impl IndexBuilder {
    pub fn new(n_ref: usize) -> Self {
        Self {
            metadata: vec![RefMetadata::default(); n_ref],
            sequences: (0..n_ref).map(|_| RefIndex::default()).collect(),
            n_no_coor: 0,
        }
    }

    /// Observes one encoded record. `bin` is the value actually written by
    /// the binary codec (`Record::effective_bin`); `logical_start`/
    /// `logical_end` are the pre-remap logical positions the output stream
    /// handed out for this record's bytes.
    pub fn observe(&mut self, record: &Record, bin: u32, logical_start: u64, logical_end: u64) {
        if record.pos < 0 {
            self.n_no_coor += 1;
        }

        if record.ref_id < 0 {
            return;
        }
        let ref_idx = record.ref_id as usize;
        if ref_idx >= self.metadata.len() {
            return;
        }

        let meta = &mut self.metadata[ref_idx];
        if record.is_unmapped() {
            meta.unmapped += 1;
        } else {
            meta.mapped += 1;
        }
        meta.start = Some(meta.start.map_or(logical_start, |s| s.min(logical_start)));
        meta.stop = Some(meta.stop.map_or(logical_end, |s| s.max(logical_end)));

        if record.pos < 0 {
            return;
        }
        let seq = &mut self.sequences[ref_idx];
        seq.add_chunk(bin, logical_start, logical_end);
        let end = record.end_position(false).max(record.pos as i64 + 1);
        seq.add_linear(record.pos as i64, end, logical_start);
    }

    /// Remaps every recorded logical offset through `remap` and writes the
    /// `.bai` file.
    pub fn close<W: Write>(mut self, remap: &RemapTable, writer: &mut W) -> Result<(), IndexError> {
        for seq in &mut self.sequences {
            seq.fill_missing();
        }

        writer.write_all(b"BAI\x01")?;
        writer.write_i32::<LittleEndian>(self.sequences.len() as i32)?;

        for (seq, meta) in self.sequences.iter().zip(self.metadata.iter()) {
            let mut bins: Vec<(u32, Vec<(u64, u64)>)> = seq
                .bins
                .iter()
                .map(|(&bin, chunks)| {
                    let remapped = chunks.iter().map(|&(s, e)| (remap.resolve(s), remap.resolve(e))).collect();
                    (bin, remapped)
                })
                .collect();

            if meta.start.is_some() || meta.mapped > 0 || meta.unmapped > 0 {
                let first_vo = meta.start.map(|s| remap.resolve(s)).unwrap_or(0);
                let last_vo = meta.stop.map(|s| remap.resolve(s)).unwrap_or(0);
                bins.push((METADATA_BIN, vec![(first_vo, last_vo), (meta.mapped, meta.unmapped)]));
            }

            writer.write_i32::<LittleEndian>(bins.len() as i32)?;
            for (bin, chunks) in &bins {
                writer.write_u32::<LittleEndian>(*bin)?;
                writer.write_i32::<LittleEndian>(chunks.len() as i32)?;
                for &(start, end) in chunks {
                    writer.write_u64::<LittleEndian>(start)?;
                    writer.write_u64::<LittleEndian>(end)?;
                }
            }

            let trimmed_len = seq.linear.iter().rposition(|&v| v != 0).map_or(0, |i| i + 1);
            writer.write_i32::<LittleEndian>(trimmed_len as i32)?;
            for &logical in &seq.linear[..trimmed_len] {
                writer.write_u64::<LittleEndian>(remap.resolve(logical))?;
            }
        }

        writer.write_u64::<LittleEndian>(self.n_no_coor)?;
        Ok(())
    }
}

/// One reference's parsed index, for verification — read-only inspection,
/// not a query path; indexed seeking into the BAM file is out of scope.
#[derive(Debug, Default)]
pub struct ParsedRefIndex {
    pub bins: BTreeMap<u32, Vec<(u64, u64)>>,
    pub linear_index: Vec<u64>,
}

#[derive(Debug, Default)]
pub struct ParsedBai {
    pub references: Vec<ParsedRefIndex>,
    pub n_no_coor: u64,
}

/// Parses a `.bai` file back into its structural contents. Used by tests and
/// tooling to inspect an index; does not support seeking into the BAM file
/// it describes.
pub fn read_bai<R: Read>(reader: &mut R) -> Result<ParsedBai, IndexError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != b"BAI\x01" {
        return Err(IndexError::BadMagic(magic));
    }

    let n_ref = reader.read_i32::<LittleEndian>()?;
    let mut references = Vec::with_capacity(n_ref.max(0) as usize);
    for _ in 0..n_ref {
        let n_bin = reader.read_i32::<LittleEndian>()?;
        let mut bins = BTreeMap::new();
        for _ in 0..n_bin {
            let bin = reader.read_u32::<LittleEndian>()?;
            let n_chunk = reader.read_i32::<LittleEndian>()?;
            let mut chunks = Vec::with_capacity(n_chunk.max(0) as usize);
            for _ in 0..n_chunk {
                let start = reader.read_u64::<LittleEndian>()?;
                let end = reader.read_u64::<LittleEndian>()?;
                chunks.push((start, end));
            }
            bins.insert(bin, chunks);
        }
        let n_intv = reader.read_i32::<LittleEndian>()?;
        let mut linear_index = Vec::with_capacity(n_intv.max(0) as usize);
        for _ in 0..n_intv {
            linear_index.push(reader.read_u64::<LittleEndian>()?);
        }
        references.push(ParsedRefIndex { bins, linear_index });
    }

    let n_no_coor = reader.read_u64::<LittleEndian>().unwrap_or(0);
    Ok(ParsedBai { references, n_no_coor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgzf::writer::RemapTable;
    use crate::record::{CigarOp, CigarOpKind};

    fn identity_remap() -> RemapTable {
        // A remap table whose only block starts at logical 0, so
        // `resolve(x) == x << 16` — enough to exercise bin/linear bookkeeping
        // without dragging in a real BgzfWriter.
        RemapTable::identity_for_tests()
    }

    fn mapped_record(ref_id: i32, pos: i32, len: u32) -> Record {
        let mut r = Record::new();
        r.ref_id = ref_id;
        r.pos = pos;
        r.set_cigar(vec![CigarOp::new(CigarOpKind::Match, len)]);
        r
    }

    #[test]
    fn linear_index_tracks_minimum_start_per_tile() {
        let mut builder = IndexBuilder::new(1);
        for i in 0..4u32 {
            let pos = i as i32 * LINEAR_TILE_SIZE as i32;
            let record = mapped_record(0, pos, 1);
            let bin = record.effective_bin() as u32;
            let logical = (pos as u64) * 10;
            builder.observe(&record, bin, logical, logical + 1);
        }
        let remap = identity_remap();
        let mut buf = Vec::new();
        builder.close(&remap, &mut buf).unwrap();

        let parsed = read_bai(&mut &buf[..]).unwrap();
        assert_eq!(parsed.references.len(), 1);
        assert_eq!(parsed.references[0].linear_index.len(), 4);
        for (k, &vo) in parsed.references[0].linear_index.iter().enumerate() {
            let expected_logical = (k as u64) * LINEAR_TILE_SIZE as u64 * 10;
            assert_eq!(vo, expected_logical << 16);
        }
    }

    #[test]
    fn metadata_bin_carries_mapped_unmapped_counts() {
        let mut builder = IndexBuilder::new(1);
        let mapped = mapped_record(0, 10, 4);
        let mut unmapped_flagged = mapped_record(0, 10, 4);
        unmapped_flagged.flag = crate::record::flags::UNMAPPED;
        builder.observe(&mapped, mapped.effective_bin() as u32, 0, 10);
        builder.observe(&unmapped_flagged, unmapped_flagged.effective_bin() as u32, 10, 20);

        let remap = identity_remap();
        let mut buf = Vec::new();
        builder.close(&remap, &mut buf).unwrap();
        let parsed = read_bai(&mut &buf[..]).unwrap();
        let meta_chunks = &parsed.references[0].bins[&METADATA_BIN];
        assert_eq!(meta_chunks[1], (1, 1));
    }

    #[test]
    fn adjacent_chunks_within_min_gap_coalesce() {
        let mut builder = IndexBuilder::new(1);
        let r1 = mapped_record(0, 10, 4);
        let bin = r1.effective_bin() as u32;
        builder.observe(&r1, bin, 0, 100);
        let r2 = mapped_record(0, 11, 4);
        builder.observe(&r2, bin, 100 + MIN_GAP - 1, 200 + MIN_GAP);

        let remap = identity_remap();
        let mut buf = Vec::new();
        builder.close(&remap, &mut buf).unwrap();
        let parsed = read_bai(&mut &buf[..]).unwrap();
        let chunks = &parsed.references[0].bins[&bin];
        assert_eq!(chunks.len(), 1, "gap under MIN_GAP must coalesce into one chunk");
    }

    #[test]
    fn no_coordinate_reads_are_counted() {
        let mut builder = IndexBuilder::new(1);
        let mut unmapped = Record::new();
        unmapped.flag = crate::record::flags::UNMAPPED;
        builder.observe(&unmapped, 0, 0, 10);
        let remap = identity_remap();
        let mut buf = Vec::new();
        builder.close(&remap, &mut buf).unwrap();
        let parsed = read_bai(&mut &buf[..]).unwrap();
        assert_eq!(parsed.n_no_coor, 1);
    }
}
