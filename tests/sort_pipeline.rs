//! Crate-level integration tests exercising the full canonical pipeline:
//! source text -> C8 multi-reader -> C9 sort -> C5 encode -> C4 BGZF ->
//! decode back, plus the C10 index seam. Unit tests inside each module
//! cover the component in isolation; these wire several components
//! together the way `main.rs`'s `sort` subcommand does.

use std::io::Cursor;
use std::sync::Arc;

use bamforge::bgzf::{BgzfReader, BgzfWriter};
use bamforge::index::{read_bai, IndexBuilder};
use bamforge::multi_reader::{MultiReader, Source};
use bamforge::pool::ThreadPool;
use bamforge::record::binary;
use bamforge::sort::{Comparator, SortPipeline};
use bamforge::Header;

fn text_source(text: &str, pool: Arc<ThreadPool>) -> Source {
    Source::from_reader(Box::new(Cursor::new(text.as_bytes().to_vec())), pool).unwrap()
}

/// spec.md §8 end-to-end scenario 3: two inputs, three records each at the
/// same three positions on one reference, sorted by position.
#[test]
fn two_input_sort_by_position_interleaves_matching_positions() {
    let pool = ThreadPool::new(4);
    let header_line = "@SQ\tSN:ref\tLN:1000\n";
    let source_a = text_source(
        &format!("{header_line}r1\t0\tref\t51\t30\t1M\t*\t0\t0\tA\tI\nr2\t0\tref\t151\t30\t1M\t*\t0\t0\tA\tI\nr3\t0\tref\t251\t30\t1M\t*\t0\t0\tA\tI\n"),
        Arc::clone(&pool),
    );
    let source_b = text_source(
        &format!("{header_line}r4\t0\tref\t51\t30\t1M\t*\t0\t0\tA\tI\nr5\t0\tref\t151\t30\t1M\t*\t0\t0\tA\tI\nr6\t0\tref\t251\t30\t1M\t*\t0\t0\tA\tI\n"),
        Arc::clone(&pool),
    );

    let mut ingest =
        MultiReader::from_sources(vec![("a".into(), source_a), ("b".into(), source_b)], Comparator::Unsorted)
            .unwrap();
    let header = ingest.header().clone();

    let mut pipeline = SortPipeline::new(header.clone(), Comparator::ByPosition, Arc::clone(&pool));
    while let Some(record) = ingest.read().unwrap() {
        pipeline.push(record).unwrap();
    }

    let mut writer = BgzfWriter::new(Vec::new(), Arc::clone(&pool), 6);
    header.write_binary(&mut writer, "bamforge", "bamforge").unwrap();
    let count = pipeline
        .finish(|_hdr, record| {
            binary::encode_record(&mut writer, &record).map_err(bamforge::CoreError::Record)
        })
        .unwrap();
    assert_eq!(count, 6);
    let (buf, _remap) = writer.finish().unwrap();

    let mut reader = BgzfReader::new(Cursor::new(buf), pool);
    let decoded_header = Header::read_binary(&mut reader).unwrap();
    assert_eq!(decoded_header.index_of("ref"), Some(0));

    let mut positions = Vec::new();
    while let Some(record) = binary::decode_record(&mut reader).unwrap() {
        assert_eq!(record.ref_id, 0);
        positions.push(record.pos);
    }
    assert_eq!(positions, vec![50, 50, 150, 150, 250, 250]);
}

/// spec.md §8 end-to-end scenario 4 (scaled down for test speed): enough
/// records to force several spilled runs, merged back into one
/// non-decreasing stream with no records lost.
#[test]
fn sort_with_spill_merges_multiple_runs_in_order() {
    let pool = ThreadPool::new(4);
    let header = Header::new();
    let total_records = 5_000usize;
    let max_buffer = 700usize;

    let mut pipeline = SortPipeline::new(header.clone(), Comparator::ByPosition, Arc::clone(&pool))
        .with_max_buffer_count(max_buffer)
        .with_temp_compress(false);

    // A cheap deterministic "random" position generator (LCG) so the test
    // has no external randomness dependency and no `rand` crate to pull in.
    let mut state: u64 = 0x2545F4914F6CDD1D;
    for i in 0..total_records {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let pos = (state >> 33) as i32 & 0xFFFFF;
        let mut record = bamforge::Record::new();
        record.ref_id = 0;
        record.pos = pos;
        record.set_name(format!("r{i}"));
        pipeline.push(record).unwrap();
    }

    let mut out = Vec::new();
    let count = pipeline
        .finish(|_hdr, record| {
            binary::encode_record(&mut out, &record).map_err(bamforge::CoreError::Record)
        })
        .unwrap();
    assert_eq!(count, total_records as u64);

    let mut cursor = &out[..];
    let mut prev: Option<i32> = None;
    let mut seen = 0usize;
    while let Some(record) = binary::decode_record(&mut cursor).unwrap() {
        if let Some(p) = prev {
            assert!(p <= record.pos, "output must be non-decreasing by position");
        }
        prev = Some(record.pos);
        seen += 1;
    }
    assert_eq!(seen, total_records);
}

/// spec.md §8 end-to-end scenario 6 (scaled down): records at successive
/// 16 kb tile boundaries produce one linear-index slot per tile and a
/// bin-map entry for each bin, with virtual offsets resolved through the
/// writer's remap table.
#[test]
fn index_tracks_tile_boundaries_through_remap() {
    let pool = ThreadPool::new(2);
    let mut header = Header::new();
    header.add_reference("ref", 10_000_000).unwrap();

    let mut writer = BgzfWriter::new(Vec::new(), Arc::clone(&pool), 6);
    header.write_binary(&mut writer, "bamforge", "bamforge").unwrap();

    let mut index_builder = IndexBuilder::new(header.references().len());
    const TILE: i32 = 16384;
    for k in 0..20i32 {
        let mut record = bamforge::Record::new();
        record.ref_id = 0;
        record.pos = k * TILE;
        record.set_name(format!("r{k}"));
        record.set_cigar(vec![bamforge::record::CigarOp::new(bamforge::record::CigarOpKind::Match, 1)]);

        let bin = record.effective_bin() as u32;
        let start = writer.logical_position();
        binary::encode_record(&mut writer, &record).unwrap();
        let end = writer.logical_position();
        index_builder.observe(&record, bin, start, end);
    }

    let (_buf, remap) = writer.finish().unwrap();
    let mut bai = Vec::new();
    index_builder.close(&remap, &mut bai).unwrap();

    let parsed = read_bai(&mut &bai[..]).unwrap();
    assert_eq!(parsed.references.len(), 1);
    assert_eq!(parsed.references[0].linear_index.len(), 20);
    for w in parsed.references[0].linear_index.windows(2) {
        assert!(w[0] <= w[1], "linear index must be non-decreasing within a reference");
    }
}
