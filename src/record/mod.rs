//! C5/C6 shared data model: one alignment record, its CIGAR, and its tag
//! dictionary.
//!
//! Core fields (refID, pos, flag, mapq, ...) are always eagerly available;
//! the variable-length payload (name, CIGAR, sequence, qualities, tags) is
//! kept as raw bytes behind a lazily-materialized cache so a record that is
//! only inspected for its core fields never pays to parse the rest.

pub mod binary;
pub mod text;

use std::fmt;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::bin::reg2bin;
use crate::error::RecordError;

/// `=ACMGRSVTWYHKDBN`, the 16-symbol alphabet packed 4 bits/base.
pub const SEQ_ALPHABET: [u8; 16] = *b"=ACMGRSVTWYHKDBN";

fn base_to_code(base: u8) -> Option<u8> {
    SEQ_ALPHABET
        .iter()
        .position(|&b| b.eq_ignore_ascii_case(&base))
        .map(|p| p as u8)
}

/// Alignment flag bits (standard BAM semantics).
pub mod flags {
    pub const PAIRED: u16 = 0x1;
    pub const PROPER_PAIR: u16 = 0x2;
    pub const UNMAPPED: u16 = 0x4;
    pub const MATE_UNMAPPED: u16 = 0x8;
    pub const REVERSE: u16 = 0x10;
    pub const MATE_REVERSE: u16 = 0x20;
    pub const FIRST_SEGMENT: u16 = 0x40;
    pub const LAST_SEGMENT: u16 = 0x80;
    pub const SECONDARY: u16 = 0x100;
    pub const QC_FAIL: u16 = 0x200;
    pub const DUPLICATE: u16 = 0x400;
    pub const SUPPLEMENTARY: u16 = 0x800;
}

/// One CIGAR operation kind, in the `MIDNSHP=X` alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CigarOpKind {
    Match,
    Insertion,
    Deletion,
    Skip,
    SoftClip,
    HardClip,
    Pad,
    SeqMatch,
    SeqMismatch,
}

impl CigarOpKind {
    pub fn from_code(code: u32) -> Result<Self, RecordError> {
        Ok(match code {
            0 => Self::Match,
            1 => Self::Insertion,
            2 => Self::Deletion,
            3 => Self::Skip,
            4 => Self::SoftClip,
            5 => Self::HardClip,
            6 => Self::Pad,
            7 => Self::SeqMatch,
            8 => Self::SeqMismatch,
            other => return Err(RecordError::BadCigarOp(other)),
        })
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Match => 0,
            Self::Insertion => 1,
            Self::Deletion => 2,
            Self::Skip => 3,
            Self::SoftClip => 4,
            Self::HardClip => 5,
            Self::Pad => 6,
            Self::SeqMatch => 7,
            Self::SeqMismatch => 8,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Match => 'M',
            Self::Insertion => 'I',
            Self::Deletion => 'D',
            Self::Skip => 'N',
            Self::SoftClip => 'S',
            Self::HardClip => 'H',
            Self::Pad => 'P',
            Self::SeqMatch => '=',
            Self::SeqMismatch => 'X',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'M' => Self::Match,
            'I' => Self::Insertion,
            'D' => Self::Deletion,
            'N' => Self::Skip,
            'S' => Self::SoftClip,
            'H' => Self::HardClip,
            'P' => Self::Pad,
            '=' => Self::SeqMatch,
            'X' => Self::SeqMismatch,
            _ => return None,
        })
    }

    /// Does this op consume reference bases (advance `end_pos`)?
    pub fn consumes_reference(self) -> bool {
        matches!(self, Self::Match | Self::Deletion | Self::Skip | Self::SeqMatch | Self::SeqMismatch)
    }

    /// Does this op consume query bases?
    pub fn consumes_query(self) -> bool {
        matches!(self, Self::Match | Self::Insertion | Self::SoftClip | Self::SeqMatch | Self::SeqMismatch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CigarOp {
    pub kind: CigarOpKind,
    pub len: u32,
}

impl CigarOp {
    pub fn new(kind: CigarOpKind, len: u32) -> Self {
        Self { kind, len }
    }

    pub fn encoded(self) -> u32 {
        (self.len << 4) | self.kind.code()
    }

    pub fn from_encoded(word: u32) -> Result<Self, RecordError> {
        Ok(Self { kind: CigarOpKind::from_code(word & 0xf)?, len: word >> 4 })
    }
}

impl fmt::Display for CigarOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.len, self.kind.as_char())
    }
}

/// Reference length spanned by a CIGAR, i.e. `end_pos - pos`.
pub fn reference_span(cigar: &[CigarOp]) -> i64 {
    cigar.iter().filter(|op| op.kind.consumes_reference()).map(|op| op.len as i64).sum()
}

/// Tag type byte, one of `A c C s S i I f Z H B`.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Char(u8),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float(f32),
    Str(String),
    Hex(String),
    ArrayInt8(Vec<i8>),
    ArrayUInt8(Vec<u8>),
    ArrayInt16(Vec<i16>),
    ArrayUInt16(Vec<u16>),
    ArrayInt32(Vec<i32>),
    ArrayUInt32(Vec<u32>),
    ArrayFloat(Vec<f32>),
}

impl TagValue {
    pub fn type_char(&self) -> char {
        match self {
            Self::Char(_) => 'A',
            Self::Int8(_) => 'c',
            Self::UInt8(_) => 'C',
            Self::Int16(_) => 's',
            Self::UInt16(_) => 'S',
            Self::Int32(_) => 'i',
            Self::UInt32(_) => 'I',
            Self::Float(_) => 'f',
            Self::Str(_) => 'Z',
            Self::Hex(_) => 'H',
            Self::ArrayInt8(_)
            | Self::ArrayUInt8(_)
            | Self::ArrayInt16(_)
            | Self::ArrayUInt16(_)
            | Self::ArrayInt32(_)
            | Self::ArrayUInt32(_)
            | Self::ArrayFloat(_) => 'B',
        }
    }

    /// Element-type char for `B`-typed tags (used by both the binary and
    /// text codecs), panics on non-array values.
    pub fn array_elem_char(&self) -> char {
        match self {
            Self::ArrayInt8(_) => 'c',
            Self::ArrayUInt8(_) => 'C',
            Self::ArrayInt16(_) => 's',
            Self::ArrayUInt16(_) => 'S',
            Self::ArrayInt32(_) => 'i',
            Self::ArrayUInt32(_) => 'I',
            Self::ArrayFloat(_) => 'f',
            _ => unreachable!("array_elem_char called on non-array tag value"),
        }
    }
}

pub type TagKey = [u8; 2];

/// Insertion-ordered, unique-keyed tag dictionary.
#[derive(Debug, Clone, Default)]
pub struct TagList {
    entries: IndexMap<TagKey, TagValue>,
}

impl TagList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &TagKey) -> Option<&TagValue> {
        self.entries.get(tag)
    }

    pub fn has(&self, tag: &TagKey) -> bool {
        self.entries.contains_key(tag)
    }

    /// Fails (returns `false`) if the tag already exists.
    pub fn add(&mut self, tag: TagKey, value: TagValue) -> bool {
        if self.entries.contains_key(&tag) {
            return false;
        }
        self.entries.insert(tag, value);
        true
    }

    /// Removes then re-adds; always succeeds.
    pub fn edit(&mut self, tag: TagKey, value: TagValue) {
        self.entries.insert(tag, value);
    }

    pub fn remove(&mut self, tag: &TagKey) -> bool {
        self.entries.shift_remove(tag).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TagKey, &TagValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Raw, not-yet-parsed variable payload plus the three counts needed to
/// recover its substructure.
#[derive(Debug, Clone)]
pub struct RawVariablePayload {
    pub bytes: Vec<u8>,
    pub name_len: u32,
    pub n_cigar_op: u32,
    pub seq_len: i32,
}

#[derive(Debug, Default)]
struct LazyCache {
    name: Option<String>,
    cigar: Option<Vec<CigarOp>>,
    seq_bases: Option<Vec<u8>>,
    qualities: Option<Vec<u8>>,
    tags: Option<TagList>,
}

/// One alignment record.
///
/// Fixed "core" fields are always eagerly available; the variable-length
/// fields (name, CIGAR, sequence, qualities, tags) are either
/// already materialized (a record built up by a caller, or by the text
/// codec) or backed by a raw byte payload that is decoded lazily on first
/// access, guarded by `lazy` so concurrent readers race-free.
pub struct Record {
    pub ref_id: i32,
    pub pos: i32,
    pub bin: Option<u16>,
    pub mapq: u8,
    pub flag: u16,
    pub mate_ref_id: i32,
    pub mate_pos: i32,
    pub template_len: i32,

    raw: Option<RawVariablePayload>,
    lazy: Mutex<LazyCache>,
}

impl Clone for Record {
    fn clone(&self) -> Self {
        let lazy = self.lazy.lock();
        Record {
            ref_id: self.ref_id,
            pos: self.pos,
            bin: self.bin,
            mapq: self.mapq,
            flag: self.flag,
            mate_ref_id: self.mate_ref_id,
            mate_pos: self.mate_pos,
            template_len: self.template_len,
            raw: self.raw.clone(),
            lazy: Mutex::new(LazyCache {
                name: lazy.name.clone(),
                cigar: lazy.cigar.clone(),
                seq_bases: lazy.seq_bases.clone(),
                qualities: lazy.qualities.clone(),
                tags: lazy.tags.clone(),
            }),
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("ref_id", &self.ref_id)
            .field("pos", &self.pos)
            .field("flag", &self.flag)
            .field("name", &self.name())
            .finish()
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl Record {
    /// A freshly allocated record: scalar fields at their sentinel values,
    /// variable-length fields empty.
    pub fn new() -> Self {
        Self {
            ref_id: -1,
            pos: -1,
            bin: None,
            mapq: 0,
            flag: 0,
            mate_ref_id: -1,
            mate_pos: -1,
            template_len: 0,
            raw: None,
            lazy: Mutex::new(LazyCache {
                name: Some(String::new()),
                cigar: Some(Vec::new()),
                seq_bases: Some(Vec::new()),
                qualities: Some(Vec::new()),
                tags: Some(TagList::new()),
            }),
        }
    }

    pub(crate) fn from_raw(core: RecordCore, raw: RawVariablePayload) -> Self {
        Self {
            ref_id: core.ref_id,
            pos: core.pos,
            bin: Some(core.bin),
            mapq: core.mapq,
            flag: core.flag,
            mate_ref_id: core.mate_ref_id,
            mate_pos: core.mate_pos,
            template_len: core.template_len,
            raw: Some(raw),
            lazy: Mutex::new(LazyCache::default()),
        }
    }

    pub fn is_unmapped(&self) -> bool {
        self.flag & flags::UNMAPPED != 0
    }

    pub fn is_reverse_strand(&self) -> bool {
        self.flag & flags::REVERSE != 0
    }

    fn materialize_name(&self) {
        let mut lazy = self.lazy.lock();
        if lazy.name.is_some() {
            return;
        }
        let raw = self.raw.as_ref().expect("materialize called without raw payload");
        let end = raw.name_len as usize;
        let bytes = &raw.bytes[0..end.saturating_sub(1).min(raw.bytes.len())];
        lazy.name = Some(String::from_utf8_lossy(bytes).into_owned());
    }

    pub fn name(&self) -> String {
        if self.raw.is_some() {
            self.materialize_name();
        }
        self.lazy.lock().name.clone().unwrap_or_default()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.lazy.get_mut().name = Some(name.into());
    }

    fn materialize_cigar(&self) {
        let mut lazy = self.lazy.lock();
        if lazy.cigar.is_some() {
            return;
        }
        let raw = self.raw.as_ref().expect("materialize called without raw payload");
        let start = raw.name_len as usize;
        let end = start + (raw.n_cigar_op as usize) * 4;
        let mut ops = Vec::with_capacity(raw.n_cigar_op as usize);
        for chunk in raw.bytes[start..end].chunks_exact(4) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            ops.push(CigarOp::from_encoded(word).unwrap_or(CigarOp::new(CigarOpKind::Match, 0)));
        }
        lazy.cigar = Some(ops);
    }

    pub fn cigar(&self) -> Vec<CigarOp> {
        if self.raw.is_some() {
            self.materialize_cigar();
        }
        self.lazy.lock().cigar.clone().unwrap_or_default()
    }

    pub fn set_cigar(&mut self, cigar: Vec<CigarOp>) {
        self.lazy.get_mut().cigar = Some(cigar);
    }

    fn seq_len(&self) -> usize {
        match &self.raw {
            Some(raw) => raw.seq_len.max(0) as usize,
            None => self.lazy.lock().seq_bases.as_ref().map(|v| v.len()).unwrap_or(0),
        }
    }

    fn materialize_seq(&self) {
        let mut lazy = self.lazy.lock();
        if lazy.seq_bases.is_some() {
            return;
        }
        let raw = self.raw.as_ref().expect("materialize called without raw payload");
        let cigar_bytes = (raw.n_cigar_op as usize) * 4;
        let start = raw.name_len as usize + cigar_bytes;
        let seq_len = raw.seq_len.max(0) as usize;
        let packed_len = seq_len.div_ceil(2);
        let packed = &raw.bytes[start..start + packed_len];
        let mut bases = Vec::with_capacity(seq_len);
        for i in 0..seq_len {
            let byte = packed[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0xf };
            bases.push(SEQ_ALPHABET[nibble as usize]);
        }
        lazy.seq_bases = Some(bases);
    }

    /// Unpacked query bases as ASCII letters.
    pub fn sequence(&self) -> Vec<u8> {
        if self.raw.is_some() {
            self.materialize_seq();
        }
        self.lazy.lock().seq_bases.clone().unwrap_or_default()
    }

    pub fn set_sequence(&mut self, bases: Vec<u8>) {
        self.lazy.get_mut().seq_bases = Some(bases);
    }

    fn materialize_qual(&self) {
        let mut lazy = self.lazy.lock();
        if lazy.qualities.is_some() {
            return;
        }
        let raw = self.raw.as_ref().expect("materialize called without raw payload");
        let cigar_bytes = (raw.n_cigar_op as usize) * 4;
        let seq_len = raw.seq_len.max(0) as usize;
        let packed_len = seq_len.div_ceil(2);
        let start = raw.name_len as usize + cigar_bytes + packed_len;
        let qual = raw.bytes[start..start + seq_len].to_vec();
        lazy.qualities = Some(qual);
    }

    /// Raw (0..93, 0xFF = unstored) per-base quality bytes.
    pub fn qualities_raw(&self) -> Vec<u8> {
        if self.raw.is_some() {
            self.materialize_qual();
        }
        self.lazy.lock().qualities.clone().unwrap_or_default()
    }

    pub fn set_qualities_raw(&mut self, qual: Vec<u8>) {
        self.lazy.get_mut().qualities = Some(qual);
    }

    /// Whether qualities are "unstored" (first byte 0xFF, per spec.md §3).
    pub fn qualities_unstored(&self) -> bool {
        let q = self.qualities_raw();
        q.first() == Some(&0xFF)
    }

    /// ASCII (Phred+33) quality string; empty if unstored.
    pub fn qualities_ascii(&self) -> Vec<u8> {
        if self.qualities_unstored() {
            return Vec::new();
        }
        self.qualities_raw().iter().map(|&q| q.saturating_add(33)).collect()
    }

    fn materialize_tags(&self) {
        let mut lazy = self.lazy.lock();
        if lazy.tags.is_some() {
            return;
        }
        let raw = self.raw.as_ref().expect("materialize called without raw payload");
        let cigar_bytes = (raw.n_cigar_op as usize) * 4;
        let seq_len = raw.seq_len.max(0) as usize;
        let packed_len = seq_len.div_ceil(2);
        let start = raw.name_len as usize + cigar_bytes + packed_len + seq_len;
        let tag_bytes = &raw.bytes[start..];
        lazy.tags = Some(binary::parse_tags(tag_bytes).unwrap_or_default());
    }

    fn tags_mut(&mut self) -> &mut TagList {
        if self.raw.is_some() {
            self.materialize_tags();
        }
        self.lazy.get_mut().tags.get_or_insert_with(TagList::new)
    }

    pub fn tags(&self) -> TagList {
        if self.raw.is_some() {
            self.materialize_tags();
        }
        self.lazy.lock().tags.clone().unwrap_or_default()
    }

    pub fn get_tag(&self, tag: &TagKey) -> Option<TagValue> {
        self.tags().get(tag).cloned()
    }

    pub fn has_tag(&self, tag: &TagKey) -> bool {
        self.tags().has(tag)
    }

    pub fn add_tag(&mut self, tag: TagKey, value: TagValue) -> bool {
        self.tags_mut().add(tag, value)
    }

    pub fn edit_tag(&mut self, tag: TagKey, value: TagValue) {
        self.tags_mut().edit(tag, value)
    }

    pub fn remove_tag(&mut self, tag: &TagKey) -> bool {
        self.tags_mut().remove(tag)
    }

    /// Reference end position, `pos + sum(reference-consuming cigar ops)`.
    /// `I`/`S`/`H`/`P` never advance; `padded` additionally advances for `I`.
    pub fn end_position(&self, padded: bool) -> i64 {
        let pos = self.pos as i64;
        if pos < 0 {
            return pos;
        }
        let cigar = self.cigar();
        let span: i64 = cigar
            .iter()
            .filter(|op| op.kind.consumes_reference() || (padded && op.kind == CigarOpKind::Insertion))
            .map(|op| op.len as i64)
            .sum();
        pos + span
    }

    /// The bin this record should be written with: the explicit value if the
    /// caller set one, else `reg2bin(pos, end_pos)` (spec.md §4.5 encode).
    pub fn effective_bin(&self) -> u16 {
        if let Some(bin) = self.bin {
            return bin;
        }
        if self.pos < 0 {
            return 0;
        }
        reg2bin(self.pos as i64, self.end_position(false).max(self.pos as i64 + 1)) as u16
    }

    pub fn set_bin(&mut self, bin: u16) {
        self.bin = Some(bin);
    }

    pub fn clear_bin(&mut self) {
        self.bin = None;
    }

    /// Resets this record to allocator defaults, for reuse by [`crate::alloc::RecordAllocator`].
    pub fn reset(&mut self) {
        self.ref_id = -1;
        self.pos = -1;
        self.bin = None;
        self.mapq = 0;
        self.flag = 0;
        self.mate_ref_id = -1;
        self.mate_pos = -1;
        self.template_len = 0;
        self.raw = None;
        let lazy = self.lazy.get_mut();
        lazy.name = Some(String::new());
        lazy.cigar = Some(Vec::new());
        lazy.seq_bases = Some(Vec::new());
        lazy.qualities = Some(Vec::new());
        lazy.tags = Some(TagList::new());
    }
}

/// Fixed 32-byte "core" of a binary record (spec.md §4.5 decode).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordCore {
    pub ref_id: i32,
    pub pos: i32,
    pub bin: u16,
    pub mapq: u8,
    pub flag: u16,
    pub mate_ref_id: i32,
    pub mate_pos: i32,
    pub template_len: i32,
}

pub(crate) fn encode_base(base: u8) -> Result<u8, RecordError> {
    base_to_code(base).ok_or_else(|| RecordError::BadBase(base as char))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_defaults() {
        let r = Record::new();
        assert_eq!(r.ref_id, -1);
        assert_eq!(r.pos, -1);
        assert_eq!(r.mapq, 0);
        assert_eq!(r.flag, 0);
        assert_eq!(r.mate_ref_id, -1);
        assert_eq!(r.mate_pos, -1);
        assert_eq!(r.template_len, 0);
        assert!(r.name().is_empty());
        assert!(r.cigar().is_empty());
    }

    #[test]
    fn tag_add_edit_remove() {
        let mut r = Record::new();
        assert!(r.add_tag(*b"NM", TagValue::Int32(3)));
        assert!(r.add_tag(*b"MD", TagValue::Str("10A5".into())));
        assert!(!r.add_tag(*b"NM", TagValue::Int32(9)), "add must fail on duplicate");

        r.edit_tag(*b"NM", TagValue::Int32(0));
        assert_eq!(r.get_tag(b"NM"), Some(TagValue::Int32(0)));
        assert_eq!(r.get_tag(b"MD"), Some(TagValue::Str("10A5".into())));

        assert!(r.remove_tag(b"MD"));
        assert!(!r.has_tag(b"MD"));
        assert_eq!(r.tags().len(), 1);
    }

    #[test]
    fn end_position_accounts_for_reference_consuming_ops() {
        let mut r = Record::new();
        r.pos = 100;
        r.set_cigar(vec![CigarOp::new(CigarOpKind::Match, 4)]);
        assert_eq!(r.end_position(false), 104);
        assert_eq!(r.effective_bin(), reg2bin(100, 104) as u16);
    }
}
