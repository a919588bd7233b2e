//! Crate-wide error types.
//!
//! Library code returns typed errors; only `main.rs` converts a top-level
//! `Err` into a process exit. Malformed input and I/O failure are meant to
//! be fatal in practice (the caller logs and exits) but are still modeled as
//! `Result` here rather than `process::exit` so tests can observe them.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BgzfError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("truncated BGZF header (got {got} bytes, want 18)")]
    TruncatedHeader { got: usize },
    #[error("bad BGZF magic bytes {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unsupported compression method {0} (want 8, deflate)")]
    BadMethod(u8),
    #[error("BGZF FEXTRA flag not set (flags={0:#x})")]
    MissingFextra(u8),
    #[error("BGZF extra field has XLEN={xlen}, want 6")]
    BadXlen { xlen: u16 },
    #[error("BGZF extra subfield id {0:?}, want b\"BC\"")]
    BadSubfieldId([u8; 2]),
    #[error("BGZF extra subfield SLEN={0}, want 2")]
    BadSlen(u16),
    #[error("zlib inflate failed: {0}")]
    Inflate(String),
    #[error("zlib deflate failed: {0}")]
    Deflate(String),
    #[error("compressed block would exceed 65536 bytes even at maximum compression level")]
    DeflateOverflow,
    #[error("uncompressed payload of {0} bytes exceeds the 65536 byte BGZF block limit")]
    PayloadTooLarge(usize),
    #[error("write to a closed BGZF stream")]
    WriteAfterClose,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("truncated record: block_length={block_length} but only {available} bytes available")]
    Truncated { block_length: u32, available: usize },
    #[error("block_length {0} is smaller than the 32-byte core")]
    BlockTooShort(u32),
    #[error("a single record's variable payload of {0} bytes exceeds the 64 KiB codec limit")]
    RecordTooLarge(usize),
    #[error("unknown CIGAR operation code {0}")]
    BadCigarOp(u32),
    #[error("unknown base letter {0:?} in query sequence")]
    BadBase(char),
    #[error("unterminated tag value of type {0:?}")]
    TruncatedTag(char),
    #[error("unknown tag type {0:?}")]
    BadTagType(char),
    #[error("text line is missing one or more mandatory tab-separated fields")]
    ShortLine,
    #[error("malformed text field {field:?}: {reason}")]
    BadField { field: &'static str, reason: String },
    #[error("tag {0:?} already exists on this record")]
    DuplicateTag(String),
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("duplicate reference sequence name {0:?}")]
    DuplicateReference(String),
    #[error("header line {0:?} missing required field {1:?}")]
    MissingField(String, &'static str),
    #[error("reference sequence length {0:?} is not a valid positive integer")]
    BadReferenceLength(String),
}

#[derive(Debug, Error)]
pub enum SortError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("record codec error: {0}")]
    Record(#[from] RecordError),
    #[error("bgzf error: {0}")]
    Bgzf(#[from] BgzfError),
    #[error("temp-file write failed for run {run}: {source}")]
    TempFileWrite { run: usize, source: io::Error },
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad BAI magic bytes {0:02x?}")]
    BadMagic([u8; 4]),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Bgzf(#[from] BgzfError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Sort(#[from] SortError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
