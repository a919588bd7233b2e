//! C8: format-detecting multi-source reader.
//!
//! Opens one reader per input (peek-based format sniffing, so `stdin` and
//! files are handled uniformly) and merges them by keeping an ordered
//! multiset of fronts and popping the minimum each read.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::bgzf::BgzfReader;
use crate::error::{CoreError, RecordError};
use crate::header::Header;
use crate::pool::ThreadPool;
use crate::record::text::TextReader;
use crate::record::{binary, Record};
use crate::sort::Comparator;

/// A sniffed input format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    BgzfBam,
    RawBam,
    Sam,
    Unknown,
}

/// Sniffs a format from the first two bytes of a stream: `1f 8b` is BGZF-BAM,
/// `BA` is raw (uncompressed) BAM, `@` is text SAM.
pub fn detect_format(first_two: [u8; 2]) -> Format {
    match first_two {
        [0x1f, 0x8b] => Format::BgzfBam,
        [b'B', b'A'] => Format::RawBam,
        [b'@', _] => Format::Sam,
        _ => Format::Unknown,
    }
}

/// Reads and re-plays the first two bytes of `inner`, so format sniffing
/// never loses data — the peeked bytes are pushed back and replayed,
/// usable on both files and `stdin`.
struct Sniffed<R: Read> {
    pushed_back: [u8; 2],
    pos: usize,
    len: usize,
    inner: R,
}

impl<R: Read> Sniffed<R> {
    fn open(mut inner: R) -> io::Result<(Format, Self)> {
        let mut buf = [0u8; 2];
        let mut filled = 0;
        while filled < 2 {
            match inner.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        let format = if filled == 2 { detect_format(buf) } else { Format::Unknown };
        Ok((format, Self { pushed_back: buf, pos: 0, len: filled, inner }))
    }
}

impl<R: Read> Read for Sniffed<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.len {
            let avail = &self.pushed_back[self.pos..self.len];
            let take = avail.len().min(dst.len());
            dst[..take].copy_from_slice(&avail[..take]);
            self.pos += take;
            return Ok(take);
        }
        self.inner.read(dst)
    }
}

/// Any input stream this crate can read from, boxed so a source can be
/// either a file or `stdin` without the caller's type changing.
pub type DynRead = Box<dyn Read + Send>;

/// A BAM source: BGZF-wrapped or raw, already past its header.
enum BamBody {
    Bgzf(BgzfReader),
    Raw(Sniffed<DynRead>),
}

impl Read for BamBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BamBody::Bgzf(r) => r.read(buf),
            BamBody::Raw(r) => r.read(buf),
        }
    }
}

/// One opened input: a parsed header plus a way to pull the next record.
pub enum Source {
    Bam { header: Header, body: BamBody },
    Sam { reader: TextReader },
}

impl Source {
    /// Opens `path`, sniffing its format from the first two bytes and
    /// dispatching to the BGZF-BAM, raw-BAM, or SAM text codec.
    pub fn open(path: &Path, pool: Arc<ThreadPool>) -> Result<Self, CoreError> {
        let file: DynRead = Box::new(BufReader::new(File::open(path)?));
        Self::from_reader(file, pool)
    }

    /// Same as [`Self::open`] but from an already-open stream (`stdin`, a
    /// pipe, anything `Read + Send`) rather than a file path.
    pub fn from_reader(reader: DynRead, pool: Arc<ThreadPool>) -> Result<Self, CoreError> {
        let (format, sniffed) = Sniffed::open(reader)?;
        match format {
            Format::BgzfBam => {
                let mut bgzf = BgzfReader::new(sniffed, pool);
                let header = Header::read_binary(&mut bgzf).map_err(CoreError::Header)?;
                Ok(Source::Bam { header, body: BamBody::Bgzf(bgzf) })
            }
            Format::RawBam => {
                let mut sniffed = sniffed;
                let header = Header::read_binary(&mut sniffed).map_err(CoreError::Header)?;
                Ok(Source::Bam { header, body: BamBody::Raw(sniffed) })
            }
            Format::Sam | Format::Unknown => {
                let reader = TextReader::new(sniffed, num_cpus::get()).map_err(CoreError::Record)?;
                Ok(Source::Sam { reader })
            }
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Source::Bam { header, .. } => header,
            Source::Sam { reader } => &reader.header,
        }
    }

    pub fn read_record(&mut self) -> Result<Option<Record>, RecordError> {
        match self {
            Source::Bam { body, .. } => binary::decode_record(body),
            Source::Sam { reader } => reader.read_record(),
        }
    }
}

struct Slot {
    source: Source,
    front: Option<Record>,
}

/// Opens N sources and merges them into one globally ordered stream under
/// `comparator`. A header mismatch across sources is a warning (first
/// source's header wins), never fatal.
pub struct MultiReader {
    slots: Vec<Slot>,
    comparator: Comparator,
    header: Header,
}

impl MultiReader {
    pub fn open(paths: &[std::path::PathBuf], pool: Arc<ThreadPool>, comparator: Comparator) -> Result<Self, CoreError> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let source = Source::open(path, Arc::clone(&pool))?;
            sources.push((path.display().to_string(), source));
        }
        Self::from_sources(sources, comparator)
    }

    /// Builds a [`MultiReader`] from already-opened sources (e.g. `stdin`
    /// mixed with on-disk files), each labeled for the mismatched-header
    /// warning.
    pub fn from_sources(sources: Vec<(String, Source)>, comparator: Comparator) -> Result<Self, CoreError> {
        let mut slots = Vec::with_capacity(sources.len());
        let mut header: Option<Header> = None;
        for (label, mut source) in sources {
            match &header {
                None => header = Some(source.header().clone()),
                Some(first) if !first.dictionaries_match(source.header()) => {
                    warn!(source = %label, "sequence dictionary does not match first source; using first source's header");
                }
                Some(_) => {}
            }
            let front = source.read_record().map_err(CoreError::Record)?;
            slots.push(Slot { source, front });
        }
        let header = header.unwrap_or_default();
        Ok(Self { slots, comparator, header })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Pops the minimum front record under the comparator, refilling that
    /// source before returning. `Ok(None)` once every source is exhausted.
    pub fn read(&mut self) -> Result<Option<Record>, RecordError> {
        let mut min_idx = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(candidate) = &slot.front {
                min_idx = match min_idx {
                    None => Some(i),
                    Some(j) => {
                        let other = self.slots[j].front.as_ref().unwrap();
                        if self.comparator.compare(candidate, other) == std::cmp::Ordering::Less {
                            Some(i)
                        } else {
                            Some(j)
                        }
                    }
                };
            }
        }
        let Some(idx) = min_idx else { return Ok(None) };
        let popped = self.slots[idx].front.take();
        self.slots[idx].front = self.slots[idx].source.read_record()?;
        Ok(popped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_formats() {
        assert_eq!(detect_format([0x1f, 0x8b]), Format::BgzfBam);
        assert_eq!(detect_format([b'B', b'A']), Format::RawBam);
        assert_eq!(detect_format([b'@', b'H']), Format::Sam);
        assert_eq!(detect_format([b'x', b'y']), Format::Unknown);
    }

    #[test]
    fn sniffed_reader_replays_first_two_bytes() {
        let (format, mut sniffed) = Sniffed::open(std::io::Cursor::new(b"BAMrest-of-stream".to_vec())).unwrap();
        assert_eq!(format, Format::RawBam);
        let mut out = Vec::new();
        sniffed.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"BAMrest-of-stream");
    }
}
