//! C4: BGZF output stream — buffers writes into payload-sized blocks,
//! compresses them on the shared pool, and serializes them to the
//! underlying writer in submission order via a chain of ordered latches.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::{write::DeflateEncoder, Compression};
use parking_lot::{Condvar, Mutex};

use crate::error::BgzfError;
use crate::pool::ThreadPool;

use super::{virtual_offset, EOF_BLOCK, HEADER_TEMPLATE, MAX_PAYLOAD};

const MAX_COMPRESSION_LEVEL: u32 = 9;

/// A one-shot latch: job *i* signals it once its block has been written,
/// and job *i+1* waits on it before taking the output lock.
struct Latch {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self { done: Mutex::new(false), cv: Condvar::new() }
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    fn signal(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }
}

/// Maps logical (pre-compression) write positions to their post-compression
/// virtual offset, built by [`BgzfWriter`] as it flushes blocks. Consulted by
/// the index builder (C10) once the true block boundaries are known.
#[derive(Debug, Default, Clone)]
pub struct RemapTable {
    /// `(logical_block_start, compressed_file_offset)`, sorted by the first field.
    entries: Vec<(u64, u64)>,
}

impl RemapTable {
    /// A single-block table mapping every logical position to itself (file
    /// offset 0), for index-builder tests that only care about bin/linear
    /// bookkeeping and not real BGZF compression.
    #[cfg(test)]
    pub(crate) fn identity_for_tests() -> Self {
        Self { entries: vec![(0, 0)] }
    }

    /// Resolves a logical position recorded mid-write into its final virtual
    /// offset. Panics if `logical` precedes the first recorded block, which
    /// would indicate a caller bug (a position handed out before any write).
    pub fn resolve(&self, logical: u64) -> u64 {
        let idx = match self.entries.binary_search_by_key(&logical, |&(start, _)| start) {
            Ok(i) => i,
            Err(0) => panic!("logical position {logical} precedes the first recorded block"),
            Err(i) => i - 1,
        };
        let (block_start, file_offset) = self.entries[idx];
        virtual_offset(file_offset, (logical - block_start) as u16)
    }
}

#[derive(Default)]
struct Stats {
    compressed_pos: Mutex<u64>,
    remap: Mutex<Vec<(u64, u64)>>,
    failed: AtomicBool,
}

/// A BGZF output stream. Buffers writes, and once a payload's worth has
/// accumulated, compresses it on the shared thread pool while the
/// ordered-latch chain keeps on-disk block order matching write order.
pub struct BgzfWriter<W: Write + Send + 'static> {
    inner: Arc<Mutex<W>>,
    stats: Arc<Stats>,
    pool: Arc<ThreadPool>,
    level: u32,
    buf: Vec<u8>,
    logical_pos: u64,
    prev_latch: Option<Arc<Latch>>,
}

impl<W: Write + Send + 'static> BgzfWriter<W> {
    pub fn new(inner: W, pool: Arc<ThreadPool>, level: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            stats: Arc::new(Stats::default()),
            pool,
            level: level.min(MAX_COMPRESSION_LEVEL),
            buf: Vec::with_capacity(MAX_PAYLOAD),
            logical_pos: 0,
            prev_latch: None,
        }
    }

    /// The logical (pre-compression) position the next written byte will
    /// occupy. Callers that need to recover the eventual virtual offset of
    /// a byte they are about to write should record this value and resolve
    /// it through [`RemapTable`] after [`Self::finish`].
    pub fn logical_position(&self) -> u64 {
        self.logical_pos + self.buf.len() as u64
    }

    fn flush_block(&mut self) -> Result<(), BgzfError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let payload = std::mem::replace(&mut self.buf, Vec::with_capacity(MAX_PAYLOAD));
        let logical_start = self.logical_pos;
        self.logical_pos += payload.len() as u64;

        let my_latch = Arc::new(Latch::new());
        let prev_latch = self.prev_latch.replace(Arc::clone(&my_latch));

        let inner = Arc::clone(&self.inner);
        let stats = Arc::clone(&self.stats);
        let level = self.level;

        self.pool.submit(move || {
            let block = match compress_block(&payload, level) {
                Ok(block) => block,
                Err(_) => {
                    stats.failed.store(true, Ordering::Release);
                    if let Some(prev) = &prev_latch {
                        prev.wait();
                    }
                    my_latch.signal();
                    return;
                }
            };

            if let Some(prev) = prev_latch {
                prev.wait();
            }

            let file_offset = {
                let mut writer = inner.lock();
                let file_offset = *stats.compressed_pos.lock();
                if writer.write_all(&block).is_ok() {
                    *stats.compressed_pos.lock() = file_offset + block.len() as u64;
                } else {
                    stats.failed.store(true, Ordering::Release);
                }
                file_offset
            };
            stats.remap.lock().push((logical_start, file_offset));
            my_latch.signal();
        });

        Ok(())
    }

    /// Flushes any partial payload, waits for every outstanding compress job
    /// to finish writing, appends the EOF marker, and returns the inner
    /// writer plus the completed [`RemapTable`]. This is the only way to
    /// close the stream; a `BgzfWriter` dropped without calling `finish`
    /// loses any buffered-but-unflushed payload and never writes the EOF
    /// marker.
    ///
    /// A compress or write failure on any block (e.g. deflate overflow past
    /// the maximum level) is recorded asynchronously on [`Stats::failed`]
    /// and only surfaces here, once
    /// `wait_all` guarantees every outstanding job has run to completion —
    /// checking right after `submit` would race the job itself.
    pub fn finish(mut self) -> Result<(W, RemapTable), BgzfError> {
        self.flush_block()?;
        self.pool.wait_all();

        if self.stats.failed.load(Ordering::Acquire) {
            return Err(BgzfError::DeflateOverflow);
        }

        {
            let mut writer = self.inner.lock();
            writer.write_all(&EOF_BLOCK).map_err(BgzfError::Io)?;
            writer.flush().map_err(BgzfError::Io)?;
        }

        let mut entries = self.stats.remap.lock().clone();
        entries.sort_unstable_by_key(|&(start, _)| start);

        // `wait_all` guarantees every compress job has returned (and thus
        // dropped its clone of `inner`), so this is the sole remaining
        // reference.
        let inner = Arc::try_unwrap(self.inner)
            .unwrap_or_else(|_| panic!("compress job outlived pool.wait_all()"))
            .into_inner();

        Ok((inner, RemapTable { entries }))
    }
}

impl<W: Write + Send + 'static> Write for BgzfWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut remaining = data;
        while !remaining.is_empty() {
            let space = MAX_PAYLOAD - self.buf.len();
            let take = remaining.len().min(space);
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            written += take;
            if self.buf.len() >= MAX_PAYLOAD {
                self.flush_block().map_err(io::Error::other)?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block().map_err(io::Error::other)
    }
}

fn compress_block(payload: &[u8], level: u32) -> Result<Vec<u8>, BgzfError> {
    let crc = crc32fast::hash(payload);
    let isize = payload.len() as u32;

    let mut deflate_level = level;
    let compressed = loop {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(deflate_level));
        encoder.write_all(payload).map_err(BgzfError::Io)?;
        let compressed = encoder.finish().map_err(BgzfError::Io)?;
        if compressed.len() + 26 <= super::MAX_BLOCK_SIZE {
            break compressed;
        }
        if deflate_level >= MAX_COMPRESSION_LEVEL {
            return Err(BgzfError::DeflateOverflow);
        }
        deflate_level += 1;
    };

    let total = compressed.len() + 26;
    let mut block = Vec::with_capacity(total);
    block.extend_from_slice(&HEADER_TEMPLATE);
    let bsize = (total - 1) as u16;
    block[16] = bsize as u8;
    block[17] = (bsize >> 8) as u8;
    block.extend_from_slice(&compressed);
    block.extend_from_slice(&crc.to_le_bytes());
    block.extend_from_slice(&isize.to_le_bytes());
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgzf::reader::BgzfReader;
    use std::io::Read;

    #[test]
    fn remap_table_resolves_logical_positions() {
        let pool = ThreadPool::new(4);
        let mut writer = BgzfWriter::new(Vec::new(), Arc::clone(&pool), 6);
        let before_first = writer.logical_position();
        writer.write_all(&vec![b'x'; MAX_PAYLOAD]).unwrap();
        let before_second = writer.logical_position();
        writer.write_all(b"tail").unwrap();
        let (buf, remap) = writer.finish().unwrap();

        let (block0, _) = super::super::split_virtual_offset(remap.resolve(before_first));
        let (block1, within1) = super::super::split_virtual_offset(remap.resolve(before_second));
        assert_ne!(block0, block1);
        assert_eq!(within1, 0);

        let mut reader = BgzfReader::new(std::io::Cursor::new(buf), pool);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), MAX_PAYLOAD + 4);
        assert!(out.ends_with(b"tail"));
    }

    #[test]
    fn close_is_idempotent_about_eof_marker() {
        let pool = ThreadPool::new(2);
        let writer = BgzfWriter::new(Vec::new(), pool, 6);
        let (buf, _) = writer.finish().unwrap();
        assert!(buf.ends_with(&EOF_BLOCK));
        assert_eq!(buf, EOF_BLOCK.to_vec());
    }
}
