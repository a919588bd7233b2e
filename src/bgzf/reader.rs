//! C3: BGZF input stream — a reader thread that parses member headers and
//! dispatches parallel inflate jobs, exposing an ordered byte stream.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use flate2::read::DeflateDecoder;
use parking_lot::{Condvar, Mutex};

use crate::error::BgzfError;
use crate::pool::ThreadPool;

use super::{HEADER_TEMPLATE, MAX_BLOCK_SIZE};

/// Soft cap on how many parsed-but-not-yet-consumed blocks may queue up
/// before the reader thread blocks.
const READY_QUEUE_SOFT_CAP: usize = 100;

struct BlockSlot {
    /// Compressed-file offset where this member's header began.
    file_offset: u64,
    state: Mutex<Option<Result<Vec<u8>, String>>>,
    cv: Condvar,
}

impl BlockSlot {
    fn new(file_offset: u64) -> Self {
        Self { file_offset, state: Mutex::new(None), cv: Condvar::new() }
    }

    fn set_result(&self, result: Result<Vec<u8>, String>) {
        let mut state = self.state.lock();
        *state = Some(result);
        self.cv.notify_all();
    }

    /// Blocks until this block's inflate job has completed.
    fn wait_ready(&self) {
        let mut state = self.state.lock();
        while state.is_none() {
            self.cv.wait(&mut state);
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<Arc<BlockSlot>>>,
    not_full: Condvar,
    not_empty: Condvar,
    reader_done: AtomicBool,
    reader_error: Mutex<Option<BgzfError>>,
}

/// Reads a BGZF byte stream, decompressing members in parallel while
/// preserving output order.
pub struct BgzfReader {
    shared: Arc<Shared>,
    reader_thread: Option<JoinHandle<()>>,
    current: Option<Arc<BlockSlot>>,
    current_bytes: Vec<u8>,
    pos_in_current: usize,
    /// compressed-file offset of the block currently being consumed.
    current_file_offset: u64,
    saw_eof_marker: bool,
}

impl BgzfReader {
    /// Opens `source`, spawning the header-reading/job-dispatch thread.
    /// `pool` supplies the worker threads used for inflation.
    pub fn new<R: Read + Send + 'static>(mut source: R, pool: Arc<ThreadPool>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            reader_done: AtomicBool::new(false),
            reader_error: Mutex::new(None),
        });

        let reader_shared = Arc::clone(&shared);
        let reader_thread = std::thread::Builder::new()
            .name("bamforge-bgzf-reader".into())
            .spawn(move || {
                let mut file_offset = 0u64;
                loop {
                    match read_one_member(&mut source, file_offset) {
                        Ok(None) => break,
                        Ok(Some((member_len, deflate_data, expected_crc, expected_isize))) => {
                            let slot = Arc::new(BlockSlot::new(file_offset));
                            file_offset += member_len as u64;

                            {
                                let mut queue = reader_shared.queue.lock();
                                while queue.len() >= READY_QUEUE_SOFT_CAP {
                                    reader_shared.not_full.wait(&mut queue);
                                }
                                queue.push_back(Arc::clone(&slot));
                                reader_shared.not_empty.notify_one();
                            }

                            let pool_slot = Arc::clone(&slot);
                            pool.submit(move || {
                                let result = inflate_member(&deflate_data, expected_crc, expected_isize)
                                    .map_err(|e| e.to_string());
                                pool_slot.set_result(result);
                            });
                        }
                        Err(err) => {
                            *reader_shared.reader_error.lock() = Some(err);
                            break;
                        }
                    }
                }
                reader_shared.reader_done.store(true, Ordering::Release);
                reader_shared.not_empty.notify_all();
            })
            .expect("failed to spawn BGZF reader thread");

        Self {
            shared,
            reader_thread: Some(reader_thread),
            current: None,
            current_bytes: Vec::new(),
            pos_in_current: 0,
            current_file_offset: 0,
            saw_eof_marker: false,
        }
    }

    /// Virtual offset of the next byte this reader will return.
    pub fn virtual_offset(&self) -> u64 {
        super::virtual_offset(self.current_file_offset, self.pos_in_current as u16)
    }

    fn advance_block(&mut self) -> io::Result<bool> {
        loop {
            let next = {
                let mut queue = self.shared.queue.lock();
                loop {
                    if let Some(slot) = queue.pop_front() {
                        self.shared.not_full.notify_one();
                        break Some(slot);
                    }
                    if self.shared.reader_done.load(Ordering::Acquire) {
                        break None;
                    }
                    self.shared.not_empty.wait(&mut queue);
                }
            };

            let Some(slot) = next else {
                if let Some(err) = self.shared.reader_error.lock().take() {
                    return Err(io::Error::other(err));
                }
                return Ok(false);
            };

            slot.wait_ready();
            let result = slot.state.lock().take().expect("slot marked ready");
            let bytes = result.map_err(io::Error::other)?;
            self.current_file_offset = slot.file_offset;
            self.pos_in_current = 0;
            if bytes.is_empty() {
                // Empty-payload member: either an interior no-op or the EOF
                // marker. Either way there is nothing to read from it.
                self.saw_eof_marker = true;
                continue;
            }
            self.current_bytes = bytes;
            return Ok(true);
        }
    }
}

impl Read for BgzfReader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        while self.pos_in_current >= self.current_bytes.len() {
            if !self.advance_block()? {
                return Ok(0);
            }
        }
        let avail = &self.current_bytes[self.pos_in_current..];
        let take = avail.len().min(dst.len());
        dst[..take].copy_from_slice(&avail[..take]);
        self.pos_in_current += take;
        Ok(take)
    }
}

impl Drop for BgzfReader {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

type MemberParts = (usize, Vec<u8>, u32, u32);

/// Reads and validates one gzip member's header and body, returning its
/// total on-wire length, raw deflate payload, and expected CRC32/ISIZE.
/// Returns `Ok(None)` at a clean end-of-stream.
fn read_one_member<R: Read>(source: &mut R, file_offset: u64) -> Result<Option<MemberParts>, BgzfError> {
    let mut header = [0u8; 18];
    let first = match read_some(source, &mut header[..1])? {
        0 => return Ok(None),
        n => n,
    };
    if first != 1 || read_exact_or_err(source, &mut header[1..])?.is_none() {
        return Err(BgzfError::TruncatedHeader { got: 1 });
    }

    if header[0] != 0x1f || header[1] != 0x8b {
        return Err(BgzfError::BadMagic([header[0], header[1]]));
    }
    if header[2] != 0x08 {
        return Err(BgzfError::BadMethod(header[2]));
    }
    if header[3] & 0x04 == 0 {
        return Err(BgzfError::MissingFextra(header[3]));
    }
    let xlen = u16::from_le_bytes([header[10], header[11]]);
    if xlen != 6 {
        return Err(BgzfError::BadXlen { xlen });
    }
    if header[12] != b'B' || header[13] != b'C' {
        return Err(BgzfError::BadSubfieldId([header[12], header[13]]));
    }
    let slen = u16::from_le_bytes([header[14], header[15]]);
    if slen != 2 {
        return Err(BgzfError::BadSlen(slen));
    }
    let bsize = u16::from_le_bytes([header[16], header[17]]) as usize + 1;
    if bsize < 26 || bsize > MAX_BLOCK_SIZE {
        return Err(BgzfError::TruncatedHeader { got: bsize });
    }

    let deflate_len = bsize - 18 - 8;
    let mut deflate_data = vec![0u8; deflate_len];
    read_exact_or_err(source, &mut deflate_data)?.ok_or(BgzfError::TruncatedHeader { got: deflate_len })?;

    let mut footer = [0u8; 8];
    read_exact_or_err(source, &mut footer)?.ok_or(BgzfError::TruncatedHeader { got: 8 })?;
    let expected_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let expected_isize = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]);

    let _ = file_offset;
    Ok(Some((bsize, deflate_data, expected_crc, expected_isize)))
}

fn read_some<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize, BgzfError> {
    loop {
        match source.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BgzfError::Io(e)),
        }
    }
}

/// `Ok(Some(n))` once `buf` is fully read, `Ok(None)` if the stream ended
/// partway through (a truncated member).
fn read_exact_or_err<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<Option<usize>, BgzfError> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BgzfError::Io(e)),
        }
    }
    Ok(Some(filled))
}

fn inflate_member(deflate_data: &[u8], expected_crc: u32, expected_isize: u32) -> Result<Vec<u8>, BgzfError> {
    let mut decoder = DeflateDecoder::new(deflate_data);
    let mut out = Vec::with_capacity(expected_isize as usize);
    decoder.read_to_end(&mut out).map_err(|e| BgzfError::Inflate(e.to_string()))?;
    if out.len() as u32 != expected_isize {
        return Err(BgzfError::Inflate(format!(
            "ISIZE mismatch: member declared {expected_isize}, got {}",
            out.len()
        )));
    }
    let actual_crc = crc32fast::hash(&out);
    if actual_crc != expected_crc {
        return Err(BgzfError::Inflate(format!(
            "CRC32 mismatch: member declared {expected_crc:#010x}, got {actual_crc:#010x}"
        )));
    }
    Ok(out)
}

#[allow(dead_code)]
fn header_template_sanity_check() {
    debug_assert_eq!(HEADER_TEMPLATE.len(), 18);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgzf::writer::BgzfWriter;
    use std::io::{Cursor, Write};

    #[test]
    fn round_trips_small_payload() {
        let pool = ThreadPool::new(2);
        let mut buf = Vec::new();
        {
            let mut writer = BgzfWriter::new(&mut buf, Arc::clone(&pool), 6);
            writer.write_all(b"hello bgzf world").unwrap();
            writer.finish().unwrap();
        }

        let mut reader = BgzfReader::new(Cursor::new(buf), pool);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello bgzf world");
    }

    #[test]
    fn eof_scenario_two_members_and_marker() {
        // A 70000-byte payload at level 6 yields >=2 data members plus the
        // trailing empty marker, and decompresses back to the exact input.
        let pool = ThreadPool::new(4);
        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let mut buf = Vec::new();
        {
            let mut writer = BgzfWriter::new(&mut buf, Arc::clone(&pool), 6);
            writer.write_all(&payload).unwrap();
            writer.finish().unwrap();
        }
        assert!(buf.ends_with(&super::super::EOF_BLOCK));

        let mut reader = BgzfReader::new(Cursor::new(buf), pool);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let pool = ThreadPool::new(1);
        let mut reader = BgzfReader::new(Cursor::new(vec![0u8; 18]), pool);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }
}
