//! C5: binary record codec — the on-disk BAM record layout.
//!
//! Each record is a fixed 32-byte core followed by a single variable-length
//! blob (name, CIGAR, packed sequence, qualities, tags back to back) plus
//! the three counts needed to slice it back apart; tag lookups scan that
//! blob linearly rather than maintaining a separate index.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{encode_base, CigarOp, Record, RecordCore, RawVariablePayload, TagKey, TagList, TagValue};
use crate::error::RecordError;

/// A single record's variable payload may never exceed this many bytes.
pub const MAX_VARIABLE_PAYLOAD: usize = 0xFFFF;

/// Decodes one record from `reader`. Returns `Ok(None)` at a clean
/// end-of-stream (zero bytes read before the length prefix).
pub fn decode_record<R: Read>(reader: &mut R) -> Result<Option<Record>, RecordError> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf)? {
        0 => return Ok(None),
        4 => {}
        n => return Err(RecordError::Truncated { block_length: 0, available: n }),
    }
    let block_length = u32::from_le_bytes(len_buf);
    if block_length < 32 {
        return Err(RecordError::BlockTooShort(block_length));
    }

    let mut core_buf = [0u8; 32];
    reader.read_exact(&mut core_buf).map_err(RecordError::Io)?;
    let mut core_cursor = &core_buf[..];

    let ref_id = core_cursor.read_i32::<LittleEndian>().unwrap();
    let pos = core_cursor.read_i32::<LittleEndian>().unwrap();
    let bin_mq_nl = core_cursor.read_u32::<LittleEndian>().unwrap();
    let flag_nc = core_cursor.read_u32::<LittleEndian>().unwrap();
    let seq_len = core_cursor.read_i32::<LittleEndian>().unwrap();
    let mate_ref_id = core_cursor.read_i32::<LittleEndian>().unwrap();
    let mate_pos = core_cursor.read_i32::<LittleEndian>().unwrap();
    let template_len = core_cursor.read_i32::<LittleEndian>().unwrap();

    let bin = (bin_mq_nl >> 16) as u16;
    let mapq = ((bin_mq_nl >> 8) & 0xff) as u8;
    let name_len = bin_mq_nl & 0xff;
    let flag = (flag_nc >> 16) as u16;
    let n_cigar_op = flag_nc & 0xffff;

    let var_len = block_length as usize - 32;
    if var_len > MAX_VARIABLE_PAYLOAD {
        return Err(RecordError::RecordTooLarge(var_len));
    }
    let mut bytes = vec![0u8; var_len];
    reader.read_exact(&mut bytes).map_err(RecordError::Io)?;

    let core = RecordCore { ref_id, pos, bin, mapq, flag, mate_ref_id, mate_pos, template_len };
    let raw = RawVariablePayload { bytes, name_len, n_cigar_op, seq_len };
    Ok(Some(Record::from_raw(core, raw)))
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Encodes `record` to `writer`, recomputing the bin unless the caller set
/// an explicit one.
pub fn encode_record<W: Write>(writer: &mut W, record: &Record) -> Result<(), RecordError> {
    let name = record.name();
    let mut name_bytes = name.into_bytes();
    name_bytes.push(0);
    let name_len = name_bytes.len() as u32;

    let cigar = record.cigar();
    let n_cigar_op = cigar.len() as u32;

    let seq = record.sequence();
    let seq_len = seq.len() as i32;
    let packed_seq = pack_sequence(&seq)?;

    let qual = encode_qualities(record, seq.len());

    let tags = record.tags();
    let tag_bytes = encode_tags(&tags);

    let var_len = name_bytes.len() + cigar.len() * 4 + packed_seq.len() + qual.len() + tag_bytes.len();
    if var_len > MAX_VARIABLE_PAYLOAD {
        return Err(RecordError::RecordTooLarge(var_len));
    }
    let block_length = 32 + var_len as u32;

    let bin = record.effective_bin();
    let bin_mq_nl = ((bin as u32) << 16) | ((record.mapq as u32) << 8) | (name_len & 0xff);
    let flag_nc = ((record.flag as u32) << 16) | (n_cigar_op & 0xffff);

    writer.write_u32::<LittleEndian>(block_length).map_err(RecordError::Io)?;
    writer.write_i32::<LittleEndian>(record.ref_id).map_err(RecordError::Io)?;
    writer.write_i32::<LittleEndian>(record.pos).map_err(RecordError::Io)?;
    writer.write_u32::<LittleEndian>(bin_mq_nl).map_err(RecordError::Io)?;
    writer.write_u32::<LittleEndian>(flag_nc).map_err(RecordError::Io)?;
    writer.write_i32::<LittleEndian>(seq_len).map_err(RecordError::Io)?;
    writer.write_i32::<LittleEndian>(record.mate_ref_id).map_err(RecordError::Io)?;
    writer.write_i32::<LittleEndian>(record.mate_pos).map_err(RecordError::Io)?;
    writer.write_i32::<LittleEndian>(record.template_len).map_err(RecordError::Io)?;

    writer.write_all(&name_bytes).map_err(RecordError::Io)?;
    for op in &cigar {
        writer.write_u32::<LittleEndian>(op.encoded()).map_err(RecordError::Io)?;
    }
    writer.write_all(&packed_seq).map_err(RecordError::Io)?;
    writer.write_all(&qual).map_err(RecordError::Io)?;
    writer.write_all(&tag_bytes).map_err(RecordError::Io)?;

    Ok(())
}

fn pack_sequence(seq: &[u8]) -> Result<Vec<u8>, RecordError> {
    let mut packed = vec![0u8; seq.len().div_ceil(2)];
    for (i, &base) in seq.iter().enumerate() {
        let code = encode_base(base)?;
        if i % 2 == 0 {
            packed[i / 2] = code << 4;
        } else {
            packed[i / 2] |= code;
        }
    }
    Ok(packed)
}

fn encode_qualities(record: &Record, seq_len: usize) -> Vec<u8> {
    let raw = record.qualities_raw();
    if raw.is_empty() {
        return vec![0xFFu8; seq_len];
    }
    raw
}

pub(super) fn parse_tags(bytes: &[u8]) -> Result<TagList, RecordError> {
    let mut tags = TagList::new();
    let mut cursor = bytes;
    while !cursor.is_empty() {
        let (key, value, rest) = parse_one_tag(cursor)?;
        tags.edit(key, value);
        cursor = rest;
    }
    Ok(tags)
}

fn parse_one_tag(data: &[u8]) -> Result<(TagKey, TagValue, &[u8]), RecordError> {
    if data.len() < 3 {
        return Err(RecordError::TruncatedTag('?'));
    }
    let key = [data[0], data[1]];
    let type_char = data[2] as char;
    let rest = &data[3..];
    parse_tag_value(type_char, rest).map(|(value, rest)| (key, value, rest))
}

fn parse_tag_value(type_char: char, data: &[u8]) -> Result<(TagValue, &[u8]), RecordError> {
    macro_rules! fixed {
        ($ty:ty, $read:expr, $variant:ident) => {{
            const N: usize = std::mem::size_of::<$ty>();
            if data.len() < N {
                return Err(RecordError::TruncatedTag(type_char));
            }
            let value: $ty = $read(&data[..N]);
            Ok((TagValue::$variant(value), &data[N..]))
        }};
    }

    match type_char {
        'A' => {
            if data.is_empty() {
                return Err(RecordError::TruncatedTag(type_char));
            }
            Ok((TagValue::Char(data[0]), &data[1..]))
        }
        'c' => fixed!(i8, |b: &[u8]| b[0] as i8, Int8),
        'C' => fixed!(u8, |b: &[u8]| b[0], UInt8),
        's' => fixed!(i16, |b: &[u8]| i16::from_le_bytes(b.try_into().unwrap()), Int16),
        'S' => fixed!(u16, |b: &[u8]| u16::from_le_bytes(b.try_into().unwrap()), UInt16),
        'i' => fixed!(i32, |b: &[u8]| i32::from_le_bytes(b.try_into().unwrap()), Int32),
        'I' => fixed!(u32, |b: &[u8]| u32::from_le_bytes(b.try_into().unwrap()), UInt32),
        'f' => fixed!(f32, |b: &[u8]| f32::from_le_bytes(b.try_into().unwrap()), Float),
        'Z' | 'H' => {
            let nul = data.iter().position(|&b| b == 0).ok_or(RecordError::TruncatedTag(type_char))?;
            let s = String::from_utf8_lossy(&data[..nul]).into_owned();
            let rest = &data[nul + 1..];
            Ok((if type_char == 'Z' { TagValue::Str(s) } else { TagValue::Hex(s) }, rest))
        }
        'B' => {
            if data.len() < 5 {
                return Err(RecordError::TruncatedTag(type_char));
            }
            let elem = data[0] as char;
            let count = u32::from_le_bytes(data[1..5].try_into().unwrap()) as usize;
            let mut cursor = &data[5..];
            macro_rules! read_array {
                ($ty:ty, $size:expr, $conv:expr, $variant:ident) => {{
                    if cursor.len() < count * $size {
                        return Err(RecordError::TruncatedTag(type_char));
                    }
                    let mut values = Vec::with_capacity(count);
                    for chunk in cursor[..count * $size].chunks_exact($size) {
                        values.push($conv(chunk));
                    }
                    cursor = &cursor[count * $size..];
                    TagValue::$variant(values)
                }};
            }
            let value = match elem {
                'c' => read_array!(i8, 1, |b: &[u8]| b[0] as i8, ArrayInt8),
                'C' => read_array!(u8, 1, |b: &[u8]| b[0], ArrayUInt8),
                's' => read_array!(i16, 2, |b: &[u8]| i16::from_le_bytes(b.try_into().unwrap()), ArrayInt16),
                'S' => read_array!(u16, 2, |b: &[u8]| u16::from_le_bytes(b.try_into().unwrap()), ArrayUInt16),
                'i' => read_array!(i32, 4, |b: &[u8]| i32::from_le_bytes(b.try_into().unwrap()), ArrayInt32),
                'I' => read_array!(u32, 4, |b: &[u8]| u32::from_le_bytes(b.try_into().unwrap()), ArrayUInt32),
                'f' => read_array!(f32, 4, |b: &[u8]| f32::from_le_bytes(b.try_into().unwrap()), ArrayFloat),
                other => return Err(RecordError::BadTagType(other)),
            };
            Ok((value, cursor))
        }
        other => Err(RecordError::BadTagType(other)),
    }
}

fn encode_tags(tags: &TagList) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in tags.iter() {
        out.extend_from_slice(key);
        out.push(value.type_char() as u8);
        encode_tag_value(value, &mut out);
    }
    out
}

fn encode_tag_value(value: &TagValue, out: &mut Vec<u8>) {
    match value {
        TagValue::Char(b) => out.push(*b),
        TagValue::Int8(v) => out.push(*v as u8),
        TagValue::UInt8(v) => out.push(*v),
        TagValue::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
        TagValue::UInt16(v) => out.extend_from_slice(&v.to_le_bytes()),
        TagValue::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        TagValue::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
        TagValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        TagValue::Str(s) | TagValue::Hex(s) => {
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        TagValue::ArrayInt8(v) => {
            out.push(b'c');
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                out.push(*x as u8);
            }
        }
        TagValue::ArrayUInt8(v) => {
            out.push(b'C');
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
        TagValue::ArrayInt16(v) => {
            out.push(b's');
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        TagValue::ArrayUInt16(v) => {
            out.push(b'S');
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        TagValue::ArrayInt32(v) => {
            out.push(b'i');
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        TagValue::ArrayUInt32(v) => {
            out.push(b'I');
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        TagValue::ArrayFloat(v) => {
            out.push(b'f');
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
    }
}

/// Recovers the CIGAR ops directly from a raw payload without materializing
/// the whole record; used by the sort/merge hot path when only position/bin
/// bookkeeping is needed. Currently unused outside tests but kept as the
/// building block `Record::cigar()` is implemented on top of.
#[allow(dead_code)]
pub(crate) fn cigar_from_raw(name_len: u32, n_cigar_op: u32, bytes: &[u8]) -> Result<Vec<CigarOp>, RecordError> {
    let start = name_len as usize;
    let end = start + (n_cigar_op as usize) * 4;
    bytes[start..end]
        .chunks_exact(4)
        .map(|c| CigarOp::from_encoded(u32::from_le_bytes(c.try_into().unwrap())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CigarOpKind, Record};

    fn sample_record() -> Record {
        let mut r = Record::new();
        r.ref_id = 0;
        r.pos = 100;
        r.mapq = 30;
        r.mate_ref_id = -1;
        r.mate_pos = -1;
        r.set_name("r1");
        r.set_cigar(vec![CigarOp::new(CigarOpKind::Match, 4)]);
        r.set_sequence(b"ACGT".to_vec());
        r.set_qualities_raw(vec![40, 40, 40, 40]);
        r
    }

    #[test]
    fn encode_decode_round_trip() {
        let record = sample_record();
        let mut buf = Vec::new();
        encode_record(&mut buf, &record).unwrap();

        let mut cursor = &buf[..];
        let decoded = decode_record(&mut cursor).unwrap().expect("one record");

        assert_eq!(decoded.ref_id, 0);
        assert_eq!(decoded.pos, 100);
        assert_eq!(decoded.mapq, 30);
        assert_eq!(decoded.name(), "r1");
        assert_eq!(decoded.cigar(), vec![CigarOp::new(CigarOpKind::Match, 4)]);
        assert_eq!(decoded.sequence(), b"ACGT");
        assert_eq!(decoded.qualities_ascii(), b"IIII");
        assert_eq!(decoded.effective_bin(), 4681);
    }

    #[test]
    fn end_to_end_scenario_single_record() {
        let record = sample_record();
        assert_eq!(record.end_position(false), 104);
        assert_eq!(record.effective_bin(), 4681);
    }

    #[test]
    fn tag_round_trip_through_binary_blob() {
        let mut r = sample_record();
        r.add_tag(*b"NM", TagValue::Int32(3));
        r.add_tag(*b"XB", TagValue::ArrayUInt8(vec![1, 2, 3]));
        let mut buf = Vec::new();
        encode_record(&mut buf, &r).unwrap();
        let mut cursor = &buf[..];
        let decoded = decode_record(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.get_tag(b"NM"), Some(TagValue::Int32(3)));
        assert_eq!(decoded.get_tag(b"XB"), Some(TagValue::ArrayUInt8(vec![1, 2, 3])));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut r = sample_record();
        r.set_sequence(vec![b'A'; 200_000]);
        r.set_qualities_raw(vec![30; 200_000]);
        let mut buf = Vec::new();
        let err = encode_record(&mut buf, &r).unwrap_err();
        assert!(matches!(err, RecordError::RecordTooLarge(_)));
    }
}
