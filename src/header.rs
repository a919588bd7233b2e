//! C7: header model — the text header plus its parsed sequence dictionary.
//!
//! The ordered name→index dictionary is backed by `indexmap::IndexMap` so
//! reference lookup stays O(1) while reference order (and thus refID
//! assignment) tracks insertion order.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;

use crate::error::HeaderError;

/// Max serialized header text size accepted on read, a sanity bound rather
/// than a format limit.
const MAX_HEADER_TEXT_LEN: u32 = 64 * 1024 * 1024;

/// One `@SQ` entry: name, length, and its index in dictionary order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSequence {
    pub name: String,
    pub length: i64,
}

/// Ordered `name -> index` sequence dictionary plus the raw lines the header
/// was built from (other `@`-lines: `@HD`, `@RG`, `@PG`, `@CO`, ...).
#[derive(Debug, Clone, Default)]
pub struct Header {
    references: Vec<ReferenceSequence>,
    name_to_index: IndexMap<String, usize>,
    other_lines: Vec<String>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, HeaderError> {
        let mut header = Header::new();
        for line in text.lines() {
            if !line.starts_with('@') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("@SQ\t") {
                header.parse_sq_line(rest)?;
            } else {
                header.other_lines.push(line.to_string());
            }
        }
        Ok(header)
    }

    fn parse_sq_line(&mut self, rest: &str) -> Result<(), HeaderError> {
        let mut name = None;
        let mut length = None;
        for field in rest.split('\t') {
            if let Some(n) = field.strip_prefix("SN:") {
                name = Some(n.to_string());
            } else if let Some(l) = field.strip_prefix("LN:") {
                length = Some(
                    l.parse::<i64>()
                        .map_err(|_| HeaderError::BadReferenceLength(l.to_string()))?,
                );
            }
        }
        let name = name.ok_or_else(|| HeaderError::MissingField("@SQ".to_string(), "SN"))?;
        let length = length.ok_or_else(|| HeaderError::MissingField("@SQ".to_string(), "LN"))?;
        self.add_reference(name, length)
    }

    pub fn add_reference(&mut self, name: impl Into<String>, length: i64) -> Result<(), HeaderError> {
        let name = name.into();
        if self.name_to_index.contains_key(&name) {
            return Err(HeaderError::DuplicateReference(name));
        }
        let index = self.references.len();
        self.name_to_index.insert(name.clone(), index);
        self.references.push(ReferenceSequence { name, length });
        Ok(())
    }

    pub fn references(&self) -> &[ReferenceSequence] {
        &self.references
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn reference_at(&self, index: usize) -> Option<&ReferenceSequence> {
        self.references.get(index)
    }

    pub fn other_lines(&self) -> &[String] {
        &self.other_lines
    }

    pub fn push_other_line(&mut self, line: impl Into<String>) {
        self.other_lines.push(line.into());
    }

    /// Serializes back to SAM header text, appending a `@PG` line for this
    /// tool. When `prune_prior_program` is set, prior `@PG` lines whose `ID`
    /// matches `program_id` are dropped first.
    pub fn to_text(&self, program_id: &str, program_name: &str, prune_prior_program: bool) -> String {
        let mut out = String::new();
        let has_hd = self.other_lines.iter().any(|l| l.starts_with("@HD"));
        if !has_hd {
            out.push_str("@HD\tVN:1.6\n");
        }
        for line in &self.other_lines {
            if prune_prior_program && line.starts_with("@PG") && line.contains(&format!("ID:{program_id}")) {
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
        for seq in &self.references {
            out.push_str(&format!("@SQ\tSN:{}\tLN:{}\n", seq.name, seq.length));
        }
        out.push_str(&format!("@PG\tID:{program_id}\tPN:{program_name}\n"));
        out
    }

    /// `true` if both headers have the same sequence names in the same
    /// order with the same lengths.
    pub fn dictionaries_match(&self, other: &Header) -> bool {
        self.references == other.references
    }

    /// Writes the BAM binary header: magic `BAM\1`, `l_text`/text, `n_ref`,
    /// then one `(l_name, name\0, l_ref)` triple per reference, per the
    /// standard BAM header layout.
    pub fn write_binary<W: Write>(&self, writer: &mut W, program_id: &str, program_name: &str) -> io::Result<()> {
        let text = self.to_text(program_id, program_name, false);
        writer.write_all(b"BAM\x01")?;
        writer.write_u32::<LittleEndian>(text.len() as u32)?;
        writer.write_all(text.as_bytes())?;
        writer.write_i32::<LittleEndian>(self.references.len() as i32)?;
        for seq in &self.references {
            let mut name_bytes = seq.name.clone().into_bytes();
            name_bytes.push(0);
            writer.write_i32::<LittleEndian>(name_bytes.len() as i32)?;
            writer.write_all(&name_bytes)?;
            writer.write_i32::<LittleEndian>(seq.length as i32)?;
        }
        Ok(())
    }

    /// Reads a BAM binary header. The reference dictionary embedded in the
    /// binary container takes precedence; any `@SQ` lines already present
    /// in the parsed text are replaced with it so `index_of`/`reference_at`
    /// agree with the binary `n_ref` table.
    pub fn read_binary<R: Read>(reader: &mut R) -> Result<Self, HeaderError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|_| HeaderError::MissingField("BAM".into(), "magic"))?;
        if &magic != b"BAM\x01" {
            return Err(HeaderError::MissingField("BAM".into(), "magic"));
        }
        let l_text = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| HeaderError::MissingField("BAM".into(), "l_text"))?;
        if l_text > MAX_HEADER_TEXT_LEN {
            return Err(HeaderError::MissingField("BAM".into(), "l_text"));
        }
        let mut text_bytes = vec![0u8; l_text as usize];
        reader.read_exact(&mut text_bytes).map_err(|_| HeaderError::MissingField("BAM".into(), "text"))?;
        let text = String::from_utf8_lossy(&text_bytes);

        let mut header = Header::new();
        for line in text.lines() {
            if line.starts_with("@SQ\t") {
                continue;
            }
            if line.starts_with('@') {
                header.other_lines.push(line.to_string());
            }
        }

        let n_ref = reader
            .read_i32::<LittleEndian>()
            .map_err(|_| HeaderError::MissingField("BAM".into(), "n_ref"))?;
        for _ in 0..n_ref {
            let l_name = reader
                .read_i32::<LittleEndian>()
                .map_err(|_| HeaderError::MissingField("BAM".into(), "l_name"))?;
            let mut name_bytes = vec![0u8; l_name as usize];
            reader.read_exact(&mut name_bytes).map_err(|_| HeaderError::MissingField("BAM".into(), "name"))?;
            name_bytes.pop(); // trailing NUL
            let name = String::from_utf8_lossy(&name_bytes).into_owned();
            let l_ref = reader
                .read_i32::<LittleEndian>()
                .map_err(|_| HeaderError::MissingField("BAM".into(), "l_ref"))?;
            header.add_reference(name, l_ref as i64)?;
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sq_lines_in_order() {
        let text = "@HD\tVN:1.6\n@SQ\tSN:chr1\tLN:1000\n@SQ\tSN:chr2\tLN:2000\n";
        let header = Header::parse(text).unwrap();
        assert_eq!(header.index_of("chr1"), Some(0));
        assert_eq!(header.index_of("chr2"), Some(1));
        assert_eq!(header.reference_at(0).unwrap().length, 1000);
    }

    #[test]
    fn duplicate_reference_name_errors() {
        let mut header = Header::new();
        header.add_reference("chr1", 100).unwrap();
        assert!(header.add_reference("chr1", 200).is_err());
    }

    #[test]
    fn binary_header_round_trips_dictionary() {
        let mut header = Header::new();
        header.add_reference("chr1", 1000).unwrap();
        header.add_reference("chr2", 2000).unwrap();
        let mut buf = Vec::new();
        header.write_binary(&mut buf, "bamforge", "bamforge").unwrap();
        let decoded = Header::read_binary(&mut &buf[..]).unwrap();
        assert_eq!(decoded.index_of("chr1"), Some(0));
        assert_eq!(decoded.reference_at(1).unwrap().length, 2000);
    }

    #[test]
    fn serialization_appends_program_line() {
        let mut header = Header::new();
        header.add_reference("ref", 1000).unwrap();
        let text = header.to_text("bamforge", "bamforge", false);
        assert!(text.contains("@SQ\tSN:ref\tLN:1000"));
        assert!(text.contains("@PG\tID:bamforge"));
    }
}
