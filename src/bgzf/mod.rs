//! C3/C4: BGZF (Blocked GNU Zip Format) codec — a gzip-compatible container
//! of independently decompressible members, each a standard DEFLATE block
//! wrapped in a gzip header carrying a `BC` FEXTRA subfield that records the
//! member's total compressed size.

pub mod reader;
pub mod writer;

/// Uncompressed payload bytes per block the writer targets before flushing.
pub const MAX_PAYLOAD: usize = 0xff00;

/// Upper bound on a BGZF member's total on-wire size.
pub const MAX_BLOCK_SIZE: usize = 0x10000;

/// The 18-byte gzip+FEXTRA header template; bytes 16-17 are the BSIZE
/// placeholder, filled in per block.
pub const HEADER_TEMPLATE: [u8; 18] = [
    0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff, 0x06, 0x00, b'B', b'C', 0x02, 0x00, 0, 0,
];

/// Canonical 28-byte empty-payload EOF marker.
pub const EOF_BLOCK: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff, 0x06, 0x00, b'B', b'C', 0x02, 0x00, 0x1b, 0x00,
    0x03, 0x00, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// A 64-bit virtual offset: `(compressed block file offset << 16) | within-block offset`.
pub fn virtual_offset(block_file_offset: u64, within_block: u16) -> u64 {
    (block_file_offset << 16) | within_block as u64
}

pub fn split_virtual_offset(voff: u64) -> (u64, u16) {
    (voff >> 16, (voff & 0xffff) as u16)
}

pub use reader::BgzfReader;
pub use writer::BgzfWriter;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_offset_round_trips() {
        let voff = virtual_offset(12345, 678);
        assert_eq!(split_virtual_offset(voff), (12345, 678));
    }
}
