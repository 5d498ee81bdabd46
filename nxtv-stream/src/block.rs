//! Nextview block framing.
//!
//! A block travels the teletext stream as a 4-byte Hamming header
//! (app-id and length), a Hamming-8/4 protected control section and an
//! odd-parity text section. After validation the decoder works on the
//! *decoded image*:
//!
//! ```text
//! image[0]      app_id bits 0..4 | block_len bits 0..2 << 5
//! image[1]      block_len bits 3..10
//! image[2]      checksum
//! image[3]      ctrl_len bits 0..7
//! image[4]      ctrl_len bits 8..9 | type << 2
//! image[5..ctrl_len + 2]   type-specific control fields
//! image[ctrl_len + 2..]    text section, parity stripped
//! ```
//!
//! `ctrl_len` is the 10-bit field of the wire format; the control
//! section spans `ctrl_len + 2` decoded bytes including the block
//! header.

/// The two logical Nextview streams, multiplexed by the page subcode
/// high nibble. Stream 2 carries farther-future programme data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Stream1,
    Stream2,
}

impl StreamId {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            StreamId::Stream1 => 0,
            StreamId::Stream2 => 1,
        }
    }

    /// Stream carried by a page, from the subcode high nibble.
    pub fn of_subcode(sub: u16) -> Option<StreamId> {
        match (sub & 0xF00) >> 8 {
            0 => Some(StreamId::Stream1),
            1 => Some(StreamId::Stream2),
            _ => None,
        }
    }
}

/// Nextview block types. BI blocks are addressed by app-id 0 rather
/// than the type field; all other codes come from the control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Bi,
    Ai,
    Pi,
    Ni,
    Oi,
    Mi,
    Li,
    Ti,
    Hi,
    Ui,
    Ci,
    Unknown(u8),
}

impl BlockType {
    pub fn from_code(code: u8) -> BlockType {
        match code {
            0 => BlockType::Bi,
            1 => BlockType::Ai,
            2 => BlockType::Pi,
            3 => BlockType::Ni,
            4 => BlockType::Oi,
            5 => BlockType::Mi,
            6 => BlockType::Li,
            7 => BlockType::Ti,
            8 => BlockType::Hi,
            9 => BlockType::Ui,
            10 => BlockType::Ci,
            n => BlockType::Unknown(n),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            BlockType::Bi => 0,
            BlockType::Ai => 1,
            BlockType::Pi => 2,
            BlockType::Ni => 3,
            BlockType::Oi => 4,
            BlockType::Mi => 5,
            BlockType::Li => 6,
            BlockType::Ti => 7,
            BlockType::Hi => 8,
            BlockType::Ui => 9,
            BlockType::Ci => 10,
            BlockType::Unknown(n) => n,
        }
    }

    /// True for the types the database stores.
    pub fn is_epg(self) -> bool {
        !matches!(
            self,
            BlockType::Hi | BlockType::Ui | BlockType::Ci | BlockType::Unknown(_)
        )
    }
}

/// A validated, decoded block image plus its stream envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub btype: BlockType,
    pub stream: StreamId,
    /// AI version counter of the stream at emission time.
    pub version: u8,
    /// 10-bit control length field.
    pub ctrl_len: usize,
    /// Parity failures in the text section (quality metric).
    pub parity_errors: usize,
    pub image: Vec<u8>,
}

impl RawBlock {
    /// Control section including the 5 header bytes.
    pub fn ctrl(&self) -> &[u8] {
        &self.image[..(self.ctrl_len + 2).min(self.image.len())]
    }

    /// Text section following the control section.
    pub fn text(&self) -> &[u8] {
        &self.image[(self.ctrl_len + 2).min(self.image.len())..]
    }
}

/// Block checksum: the two's complement of the nibble sum, so that
/// summing all nibbles of a valid control section (with the checksum
/// byte zeroed) plus the checksum yields 0 mod 256.
pub fn compute_checksum(data: &[u8]) -> u8 {
    let mut sum = 0u32;
    for &b in data {
        sum += (b & 0x0F) as u32;
        sum += (b >> 4) as u32;
    }
    ((0x100 - (sum & 0xFF)) & 0xFF) as u8
}
