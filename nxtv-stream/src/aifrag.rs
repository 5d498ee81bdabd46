//! AI block fragment assembly.
//!
//! The Application Information block spans several teletext pages and
//! is critical for everything else, so it gets a dedicated recovery
//! path: undecoded control and text bytes are merged into two fixed
//! buffers across repeated transmissions, a presence bitmap tracks
//! which byte ranges were covered, and the buffer offset is advanced
//! for every incoming *or missing* packet so late data still lands at
//! the right place. A later transmission may fill holes or replace
//! bytes that previously failed Hamming or parity checks; the block is
//! delivered once the bitmap is complete and the checksum verifies.

use tracing::{debug, trace};

use nxtv_ttx::hamming::{ham84, parity_strip, parity_strip_buf, unham84, unham84_vec};
use nxtv_ttx::packet::TTX_PAYLOAD_BYTES;

use crate::block::{BlockType, RawBlock, StreamId};

/// Buffer fill markers: a Hamming code with a detectable error and a
/// byte with even parity, so uninitialized slots always re-read as
/// damaged.
const INVALID_HAM84: u8 = 0x01;
const INVALID_PARITY: u8 = 0x00;

/// Raw bytes of the block head captured before merging starts (block
/// header plus enough control data to identify the AI version).
const HEAD_RAW_LEN: usize = 28;

const BUF_LEN: usize = 2048;
const BITMAP_WORDS: usize = BUF_LEN / 64;

/// Result of a successful fragment assembly.
pub struct AiFragment {
    /// Decoded block image, same layout as stream-decoder output.
    pub image: Vec<u8>,
    /// 10-bit control length field for the block envelope.
    pub ctrl_len: usize,
    /// AI version from the block head.
    pub version: u8,
    pub version_swo: u8,
    /// Text-section parity failures at assembly time.
    pub parity_errors: usize,
}

impl AiFragment {
    pub fn into_raw_block(self) -> RawBlock {
        RawBlock {
            btype: BlockType::Ai,
            stream: StreamId::Stream1,
            version: self.version,
            ctrl_len: self.ctrl_len,
            parity_errors: self.parity_errors,
            image: self.image,
        }
    }
}

/// Incremental AI block assembler.
pub struct AiAssembler {
    ctrl_data: Box<[u8; BUF_LEN]>,
    text_data: Box<[u8; BUF_LEN]>,
    /// Presence bitmap over raw byte offsets of the block.
    recv: [u64; BITMAP_WORDS],

    /// A (partial) block occupies the buffers.
    have_block: bool,
    /// Reception of the occupying block is ongoing.
    active: bool,
    /// The buffered block verified completely.
    complete: bool,
    /// A block head is being captured into `new_head`.
    have_head: bool,

    /// Raw block length including the 4 header bytes.
    block_len: usize,
    chksum: u8,
    /// Decoded control bytes including the 2 header bytes.
    ctrl_len: usize,
    version: u8,
    version_swo: u8,

    page_pkg_count: u8,
    last_page_pkg: u8,
    /// Raw byte offset for the next packet's data.
    data_off: usize,

    new_head: [u8; HEAD_RAW_LEN],
}

impl Default for AiAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl AiAssembler {
    pub fn new() -> Self {
        Self {
            ctrl_data: Box::new([INVALID_HAM84; BUF_LEN]),
            text_data: Box::new([INVALID_PARITY; BUF_LEN]),
            recv: [0; BITMAP_WORDS],
            have_block: false,
            active: false,
            complete: false,
            have_head: false,
            block_len: 0,
            chksum: 0,
            ctrl_len: 0,
            version: 0,
            version_swo: 0,
            page_pkg_count: 0,
            last_page_pkg: 0,
            data_off: 0,
            new_head: [0; HEAD_RAW_LEN],
        }
    }

    /// True once a verified block is waiting for `assemble`.
    pub fn has_complete_block(&self) -> bool {
        self.complete
    }

    /// Called for every new page of stream 1: accounts for packets
    /// missing at the end of the previous page.
    pub fn start_page(&mut self, first_pkg: u8, pkg_count: u8) {
        if self.have_head && self.last_page_pkg != self.page_pkg_count {
            // block type not known yet, cannot bridge the gap
            self.have_head = false;
        }
        if self.active && self.last_page_pkg != self.page_pkg_count {
            self.data_off += self.page_pkg_count.saturating_sub(self.last_page_pkg) as usize
                * (TTX_PAYLOAD_BYTES - 1);
        }
        self.page_pkg_count = pkg_count;
        self.last_page_pkg = first_pkg;
    }

    /// Called for every stream-1 packet of the EPG page, regardless of
    /// the stream decoder's state.
    pub fn add_pkg(&mut self, pkg_no: u8, data: &[u8; TTX_PAYLOAD_BYTES]) {
        if pkg_no > self.last_page_pkg + 1 {
            trace!(missing = pkg_no - self.last_page_pkg - 1, "missing ttx packets");
            self.data_off +=
                (pkg_no - self.last_page_pkg - 1) as usize * (TTX_PAYLOAD_BYTES - 1);
            // packets missing while the head was incomplete: discard it
            self.have_head = false;
        } else if pkg_no != self.last_page_pkg + 1 {
            if self.have_head || self.active {
                debug!(pkg_no, "packet sequence error - discard block");
            }
            self.have_head = false;
            self.active = false;
        }

        // bytes belonging to the current block: up to the next block
        // start if the pointer decodes, else the whole packet
        let pkg_len = match unham84(data[0]) {
            Some(bp) if bp <= 0x0D => 3 * bp as usize,
            _ => TTX_PAYLOAD_BYTES - 1,
        };

        self.add_data(&data[1..1 + pkg_len]);

        if pkg_len < TTX_PAYLOAD_BYTES - 1 {
            self.active = false;
        }
        self.last_page_pkg = pkg_no;
    }

    /// Called by the stream decoder when a non-BI block starts: `head`
    /// are the 4 raw header bytes, `data` the raw packet bytes behind
    /// them.
    pub fn block_start(&mut self, head: [u8; 4], data: &[u8]) {
        if self.active {
            self.check_block();
            self.active = false;
        }
        // capture into the side buffer; the main buffer is only
        // touched once block type and version are known
        self.new_head[..4].copy_from_slice(&head);
        self.data_off = 4;
        self.have_head = true;

        self.add_data(data);
    }

    /// Aborts the in-flight block after a page sequence break; merged
    /// data of earlier transmissions is kept.
    pub fn break_assembly(&mut self) {
        self.have_head = false;
        self.active = false;
    }

    /// Discards all state once an AI block was accepted downstream.
    pub fn restart(&mut self) {
        self.complete = false;
        self.have_block = false;
        self.have_head = false;
        self.active = false;
    }

    /// Returns the verified block as a decoded image, or None if no
    /// complete block is pending. Reception continues into the same
    /// buffers afterwards.
    pub fn assemble(&mut self) -> Option<AiFragment> {
        if !self.complete {
            return None;
        }
        self.complete = false;

        let image_ctrl = unham84_vec(&self.ctrl_data[..self.ctrl_len * 2])?;
        let text_len = self.block_len - self.ctrl_len * 2;
        let mut text = vec![0u8; text_len];
        let parity_errors = parity_strip_buf(&self.text_data[..text_len], &mut text);

        let mut image = image_ctrl;
        image.extend_from_slice(&text);
        trace!(parity_errors, "delivering assembled AI block");

        Some(AiFragment {
            image,
            ctrl_len: self.ctrl_len - 2,
            version: self.version,
            version_swo: self.version_swo,
            parity_errors,
        })
    }

    /// Routes incoming raw bytes into head capture, control or text
    /// merging, advancing the block offset.
    fn add_data(&mut self, mut data: &[u8]) {
        if self.have_head {
            let head_rest = HEAD_RAW_LEN - self.data_off;
            let take = head_rest.min(data.len());
            self.new_head[self.data_off..self.data_off + take].copy_from_slice(&data[..take]);
            self.data_off += take;
            data = &data[take..];

            if self.data_off >= HEAD_RAW_LEN {
                self.decode_header();
                self.have_head = false;
            }
        }

        if self.active {
            let consumed = self.add_control_data(data);
            self.add_text_data(&data[consumed..]);

            if self.data_off >= self.block_len {
                self.check_block();
                self.active = false;
            }
        }
    }

    /// Decodes the captured head; an AI head either continues the
    /// buffered fragment (identical version fields) or replaces it.
    fn decode_header(&mut self) {
        let Some(head) = unham84_vec(&self.new_head) else {
            trace!("head decoding error");
            return;
        };
        let block_len = (((head[0] >> 5) as usize) | ((head[1] as usize) << 3)) + 4;
        let chksum = head[2];
        let ctrl_len = ((head[3] as usize) | (((head[4] & 0x03) as usize) << 8)) + 2;
        let btype = BlockType::from_code(head[4] >> 2);
        // the version counters straddle the byte boundary: stream 1 in
        // byte 5 bits 4..7 plus byte 6 bits 0..1, stream 2 in byte 6
        // bits 2..7
        let version = (head[5] >> 4) | ((head[6] & 0x03) << 4);
        let version_swo = head[6] >> 2;

        if btype != BlockType::Ai {
            trace!(?btype, "not an AI block");
            return;
        }
        if block_len > BUF_LEN || ctrl_len * 2 > block_len || ctrl_len * 2 < HEAD_RAW_LEN {
            debug!(block_len, ctrl_len, "implausible AI geometry - ignoring head");
            return;
        }

        if self.have_block
            && (block_len != self.block_len
                || chksum != self.chksum
                || ctrl_len != self.ctrl_len
                || version != self.version
                || version_swo != self.version_swo)
        {
            debug!(version, "AI block version change - discarding stored fragment");
            self.have_block = false;
            self.complete = false;
        }

        if !self.have_block {
            self.ctrl_data.fill(INVALID_HAM84);
            self.text_data.fill(INVALID_PARITY);
            self.recv = [0; BITMAP_WORDS];

            self.ctrl_data[..HEAD_RAW_LEN].copy_from_slice(&self.new_head);
            self.block_len = block_len;
            self.chksum = chksum;
            self.ctrl_len = ctrl_len;
            self.version = version;
            self.version_swo = version_swo;
            debug!(block_len, version, "start AI block assembly");
        }

        self.have_block = true;
        self.active = true;
    }

    /// Merges control bytes: only bytes that decode overwrite the
    /// buffer, everything advances the offset and the bitmap.
    fn add_control_data(&mut self, data: &[u8]) -> usize {
        if self.data_off >= self.ctrl_len * 2 {
            return 0;
        }
        let rest = self.ctrl_len * 2 - self.data_off;
        let take = rest.min(data.len());
        self.mark_received(self.data_off, take);

        for (i, &byte) in data[..take].iter().enumerate() {
            if unham84(byte).is_some() {
                self.ctrl_data[self.data_off + i] = byte;
            }
        }
        self.data_off += take;
        take
    }

    /// Merges text bytes: a byte with valid parity always wins, an
    /// invalid one only fills a still-uninitialized slot.
    fn add_text_data(&mut self, data: &[u8]) -> usize {
        if self.data_off < self.ctrl_len * 2 || self.data_off >= self.block_len {
            return 0;
        }
        let rest = self.block_len - self.data_off;
        let take = rest.min(data.len());
        self.mark_received(self.data_off, take);

        let base = self.data_off - self.ctrl_len * 2;
        for (i, &byte) in data[..take].iter().enumerate() {
            let slot = &mut self.text_data[base + i];
            if parity_strip(byte).is_some() || *slot == INVALID_PARITY {
                *slot = byte;
            }
        }
        self.data_off += take;
        take
    }

    fn mark_received(&mut self, off: usize, len: usize) {
        for bit in off..(off + len).min(BUF_LEN) {
            self.recv[bit / 64] |= 1 << (bit % 64);
        }
    }

    /// True if every byte of the block body was covered at least once.
    /// The head bytes below `HEAD_RAW_LEN` always come from the side
    /// buffer and are not tracked.
    fn check_received(&self) -> bool {
        for bit in HEAD_RAW_LEN..self.block_len {
            if self.recv[bit / 64] & (1 << (bit % 64)) == 0 {
                trace!(bit, "reception gap");
                return false;
            }
        }
        true
    }

    /// Verifies bitmap coverage, Hamming validity of the control
    /// section and the block checksum; sets the completion flag.
    fn check_block(&mut self) {
        if !self.check_received() {
            return;
        }

        // the checksum bytes do not include themselves
        let saved = (self.ctrl_data[4], self.ctrl_data[5]);
        self.ctrl_data[4] = ham84(0);
        self.ctrl_data[5] = ham84(0);

        let mut sum: u32 = 0;
        let mut ok = true;
        for &byte in &self.ctrl_data[..self.ctrl_len * 2] {
            match unham84(byte) {
                Some(nibble) => sum += nibble as u32,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        self.ctrl_data[4] = saved.0;
        self.ctrl_data[5] = saved.1;

        if !ok {
            trace!("hamming decoding error - block may be incomplete");
            return;
        }
        let computed = ((0x100 - (sum & 0xFF)) & 0xFF) as u8;
        if computed == self.chksum {
            self.complete = true;
            debug!(
                block_len = self.block_len,
                version = self.version,
                "AI fragment block complete"
            );
        } else {
            trace!(computed, expected = self.chksum, "fragment checksum error");
        }
    }
}
