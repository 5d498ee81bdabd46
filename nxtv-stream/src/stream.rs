//! Nextview stream decoder.
//!
//! Assembles Nextview blocks from the teletext packets of the EPG page
//! per ETS 300 708 chapter 4 ("Page Format - Clear"): each page subcode
//! selects one of two logical streams, a Hamming nibble in front of
//! every packet points at the next block start, block headers carry
//! app-id and length, and a nibble-sum checksum guards the assembled
//! control section. Bit errors, packet loss and page discontinuities
//! discard the smallest unit possible, usually one block.

use std::collections::VecDeque;

use tracing::{debug, trace};

use nxtv_ttx::hamming::{unham84, unham84_vec};
use nxtv_ttx::packet::TTX_PAYLOAD_BYTES;

use crate::aifrag::AiAssembler;
use crate::block::{compute_checksum, BlockType, RawBlock, StreamId};

/// Largest raw block: 12-bit length plus the 4 header bytes.
const BLOCK_BUF_MAX: usize = 2048 + 4;

/// Payload offset of the first data byte (after the block pointer).
const BP_OFFSET: usize = 1;

#[derive(Default)]
struct StreamState {
    ci: u8,
    pkg_count: u8,
    last_pkg: u8,
    app_id: u16,
    /// Raw block length including the 4 header bytes.
    block_len: usize,
    recv_len: usize,
    have_block: bool,
    /// 0 when no header fragment is pending, else `40 - block_ptr` of
    /// the packet the fragment was found in (1 + stored bytes).
    have_header: u8,
    header_fragment: [u8; 3],
    block_buf: Vec<u8>,
}

impl StreamState {
    fn drop_partial(&mut self) {
        self.have_block = false;
        self.have_header = 0;
    }
}

/// Two-stream Nextview block assembler with a scratch queue of
/// completed blocks.
pub struct StreamDecoder {
    streams: [StreamState; 2],
    cur_stream: Option<StreamId>,
    scratch: VecDeque<RawBlock>,
    app_id: u16,
    /// Until a BI/AI pair was accepted only BI and AI leave the
    /// decoder.
    enable_all: bool,
    /// AI version per stream, tagged onto every emitted block.
    ai_version: [u8; 2],
    aifrag: AiAssembler,
}

impl StreamDecoder {
    /// `wait_for_bi_ai` starts the decoder in scratch mode where only
    /// BI and AI blocks are emitted; `app_id` is the expected EPG
    /// application id.
    pub fn new(wait_for_bi_ai: bool, app_id: u16) -> Self {
        Self {
            streams: [StreamState::default(), StreamState::default()],
            cur_stream: None,
            scratch: VecDeque::new(),
            app_id,
            enable_all: !wait_for_bi_ai,
            ai_version: [0, 0],
            aifrag: AiAssembler::new(),
        }
    }

    /// Permits all block types into the scratch queue (after the AI
    /// was accepted).
    pub fn enable_all_types(&mut self) {
        self.enable_all = true;
    }

    /// Installs the AI version counters used to tag emitted blocks.
    pub fn set_ai_version(&mut self, version: u8, version_swo: u8) {
        self.ai_version = [version, version_swo];
    }

    pub fn ai_assembler(&mut self) -> &mut AiAssembler {
        &mut self.aifrag
    }

    /// Takes the oldest completed block.
    pub fn next_block(&mut self) -> Option<RawBlock> {
        self.scratch.pop_front()
    }

    /// Takes the oldest completed block of one type, out of order.
    pub fn take_block_of_type(&mut self, btype: BlockType) -> Option<RawBlock> {
        let pos = self.scratch.iter().position(|b| b.btype == btype)?;
        self.scratch.remove(pos)
    }

    pub fn clear_scratch(&mut self) {
        self.scratch.clear();
    }

    /// Processes a page header packet; returns true if the page
    /// belongs to a Nextview stream and following packets should be
    /// fed in.
    pub fn new_page(&mut self, sub: u16) -> bool {
        self.cur_stream = StreamId::of_subcode(sub);
        let Some(stream) = self.cur_stream else {
            debug!(sub, "unexpected stream number - ignoring page");
            return false;
        };

        let pkg_count = (((sub & 0x3000) >> 9) | ((sub & 0x70) >> 4)) as u8;
        if pkg_count > 25 {
            debug!(pkg_count, "too many packets for page");
            self.cur_stream = None;
            return false;
        }

        let new_ci = (sub & 0x0F) as u8;
        let mut first_pkg = 0;
        let psd = &mut self.streams[stream.index()];

        if psd.have_block || psd.have_header != 0 {
            if psd.ci == new_ci {
                // fragmented transmission of the same page, continue
                // behind the last received packet
                first_pkg = psd.last_pkg;
            } else if (psd.ci + 1) & 0x0F != new_ci {
                debug!(old = psd.ci, new = new_ci, "page continuity error - discard block");
                psd.drop_partial();
                if stream == StreamId::Stream1 {
                    self.aifrag.break_assembly();
                }
            } else if psd.last_pkg != psd.pkg_count {
                debug!(
                    have = psd.last_pkg,
                    want = psd.pkg_count,
                    "packets missing at page end - discard block"
                );
                psd.drop_partial();
            }
        }

        let psd = &mut self.streams[stream.index()];
        psd.ci = new_ci;
        psd.pkg_count = pkg_count;
        psd.last_pkg = first_pkg;

        if stream == StreamId::Stream1 {
            self.aifrag.start_page(first_pkg, pkg_count);
        }
        true
    }

    /// Processes one data packet of the current page. A single packet
    /// can complete and start several blocks.
    pub fn decode_packet(&mut self, pkg: u8, data: &[u8; TTX_PAYLOAD_BYTES]) {
        let Some(stream) = self.cur_stream else {
            return;
        };
        if stream == StreamId::Stream1 {
            self.aifrag.add_pkg(pkg, data);
        }

        if pkg > self.streams[stream.index()].pkg_count {
            trace!(pkg, "packet number beyond page packet count");
            return;
        }

        let psd = &mut self.streams[stream.index()];
        if (psd.have_block || psd.have_header != 0) && pkg != psd.last_pkg.wrapping_add(1) {
            debug!(expected = psd.last_pkg + 1, got = pkg, "missing packet - discard block");
            psd.drop_partial();
        }
        psd.last_pkg = pkg;

        let mut block_ptr = match unham84(data[0]) {
            Some(bp) if bp <= 0x0D => BP_OFFSET + 3 * bp as usize,
            _ => {
                debug!(pkg, "hamming error in block pointer - discard packet");
                self.streams[stream.index()].drop_partial();
                return;
            }
        };

        if self.streams[stream.index()].have_header != 0 {
            self.continue_header(stream, block_ptr, data);
        } else if self.streams[stream.index()].have_block {
            self.continue_block(stream, block_ptr, data);
        }

        // start of at least one new structure in this packet
        while block_ptr < TTX_PAYLOAD_BYTES {
            match unham84(data[block_ptr]) {
                Some(0x0C) => {
                    if block_ptr >= 36 {
                        // part of the header is in the next packet
                        let psd = &mut self.streams[stream.index()];
                        psd.have_header = (TTX_PAYLOAD_BYTES - block_ptr) as u8;
                        let frag_len = psd.have_header as usize - 1;
                        psd.header_fragment[..frag_len]
                            .copy_from_slice(&data[block_ptr + 1..block_ptr + 1 + frag_len]);
                        block_ptr = TTX_PAYLOAD_BYTES;
                    } else {
                        match self.start_block(stream, block_ptr, data) {
                            Some(next_ptr) => block_ptr = next_ptr,
                            None => block_ptr = TTX_PAYLOAD_BYTES,
                        }
                    }
                }
                _ => {
                    // decoding error or no block start marker
                    debug!(block_ptr, "structure header error - skipping rest of packet");
                    self.streams[stream.index()].drop_partial();
                    block_ptr = TTX_PAYLOAD_BYTES;
                }
            }
        }
    }

    /// Completes a header fragment stashed from the previous packet.
    fn continue_header(&mut self, stream: StreamId, block_ptr: usize, data: &[u8]) {
        let psd = &mut self.streams[stream.index()];
        let stored = psd.have_header as usize - 1;
        psd.have_header = 0;

        let mut head = [0u8; 4];
        head[..stored].copy_from_slice(&psd.header_fragment[..stored]);
        for (i, byte) in head.iter_mut().enumerate().skip(stored) {
            *byte = data[BP_OFFSET + i - stored];
        }

        let Some((app_id, block_len)) = decode_block_header(&head) else {
            debug!("structure header hamming error - skipping block");
            return;
        };
        psd.app_id = app_id;
        psd.block_len = block_len;
        psd.recv_len = 0;

        // the packet must either carry no further block start or the
        // current block must end before it
        let consumed = 4 - stored;
        if block_ptr == TTX_PAYLOAD_BYTES || block_ptr - 1 >= block_len.saturating_sub(stored) {
            let mut rest = block_ptr - 1 - consumed;
            if block_len - 4 < rest {
                rest = block_len - 4;
            }
            psd.block_buf.clear();
            psd.block_buf.extend_from_slice(&head);
            psd.block_buf
                .extend_from_slice(&data[BP_OFFSET + consumed..BP_OFFSET + consumed + rest]);
            psd.recv_len = rest + 4;

            if stream == StreamId::Stream1 && app_id != 0 {
                self.aifrag
                    .block_start(head, &data[BP_OFFSET + consumed..]);
            }

            let psd = &mut self.streams[stream.index()];
            if psd.recv_len >= psd.block_len {
                self.check_block(stream);
            } else {
                self.streams[stream.index()].have_block = true;
            }
        } else {
            debug!(
                have = block_ptr - 1,
                need = block_len - (stored + 1),
                "too few data for fragmented block header"
            );
        }
    }

    /// Appends packet data to the block in progress.
    fn continue_block(&mut self, stream: StreamId, block_ptr: usize, data: &[u8]) {
        let psd = &mut self.streams[stream.index()];
        let mut rest = psd.block_len - psd.recv_len;
        if rest > TTX_PAYLOAD_BYTES - 1 {
            rest = TTX_PAYLOAD_BYTES - 1;
        }
        if block_ptr - 1 >= rest {
            psd.block_buf
                .extend_from_slice(&data[BP_OFFSET..BP_OFFSET + rest]);
            psd.recv_len += rest;
            if psd.recv_len >= psd.block_len {
                self.check_block(stream);
                self.streams[stream.index()].have_block = false;
            }
        } else {
            debug!(
                have = block_ptr - 1,
                need = rest,
                "too few data before next block start - discard block"
            );
            psd.have_block = false;
        }
    }

    /// Starts a new block at a BS marker inside the packet. Returns
    /// the payload offset behind the consumed data, or None on a
    /// header decoding error.
    fn start_block(&mut self, stream: StreamId, block_ptr: usize, data: &[u8]) -> Option<usize> {
        let head: [u8; 4] = data[block_ptr + 1..block_ptr + 5].try_into().unwrap();
        let Some((app_id, block_len)) = decode_block_header(&head) else {
            debug!("structure header hamming error - skipping block");
            self.streams[stream.index()].drop_partial();
            return None;
        };

        let psd = &mut self.streams[stream.index()];
        psd.app_id = app_id;
        psd.block_len = block_len;
        psd.have_block = true;

        let mut rest = TTX_PAYLOAD_BYTES - (block_ptr + 1);
        if rest > block_len {
            rest = block_len;
        }
        psd.block_buf.clear();
        psd.block_buf
            .extend_from_slice(&data[block_ptr + 1..block_ptr + 1 + rest]);
        psd.recv_len = rest;
        let mut next_ptr = block_ptr + 1 + rest;

        if stream == StreamId::Stream1 && app_id != 0 {
            self.aifrag.block_start(head, &data[block_ptr + 5..]);
        }

        let psd = &mut self.streams[stream.index()];
        if psd.recv_len >= psd.block_len {
            self.check_block(stream);
            let psd = &mut self.streams[stream.index()];
            psd.have_block = false;
            psd.have_header = 0;
            // skip filler bytes up to the next block start
            while next_ptr < TTX_PAYLOAD_BYTES && unham84(data[next_ptr]) == Some(0x03) {
                next_ptr += 1;
            }
        }
        Some(next_ptr)
    }

    /// Validates the assembled raw block and converts it into a
    /// decoded image on the scratch queue.
    fn check_block(&mut self, stream: StreamId) {
        let psd = &mut self.streams[stream.index()];
        let raw = &psd.block_buf[..psd.block_len.min(psd.block_buf.len())];

        if psd.app_id == 0 {
            // Bundle Inventory: the whole block is Hamming coded
            let Some(mut image) = unham84_vec(raw) else {
                debug!("BI block hamming error");
                return;
            };
            if image.len() < 5 {
                return;
            }
            let chksum = image[2];
            image[2] = 0;
            let computed = compute_checksum(&image);
            if chksum != computed {
                debug!(chksum, computed, "BI block checksum error");
                return;
            }
            image[2] = chksum;
            let ctrl_len = image.len().saturating_sub(2);
            self.push_block(RawBlock {
                btype: BlockType::Bi,
                stream,
                version: self.ai_version[stream.index()],
                ctrl_len,
                parity_errors: 0,
                image,
            });
        } else if psd.app_id == self.app_id {
            let (Some(c1), Some(c2), Some(c3), Some(c4)) = (
                raw.get(6).copied().and_then(unham84),
                raw.get(7).copied().and_then(unham84),
                raw.get(8).copied().and_then(unham84),
                raw.get(9).copied().and_then(unham84),
            ) else {
                debug!("block header hamming error");
                return;
            };
            let ctrl_len = (((c3 & 3) as usize) << 8) | ((c2 as usize) << 4) | c1 as usize;
            let type_code = (c3 >> 2) | (c4 << 2);

            if psd.block_len < (ctrl_len + 2) * 2 {
                debug!(block = psd.block_len, ctrl = ctrl_len, "block ctrl length error");
                return;
            }
            let Some(mut image) = unham84_vec(&raw[..(ctrl_len + 2) * 2]) else {
                debug!("block content hamming error");
                return;
            };

            let chksum = image[2];
            image[2] = 0;
            let computed = compute_checksum(&image);
            if chksum != computed {
                debug!(chksum, computed, "block checksum error");
                return;
            }
            image[2] = chksum;

            let text_raw = &raw[(ctrl_len + 2) * 2..psd.block_len];
            let mut text = vec![0u8; text_raw.len()];
            let parity_errors = nxtv_ttx::hamming::parity_strip_buf(text_raw, &mut text);
            image.extend_from_slice(&text);

            self.push_block(RawBlock {
                btype: BlockType::from_code(type_code),
                stream,
                version: self.ai_version[stream.index()],
                ctrl_len,
                parity_errors,
                image,
            });
        } else {
            debug!(app_id = psd.app_id, "unknown application id");
        }
    }

    fn push_block(&mut self, block: RawBlock) {
        if !block.btype.is_epg() {
            trace!(?block.btype, "dropping non-EPG block type");
            return;
        }
        if self.enable_all || matches!(block.btype, BlockType::Bi | BlockType::Ai) {
            self.scratch.push_back(block);
        }
    }
}

/// Decodes the 4-byte block header: 5-bit app-id and 11-bit block
/// length (the length field itself counts as 4 more bytes).
fn decode_block_header(head: &[u8; 4]) -> Option<(u16, usize)> {
    let c1 = unham84(head[0])?;
    let c2 = unham84(head[1])?;
    let c3 = unham84(head[2])?;
    let c4 = unham84(head[3])?;
    let app_id = (c1 as u16) | (((c2 & 1) as u16) << 4);
    let block_len = (((c2 >> 1) as usize) | ((c3 as usize) << 3) | ((c4 as usize) << 7)) + 4;
    if block_len > BLOCK_BUF_MAX {
        return None;
    }
    Some((app_id, block_len))
}
