//! PI timescale queue.
//!
//! Buffers coverage information about acquired programmes for an
//! external observer (the timescale popup of a GUI, or a network
//! client): one element per programme interval with minute resolution,
//! base-time normalized offsets, and adjacency merging so contiguous
//! acquisition runs collapse into single elements. Buffers are pushed
//! newest-first; readers pop oldest-first from the tail.

use std::collections::VecDeque;

use bitflags::bitflags;
use tracing::debug;

use nxtv_stream::block::StreamId;
use nxtv_stream::records::Pi;
use nxtv_ttx::packet::Cni;

use crate::db::{block_count, block_index, EpgDb};

bitflags! {
    /// Properties of one timescale element.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TscFlags: u8 {
        const CUR_VERSION = 1 << 0;
        const STREAM_1 = 1 << 1;
        const EXPIRED = 1 << 2;
        const MISSING = 1 << 3;
        const DEFECTIVE = 1 << 4;
        const LAST = 1 << 5;
        const HAS_SHORT_INFO = 1 << 6;
        const HAS_LONG_INFO = 1 << 7;
    }
}

/// Buffer contents: a full snapshot at provider switch or later
/// incremental additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TscMode {
    Initial,
    Incremental,
}

/// Elements per buffer; snapshots use larger buffers than the steady
/// trickle of incremental updates.
fn buffer_capacity(mode: TscMode) -> usize {
    match mode {
        TscMode::Initial => 2048,
        TscMode::Incremental => 128,
    }
}

/// One coverage element; start time is `base_time` of the owning
/// buffer plus the offset in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TscElem {
    pub netwop: u8,
    pub start_off_mins: u32,
    pub duration_mins: u32,
    pub flags: TscFlags,
    /// Block index relative to the AI start number, saturated at 255.
    pub block_idx: u8,
    /// Number of programmes merged into this element.
    pub concat_count: u8,
}

/// A fixed-capacity run of elements with one provider and mode.
#[derive(Debug, Clone)]
pub struct TscBuffer {
    pub prov_cni: Cni,
    pub mode: TscMode,
    /// Locked buffers are in transit to a consumer and must not be
    /// popped until the matching AI was processed.
    pub locked: bool,
    pub base_time: i64,
    pop_idx: usize,
    elems: Vec<TscElem>,
}

impl TscBuffer {
    fn new(prov_cni: Cni, mode: TscMode, base_time: i64) -> Self {
        Self {
            prov_cni,
            mode,
            locked: false,
            base_time,
            pop_idx: 0,
            elems: Vec::new(),
        }
    }

    pub fn fill_count(&self) -> usize {
        self.elems.len()
    }

    pub fn elems(&self) -> &[TscElem] {
        &self.elems
    }

    fn is_drained(&self) -> bool {
        self.pop_idx >= self.elems.len()
    }
}

/// Queue of timescale buffers, newest at the front.
pub struct TimescaleQueue {
    bufs: VecDeque<TscBuffer>,
    write_prov_cni: Cni,
    write_mode: TscMode,
    read_prov_cni: Cni,
}

impl Default for TimescaleQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimescaleQueue {
    pub fn new() -> Self {
        Self {
            bufs: VecDeque::new(),
            write_prov_cni: Cni(0),
            write_mode: TscMode::Incremental,
            read_prov_cni: Cni(0),
        }
    }

    /// Selects the provider whose data subsequent pops return.
    pub fn set_prov_cni(&mut self, cni: Cni) {
        self.read_prov_cni = cni;
    }

    pub fn has_elems(&self) -> bool {
        !self.bufs.is_empty()
    }

    pub fn clear(&mut self) {
        self.bufs.clear();
    }

    /// Releases all locked buffers; called once the block queue (and
    /// with it a possibly new AI) has been processed, so timescale
    /// data never refers to a netwop table the reader has not seen.
    pub fn unlock_buffers(&mut self) {
        for buf in &mut self.bufs {
            buf.locked = false;
        }
    }

    /// Drops all unlocked buffers; used to discard data of the
    /// previous provider after a switch.
    pub fn clear_unprocessed(&mut self) {
        self.bufs.retain(|b| b.locked);
    }

    /// True while only incremental data of the read provider is
    /// queued.
    pub fn is_incremental(&self) -> bool {
        self.bufs
            .iter()
            .filter(|b| !b.locked && b.prov_cni == self.read_prov_cni)
            .all(|b| b.mode == TscMode::Incremental)
    }

    /// Takes the oldest buffer off the queue (for transmission to a
    /// network client). Empty buffers are discarded.
    pub fn pop_buffer(&mut self) -> Option<TscBuffer> {
        while let Some(buf) = self.bufs.pop_back() {
            if buf.fill_count() > 0 {
                return Some(buf);
            }
        }
        None
    }

    /// Inserts a received buffer at the head, locked, purging older
    /// incremental data of the same provider when a snapshot arrives.
    pub fn push_buffer(&mut self, mut buf: TscBuffer) -> bool {
        if buf.fill_count() > buffer_capacity(buf.mode) {
            debug!(count = buf.fill_count(), "oversized timescale buffer rejected");
            return false;
        }
        buf.pop_idx = 0;
        buf.locked = true;
        let purge = buf.mode == TscMode::Initial;
        let cni = buf.prov_cni;
        self.bufs.push_front(buf);
        if purge {
            self.bufs
                .retain(|b| {
                    b.locked || b.prov_cni != cni || b.mode != TscMode::Incremental
                });
        }
        true
    }

    /// Pops the oldest element of the read provider, returning it with
    /// the base time needed to decode its offsets. Drained buffers are
    /// freed on the way.
    pub fn pop_elem(&mut self) -> Option<(TscElem, i64)> {
        loop {
            let idx = self.bufs.len().checked_sub(1)?;
            // walk from the tail towards the head
            let mut pos = idx;
            loop {
                let buf = &self.bufs[pos];
                if buf.is_drained() {
                    self.bufs.remove(pos);
                    break; // restart from the (new) tail
                }
                if !buf.locked && buf.prov_cni == self.read_prov_cni {
                    let buf = &mut self.bufs[pos];
                    let elem = buf.elems[buf.pop_idx];
                    buf.pop_idx += 1;
                    return Some((elem, buf.base_time));
                }
                if pos == 0 {
                    return None;
                }
                pos -= 1;
            }
        }
    }

    /// Most recently appended element of the given provider.
    pub fn peek_tail(&self, prov_cni: Cni) -> Option<&TscElem> {
        self.bufs
            .iter()
            .find(|b| !b.locked && b.prov_cni == prov_cni)
            .and_then(|b| b.elems.last())
    }

    // ------------------------------------------------------------------
    // producer side

    /// Appends one coverage interval, merging with the previous
    /// element when it continues seamlessly with identical properties.
    fn append(
        &mut self,
        start_time: i64,
        stop_time: i64,
        netwop: u8,
        flags: TscFlags,
        block_idx: u32,
    ) {
        let needs_new = match self.bufs.front() {
            Some(buf) => buf.prov_cni != self.write_prov_cni || buf.mode != self.write_mode,
            None => true,
        };
        if needs_new {
            self.create_buffer();
        }

        let buf = self.bufs.front_mut().expect("buffer just ensured");
        if buf.base_time == 0 {
            // first element: set a base comfortably before all starts
            buf.base_time = start_time - 10 * 24 * 60 * 60;
        }

        // merge with the previous element if this one continues it
        if let Some(prev) = buf.elems.last_mut() {
            let prev_end =
                buf.base_time + 60 * (prev.start_off_mins as i64 + prev.duration_mins as i64);
            if start_time == prev_end
                && netwop == prev.netwop
                && (flags & !TscFlags::LAST) == (prev.flags & !TscFlags::LAST)
            {
                prev.duration_mins += ((stop_time - start_time) / 60) as u32;
                prev.flags |= flags & TscFlags::LAST;
                prev.concat_count = prev.concat_count.saturating_add(1);
                return;
            }
        }

        if buf.elems.len() >= buffer_capacity(buf.mode) {
            self.create_buffer();
        }

        let buf = self.bufs.front_mut().expect("buffer just ensured");
        if start_time < buf.base_time {
            adjust_base_time(buf, start_time);
        }
        let elem = TscElem {
            netwop,
            start_off_mins: ((start_time - buf.base_time) / 60) as u32,
            duration_mins: ((stop_time - start_time) / 60) as u32,
            flags,
            block_idx: block_idx.min(0xFF) as u8,
            concat_count: 1,
        };
        buf.elems.push(elem);
    }

    fn create_buffer(&mut self) {
        // inherit the base time of the newest same-provider buffer so
        // offsets stay comparable
        let base_time = self
            .bufs
            .front()
            .filter(|b| b.prov_cni == self.write_prov_cni)
            .map(|b| b.base_time)
            .unwrap_or(0);
        self.bufs
            .push_front(TscBuffer::new(self.write_prov_cni, self.write_mode, base_time));
    }

    /// Adds the coverage of one freshly inserted programme. The
    /// element flags are derived against the database (defective when
    /// an obsolete block overlaps, expired, last-of-network, info
    /// presence).
    pub fn add_pi(&mut self, db: &EpgDb, pi: &Pi, stream: StreamId, now: i64) {
        db.lock();
        if let Some(ai) = db.get_ai() {
            if let Some(ai_netwop) = ai.netwop(pi.netwop_no) {
                self.write_prov_cni = db.cni();
                self.write_mode = TscMode::Incremental;

                let block_idx = block_index(ai_netwop.start_no, pi.block_no);
                let mut flags = TscFlags::CUR_VERSION;
                if pi.block_no == ai_netwop.stop_no_swo {
                    flags |= TscFlags::LAST;
                }
                if db
                    .search_obsolete_pi(pi.netwop_no, pi.start_time, pi.stop_time)
                    .is_some()
                {
                    flags |= TscFlags::DEFECTIVE;
                }
                if pi.stop_time < now {
                    flags |= TscFlags::EXPIRED;
                }
                if stream == StreamId::Stream1 {
                    flags |= TscFlags::STREAM_1;
                }
                if pi.has_short_info() {
                    flags |= TscFlags::HAS_SHORT_INFO;
                }
                if pi.has_long_info() {
                    flags |= TscFlags::HAS_LONG_INFO;
                }

                self.append(pi.start_time, pi.stop_time, pi.netwop_no, flags, block_idx);
            }
        }
        db.unlock();
    }

    /// Pushes an Initial-mode snapshot of the whole database: per
    /// network the acquired coverage with explicit missing ranges for
    /// block-number gaps, then the obsolete blocks as defective
    /// coverage.
    pub fn add_all(&mut self, db: &EpgDb, now: i64) {
        db.lock();
        let Some(ai) = db.get_ai() else {
            db.unlock();
            return;
        };
        self.write_prov_cni = db.cni();
        self.write_mode = TscMode::Initial;

        let versions = [ai.version, ai.version_swo];
        let first_start = db.first_pi(None).map(|pi| pi.start_time);

        for netwop in 0..ai.netwop_count() {
            let ai_netwop = ai.netwop(netwop).expect("netwop in range");
            let mut last_block_no: Option<u16> = None;
            let mut last_stop_time = 0i64;

            for stored in db.pi_iter_net(netwop) {
                let pi = &stored.pi;
                let mut flags = TscFlags::empty();

                // blocks listed for stream 2 but received in stream 1
                // count as stream 1 to stay consistent with newly
                // received blocks
                let mut cur_stream = db.stream_by_block_no(netwop, pi.block_no);
                if stored.stream == StreamId::Stream1 {
                    cur_stream = StreamId::Stream1;
                }
                if stored.block_no_in_ai {
                    if cur_stream == StreamId::Stream1 {
                        if stored.version == versions[0] && stored.stream == cur_stream {
                            flags |= TscFlags::CUR_VERSION;
                        }
                        flags |= TscFlags::STREAM_1;
                    } else if stored.version == versions[1] && stored.stream == cur_stream {
                        flags |= TscFlags::CUR_VERSION;
                    }
                }
                if pi.stop_time < now {
                    flags |= TscFlags::EXPIRED;
                }
                if pi.has_short_info() {
                    flags |= TscFlags::HAS_SHORT_INFO;
                }
                if pi.has_long_info() {
                    flags |= TscFlags::HAS_LONG_INFO;
                }
                let block_idx = block_index(ai_netwop.start_no, pi.block_no);

                // flag gaps in the block number sequence as missing
                match last_block_no {
                    Some(last) => {
                        if pi.block_no != last.wrapping_add(1) {
                            self.append(
                                last_stop_time,
                                pi.start_time,
                                netwop,
                                TscFlags::MISSING,
                                0xFF,
                            );
                        }
                    }
                    None => {
                        if pi.block_no != ai_netwop.start_no {
                            if let Some(first) = first_start {
                                self.append(
                                    first,
                                    pi.start_time,
                                    netwop,
                                    TscFlags::MISSING,
                                    0xFF,
                                );
                            }
                        }
                    }
                }

                self.append(pi.start_time, pi.stop_time, netwop, flags, block_idx);
                last_block_no = Some(pi.block_no);
                last_stop_time = pi.stop_time;
            }

            // estimate the still-missing range at the end
            match last_block_no {
                Some(last) => {
                    if last != ai_netwop.stop_no_swo {
                        let mut max_time =
                            db.ai_update_time() + ai_netwop.day_count as i64 * 86_400;
                        if max_time <= last_stop_time {
                            max_time = last_stop_time + 3600;
                        }
                        self.append(last_stop_time, max_time, netwop, TscFlags::MISSING, 0xFF);
                    }
                }
                None => {
                    let announced = block_count(ai_netwop.start_no, ai_netwop.stop_no_swo);
                    if announced > 0 {
                        let begin = first_start.unwrap_or(now);
                        let max_time =
                            db.ai_update_time() + ai_netwop.day_count as i64 * 86_400;
                        if begin < max_time {
                            self.append(begin, max_time, netwop, TscFlags::MISSING, 0xFF);
                        }
                    }
                }
            }
        }

        // the obsolete blocks show up as defective coverage
        let obsolete: Vec<(i64, i64, u8, TscFlags, u32)> = db
            .obsolete_iter()
            .map(|stored| {
                let pi = &stored.pi;
                let mut flags = TscFlags::DEFECTIVE;
                let block_idx = ai
                    .netwop(pi.netwop_no)
                    .map(|n| {
                        if pi.block_no == n.stop_no_swo {
                            flags |= TscFlags::LAST;
                        }
                        block_index(n.start_no, pi.block_no)
                    })
                    .unwrap_or(0xFF);
                if pi.has_short_info() {
                    flags |= TscFlags::HAS_SHORT_INFO;
                }
                if pi.has_long_info() {
                    flags |= TscFlags::HAS_LONG_INFO;
                }
                (pi.start_time, pi.stop_time, pi.netwop_no, flags, block_idx)
            })
            .collect();
        db.unlock();

        for (start, stop, netwop, flags, block_idx) in obsolete {
            self.append(start, stop, netwop, flags, block_idx);
        }
    }
}

/// Rebases a buffer to an earlier start time, shifting every stored
/// offset; over-adjusts by one day to make repeated shifts unlikely.
fn adjust_base_time(buf: &mut TscBuffer, start_time: i64) {
    let diff = ((buf.base_time - start_time + 24 * 60 * 60) / 60) as u32;
    for elem in &mut buf.elems {
        elem.start_off_mins += diff;
    }
    debug!(count = buf.elems.len(), diff, "rebased timescale buffer");
    buf.base_time -= diff as i64 * 60;
}
