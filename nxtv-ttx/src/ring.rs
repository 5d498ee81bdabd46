//! Acquisition ring buffer.
//!
//! A fixed-capacity single-producer / single-consumer queue of teletext
//! packets decoupling the real-time VBI thread from the EPG decoder
//! thread, plus the small set of shared scalars (counters, CNIs, page
//! configuration) that cross the same boundary.
//!
//! The two indices have single-writer semantics: the producer publishes
//! a slot with a release store on `writer_idx`, the consumer frees one
//! with a release store on `reader_idx`; each side acquire-loads the
//! other's index. The queue is full when advancing the writer would
//! collide with the reader; the incoming packet is then dropped and
//! counted.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::packet::{PageNo, TTX_PAYLOAD_BYTES};

/// Slot count of the acquisition ring buffer.
pub const RING_SIZE: usize = 512;

/// One teletext packet as it crosses the thread boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSlot {
    pub page: PageNo,
    pub sub: u16,
    pub pkg: u8,
    pub data: [u8; TTX_PAYLOAD_BYTES],
}

impl Default for RingSlot {
    fn default() -> Self {
        Self {
            page: PageNo(0),
            sub: 0,
            pkg: 0,
            data: [0; TTX_PAYLOAD_BYTES],
        }
    }
}

/// Scalars shared between producer and consumer besides the ring
/// itself. All fields are written by exactly one side.
#[derive(Debug, Default)]
pub struct SharedState {
    /// Consumer-side switch; the producer stops capturing when cleared.
    pub is_enabled: AtomicBool,
    /// Enables VPS/P830 CNI extraction and the syntax scanner.
    pub is_epg_scan: AtomicBool,
    /// Bumped by the consumer on every scan (re)start; the producer
    /// resets its syntax-scan state when it observes a new value.
    pub scan_generation: AtomicU32,
    /// Teletext page the producer forwards into the ring.
    pub epg_page_no: AtomicU16,
    /// EPG page number advertised by a Magazine Inventory Page, 0 if
    /// none seen.
    pub mip_page_no: AtomicU16,
    /// CNI from the VPS line, 0 if none seen.
    pub vps_cni: AtomicU16,
    /// CNI from packet 8/30 format 2 (PDC), 0 if none seen.
    pub pdc_cni: AtomicU16,
    /// CNI candidate from packet 8/30 format 1.
    pub ni_cni: AtomicU16,
    /// Agreeing repetitions of `ni_cni` (the value is unprotected on
    /// the wire and only trusted after repetition).
    pub ni_rep_count: AtomicU32,
    /// All teletext packets seen while enabled.
    pub ttx_pkg_count: AtomicU32,
    /// Packets forwarded into the ring.
    pub epg_pkg_count: AtomicU32,
    /// EPG page headers seen.
    pub epg_page_count: AtomicU32,
    /// Pages proven to carry EPG syntax during scan.
    pub data_page_count: AtomicU32,
    /// Packets dropped on ring overflow.
    pub overflow_count: AtomicU32,
}

struct VbiBuffer {
    slots: Box<[UnsafeCell<RingSlot>]>,
    writer_idx: AtomicUsize,
    reader_idx: AtomicUsize,
    shared: SharedState,
}

// Slot access is guarded by the index protocol above: the producer only
// writes slot `w` while `w` is unpublished, the consumer only reads
// slot `r` after acquiring the writer index past it.
unsafe impl Sync for VbiBuffer {}
unsafe impl Send for VbiBuffer {}

/// Producer handle; exactly one exists per buffer.
pub struct RingWriter {
    buf: Arc<VbiBuffer>,
}

/// Consumer handle; exactly one exists per buffer.
pub struct RingReader {
    buf: Arc<VbiBuffer>,
}

/// Creates a ring buffer and returns its two endpoint handles.
pub fn vbi_buffer() -> (RingWriter, RingReader) {
    let slots = (0..RING_SIZE)
        .map(|_| UnsafeCell::new(RingSlot::default()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let buf = Arc::new(VbiBuffer {
        slots,
        writer_idx: AtomicUsize::new(0),
        reader_idx: AtomicUsize::new(0),
        shared: SharedState::default(),
    });
    (
        RingWriter {
            buf: Arc::clone(&buf),
        },
        RingReader { buf },
    )
}

impl RingWriter {
    /// Appends one packet; returns false (and counts the overflow) when
    /// the ring is full.
    pub fn push(&mut self, slot: RingSlot) -> bool {
        let w = self.buf.writer_idx.load(Ordering::Relaxed);
        let r = self.buf.reader_idx.load(Ordering::Acquire);
        if r == (w + 1) % RING_SIZE {
            self.buf
                .shared
                .overflow_count
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // sole writer of this slot until the index below is published
        unsafe {
            *self.buf.slots[w].get() = slot;
        }
        self.buf
            .writer_idx
            .store((w + 1) % RING_SIZE, Ordering::Release);
        true
    }

    pub fn shared(&self) -> &SharedState {
        &self.buf.shared
    }
}

impl RingReader {
    /// Takes the oldest packet, if any.
    pub fn pop(&mut self) -> Option<RingSlot> {
        let r = self.buf.reader_idx.load(Ordering::Relaxed);
        let w = self.buf.writer_idx.load(Ordering::Acquire);
        if r == w {
            return None;
        }
        let slot = unsafe { *self.buf.slots[r].get() };
        self.buf
            .reader_idx
            .store((r + 1) % RING_SIZE, Ordering::Release);
        Some(slot)
    }

    /// True if a packet is waiting.
    pub fn has_packets(&self) -> bool {
        self.buf.reader_idx.load(Ordering::Relaxed) != self.buf.writer_idx.load(Ordering::Acquire)
    }

    /// Discards all buffered packets by advancing the reader index to
    /// the writer index (used on channel change; the writer index
    /// belongs to the producer and is never touched).
    pub fn clear(&mut self) {
        let w = self.buf.writer_idx.load(Ordering::Acquire);
        self.buf.reader_idx.store(w, Ordering::Release);
    }

    pub fn shared(&self) -> &SharedState {
        &self.buf.shared
    }
}
