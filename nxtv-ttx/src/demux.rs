//! Teletext packet demultiplexer (producer side).
//!
//! Runs on the capture thread: slices every VBI line of a frame,
//! decodes the packet address and routes packets into the acquisition
//! ring buffer. Only the configured EPG page is forwarded; Magazine
//! Inventory Pages (page digits 0xFD) and, during provider scan,
//! packet 8/30 are decoded in place and their results published through
//! the shared scalars.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::hamming::{unham84, unham84_pair, unham84_vec};
use crate::packet::{decode_address, decode_page_header, PageNo, TTX_PAYLOAD_BYTES};
use crate::ring::{RingSlot, RingWriter};
use crate::scan::SyntaxScanner;
use crate::slicer::{slice_teletext, slice_vps};

/// Service id marking an EPG service in a Magazine Inventory Page.
pub const MIP_EPG_ID: u8 = 0xE3;

/// Producer-side packet router.
pub struct TtxDemux {
    ring: RingWriter,
    scanner: SyntaxScanner,
    /// Set while the last header on the EPG magazine was the EPG page.
    epg_page_open: bool,
    /// Per-magazine flag: last header was a MIP page.
    mip_magazines: u8,
    /// Scan generation last observed in the shared state.
    scan_generation: u32,
}

impl TtxDemux {
    pub fn new(ring: RingWriter) -> Self {
        Self {
            ring,
            scanner: SyntaxScanner::new(),
            epg_page_open: false,
            mip_magazines: 0,
            scan_generation: 0,
        }
    }

    pub fn shared(&self) -> &crate::ring::SharedState {
        self.ring.shared()
    }

    /// Processes all lines of one captured frame.
    pub fn process_frame(&mut self, lines: &[impl AsRef<[u8]>]) {
        for (line_no, line) in lines.iter().enumerate() {
            self.process_line(line.as_ref(), line_no as u32);
        }
    }

    /// Slices and routes a single VBI line.
    pub fn process_line(&mut self, line: &[u8], line_no: u32) {
        if let Some(data) = slice_teletext(line) {
            self.decode_packet(&data);
        } else if line_no == 9 && self.shared().is_epg_scan.load(Ordering::Relaxed) {
            if let Some(cni) = slice_vps(line) {
                self.shared().vps_cni.store(cni, Ordering::Relaxed);
            }
        }
    }

    /// Decodes the address of a sliced line and forwards the packet.
    fn decode_packet(&mut self, data: &[u8; 42]) {
        let Some(addr) = decode_address(data) else {
            return;
        };
        let payload: &[u8; TTX_PAYLOAD_BYTES] = data[2..].try_into().unwrap();
        if addr.pkg == 0 {
            match decode_page_header(addr.magazine, payload) {
                Some((page, sub)) => {
                    self.add_packet(page, sub, 0, payload);
                }
                None => trace!("page number or subcode hamming error - skipping page"),
            }
        } else {
            self.add_packet(PageNo((addr.magazine as u16) << 8), 0, addr.pkg, payload);
        }
    }

    /// Routes one teletext packet; the core of the producer-side page
    /// filter. Returns true if the packet went into the ring.
    pub fn add_packet(
        &mut self,
        page: PageNo,
        sub: u16,
        pkg: u8,
        payload: &[u8; TTX_PAYLOAD_BYTES],
    ) -> bool {
        let shared = self.ring.shared();
        if !shared.is_enabled.load(Ordering::Relaxed) {
            return false;
        }
        shared.ttx_pkg_count.fetch_add(1, Ordering::Relaxed);
        let epg_page = PageNo(shared.epg_page_no.load(Ordering::Relaxed));
        let is_scan = shared.is_epg_scan.load(Ordering::Relaxed);
        if is_scan {
            let generation = shared.scan_generation.load(Ordering::Relaxed);
            if generation != self.scan_generation {
                self.scan_generation = generation;
                self.scanner.reset();
            }
        }
        let mut used = false;

        if pkg == 0 {
            if page == epg_page {
                self.epg_page_open = true;
                self.ring.push(RingSlot {
                    page,
                    sub,
                    pkg: 0,
                    data: *payload,
                });
                let shared = self.ring.shared();
                shared.epg_pkg_count.fetch_add(1, Ordering::Relaxed);
                shared.epg_page_count.fetch_add(1, Ordering::Relaxed);
                used = true;
            } else {
                if page.magazine() == epg_page.magazine() {
                    // another page on the EPG magazine closes the EPG page
                    self.epg_page_open = false;
                }
                if page.digits() == 0xFD {
                    self.mip_magazines |= 1 << page.magazine();
                } else {
                    self.mip_magazines &= !(1 << page.magazine());
                }
            }
            if is_scan {
                self.scanner.page_header(page, sub);
            }
        } else {
            if self.epg_page_open && page.magazine() == epg_page.magazine() && pkg < 26 {
                self.ring.push(RingSlot {
                    page: PageNo(0),
                    sub: 0,
                    pkg,
                    data: *payload,
                });
                self.ring
                    .shared()
                    .epg_pkg_count
                    .fetch_add(1, Ordering::Relaxed);
                used = true;
            } else if self.mip_magazines & (1 << page.magazine()) != 0 {
                self.mip_packet(page.magazine(), pkg, payload);
            } else if is_scan && pkg == 30 && page.magazine() == 0 {
                self.p830_cni(payload);
            }
            if is_scan && self.scanner.data_packet(page.magazine(), pkg, payload) {
                self.ring
                    .shared()
                    .data_page_count
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        used
    }

    /// Decodes a Magazine Inventory Page packet looking for an EPG
    /// service entry; the page number layout follows ETS 300 706
    /// chapter 11 (MIP).
    fn mip_packet(&self, magazine: u8, pkg: u8, payload: &[u8]) {
        let found = match pkg {
            6..=8 => (0..20).find_map(|i| {
                (unham84_pair(payload[i * 2], payload[i * 2 + 1])? == MIP_EPG_ID).then(|| {
                    0xA0 + (pkg as u16 - 6) * 0x20 + (i as u16 / 10) * 0x10 + (i as u16 % 10)
                })
            }),
            9..=13 => (0..18).find_map(|i| {
                (unham84_pair(payload[i * 2], payload[i * 2 + 1])? == MIP_EPG_ID)
                    .then(|| 0x0A + (pkg as u16 - 9) * 0x30 + (i as u16 / 6) * 0x10 + (i as u16 % 6))
            }),
            14 => (0..6).find_map(|i| {
                (unham84_pair(payload[i * 2], payload[i * 2 + 1])? == MIP_EPG_ID)
                    .then(|| 0xFA + i as u16)
            }),
            _ => None,
        };
        if let Some(digits) = found {
            let page = digits | ((magazine as u16) << 8);
            self.ring
                .shared()
                .mip_page_no
                .store(page, Ordering::Relaxed);
        }
    }

    /// Parses packet 8/30 format 1 (NI) and format 2 (PDC) for the
    /// station CNI during provider scan.
    fn p830_cni(&self, payload: &[u8]) {
        let Some(dc) = unham84(payload[0]) else {
            return;
        };
        let shared = self.ring.shared();
        if dc == 0 {
            // format 1: CNI in bytes 7/8, bit-reversed, not error protected
            let cni =
                ((payload[7].reverse_bits() as u16) << 8) | payload[8].reverse_bits() as u16;
            if cni != 0 && cni != 0xFFFF {
                if shared.ni_rep_count.load(Ordering::Relaxed) > 0
                    && shared.ni_cni.load(Ordering::Relaxed) != cni
                {
                    trace!(cni, "pkg 8/30/1 CNI changed - restarting repetition count");
                    shared.ni_rep_count.store(0, Ordering::Relaxed);
                }
                shared.ni_cni.store(cni, Ordering::Relaxed);
                shared.ni_rep_count.fetch_add(1, Ordering::Relaxed);
            }
        } else if dc == 4 {
            // format 2: PDC data, Hamming protected, in bytes 9..27
            if let Some(pdc) = unham84_vec(&payload[9..27]) {
                let cni = ((pdc[0] as u16 & 0x0F) << 12)
                    | ((pdc[6] as u16 & 0x03) << 10)
                    | ((pdc[7] as u16 & 0x0C) << 6)
                    | ((pdc[1] as u16 & 0x0C) << 4)
                    | ((pdc[7] as u16 & 0x03) << 4)
                    | (pdc[8] as u16 & 0x0F);
                if cni != 0 && cni != 0xFFFF {
                    shared.pdc_cni.store(cni, Ordering::Relaxed);
                }
            }
        }
    }
}
