//! EPG page syntax scanner.
//!
//! During provider scan the demux feeds every packet through this
//! detector. Pages whose number fits the Nextview conventions
//! (`m.DF`, `m.dF`, `m.Fd` with `d` a decimal digit) are watched; a
//! page is proven to carry EPG syntax once enough of its packets show
//! a well-formed block pointer / block start / structure header.

use crate::hamming::unham84;
use crate::packet::PageNo;

/// Candidate page slots per magazine: `m.DF` plus `m.0F`..`m.9F` plus
/// `m.F0`..`m.F9`.
const PAGES_PER_MAG: usize = 21;
const PAGE_SLOTS: usize = PAGES_PER_MAG * 8;

/// Syntactically correct packets required to accept a page.
const OK_THRESHOLD: u8 = 16;

#[derive(Clone, Copy, Default)]
struct PageState {
    pkg_count: u8,
    last_pkg: u8,
    ok_count: u8,
}

/// Stateful syntax detector over all candidate EPG pages.
pub struct SyntaxScanner {
    pages: Box<[PageState; PAGE_SLOTS]>,
    /// Candidate slot addressed by the last header of each magazine,
    /// or none.
    last_mag_idx: [Option<usize>; 8],
}

impl Default for SyntaxScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntaxScanner {
    pub fn new() -> Self {
        Self {
            pages: Box::new([PageState::default(); PAGE_SLOTS]),
            last_mag_idx: [None; 8],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Records a page header; candidate pages arm the per-magazine
    /// packet watcher.
    pub fn page_header(&mut self, page: PageNo, sub: u16) {
        let mag = page.magazine() as usize;
        if (sub & 0xF00) >> 8 >= 2 {
            self.last_mag_idx[mag] = None;
            return;
        }
        let d1 = page.0 & 0x0F;
        let d2 = (page.0 >> 4) & 0x0F;
        let idx = if page.digits() == 0xDF {
            Some(0)
        } else if d1 == 0xF && d2 < 0xA {
            Some(1 + d2 as usize)
        } else if d2 == 0xF && d1 < 0xA {
            Some(11 + d1 as usize)
        } else {
            None
        };

        self.last_mag_idx[mag] = idx.map(|i| {
            let slot = i + mag * PAGES_PER_MAG;
            self.pages[slot].pkg_count = (((sub & 0x3000) >> 9) | ((sub & 0x70) >> 4)) as u8;
            self.pages[slot].last_pkg = 0;
            slot
        });
    }

    /// Checks one data packet of the last-announced candidate page.
    ///
    /// Returns true exactly once per page, when the packet quorum is
    /// reached.
    pub fn data_packet(&mut self, mag: u8, pkg: u8, payload: &[u8]) -> bool {
        let Some(slot) = self.last_mag_idx[(mag & 7) as usize] else {
            return false;
        };
        let psc = &mut self.pages[slot];
        if pkg <= psc.last_pkg {
            self.last_mag_idx[(mag & 7) as usize] = None;
            return false;
        }
        if pkg > psc.pkg_count {
            return false;
        }

        if let Some(bp) = unham84(payload[0]) {
            let ok = match bp {
                0..=0x0B => {
                    let off = 1 + 3 * bp as usize;
                    check_struct_header(&payload[off..], 5)
                }
                0x0C => {
                    // a block start this late leaves only a partial header
                    let off = 1 + 3 * bp as usize;
                    check_struct_header(&payload[off..], 3)
                }
                0x0D => true,
                _ => false,
            };
            if ok {
                psc.ok_count += 1;
                if psc.ok_count >= OK_THRESHOLD {
                    self.last_mag_idx[(mag & 7) as usize] = None;
                    return true;
                }
            }
        }
        false
    }
}

/// True if `n` leading bytes decode as a block start (BS nibble 0x0C)
/// followed by Hamming-valid header bytes.
fn check_struct_header(data: &[u8], n: usize) -> bool {
    if data.len() < n {
        return false;
    }
    match unham84(data[0]) {
        Some(0x0C) => data[1..n].iter().all(|&b| unham84(b).is_some()),
        _ => false,
    }
}
