//! VBI line bit slicer.
//!
//! Recovers teletext bytes from raw luma samples of one scan line:
//! adaptive threshold from a min/max window, framing lock on the first
//! 1-bit peak, then fixed-point stepping at the teletext bit rate. A
//! second variant recovers the VPS data line (bi-phase coded, lower bit
//! rate) which carries the station CNI.

/// Fixed-point shift for the sampling position.
pub const FPSHIFT: u32 = 16;

/// Teletext bit step: 35.468950 MHz sampling / 6.9375 Mbit/s, in 16.16
/// fixed point (`(35.468950 / 6.9375) * 65536 + 0.5`).
pub const VTSTEP: u64 = 335_062;

/// VPS bit step: 7.1 samples per bit in 16.16 fixed point
/// (`7.1 * 65536 + 0.5`).
pub const VPSSTEP: u64 = 465_306;

/// Samples per VBI line delivered by the capture source.
pub const VBI_LINE_SAMPLES: usize = 2048;

/// VBI lines per frame delivered by the capture source.
pub const VBI_LINES_PER_FRAME: usize = 16;

/// Number of packet bytes recovered from one teletext line (the two
/// magazine/packet address bytes plus 40 payload bytes).
pub const VT_PACKET_BYTES: usize = 42;

/// Samples one byte at teletext rate, LSB first.
///
/// The threshold offset is applied exactly like the reference
/// bit-slicers: `(sample + off)` truncated to a byte, bit 7 is the
/// recovered bit.
#[inline]
fn vt_scan(line: &[u8], spos: &mut u64, off: i32, step: u64) -> Option<u8> {
    let mut byte = 0u8;
    for j in (0..8u32).rev() {
        let sample = *line.get((*spos >> FPSHIFT) as usize)? as i32;
        byte |= ((sample + off) as u8 & 0x80) >> j;
        *spos += step;
    }
    Some(byte)
}

/// Computes the slicing threshold and the framing-lock position.
///
/// Automatic gain control over the window 120..450, then advance to the
/// first above-threshold sample (bounded at 350) and on to its local
/// peak.
fn agc_and_lock(line: &[u8]) -> Option<(i32, u64)> {
    if line.len() < 452 {
        return None;
    }
    let mut min = 255u8;
    let mut max = 0u8;
    for &s in &line[120..450] {
        min = min.min(s);
        max = max.max(s);
    }
    let thresh = (min as i32 + max as i32) / 2;
    let off = 128 - thresh;

    let mut p = 50usize;
    while (line[p] as i32) < thresh && p < 350 {
        p += 1;
    }
    while line[p + 1] >= line[p] && p < 350 {
        p += 1;
    }
    Some((off, (p as u64) << FPSHIFT))
}

/// Slices one teletext line into its 42 packet bytes.
///
/// The clock run-in and framing code must read `55 55 27`; the common
/// soft-sync failures `D5` (one 1-bit missed) and `75` (two missed) are
/// repaired by stepping the sampling position back. Anything else
/// discards the line silently.
pub fn slice_teletext(line: &[u8]) -> Option<[u8; VT_PACKET_BYTES]> {
    let (off, mut spos) = agc_and_lock(line)?;

    let b0 = vt_scan(line, &mut spos, off, VTSTEP)?;
    if b0 & 0xFE != 0x54 {
        return None;
    }

    let mut b1 = vt_scan(line, &mut spos, off, VTSTEP)?;
    if b1 == 0x75 {
        spos -= 2 * VTSTEP;
        b1 = 0xD5;
    }
    if b1 == 0xD5 {
        spos -= 2 * VTSTEP;
        b1 = 0x55;
    }
    if b1 != 0x55 {
        return None;
    }

    let b2 = vt_scan(line, &mut spos, off, VTSTEP)?;
    // 0xD8 shows up instead of 0x27 on some channels and decodes fine
    if b2 != 0x27 && b2 != 0xD8 {
        return None;
    }

    let mut data = [0u8; VT_PACKET_BYTES];
    for byte in data.iter_mut() {
        *byte = vt_scan(line, &mut spos, off, VTSTEP)?;
    }
    Some(data)
}

/// Slices the VPS data line (line 9) and extracts the CNI.
///
/// VPS run-in is `55 55`, start code `51 99`, then twelve bi-phase
/// coded bytes at double step; a bit cell whose two halves read equal
/// is a bit error and discards the line. CNI values of 0 or with all
/// twelve low bits set are rejected.
pub fn slice_vps(line: &[u8]) -> Option<u16> {
    let (off, mut dpos) = agc_and_lock(line)?;

    if vt_scan(line, &mut dpos, off, VPSSTEP)? != 0x55
        || vt_scan(line, &mut dpos, off, VPSSTEP)? != 0x55
        || vt_scan(line, &mut dpos, off, VPSSTEP)? != 0x51
        || vt_scan(line, &mut dpos, off, VPSSTEP)? != 0x99
    {
        return None;
    }

    let mut data = [0u8; 15];
    for byte in data.iter_mut().skip(3) {
        for j in 0..8u32 {
            let half0 = (*line.get((dpos >> FPSHIFT) as usize)? as i32 + off) as u8 & 0x80;
            let half1 =
                (*line.get(((dpos + VPSSTEP) >> FPSHIFT) as usize)? as i32 + off) as u8 & 0x80;
            if half0 == half1 {
                return None;
            }
            *byte |= half0 >> j;
            dpos += VPSSTEP * 2;
        }
    }

    let cni = (((data[13] & 0x03) as u16) << 10)
        | (((data[14] & 0xC0) as u16) << 2)
        | ((data[11] & 0xC0) as u16)
        | ((data[14] & 0x3F) as u16);
    if cni != 0 && (cni & 0x0FFF) != 0x0FFF {
        Some(cni)
    } else {
        None
    }
}
