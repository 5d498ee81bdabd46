//! Transmission builders for tests.
//!
//! The receiver never encodes, but its tests need bit-exact
//! transmissions to chew on: these helpers build decoded block images
//! (including checksums), encode them into the Hamming/parity wire
//! form and packetize whole blocks into teletext pages the way a
//! provider would, filler bytes and fragmented headers included.

use nxtv_ttx::hamming::{ham84, parity_encode};
use nxtv_ttx::packet::TTX_PAYLOAD_BYTES;

use crate::block::{compute_checksum, StreamId};
use crate::records::{Ai, Li, Mi, Ni, Oi, Pi, Ti};

/// A decoded block image plus the fields of its wire envelope.
#[derive(Debug, Clone)]
pub struct BlockImage {
    pub app_id: u16,
    pub ctrl_len: usize,
    pub image: Vec<u8>,
}

/// Assembles a decoded image from type-specific control fields and a
/// text section, filling in the length fields and the checksum.
pub fn finish_image(app_id: u16, type_code: u8, body: &[u8], text: &[u8]) -> BlockImage {
    let ctrl_len = body.len() + 3;
    let block_len = (ctrl_len + 2) * 2 + text.len();
    let len_field = block_len - 4;

    let mut image = Vec::with_capacity(ctrl_len + 2 + text.len());
    image.push(((app_id & 0x1F) as u8) | (((len_field & 0x07) as u8) << 5));
    image.push((len_field >> 3) as u8);
    image.push(0); // checksum, patched below
    image.push((ctrl_len & 0xFF) as u8);
    image.push((((ctrl_len >> 8) & 0x03) as u8) | (type_code << 2));
    image.extend_from_slice(body);

    let chksum = compute_checksum(&image);
    image[2] = chksum;
    image.extend_from_slice(text);

    BlockImage {
        app_id,
        ctrl_len,
        image,
    }
}

/// Encodes a decoded image into raw wire bytes: Hamming pairs for the
/// control section, odd parity for the text.
pub fn encode_wire(block: &BlockImage) -> Vec<u8> {
    let ctrl_end = block.ctrl_len + 2;
    let mut raw = Vec::with_capacity(ctrl_end * 2 + block.image.len() - ctrl_end);
    for &byte in &block.image[..ctrl_end] {
        raw.push(ham84(byte & 0x0F));
        raw.push(ham84(byte >> 4));
    }
    for &byte in &block.image[ctrl_end..] {
        raw.push(parity_encode(byte));
    }
    raw
}

pub fn bi_image(app_id: u16) -> BlockImage {
    finish_image(0, 0, &app_id.to_le_bytes(), &[])
}

pub fn ai_image(app_id: u16, ai: &Ai) -> BlockImage {
    // version counters straddle the byte boundary, see the AI decoder
    let mut body = vec![
        (ai.version & 0x0F) << 4,
        ((ai.version >> 4) & 0x03) | ((ai.version_swo & 0x3F) << 2),
        ai.netwop_count(),
        ai.this_netwop,
        ai.ni_count,
        ai.ni_count_swo,
        ai.oi_count,
        ai.oi_count_swo,
        ai.mi_count,
        ai.mi_count_swo,
        ai.service_name.len() as u8,
    ];
    let mut text = ai.service_name.as_bytes().to_vec();
    for netwop in &ai.netwops {
        body.extend_from_slice(&netwop.cni.0.to_le_bytes());
        body.extend_from_slice(&netwop.start_no.to_le_bytes());
        body.extend_from_slice(&netwop.stop_no.to_le_bytes());
        body.extend_from_slice(&netwop.stop_no_swo.to_le_bytes());
        body.push(netwop.lto as u8);
        body.push(netwop.day_count);
        body.push(netwop.alphabet);
        body.push(netwop.name.len() as u8);
        body.extend_from_slice(&netwop.add_info.to_le_bytes());
        text.extend_from_slice(netwop.name.as_bytes());
    }
    finish_image(app_id, 1, &body, &text)
}

pub fn pi_image(app_id: u16, pi: &Pi) -> BlockImage {
    let start_mjd = (pi.start_time.div_euclid(86_400) + 40_587) as u16;
    let start_mod = (pi.start_time.rem_euclid(86_400) / 60) as u16;
    let duration = ((pi.stop_time - pi.start_time) / 60) as u16;

    let mut body = Vec::new();
    body.extend_from_slice(&pi.block_no.to_le_bytes());
    body.push(pi.netwop_no);
    body.extend_from_slice(&start_mjd.to_le_bytes());
    body.extend_from_slice(&start_mod.to_le_bytes());
    body.extend_from_slice(&duration.to_le_bytes());
    body.push((pi.pil & 0xFF) as u8);
    body.push(((pi.pil >> 8) & 0xFF) as u8);
    body.push((((pi.pil >> 16) & 0x0F) as u8) | (((pi.feature_flags & 0x0F) as u8) << 4));
    body.push((pi.feature_flags >> 4) as u8);
    body.push((pi.parental_rating & 0x0F) | ((pi.editorial_rating & 0x07) << 4));
    body.push((pi.themes.len() as u8) | ((pi.sortcrits.len() as u8) << 4));
    body.push(pi.descriptors.len() as u8);
    body.extend_from_slice(&pi.themes);
    body.extend_from_slice(&pi.sortcrits);
    for desc in &pi.descriptors {
        body.push(desc.dtype);
        body.push(desc.id);
    }

    let title = pi.title().as_bytes();
    let short = pi.short_info().unwrap_or("").as_bytes();
    let long = pi.long_info().unwrap_or("").as_bytes();
    body.push(title.len() as u8);
    body.push(short.len() as u8);
    body.extend_from_slice(&(long.len() as u16).to_le_bytes());

    let mut text = Vec::new();
    text.extend_from_slice(title);
    text.extend_from_slice(short);
    text.extend_from_slice(long);

    finish_image(app_id, 2, &body, &text)
}

pub fn ni_image(app_id: u16, ni: &Ni) -> BlockImage {
    let mut body = Vec::new();
    body.extend_from_slice(&ni.block_no.to_le_bytes());
    body.push(ni.header.len() as u8);
    body.push(ni.msg_size);
    body.push(ni.msg_attrib);
    body.push(ni.descriptors.len() as u8);
    body.push(ni.events.len() as u8);
    let mut text = ni.header.as_bytes().to_vec();
    for ev in &ni.events {
        body.extend_from_slice(&ev.next_id.to_le_bytes());
        body.push((ev.attribs.len() as u8) | if ev.next_is_ni { 0x80 } else { 0 });
        body.push(ev.ev_str.len() as u8);
        for &(kind, data) in &ev.attribs {
            body.push(kind);
            body.extend_from_slice(&data.to_le_bytes());
        }
        text.extend_from_slice(ev.ev_str.as_bytes());
    }
    for desc in &ni.descriptors {
        body.push(desc.dtype);
        body.push(desc.id);
    }
    finish_image(app_id, 3, &body, &text)
}

pub fn oi_image(app_id: u16, oi: &Oi) -> BlockImage {
    let mut body = Vec::new();
    body.extend_from_slice(&oi.block_no.to_le_bytes());
    body.push(oi.header_size);
    body.push(oi.msg_size);
    body.push(oi.msg_attrib);
    body.push(oi.descriptors.len() as u8);
    body.push(oi.header.len() as u8);
    body.extend_from_slice(&(oi.message.len() as u16).to_le_bytes());
    for desc in &oi.descriptors {
        body.push(desc.dtype);
        body.push(desc.id);
    }
    let mut text = oi.header.as_bytes().to_vec();
    text.extend_from_slice(oi.message.as_bytes());
    finish_image(app_id, 4, &body, &text)
}

pub fn mi_image(app_id: u16, mi: &Mi) -> BlockImage {
    let mut body = Vec::new();
    body.extend_from_slice(&mi.block_no.to_le_bytes());
    body.push(mi.descriptors.len() as u8);
    body.extend_from_slice(&(mi.message.len() as u16).to_le_bytes());
    for desc in &mi.descriptors {
        body.push(desc.dtype);
        body.push(desc.id);
    }
    finish_image(app_id, 5, &body, mi.message.as_bytes())
}

pub fn li_image(app_id: u16, li: &Li) -> BlockImage {
    let mut body = Vec::new();
    body.extend_from_slice(&li.block_no.to_le_bytes());
    body.push(li.netwop_no);
    body.push(li.descs.len() as u8);
    let mut text = Vec::new();
    for desc in &li.descs {
        body.push(desc.id);
        body.push(desc.langs.len() as u8);
        for lang in &desc.langs {
            text.extend_from_slice(lang);
        }
    }
    finish_image(app_id, 6, &body, &text)
}

pub fn ti_image(app_id: u16, ti: &Ti) -> BlockImage {
    let mut body = Vec::new();
    body.extend_from_slice(&ti.block_no.to_le_bytes());
    body.push(ti.netwop_no);
    body.push(ti.descs.len() as u8);
    let mut text = Vec::new();
    for desc in &ti.descs {
        body.push(desc.id);
        body.push(desc.subtitles.len() as u8);
        for subt in &desc.subtitles {
            body.extend_from_slice(&subt.page.to_le_bytes());
            body.extend_from_slice(&subt.subpage.to_le_bytes());
            text.extend_from_slice(&subt.lang);
        }
    }
    finish_image(app_id, 7, &body, &text)
}

/// One teletext page of a synthesized transmission.
#[derive(Debug, Clone)]
pub struct TestPage {
    pub sub: u16,
    pub packets: Vec<(u8, [u8; TTX_PAYLOAD_BYTES])>,
}

/// Builds the page subcode for a stream, packet count and CI counter.
pub fn subcode(stream: StreamId, pkg_count: u8, ci: u8) -> u16 {
    let stream_nibble = match stream {
        StreamId::Stream1 => 0u16,
        StreamId::Stream2 => 1,
    };
    (((pkg_count as u16) & 0x18) << 9)
        | (((pkg_count as u16) & 0x07) << 4)
        | (stream_nibble << 8)
        | ((ci as u16) & 0x0F)
}

/// Packetizes raw block byte strings into teletext pages.
///
/// Every block is preceded by a block-start marker and aligned to a
/// block-pointer position with filler bytes, exactly as a provider
/// multiplexer does. `pkgs_per_page` bounds the data packets per page
/// (at most 25); the continuity counter starts at `start_ci`.
pub fn build_pages(
    raw_blocks: &[Vec<u8>],
    stream: StreamId,
    start_ci: u8,
    pkgs_per_page: u8,
) -> Vec<TestPage> {
    assert!(pkgs_per_page >= 1 && pkgs_per_page <= 25);

    // flatten into one data byte sequence, noting block start offsets
    let mut data = Vec::new();
    let mut starts = Vec::new();
    for raw in raw_blocks {
        while data.len() % 3 != 0 {
            data.push(ham84(0x03));
        }
        starts.push(data.len());
        data.push(ham84(0x0C));
        data.extend_from_slice(raw);
    }
    while data.len() % 39 != 0 {
        data.push(ham84(0x03));
    }

    // cut into packets of 39 data bytes with their block pointer
    let mut packets = Vec::new();
    for (pkt_idx, chunk) in data.chunks(39).enumerate() {
        let base = pkt_idx * 39;
        let bp = starts
            .iter()
            .find(|&&s| s >= base && s < base + 39)
            .map(|&s| ((s - base) / 3) as u8)
            .unwrap_or(0x0D);

        let mut payload = [0u8; TTX_PAYLOAD_BYTES];
        payload[0] = ham84(bp);
        payload[1..1 + chunk.len()].copy_from_slice(chunk);
        packets.push(payload);
    }

    // group packets into pages
    let mut pages = Vec::new();
    let mut ci = start_ci;
    for page_pkts in packets.chunks(pkgs_per_page as usize) {
        let pkg_count = page_pkts.len() as u8;
        pages.push(TestPage {
            sub: subcode(stream, pkg_count, ci),
            packets: page_pkts
                .iter()
                .enumerate()
                .map(|(i, p)| (i as u8 + 1, *p))
                .collect(),
        });
        ci = (ci + 1) & 0x0F;
    }
    pages
}
