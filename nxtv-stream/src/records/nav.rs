//! Navigation, OSD and message blocks.

use smallvec::SmallVec;

use crate::alphabet::AlphabetSet;
use crate::block::RawBlock;
use crate::error::BlockError;

use super::{Cursor, Descriptor};

/// Navigation attribute kinds carried by NI event units (the
/// EV_ATTRIB opcodes of ETS 300 707 chapter 11.12.4).
pub const EV_ATTRIB_REL_DATE: u8 = 0x00;
pub const EV_ATTRIB_PROGNO_START: u8 = 0x01;
pub const EV_ATTRIB_PROGNO_STOP: u8 = 0x02;
pub const EV_ATTRIB_NETWOP: u8 = 0x03;
pub const EV_ATTRIB_EDITORIAL: u8 = 0x04;
pub const EV_ATTRIB_PARENTAL: u8 = 0x05;
pub const EV_ATTRIB_START_TIME: u8 = 0x06;
pub const EV_ATTRIB_STOP_TIME: u8 = 0x07;
pub const EV_ATTRIB_FEATURES: u8 = 0x08;
pub const EV_ATTRIB_LANGUAGE: u8 = 0x09;
pub const EV_ATTRIB_SUBT_LANG: u8 = 0x0A;
/// First of eight theme class opcodes.
pub const EV_ATTRIB_THEME: u8 = 0x10;
/// First of eight sorting criterion class opcodes.
pub const EV_ATTRIB_SORTCRIT: u8 = 0x18;

/// One selectable event of a navigation menu: a link to the next menu
/// (NI) or result list (OI) plus the filter attributes it applies.
#[derive(Debug, Clone, PartialEq)]
pub struct NiEvent {
    /// Block number of the linked NI or OI.
    pub next_id: u16,
    /// True when the link leads to another NI menu.
    pub next_is_ni: bool,
    pub attribs: SmallVec<[(u8, u32); 4]>,
    pub ev_str: Box<str>,
}

/// Navigation Information: one menu of the provider's navigation tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Ni {
    pub block_no: u16,
    pub msg_size: u8,
    pub msg_attrib: u8,
    pub descriptors: SmallVec<[Descriptor; 4]>,
    pub header: Box<str>,
    pub events: Vec<NiEvent>,
}

/// OSD Information: header and message text for one result page.
#[derive(Debug, Clone, PartialEq)]
pub struct Oi {
    pub block_no: u16,
    pub header_size: u8,
    pub msg_size: u8,
    pub msg_attrib: u8,
    pub descriptors: SmallVec<[Descriptor; 4]>,
    pub header: Box<str>,
    pub message: Box<str>,
}

/// Message Information: free-text message from the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Mi {
    pub block_no: u16,
    pub descriptors: SmallVec<[Descriptor; 4]>,
    pub message: Box<str>,
}

fn read_descriptors(
    cur: &mut Cursor<'_>,
    count: usize,
) -> Result<SmallVec<[Descriptor; 4]>, BlockError> {
    let mut descriptors = SmallVec::new();
    for _ in 0..count {
        descriptors.push(Descriptor {
            dtype: cur.u8()?,
            id: cur.u8()?,
        });
    }
    Ok(descriptors)
}

pub(super) fn decode_ni(block: &RawBlock, alphabets: &AlphabetSet) -> Result<Ni, BlockError> {
    let mut cur = Cursor::new(block.ctrl(), block.text());
    cur.skip(5)?;

    let block_no = cur.u16()?;
    let header_len = cur.u8()? as usize;
    let msg_size = cur.u8()?;
    let msg_attrib = cur.u8()?;
    let desc_count = cur.u8()? as usize;
    let event_count = cur.u8()? as usize;

    struct RawEvent {
        next_id: u16,
        next_is_ni: bool,
        attribs: SmallVec<[(u8, u32); 4]>,
        evstr_len: usize,
    }

    let mut raw_events = Vec::with_capacity(event_count);
    for _ in 0..event_count {
        let next_id = cur.u16()?;
        let link = cur.u8()?;
        let evstr_len = cur.u8()? as usize;
        let mut attribs = SmallVec::new();
        for _ in 0..(link & 0x0F) {
            let kind = cur.u8()?;
            let data = u32::from_le_bytes([cur.u8()?, cur.u8()?, cur.u8()?, cur.u8()?]);
            attribs.push((kind, data));
        }
        raw_events.push(RawEvent {
            next_id,
            next_is_ni: link & 0x80 != 0,
            attribs,
            evstr_len,
        });
    }
    let descriptors = read_descriptors(&mut cur, desc_count)?;

    let header = alphabets.decode(cur.text_bytes(header_len)?, 0).into_boxed_str();
    let mut events = Vec::with_capacity(raw_events.len());
    for raw in raw_events {
        let ev_str = alphabets.decode(cur.text_bytes(raw.evstr_len)?, 0).into_boxed_str();
        events.push(NiEvent {
            next_id: raw.next_id,
            next_is_ni: raw.next_is_ni,
            attribs: raw.attribs,
            ev_str,
        });
    }

    Ok(Ni {
        block_no,
        msg_size,
        msg_attrib,
        descriptors,
        header,
        events,
    })
}

pub(super) fn decode_oi(block: &RawBlock, alphabets: &AlphabetSet) -> Result<Oi, BlockError> {
    let mut cur = Cursor::new(block.ctrl(), block.text());
    cur.skip(5)?;

    let block_no = cur.u16()?;
    let header_size = cur.u8()?;
    let msg_size = cur.u8()?;
    let msg_attrib = cur.u8()?;
    let desc_count = cur.u8()? as usize;
    let header_len = cur.u8()? as usize;
    let msg_len = cur.u16()? as usize;
    let descriptors = read_descriptors(&mut cur, desc_count)?;

    let header = alphabets.decode(cur.text_bytes(header_len)?, 0).into_boxed_str();
    let message = alphabets.decode(cur.text_bytes(msg_len)?, 0).into_boxed_str();

    Ok(Oi {
        block_no,
        header_size,
        msg_size,
        msg_attrib,
        descriptors,
        header,
        message,
    })
}

pub(super) fn decode_mi(block: &RawBlock, alphabets: &AlphabetSet) -> Result<Mi, BlockError> {
    let mut cur = Cursor::new(block.ctrl(), block.text());
    cur.skip(5)?;

    let block_no = cur.u16()?;
    let desc_count = cur.u8()? as usize;
    let msg_len = cur.u16()? as usize;
    let descriptors = read_descriptors(&mut cur, desc_count)?;

    let message = alphabets.decode(cur.text_bytes(msg_len)?, 0).into_boxed_str();

    Ok(Mi {
        block_no,
        descriptors,
        message,
    })
}
