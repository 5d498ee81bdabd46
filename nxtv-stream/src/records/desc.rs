//! Language and subtitle descriptor blocks.

use crate::block::RawBlock;
use crate::error::BlockError;

use super::Cursor;

/// One language descriptor: an id referenced by PI descriptor lists
/// and the audio languages it stands for (3-letter codes).
#[derive(Debug, Clone, PartialEq)]
pub struct LangDesc {
    pub id: u8,
    pub langs: Vec<[u8; 3]>,
}

/// Language Information for one network (block 0) or the providing
/// channel (block 0x8000).
#[derive(Debug, Clone, PartialEq)]
pub struct Li {
    pub block_no: u16,
    pub netwop_no: u8,
    pub descs: Vec<LangDesc>,
}

/// One subtitle page reference with its language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subtitle {
    pub page: u16,
    pub subpage: u16,
    pub lang: [u8; 3],
}

/// One subtitle descriptor: an id referenced by PI descriptor lists
/// and the teletext subtitle pages it stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtDesc {
    pub id: u8,
    pub subtitles: Vec<Subtitle>,
}

/// Subtitle Information for one network (block 0) or the providing
/// channel (block 0x8000).
#[derive(Debug, Clone, PartialEq)]
pub struct Ti {
    pub block_no: u16,
    pub netwop_no: u8,
    pub descs: Vec<SubtDesc>,
}

fn lang_code(bytes: &[u8]) -> [u8; 3] {
    [bytes[0] & 0x7F, bytes[1] & 0x7F, bytes[2] & 0x7F]
}

pub(super) fn decode_li(block: &RawBlock) -> Result<Li, BlockError> {
    let mut cur = Cursor::new(block.ctrl(), block.text());
    cur.skip(5)?;

    let block_no = cur.u16()?;
    let netwop_no = cur.u8()?;
    let desc_count = cur.u8()? as usize;

    let mut raw = Vec::with_capacity(desc_count);
    for _ in 0..desc_count {
        let id = cur.u8()?;
        let lang_count = cur.u8()? as usize;
        raw.push((id, lang_count));
    }

    let mut descs = Vec::with_capacity(raw.len());
    for (id, lang_count) in raw {
        let mut langs = Vec::with_capacity(lang_count);
        for _ in 0..lang_count {
            langs.push(lang_code(cur.text_bytes(3)?));
        }
        descs.push(LangDesc { id, langs });
    }

    Ok(Li {
        block_no,
        netwop_no,
        descs,
    })
}

pub(super) fn decode_ti(block: &RawBlock) -> Result<Ti, BlockError> {
    let mut cur = Cursor::new(block.ctrl(), block.text());
    cur.skip(5)?;

    let block_no = cur.u16()?;
    let netwop_no = cur.u8()?;
    let desc_count = cur.u8()? as usize;

    struct RawDesc {
        id: u8,
        pages: Vec<(u16, u16)>,
    }

    let mut raw = Vec::with_capacity(desc_count);
    for _ in 0..desc_count {
        let id = cur.u8()?;
        let subt_count = cur.u8()? as usize;
        let mut pages = Vec::with_capacity(subt_count);
        for _ in 0..subt_count {
            pages.push((cur.u16()?, cur.u16()?));
        }
        raw.push(RawDesc { id, pages });
    }

    let mut descs = Vec::with_capacity(raw.len());
    for desc in raw {
        let mut subtitles = Vec::with_capacity(desc.pages.len());
        for (page, subpage) in desc.pages {
            subtitles.push(Subtitle {
                page,
                subpage,
                lang: lang_code(cur.text_bytes(3)?),
            });
        }
        descs.push(SubtDesc {
            id: desc.id,
            subtitles,
        });
    }

    Ok(Ti {
        block_no,
        netwop_no,
        descs,
    })
}
