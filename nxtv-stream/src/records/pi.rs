//! Programme Information block.

use smallvec::SmallVec;

use crate::alphabet::AlphabetSet;
use crate::block::RawBlock;
use crate::error::BlockError;

use super::{Cursor, Descriptor};

/// Modified Julian Date of the Unix epoch.
const MJD_UNIX_EPOCH: i64 = 40_587;

/// PIL value marking "no label".
pub const PIL_INVALID: u32 = 0xFFFFF;

/// Feature bits per ETS 300 707 chapter 11.3.2.
pub struct PiFeatures;

impl PiFeatures {
    /// Sound format: 0 mono, 1 two-channel, 2 stereo, 3 surround.
    pub const SOUND_MASK: u16 = 0x003;
    pub const WIDESCREEN: u16 = 0x004;
    pub const PAL_PLUS: u16 = 0x008;
    pub const DIGITAL: u16 = 0x010;
    pub const ENCRYPTED: u16 = 0x020;
    pub const LIVE: u16 = 0x040;
    pub const REPEAT: u16 = 0x080;
    pub const SUBTITLES: u16 = 0x100;
    /// All twelve defined feature bits.
    pub const ALL: u16 = 0xFFF;
}

/// One programme of one network. Times are Unix timestamps derived
/// from the MJD date and minute-of-day fields of the wire form; the
/// title and info strings share one arena allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Pi {
    pub block_no: u16,
    pub netwop_no: u8,
    pub start_time: i64,
    pub stop_time: i64,
    /// 20-bit VPS Programme Identification Label, `PIL_INVALID` if
    /// none.
    pub pil: u32,
    pub feature_flags: u16,
    /// 0 = not rated, else minimum age in units of 2 years.
    pub parental_rating: u8,
    /// 3-bit editorial rating, 0 = not rated.
    pub editorial_rating: u8,
    pub themes: SmallVec<[u8; 7]>,
    pub sortcrits: SmallVec<[u8; 8]>,
    pub descriptors: SmallVec<[Descriptor; 4]>,
    text: Box<str>,
    title_len: u16,
    short_len: u16,
    long_len: u16,
}

impl Pi {
    /// Builds a PI with the given identity and running time; strings
    /// and attributes are attached with the `with_*` methods.
    pub fn new(block_no: u16, netwop_no: u8, start_time: i64, stop_time: i64) -> Pi {
        Pi {
            block_no,
            netwop_no,
            start_time,
            stop_time,
            pil: PIL_INVALID,
            feature_flags: 0,
            parental_rating: 0,
            editorial_rating: 0,
            themes: SmallVec::new(),
            sortcrits: SmallVec::new(),
            descriptors: SmallVec::new(),
            text: Box::from(""),
            title_len: 0,
            short_len: 0,
            long_len: 0,
        }
    }

    pub fn with_title(mut self, title: &str) -> Pi {
        let (short, long) = (self.short_info().map(String::from), self.long_info().map(String::from));
        self.set_text(title, short.as_deref(), long.as_deref());
        self
    }

    pub fn with_short_info(mut self, short: &str) -> Pi {
        let (title, long) = (self.title().to_owned(), self.long_info().map(String::from));
        self.set_text(&title, Some(short), long.as_deref());
        self
    }

    pub fn with_long_info(mut self, long: &str) -> Pi {
        let (title, short) = (self.title().to_owned(), self.short_info().map(String::from));
        self.set_text(&title, short.as_deref(), Some(long));
        self
    }

    pub fn with_themes(mut self, themes: &[u8]) -> Pi {
        self.themes = SmallVec::from_slice(themes);
        self
    }

    pub fn with_sortcrits(mut self, sortcrits: &[u8]) -> Pi {
        self.sortcrits = SmallVec::from_slice(sortcrits);
        self
    }

    pub fn with_features(mut self, features: u16) -> Pi {
        self.feature_flags = features & PiFeatures::ALL;
        self
    }

    pub fn with_ratings(mut self, parental: u8, editorial: u8) -> Pi {
        self.parental_rating = parental;
        self.editorial_rating = editorial;
        self
    }

    pub fn with_descriptors(mut self, descriptors: &[Descriptor]) -> Pi {
        self.descriptors = SmallVec::from_slice(descriptors);
        self
    }

    fn set_text(&mut self, title: &str, short: Option<&str>, long: Option<&str>) {
        let mut arena = String::with_capacity(
            title.len() + short.map_or(0, str::len) + long.map_or(0, str::len),
        );
        arena.push_str(title);
        self.title_len = title.len() as u16;
        arena.push_str(short.unwrap_or(""));
        self.short_len = short.map_or(0, str::len) as u16;
        arena.push_str(long.unwrap_or(""));
        self.long_len = long.map_or(0, str::len) as u16;
        self.text = arena.into_boxed_str();
    }

    pub fn title(&self) -> &str {
        &self.text[..self.title_len as usize]
    }

    pub fn has_short_info(&self) -> bool {
        self.short_len != 0
    }

    pub fn short_info(&self) -> Option<&str> {
        let start = self.title_len as usize;
        (self.short_len != 0).then(|| &self.text[start..start + self.short_len as usize])
    }

    pub fn has_long_info(&self) -> bool {
        self.long_len != 0
    }

    pub fn long_info(&self) -> Option<&str> {
        let start = (self.title_len + self.short_len) as usize;
        (self.long_len != 0).then(|| &self.text[start..start + self.long_len as usize])
    }

    /// True if the programme's interval overlaps `[start, stop)`.
    pub fn overlaps(&self, start: i64, stop: i64) -> bool {
        self.start_time < stop && self.stop_time > start
    }
}

/// Decodes the PIL into `(day, month, hour, minute)` when it carries a
/// valid label.
pub fn decode_pil(pil: u32) -> Option<(u8, u8, u8, u8)> {
    let day = ((pil >> 15) & 0x1F) as u8;
    let month = ((pil >> 11) & 0x0F) as u8;
    let hour = ((pil >> 6) & 0x1F) as u8;
    let minute = (pil & 0x3F) as u8;
    (day > 0 && month > 0 && month <= 12 && hour < 24 && minute < 60)
        .then_some((day, month, hour, minute))
}

pub(super) fn decode_pi(block: &RawBlock, alphabets: &AlphabetSet) -> Result<Pi, BlockError> {
    let mut cur = Cursor::new(block.ctrl(), block.text());
    cur.skip(5)?;

    let block_no = cur.u16()?;
    let netwop_no = cur.u8()?;
    let start_mjd = cur.u16()? as i64;
    let start_mod = cur.u16()? as i64;
    let duration_mins = cur.u16()? as i64;

    let b14 = cur.u8()? as u32;
    let b15 = cur.u8()? as u32;
    let b16 = cur.u8()? as u32;
    let b17 = cur.u8()? as u32;
    let pil = b14 | (b15 << 8) | ((b16 & 0x0F) << 16);
    let feature_flags = (((b16 >> 4) | (b17 << 4)) & PiFeatures::ALL as u32) as u16;

    let ratings = cur.u8()?;
    let parental_rating = ratings & 0x0F;
    let editorial_rating = (ratings >> 4) & 0x07;

    let counts = cur.u8()?;
    let theme_count = (counts & 0x0F) as usize;
    let sortcrit_count = (counts >> 4) as usize;
    let desc_count = cur.u8()? as usize;

    let mut themes = SmallVec::new();
    for _ in 0..theme_count {
        themes.push(cur.u8()?);
    }
    let mut sortcrits = SmallVec::new();
    for _ in 0..sortcrit_count {
        sortcrits.push(cur.u8()?);
    }
    let mut descriptors = SmallVec::new();
    for _ in 0..desc_count {
        descriptors.push(Descriptor {
            dtype: cur.u8()?,
            id: cur.u8()?,
        });
    }

    let title_len = cur.u8()? as usize;
    let short_len = cur.u8()? as usize;
    let long_len = cur.u16()? as usize;

    let title = alphabets.decode(cur.text_bytes(title_len)?, netwop_no);
    let short = alphabets.decode(cur.text_bytes(short_len)?, netwop_no);
    let long = alphabets.decode(cur.text_bytes(long_len)?, netwop_no);

    let start_time = (start_mjd - MJD_UNIX_EPOCH) * 86_400 + start_mod * 60;
    let stop_time = start_time + duration_mins * 60;

    let mut pi = Pi::new(block_no, netwop_no, start_time, stop_time);
    pi.pil = pil;
    pi.feature_flags = feature_flags;
    pi.parental_rating = parental_rating;
    pi.editorial_rating = editorial_rating;
    pi.themes = themes;
    pi.sortcrits = sortcrits;
    pi.descriptors = descriptors;
    pi.set_text(
        &title,
        (!short.is_empty()).then_some(short.as_str()),
        (!long.is_empty()).then_some(long.as_str()),
    );
    Ok(pi)
}
