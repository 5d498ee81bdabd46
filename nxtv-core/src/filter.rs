//! Programme search filters.
//!
//! A filter context is a set of independently toggleable axes plus
//! their parameters; the match function is pure, so contexts can be
//! cloned and modified without affecting queries already in flight.
//! Theme and sorting-criterion filters follow the Nextview class
//! model: eight classes, logical AND across enabled classes, logical
//! OR within one class (ETS 300 707 chapter 11.12.4). The series
//! filter is ORed into the theme axis. A separate builder translates
//! NI navigation attribute stacks into a filter context, including the
//! deferred time-slot resolution rules.

use std::collections::HashSet;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, warn};

use nxtv_stream::records::{
    Pi, DESC_TYPE_LANGUAGE, DESC_TYPE_SUBTITLE, EV_ATTRIB_EDITORIAL, EV_ATTRIB_FEATURES,
    EV_ATTRIB_LANGUAGE, EV_ATTRIB_NETWOP, EV_ATTRIB_PARENTAL, EV_ATTRIB_PROGNO_START,
    EV_ATTRIB_PROGNO_STOP, EV_ATTRIB_REL_DATE, EV_ATTRIB_SORTCRIT, EV_ATTRIB_START_TIME,
    EV_ATTRIB_STOP_TIME, EV_ATTRIB_SUBT_LANG, EV_ATTRIB_THEME, MAX_NETWOPS,
};

use crate::db::EpgDb;

/// Number of feature flag/mask slots.
pub const FEATURE_CLASS_COUNT: usize = 8;

bitflags! {
    /// Enabled filter axes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FilterMask: u32 {
        const NETWOP = 1 << 0;
        const NETWOP_PRE = 1 << 1;
        const TIME_BEG = 1 << 2;
        const TIME_END = 1 << 3;
        const PAR_RAT = 1 << 4;
        const EDIT_RAT = 1 << 5;
        const PROG_IDX = 1 << 6;
        const FEATURES = 1 << 7;
        const THEMES = 1 << 8;
        const SERIES = 1 << 9;
        const SORTCRIT = 1 << 10;
        const LANGUAGES = 1 << 11;
        const SUBTITLES = 1 << 12;
        const SUBSTR_TITLE = 1 << 13;
        const SUBSTR_DESCR = 1 << 14;
        const EXPIRE_TIME = 1 << 15;
        const CUSTOM = 1 << 16;
    }
}

/// External predicate for the custom axis (e.g. a reminder list).
pub type CustomFilter = Arc<dyn Fn(&Pi) -> bool + Send + Sync>;

/// Collected time-slot fragments of one NI stack; resolved only by
/// [`FilterContext::finish_ni`] because the attributes depend on each
/// other.
#[derive(Debug, Clone, Copy, Default)]
pub struct NiFilterState {
    has_reldate: bool,
    has_start: bool,
    has_stop: bool,
    reldate: u32,
    start_mod: u32,
    stop_mod: u32,
}

#[derive(Clone)]
pub struct FilterContext {
    enabled: FilterMask,
    netwop: [bool; MAX_NETWOPS],
    netwop_pre: [bool; MAX_NETWOPS],
    time_begin: i64,
    time_end: i64,
    parental_rating: u8,
    editorial_rating: u8,
    first_prog_idx: u8,
    last_prog_idx: u8,
    feature_flags: [(u16, u16); FEATURE_CLASS_COUNT],
    feature_count: usize,
    /// Class bit set per theme code.
    themes: [u8; 256],
    used_theme_classes: u8,
    sortcrit: [u8; 256],
    used_sortcrit_classes: u8,
    /// Enabled (netwop, series code) pairs.
    series: HashSet<(u8, u8)>,
    /// Enabled LI descriptor ids per netwop, one bit each.
    lang_descr: Vec<u64>,
    subt_descr: Vec<u64>,
    substr: String,
    ignore_case: bool,
    expire_time: i64,
    custom: Option<CustomFilter>,
}

impl Default for FilterContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FilterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterContext")
            .field("enabled", &self.enabled)
            .field("substr", &self.substr)
            .finish()
    }
}

impl FilterContext {
    pub fn new() -> Self {
        Self {
            enabled: FilterMask::empty(),
            netwop: [false; MAX_NETWOPS],
            netwop_pre: [true; MAX_NETWOPS],
            time_begin: 0,
            time_end: 0,
            parental_rating: 0,
            editorial_rating: 0,
            first_prog_idx: 0,
            last_prog_idx: 0,
            feature_flags: [(0, 0); FEATURE_CLASS_COUNT],
            feature_count: 0,
            themes: [0; 256],
            used_theme_classes: 0,
            sortcrit: [0; 256],
            used_sortcrit_classes: 0,
            series: HashSet::new(),
            lang_descr: vec![0; MAX_NETWOPS],
            subt_descr: vec![0; MAX_NETWOPS],
            substr: String::new(),
            ignore_case: false,
            expire_time: 0,
            custom: None,
        }
    }

    // ------------------------------------------------------------------
    // axis configuration

    pub fn enable(&mut self, mask: FilterMask) {
        self.enabled |= mask;
    }

    /// Disables axes; theme, sorting-criterion and feature parameters
    /// are cleared along with their axis.
    pub fn disable(&mut self, mask: FilterMask) {
        if mask.contains(FilterMask::THEMES) {
            self.used_theme_classes = 0;
        }
        if mask.contains(FilterMask::SORTCRIT) {
            self.used_sortcrit_classes = 0;
        }
        if mask.contains(FilterMask::FEATURES) {
            self.feature_count = 0;
        }
        self.enabled &= !mask;
    }

    pub fn enabled(&self) -> FilterMask {
        self.enabled
    }

    pub fn init_netwop(&mut self) {
        self.netwop = [false; MAX_NETWOPS];
    }

    pub fn set_netwop(&mut self, netwop: u8) {
        match self.netwop.get_mut(netwop as usize) {
            Some(slot) => *slot = true,
            None => warn!(netwop, "netwop index out of range"),
        }
    }

    /// Resets the pre-filter to all networks enabled. Note the
    /// inverted semantics compared to the normal netwop filter: set
    /// disables.
    pub fn init_netwop_prefilter(&mut self) {
        self.netwop_pre = [true; MAX_NETWOPS];
    }

    pub fn set_netwop_prefilter(&mut self, netwop: u8) {
        match self.netwop_pre.get_mut(netwop as usize) {
            Some(slot) => *slot = false,
            None => warn!(netwop, "netwop index out of range"),
        }
    }

    pub fn set_time_begin(&mut self, time: i64) {
        self.time_begin = time;
    }

    pub fn set_time_end(&mut self, time: i64) {
        self.time_end = time;
    }

    /// Parental rating threshold 1..8; 1 matches any rated programme.
    pub fn set_parental_rating(&mut self, rating: u8) {
        if rating == 0 || rating > 8 {
            warn!(rating, "questionable parental rating threshold");
        }
        self.parental_rating = rating;
    }

    /// Editorial rating threshold 1..7.
    pub fn set_editorial_rating(&mut self, rating: u8) {
        if rating == 0 || rating >= 8 {
            warn!(rating, "questionable editorial rating threshold");
        }
        self.editorial_rating = rating;
    }

    pub fn set_prog_idx(&mut self, first: u8, last: u8) {
        debug_assert!(first <= last);
        self.first_prog_idx = first;
        self.last_prog_idx = last;
    }

    /// Installs one feature flag/mask pair; pairs are ORed during the
    /// match, the masked bits of one pair must all equal the flags.
    pub fn set_feature_flags(&mut self, index: usize, flags: u16, mask: u16) {
        if index < FEATURE_CLASS_COUNT {
            self.feature_flags[index] = (flags, mask);
        } else {
            warn!(index, "feature filter index out of range");
        }
    }

    pub fn set_feature_count(&mut self, count: usize) {
        self.feature_count = count.min(FEATURE_CLASS_COUNT);
    }

    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    /// Clears theme classes selected by the bit field; 0xFF clears
    /// all. Returns the still-used classes.
    pub fn init_themes(&mut self, class_mask: u8) -> u8 {
        if class_mask == 0xFF {
            self.themes = [0; 256];
            self.used_theme_classes = 0;
        } else {
            for slot in self.themes.iter_mut() {
                *slot &= !class_mask;
            }
            self.used_theme_classes &= !class_mask;
        }
        self.used_theme_classes
    }

    /// Assigns a theme code range to the classes in the bit field.
    pub fn set_themes(&mut self, first: u8, last: u8, class_mask: u8) {
        debug_assert!(class_mask != 0);
        debug_assert!(first <= last);
        for theme in first..=last {
            self.themes[theme as usize] |= class_mask;
        }
        self.used_theme_classes |= class_mask;
    }

    pub fn init_sortcrit(&mut self, class_mask: u8) -> u8 {
        if class_mask == 0xFF {
            self.sortcrit = [0; 256];
            self.used_sortcrit_classes = 0;
        } else {
            for slot in self.sortcrit.iter_mut() {
                *slot &= !class_mask;
            }
            self.used_sortcrit_classes &= !class_mask;
        }
        self.used_sortcrit_classes
    }

    pub fn set_sortcrit(&mut self, first: u8, last: u8, class_mask: u8) {
        debug_assert!(class_mask != 0);
        debug_assert!(first <= last);
        for crit in first..=last {
            self.sortcrit[crit as usize] |= class_mask;
        }
        self.used_sortcrit_classes |= class_mask;
    }

    pub fn init_series(&mut self) {
        self.series.clear();
    }

    /// Enables one series (theme codes above 0x80) on one network.
    pub fn set_series(&mut self, netwop: u8, series: u8, enable: bool) {
        if (netwop as usize) < MAX_NETWOPS && series > 0x80 {
            if enable {
                self.series.insert((netwop, series));
            } else {
                self.series.remove(&(netwop, series));
            }
        } else {
            warn!(netwop, series, "illegal series filter parameters");
        }
    }

    pub fn init_lang_descr(&mut self) {
        self.lang_descr = vec![0; MAX_NETWOPS];
    }

    /// Enables a language by 3-letter code: the LI blocks of every
    /// network are searched for descriptors carrying the language and
    /// their ids are added to the per-network bit fields. The
    /// database must be locked.
    pub fn set_lang_descr(&mut self, db: &EpgDb, code: [u8; 3]) {
        let Some(ai) = db.get_ai() else {
            return;
        };
        let this_netwop = ai.this_netwop;
        let count = ai.netwop_count();
        for netwop in 0..=count {
            let li = if netwop < count {
                db.get_li(0, netwop)
            } else {
                db.get_li(crate::db::THIS_CHANNEL_BLOCK, this_netwop)
            };
            let Some(li) = li else { continue };
            for desc in &li.descs {
                if desc.langs.iter().any(|l| *l == code) && desc.id < 64 {
                    let slot = if netwop < count { netwop } else { this_netwop };
                    self.lang_descr[slot as usize] |= 1 << desc.id;
                }
            }
        }
    }

    pub fn init_subt_descr(&mut self) {
        self.subt_descr = vec![0; MAX_NETWOPS];
    }

    /// Enables a subtitle language by 3-letter code, analogous to
    /// [`Self::set_lang_descr`].
    pub fn set_subt_descr(&mut self, db: &EpgDb, code: [u8; 3]) {
        let Some(ai) = db.get_ai() else {
            return;
        };
        let this_netwop = ai.this_netwop;
        let count = ai.netwop_count();
        for netwop in 0..=count {
            let ti = if netwop < count {
                db.get_ti(0, netwop)
            } else {
                db.get_ti(crate::db::THIS_CHANNEL_BLOCK, this_netwop)
            };
            let Some(ti) = ti else { continue };
            for desc in &ti.descs {
                if desc.subtitles.iter().any(|s| s.lang == code) && desc.id < 64 {
                    let slot = if netwop < count { netwop } else { this_netwop };
                    self.subt_descr[slot as usize] |= 1 << desc.id;
                }
            }
        }
    }

    /// Sets the substring for title/description search; with
    /// `ignore_case` the needle is casefolded once here and the
    /// haystack per match.
    pub fn set_substr(&mut self, needle: &str, ignore_case: bool) {
        self.ignore_case = ignore_case;
        self.substr = if ignore_case {
            needle.chars().map(fold_latin1).collect()
        } else {
            needle.to_owned()
        };
    }

    /// Sets the minimum stop time; evaluated before all expensive
    /// axes.
    pub fn set_expire_time(&mut self, time: i64) {
        self.expire_time = time;
    }

    pub fn set_custom(&mut self, custom: CustomFilter) {
        self.custom = Some(custom);
    }

    // ------------------------------------------------------------------
    // match

    /// Checks a programme against all enabled axes. Pure: identical
    /// inputs always produce identical results.
    pub fn matches(&self, db: &EpgDb, pi: &Pi) -> bool {
        let e = self.enabled;

        // cheap pre-filter first
        if e.contains(FilterMask::EXPIRE_TIME) && pi.stop_time < self.expire_time {
            return false;
        }

        if e.contains(FilterMask::NETWOP) {
            if !self.netwop.get(pi.netwop_no as usize).copied().unwrap_or(false) {
                return false;
            }
        } else if e.contains(FilterMask::NETWOP_PRE)
            && !self.netwop_pre.get(pi.netwop_no as usize).copied().unwrap_or(false)
        {
            // the pre-filter applies only while the netwop axis is
            // unused, so menus can still request excluded networks
            return false;
        }

        if e.contains(FilterMask::TIME_BEG) && pi.start_time < self.time_begin {
            return false;
        }
        if e.contains(FilterMask::TIME_END) && pi.start_time >= self.time_end {
            return false;
        }

        if e.contains(FilterMask::PAR_RAT)
            && (pi.parental_rating == 0 || pi.parental_rating > self.parental_rating)
        {
            return false;
        }
        if e.contains(FilterMask::EDIT_RAT) && pi.editorial_rating < self.editorial_rating {
            return false;
        }

        if e.contains(FilterMask::PROG_IDX) {
            match db.prog_idx(pi.block_no, pi.netwop_no) {
                Some(idx)
                    if idx >= self.first_prog_idx as u32 && idx <= self.last_prog_idx as u32 => {}
                _ => return false,
            }
        }

        if e.contains(FilterMask::FEATURES)
            && !self.feature_flags[..self.feature_count]
                .iter()
                .any(|&(flags, mask)| pi.feature_flags & mask == flags)
        {
            return false;
        }

        // series OR themes: a series hit replaces the theme check
        let mut skip_themes = false;
        if e.contains(FilterMask::SERIES) {
            let series_hit = pi
                .themes
                .iter()
                .any(|&t| t > 0x80 && self.series.contains(&(pi.netwop_no, t)));
            if series_hit {
                skip_themes = true;
            } else if !e.contains(FilterMask::THEMES) {
                return false;
            }
        }

        if e.contains(FilterMask::THEMES) && !skip_themes {
            for class in (0..8).map(|b| 1u8 << b) {
                if self.used_theme_classes & class == 0 {
                    continue;
                }
                let hit = pi.themes.iter().any(|&t| {
                    self.themes[t as usize] & class != 0
                        && (t < 0x80 || !e.contains(FilterMask::SERIES))
                });
                if !hit {
                    return false;
                }
            }
        }

        if e.contains(FilterMask::SORTCRIT) {
            for class in (0..8).map(|b| 1u8 << b) {
                if self.used_sortcrit_classes & class == 0 {
                    continue;
                }
                if !pi
                    .sortcrits
                    .iter()
                    .any(|&c| self.sortcrit[c as usize] & class != 0)
                {
                    return false;
                }
            }
        }

        if e.contains(FilterMask::LANGUAGES) {
            let field = self.lang_descr.get(pi.netwop_no as usize).copied().unwrap_or(0);
            if !pi
                .descriptors
                .iter()
                .any(|d| d.dtype == DESC_TYPE_LANGUAGE && d.id < 64 && field & (1 << d.id) != 0)
            {
                return false;
            }
        }
        if e.contains(FilterMask::SUBTITLES) {
            let field = self.subt_descr.get(pi.netwop_no as usize).copied().unwrap_or(0);
            if !pi
                .descriptors
                .iter()
                .any(|d| d.dtype == DESC_TYPE_SUBTITLE && d.id < 64 && field & (1 << d.id) != 0)
            {
                return false;
            }
        }

        let search_title = e.contains(FilterMask::SUBSTR_TITLE);
        let search_descr = e.contains(FilterMask::SUBSTR_DESCR);
        if search_title || search_descr {
            let mut hit = false;
            if search_title {
                hit = self.substr_match(pi.title());
            }
            if !hit && search_descr {
                hit = pi.short_info().is_some_and(|s| self.substr_match(s))
                    || pi.long_info().is_some_and(|s| self.substr_match(s));
            }
            if !hit {
                return false;
            }
        }

        if e.contains(FilterMask::CUSTOM) {
            if let Some(custom) = &self.custom {
                if !custom(pi) {
                    return false;
                }
            }
        }

        true
    }

    fn substr_match(&self, haystack: &str) -> bool {
        if self.ignore_case {
            let folded: String = haystack.chars().map(fold_latin1).collect();
            folded.contains(&self.substr)
        } else {
            haystack.contains(&self.substr)
        }
    }

    // ------------------------------------------------------------------
    // NI stack translation

    /// Resets the context and time-slot state for NI stack processing.
    pub fn init_ni(&mut self, state: &mut NiFilterState) {
        *state = NiFilterState::default();
        self.enabled = FilterMask::empty();
    }

    /// Applies one navigation attribute. Time attributes only collect
    /// into `state`; they are interdependent and resolved in
    /// [`Self::finish_ni`].
    pub fn apply_ni(&mut self, db: &EpgDb, state: &mut NiFilterState, kind: u8, data: u32) {
        match kind {
            EV_ATTRIB_PROGNO_START => {
                if !self.enabled.contains(FilterMask::PROG_IDX) {
                    self.last_prog_idx = (data & 0xFF) as u8;
                }
                self.first_prog_idx = (data & 0xFF) as u8;
                self.enabled |= FilterMask::PROG_IDX;
            }
            EV_ATTRIB_PROGNO_STOP => {
                if !self.enabled.contains(FilterMask::PROG_IDX) {
                    self.first_prog_idx = 0;
                }
                self.last_prog_idx = (data & 0xFF) as u8;
                self.enabled |= FilterMask::PROG_IDX;
            }
            EV_ATTRIB_NETWOP => {
                if !self.enabled.contains(FilterMask::NETWOP) {
                    self.init_netwop();
                }
                self.set_netwop((data & 0xFF) as u8);
                self.enabled |= FilterMask::NETWOP;
            }
            EV_ATTRIB_EDITORIAL => {
                self.editorial_rating = (data & 0xFF) as u8;
                self.enabled |= FilterMask::EDIT_RAT;
            }
            EV_ATTRIB_PARENTAL => {
                self.parental_rating = (data & 0xFF) as u8;
                self.enabled |= FilterMask::PAR_RAT;
            }
            EV_ATTRIB_FEATURES => {
                if !self.enabled.contains(FilterMask::FEATURES) {
                    self.feature_count = 0;
                }
                if self.feature_count < FEATURE_CLASS_COUNT - 1 {
                    self.feature_flags[self.feature_count] =
                        ((data & 0xFFF) as u16, ((data >> 12) & 0xFFF) as u16);
                    self.feature_count += 1;
                    self.enabled |= FilterMask::FEATURES;
                } else {
                    debug!("feature filter count exceeded");
                }
            }
            EV_ATTRIB_REL_DATE => {
                state.reldate = data & 0xFF;
                state.has_reldate = true;
            }
            EV_ATTRIB_START_TIME => {
                state.start_mod = bcd_to_mod(data);
                state.has_start = true;
            }
            EV_ATTRIB_STOP_TIME => {
                state.stop_mod = bcd_to_mod(data);
                state.has_stop = true;
            }
            EV_ATTRIB_LANGUAGE => {
                if !self.enabled.contains(FilterMask::LANGUAGES) {
                    self.init_lang_descr();
                }
                let code = [
                    (data & 0xFF) as u8,
                    ((data >> 8) & 0xFF) as u8,
                    ((data >> 16) & 0xFF) as u8,
                ];
                self.set_lang_descr(db, code);
                self.enabled |= FilterMask::LANGUAGES;
            }
            EV_ATTRIB_SUBT_LANG => {
                if !self.enabled.contains(FilterMask::SUBTITLES) {
                    self.init_subt_descr();
                }
                let code = [
                    (data & 0xFF) as u8,
                    ((data >> 8) & 0xFF) as u8,
                    ((data >> 16) & 0xFF) as u8,
                ];
                self.set_subt_descr(db, code);
                self.enabled |= FilterMask::SUBTITLES;
            }
            kind if (EV_ATTRIB_THEME..EV_ATTRIB_THEME + 8).contains(&kind) => {
                if !self.enabled.contains(FilterMask::THEMES) {
                    self.init_themes(0xFF);
                }
                let class = 1 << (kind - EV_ATTRIB_THEME);
                self.themes[(data & 0xFF) as usize] |= class;
                self.used_theme_classes |= class;
                self.enabled |= FilterMask::THEMES;
            }
            kind if (EV_ATTRIB_SORTCRIT..EV_ATTRIB_SORTCRIT + 8).contains(&kind) => {
                if !self.enabled.contains(FilterMask::SORTCRIT) {
                    self.init_sortcrit(0xFF);
                }
                let class = 1 << (kind - EV_ATTRIB_SORTCRIT);
                self.sortcrit[(data & 0xFF) as usize] |= class;
                self.used_sortcrit_classes |= class;
                self.enabled |= FilterMask::SORTCRIT;
            }
            other => debug!(other, "unknown NI attribute kind"),
        }
    }

    /// Resolves the collected time slot per ETS 300 707 chapter
    /// 11.12.4.1: a missing date means today, a missing start time
    /// means now, start time 0xFFFF means now with the stop time as an
    /// offset, a missing stop time means 23:59, a slot crossing
    /// midnight extends into the next day, and a slot that already
    /// ended today (with no explicit date) moves to tomorrow. All
    /// attribute times are local time, hence the LTO parameter.
    pub fn finish_ni(&mut self, state: &mut NiFilterState, now: i64, lto: i64) {
        if !state.has_reldate && !state.has_start && !state.has_stop {
            return;
        }
        let now_mod = (((now + lto).rem_euclid(86_400)) / 60) as u32;

        if !state.has_reldate {
            state.reldate = 0;
        }
        if !state.has_start {
            state.start_mod = now_mod;
        } else if state.start_mod == 0xFFFF {
            state.start_mod = now_mod;
            // stop time is then an offset to the current time
            if state.has_stop {
                state.stop_mod += now_mod;
            }
        }
        if !state.has_stop {
            state.stop_mod = 23 * 60 + 59;
        }

        if state.start_mod > state.stop_mod {
            // time slot crosses midnight
            state.stop_mod += 24 * 60;
        } else if state.stop_mod <= now_mod && state.reldate == 0 {
            // the slot has completely elapsed today
            state.reldate += 1;
        }

        // time base is today at midnight local time
        let midnight = now - (now + lto).rem_euclid(86_400);
        self.time_begin =
            midnight + state.start_mod as i64 * 60 + state.reldate as i64 * 86_400;
        self.time_end = midnight + state.stop_mod as i64 * 60 + state.reldate as i64 * 86_400;
        self.enabled |= FilterMask::TIME_BEG | FilterMask::TIME_END;
    }
}

/// Converts a BCD-coded hhmm value to minutes of day; the magic value
/// 0xFFFF ("current time") passes through.
fn bcd_to_mod(bcd: u32) -> u32 {
    if bcd == 0xFFFF {
        return 0xFFFF;
    }
    let hour = ((bcd >> 12) & 0x0F) * 10 + ((bcd >> 8) & 0x0F);
    let minute = ((bcd >> 4) & 0x0F) * 10 + (bcd & 0x0F);
    hour * 60 + minute
}

/// Latin-1 lowercase folding: ASCII letters plus the accented range
/// 0xC0..0xDE (the multiplication sign stays itself).
fn fold_latin1(c: char) -> char {
    match c {
        'A'..='Z' => c.to_ascii_lowercase(),
        '\u{C0}'..='\u{DE}' if c != '\u{D7}' => {
            char::from_u32(c as u32 + 0x20).unwrap_or(c)
        }
        _ => c,
    }
}
