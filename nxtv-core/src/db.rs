//! Programme database.
//!
//! Holds the decoded Nextview records of one provider: at most one AI
//! and BI, programme information on two sort axes (start time and
//! per-network block number), navigation blocks by block number and
//! the per-network language/subtitle descriptors. Insertion enforces
//! the structural invariants: PI intervals of one network never
//! overlap (victims move to the obsolete area), every network index is
//! valid against the AI, and block order follows the wraparound
//! distance to the AI start number.
//!
//! An advisory reentrant read lock gates all pointer-returning
//! queries; mutators require the lock to be free. The lock exists to
//! catch structural misuse in reentrant callback chains, not for
//! thread safety (the database is owned by the consumer thread).

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use tracing::{debug, warn};

use nxtv_stream::block::StreamId;
use nxtv_stream::records::{Ai, Bi, Li, Mi, Ni, Oi, Pi, Ti};
use nxtv_ttx::packet::Cni;

use crate::error::DbError;
use crate::filter::FilterContext;
use crate::time::TimeProvider;

/// Default retention of expired programmes (seconds past stop time).
pub const DEFAULT_EXPIRE_DELAY: i64 = 2 * 60 * 60;

/// Block number of the this-channel LI/TI slot.
pub const THIS_CHANNEL_BLOCK: u16 = 0x8000;

/// Modulo-65536 distance from `start_no` to `stop_no`, inclusive.
///
/// `stop + 1 == start` is the empty range, as is the full-range code
/// `start == 0, stop == 0xFFFF` (ETS 300 707).
pub fn block_count(start_no: u16, stop_no: u16) -> u32 {
    if stop_no >= start_no {
        if start_no == 0 && stop_no == 0xFFFF {
            0
        } else {
            (stop_no - start_no) as u32 + 1
        }
    } else if stop_no.wrapping_add(1) == start_no {
        0
    } else {
        (0x10000 + stop_no as u32) - start_no as u32 + 1
    }
}

/// Wraparound-adjusted index of a block number relative to the AI
/// start number.
pub fn block_index(start_no: u16, block_no: u16) -> u32 {
    if block_no >= start_no {
        (block_no - start_no) as u32
    } else {
        (0x10000 + block_no as u32) - start_no as u32
    }
}

/// True when `new` is ahead of `old` on the 6-bit AI version counter:
/// the forward half of the ring counts as newer, so the comparison
/// survives counter wraparound.
pub fn ai_version_newer(new: u8, old: u8) -> bool {
    let diff = new.wrapping_sub(old) & 0x3F;
    diff != 0 && diff < 0x20
}

/// Envelope common to all stored records: the stream the block arrived
/// in and the AI version it was tagged with at emission.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub record: T,
    pub stream: StreamId,
    pub version: u8,
}

/// A stored programme with its envelope and AI-derived flags.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPi {
    pub pi: Pi,
    pub stream: StreamId,
    pub version: u8,
    /// True when the block number lies inside the range the AI
    /// announces for its network.
    pub block_no_in_ai: bool,
}

/// Per-stream database statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCount {
    /// Stored PI of any version.
    pub all_versions: u32,
    /// Stored PI tagged with the current AI version.
    pub cur_version: u32,
    /// PI in the obsolete area.
    pub obsolete: u32,
    /// Total announced by the AI start/stop numbers.
    pub ai: u32,
}

type TimeKey = (i64, u8);

pub struct EpgDb {
    ai: Option<Stored<Ai>>,
    bi: Option<Stored<Bi>>,
    ai_update_time: i64,
    pi_by_time: BTreeMap<TimeKey, StoredPi>,
    /// Per-network index: wraparound-adjusted block index to time key.
    pi_by_net: Vec<BTreeMap<u32, TimeKey>>,
    obsolete: Vec<StoredPi>,
    ni: BTreeMap<u16, Stored<Ni>>,
    oi: BTreeMap<u16, Stored<Oi>>,
    mi: BTreeMap<u16, Stored<Mi>>,
    li: BTreeMap<u16, Stored<Li>>,
    ti: BTreeMap<u16, Stored<Ti>>,
    lock_level: Cell<u32>,
    expire_delay: i64,
    time: Arc<dyn TimeProvider>,
}

impl EpgDb {
    pub fn new(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            ai: None,
            bi: None,
            ai_update_time: 0,
            pi_by_time: BTreeMap::new(),
            pi_by_net: Vec::new(),
            obsolete: Vec::new(),
            ni: BTreeMap::new(),
            oi: BTreeMap::new(),
            mi: BTreeMap::new(),
            li: BTreeMap::new(),
            ti: BTreeMap::new(),
            lock_level: Cell::new(0),
            expire_delay: DEFAULT_EXPIRE_DELAY,
            time,
        }
    }

    // ------------------------------------------------------------------
    // locking

    /// Takes the advisory read lock (reentrant).
    pub fn lock(&self) {
        self.lock_level.set(self.lock_level.get() + 1);
    }

    pub fn unlock(&self) {
        let level = self.lock_level.get();
        if level > 0 {
            self.lock_level.set(level - 1);
        } else {
            warn!("database already unlocked");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_level.get() > 0
    }

    fn check_locked(&self, what: &str) -> bool {
        if self.is_locked() {
            true
        } else {
            warn!(what, "database not locked during query");
            false
        }
    }

    fn check_unlocked(&self) -> Result<(), DbError> {
        if self.is_locked() {
            Err(DbError::Locked(self.lock_level.get()))
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // queries

    /// CNI of the provider, 0 without an AI. Safe without the lock.
    pub fn cni(&self) -> Cni {
        self.ai.as_ref().map(|ai| ai.record.cni()).unwrap_or(Cni(0))
    }

    pub fn get_ai(&self) -> Option<&Ai> {
        self.check_locked("get_ai").then_some(())?;
        self.ai.as_ref().map(|s| &s.record)
    }

    pub fn get_bi(&self) -> Option<&Bi> {
        self.check_locked("get_bi").then_some(())?;
        self.bi.as_ref().map(|s| &s.record)
    }

    /// Time the current AI was accepted.
    pub fn ai_update_time(&self) -> i64 {
        self.ai_update_time
    }

    pub fn get_ni(&self, block_no: u16) -> Option<&Ni> {
        self.check_locked("get_ni").then_some(())?;
        self.ni.get(&block_no).map(|s| &s.record)
    }

    pub fn get_oi(&self, block_no: u16) -> Option<&Oi> {
        self.check_locked("get_oi").then_some(())?;
        self.oi.get(&block_no).map(|s| &s.record)
    }

    pub fn get_mi(&self, block_no: u16) -> Option<&Mi> {
        self.check_locked("get_mi").then_some(())?;
        self.mi.get(&block_no).map(|s| &s.record)
    }

    /// LI lookup: block 0 is keyed by network, block 0x8000 is the
    /// this-channel slot.
    pub fn get_li(&self, block_no: u16, netwop: u8) -> Option<&Li> {
        self.check_locked("get_li").then_some(())?;
        match block_no {
            0 => self.li.get(&(netwop as u16)),
            THIS_CHANNEL_BLOCK => self.li.get(&THIS_CHANNEL_BLOCK),
            other => {
                warn!(other, "unsupported LI block number");
                None
            }
        }
        .map(|s| &s.record)
    }

    pub fn get_ti(&self, block_no: u16, netwop: u8) -> Option<&Ti> {
        self.check_locked("get_ti").then_some(())?;
        match block_no {
            0 => self.ti.get(&(netwop as u16)),
            THIS_CHANNEL_BLOCK => self.ti.get(&THIS_CHANNEL_BLOCK),
            other => {
                warn!(other, "unsupported TI block number");
                None
            }
        }
        .map(|s| &s.record)
    }

    /// Looks up one PI by block number and network, optionally gated
    /// by a filter.
    pub fn search_pi(&self, fc: Option<&FilterContext>, block_no: u16, netwop: u8) -> Option<&Pi> {
        self.check_locked("search_pi").then_some(())?;
        let chain = self.pi_by_net.get(netwop as usize)?;
        chain.values().find_map(|key| {
            let stored = &self.pi_by_time[key];
            (stored.pi.block_no == block_no
                && fc.map_or(true, |fc| fc.matches(self, &stored.pi)))
            .then_some(&stored.pi)
        })
    }

    pub fn get_pi(&self, block_no: u16, netwop: u8) -> Option<&Pi> {
        self.search_pi(None, block_no, netwop)
    }

    /// First matching PI on the time axis. The start time may lie in
    /// the past if the stop time is still in the future.
    pub fn first_pi(&self, fc: Option<&FilterContext>) -> Option<&Pi> {
        self.check_locked("first_pi").then_some(())?;
        self.pi_by_time
            .values()
            .map(|s| &s.pi)
            .find(|pi| fc.map_or(true, |fc| fc.matches(self, pi)))
    }

    pub fn last_pi(&self, fc: Option<&FilterContext>) -> Option<&Pi> {
        self.check_locked("last_pi").then_some(())?;
        self.pi_by_time
            .values()
            .rev()
            .map(|s| &s.pi)
            .find(|pi| fc.map_or(true, |fc| fc.matches(self, pi)))
    }

    /// Next matching PI behind `cur` on the (start time, network)
    /// axis.
    pub fn next_pi(&self, fc: Option<&FilterContext>, cur: &Pi) -> Option<&Pi> {
        self.check_locked("next_pi").then_some(())?;
        self.pi_by_time
            .range((
                Bound::Excluded((cur.start_time, cur.netwop_no)),
                Bound::Unbounded,
            ))
            .map(|(_, s)| &s.pi)
            .find(|pi| fc.map_or(true, |fc| fc.matches(self, pi)))
    }

    pub fn prev_pi(&self, fc: Option<&FilterContext>, cur: &Pi) -> Option<&Pi> {
        self.check_locked("prev_pi").then_some(())?;
        self.pi_by_time
            .range((
                Bound::Unbounded,
                Bound::Excluded((cur.start_time, cur.netwop_no)),
            ))
            .rev()
            .map(|(_, s)| &s.pi)
            .find(|pi| fc.map_or(true, |fc| fc.matches(self, pi)))
    }

    /// All PI of one network in block order, with their envelopes.
    pub fn pi_iter_net(&self, netwop: u8) -> impl Iterator<Item = &StoredPi> + '_ {
        self.pi_by_net
            .get(netwop as usize)
            .into_iter()
            .flat_map(|chain| chain.values())
            .map(move |key| &self.pi_by_time[key])
    }

    /// All PI in time order, with their envelopes.
    pub fn pi_iter(&self) -> impl Iterator<Item = &StoredPi> + '_ {
        self.pi_by_time.values()
    }

    pub fn obsolete_iter(&self) -> impl Iterator<Item = &StoredPi> + '_ {
        self.obsolete.iter()
    }

    /// Finds an obsolete PI of the network overlapping the window.
    pub fn search_obsolete_pi(&self, netwop: u8, start: i64, stop: i64) -> Option<&Pi> {
        self.check_locked("search_obsolete_pi").then_some(())?;
        self.obsolete
            .iter()
            .find(|s| s.pi.netwop_no == netwop && s.pi.overlaps(start, stop))
            .map(|s| &s.pi)
    }

    /// Position of a block relative to the currently running programme
    /// of its network: the running programme is index 0; when none is
    /// running the first present block counts as 1 ("NEXT"), per the
    /// Nextview programme-number filter definition.
    pub fn prog_idx(&self, block_no: u16, netwop: u8) -> Option<u32> {
        self.check_locked("prog_idx").then_some(())?;
        let ai = self.ai.as_ref()?;
        let ai_netwop = ai.record.netwop(netwop)?;
        let chain = self.pi_by_net.get(netwop as usize)?;
        let first_key = chain.values().next()?;
        let first = &self.pi_by_time[first_key];

        let now_idx = if first.pi.start_time <= self.time.now_unix() {
            0
        } else {
            1
        };
        let first_idx = block_index(ai_netwop.start_no, first.pi.block_no);
        let block_idx = block_index(ai_netwop.start_no, block_no);
        if block_idx >= first_idx {
            Some(block_idx - first_idx + now_idx)
        } else {
            debug!(block_no, netwop, "block should already have expired");
            None
        }
    }

    /// Stream a block number belongs to according to the AI ranges.
    pub fn stream_by_block_no(&self, netwop: u8, block_no: u16) -> StreamId {
        if let Some(ai_netwop) = self.ai.as_ref().and_then(|ai| ai.record.netwop(netwop)) {
            let idx = block_index(ai_netwop.start_no, block_no);
            if idx < block_count(ai_netwop.start_no, ai_netwop.stop_no) {
                return StreamId::Stream1;
            }
        }
        StreamId::Stream2
    }

    /// Per-stream PI statistics; atomic, no lock required.
    pub fn stats(&self) -> [BlockCount; 2] {
        let mut counts = [BlockCount::default(); 2];
        let Some(ai) = self.ai.as_ref() else {
            return counts;
        };
        let versions = [ai.record.version, ai.record.version_swo];

        for stored in self.pi_by_time.values() {
            let idx = stored.stream.index();
            counts[idx].all_versions += 1;
            if stored.version == versions[idx] {
                counts[idx].cur_version += 1;
            }
        }
        for stored in &self.obsolete {
            counts[stored.stream.index()].obsolete += 1;
        }
        for netwop in &ai.record.netwops {
            counts[0].ai += block_count(netwop.start_no, netwop.stop_no);
            counts[1].ai += block_count(netwop.start_no, netwop.stop_no_swo);
        }
        counts[1].ai -= counts[0].ai.min(counts[1].ai);
        counts
    }

    // ------------------------------------------------------------------
    // insertion

    /// Replaces the AI. Networks beyond the new netwop count lose
    /// their programmes to the obsolete area; the per-network index is
    /// rebuilt against the new start numbers.
    pub fn insert_ai(&mut self, ai: Ai, stream: StreamId) -> Result<(), DbError> {
        self.check_unlocked()?;

        let netwop_count = ai.netwop_count();
        let invalidated: Vec<TimeKey> = self
            .pi_by_time
            .iter()
            .filter(|(_, s)| s.pi.netwop_no >= netwop_count)
            .map(|(k, _)| *k)
            .collect();
        for key in invalidated {
            if let Some(stored) = self.pi_by_time.remove(&key) {
                debug!(
                    netwop = stored.pi.netwop_no,
                    "netwop dropped from AI - moving PI to obsolete"
                );
                self.obsolete.push(stored);
            }
        }

        self.ai_update_time = self.time.now_unix();
        self.ai = Some(Stored {
            version: ai.version,
            stream,
            record: ai,
        });
        self.rebuild_net_index();
        Ok(())
    }

    pub fn insert_bi(&mut self, bi: Bi, stream: StreamId) -> Result<(), DbError> {
        self.check_unlocked()?;
        self.bi = Some(Stored {
            record: bi,
            stream,
            version: 0,
        });
        Ok(())
    }

    /// Inserts a programme. Returns false when the block is rejected
    /// (no AI, invalid network, empty interval, or a version behind
    /// the stored copy of the same block). A same-numbered block of
    /// the same or a newer version replaces its predecessor;
    /// overlapping neighbours move to the obsolete area.
    pub fn insert_pi(&mut self, pi: Pi, stream: StreamId, version: u8) -> Result<bool, DbError> {
        self.check_unlocked()?;
        let Some(ai) = self.ai.as_ref() else {
            debug!("PI rejected: no AI in database");
            return Ok(false);
        };
        let Some(ai_netwop) = ai.record.netwop(pi.netwop_no) else {
            debug!(netwop = pi.netwop_no, "PI netwop out of AI range");
            return Ok(false);
        };
        if pi.stop_time <= pi.start_time {
            debug!(block_no = pi.block_no, "PI with empty interval rejected");
            return Ok(false);
        }

        let start_no = ai_netwop.start_no;
        let block_idx = block_index(start_no, pi.block_no);
        let block_no_in_ai = block_idx < block_count(start_no, ai_netwop.stop_no_swo);
        let netwop = pi.netwop_no as usize;

        // a retransmission of the same block replaces the old one, but
        // only if its version is not behind the stored copy
        if let Some(key) = self.pi_by_net[netwop].get(&block_idx).copied() {
            let stored = &self.pi_by_time[&key];
            if stored.version != version && !ai_version_newer(version, stored.version) {
                debug!(
                    block_no = pi.block_no,
                    stored = stored.version,
                    incoming = version,
                    "stale PI version rejected"
                );
                return Ok(false);
            }
            self.pi_by_net[netwop].remove(&block_idx);
            self.pi_by_time.remove(&key);
        }

        // evict overlapping neighbours to the obsolete area
        let victims: Vec<u32> = self.pi_by_net[netwop]
            .iter()
            .filter(|(_, key)| self.pi_by_time[key].pi.overlaps(pi.start_time, pi.stop_time))
            .map(|(idx, _)| *idx)
            .collect();
        for idx in victims {
            if let Some(key) = self.pi_by_net[netwop].remove(&idx) {
                if let Some(stored) = self.pi_by_time.remove(&key) {
                    debug!(
                        old = stored.pi.block_no,
                        new = pi.block_no,
                        "overlapping PI moved to obsolete"
                    );
                    self.obsolete.push(stored);
                }
            }
        }

        let key = (pi.start_time, pi.netwop_no);
        self.pi_by_net[netwop].insert(block_idx, key);
        self.pi_by_time.insert(
            key,
            StoredPi {
                pi,
                stream,
                version,
                block_no_in_ai,
            },
        );
        Ok(true)
    }

    pub fn insert_ni(&mut self, ni: Ni, stream: StreamId, version: u8) -> Result<(), DbError> {
        self.check_unlocked()?;
        self.ni.insert(
            ni.block_no,
            Stored {
                record: ni,
                stream,
                version,
            },
        );
        Ok(())
    }

    pub fn insert_oi(&mut self, oi: Oi, stream: StreamId, version: u8) -> Result<(), DbError> {
        self.check_unlocked()?;
        self.oi.insert(
            oi.block_no,
            Stored {
                record: oi,
                stream,
                version,
            },
        );
        Ok(())
    }

    pub fn insert_mi(&mut self, mi: Mi, stream: StreamId, version: u8) -> Result<(), DbError> {
        self.check_unlocked()?;
        self.mi.insert(
            mi.block_no,
            Stored {
                record: mi,
                stream,
                version,
            },
        );
        Ok(())
    }

    pub fn insert_li(&mut self, li: Li, stream: StreamId, version: u8) -> Result<bool, DbError> {
        self.check_unlocked()?;
        let key = match li.block_no {
            0 => li.netwop_no as u16,
            THIS_CHANNEL_BLOCK => THIS_CHANNEL_BLOCK,
            other => {
                debug!(other, "unsupported LI block number rejected");
                return Ok(false);
            }
        };
        self.li.insert(
            key,
            Stored {
                record: li,
                stream,
                version,
            },
        );
        Ok(true)
    }

    pub fn insert_ti(&mut self, ti: Ti, stream: StreamId, version: u8) -> Result<bool, DbError> {
        self.check_unlocked()?;
        let key = match ti.block_no {
            0 => ti.netwop_no as u16,
            THIS_CHANNEL_BLOCK => THIS_CHANNEL_BLOCK,
            other => {
                debug!(other, "unsupported TI block number rejected");
                return Ok(false);
            }
        };
        self.ti.insert(
            key,
            Stored {
                record: ti,
                stream,
                version,
            },
        );
        Ok(true)
    }

    // ------------------------------------------------------------------
    // expiry

    pub fn set_expire_delay(&mut self, delay_secs: i64) {
        self.expire_delay = delay_secs;
    }

    pub fn expire_delay(&self) -> i64 {
        self.expire_delay
    }

    /// Batch-removes programmes (stored and obsolete) whose stop time
    /// lies further than the expire delay in the past. Returns the
    /// number of removed blocks.
    pub fn expire(&mut self) -> Result<usize, DbError> {
        self.check_unlocked()?;
        let threshold = self.time.now_unix() - self.expire_delay;

        let dead: Vec<TimeKey> = self
            .pi_by_time
            .iter()
            .filter(|(_, s)| s.pi.stop_time < threshold)
            .map(|(k, _)| *k)
            .collect();
        let mut removed = dead.len();
        for key in &dead {
            if let Some(stored) = self.pi_by_time.remove(key) {
                let netwop = stored.pi.netwop_no as usize;
                if let Some(chain) = self.pi_by_net.get_mut(netwop) {
                    chain.retain(|_, k| *k != *key);
                }
            }
        }

        let before = self.obsolete.len();
        self.obsolete.retain(|s| s.pi.stop_time >= threshold);
        removed += before - self.obsolete.len();
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // internal

    /// Rebuilds the per-network index after the AI netwop table (and
    /// with it the start numbers) changed.
    fn rebuild_net_index(&mut self) {
        let Some(ai) = self.ai.as_ref() else {
            self.pi_by_net.clear();
            return;
        };
        let mut index: Vec<BTreeMap<u32, TimeKey>> =
            vec![BTreeMap::new(); ai.record.netwop_count() as usize];
        for (key, stored) in self.pi_by_time.iter_mut() {
            let netwop = stored.pi.netwop_no;
            let Some(ai_netwop) = ai.record.netwop(netwop) else {
                continue;
            };
            let idx = block_index(ai_netwop.start_no, stored.pi.block_no);
            stored.block_no_in_ai =
                idx < block_count(ai_netwop.start_no, ai_netwop.stop_no_swo);
            index[netwop as usize].insert(idx, *key);
        }
        self.pi_by_net = index;
    }
}

impl std::fmt::Debug for EpgDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpgDb")
            .field("cni", &self.cni())
            .field("pi_count", &self.pi_by_time.len())
            .field("obsolete_count", &self.obsolete.len())
            .field("lock_level", &self.lock_level.get())
            .finish()
    }
}
