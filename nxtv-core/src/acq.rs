//! Acquisition control.
//!
//! The consumer half of the receiver: drains the teletext ring buffer
//! on a ~40 ms poll, feeds the stream decoder, pumps completed blocks
//! into the database with the BI/AI acceptance protocol, detects
//! channel changes through the teletext page header, and drives the
//! provider scan. The capture producer is a plain thread owning the
//! VBI source, the slicer and the demux; it runs one frame per
//! iteration for as long as the shared enable flag is set.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use nxtv_stream::alphabet::AlphabetSet;
use nxtv_stream::block::{BlockType, RawBlock, StreamId};
use nxtv_stream::records::{self, Ai, Bi, Record};
use nxtv_stream::stream::StreamDecoder;
use nxtv_ttx::capture::{next_channel, Tuner, VbiCapture};
use nxtv_ttx::demux::TtxDemux;
use nxtv_ttx::hamming::parity_strip;
use nxtv_ttx::packet::Cni;
use nxtv_ttx::ring::{RingReader, RingWriter};

use crate::db::EpgDb;
use crate::error::AcqError;
use crate::time::TimeProvider;
use crate::tsc::TimescaleQueue;

/// Default teletext page carrying the EPG stream.
pub const EPG_DEFAULT_PAGE: u16 = 0x1DF;

/// Default Nextview application id, used until a BI announces one.
pub const EPG_DEFAULT_APP_ID: u16 = 1;

/// Page header bytes compared for channel change detection.
const HEADER_CHECK_LEN: usize = 12;

/// Tolerated per-header character mismatches (the header is only
/// parity protected).
const HEADER_CHECK_MAX_ERRORS: usize = 2;

/// Decisions and notifications from the embedding application.
pub trait AcqHandler: Send {
    /// A BI block arrived; returning false rejects the bundle.
    fn on_bi(&mut self, _bi: &Bi) -> bool {
        true
    }

    /// An AI block arrived; returning false rejects the provider
    /// (acquisition stays in scratch mode).
    fn on_ai(&mut self, _ai: &Ai) -> bool {
        true
    }

    /// The teletext page header changed: the tuner was switched to
    /// another station underneath us.
    fn on_channel_change(&mut self) {}
}

/// No-op handler accepting everything.
pub struct AcceptAll;

impl AcqHandler for AcceptAll {}

/// Acquisition statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcqStats {
    pub ttx_pkg_count: u32,
    pub epg_pkg_count: u32,
    pub epg_page_count: u32,
    pub overflow_count: u32,
    /// Parity errors reported by AI fragment assembly.
    pub ai_parity_errors: u64,
}

/// Teletext page header comparator; more than
/// `HEADER_CHECK_MAX_ERRORS` deviating characters signal a channel
/// change.
struct HeaderCheck {
    armed: bool,
    header: [u8; HEADER_CHECK_LEN],
}

impl HeaderCheck {
    fn new() -> Self {
        Self {
            armed: false,
            header: [0; HEADER_CHECK_LEN],
        }
    }

    fn reset(&mut self) {
        self.armed = false;
    }

    /// Returns false when the header deviates from the stored one.
    fn check(&mut self, payload: &[u8]) -> bool {
        // display part of the header, skipping the 8 control bytes
        let section = &payload[8..8 + HEADER_CHECK_LEN];
        if self.armed {
            let errors = section
                .iter()
                .zip(&self.header)
                .filter(|(&cur, &stored)| {
                    parity_strip(cur).is_some_and(|dec| dec != stored)
                })
                .count();
            if errors > HEADER_CHECK_MAX_ERRORS {
                debug!(errors, "page header changed - assuming channel change");
                return false;
            }
        } else {
            // arm only once every character decoded cleanly
            let mut decoded = [0u8; HEADER_CHECK_LEN];
            let ok = section
                .iter()
                .zip(decoded.iter_mut())
                .all(|(&cur, out)| match parity_strip(cur) {
                    Some(dec) => {
                        *out = dec;
                        true
                    }
                    None => false,
                });
            if ok {
                self.header = decoded;
                self.armed = true;
            }
        }
        true
    }
}

/// The acquisition controller: consumer-side orchestration of ring,
/// stream decoder, database and timescale queue.
pub struct AcqControl {
    reader: RingReader,
    decoder: StreamDecoder,
    db: EpgDb,
    tsc: TimescaleQueue,
    handler: Box<dyn AcqHandler>,
    time: Arc<dyn TimeProvider>,
    alphabets: AlphabetSet,
    header_check: HeaderCheck,
    enabled: bool,
    /// Until an AI was accepted only BI/AI are processed.
    scratch_mode: bool,
    is_epg_page: bool,
    epg_page_no: u16,
    app_id: u16,
    ai_parity_errors: u64,
}

impl AcqControl {
    pub fn new(
        reader: RingReader,
        handler: Box<dyn AcqHandler>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let db = EpgDb::new(Arc::clone(&time));
        Self {
            reader,
            decoder: StreamDecoder::new(true, EPG_DEFAULT_APP_ID),
            db,
            tsc: TimescaleQueue::new(),
            handler,
            time,
            alphabets: AlphabetSet::default(),
            header_check: HeaderCheck::new(),
            enabled: false,
            scratch_mode: true,
            is_epg_page: false,
            epg_page_no: EPG_DEFAULT_PAGE,
            app_id: EPG_DEFAULT_APP_ID,
            ai_parity_errors: 0,
        }
    }

    pub fn db(&self) -> &EpgDb {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut EpgDb {
        &mut self.db
    }

    pub fn timescale(&mut self) -> &mut TimescaleQueue {
        &mut self.tsc
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starts acquisition on the given page with the given application
    /// id; both default when unspecified. A known provider (AI already
    /// in the database) skips the wait-for-AI scratch phase of the
    /// stream decoder but still revalidates the provider on arrival.
    pub fn start(&mut self, page_no: Option<u16>, app_id: Option<u16>) -> Result<(), AcqError> {
        if self.enabled {
            return Err(AcqError::AlreadyRunning);
        }
        self.is_epg_page = false;
        self.header_check.reset();
        self.epg_page_no = page_no.unwrap_or(EPG_DEFAULT_PAGE);
        self.app_id = app_id
            .or_else(|| {
                self.db.lock();
                let id = self.db.get_bi().map(|bi| bi.app_id);
                self.db.unlock();
                id
            })
            .unwrap_or(EPG_DEFAULT_APP_ID);

        let shared = self.reader.shared();
        shared.epg_page_no.store(self.epg_page_no, Ordering::Relaxed);
        shared.mip_page_no.store(0, Ordering::Relaxed);
        shared.is_epg_scan.store(false, Ordering::Relaxed);
        shared.ttx_pkg_count.store(0, Ordering::Relaxed);
        shared.epg_pkg_count.store(0, Ordering::Relaxed);
        shared.epg_page_count.store(0, Ordering::Relaxed);
        shared.is_enabled.store(true, Ordering::Relaxed);

        self.db.lock();
        let known_provider = self.db.get_ai().map(|ai| {
            AlphabetSet::from_alphabets(ai.netwops.iter().map(|n| n.alphabet))
        });
        self.db.unlock();
        let wait_for_bi_ai = match known_provider {
            Some(alphabets) => {
                self.alphabets = alphabets;
                false
            }
            None => true,
        };

        self.decoder = StreamDecoder::new(wait_for_bi_ai, self.app_id);
        self.scratch_mode = true;
        self.enabled = true;
        info!(page = self.epg_page_no, app_id = self.app_id, "acquisition started");
        Ok(())
    }

    /// Stops acquisition; the producer observes the cleared enable
    /// flag on its next frame.
    pub fn stop(&mut self) {
        if self.enabled {
            self.reader
                .shared()
                .is_enabled
                .store(false, Ordering::Relaxed);
            self.decoder.clear_scratch();
            self.enabled = false;
            info!("acquisition stopped");
        }
    }

    /// Restarts after a channel change or parameter switch: drops all
    /// buffered packets and partial blocks, re-arms the header check.
    pub fn reset(&mut self, page_no: Option<u16>, app_id: Option<u16>) -> Result<(), AcqError> {
        if !self.enabled {
            return Err(AcqError::NotRunning);
        }
        self.decoder.clear_scratch();
        self.reader.clear();
        self.enabled = false;
        self.start(page_no, app_id)
    }

    /// True when packets are waiting. When the producer has shut down
    /// and nothing is buffered, acquisition is stopped as a side
    /// effect.
    pub fn check_for_packets(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        let has = self.reader.has_packets();
        if !has && !self.reader.shared().is_enabled.load(Ordering::Relaxed) {
            warn!("producer has shut down - stopping acquisition");
            self.stop();
        }
        has
    }

    /// The poll entry point: drains the ring buffer into the stream
    /// decoder, then pumps completed blocks into the database.
    pub fn process_packets(&mut self) {
        if !self.enabled {
            return;
        }
        while let Some(slot) = self.reader.pop() {
            if slot.pkg == 0 {
                // re-check the page number: after a page change the
                // producer may still flush packets of the old page
                if slot.page.0 == self.epg_page_no {
                    if !self.header_check.check(&slot.data) {
                        self.header_check.reset();
                        self.handler.on_channel_change();
                        // the reset discards everything buffered, so
                        // the drain loop must stop here
                        let _ = self.reset(None, None);
                        break;
                    }
                    self.is_epg_page = self.decoder.new_page(slot.sub);
                } else {
                    self.is_epg_page = false;
                }
            } else if self.is_epg_page {
                self.decoder.decode_packet(slot.pkg, &slot.data);
            }
        }

        if self.enabled && self.scratch_mode {
            self.process_scratch_blocks();
        }
        if self.enabled && !self.scratch_mode {
            self.process_full_blocks();
        }
    }

    /// Scratch phase: only BI and AI leave the decoder; the AI (from
    /// the scratch queue or the fragment assembler) must pass the
    /// handler before full acquisition starts.
    fn process_scratch_blocks(&mut self) {
        let mut bi = None;
        if let Some(block) = self.decoder.take_block_of_type(BlockType::Bi) {
            if let Ok(Record::Bi(rec)) = records::decode(&block, &self.alphabets) {
                self.handler.on_bi(&rec);
                bi = Some((rec, block.stream));
            }
        }

        let ai_block = self.decoder.take_block_of_type(BlockType::Ai).or_else(|| {
            self.decoder.ai_assembler().assemble().map(|frag| {
                self.ai_parity_errors += frag.parity_errors as u64;
                frag.into_raw_block()
            })
        });
        if let Some(block) = ai_block {
            match records::decode(&block, &self.alphabets) {
                Ok(Record::Ai(ai)) => {
                    if self.handler.on_ai(&ai) {
                        self.accept_ai(ai, block.stream);
                        self.scratch_mode = false;
                        self.decoder.enable_all_types();
                        if let Some((rec, stream)) = bi {
                            let _ = self.db.insert_bi(rec, stream);
                        }
                    }
                }
                Ok(other) => warn!(?other, "AI-typed block decoded to wrong record"),
                Err(err) => debug!(%err, "AI block decode failed"),
            }
        }
    }

    /// Full acquisition: every completed block is decoded and
    /// inserted; accepted PI are mirrored into the timescale queue.
    fn process_full_blocks(&mut self) {
        // the fragment assembler may complete an AI the stream decoder
        // lost to bit errors
        if let Some(frag) = self.decoder.ai_assembler().assemble() {
            self.ai_parity_errors += frag.parity_errors as u64;
            let block = frag.into_raw_block();
            self.handle_block(block);
        }
        while let Some(block) = self.decoder.next_block() {
            self.handle_block(block);
        }
    }

    fn handle_block(&mut self, block: RawBlock) {
        let record = match records::decode(&block, &self.alphabets) {
            Ok(record) => record,
            Err(err) => {
                debug!(btype = ?block.btype, %err, "block decode failed");
                return;
            }
        };
        match record {
            Record::Bi(bi) => {
                if self.handler.on_bi(&bi) {
                    let _ = self.db.insert_bi(bi, block.stream);
                }
            }
            Record::Ai(ai) => {
                if self.handler.on_ai(&ai) {
                    self.accept_ai(ai, block.stream);
                } else {
                    debug!("AI rejected by handler - provider mismatch");
                }
            }
            Record::Pi(pi) => {
                match self.db.insert_pi(pi.clone(), block.stream, block.version) {
                    Ok(true) => {
                        self.tsc
                            .add_pi(&self.db, &pi, block.stream, self.time.now_unix());
                    }
                    Ok(false) => {}
                    Err(err) => warn!(%err, "PI insertion failed"),
                }
            }
            Record::Ni(ni) => {
                let _ = self.db.insert_ni(ni, block.stream, block.version);
            }
            Record::Oi(oi) => {
                let _ = self.db.insert_oi(oi, block.stream, block.version);
            }
            Record::Mi(mi) => {
                let _ = self.db.insert_mi(mi, block.stream, block.version);
            }
            Record::Li(li) => {
                let _ = self.db.insert_li(li, block.stream, block.version);
            }
            Record::Ti(ti) => {
                let _ = self.db.insert_ti(ti, block.stream, block.version);
            }
        }
    }

    /// Installs an accepted AI: alphabets for string decoding, version
    /// counters for block tagging, a fresh fragment assembler run, and
    /// the database record itself.
    fn accept_ai(&mut self, ai: Ai, stream: StreamId) {
        self.alphabets = AlphabetSet::from_alphabets(ai.netwops.iter().map(|n| n.alphabet));
        self.decoder.set_ai_version(ai.version, ai.version_swo);
        self.decoder.ai_assembler().restart();
        self.tsc.set_prov_cni(ai.cni());
        if let Err(err) = self.db.insert_ai(ai, stream) {
            warn!(%err, "AI insertion failed");
        }
    }

    // ------------------------------------------------------------------
    // provider scan support

    /// Arms scan mode: resets the CNI sources and syntax scan results
    /// and enables VPS/P830 decoding in the producer.
    pub fn init_scan(&mut self) {
        let shared = self.reader.shared();
        shared.vps_cni.store(0, Ordering::Relaxed);
        shared.pdc_cni.store(0, Ordering::Relaxed);
        shared.ni_cni.store(0, Ordering::Relaxed);
        shared.ni_rep_count.store(0, Ordering::Relaxed);
        shared.data_page_count.store(0, Ordering::Relaxed);
        shared.scan_generation.fetch_add(1, Ordering::Relaxed);
        shared.is_epg_scan.store(true, Ordering::Relaxed);
    }

    pub fn stop_scan(&mut self) {
        self.reader
            .shared()
            .is_epg_scan
            .store(false, Ordering::Relaxed);
    }

    /// Current scan findings: the station CNI by source priority
    /// (VPS before PDC before 8/30-1), whether more 8/30-1
    /// repetitions are worth waiting for, and the count of pages
    /// proven to carry EPG syntax.
    pub fn scan_results(&self) -> (Option<Cni>, bool, u32) {
        let shared = self.reader.shared();
        let vps = shared.vps_cni.load(Ordering::Relaxed);
        let pdc = shared.pdc_cni.load(Ordering::Relaxed);
        let ni = shared.ni_cni.load(Ordering::Relaxed);
        let ni_rep = shared.ni_rep_count.load(Ordering::Relaxed);
        let data_pages = shared.data_page_count.load(Ordering::Relaxed);

        let (cni, ni_wait) = if vps != 0 {
            (Some(Cni(vps)), false)
        } else if pdc != 0 {
            (Some(Cni(pdc)), false)
        } else if ni != 0 {
            if ni_rep > 2 {
                (Some(Cni(ni)), false)
            } else {
                (None, ni_rep < 2)
            }
        } else {
            (None, false)
        };
        (cni, ni_wait, data_pages)
    }

    /// The EPG page advertised by a Magazine Inventory Page, 0 if none
    /// was seen.
    pub fn mip_page_no(&self) -> u16 {
        self.reader.shared().mip_page_no.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AcqStats {
        let shared = self.reader.shared();
        AcqStats {
            ttx_pkg_count: shared.ttx_pkg_count.load(Ordering::Relaxed),
            epg_pkg_count: shared.epg_pkg_count.load(Ordering::Relaxed),
            epg_page_count: shared.epg_page_count.load(Ordering::Relaxed),
            overflow_count: shared.overflow_count.load(Ordering::Relaxed),
            ai_parity_errors: self.ai_parity_errors,
        }
    }
}

// ----------------------------------------------------------------------
// capture producer

/// Handle of the capture thread.
pub struct CaptureThread {
    handle: JoinHandle<Result<(), AcqError>>,
}

impl CaptureThread {
    /// Waits for the producer to exit and returns its final status.
    pub fn join(self) -> Result<(), AcqError> {
        self.handle
            .join()
            .unwrap_or_else(|_| {
                warn!("capture thread panicked");
                Ok(())
            })
    }
}

/// Spawns the capture producer: reads VBI frames, slices and routes
/// packets into the ring buffer until the shared enable flag is
/// cleared. I/O errors end the thread and surface through `join`.
pub fn spawn_capture(
    mut capture: Box<dyn VbiCapture>,
    writer: RingWriter,
) -> Result<CaptureThread, AcqError> {
    let handle = thread::Builder::new()
        .name("nxtv-capture".into())
        .spawn(move || {
            let mut demux = TtxDemux::new(writer);
            while demux.shared().is_enabled.load(Ordering::Relaxed) {
                let lines = capture.read_frame()?;
                demux.process_frame(lines);
            }
            Ok(())
        })
        .map_err(|err| AcqError::Capture(err.into()))?;
    Ok(CaptureThread { handle })
}

// ----------------------------------------------------------------------
// provider scan

/// Outcome for one scanned channel.
#[derive(Debug, Clone, Copy)]
pub struct ScanProvider {
    pub channel: u32,
    pub freq16: u32,
    pub cni: Cni,
    pub data_page_count: u32,
}

/// Scan progress as reported by `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// Still dwelling on the current channel.
    Busy,
    /// Advanced to the next channel.
    NextChannel(u32),
    /// The channel table is exhausted.
    Done,
}

/// Seconds to wait for a CNI on a channel with signal.
const SCAN_DWELL_SECS: i64 = 4;
/// Seconds to wait when the tuner reports no signal.
const SCAN_FAST_SECS: i64 = 2;

/// Steps the tuner through the channel table and collects providers
/// whose transmissions carry EPG syntax. Shared between a driving loop
/// and status display, hence the mutex-guarded provider list.
pub struct EpgScan {
    channel: u32,
    freq16: u32,
    channel_started: i64,
    have_signal: bool,
    providers: Arc<Mutex<Vec<ScanProvider>>>,
    done: bool,
}

impl EpgScan {
    /// Tunes the first channel and arms scan mode.
    pub fn start(
        ctl: &mut AcqControl,
        tuner: &mut dyn Tuner,
        now: i64,
    ) -> Result<EpgScan, AcqError> {
        let mut channel = 0;
        let freq16 = next_channel(&mut channel).expect("channel table is never empty");
        tuner.tune(freq16)?;
        ctl.init_scan();
        info!(channel, "EPG provider scan started");
        Ok(EpgScan {
            channel,
            freq16,
            channel_started: now,
            have_signal: false,
            providers: Arc::new(Mutex::new(Vec::new())),
            done: false,
        })
    }

    pub fn providers(&self) -> Arc<Mutex<Vec<ScanProvider>>> {
        Arc::clone(&self.providers)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Advances the scan: checks the CNI sources, moves on when the
    /// channel is identified or its dwell time expires.
    pub fn poll(
        &mut self,
        ctl: &mut AcqControl,
        tuner: &mut dyn Tuner,
        now: i64,
    ) -> Result<ScanStatus, AcqError> {
        if self.done {
            return Ok(ScanStatus::Done);
        }
        if !self.have_signal {
            self.have_signal = tuner.signal_strength() > 0;
        }
        let (cni, ni_wait, data_pages) = ctl.scan_results();

        let dwell = if self.have_signal {
            SCAN_DWELL_SECS
        } else {
            SCAN_FAST_SECS
        };
        let elapsed = now - self.channel_started;
        let finished = match cni {
            Some(_) => !ni_wait || elapsed >= dwell,
            None => elapsed >= dwell,
        };
        if !finished {
            return Ok(ScanStatus::Busy);
        }

        if let Some(cni) = cni {
            info!(channel = self.channel, cni = %cni, data_pages, "station identified");
            self.providers.lock().push(ScanProvider {
                channel: self.channel,
                freq16: self.freq16,
                cni,
                data_page_count: data_pages,
            });
        }

        match next_channel(&mut self.channel) {
            Some(freq16) => {
                self.freq16 = freq16;
                tuner.tune(freq16)?;
                ctl.init_scan();
                self.channel_started = now;
                self.have_signal = false;
                Ok(ScanStatus::NextChannel(self.channel))
            }
            None => {
                ctl.stop_scan();
                self.done = true;
                info!(
                    providers = self.providers.lock().len(),
                    "EPG provider scan finished"
                );
                Ok(ScanStatus::Done)
            }
        }
    }
}
