//! # nxtv-core
//!
//! Database and control layer of the Nextview EPG receiver.
//!
//! ## Architecture
//!
//! - **Database**: decoded records of one provider with strict
//!   version, network and ordering invariants, an obsolete area for
//!   superseded programmes and batch expiry.
//! - **Filters**: a pure, composable predicate pipeline over the
//!   programme axis, plus the translator from NI navigation menus to
//!   filter contexts.
//! - **Timescale queue**: base-time-normalized coverage events for an
//!   external observer.
//! - **Acquisition control**: the consumer-side orchestration of ring
//!   buffer, stream decoder and database, the capture producer thread
//!   and the provider scan.

pub mod acq;
pub mod db;
pub mod error;
pub mod filter;
pub mod time;
pub mod tsc;

pub use acq::{AcceptAll, AcqControl, AcqHandler, AcqStats, CaptureThread, EpgScan, ScanStatus};
pub use db::{ai_version_newer, block_count, block_index, BlockCount, EpgDb, Stored, StoredPi};
pub use error::{AcqError, DbError};
pub use filter::{FilterContext, FilterMask, NiFilterState};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use tsc::{TimescaleQueue, TscBuffer, TscElem, TscFlags, TscMode};
