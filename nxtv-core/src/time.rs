//! Time source abstraction.
//!
//! Expiry, progress indices and the timescale queue all depend on the
//! current time; routing every read through a provider keeps them
//! deterministic in tests.

use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait TimeProvider: Send + Sync + Debug {
    /// Current time as Unix seconds.
    fn now_unix(&self) -> i64;
}

/// Wall-clock provider for production use.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_unix(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A manual time provider for deterministic tests.
#[derive(Debug)]
pub struct ManualTimeProvider {
    secs: RwLock<i64>,
}

impl ManualTimeProvider {
    pub fn new(secs: i64) -> Self {
        Self {
            secs: RwLock::new(secs),
        }
    }

    pub fn set_time(&self, secs: i64) {
        *self.secs.write().unwrap() = secs;
    }

    pub fn advance(&self, secs: i64) {
        *self.secs.write().unwrap() += secs;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_unix(&self) -> i64 {
        *self.secs.read().unwrap()
    }
}
