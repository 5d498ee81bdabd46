//! Capture source and tuner abstractions.
//!
//! The hardware surface of the receiver is deliberately narrow: a
//! capture source hands out raw VBI frames, a tuner accepts frequency
//! settings and reports signal strength. Device-specific integrations
//! implement these traits; tests drive them with synthesized frames.

use std::io;

use thiserror::Error;

use crate::slicer::VBI_LINE_SAMPLES;

/// One raw VBI scan line.
pub type VbiLine = [u8; VBI_LINE_SAMPLES];

/// Errors raised by capture sources and tuners. Only startup errors
/// are fatal; steady-state reception problems are counters, not
/// errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("VBI device error: {0}")]
    Io(#[from] io::Error),
    #[error("no tuner found on capture device")]
    NoTuner,
}

/// Source of raw VBI frames.
pub trait VbiCapture: Send {
    /// Blocks until the next frame and returns its VBI lines in frame
    /// order. An empty slice means the device delivered nothing this
    /// tick (EINTR-like); errors are fatal.
    fn read_frame(&mut self) -> Result<&[VbiLine], CaptureError>;
}

/// Frequency control of the tuner, used by the provider scan.
pub trait Tuner {
    /// Tunes to a frequency given in units of 1/16 MHz.
    fn tune(&mut self, freq16: u32) -> Result<(), CaptureError>;

    /// Signal strength on the current frequency, device-specific scale.
    fn signal_strength(&mut self) -> u32;
}

/// One band of the European channel table.
struct FreqBand {
    /// Base frequency of the first channel in MHz.
    freq_start: f64,
    /// Offset between two channels in MHz.
    freq_offset: f64,
    first_channel: u32,
    last_channel: u32,
}

/// European channel bands, sorted by channel number.
const FREQ_TABLE: [FreqBand; 8] = [
    FreqBand { freq_start: 48.25, freq_offset: 7.0, first_channel: 2, last_channel: 4 },
    FreqBand { freq_start: 175.25, freq_offset: 7.0, first_channel: 5, last_channel: 12 },
    FreqBand { freq_start: 471.25, freq_offset: 8.0, first_channel: 21, last_channel: 69 },
    FreqBand { freq_start: 112.25, freq_offset: 7.0, first_channel: 72, last_channel: 80 },
    FreqBand { freq_start: 231.25, freq_offset: 7.0, first_channel: 81, last_channel: 90 },
    FreqBand { freq_start: 303.25, freq_offset: 8.0, first_channel: 91, last_channel: 109 },
    FreqBand { freq_start: 455.25, freq_offset: 8.0, first_channel: 110, last_channel: 112 },
    FreqBand { freq_start: 859.25, freq_offset: 8.0, first_channel: 161, last_channel: 200 },
];

const FIRST_CHANNEL: u32 = 2;

/// Number of scannable channels (for scan progress reporting).
pub fn channel_count() -> usize {
    FREQ_TABLE
        .iter()
        .map(|band| (band.last_channel - band.first_channel + 1) as usize)
        .sum()
}

/// Advances `channel` to the next table entry and returns its tuner
/// frequency in 1/16 MHz units, or `None` past the end of the table.
pub fn next_channel(channel: &mut u32) -> Option<u32> {
    *channel = if *channel < FIRST_CHANNEL {
        FIRST_CHANNEL
    } else {
        *channel + 1
    };

    for band in &FREQ_TABLE {
        if *channel < band.last_channel {
            // skip a possible channel gap between bands
            if *channel < band.first_channel {
                *channel = band.first_channel;
            }
            let freq = band.freq_start + (*channel - band.first_channel) as f64 * band.freq_offset;
            return Some((16.0 * freq) as u32);
        }
    }
    None
}
