//! # nxtv-ttx
//!
//! Teletext acquisition layer of the Nextview EPG receiver: VBI line
//! bit-slicing, Hamming-8/4 and odd-parity codecs, packet
//! demultiplexing and the producer/consumer ring buffer that decouples
//! the real-time capture thread from the EPG decoder.
//!
//! ## Architecture
//!
//! - **Slicer**: adaptive-threshold bit recovery with fixed-point phase
//!   tracking (teletext and VPS variants).
//! - **Demux**: packet address decoding and page filtering; only the
//!   configured EPG page enters the ring, MIP and packet 8/30 are
//!   folded into shared scalars.
//! - **Ring**: lock-free single-producer / single-consumer queue with
//!   release/acquire index publication.
//! - **Capture**: narrow traits for the VBI device and the tuner.

pub mod capture;
pub mod demux;
pub mod hamming;
pub mod packet;
pub mod ring;
pub mod scan;
pub mod slicer;

pub use capture::{CaptureError, Tuner, VbiCapture, VbiLine};
pub use demux::TtxDemux;
pub use packet::{Cni, PageNo};
pub use ring::{vbi_buffer, RingReader, RingSlot, RingWriter, SharedState};
pub use scan::SyntaxScanner;
