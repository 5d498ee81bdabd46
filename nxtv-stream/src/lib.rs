//! # nxtv-stream
//!
//! Nextview block layer of the EPG receiver: reassembles the teletext
//! packets of the EPG page into typed Nextview records.
//!
//! ## Architecture
//!
//! - **Stream decoder**: two logical streams (selected by page
//!   subcode), block-pointer driven assembly, checksum validation and
//!   a scratch queue of completed blocks.
//! - **AI assembler**: merges fragments of the oversized Application
//!   Information block across damaged transmissions with a presence
//!   bitmap, so the provider identity decodes even when no single
//!   transmission survives intact.
//! - **Records**: typed decoding of AI/BI/PI/NI/OI/MI/LI/TI with
//!   per-network alphabet dispatch and arena-backed strings.

pub mod aifrag;
pub mod alphabet;
pub mod block;
pub mod error;
pub mod records;
pub mod stream;
pub mod testing;

pub use aifrag::{AiAssembler, AiFragment};
pub use alphabet::AlphabetSet;
pub use block::{BlockType, RawBlock, StreamId};
pub use error::BlockError;
pub use records::{Ai, AiNetwop, Bi, Li, Mi, Ni, Oi, Pi, Record, Ti};
pub use stream::StreamDecoder;
