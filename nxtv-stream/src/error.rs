use thiserror::Error;

/// Errors raised while converting a validated block image into a typed
/// record. All of these discard the block; none are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("block image truncated: need {need} control bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("string exceeds text section: offset {off}, len {len}, section {section}")]
    StringBounds { off: usize, len: usize, section: usize },
    #[error("control length {ctrl_len} inconsistent with image size {image_len}")]
    CtrlLength { ctrl_len: usize, image_len: usize },
    #[error("unknown block type {0}")]
    UnknownType(u8),
    #[error("netwop index {0} out of range")]
    NetwopRange(u8),
}
