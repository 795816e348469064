//! Error types for card engine operations

use thiserror::Error;

/// Card engine errors
///
/// Protocol-level conditions (wrong parameters, missing files, bad lengths)
/// never surface here from the APDU layer; those become status words. An
/// `Err` escaping a handler indicates an internal bug and drops the card
/// back to the unpowered state.
#[derive(Debug, Error)]
pub enum IccError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad parameter: {0}")]
    Param(String),

    #[error("APDU header too short: {0} bytes")]
    ApduHdrTooShort(usize),

    #[error("APDU not handled")]
    ApduUnhandled,

    #[error("APDU response invalid: {0}")]
    ApduResInvalid(String),

    #[error("TPDU header too short: {0} bytes")]
    TpduHdrTooShort(usize),

    #[error("Buffer too short: need {need}, have {have}")]
    BufferTooShort { need: usize, have: usize },

    #[error("PPS request invalid: {0}")]
    PpsInvalid(String),

    #[error("PPS parameters declined")]
    PpsFailed,

    #[error("ATR invalid: {0}")]
    AtrInvalid(String),

    #[error("File system item not found")]
    FsNotFound,

    #[error("End of TLV data")]
    TlvEnd,

    #[error("No pending connection in queue")]
    NetQueueEmpty,

    #[error("Network protocol error: {0}")]
    Net(String),
}

/// Result type for card operations
pub type IccResult<T> = Result<T, IccError>;
