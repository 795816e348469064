//! Protocol and parameter selection, ISO/IEC 7816-3:2006 clause 9
//!
//! After the ATR the interface may open a PPS exchange to pick a protocol
//! and transmission parameters. The request is PPSS (0xFF), PPS0 (protocol
//! in the low nibble plus presence flags for PPS1-PPS3), the optional
//! parameter bytes, and a check byte that XOR-closes the frame.

use crate::error::{IccError, IccResult};
use crate::transmission::{xor_checksum, DI, FI, TP_CONF_DEFAULT};

/// Initial byte of every PPS request and response
pub const PPSS: u8 = 0xFF;

/// Longest possible PPS frame: PPSS, PPS0, PPS1, PPS2, PPS3, PCK
pub const LEN_MAX: usize = 6;

const PPS1_PRESENT: u8 = 0b0001_0000;
const PPS2_PRESENT: u8 = 0b0010_0000;
const PPS3_PRESENT: u8 = 0b0100_0000;

/// Parameters proposed in (or resulting from) a PPS exchange, kept as
/// table indices until resolved through the transmission tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsParams {
    /// Transmission protocol type
    pub t: u8,
    pub fi_idx: u8,
    pub di_idx: u8,
    pub spu: u8,
}

impl Default for PpsParams {
    fn default() -> Self {
        PpsParams {
            t: 0,
            fi_idx: TP_CONF_DEFAULT,
            di_idx: TP_CONF_DEFAULT,
            spu: 0,
        }
    }
}

/// Expected total length of a PPS frame, computable once PPSS and PPS0
/// have been received. Lets the transport request exactly the remaining
/// bytes.
pub fn pps_len(partial: &[u8]) -> IccResult<usize> {
    if partial.len() < 2 {
        return Err(IccError::PpsInvalid("need PPSS and PPS0".into()));
    }
    if partial[0] != PPSS {
        return Err(IccError::PpsInvalid(format!(
            "first byte {:#04x} is not PPSS",
            partial[0]
        )));
    }
    let pps0 = partial[1];
    let optional = [PPS1_PRESENT, PPS2_PRESENT, PPS3_PRESENT]
        .iter()
        .filter(|&&bit| pps0 & bit != 0)
        .count();
    // PPSS + PPS0 + optional bytes + PCK
    Ok(2 + optional + 1)
}

fn parse(rx: &[u8]) -> IccResult<PpsParams> {
    if rx.len() < 3 || rx.len() > LEN_MAX {
        return Err(IccError::PpsInvalid(format!("bad frame length {}", rx.len())));
    }
    if rx[0] != PPSS {
        return Err(IccError::PpsInvalid("missing PPSS".into()));
    }
    if xor_checksum(rx) != 0 {
        return Err(IccError::PpsInvalid("check byte mismatch".into()));
    }
    let pps0 = rx[1];
    if pps0 & 0b1000_0000 != 0 {
        return Err(IccError::PpsInvalid("PPS0 bit 8 is RFU".into()));
    }

    let mut params = PpsParams {
        t: pps0 & 0x0F,
        ..PpsParams::default()
    };
    let mut at = 2;
    for bit in [PPS1_PRESENT, PPS2_PRESENT, PPS3_PRESENT] {
        if pps0 & bit == 0 {
            continue;
        }
        // The last byte is the PCK, never a parameter byte.
        if at >= rx.len() - 1 {
            return Err(IccError::PpsInvalid("frame shorter than PPS0 indicates".into()));
        }
        let ppsi = rx[at];
        at += 1;
        match bit {
            PPS1_PRESENT => {
                // Fi index in the high nibble, Di index in the low nibble.
                params.fi_idx = ppsi >> 4;
                params.di_idx = ppsi & 0x0F;
            }
            PPS2_PRESENT => params.spu = ppsi,
            _ => {
                if ppsi != 0 {
                    return Err(IccError::PpsInvalid("PPS3 is RFU and must be 0".into()));
                }
            }
        }
    }
    if at != rx.len() - 1 {
        return Err(IccError::PpsInvalid("frame longer than PPS0 indicates".into()));
    }
    Ok(params)
}

fn deparse(params: &PpsParams, pps0_req: u8, tx: &mut [u8]) -> IccResult<usize> {
    let mut frame = [0u8; LEN_MAX];
    let mut at = 0;
    frame[at] = PPSS;
    at += 1;
    frame[at] = pps0_req;
    at += 1;

    let defaults = params.fi_idx == TP_CONF_DEFAULT && params.di_idx == TP_CONF_DEFAULT;
    let supported =
        FI[usize::from(params.fi_idx)] != 0 && DI[usize::from(params.di_idx)] != 0;
    if defaults || !supported || pps0_req & PPS1_PRESENT == 0 {
        // Proposed parameters are ignored and the defaults stay in force:
        // answer without PPS1. RFU table indices count as unsupported.
        frame[1] &= !PPS1_PRESENT;
    } else {
        frame[at] = (params.fi_idx << 4) | params.di_idx;
        at += 1;
    }
    if pps0_req & PPS2_PRESENT != 0 {
        frame[at] = params.spu;
        at += 1;
    }
    if pps0_req & PPS3_PRESENT != 0 {
        frame[at] = 0;
        at += 1;
    }
    frame[at] = xor_checksum(&frame[..at]);
    at += 1;

    if tx.len() < at {
        return Err(IccError::BufferTooShort {
            need: at,
            have: tx.len(),
        });
    }
    tx[..at].copy_from_slice(&frame[..at]);
    Ok(at)
}

/// Result of a well-formed PPS exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpsOutcome {
    /// The response echoes the request byte-for-byte; the parameters take
    /// effect
    Accepted { params: PpsParams, tx_len: usize },
    /// The card answered with different bytes (it strips PPS1 to keep the
    /// defaults); the response is still transmitted but the parameters in
    /// force do not change
    Declined { tx_len: usize },
}

/// Handle a complete PPS request and form the response
///
/// A malformed request yields `PpsInvalid` and nothing is sent.
pub fn negotiate(rx: &[u8], tx: &mut [u8]) -> IccResult<PpsOutcome> {
    let params = parse(rx)?;
    let tx_len = deparse(&params, rx[1], tx)?;
    if tx[..tx_len] == *rx {
        Ok(PpsOutcome::Accepted { params, tx_len })
    } else {
        Ok(PpsOutcome::Declined { tx_len })
    }
}
