//! T=0 transmission protocol data units
//!
//! A TPDU is the framed form of an APDU on the wire: the 4-byte command
//! header plus the P3 length byte, followed by data that arrives
//! interleaved with procedure bytes.

use crate::apdu::{ApduCommand, ApduData, Cla, CmdHeader, DATA_MAX};
use crate::error::{IccError, IccResult};

/// TPDU header length: CLA, INS, P1, P2, P3
pub const HDR_LEN: usize = 5;

/// Parse a TPDU: the 5-byte header and any data already received
pub fn parse(raw: &[u8]) -> IccResult<ApduCommand> {
    if raw.len() < HDR_LEN {
        return Err(IccError::TpduHdrTooShort(raw.len()));
    }
    if raw.len() > HDR_LEN + DATA_MAX {
        return Err(IccError::Param("TPDU longer than short form allows".into()));
    }
    Ok(ApduCommand {
        hdr: CmdHeader {
            cla: Cla::parse(raw[0]),
            ins: raw[1],
            p1: raw[2],
            p2: raw[3],
        },
        p3: Some(raw[4]),
        data: ApduData::from_slice(&raw[HDR_LEN..])?,
    })
}
