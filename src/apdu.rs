//! APDU command/response model and serialization
//!
//! Covers the class-byte decode of ISO 7816-4:2020 tables 2 and 3, the
//! status word model of section 5.6, the response serializer used by the
//! transport layer, and the response-chaining buffer drained by
//! GET RESPONSE.

use crate::error::{IccError, IccResult};

/// Maximum data field length; only short APDUs are supported
pub const DATA_MAX: usize = 256;

/// Command chaining control, CLA bit 5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaChain {
    Invalid,
    /// The command is the last or only command of a chain
    Last,
    /// The command is not the last command of a chain
    More,
}

/// Secure messaging indication, CLA bits 3-4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaSecureMessaging {
    Invalid,
    None,
    Proprietary,
    /// Standard SM, command header not processed
    StdHdrSkip,
    /// Standard SM, command header authenticated
    StdHdrAuth,
}

/// Broad class of the command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaKind {
    Invalid,
    Interindustry,
    Proprietary,
    Rfu,
}

/// Decoded class byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cla {
    pub raw: u8,
    pub chain: ClaChain,
    pub sm: ClaSecureMessaging,
    pub kind: ClaKind,
    /// Logical channel number, 0-19
    pub channel: u16,
}

impl Cla {
    /// Decode a raw class byte per ISO 7816-4:2020 tables 2 and 3. The
    /// `1010` and `1000` prefixes are proprietary for GSM/ETSI
    /// compatibility; prefix `001` is RFU.
    pub fn parse(raw: u8) -> Cla {
        if raw >> 5 == 0b000 {
            Cla {
                raw,
                chain: if raw & 0b0001_0000 == 0 {
                    ClaChain::Last
                } else {
                    ClaChain::More
                },
                sm: match (raw & 0b0000_1100) >> 2 {
                    0b00 => ClaSecureMessaging::None,
                    0b01 => ClaSecureMessaging::Proprietary,
                    0b10 => ClaSecureMessaging::StdHdrSkip,
                    _ => ClaSecureMessaging::StdHdrAuth,
                },
                kind: ClaKind::Interindustry,
                channel: u16::from(raw & 0b0000_0011),
            }
        } else if raw >> 6 == 0b01 {
            Cla {
                raw,
                chain: if raw & 0b0001_0000 == 0 {
                    ClaChain::Last
                } else {
                    ClaChain::More
                },
                sm: if raw & 0b0010_0000 == 0 {
                    ClaSecureMessaging::None
                } else {
                    ClaSecureMessaging::StdHdrSkip
                },
                kind: ClaKind::Interindustry,
                channel: u16::from(raw & 0b0000_1111) + 4,
            }
        } else if raw >> 5 == 0b001 {
            Cla {
                raw,
                chain: ClaChain::Invalid,
                sm: ClaSecureMessaging::Invalid,
                kind: ClaKind::Rfu,
                channel: 0,
            }
        } else if raw >> 4 == 0b1010 || raw >> 4 == 0b1000 {
            Cla {
                raw,
                chain: ClaChain::Invalid,
                sm: ClaSecureMessaging::Invalid,
                kind: ClaKind::Proprietary,
                channel: 0,
            }
        } else {
            Cla {
                raw,
                chain: ClaChain::Invalid,
                sm: ClaSecureMessaging::Invalid,
                kind: ClaKind::Invalid,
                channel: 0,
            }
        }
    }
}

/// First status byte, ISO 7816-4:2020 section 5.6 table 6
///
/// `ProcAckOne` and `ProcAckAll` are not real status bytes: they mark
/// procedure-byte responses and take values from the far end of the range
/// so they cannot collide with genuine SW1 values. The serializer turns
/// them into INS^0xFF and INS respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Sw1 {
    /// 9000: normal processing, no further qualification
    NormNone = 0x90,
    /// 61XX: SW2 holds the number of bytes still available
    NormBytesAvailable = 0x61,
    /// 62XX: warning, non-volatile memory unchanged
    WarnNvmUnchanged = 0x62,
    /// 63XX: warning, non-volatile memory possibly changed
    WarnNvmChanged = 0x63,
    /// 64XX: execution error, NVM unchanged
    ExecNvmUnchanged = 0x64,
    /// 65XX: execution error, NVM possibly changed
    ExecNvmChanged = 0x65,
    /// 66XX: security-related execution error
    ExecSecurity = 0x66,
    /// 67XX: wrong length
    CheckLength = 0x67,
    /// 68XX: functions in CLA not supported
    CheckClaFunction = 0x68,
    /// 69XX: command not allowed
    CheckCmdNotAllowed = 0x69,
    /// 6AXX: wrong P1-P2, details in SW2
    CheckP1P2Info = 0x6A,
    /// 6B00: wrong P1-P2
    CheckP1P2 = 0x6B,
    /// 6CXX: wrong Le, SW2 holds the exact length
    CheckLe = 0x6C,
    /// 6D00: INS not supported or invalid
    CheckIns = 0x6D,
    /// 6E00: CLA not supported
    CheckCla = 0x6E,
    /// 6F00: no precise diagnosis
    CheckUnknown = 0x6F,
    /// Procedure byte 0x60: request no action, ISO 7816-3:2006 10.3.3
    ProcNull = 0x60,
    /// Procedure byte acknowledging transfer of one more data byte
    ProcAckOne = 0xFE,
    /// Procedure byte acknowledging transfer of all remaining data
    ProcAckAll = 0xFF,
}

impl Sw1 {
    /// SW1 classes whose SW2 must be zero
    fn requires_zero_sw2(self) -> bool {
        matches!(
            self,
            Sw1::NormNone
                | Sw1::CheckP1P2
                | Sw1::CheckIns
                | Sw1::CheckCla
                | Sw1::CheckUnknown
                | Sw1::ProcNull
                | Sw1::ProcAckOne
                | Sw1::ProcAckAll
        )
    }

    fn is_procedure(self) -> bool {
        matches!(self, Sw1::ProcNull | Sw1::ProcAckOne | Sw1::ProcAckAll)
    }
}

/// Fixed-capacity data field of a command or response
#[derive(Clone, Copy)]
pub struct ApduData {
    buf: [u8; DATA_MAX],
    len: usize,
}

impl ApduData {
    pub fn new() -> Self {
        ApduData {
            buf: [0; DATA_MAX],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> IccResult<Self> {
        let mut out = ApduData::new();
        out.extend(data)?;
        Ok(out)
    }

    /// Append bytes, failing without modification if they do not fit
    pub fn extend(&mut self, data: &[u8]) -> IccResult<()> {
        if self.len + data.len() > DATA_MAX {
            return Err(IccError::BufferTooShort {
                need: self.len + data.len(),
                have: DATA_MAX,
            });
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Writable view of the full capacity; pair with `set_len`
    pub fn buf_mut(&mut self) -> &mut [u8; DATA_MAX] {
        &mut self.buf
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= DATA_MAX);
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ApduData {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ApduData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApduData({})", hex::encode(self.as_slice()))
    }
}

/// Command header as decoded from the wire
#[derive(Debug, Clone, Copy)]
pub struct CmdHeader {
    pub cla: Cla,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}

/// A parsed command: header, the TPDU length byte when framed over T=0,
/// and the accumulated data field
#[derive(Debug, Clone)]
pub struct ApduCommand {
    pub hdr: CmdHeader,
    /// P3 of the TPDU header; absent when the command came as a bare APDU
    pub p3: Option<u8>,
    pub data: ApduData,
}

impl ApduCommand {
    /// Parse a bare (unframed) short APDU: 4-byte header plus data
    pub fn parse(raw: &[u8]) -> IccResult<ApduCommand> {
        if raw.len() < 4 {
            return Err(IccError::ApduHdrTooShort(raw.len()));
        }
        if raw.len() > 4 + DATA_MAX {
            return Err(IccError::Param("APDU longer than short form allows".into()));
        }
        Ok(ApduCommand {
            hdr: CmdHeader {
                cla: Cla::parse(raw[0]),
                ins: raw[1],
                p1: raw[2],
                p2: raw[3],
            },
            p3: None,
            data: ApduData::from_slice(&raw[4..])?,
        })
    }
}

/// A response under construction or ready to serialize
#[derive(Debug, Clone)]
pub struct ApduResponse {
    pub sw1: Sw1,
    pub sw2: u8,
    /// Response data; for ACK procedure bytes this instead holds the
    /// expected incoming data length in `len`
    pub data: ApduData,
}

impl ApduResponse {
    /// A data-less status response
    pub fn status(sw1: Sw1, sw2: u8) -> Self {
        ApduResponse {
            sw1,
            sw2,
            data: ApduData::new(),
        }
    }

    /// A response carrying data
    pub fn with_data(sw1: Sw1, sw2: u8, data: &[u8]) -> IccResult<Self> {
        Ok(ApduResponse {
            sw1,
            sw2,
            data: ApduData::from_slice(data)?,
        })
    }

    /// An ACK-all procedure byte announcing `expected` bytes of data to come
    pub fn ack_all(expected: usize) -> Self {
        let mut res = ApduResponse::status(Sw1::ProcAckAll, 0);
        res.data.set_len(expected);
        res
    }

    /// Serialize into `out`, validating the SW1/SW2/data combination.
    /// Returns the number of bytes written: data + 2 status bytes, or a
    /// single byte for procedure responses.
    pub fn serialize(&self, out: &mut [u8], ins: u8) -> IccResult<usize> {
        if self.sw1.requires_zero_sw2() && self.sw2 != 0 {
            return Err(IccError::ApduResInvalid(format!(
                "SW1 {:?} demands SW2 = 0, got {:#04x}",
                self.sw1, self.sw2
            )));
        }
        if self.sw1.is_procedure() {
            if self.sw1 == Sw1::ProcNull && !self.data.is_empty() {
                return Err(IccError::ApduResInvalid(
                    "NULL procedure byte cannot carry data".into(),
                ));
            }
            if out.is_empty() {
                return Err(IccError::BufferTooShort { need: 1, have: 0 });
            }
            out[0] = match self.sw1 {
                Sw1::ProcNull => 0x60,
                Sw1::ProcAckAll => ins,
                _ => ins ^ 0xFF,
            };
            return Ok(1);
        }

        let need = self.data.len() + 2;
        if out.len() < need {
            return Err(IccError::BufferTooShort {
                need,
                have: out.len(),
            });
        }
        out[..self.data.len()].copy_from_slice(self.data.as_slice());
        out[self.data.len()] = self.sw1 as u8;
        out[self.data.len() + 1] = self.sw2;
        Ok(need)
    }
}

/// Response-chaining buffer
///
/// Holds the part of a logical response that did not fit into one short
/// APDU; GET RESPONSE drains it. Any other interindustry command resets it
/// so that chaining can never resume across unrelated commands.
#[derive(Debug, Clone)]
pub struct ResponseChain {
    buf: [u8; DATA_MAX],
    len: usize,
    offset: usize,
}

impl ResponseChain {
    pub fn new() -> Self {
        ResponseChain {
            buf: [0; DATA_MAX],
            len: 0,
            offset: 0,
        }
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.offset = 0;
    }

    /// Append bytes to the pending response. Fails without modification if
    /// the buffer cannot hold them.
    pub fn enqueue(&mut self, data: &[u8]) -> IccResult<()> {
        if self.len + data.len() > DATA_MAX {
            return Err(IccError::BufferTooShort {
                need: self.len + data.len(),
                have: DATA_MAX,
            });
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Remove exactly `out.len()` bytes in order. Fails without consuming
    /// anything if fewer remain.
    pub fn dequeue(&mut self, out: &mut [u8]) -> IccResult<()> {
        if out.len() > self.remaining() {
            return Err(IccError::BufferTooShort {
                need: out.len(),
                have: self.remaining(),
            });
        }
        out.copy_from_slice(&self.buf[self.offset..self.offset + out.len()]);
        self.offset += out.len();
        Ok(())
    }

    /// Bytes still queued
    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }
}

impl Default for ResponseChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cla_interindustry_first_range() {
        let cla = Cla::parse(0x00);
        assert_eq!(cla.kind, ClaKind::Interindustry);
        assert_eq!(cla.chain, ClaChain::Last);
        assert_eq!(cla.sm, ClaSecureMessaging::None);
        assert_eq!(cla.channel, 0);

        let cla = Cla::parse(0b0001_1110);
        assert_eq!(cla.chain, ClaChain::More);
        assert_eq!(cla.sm, ClaSecureMessaging::StdHdrAuth);
        assert_eq!(cla.channel, 2);
    }

    #[test]
    fn test_cla_interindustry_further_channels() {
        let cla = Cla::parse(0b0100_0011);
        assert_eq!(cla.kind, ClaKind::Interindustry);
        assert_eq!(cla.channel, 7);
        assert_eq!(cla.sm, ClaSecureMessaging::None);

        let cla = Cla::parse(0b0110_1111);
        assert_eq!(cla.channel, 19);
        assert_eq!(cla.sm, ClaSecureMessaging::StdHdrSkip);
    }

    #[test]
    fn test_cla_rfu_and_proprietary() {
        assert_eq!(Cla::parse(0b0010_0000).kind, ClaKind::Rfu);
        assert_eq!(Cla::parse(0xA0).kind, ClaKind::Proprietary);
        assert_eq!(Cla::parse(0x80).kind, ClaKind::Proprietary);
        assert_eq!(Cla::parse(0xFF).kind, ClaKind::Invalid);
        assert_eq!(Cla::parse(0xC0).kind, ClaKind::Invalid);
    }

    #[test]
    fn test_serialize_status_with_data() {
        let res = ApduResponse::with_data(Sw1::NormNone, 0, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 16];
        let len = res.serialize(&mut out, 0xB0).unwrap();
        assert_eq!(&out[..len], &[1, 2, 3, 0x90, 0x00]);
    }

    #[test]
    fn test_serialize_length_bounds() {
        // 1 <= serialized length <= data length + 2 for every valid response
        let res = ApduResponse::status(Sw1::CheckIns, 0);
        let mut out = [0u8; 260];
        let len = res.serialize(&mut out, 0x00).unwrap();
        assert_eq!(len, 2);

        let res = ApduResponse::ack_all(10);
        let len = res.serialize(&mut out, 0xA4).unwrap();
        assert_eq!(len, 1);
        assert_eq!(out[0], 0xA4);
    }

    #[test]
    fn test_serialize_procedure_bytes() {
        let mut out = [0u8; 4];
        let res = ApduResponse::status(Sw1::ProcAckOne, 0);
        res.serialize(&mut out, 0xB0).unwrap();
        assert_eq!(out[0], 0xB0 ^ 0xFF);

        let res = ApduResponse::status(Sw1::ProcNull, 0);
        res.serialize(&mut out, 0xB0).unwrap();
        assert_eq!(out[0], 0x60);
    }

    #[test]
    fn test_serialize_rejects_bad_sw2() {
        let res = ApduResponse::status(Sw1::NormNone, 0x12);
        let mut out = [0u8; 4];
        assert!(matches!(
            res.serialize(&mut out, 0),
            Err(IccError::ApduResInvalid(_))
        ));

        let res = ApduResponse::status(Sw1::ProcAckAll, 0x01);
        assert!(res.serialize(&mut out, 0).is_err());
    }

    #[test]
    fn test_serialize_overflow() {
        let res = ApduResponse::with_data(Sw1::NormNone, 0, &[0u8; 10]).unwrap();
        let mut out = [0u8; 5];
        assert!(matches!(
            res.serialize(&mut out, 0),
            Err(IccError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_apdu_parse() {
        let cmd = ApduCommand::parse(&[0x00, 0xA4, 0x00, 0x04, 0x3F, 0x00]).unwrap();
        assert_eq!(cmd.hdr.ins, 0xA4);
        assert_eq!(cmd.data.as_slice(), &[0x3F, 0x00]);
        assert!(cmd.p3.is_none());
        assert!(matches!(
            ApduCommand::parse(&[0x00, 0xA4]),
            Err(IccError::ApduHdrTooShort(2))
        ));
    }

    #[test]
    fn test_response_chain_order_and_offset() {
        let mut rc = ResponseChain::new();
        rc.enqueue(&[1, 2, 3, 4, 5]).unwrap();
        let mut out = [0u8; 2];
        rc.dequeue(&mut out).unwrap();
        assert_eq!(out, [1, 2]);
        assert_eq!(rc.remaining(), 3);
        let mut rest = [0u8; 3];
        rc.dequeue(&mut rest).unwrap();
        assert_eq!(rest, [3, 4, 5]);
        assert_eq!(rc.remaining(), 0);
    }

    #[test]
    fn test_response_chain_overflow_leaves_buffer() {
        let mut rc = ResponseChain::new();
        rc.enqueue(&[0xAA; 250]).unwrap();
        assert!(matches!(
            rc.enqueue(&[0; 7]),
            Err(IccError::BufferTooShort { .. })
        ));
        assert_eq!(rc.remaining(), 250);
        // Exactly filling it is fine
        rc.enqueue(&[0xBB; 6]).unwrap();
        assert_eq!(rc.remaining(), 256);
    }

    #[test]
    fn test_response_chain_short_dequeue() {
        let mut rc = ResponseChain::new();
        rc.enqueue(&[1, 2]).unwrap();
        let mut out = [0u8; 4];
        assert!(rc.dequeue(&mut out).is_err());
        // Failed dequeue consumed nothing
        assert_eq!(rc.remaining(), 2);
    }

    #[test]
    fn test_reset_clears() {
        let mut rc = ResponseChain::new();
        rc.enqueue(&[1, 2, 3]).unwrap();
        rc.reset();
        assert_eq!(rc.remaining(), 0);
        rc.enqueue(&[9]).unwrap();
        let mut out = [0u8; 1];
        rc.dequeue(&mut out).unwrap();
        assert_eq!(out[0], 9);
    }
}
