//! Electrical contact state and transmission parameters
//!
//! Covers the physical side of ISO/IEC 7816-3:2006: the contact lines the
//! interface device drives (clause 5.1.1) and the transmission parameter
//! tables negotiated over PPS (clause 8.3).

use bitflags::bitflags;

/// Number of unique transmission parameter configurations (4-bit index)
pub const TP_CONF_COUNT: usize = 16;

/// Table index holding the post-reset default parameters
pub const TP_CONF_DEFAULT: u8 = 1;

/// Fi (clock rate conversion integer) lookup, ISO 7816-3:2006 clause 8.3.
/// RFU entries are 0.
pub const FI: [u16; TP_CONF_COUNT] = [
    372, 372, 558, 744, 1116, 1488, 1860, 0, 0, 512, 768, 1024, 1536, 2048, 0, 0,
];

/// Di (baud rate adjustment integer) lookup, ISO 7816-3:2006 clause 8.3.
pub const DI: [u8; TP_CONF_COUNT] = [0, 1, 2, 4, 8, 16, 32, 64, 12, 20, 0, 0, 0, 0, 0, 0];

/// f(max) (maximum clock frequency, kHz) lookup, ISO 7816-3:2006 clause 8.3.
pub const FMAX: [u32; TP_CONF_COUNT] = [
    4000, 5000, 6000, 8000, 12000, 16000, 20000, 0, 0, 5000, 7500, 10000, 15000, 20000, 0, 0,
];

bitflags! {
    /// State of the electrical contacts as exchanged with the interface
    ///
    /// Each line has a level bit and a companion "valid" bit indicating
    /// whether the level could be observed (or should be driven). C4 and C8
    /// are reserved, C5 is ground. ISO/IEC 7816-3:2006 clause 5.1.1; C6 as
    /// SPU per ETSI TS 102 221.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContactState: u32 {
        /// VCC (C1) level
        const VCC = 1 << 1;
        /// VCC observable/driven
        const VALID_VCC = 1 << 2;
        /// RST (C2) level
        const RST = 1 << 3;
        /// RST observable/driven
        const VALID_RST = 1 << 4;
        /// CLK (C3) level
        const CLK = 1 << 5;
        /// CLK observable/driven
        const VALID_CLK = 1 << 6;
        /// SPU (C6) level
        const SPU = 1 << 11;
        /// SPU observable/driven
        const VALID_SPU = 1 << 12;
        /// I/O (C7) level
        const IO = 1 << 13;
        /// I/O observable/driven
        const VALID_IO = 1 << 14;

        /// All validity bits at once
        const VALID_ALL = Self::VALID_VCC.bits()
            | Self::VALID_RST.bits()
            | Self::VALID_CLK.bits()
            | Self::VALID_SPU.bits()
            | Self::VALID_IO.bits();
    }
}

impl ContactState {
    /// Contact state of a card operating normally after a completed reset,
    /// ISO/IEC 7816-3:2006 clause 6.2.1 figure 1.
    pub const READY: ContactState = ContactState::VCC
        .union(ContactState::RST)
        .union(ContactState::CLK)
        .union(ContactState::IO)
        .union(ContactState::VALID_ALL);
}

/// Transmission protocol configuration in effect on the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionParams {
    /// Elementary time unit: clock cycles per moment of a character frame,
    /// ISO 7816-3:2006 clause 7.1
    pub etu: u32,
    pub fi: u16,
    pub di: u8,
    /// kHz
    pub fmax: u32,
}

impl TransmissionParams {
    /// Parameters selected by a pair of table indices
    pub fn from_indices(fi_idx: u8, di_idx: u8) -> Self {
        let fi = FI[(fi_idx & 0x0F) as usize];
        let di = DI[(di_idx & 0x0F) as usize];
        let fmax = FMAX[(fi_idx & 0x0F) as usize];
        TransmissionParams {
            etu: etu(fi, di, fmax),
            fi,
            di,
            fmax,
        }
    }
}

impl Default for TransmissionParams {
    fn default() -> Self {
        Self::from_indices(TP_CONF_DEFAULT, TP_CONF_DEFAULT)
    }
}

/// Compute the elementary time unit, ISO/IEC 7816-3:2006 clause 7.1.
/// RFU table entries (value 0) yield an ETU of 0.
pub fn etu(fi: u16, di: u8, fmax: u32) -> u32 {
    if di == 0 || fmax == 0 {
        return 0;
    }
    u32::from(fi) / (u32::from(di) * fmax)
}

/// XOR of all bytes in a buffer, used for ATR TCK and PPS PCK check bytes,
/// ISO 7816-3:2006 clause 8.2.5
pub fn xor_checksum(buf: &[u8]) -> u8 {
    buf.iter().fold(0, |ck, b| ck ^ b)
}

/// Convert a hex nibble string (upper or lower case) into bytes
pub fn hex_to_bytes(hexstr: &str) -> crate::IccResult<Vec<u8>> {
    hex::decode(hexstr).map_err(|e| crate::IccError::Param(format!("bad hex string: {e}")))
}
