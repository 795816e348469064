//! Typed views over the on-disk card file system
//!
//! Files live inside contiguous serialized tree buffers (see `disk`); this
//! module knows the raw header layouts and parses a location in a tree
//! buffer into a typed `File`. Cross-references between files are
//! parent-relative byte offsets, never pointers, so trees can be moved and
//! serialized without rewriting anything.

use crate::error::{IccError, IccResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Length of MF/DF names
pub const NAME_LEN: usize = 16;

/// Maximum folder nesting: tree root, DF, EF
pub const DEPTH_MAX: usize = 3;

/// Registered application provider identifier length
pub const AID_RID_LEN: usize = 5;

/// Proprietary application identifier extension length
pub const AID_PIX_LEN: usize = 11;

/// Full application identifier length
pub const AID_LEN: usize = AID_RID_LEN + AID_PIX_LEN;

/// Files without an ID store this value
pub const ID_MISSING: u16 = 0;

/// Files without a short ID store this value
pub const SID_MISSING: u8 = 0;

/// Serialized item header: size u32, parent-relative offset u32, type u8,
/// life cycle status u8
pub const ITEM_HDR_LEN: usize = 10;

/// Serialized file header following the item header: id u16, sid u8
pub const FILE_HDR_LEN: usize = ITEM_HDR_LEN + 3;

/// Maximum length of an encoded file descriptor
pub const DESCR_LEN_MAX: usize = 5;

/// Byte order of the integers inside a serialized disk, stamped by the
/// disk magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the host, used when producing new disks
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endianness::Little => LittleEndian::read_u16(buf),
            Endianness::Big => BigEndian::read_u16(buf),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endianness::Little => LittleEndian::read_u32(buf),
            Endianness::Big => BigEndian::read_u32(buf),
        }
    }

    pub fn write_u16(self, buf: &mut [u8], val: u16) {
        match self {
            Endianness::Little => LittleEndian::write_u16(buf, val),
            Endianness::Big => BigEndian::write_u16(buf, val),
        }
    }

    pub fn write_u32(self, buf: &mut [u8], val: u32) {
        match self {
            Endianness::Little => LittleEndian::write_u32(buf, val),
            Endianness::Big => BigEndian::write_u32(buf, val),
        }
    }
}

/// Type of an item in the file system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemType {
    Invalid = 0,
    Mf = 1,
    Adf = 2,
    Df = 3,
    EfTransparent = 4,
    EfLinearFixed = 5,
    EfCyclic = 6,
    BerTlv = 7,
    Hex = 8,
    Ascii = 9,
}

impl ItemType {
    pub fn from_raw(raw: u8) -> ItemType {
        match raw {
            1 => ItemType::Mf,
            2 => ItemType::Adf,
            3 => ItemType::Df,
            4 => ItemType::EfTransparent,
            5 => ItemType::EfLinearFixed,
            6 => ItemType::EfCyclic,
            7 => ItemType::BerTlv,
            8 => ItemType::Hex,
            9 => ItemType::Ascii,
            _ => ItemType::Invalid,
        }
    }

    pub fn is_folder(self) -> bool {
        matches!(self, ItemType::Mf | ItemType::Adf | ItemType::Df)
    }

    pub fn is_ef(self) -> bool {
        matches!(
            self,
            ItemType::EfTransparent | ItemType::EfLinearFixed | ItemType::EfCyclic
        )
    }

    pub fn is_record_structured(self) -> bool {
        matches!(self, ItemType::EfLinearFixed | ItemType::EfCyclic)
    }

    /// Total serialized header length (item + file + type-specific)
    pub fn header_len(self) -> usize {
        FILE_HDR_LEN
            + match self {
                ItemType::Mf | ItemType::Df | ItemType::Adf => NAME_LEN,
                ItemType::EfLinearFixed | ItemType::EfCyclic => 1,
                _ => 0,
            }
    }
}

/// Life cycle status, ISO/IEC 7816-4:2020 section 7.4.10 table 15
///
/// Only the three states the command set can observe are representable;
/// creation and initialization never appear on a mounted read-only disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lcs {
    OperActivated = 0,
    OperDeactivated = 1,
    Terminated = 2,
}

impl Lcs {
    pub fn from_raw(raw: u8) -> IccResult<Lcs> {
        match raw {
            0 => Ok(Lcs::OperActivated),
            1 => Ok(Lcs::OperDeactivated),
            2 => Ok(Lcs::Terminated),
            _ => Err(IccError::Param(format!("unknown life cycle status {raw}"))),
        }
    }

    /// The LCS byte as encoded in FCP templates
    pub fn iso_byte(self) -> u8 {
        match self {
            Lcs::OperActivated => 0b0000_0101,
            Lcs::OperDeactivated => 0b0000_0100,
            Lcs::Terminated => 0b0000_1100,
        }
    }
}

/// Application identifier of an ADF, ETSI TS 101 220 / ISO 7816-4 12.3.4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aid {
    pub rid: [u8; AID_RID_LEN],
    pub pix: [u8; AID_PIX_LEN],
}

impl Aid {
    pub fn to_bytes(self) -> [u8; AID_LEN] {
        let mut out = [0u8; AID_LEN];
        out[..AID_RID_LEN].copy_from_slice(&self.rid);
        out[AID_RID_LEN..].copy_from_slice(&self.pix);
        out
    }
}

/// Parsed item header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    /// Total serialized size of the item including headers and, for
    /// folders, all descendants
    pub size: u32,
    /// Offset of this item from the top of its tree buffer
    pub offset_trel: u32,
    /// Offset from the parent's header to this item; 0 for a tree root
    pub offset_prel: u32,
    pub kind: ItemType,
    pub lcs: Lcs,
}

/// Type-specific header data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSpec {
    Mf { name: [u8; NAME_LEN] },
    Df { name: [u8; NAME_LEN] },
    Adf { aid: Aid },
    EfTransparent,
    EfLinearFixed { rcrd_size: u8 },
    EfCyclic { rcrd_size: u8 },
}

/// A file parsed out of a tree buffer
///
/// This is a small owned value; the file contents stay in the tree buffer
/// and are addressed through `data_offset`/`data_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct File {
    pub item: ItemHeader,
    /// File identifier, 0 when absent
    pub id: u16,
    /// Short file identifier, 0 when absent
    pub sid: u8,
    pub spec: FileSpec,
    /// Tree-relative offset of the file contents (past all headers)
    pub data_offset: u32,
    pub data_size: u32,
}

impl File {
    /// Parse the file at `offset` inside a tree buffer
    pub fn parse(buf: &[u8], offset: u32, endian: Endianness) -> IccResult<File> {
        let off = offset as usize;
        if buf.len() < off + FILE_HDR_LEN {
            return Err(IccError::Param(format!(
                "file header at offset {offset} runs past tree of {} bytes",
                buf.len()
            )));
        }
        let size = endian.read_u32(&buf[off..]);
        let offset_prel = endian.read_u32(&buf[off + 4..]);
        let kind = ItemType::from_raw(buf[off + 8]);
        let lcs = Lcs::from_raw(buf[off + 9])?;
        let id = endian.read_u16(&buf[off + 10..]);
        let sid = buf[off + 12];

        let hdr_len = kind.header_len();
        if (size as usize) < hdr_len || off + size as usize > buf.len() {
            return Err(IccError::Param(format!(
                "item at offset {offset} has inconsistent size {size}"
            )));
        }

        let spec_off = off + FILE_HDR_LEN;
        let spec = match kind {
            ItemType::Mf => {
                let mut name = [0u8; NAME_LEN];
                name.copy_from_slice(&buf[spec_off..spec_off + NAME_LEN]);
                FileSpec::Mf { name }
            }
            ItemType::Df => {
                let mut name = [0u8; NAME_LEN];
                name.copy_from_slice(&buf[spec_off..spec_off + NAME_LEN]);
                FileSpec::Df { name }
            }
            ItemType::Adf => {
                let mut rid = [0u8; AID_RID_LEN];
                let mut pix = [0u8; AID_PIX_LEN];
                rid.copy_from_slice(&buf[spec_off..spec_off + AID_RID_LEN]);
                pix.copy_from_slice(&buf[spec_off + AID_RID_LEN..spec_off + AID_LEN]);
                FileSpec::Adf {
                    aid: Aid { rid, pix },
                }
            }
            ItemType::EfTransparent => FileSpec::EfTransparent,
            ItemType::EfLinearFixed => FileSpec::EfLinearFixed {
                rcrd_size: buf[spec_off],
            },
            ItemType::EfCyclic => FileSpec::EfCyclic {
                rcrd_size: buf[spec_off],
            },
            _ => {
                return Err(IccError::Param(format!(
                    "item at offset {offset} is not a file (type {kind:?})"
                )))
            }
        };

        Ok(File {
            item: ItemHeader {
                size,
                offset_trel: offset,
                offset_prel,
                kind,
                lcs,
            },
            id,
            sid,
            spec,
            data_offset: offset + hdr_len as u32,
            data_size: size - hdr_len as u32,
        })
    }

    pub fn is_folder(&self) -> bool {
        self.item.kind.is_folder()
    }

    pub fn is_ef(&self) -> bool {
        self.item.kind.is_ef()
    }

    pub fn is_record_structured(&self) -> bool {
        self.item.kind.is_record_structured()
    }

    /// Record size of a record-structured EF
    pub fn rcrd_size(&self) -> Option<u8> {
        match self.spec {
            FileSpec::EfLinearFixed { rcrd_size } | FileSpec::EfCyclic { rcrd_size } => {
                Some(rcrd_size)
            }
            _ => None,
        }
    }

    /// MF/DF name, if this file has one
    pub fn name(&self) -> Option<&[u8; NAME_LEN]> {
        match &self.spec {
            FileSpec::Mf { name } | FileSpec::Df { name } => Some(name),
            _ => None,
        }
    }

    /// ADF application identifier, if this file has one
    pub fn aid(&self) -> Option<&Aid> {
        match &self.spec {
            FileSpec::Adf { aid } => Some(aid),
            _ => None,
        }
    }

    /// Life cycle status byte as used in the FCP template
    pub fn lcs_byte(&self) -> u8 {
        self.item.lcs.iso_byte()
    }

    /// File descriptor bytes for the FCP template, ISO 7816-4:2020
    /// section 7.4.5: descriptor byte, then for EFs the data coding byte,
    /// then for record EFs the maximum record size.
    pub fn descriptor(&self) -> Vec<u8> {
        const DATA_CODING: u8 = 0b0010_0001;
        match self.spec {
            FileSpec::Mf { .. } | FileSpec::Df { .. } | FileSpec::Adf { .. } => {
                vec![0b0011_1000]
            }
            FileSpec::EfTransparent => vec![0b0000_1001, DATA_CODING],
            FileSpec::EfLinearFixed { rcrd_size } => {
                vec![0b0000_1010, DATA_CODING, 0x00, rcrd_size]
            }
            FileSpec::EfCyclic { rcrd_size } => {
                vec![0b0000_1110, DATA_CODING, 0x00, rcrd_size]
            }
        }
    }
}

/// Whether a path is anchored at the MF or at the current DF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathAnchor {
    Mf,
    CurrentDf,
}

/// A selection path: a sequence of file IDs walked from the anchor
#[derive(Debug, Clone)]
pub struct Path {
    pub anchor: PathAnchor,
    pub ids: Vec<u16>,
}

/// Occurrence selector for selections that can match more than once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    First,
    Last,
    Next,
    Prev,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_type_roundtrip() {
        for raw in 0..=10u8 {
            let kind = ItemType::from_raw(raw);
            if raw >= 1 && raw <= 9 {
                assert_ne!(kind, ItemType::Invalid);
                assert_eq!(kind as u8, raw);
            } else {
                assert_eq!(kind, ItemType::Invalid);
            }
        }
    }

    #[test]
    fn test_header_lens() {
        assert_eq!(ItemType::Mf.header_len(), 29);
        assert_eq!(ItemType::Df.header_len(), 29);
        assert_eq!(ItemType::Adf.header_len(), 29);
        assert_eq!(ItemType::EfTransparent.header_len(), 13);
        assert_eq!(ItemType::EfLinearFixed.header_len(), 14);
        assert_eq!(ItemType::EfCyclic.header_len(), 14);
    }

    #[test]
    fn test_lcs_bytes() {
        assert_eq!(Lcs::OperActivated.iso_byte(), 0x05);
        assert_eq!(Lcs::OperDeactivated.iso_byte(), 0x04);
        assert_eq!(Lcs::Terminated.iso_byte(), 0x0C);
        assert!(Lcs::from_raw(3).is_err());
    }

    #[test]
    fn test_parse_transparent_ef() {
        let endian = Endianness::native();
        let data = [0xAA, 0xBB, 0xCC];
        let mut buf = vec![0u8; FILE_HDR_LEN];
        endian.write_u32(&mut buf[0..], (FILE_HDR_LEN + data.len()) as u32);
        endian.write_u32(&mut buf[4..], 0);
        buf[8] = ItemType::EfTransparent as u8;
        buf[9] = Lcs::OperActivated as u8;
        endian.write_u16(&mut buf[10..], 0x2F00);
        buf[12] = 0x02;
        buf.extend_from_slice(&data);

        let file = File::parse(&buf, 0, endian).unwrap();
        assert_eq!(file.id, 0x2F00);
        assert_eq!(file.sid, 0x02);
        assert_eq!(file.item.kind, ItemType::EfTransparent);
        assert_eq!(file.data_offset, FILE_HDR_LEN as u32);
        assert_eq!(file.data_size, 3);
        assert!(file.is_ef());
        assert!(!file.is_folder());
    }

    #[test]
    fn test_parse_truncated() {
        let buf = [0u8; 5];
        assert!(File::parse(&buf, 0, Endianness::native()).is_err());
    }

    #[test]
    fn test_descriptor_bytes() {
        let folder = FileSpec::Mf { name: [0; NAME_LEN] };
        let file = File {
            item: ItemHeader {
                size: 29,
                offset_trel: 0,
                offset_prel: 0,
                kind: ItemType::Mf,
                lcs: Lcs::OperActivated,
            },
            id: 0x3F00,
            sid: 0,
            spec: folder,
            data_offset: 29,
            data_size: 0,
        };
        assert_eq!(file.descriptor(), vec![0x38]);

        let mut ef = file;
        ef.spec = FileSpec::EfLinearFixed { rcrd_size: 4 };
        assert_eq!(ef.descriptor(), vec![0x0A, 0x21, 0x00, 0x04]);
        ef.spec = FileSpec::EfCyclic { rcrd_size: 4 };
        assert_eq!(ef.descriptor(), vec![0x0E, 0x21, 0x00, 0x04]);
        ef.spec = FileSpec::EfTransparent;
        assert_eq!(ef.descriptor(), vec![0x09, 0x21]);
    }
}
