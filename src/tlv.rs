//! BER-TLV data object encoding and decoding
//!
//! Encoding runs backward: value bytes first, from the end of the buffer
//! toward the front, headers last. Constructed objects therefore never need
//! a length pre-pass; a nested encoder writes its children into the
//! remaining space and the parent folds the accumulated length into its own
//! header afterwards. A dry-run encoder (no buffer) computes the total
//! encoded length with the exact same call sequence.
//!
//! The decoder walks forward one object at a time and does not recurse;
//! callers build a sub-decoder over the current value to descend into
//! constructed objects.
//!
//! Tag and length forms per ISO/IEC 7816-4:2020 section 6.3: tags are at
//! most 3 bytes, length fields at most 5 bytes, and the indefinite and RFU
//! length forms are rejected.

use crate::error::{IccError, IccResult};
use byteorder::{BigEndian, ByteOrder};

/// Maximum encoded tag length in bytes
pub const TAG_LEN_MAX: usize = 3;

/// Maximum encoded length-field length in bytes (including the lead byte)
pub const LEN_LEN_MAX: usize = 5;

/// Tag class, ISO/IEC 7816-4:2020 table 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

/// A BER-TLV tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub class: TagClass,
    /// Constructed (true) or primitive (false)
    pub constructed: bool,
    pub number: u32,
}

impl Tag {
    /// Parse a raw tag value as it appears on the wire, e.g. `0x6F` for the
    /// FCI template or `0x5F2D` for a two-byte tag. Leading zero bytes of
    /// the `u32` are ignored.
    pub fn from_raw(raw: u32) -> IccResult<Tag> {
        let be = raw.to_be_bytes();
        let skip = be.iter().take_while(|&&b| b == 0).count().min(3);
        let (tag, used) = parse_tag(&be[skip..])?;
        if skip + used != 4 {
            return Err(IccError::Param(format!("trailing bytes in raw tag {raw:#x}")));
        }
        Ok(tag)
    }

    /// Serialized length of this tag in bytes
    fn encoded_len(&self) -> IccResult<usize> {
        if self.number <= 30 {
            Ok(1)
        } else if self.number < (1 << 7) {
            Ok(2)
        } else if self.number < (1 << 14) {
            Ok(3)
        } else {
            Err(IccError::Param(format!("tag number {} too large", self.number)))
        }
    }

    /// Write the tag into `out`, returning the number of bytes used
    fn encode(&self, out: &mut [u8; TAG_LEN_MAX]) -> IccResult<usize> {
        let mut b0 = match self.class {
            TagClass::Universal => 0b0000_0000,
            TagClass::Application => 0b0100_0000,
            TagClass::ContextSpecific => 0b1000_0000,
            TagClass::Private => 0b1100_0000,
        };
        if self.constructed {
            b0 |= 0b0010_0000;
        }
        let len = self.encoded_len()?;
        if len == 1 {
            out[0] = b0 | (self.number as u8);
        } else {
            out[0] = b0 | 0b0001_1111;
            // 7-bit groups, most significant first, continuation bit on all
            // but the last byte.
            let mut idx = 1;
            if len == 3 {
                out[idx] = 0b1000_0000 | ((self.number >> 7) & 0x7F) as u8;
                idx += 1;
            }
            out[idx] = (self.number & 0x7F) as u8;
        }
        Ok(len)
    }
}

/// Parse a tag from the front of `buf`, returning the tag and its length
fn parse_tag(buf: &[u8]) -> IccResult<(Tag, usize)> {
    if buf.is_empty() {
        return Err(IccError::TlvEnd);
    }
    let b0 = buf[0];
    let class = match b0 >> 6 {
        0b00 => TagClass::Universal,
        0b01 => TagClass::Application,
        0b10 => TagClass::ContextSpecific,
        _ => TagClass::Private,
    };
    let constructed = b0 & 0b0010_0000 != 0;

    if b0 & 0b0001_1111 != 0b0001_1111 {
        return Ok((
            Tag {
                class,
                constructed,
                number: u32::from(b0 & 0b0001_1111),
            },
            1,
        ));
    }

    // Long form: continuation bit 8 set on every byte except the last.
    let mut number = 0u32;
    for idx in 1..TAG_LEN_MAX {
        let b = *buf.get(idx).ok_or(IccError::TlvEnd)?;
        number = (number << 7) | u32::from(b & 0x7F);
        if b & 0b1000_0000 == 0 {
            return Ok((
                Tag {
                    class,
                    constructed,
                    number,
                },
                idx + 1,
            ));
        }
    }
    Err(IccError::Param("tag longer than 3 bytes".into()))
}

/// Parse a length field from the front of `buf`, returning the value length
/// and the length-field length. Indefinite (`0x80`) and RFU (`0xFF`) lead
/// bytes are rejected.
fn parse_len(buf: &[u8]) -> IccResult<(u32, usize)> {
    let b0 = *buf.first().ok_or(IccError::TlvEnd)?;
    if b0 & 0b1000_0000 == 0 {
        return Ok((u32::from(b0), 1));
    }
    let n = (b0 & 0b0111_1111) as usize;
    match n {
        0 => Err(IccError::Param("indefinite length form unsupported".into())),
        0x7F => Err(IccError::Param("RFU length form".into())),
        1..=4 => {
            if buf.len() < 1 + n {
                return Err(IccError::TlvEnd);
            }
            Ok((BigEndian::read_uint(&buf[1..1 + n], n) as u32, 1 + n))
        }
        _ => Err(IccError::Param(format!("length field of {n} bytes too long"))),
    }
}

/// Write a length field into `out`, returning the number of bytes used
fn encode_len(val: u32, out: &mut [u8; LEN_LEN_MAX]) -> usize {
    if val <= 127 {
        out[0] = val as u8;
        return 1;
    }
    let n = (4 - (val.leading_zeros() / 8)) as usize;
    out[0] = 0b1000_0000 | n as u8;
    BigEndian::write_uint(&mut out[1..1 + n], u64::from(val), n);
    1 + n
}

/// One parsed tag-length pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv {
    pub tag: Tag,
    /// Length of the value field in bytes
    pub len: u32,
}

/// Forward-walking BER-TLV decoder
///
/// `next` advances over one object at a time; `current_value` exposes the
/// value bytes of the last object returned, and `current_decoder` wraps them
/// in a fresh decoder for descending into constructed objects.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    offset: usize,
    cur: Option<Tlv>,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder {
            buf,
            offset: 0,
            cur: None,
        }
    }

    /// Advance to the next object and return its tag-length pair.
    /// Returns `TlvEnd` once the buffer is exhausted.
    pub fn next_object(&mut self) -> IccResult<Tlv> {
        if self.offset >= self.buf.len() {
            return Err(IccError::TlvEnd);
        }
        let rest = &self.buf[self.offset..];
        let (tag, tag_len) = parse_tag(rest)?;
        let (len, len_len) = parse_len(&rest[tag_len..])?;
        let hdr_len = tag_len + len_len;
        if rest.len() < hdr_len + len as usize {
            return Err(IccError::TlvEnd);
        }
        let tlv = Tlv { tag, len };
        self.offset += hdr_len + len as usize;
        self.cur = Some(tlv);
        Ok(tlv)
    }

    /// Value bytes of the object most recently returned by `next_object`
    pub fn current_value(&self) -> IccResult<&'a [u8]> {
        let cur = self.cur.ok_or_else(|| IccError::Param("no current object".into()))?;
        Ok(&self.buf[self.offset - cur.len as usize..self.offset])
    }

    /// A sub-decoder over the current object's value
    pub fn current_decoder(&self) -> IccResult<Decoder<'a>> {
        Ok(Decoder::new(self.current_value()?))
    }
}

/// Backward-writing BER-TLV encoder
///
/// Invariant: the write position is `capacity - len`, i.e. everything
/// written so far occupies the tail of the buffer. `header` consumes the
/// value length accumulated since the previous header and resets it.
#[derive(Debug)]
pub struct Encoder<'a> {
    /// None while dry-running or while a nested encoder holds the buffer
    buf: Option<&'a mut [u8]>,
    dry_run: bool,
    capacity: usize,
    len: usize,
    /// Length of the value of the object currently being encoded
    len_val: usize,
}

impl<'a> Encoder<'a> {
    /// Encoder writing into the tail of `buf`
    pub fn new(buf: &'a mut [u8]) -> Self {
        let capacity = buf.len();
        Encoder {
            buf: Some(buf),
            dry_run: false,
            capacity,
            len: 0,
            len_val: 0,
        }
    }

    /// Encoder that computes lengths without writing anywhere
    pub fn dry_run() -> Self {
        Encoder {
            buf: None,
            dry_run: true,
            capacity: u32::MAX as usize,
            len: 0,
            len_val: 0,
        }
    }

    /// Occupied length so far
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn reserve(&mut self, n: usize) -> IccResult<usize> {
        let free = self.capacity - self.len;
        if n > free {
            return Err(IccError::BufferTooShort {
                need: n,
                have: free,
            });
        }
        if !self.dry_run && self.buf.is_none() {
            return Err(IccError::Internal("encode into parent while nested encoder open".into()));
        }
        Ok(self.capacity - self.len - n)
    }

    /// Write value bytes, accounted toward the next `header` call
    pub fn data(&mut self, data: &[u8]) -> IccResult<()> {
        let at = self.reserve(data.len())?;
        if let Some(buf) = self.buf.as_deref_mut() {
            buf[at..at + data.len()].copy_from_slice(data);
        }
        self.len += data.len();
        self.len_val += data.len();
        Ok(())
    }

    /// Write the tag and computed length for the value accumulated since the
    /// last header, closing one object
    pub fn header(&mut self, tag: Tag) -> IccResult<()> {
        let mut len_raw = [0u8; LEN_LEN_MAX];
        let len_len = encode_len(self.len_val as u32, &mut len_raw);
        let mut tag_raw = [0u8; TAG_LEN_MAX];
        let tag_len = tag.encode(&mut tag_raw)?;

        let at = self.reserve(len_len + tag_len)?;
        if let Some(buf) = self.buf.as_deref_mut() {
            buf[at..at + tag_len].copy_from_slice(&tag_raw[..tag_len]);
            buf[at + tag_len..at + tag_len + len_len].copy_from_slice(&len_raw[..len_len]);
        }
        self.len += tag_len + len_len;
        self.len_val = 0;
        Ok(())
    }

    /// Begin a nested (constructed) object. The child encoder takes over the
    /// remaining buffer space; no writes may go to this encoder until
    /// `nested_end`.
    pub fn nested_start(&mut self) -> IccResult<Encoder<'a>> {
        if self.len_val != 0 {
            return Err(IccError::Internal("nested encode with unclosed value".into()));
        }
        Ok(Encoder {
            buf: self.buf.take(),
            dry_run: self.dry_run,
            capacity: self.capacity - self.len,
            len: 0,
            len_val: 0,
        })
    }

    /// Fold a finished nested encoder back into this one; its accumulated
    /// bytes become the pending value for this encoder's next `header`
    pub fn nested_end(&mut self, child: Encoder<'a>) -> IccResult<()> {
        if self.len_val != 0 {
            return Err(IccError::Internal("nested end with unclosed value".into()));
        }
        self.buf = child.buf;
        self.len += child.len;
        self.len_val = child.len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(raw: u32) -> Tag {
        Tag::from_raw(raw).unwrap()
    }

    #[test]
    fn test_tag_from_raw_short() {
        let t = tag(0x6F);
        assert_eq!(t.class, TagClass::Application);
        assert!(t.constructed);
        assert_eq!(t.number, 15);

        let t = tag(0x82);
        assert_eq!(t.class, TagClass::ContextSpecific);
        assert!(!t.constructed);
        assert_eq!(t.number, 2);
    }

    #[test]
    fn test_tag_from_raw_long() {
        // 0x5F2D: application class, primitive, long form number 0x2D
        let t = tag(0x5F2D);
        assert_eq!(t.class, TagClass::Application);
        assert!(!t.constructed);
        assert_eq!(t.number, 0x2D);
    }

    #[test]
    fn test_tag_encode_forms() {
        // Numbers 0..=30 encode to one byte
        for num in 0..=30u32 {
            let t = Tag {
                class: TagClass::ContextSpecific,
                constructed: false,
                number: num,
            };
            let mut out = [0u8; TAG_LEN_MAX];
            assert_eq!(t.encode(&mut out).unwrap(), 1);
            assert_eq!(out[0] & 0b0001_1111, num as u8);
        }
        // 31 and up use the long form with all-ones marker
        let t = Tag {
            class: TagClass::ContextSpecific,
            constructed: false,
            number: 31,
        };
        let mut out = [0u8; TAG_LEN_MAX];
        assert_eq!(t.encode(&mut out).unwrap(), 2);
        assert_eq!(out[0] & 0b0001_1111, 0b0001_1111);
        assert_eq!(out[1], 31);

        // Two payload bytes: continuation bit on all but the last
        let t = Tag {
            class: TagClass::ContextSpecific,
            constructed: false,
            number: 0x1234,
        };
        assert_eq!(t.encode(&mut out).unwrap(), 3);
        assert_ne!(out[1] & 0b1000_0000, 0);
        assert_eq!(out[2] & 0b1000_0000, 0);

        let t = Tag {
            class: TagClass::ContextSpecific,
            constructed: false,
            number: 1 << 14,
        };
        assert!(t.encode(&mut out).is_err());
    }

    #[test]
    fn test_len_forms() {
        let mut out = [0u8; LEN_LEN_MAX];
        assert_eq!(encode_len(0, &mut out), 1);
        assert_eq!(out[0], 0);
        assert_eq!(encode_len(127, &mut out), 1);
        assert_eq!(out[0], 127);
        assert_eq!(encode_len(128, &mut out), 2);
        assert_eq!(&out[..2], &[0x81, 0x80]);
        assert_eq!(encode_len(0x1234, &mut out), 3);
        assert_eq!(&out[..3], &[0x82, 0x12, 0x34]);

        assert_eq!(parse_len(&[0x7F]).unwrap(), (127, 1));
        assert_eq!(parse_len(&[0x81, 0x80]).unwrap(), (128, 2));
        assert_eq!(parse_len(&[0x82, 0x12, 0x34]).unwrap(), (0x1234, 3));
        assert!(parse_len(&[0x80]).is_err()); // indefinite
        assert!(parse_len(&[0xFF]).is_err()); // RFU
    }

    #[test]
    fn test_encode_decode_roundtrip_flat() {
        let mut buf = [0u8; 64];
        let mut enc = Encoder::new(&mut buf);
        enc.data(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        enc.header(tag(0x83)).unwrap();
        let len = enc.len();

        let encoded = &buf[64 - len..];
        let mut dec = Decoder::new(encoded);
        let tlv = dec.next_object().unwrap();
        assert_eq!(tlv.tag, tag(0x83));
        assert_eq!(tlv.len, 4);
        assert_eq!(dec.current_value().unwrap(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(matches!(dec.next_object(), Err(IccError::TlvEnd)));
    }

    #[test]
    fn test_encode_nested_matches_manual_layout() {
        // {6F {83 "3F00"} {88 "01"}}
        let mut buf = [0u8; 64];
        let mut enc = Encoder::new(&mut buf);
        let mut inner = enc.nested_start().unwrap();
        inner.data(&[0x01]).unwrap();
        inner.header(tag(0x88)).unwrap();
        inner.data(&[0x3F, 0x00]).unwrap();
        inner.header(tag(0x83)).unwrap();
        enc.nested_end(inner).unwrap();
        enc.header(tag(0x6F)).unwrap();
        let len = enc.len();

        let encoded = &buf[64 - len..];
        assert_eq!(
            encoded,
            &[0x6F, 0x07, 0x83, 0x02, 0x3F, 0x00, 0x88, 0x01, 0x01]
        );

        // Descend with a sub-decoder
        let mut dec = Decoder::new(encoded);
        let outer = dec.next_object().unwrap();
        assert!(outer.tag.constructed);
        let mut sub = dec.current_decoder().unwrap();
        let first = sub.next_object().unwrap();
        assert_eq!(first.tag, tag(0x83));
        assert_eq!(sub.current_value().unwrap(), &[0x3F, 0x00]);
        let second = sub.next_object().unwrap();
        assert_eq!(second.tag, tag(0x88));
        assert_eq!(sub.current_value().unwrap(), &[0x01]);
    }

    #[test]
    fn test_dry_run_len_matches_real_len() {
        fn build(enc: &mut Encoder<'_>) -> IccResult<()> {
            let mut inner = enc.nested_start()?;
            inner.data(&[0u8; 150])?;
            inner.header(Tag::from_raw(0x80)?)?;
            enc.nested_end(inner)?;
            enc.header(Tag::from_raw(0x62)?)?;
            Ok(())
        }

        let mut dry = Encoder::dry_run();
        build(&mut dry).unwrap();

        let mut buf = vec![0u8; dry.len()];
        let mut real = Encoder::new(&mut buf);
        build(&mut real).unwrap();
        assert_eq!(real.len(), dry.len());
        // 150 bytes forces the long length form on both levels
        assert_eq!(buf[0], 0x62);
        assert_eq!(buf[1], 0x81);
    }

    #[test]
    fn test_encoder_overflow() {
        let mut buf = [0u8; 3];
        let mut enc = Encoder::new(&mut buf);
        assert!(matches!(
            enc.data(&[0u8; 10]),
            Err(IccError::BufferTooShort { .. })
        ));
        // A failed write leaves the encoder untouched
        assert_eq!(enc.len(), 0);
        enc.data(&[1]).unwrap();
        enc.header(tag(0x80)).unwrap();
        assert_eq!(enc.len(), 3);
    }

    #[test]
    fn test_decoder_truncated_value() {
        // Header promises 4 bytes, only 2 present
        let raw = [0x83, 0x04, 0x3F, 0x00];
        let mut dec = Decoder::new(&raw);
        assert!(matches!(dec.next_object(), Err(IccError::TlvEnd)));
    }
}
