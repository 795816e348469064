//! Interindustry APDU command handlers and instruction dispatch
//!
//! One handler slot per possible INS byte. Handlers are re-entered as the
//! T=0 data transfer progresses: the first call (procedure count 0) for a
//! command with a data field answers with an ACK procedure byte, later
//! calls see the accumulated data and finish with a terminal status word.
//! Protocol-level problems always come back as status words, never as
//! errors.

use crate::apdu::{ApduResponse, ApduCommand, ClaKind, Sw1, DATA_MAX};
use crate::card::Card;
use crate::error::{IccError, IccResult};
use crate::fs::{self, File, FileSpec, Occurrence, Path, PathAnchor};
use crate::tlv::{Encoder, Tag};

pub const INS_SELECT: u8 = 0xA4;
pub const INS_READ_BINARY: u8 = 0xB0;
pub const INS_READ_BINARY_BER: u8 = 0xB1;
pub const INS_READ_RECORD: u8 = 0xB2;
pub const INS_READ_RECORD_BER: u8 = 0xB3;
pub const INS_GET_RESPONSE: u8 = 0xC0;

/// Built-in handler for one instruction
pub type InsHandler = fn(&mut Card, &ApduCommand, u32) -> IccResult<ApduResponse>;

/// User hook that runs before the built-in interindustry handlers and for
/// every proprietary-class command. Returning `ApduUnhandled` passes the
/// command on.
pub type ProprietaryHandler =
    Box<dyn FnMut(&mut Card, &ApduCommand, u32) -> IccResult<ApduResponse> + Send>;

/// User hook that may amend a response after a handler produced it
pub type AmendHandler =
    Box<dyn FnMut(&mut Card, &ApduCommand, &mut ApduResponse, u32) -> IccResult<()> + Send>;

/// Dispatch table indexed by the INS byte
static INS_HANDLERS: [InsHandler; 256] = build_table();

const fn build_table() -> [InsHandler; 256] {
    let mut table = [handle_unknown as InsHandler; 256];
    table[INS_SELECT as usize] = handle_select;
    table[INS_READ_BINARY as usize] = handle_read_binary;
    table[INS_READ_BINARY_BER as usize] = handle_read_binary;
    table[INS_READ_RECORD as usize] = handle_read_record;
    table[INS_READ_RECORD_BER as usize] = handle_read_record;
    table[INS_GET_RESPONSE as usize] = handle_get_response;
    table
}

/// Route a command to the right handler
///
/// Invalid and RFU classes are rejected outright. For interindustry
/// commands the response chain is cleared first (unless this is GET
/// RESPONSE) so stale chained data can never leak into an unrelated
/// exchange, then a registered proprietary hook gets the first chance to
/// take the command over. Afterwards an optional amend hook may adjust
/// whatever response was produced.
pub fn demux(card: &mut Card, cmd: &ApduCommand, procedure_count: u32) -> IccResult<ApduResponse> {
    let mut res = match cmd.hdr.cla.kind {
        ClaKind::Invalid | ClaKind::Rfu => ApduResponse::status(Sw1::CheckCla, 0),
        ClaKind::Interindustry => {
            if cmd.hdr.ins != INS_GET_RESPONSE {
                card.rc.reset();
            }
            match run_proprietary(card, cmd, procedure_count)? {
                Some(res) => res,
                None => INS_HANDLERS[usize::from(cmd.hdr.ins)](card, cmd, procedure_count)?,
            }
        }
        ClaKind::Proprietary => match run_proprietary(card, cmd, procedure_count)? {
            Some(res) => res,
            None => ApduResponse::status(Sw1::CheckIns, 0),
        },
    };

    if let Some(mut amend) = card.take_amend_handler() {
        let outcome = amend(card, cmd, &mut res, procedure_count);
        card.put_amend_handler(amend);
        outcome?;
    }
    Ok(res)
}

fn run_proprietary(
    card: &mut Card,
    cmd: &ApduCommand,
    procedure_count: u32,
) -> IccResult<Option<ApduResponse>> {
    let Some(mut handler) = card.take_proprietary_handler() else {
        return Ok(None);
    };
    let outcome = handler(card, cmd, procedure_count);
    card.put_proprietary_handler(handler);
    match outcome {
        Ok(res) => Ok(Some(res)),
        Err(IccError::ApduUnhandled) => Ok(None),
        Err(other) => Err(other),
    }
}

/// Unknown or unsupported instruction
fn handle_unknown(_card: &mut Card, _cmd: &ApduCommand, _pc: u32) -> IccResult<ApduResponse> {
    Ok(ApduResponse::status(Sw1::CheckIns, 0))
}

// ---------------------------------------------------------------------------
// SELECT, ISO 7816-4:2020 section 11.2.2
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectMethod {
    MfDfEf,
    DfNested,
    EfNested,
    DfParent,
    DfName,
    MfPath,
    DfPath,
    DataObject,
    DataObjectParent,
    Rfu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateRequest {
    Fci,
    Fcp,
    Fmd,
    Tags,
    Absent,
}

fn handle_select(card: &mut Card, cmd: &ApduCommand, pc: u32) -> IccResult<ApduResponse> {
    // Upper half of P2 is RFU and must be zero.
    if cmd.hdr.p2 & 0b1111_0000 != 0 {
        return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x86));
    }
    let p3 = cmd.p3.unwrap_or(0);

    if pc == 0 {
        // No data should have arrived before the first procedure byte.
        if !cmd.data.is_empty() {
            return Ok(ApduResponse::status(Sw1::CheckUnknown, 0));
        }
        if p3 > 0 {
            return Ok(ApduResponse::ack_all(usize::from(p3)));
        }
    }
    if pc >= 1 && cmd.data.len() != usize::from(p3) {
        // ACK promised all Lc bytes but something else arrived.
        return Ok(ApduResponse::status(Sw1::CheckLength, 0x02));
    }

    let method = match cmd.hdr.p1 {
        0b0000_0000 => SelectMethod::MfDfEf,
        0b0000_0001 => SelectMethod::DfNested,
        0b0000_0010 => SelectMethod::EfNested,
        0b0000_0011 => SelectMethod::DfParent,
        0b0000_0100 => SelectMethod::DfName,
        0b0000_1000 => SelectMethod::MfPath,
        0b0000_1001 => SelectMethod::DfPath,
        0b0001_0000 => SelectMethod::DataObject,
        0b0001_0011 => SelectMethod::DataObjectParent,
        _ => SelectMethod::Rfu,
    };
    let occurrence = match cmd.hdr.p2 & 0b0000_0011 {
        0b00 => Occurrence::First,
        0b01 => Occurrence::Last,
        0b10 => Occurrence::Next,
        _ => Occurrence::Prev,
    };
    let template = match cmd.hdr.p2 & 0b0000_1100 {
        0b0000 => TemplateRequest::Fci,
        0b0100 => TemplateRequest::Fcp,
        0b1000 => {
            if matches!(method, SelectMethod::DataObject | SelectMethod::DataObjectParent) {
                TemplateRequest::Tags
            } else {
                TemplateRequest::Fmd
            }
        }
        _ => TemplateRequest::Absent,
    };

    // Selection by DO, parent, or nested-file reference is not implemented.
    if matches!(
        method,
        SelectMethod::Rfu
            | SelectMethod::DfNested
            | SelectMethod::EfNested
            | SelectMethod::DfParent
            | SelectMethod::DataObject
            | SelectMethod::DataObjectParent
    ) {
        return Ok(ApduResponse::status(Sw1::CheckP1P2, 0));
    }

    let data = cmd.data.as_slice();
    let selected = match method {
        SelectMethod::MfDfEf => {
            if data.len() != 2 {
                Err(IccError::Param("file ID must be exactly 2 bytes".into()))
            } else {
                let id = u16::from_be_bytes([data[0], data[1]]);
                card.va.select_by_id(&card.disk, id)
            }
        }
        SelectMethod::DfName => {
            // An AID-shaped payload with first-occurrence semantics selects
            // an application; anything else is treated as a DF name.
            if data.len() > fs::AID_LEN
                || data.len() < fs::AID_RID_LEN
                || occurrence != Occurrence::First
            {
                if data.is_empty() || occurrence != Occurrence::First {
                    Err(IccError::Param("unsupported DF name selection".into()))
                } else {
                    card.va.select_by_df_name(&card.disk, data)
                }
            } else {
                card.va
                    .select_adf(&card.disk, data, data.len() - fs::AID_RID_LEN)
            }
        }
        SelectMethod::MfPath | SelectMethod::DfPath => {
            if data.len() < 2 || data.len() % 2 != 0 || occurrence != Occurrence::First {
                Err(IccError::Param("malformed path".into()))
            } else {
                let path = Path {
                    anchor: if method == SelectMethod::MfPath {
                        PathAnchor::Mf
                    } else {
                        PathAnchor::CurrentDf
                    },
                    ids: data
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect(),
                };
                card.va.select_by_path(&card.disk, &path)
            }
        }
        _ => unreachable!("rejected above"),
    };

    match selected {
        Ok(()) => {}
        Err(IccError::FsNotFound) => {
            return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x82));
        }
        Err(_) => return Ok(ApduResponse::status(Sw1::CheckUnknown, 0)),
    }

    if template == TemplateRequest::Absent {
        return Ok(ApduResponse::status(Sw1::NormNone, 0));
    }

    let file = match card.va.cur_file {
        Some(file) => file,
        None => return Ok(ApduResponse::status(Sw1::CheckUnknown, 0)),
    };
    let mut out = [0u8; DATA_MAX];
    let len = match build_template(&file, template, &mut out) {
        Ok(len) if len <= 0xFF => len,
        _ => return Ok(ApduResponse::status(Sw1::CheckUnknown, 0)),
    };
    if card.rc.enqueue(&out[..len]).is_err() {
        return Ok(ApduResponse::status(Sw1::CheckUnknown, 0));
    }
    Ok(ApduResponse::status(Sw1::NormBytesAvailable, len as u8))
}

/// Encode the requested control template, returning its length. The
/// encoder runs twice: a dry run to size the output, then a real pass into
/// a buffer trimmed to exactly that size.
fn build_template(file: &File, template: TemplateRequest, out: &mut [u8]) -> IccResult<usize> {
    let mut dry = Encoder::dry_run();
    encode_template(&mut dry, file, template)?;
    let len = dry.len();
    if len > out.len() {
        return Err(IccError::BufferTooShort {
            need: len,
            have: out.len(),
        });
    }
    let mut enc = Encoder::new(&mut out[..len]);
    encode_template(&mut enc, file, template)?;
    Ok(len)
}

fn encode_template(enc: &mut Encoder, file: &File, template: TemplateRequest) -> IccResult<()> {
    // Control parameter tags, ISO 7816-4:2020 section 7.4.3 table 11.
    let tag_fcp = Tag::from_raw(0x62)?;
    let tag_fmd = Tag::from_raw(0x64)?;
    let tag_fci = Tag::from_raw(0x6F)?;

    match template {
        TemplateRequest::Fci => {
            let mut inner = enc.nested_start()?;
            encode_fcp(&mut inner, file, tag_fcp)?;
            encode_fmd(&mut inner, tag_fmd)?;
            enc.nested_end(inner)?;
            enc.header(tag_fci)?;
        }
        TemplateRequest::Fcp => encode_fcp(enc, file, tag_fcp)?,
        TemplateRequest::Fmd => encode_fmd(enc, tag_fmd)?,
        TemplateRequest::Tags | TemplateRequest::Absent => {
            return Err(IccError::Param("template not encodable".into()))
        }
    }
    Ok(())
}

fn encode_fcp(enc: &mut Encoder, file: &File, tag_fcp: Tag) -> IccResult<()> {
    let tag_size = Tag::from_raw(0x80)?;
    let tag_descr = Tag::from_raw(0x82)?;
    let tag_id = Tag::from_raw(0x83)?;
    let tag_name = Tag::from_raw(0x84)?;
    let tag_sid = Tag::from_raw(0x88)?;
    let tag_lcs = Tag::from_raw(0x8A)?;

    let mut fcp = enc.nested_start()?;
    fcp.data(&file.data_size.to_be_bytes())?;
    fcp.header(tag_size)?;
    if file.sid != fs::SID_MISSING {
        fcp.data(&[file.sid])?;
        fcp.header(tag_sid)?;
    }
    fcp.data(&[file.lcs_byte()])?;
    fcp.header(tag_lcs)?;
    match &file.spec {
        FileSpec::Mf { name } | FileSpec::Df { name } => {
            fcp.data(name)?;
            fcp.header(tag_name)?;
        }
        FileSpec::Adf { aid } => {
            fcp.data(&aid.pix)?;
            fcp.data(&aid.rid)?;
            fcp.header(tag_name)?;
        }
        _ => {}
    }
    if file.id != fs::ID_MISSING {
        fcp.data(&file.id.to_be_bytes())?;
        fcp.header(tag_id)?;
    }
    fcp.data(&file.descriptor())?;
    fcp.header(tag_descr)?;
    enc.nested_end(fcp)?;
    enc.header(tag_fcp)
}

fn encode_fmd(enc: &mut Encoder, tag_fmd: Tag) -> IccResult<()> {
    let inner = enc.nested_start()?;
    enc.nested_end(inner)?;
    enc.header(tag_fmd)
}

// ---------------------------------------------------------------------------
// READ BINARY, ISO 7816-4:2020 section 11.3.3
// ---------------------------------------------------------------------------

fn handle_read_binary(card: &mut Card, cmd: &ApduCommand, pc: u32) -> IccResult<ApduResponse> {
    // The odd instruction (B1) would carry a BER-TLV body; unsupported.
    if cmd.hdr.ins != INS_READ_BINARY {
        return Ok(ApduResponse::status(Sw1::CheckIns, 0));
    }
    if pc == 0 {
        // The command carries no data: ACK with 0 bytes expected.
        return Ok(ApduResponse::ack_all(0));
    }
    if !cmd.data.is_empty() {
        return Ok(ApduResponse::status(Sw1::CheckLength, 0x02));
    }

    let le = usize::from(cmd.p3.unwrap_or(0));
    let by_sid = cmd.hdr.p1 & 0b1000_0000 != 0;
    let (file, offset, sid) = if by_sid {
        if cmd.hdr.p1 & 0b0110_0000 != 0 {
            return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x86));
        }
        let sid = cmd.hdr.p1 & 0b0001_1111;
        let Some(tree_idx) = card.va.cur_tree else {
            return Ok(ApduResponse::status(Sw1::CheckCmdNotAllowed, 0x86));
        };
        let lookup = card
            .disk
            .tree(tree_idx)
            .and_then(|tree| tree.lookup_by_sid(sid));
        match lookup {
            Ok(file) => (file, usize::from(cmd.hdr.p2), Some(sid)),
            Err(IccError::FsNotFound) => {
                return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x82));
            }
            Err(_) => return Ok(ApduResponse::status(Sw1::CheckUnknown, 0)),
        }
    } else {
        // P1-P2 is a 15-bit offset into the current EF.
        let offset = (usize::from(cmd.hdr.p1 & 0b0111_1111) << 8) | usize::from(cmd.hdr.p2);
        match card.va.cur_ef {
            Some(file) => (file, offset, None),
            None => return Ok(ApduResponse::status(Sw1::CheckCmdNotAllowed, 0x86)),
        }
    };

    if file.item.kind != fs::ItemType::EfTransparent {
        return Ok(ApduResponse::status(Sw1::CheckCmdNotAllowed, 0x81));
    }
    if offset >= file.data_size as usize {
        return Ok(ApduResponse::status(Sw1::CheckP1P2, 0));
    }

    let tree_idx = card.va.cur_tree.unwrap_or(0);
    let tree = match card.disk.tree(tree_idx) {
        Ok(tree) => tree,
        Err(_) => return Ok(ApduResponse::status(Sw1::CheckUnknown, 0)),
    };
    let contents = tree.file_data(&file);
    let readable = contents.len() - offset;
    let read = readable.min(le);
    let mut res = if read < le {
        // End of file reached before Ne bytes.
        ApduResponse::with_data(Sw1::WarnNvmUnchanged, 0x82, &contents[offset..offset + read])?
    } else {
        ApduResponse::with_data(Sw1::NormNone, 0, &contents[offset..offset + read])?
    };

    if let Some(sid) = sid {
        // Commit the implicit selection now that the read is known good.
        if card.va.select_by_sid(&card.disk, sid).is_err() {
            res = ApduResponse::status(Sw1::CheckUnknown, 0);
        }
    }
    Ok(res)
}

// ---------------------------------------------------------------------------
// READ RECORD, ISO 7816-4:2020 section 11.4.3
// ---------------------------------------------------------------------------

fn handle_read_record(card: &mut Card, cmd: &ApduCommand, pc: u32) -> IccResult<ApduResponse> {
    // The odd instruction (B3) would carry a BER-TLV body; unsupported.
    if cmd.hdr.ins != INS_READ_RECORD {
        return Ok(ApduResponse::status(Sw1::CheckIns, 0));
    }
    if pc == 0 {
        return Ok(ApduResponse::ack_all(0));
    }
    if !cmd.data.is_empty() {
        return Ok(ApduResponse::status(Sw1::CheckLength, 0x02));
    }

    let target = cmd.hdr.p2 >> 3;
    let number_based = cmd.hdr.p2 & 0b0000_0100 != 0;
    // Record-handling data objects, selection by record ID, multi-file
    // search, and range reads are not supported.
    if cmd.hdr.p2 == 0b1111_1000 || !number_based || target == 0b1_1111 {
        return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x81));
    }
    if cmd.hdr.p2 & 0b0000_0011 != 0 {
        // Only "read record P1" is implemented, not P1-to-last or reverse.
        return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x81));
    }
    // P1 = 0 is reserved for special purposes, P1 = 0xFF is RFU.
    if cmd.hdr.p1 == 0x00 || cmd.hdr.p1 == 0xFF {
        return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x86));
    }

    let sid = if target == 0 { None } else { Some(target) };
    let file = match sid {
        None => match card.va.cur_ef {
            Some(file) => file,
            None => return Ok(ApduResponse::status(Sw1::CheckCmdNotAllowed, 0x86)),
        },
        Some(sid) => {
            let Some(tree_idx) = card.va.cur_tree else {
                return Ok(ApduResponse::status(Sw1::CheckCmdNotAllowed, 0x86));
            };
            let lookup = card
                .disk
                .tree(tree_idx)
                .and_then(|tree| tree.lookup_by_sid(sid));
            match lookup {
                Ok(file) => file,
                Err(IccError::FsNotFound) => {
                    return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x82));
                }
                Err(_) => return Ok(ApduResponse::status(Sw1::CheckUnknown, 0)),
            }
        }
    };

    if !file.is_record_structured() {
        return Ok(ApduResponse::status(Sw1::CheckCmdNotAllowed, 0x81));
    }
    let rcrd_idx = cmd.hdr.p1 - 1;
    let tree_idx = card.va.cur_tree.unwrap_or(0);
    let record = match card
        .disk
        .tree(tree_idx)
        .and_then(|tree| tree.record(&file, rcrd_idx))
    {
        Ok(record) => record.to_vec(),
        Err(IccError::FsNotFound) => {
            return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x83));
        }
        Err(_) => return Ok(ApduResponse::status(Sw1::CheckUnknown, 0)),
    };

    // Le must match the record length exactly; 6C tells the interface the
    // right value to retry with.
    if usize::from(cmd.p3.unwrap_or(0)) != record.len() {
        return Ok(ApduResponse::status(Sw1::CheckLe, record.len() as u8));
    }

    if let Some(sid) = sid {
        if card.va.select_by_sid(&card.disk, sid).is_err() {
            return Ok(ApduResponse::status(Sw1::CheckUnknown, 0));
        }
    }
    if card.va.select_record(&card.disk, rcrd_idx).is_err() {
        return Ok(ApduResponse::status(Sw1::CheckUnknown, 0));
    }
    ApduResponse::with_data(Sw1::NormNone, 0, &record)
}

// ---------------------------------------------------------------------------
// GET RESPONSE, ISO 7816-4:2020 section 11.4.5
// ---------------------------------------------------------------------------

fn handle_get_response(card: &mut Card, cmd: &ApduCommand, pc: u32) -> IccResult<ApduResponse> {
    if pc == 0 {
        return Ok(ApduResponse::ack_all(0));
    }
    if !cmd.data.is_empty() {
        // The command never has an Lc field, so data cannot legally arrive.
        return Ok(ApduResponse::status(Sw1::CheckLength, 0x01));
    }
    if cmd.hdr.p1 != 0 || cmd.hdr.p2 != 0 {
        return Ok(ApduResponse::status(Sw1::CheckP1P2Info, 0x86));
    }

    let requested = usize::from(cmd.p3.unwrap_or(0));
    if requested == 0 {
        return Ok(ApduResponse::status(Sw1::NormNone, 0));
    }

    let mut res = ApduResponse::status(Sw1::NormNone, 0);
    let out = &mut res.data.buf_mut()[..requested];
    if card.rc.dequeue(out).is_err() {
        // Fewer bytes queued than requested.
        return Ok(ApduResponse::status(Sw1::WarnNvmUnchanged, 0x82));
    }
    res.data.set_len(requested);
    let remaining = card.rc.remaining();
    if remaining > 0 {
        res.sw1 = Sw1::NormBytesAvailable;
        res.sw2 = remaining.min(0xFF) as u8;
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::ApduData;
    use crate::apdu::CmdHeader;
    use crate::apdu::Cla;
    use crate::testutil::{sample_card, sample_disk};
    use crate::tlv::Decoder;

    fn cmd(raw_hdr: [u8; 5], data: &[u8]) -> ApduCommand {
        ApduCommand {
            hdr: CmdHeader {
                cla: Cla::parse(raw_hdr[0]),
                ins: raw_hdr[1],
                p1: raw_hdr[2],
                p2: raw_hdr[3],
            },
            p3: Some(raw_hdr[4]),
            data: ApduData::from_slice(data).unwrap(),
        }
    }

    /// Run a command through both procedure phases like the transport does
    fn run(card: &mut Card, raw_hdr: [u8; 5], data: &[u8]) -> ApduResponse {
        let first = demux(card, &cmd(raw_hdr, &[]), 0).unwrap();
        if !matches!(first.sw1, Sw1::ProcAckAll | Sw1::ProcAckOne) {
            return first;
        }
        demux(card, &cmd(raw_hdr, data), 1).unwrap()
    }

    #[test]
    fn test_unknown_ins() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0x42, 0x00, 0x00, 0x00], &[]);
        assert_eq!(res.sw1, Sw1::CheckIns);
        assert_eq!(res.sw2, 0);
    }

    #[test]
    fn test_invalid_cla_rejected() {
        let mut card = sample_card();
        let res = demux(&mut card, &cmd([0xFF, 0xA4, 0x00, 0x00, 0x00], &[]), 0).unwrap();
        assert_eq!(res.sw1, Sw1::CheckCla);
    }

    #[test]
    fn test_select_requests_all_data_first() {
        let mut card = sample_card();
        let first = demux(&mut card, &cmd([0x00, 0xA4, 0x00, 0x04, 0x02], &[]), 0).unwrap();
        assert_eq!(first.sw1, Sw1::ProcAckAll);
        assert_eq!(first.data.len(), 2);
    }

    #[test]
    fn test_select_mf_no_template() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x3F, 0x00]);
        assert_eq!(res.sw1, Sw1::NormNone);
        assert!(res.data.is_empty());
        assert_eq!(card.va.cur_df.unwrap().id, 0x3F00);
    }

    #[test]
    fn test_select_fci_lands_in_response_chain() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xA4, 0x00, 0x00, 0x02], &[0x3F, 0x00]);
        assert_eq!(res.sw1, Sw1::NormBytesAvailable);
        let fci_len = usize::from(res.sw2);
        assert!(fci_len > 0);
        assert_eq!(card.rc.remaining(), fci_len);

        // Drain through GET RESPONSE and check the template structure
        let res = run(
            &mut card,
            [0x00, 0xC0, 0x00, 0x00, fci_len as u8],
            &[],
        );
        assert_eq!(res.sw1, Sw1::NormNone);
        let mut dec = Decoder::new(res.data.as_slice());
        let fci = dec.next_object().unwrap();
        assert_eq!(fci.tag, Tag::from_raw(0x6F).unwrap());
        let mut inner = dec.current_decoder().unwrap();
        // FMD template first, then FCP
        let fmd = inner.next_object().unwrap();
        assert_eq!(fmd.tag, Tag::from_raw(0x64).unwrap());
        assert_eq!(fmd.len, 0);
        let fcp = inner.next_object().unwrap();
        assert_eq!(fcp.tag, Tag::from_raw(0x62).unwrap());
        assert!(fcp.len > 0);

        // FCP contents: descriptor, ID, name, LCS, size (MF has no SID)
        let mut fcp_dec = inner.current_decoder().unwrap();
        let descr = fcp_dec.next_object().unwrap();
        assert_eq!(descr.tag, Tag::from_raw(0x82).unwrap());
        assert_eq!(fcp_dec.current_value().unwrap(), &[0x38]);
        let id = fcp_dec.next_object().unwrap();
        assert_eq!(id.tag, Tag::from_raw(0x83).unwrap());
        assert_eq!(fcp_dec.current_value().unwrap(), &[0x3F, 0x00]);
        let name = fcp_dec.next_object().unwrap();
        assert_eq!(name.tag, Tag::from_raw(0x84).unwrap());
        let lcs = fcp_dec.next_object().unwrap();
        assert_eq!(lcs.tag, Tag::from_raw(0x8A).unwrap());
        assert_eq!(fcp_dec.current_value().unwrap(), &[0x05]);
        let size = fcp_dec.next_object().unwrap();
        assert_eq!(size.tag, Tag::from_raw(0x80).unwrap());
    }

    #[test]
    fn test_select_missing_file() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xA4, 0x00, 0x00, 0x02], &[0x11, 0x22]);
        assert_eq!(res.sw1, Sw1::CheckP1P2Info);
        assert_eq!(res.sw2, 0x82);
    }

    #[test]
    fn test_select_rfu_p2_bits() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xA4, 0x00, 0x40, 0x02], &[0x3F, 0x00]);
        assert_eq!(res.sw1, Sw1::CheckP1P2Info);
        assert_eq!(res.sw2, 0x86);
    }

    #[test]
    fn test_select_unsupported_method() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xA4, 0x03, 0x00, 0x00], &[]);
        assert_eq!(res.sw1, Sw1::CheckP1P2);
    }

    #[test]
    fn test_select_adf_by_aid() {
        let mut card = sample_card();
        let res = run(
            &mut card,
            [0x00, 0xA4, 0x04, 0x0C, 0x07],
            &[0xA0, 0x00, 0x00, 0x00, 0x87, 0x10, 0x02],
        );
        assert_eq!(res.sw1, Sw1::NormNone);
        assert_eq!(card.va.cur_tree, Some(1));
    }

    #[test]
    fn test_select_by_path_from_mf() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xA4, 0x08, 0x0C, 0x02], &[0x2F, 0x00]);
        assert_eq!(res.sw1, Sw1::NormNone);
        assert_eq!(card.va.cur_ef.unwrap().id, 0x2F00);
    }

    #[test]
    fn test_select_wrong_lc() {
        let mut card = sample_card();
        let first = demux(&mut card, &cmd([0x00, 0xA4, 0x00, 0x00, 0x04], &[]), 0).unwrap();
        assert_eq!(first.sw1, Sw1::ProcAckAll);
        // Only two of the promised four bytes arrive
        let res = demux(&mut card, &cmd([0x00, 0xA4, 0x00, 0x00, 0x04], &[0x3F, 0x00]), 1).unwrap();
        assert_eq!(res.sw1, Sw1::CheckLength);
        assert_eq!(res.sw2, 0x02);
    }

    #[test]
    fn test_read_binary_current_ef() {
        let mut card = sample_card();
        run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x2F, 0x00]);
        let res = run(&mut card, [0x00, 0xB0, 0x00, 0x02, 0x04], &[]);
        assert_eq!(res.sw1, Sw1::NormNone);
        assert_eq!(res.data.as_slice(), &[0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn test_read_binary_past_eof_warns() {
        let mut card = sample_card();
        run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x2F, 0x00]);
        let res = run(&mut card, [0x00, 0xB0, 0x00, 0x08, 0x04], &[]);
        assert_eq!(res.sw1, Sw1::WarnNvmUnchanged);
        assert_eq!(res.sw2, 0x82);
        assert_eq!(res.data.as_slice(), &[0x08, 0x09]);
    }

    #[test]
    fn test_read_binary_offset_out_of_bounds() {
        let mut card = sample_card();
        run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x2F, 0x00]);
        let res = run(&mut card, [0x00, 0xB0, 0x00, 0x0A, 0x01], &[]);
        assert_eq!(res.sw1, Sw1::CheckP1P2);
    }

    #[test]
    fn test_read_binary_no_current_ef() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xB0, 0x00, 0x00, 0x04], &[]);
        assert_eq!(res.sw1, Sw1::CheckCmdNotAllowed);
        assert_eq!(res.sw2, 0x86);
    }

    #[test]
    fn test_read_binary_by_sid_selects_file() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xB0, 0x82, 0x00, 0x0A], &[]);
        assert_eq!(res.sw1, Sw1::NormNone);
        assert_eq!(res.data.len(), 10);
        assert_eq!(card.va.cur_ef.unwrap().id, 0x2F00);

        let res = run(&mut card, [0x00, 0xB0, 0x9F, 0x00, 0x01], &[]);
        assert_eq!(res.sw1, Sw1::CheckP1P2Info);
        assert_eq!(res.sw2, 0x82);
    }

    #[test]
    fn test_read_binary_record_file_incompatible() {
        let mut card = sample_card();
        run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x6F, 0x01]);
        let res = run(&mut card, [0x00, 0xB0, 0x00, 0x00, 0x04], &[]);
        assert_eq!(res.sw1, Sw1::CheckCmdNotAllowed);
        assert_eq!(res.sw2, 0x81);
    }

    #[test]
    fn test_read_binary_odd_ins_unsupported() {
        let mut card = sample_card();
        let res = demux(&mut card, &cmd([0x00, 0xB1, 0x00, 0x00, 0x00], &[]), 0).unwrap();
        assert_eq!(res.sw1, Sw1::CheckIns);
    }

    #[test]
    fn test_read_record_by_number() {
        let mut card = sample_card();
        run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x6F, 0x01]);
        let res = run(&mut card, [0x00, 0xB2, 0x02, 0x04, 0x04], &[]);
        assert_eq!(res.sw1, Sw1::NormNone);
        assert_eq!(res.data.as_slice(), &[0x20, 0x21, 0x22, 0x23]);
        assert_eq!(card.va.cur_rcrd, Some(1));
    }

    #[test]
    fn test_read_record_wrong_le_renegotiates() {
        let mut card = sample_card();
        run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x6F, 0x01]);
        let res = run(&mut card, [0x00, 0xB2, 0x01, 0x04, 0x09], &[]);
        assert_eq!(res.sw1, Sw1::CheckLe);
        assert_eq!(res.sw2, 0x04);
    }

    #[test]
    fn test_read_record_missing_record() {
        let mut card = sample_card();
        run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x6F, 0x01]);
        let res = run(&mut card, [0x00, 0xB2, 0x07, 0x04, 0x04], &[]);
        assert_eq!(res.sw1, Sw1::CheckP1P2Info);
        assert_eq!(res.sw2, 0x83);
    }

    #[test]
    fn test_read_record_by_sid() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xB2, 0x01, 0x03 << 3 | 0x04, 0x04], &[]);
        assert_eq!(res.sw1, Sw1::NormNone);
        assert_eq!(res.data.as_slice(), &[0x10, 0x11, 0x12, 0x13]);
        assert_eq!(card.va.cur_ef.unwrap().id, 0x6F01);
    }

    #[test]
    fn test_read_record_reserved_p1() {
        let mut card = sample_card();
        for p1 in [0x00, 0xFF] {
            let res = run(&mut card, [0x00, 0xB2, p1, 0x04, 0x04], &[]);
            assert_eq!(res.sw1, Sw1::CheckP1P2Info);
            assert_eq!(res.sw2, 0x86);
        }
    }

    #[test]
    fn test_read_record_unsupported_modes() {
        let mut card = sample_card();
        // Selection by record ID
        let res = run(&mut card, [0x00, 0xB2, 0x01, 0x00, 0x04], &[]);
        assert_eq!(res.sw1, Sw1::CheckP1P2Info);
        assert_eq!(res.sw2, 0x81);
        // Range read P1-to-last
        let res = run(&mut card, [0x00, 0xB2, 0x01, 0x05, 0x04], &[]);
        assert_eq!(res.sw2, 0x81);
        // Multi-file search
        let res = run(&mut card, [0x00, 0xB2, 0x01, 0xFC, 0x04], &[]);
        assert_eq!(res.sw2, 0x81);
    }

    #[test]
    fn test_get_response_drains_in_parts() {
        let mut card = sample_card();
        card.rc.enqueue(&[0xA1, 0xA2, 0xA3, 0xA4, 0xA5]).unwrap();
        let res = run(&mut card, [0x00, 0xC0, 0x00, 0x00, 0x03], &[]);
        assert_eq!(res.sw1, Sw1::NormBytesAvailable);
        assert_eq!(res.sw2, 2);
        assert_eq!(res.data.as_slice(), &[0xA1, 0xA2, 0xA3]);

        let res = run(&mut card, [0x00, 0xC0, 0x00, 0x00, 0x02], &[]);
        assert_eq!(res.sw1, Sw1::NormNone);
        assert_eq!(res.data.as_slice(), &[0xA4, 0xA5]);
    }

    #[test]
    fn test_get_response_underflow_warns() {
        let mut card = sample_card();
        card.rc.enqueue(&[0x01]).unwrap();
        let res = run(&mut card, [0x00, 0xC0, 0x00, 0x00, 0x05], &[]);
        assert_eq!(res.sw1, Sw1::WarnNvmUnchanged);
        assert_eq!(res.sw2, 0x82);
    }

    #[test]
    fn test_get_response_rfu_params() {
        let mut card = sample_card();
        let res = run(&mut card, [0x00, 0xC0, 0x01, 0x00, 0x01], &[]);
        assert_eq!(res.sw1, Sw1::CheckP1P2Info);
        assert_eq!(res.sw2, 0x86);
    }

    #[test]
    fn test_non_chained_command_clears_rc() {
        let mut card = sample_card();
        card.rc.enqueue(&[1, 2, 3]).unwrap();
        run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x3F, 0x00]);
        assert_eq!(card.rc.remaining(), 0);
    }

    #[test]
    fn test_proprietary_handler_gets_first_chance() {
        let disk = sample_disk();
        let mut card = Card::builder()
            .disk(disk)
            .proprietary_handler(|_card, cmd, _pc| {
                if cmd.hdr.ins == 0xEE {
                    return ApduResponse::with_data(Sw1::NormNone, 0, &[0x42]);
                }
                Err(IccError::ApduUnhandled)
            })
            .build()
            .unwrap();

        // Proprietary class routed to the hook
        let res = demux(&mut card, &cmd([0xA0, 0xEE, 0x00, 0x00, 0x00], &[]), 0).unwrap();
        assert_eq!(res.data.as_slice(), &[0x42]);

        // Unhandled proprietary-class command
        let res = demux(&mut card, &cmd([0xA0, 0x11, 0x00, 0x00, 0x00], &[]), 0).unwrap();
        assert_eq!(res.sw1, Sw1::CheckIns);

        // Interindustry commands still reach the built-in handlers
        let res = run(&mut card, [0x00, 0xA4, 0x00, 0x0C, 0x02], &[0x3F, 0x00]);
        assert_eq!(res.sw1, Sw1::NormNone);
    }

    #[test]
    fn test_amend_handler_can_rewrite_response() {
        let disk = sample_disk();
        let mut card = Card::builder()
            .disk(disk)
            .amend_handler(|_card, _cmd, res, _pc| {
                if res.sw1 == Sw1::CheckIns {
                    *res = ApduResponse::status(Sw1::CheckUnknown, 0);
                }
                Ok(())
            })
            .build()
            .unwrap();
        let res = run(&mut card, [0x00, 0x42, 0x00, 0x00, 0x00], &[]);
        assert_eq!(res.sw1, Sw1::CheckUnknown);
    }
}
