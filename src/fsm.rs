//! Transport state machine, ISO/IEC 7816-3:2006 clause 6
//!
//! Drives the card from power application through reset, ATR, optional PPS
//! negotiation, and the T=0 command exchange. Every tick consumes the
//! observed contact state and the bytes received since the last tick, and
//! leaves behind the bytes to transmit plus the number of bytes the card
//! wants next. Ticks never block; pacing is the caller's problem.
//!
//! Dropping the contacts out of the ready state from anywhere but `Off`
//! deactivates the card. Internal errors (a handler failing for anything
//! other than a protocol condition) do the same, which is indistinguishable
//! from a power cycle for the interface.

use crate::apdu::{Sw1, DATA_MAX};
use crate::card::Card;
use crate::handlers;
use crate::pps::{self, PpsOutcome};
use crate::transmission::{ContactState, TransmissionParams};
use crate::{atr, tpdu};

/// Transport states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsmState {
    /// No power applied, or deactivated
    #[default]
    Off,
    /// VCC applied, waiting for clock and I/O
    Activation,
    /// Activated, RST still low
    ResetCold,
    /// RST went high; ATR requested but not yet emitted
    AtrReq,
    /// ATR emitted, waiting for the first byte from the interface
    AtrRes,
    /// RST dropped while operating; a restart follows when it rises again
    ResetWarm,
    /// Accumulating a PPS request
    PpsReq,
    /// Accumulating a 5-byte TPDU header
    CmdWait,
    /// Running the handler to produce a procedure byte or status
    CmdProcedure,
    /// Accumulating the command data announced by an ACK
    CmdData,
}

/// Upper bound on procedure bytes per command; a command that still is not
/// done after this many data phases is dropped
const PROCEDURE_COUNT_MAX: u32 = 4;

pub(crate) fn tick(card: &mut Card) {
    match card.fsm_state {
        FsmState::Off => off(card),
        FsmState::Activation => activation(card),
        FsmState::ResetCold => reset_cold(card),
        FsmState::AtrReq => atr_req(card),
        FsmState::AtrRes => atr_res(card),
        FsmState::ResetWarm => reset_warm(card),
        FsmState::PpsReq => pps_req(card),
        FsmState::CmdWait => cmd_wait(card),
        FsmState::CmdProcedure => cmd_procedure(card),
        FsmState::CmdData => cmd_data(card),
    }
}

fn deactivate(card: &mut Card) {
    if card.fsm_state != FsmState::Off {
        log::debug!("contacts dropped in {:?}, deactivating", card.fsm_state);
    }
    card.fsm_state = FsmState::Off;
    card.tx.clear();
    card.rx_expected = 0;
}

/// Contact gate for every state reached after a completed reset. Returns
/// true when the card can keep operating. RST dropping on its own starts
/// a warm reset (ISO/IEC 7816-3:2006 clause 6.2.3); losing anything else
/// deactivates.
fn operating_contacts(card: &mut Card) -> bool {
    if card.contacts_in == ContactState::READY {
        return true;
    }
    if card.contacts_in == ContactState::READY.difference(ContactState::RST) {
        log::debug!("RST dropped in {:?}, warm reset", card.fsm_state);
        card.fsm_state = FsmState::ResetWarm;
        card.tx.clear();
        card.rx_expected = 0;
    } else {
        deactivate(card);
    }
    false
}

fn off(card: &mut Card) {
    if card.contacts_in == ContactState::VCC | ContactState::VALID_ALL {
        card.fsm_state = FsmState::Activation;
    }
    card.tx.clear();
    card.rx_expected = 0;
}

fn activation(card: &mut Card) {
    let activated = ContactState::VCC | ContactState::IO | ContactState::CLK | ContactState::VALID_ALL;
    if card.contacts_in == activated {
        card.fsm_state = FsmState::ResetCold;
    } else if card
        .contacts_in
        .intersects(ContactState::VCC | ContactState::VALID_VCC)
    {
        // Interface keeps VCC up while it raises the other lines.
    } else {
        deactivate(card);
        return;
    }
    card.tx.clear();
    card.rx_expected = 0;
}

fn reset_cold(card: &mut Card) {
    if card.contacts_in == ContactState::READY {
        // RST went high: this is the reset moment. Session state from any
        // previous activation is wiped, the mounted disk stays.
        if card.reset_session().is_err() {
            deactivate(card);
            return;
        }
        card.contacts_out |= ContactState::IO | ContactState::VALID_IO;
        card.fsm_state = FsmState::AtrReq;
    } else if card.contacts_in == ContactState::READY.difference(ContactState::RST) {
        // RST still low, keep waiting.
    } else {
        deactivate(card);
        return;
    }
    card.tx.clear();
    card.rx_expected = 0;
}

fn atr_req(card: &mut Card) {
    if !operating_contacts(card) {
        return;
    }
    card.tx.clear();
    card.tx.extend_from_slice(&atr::ATR);
    // The next byte decides between a PPS exchange and a command header.
    card.rx_expected = 1;
    card.fsm_state = FsmState::AtrRes;
}

fn atr_res(card: &mut Card) {
    if !operating_contacts(card) {
        return;
    }
    if card.rx.len() != 1 {
        deactivate(card);
        return;
    }
    let first = card.rx[0];
    if first == pps::PPSS {
        card.pps_buf[0] = first;
        card.pps_len = 1;
        card.fsm_state = FsmState::PpsReq;
    } else {
        card.tpdu_hdr[0] = first;
        card.tpdu_hdr_len = 1;
        card.fsm_state = FsmState::CmdWait;
    }
    card.tx.clear();
    card.rx_expected = 0;
}

fn reset_warm(card: &mut Card) {
    if card.contacts_in == ContactState::READY {
        // RST went high again: restart the session, same as a cold reset
        // but without losing activation.
        if card.reset_session().is_err() {
            deactivate(card);
            return;
        }
        card.contacts_out |= ContactState::IO | ContactState::VALID_IO;
        card.fsm_state = FsmState::AtrReq;
    } else if card.contacts_in == ContactState::READY.difference(ContactState::RST) {
        // RST held low while the interface prepares the restart.
    } else {
        deactivate(card);
        return;
    }
    card.tx.clear();
    card.rx_expected = 0;
}

fn pps_req(card: &mut Card) {
    if !operating_contacts(card) {
        return;
    }
    if card.pps_len + card.rx.len() > pps::LEN_MAX {
        deactivate(card);
        return;
    }
    let rx = std::mem::take(&mut card.rx);
    card.pps_buf[card.pps_len..card.pps_len + rx.len()].copy_from_slice(&rx);
    card.pps_len += rx.len();

    if card.pps_len < 2 {
        // Full length is unknown until PPS0 arrives.
        card.rx_expected = 2 - card.pps_len;
        card.tx.clear();
        return;
    }
    let expected = match pps::pps_len(&card.pps_buf[..card.pps_len]) {
        Ok(expected) => expected,
        Err(_) => {
            deactivate(card);
            return;
        }
    };
    if card.pps_len < expected {
        card.rx_expected = expected - card.pps_len;
        card.tx.clear();
        return;
    }
    let mut tx = [0u8; pps::LEN_MAX];
    match pps::negotiate(&card.pps_buf[..card.pps_len], &mut tx) {
        Ok(PpsOutcome::Accepted { params, tx_len }) => {
            card.tx.clear();
            card.tx.extend_from_slice(&tx[..tx_len]);
            card.tp = TransmissionParams::from_indices(params.fi_idx, params.di_idx);
            log::debug!(
                "PPS accepted: Fi={} Di={} etu={}",
                card.tp.fi,
                card.tp.di,
                card.tp.etu
            );
            card.tpdu_processed = false;
            card.fsm_state = FsmState::CmdWait;
            card.rx_expected = 0;
        }
        Ok(PpsOutcome::Declined { tx_len }) => {
            // Counter-proposal goes out; wait for another PPSS.
            card.tx.clear();
            card.tx.extend_from_slice(&tx[..tx_len]);
            card.fsm_state = FsmState::AtrRes;
            card.rx_expected = 1;
        }
        Err(_) => {
            // Invalid request: say nothing and wait for another.
            card.tx.clear();
            card.fsm_state = FsmState::AtrRes;
            card.rx_expected = 1;
        }
    }
}

fn cmd_wait(card: &mut Card) {
    if !operating_contacts(card) {
        return;
    }

    // Drop state left over from the previous command.
    if card.tpdu_processed {
        card.cmd_cur = None;
        card.tpdu_hdr = [0; tpdu::HDR_LEN];
        card.tpdu_hdr_len = 0;
        card.procedure_count = 0;
        card.tpdu_processed = false;
    }

    let hdr_len = card.tpdu_hdr_len + card.rx.len();
    if hdr_len <= tpdu::HDR_LEN {
        let rx = std::mem::take(&mut card.rx);
        card.tpdu_hdr[card.tpdu_hdr_len..hdr_len].copy_from_slice(&rx);
        card.tpdu_hdr_len = hdr_len;

        if hdr_len < tpdu::HDR_LEN {
            card.tx.clear();
            card.rx_expected = tpdu::HDR_LEN - hdr_len;
            return;
        }
        if let Ok(cmd) = tpdu::parse(&card.tpdu_hdr) {
            card.cmd_cur = Some(cmd);
            card.fsm_state = FsmState::CmdProcedure;
            card.tx.clear();
            card.rx_expected = 0;
            return;
        }
    }

    // Oversized or unparseable: start over with a fresh header.
    card.tpdu_processed = true;
    card.tx.clear();
    card.rx_expected = tpdu::HDR_LEN;
}

fn cmd_procedure(card: &mut Card) {
    if !operating_contacts(card) {
        return;
    }
    let Some(cmd) = card.cmd_cur.clone() else {
        card.tpdu_processed = true;
        card.fsm_state = FsmState::CmdWait;
        card.tx.clear();
        card.rx_expected = tpdu::HDR_LEN;
        return;
    };

    let res = match handlers::demux(card, &cmd, card.procedure_count) {
        Ok(res) => res,
        Err(err) => {
            log::warn!("handler failed internally: {err}");
            deactivate(card);
            return;
        }
    };

    let mut out = [0u8; DATA_MAX + 2];
    let tx_len = match res.serialize(&mut out, cmd.hdr.ins) {
        Ok(len) => len,
        Err(err) => {
            log::warn!("response serialization failed: {err}");
            deactivate(card);
            return;
        }
    };
    card.tx.clear();
    card.tx.extend_from_slice(&out[..tx_len]);

    if matches!(res.sw1, Sw1::ProcAckAll | Sw1::ProcAckOne) {
        if card.procedure_count < PROCEDURE_COUNT_MAX {
            card.procedure_count += 1;
            card.fsm_state = FsmState::CmdData;
            // For ACKs the response data length carries the expected
            // incoming byte count, nothing is actually attached.
            card.rx_expected = res.data.len();
            return;
        }
        // Too many data phases: drop the command without acknowledging.
        card.tx.clear();
    }

    card.tpdu_processed = true;
    card.fsm_state = FsmState::CmdWait;
    card.rx_expected = tpdu::HDR_LEN;
}

fn cmd_data(card: &mut Card) {
    if !operating_contacts(card) {
        return;
    }
    let rx = std::mem::take(&mut card.rx);
    let fits = card
        .cmd_cur
        .as_mut()
        .map(|cmd| cmd.data.extend(&rx).is_ok())
        .unwrap_or(false);
    if fits {
        card.fsm_state = FsmState::CmdProcedure;
        card.tx.clear();
        card.rx_expected = 0;
        return;
    }
    // Data would overflow a short APDU: drop the command.
    card.tpdu_processed = true;
    card.fsm_state = FsmState::CmdWait;
    card.tx.clear();
    card.rx_expected = tpdu::HDR_LEN;
}
