//! Top-level card state and the synchronous I/O tick
//!
//! A `Card` owns everything: the mounted disk, the validity area, the
//! response chain, the transport state machine and its staging buffers.
//! The embedding layer (network adapter, test harness) drives it one
//! `io()` tick at a time; nothing in here blocks.

use crate::apdu::ApduCommand;
use crate::apdu::ResponseChain;
use crate::disk::Disk;
use crate::error::{IccError, IccResult};
use crate::fsm::{self, FsmState};
use crate::handlers::{AmendHandler, ProprietaryHandler};
use crate::pps;
use crate::tpdu;
use crate::transmission::{ContactState, TransmissionParams};
use crate::va::ValidityArea;

/// Output of one I/O tick
#[derive(Debug, Clone)]
pub struct IoOutput {
    /// Contact lines the card drives
    pub contacts: ContactState,
    /// Bytes to transmit to the interface
    pub tx: Vec<u8>,
    /// How many bytes the card wants to receive next
    pub rx_expected: usize,
}

/// A software ICC
pub struct Card {
    pub disk: Disk,
    pub va: ValidityArea,
    pub rc: ResponseChain,

    pub(crate) contacts_in: ContactState,
    pub(crate) contacts_out: ContactState,
    pub(crate) rx: Vec<u8>,
    pub(crate) tx: Vec<u8>,
    pub(crate) rx_expected: usize,

    pub(crate) fsm_state: FsmState,
    pub(crate) tp: TransmissionParams,

    pub(crate) tpdu_hdr: [u8; tpdu::HDR_LEN],
    pub(crate) tpdu_hdr_len: usize,
    pub(crate) tpdu_processed: bool,
    pub(crate) cmd_cur: Option<ApduCommand>,
    pub(crate) procedure_count: u32,

    pub(crate) pps_buf: [u8; pps::LEN_MAX],
    pub(crate) pps_len: usize,

    proprietary: Option<ProprietaryHandler>,
    amend: Option<AmendHandler>,
}

impl Card {
    /// Start configuring a card
    pub fn builder() -> CardBuilder {
        CardBuilder::new()
    }

    /// Process one I/O tick: feed in the observed contact state and the
    /// bytes received since the last tick, get back what to transmit and
    /// how many bytes to read next.
    ///
    /// Call whenever the contact state changes or the previously requested
    /// number of bytes has been received.
    pub fn io(&mut self, contacts: ContactState, rx: &[u8]) -> IoOutput {
        self.contacts_in = contacts;
        self.rx.clear();
        self.rx.extend_from_slice(rx);
        self.tx.clear();
        self.rx_expected = 0;
        fsm::tick(self);
        IoOutput {
            contacts: self.contacts_out,
            tx: std::mem::take(&mut self.tx),
            rx_expected: self.rx_expected,
        }
    }

    /// Current transport state
    pub fn fsm_state(&self) -> FsmState {
        self.fsm_state
    }

    /// Contact lines the card currently drives
    pub fn driven_contacts(&self) -> ContactState {
        self.contacts_out
    }

    /// Byte count the card asked for in the last tick
    pub fn requested_rx(&self) -> usize {
        self.rx_expected
    }

    /// Transmission parameters currently in force
    pub fn transmission_params(&self) -> TransmissionParams {
        self.tp
    }

    /// Hard reset: behave as if freshly powered off with the disk still
    /// mounted. The interface has to run a full activation sequence again.
    pub fn reset(&mut self) -> IccResult<()> {
        self.reset_session()?;
        self.fsm_state = FsmState::Off;
        self.contacts_out = ContactState::empty();
        Ok(())
    }

    /// Reinitialize everything a reset wipes: selection state, transport
    /// parameters, response chain, and any half-processed command. The
    /// mounted disk and the transport state survive.
    pub(crate) fn reset_session(&mut self) -> IccResult<()> {
        self.va.reset(&self.disk)?;
        self.tp = TransmissionParams::default();
        self.rc.reset();
        self.tpdu_hdr = [0; tpdu::HDR_LEN];
        self.tpdu_hdr_len = 0;
        self.tpdu_processed = false;
        self.cmd_cur = None;
        self.procedure_count = 0;
        self.pps_buf = [0; pps::LEN_MAX];
        self.pps_len = 0;
        Ok(())
    }

    /// Drive the card through a complete cold reset without electrical
    /// signaling, optionally followed by a default PPS exchange. Useful
    /// when the embedding layer has no real contact lines, e.g. behind a
    /// network bridge.
    ///
    /// Returns the ATR the card produced.
    pub fn mock_reset_cold(&mut self, with_pps: bool) -> IccResult<Vec<u8>> {
        self.reset()?;
        let valid = ContactState::VALID_ALL;

        // Interface raises VCC, then I/O, then the clock, with RST low.
        let out = self.io(valid | ContactState::VCC, &[]);
        expect_state(self, FsmState::Activation, out.rx_expected, 0)?;
        let out = self.io(valid | ContactState::VCC | ContactState::IO, &[]);
        expect_state(self, FsmState::Activation, out.rx_expected, 0)?;
        let out = self.io(
            valid | ContactState::VCC | ContactState::IO | ContactState::CLK,
            &[],
        );
        expect_state(self, FsmState::ResetCold, out.rx_expected, 0)?;

        // RST goes high: the card prepares the ATR.
        let out = self.io(ContactState::READY, &[]);
        expect_state(self, FsmState::AtrReq, out.rx_expected, 0)?;
        let out = self.io(ContactState::READY, &[]);
        expect_state(self, FsmState::AtrRes, out.rx_expected, 1)?;
        let atr = out.tx;
        if atr.len() != crate::atr::ATR_LEN {
            return Err(IccError::AtrInvalid(format!("emitted {} bytes", atr.len())));
        }

        if with_pps {
            self.mock_pps_exchange()?;
        }
        Ok(atr)
    }

    /// Drive the card through a warm reset without electrical signaling:
    /// RST is pulled low and released while power and clock stay up,
    /// optionally followed by a default PPS exchange. A card that has not
    /// completed an activation yet gets a cold reset instead.
    ///
    /// Returns the ATR the card produced.
    pub fn mock_reset_warm(&mut self, with_pps: bool) -> IccResult<Vec<u8>> {
        if matches!(
            self.fsm_state,
            FsmState::Off | FsmState::Activation | FsmState::ResetCold
        ) {
            // Nothing running to restart.
            return self.mock_reset_cold(with_pps);
        }

        // Interface pulls RST low, keeping VCC and the clock up.
        let rst_low = ContactState::READY.difference(ContactState::RST);
        let out = self.io(rst_low, &[]);
        expect_state(self, FsmState::ResetWarm, out.rx_expected, 0)?;

        // RST rises again: the card restarts and answers with the ATR.
        let out = self.io(ContactState::READY, &[]);
        expect_state(self, FsmState::AtrReq, out.rx_expected, 0)?;
        let out = self.io(ContactState::READY, &[]);
        expect_state(self, FsmState::AtrRes, out.rx_expected, 1)?;
        let atr = out.tx;
        if atr.len() != crate::atr::ATR_LEN {
            return Err(IccError::AtrInvalid(format!("emitted {} bytes", atr.len())));
        }

        if with_pps {
            self.mock_pps_exchange()?;
        }
        Ok(atr)
    }

    /// Byte-by-byte default PPS exchange exactly as the interface would
    /// run it, proposing Fi index 9 and Di index 4
    fn mock_pps_exchange(&mut self) -> IccResult<()> {
        // The proposal with its closing check byte
        const PPS_REQ: [u8; 4] = [0xFF, 0x10, 0x94, 0x7B];

        let out = self.io(ContactState::READY, &PPS_REQ[..1]);
        expect_state(self, FsmState::PpsReq, out.rx_expected, 0)?;
        let out = self.io(ContactState::READY, &[]);
        expect_state(self, FsmState::PpsReq, out.rx_expected, 1)?;
        let out = self.io(ContactState::READY, &PPS_REQ[1..2]);
        expect_state(self, FsmState::PpsReq, out.rx_expected, PPS_REQ.len() - 2)?;
        let out = self.io(ContactState::READY, &PPS_REQ[2..]);
        expect_state(self, FsmState::CmdWait, out.rx_expected, 0)?;
        if out.tx != PPS_REQ {
            return Err(IccError::PpsFailed);
        }
        Ok(())
    }

    pub(crate) fn take_proprietary_handler(&mut self) -> Option<ProprietaryHandler> {
        self.proprietary.take()
    }

    pub(crate) fn put_proprietary_handler(&mut self, handler: ProprietaryHandler) {
        self.proprietary = Some(handler);
    }

    pub(crate) fn take_amend_handler(&mut self) -> Option<AmendHandler> {
        self.amend.take()
    }

    pub(crate) fn put_amend_handler(&mut self, handler: AmendHandler) {
        self.amend = Some(handler);
    }
}

fn expect_state(
    card: &Card,
    state: FsmState,
    rx_expected: usize,
    rx_wanted: usize,
) -> IccResult<()> {
    if card.fsm_state != state || rx_expected != rx_wanted {
        return Err(IccError::Internal(format!(
            "mock reset derailed: in {:?} expecting {rx_expected} bytes, wanted {state:?} expecting {rx_wanted}",
            card.fsm_state
        )));
    }
    Ok(())
}

/// Builder for configuring a card
pub struct CardBuilder {
    disk: Option<Disk>,
    proprietary: Option<ProprietaryHandler>,
    amend: Option<AmendHandler>,
}

impl CardBuilder {
    fn new() -> Self {
        CardBuilder {
            disk: None,
            proprietary: None,
            amend: None,
        }
    }

    /// Mount a disk (required)
    pub fn disk(mut self, disk: Disk) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Register a handler that runs before the built-in interindustry
    /// handlers and services proprietary-class commands
    pub fn proprietary_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut Card, &ApduCommand, u32) -> IccResult<crate::apdu::ApduResponse>
            + Send
            + 'static,
    {
        self.proprietary = Some(Box::new(handler));
        self
    }

    /// Register a handler that may amend every response after the fact
    pub fn amend_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut Card, &ApduCommand, &mut crate::apdu::ApduResponse, u32) -> IccResult<()>
            + Send
            + 'static,
    {
        self.amend = Some(Box::new(handler));
        self
    }

    /// Build the card and select the MF
    pub fn build(self) -> IccResult<Card> {
        let disk = self
            .disk
            .ok_or_else(|| IccError::Param("a card needs a mounted disk".into()))?;
        let mut card = Card {
            disk,
            va: ValidityArea::default(),
            rc: ResponseChain::new(),
            contacts_in: ContactState::empty(),
            contacts_out: ContactState::empty(),
            rx: Vec::new(),
            tx: Vec::new(),
            rx_expected: 0,
            fsm_state: FsmState::Off,
            tp: TransmissionParams::default(),
            tpdu_hdr: [0; tpdu::HDR_LEN],
            tpdu_hdr_len: 0,
            tpdu_processed: false,
            cmd_cur: None,
            procedure_count: 0,
            pps_buf: [0; pps::LEN_MAX],
            pps_len: 0,
            proprietary: self.proprietary,
            amend: self.amend,
        };
        card.reset()?;
        Ok(card)
    }
}
