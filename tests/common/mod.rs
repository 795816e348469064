//! Shared fixtures and a host-side driver for the scenario tests

// Not every test binary uses every helper.
#![allow(dead_code)]

use icc_target::disk::build::{name16, FileAttrs, Node, NodeKind};
use icc_target::disk::Disk;
use icc_target::fs::Endianness;
use icc_target::fsm::FsmState;
use icc_target::tpdu;
use icc_target::{Card, ContactState};
use once_cell::sync::Lazy;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn init_logging() {
    Lazy::force(&LOGGER);
}

/// The disk every scenario assumes: MF(3F00) holding one transparent
/// EF(2F00, SID 0x02) with the bytes 00..09
pub fn scenario_disk() -> Disk {
    let mf = Node {
        attrs: FileAttrs::new(0x3F00, 0),
        kind: NodeKind::Mf {
            name: name16("mf"),
            children: vec![Node {
                attrs: FileAttrs::new(0x2F00, 0x02),
                kind: NodeKind::EfTransparent {
                    data: (0u8..10).collect(),
                },
            }],
        },
    };
    let endian = Endianness::native();
    Disk::from_tree_bufs(vec![mf.to_tree_bytes(endian)], endian).unwrap()
}

pub fn scenario_card() -> Card {
    init_logging();
    Card::builder().disk(scenario_disk()).build().unwrap()
}

/// Feed a complete T=0 TPDU (5-byte header plus data) into the card the
/// way an interface device would: supply exactly as many bytes as the card
/// asks for per tick and collect everything it transmits (procedure bytes,
/// response data, status words) until it waits for the next header.
pub fn exchange(card: &mut Card, tpdu_bytes: &[u8]) -> Vec<u8> {
    let mut sent = 0;
    let mut response = Vec::new();
    let mut expected = card.requested_rx();
    for _ in 0..32 {
        let take = expected.min(tpdu_bytes.len() - sent);
        let chunk = &tpdu_bytes[sent..sent + take];
        sent += take;
        let out = card.io(ContactState::READY, chunk);
        response.extend_from_slice(&out.tx);
        expected = out.rx_expected;
        if sent == tpdu_bytes.len()
            && card.fsm_state() == FsmState::CmdWait
            && expected == tpdu::HDR_LEN
        {
            return response;
        }
    }
    panic!("exchange with {tpdu_bytes:02x?} did not finish");
}

/// Status word: the last two transmitted bytes
pub fn sw(response: &[u8]) -> (u8, u8) {
    assert!(response.len() >= 2, "response {response:02x?} has no SW");
    (response[response.len() - 2], response[response.len() - 1])
}
