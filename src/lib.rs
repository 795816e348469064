//! A pure Rust ISO/IEC 7816 smartcard (ICC) emulator
//!
//! This library emulates a contact smartcard toward a host interface,
//! typically PC/SC middleware reached through a TCP bridge. The host sees
//! a card that answers to reset, negotiates transmission parameters over
//! PPS, and serves a read-only file system through T=0 framed APDUs
//! (SELECT, READ BINARY, READ RECORD, GET RESPONSE).
//!
//! The engine is fully synchronous: one `io()` tick consumes the observed
//! contact state plus received bytes and produces the bytes to transmit
//! and the byte count wanted next. Blocking and scheduling belong to the
//! embedding layer.
//!
//! # Example
//!
//! ```no_run
//! use icc_target::{Card, Disk, NetClient};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let disk = Disk::load("card.fs")?;
//! let mut card = Card::builder().disk(disk).build()?;
//!
//! let mut client = NetClient::connect("127.0.0.1:37324")?;
//! client.run(&mut card)?;
//! # Ok(())
//! # }
//! ```

pub mod apdu;
pub mod atr;
pub mod card;
pub mod disk;
pub mod error;
pub mod fs;
pub mod fsm;
pub mod handlers;
pub mod net;
pub mod pps;
pub mod tlv;
pub mod tpdu;
pub mod transmission;
pub mod va;

pub use card::{Card, CardBuilder, IoOutput};
pub use disk::Disk;
pub use error::{IccError, IccResult};
pub use fsm::FsmState;
pub use net::{NetClient, NetServer};
pub use transmission::ContactState;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
