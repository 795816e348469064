//! Network bridge to a remote interface
//!
//! The card usually sits behind a TCP bridge toward PC/SC middleware: the
//! bridge acts as the server and pushes contact-state changes plus
//! received bytes; the card client answers with the contact lines it
//! drives, the bytes to transmit, and how many bytes it expects next.
//!
//! Wire format: a 4-byte length header (host byte order) followed by the
//! message body: contact state (u32), expected-receive length (u32), one
//! control byte, and up to 258 payload bytes.

use crate::apdu::DATA_MAX;
use crate::card::Card;
use crate::error::{IccError, IccResult};
use crate::transmission::ContactState;
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

/// Control codes carried in the message body
pub mod ctrl {
    /// Plain I/O data exchange
    pub const DATA: u8 = 0x00;
    pub const KEEPALIVE: u8 = 0x01;
    pub const MOCK_RESET_COLD_PPS_Y: u8 = 0x02;
    pub const MOCK_RESET_WARM_PPS_Y: u8 = 0x03;
    pub const MOCK_RESET_COLD_PPS_N: u8 = 0x04;
    pub const MOCK_RESET_WARM_PPS_N: u8 = 0x05;
    /// Request handled (client → server)
    pub const SUCCESS: u8 = 0xF0;
    /// Request failed (client → server)
    pub const FAILURE: u8 = 0x0F;
}

/// Payload capacity: a full response plus the two status bytes
pub const MSG_DATA_MAX: usize = DATA_MAX + 2;

/// Fixed part of the message body preceding the payload
const MSG_FIXED_LEN: usize = 4 + 4 + 1;

/// One bridge message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMessage {
    /// Raw contact-state mask
    pub cont_state: u32,
    /// Bytes the card expects next (client → server only)
    pub buf_len_exp: u32,
    pub ctrl: u8,
    pub data: Vec<u8>,
}

impl NetMessage {
    /// A data-less control message
    pub fn control(ctrl: u8) -> Self {
        NetMessage {
            cont_state: 0,
            buf_len_exp: 0,
            ctrl,
            data: Vec::new(),
        }
    }

    /// Read one length-prefixed message
    pub fn read_from<R: Read>(reader: &mut R) -> IccResult<NetMessage> {
        let size = reader.read_u32::<NativeEndian>()? as usize;
        if !(MSG_FIXED_LEN..=MSG_FIXED_LEN + MSG_DATA_MAX).contains(&size) {
            return Err(IccError::Net(format!("message body of {size} bytes")));
        }
        let cont_state = reader.read_u32::<NativeEndian>()?;
        let buf_len_exp = reader.read_u32::<NativeEndian>()?;
        let ctrl = reader.read_u8()?;
        let mut data = vec![0u8; size - MSG_FIXED_LEN];
        reader.read_exact(&mut data)?;
        Ok(NetMessage {
            cont_state,
            buf_len_exp,
            ctrl,
            data,
        })
    }

    /// Write this message with its length prefix
    pub fn write_to<W: Write>(&self, writer: &mut W) -> IccResult<()> {
        if self.data.len() > MSG_DATA_MAX {
            return Err(IccError::Net(format!(
                "payload of {} bytes exceeds message capacity",
                self.data.len()
            )));
        }
        writer.write_u32::<NativeEndian>((MSG_FIXED_LEN + self.data.len()) as u32)?;
        writer.write_u32::<NativeEndian>(self.cont_state)?;
        writer.write_u32::<NativeEndian>(self.buf_len_exp)?;
        writer.write_u8(self.ctrl)?;
        writer.write_all(&self.data)?;
        writer.flush()?;
        Ok(())
    }
}

/// Card-side network client
pub struct NetClient {
    stream: TcpStream,
}

impl NetClient {
    /// Connect to a bridge server
    pub fn connect<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> IccResult<NetClient> {
        let stream = TcpStream::connect(&addr)?;
        stream.set_nodelay(true)?;
        log::info!("connected to bridge at {addr:?}");
        Ok(NetClient { stream })
    }

    pub fn from_stream(stream: TcpStream) -> NetClient {
        NetClient { stream }
    }

    /// Serve the card over this connection until the peer disconnects.
    ///
    /// Each incoming data message is one `io()` tick; control messages
    /// answer keepalives and mock-reset requests without touching the
    /// contact lines.
    pub fn run(&mut self, card: &mut Card) -> IccResult<()> {
        loop {
            let msg = match NetMessage::read_from(&mut self.stream) {
                Ok(msg) => msg,
                Err(IccError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    log::info!("bridge disconnected");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            if msg.ctrl != ctrl::KEEPALIVE {
                log::debug!(
                    "rx ctrl={:#04x} contacts={:#010x} data={}",
                    msg.ctrl,
                    msg.cont_state,
                    hex::encode(&msg.data)
                );
            }

            let reply = match msg.ctrl {
                ctrl::DATA => {
                    let contacts = ContactState::from_bits_truncate(msg.cont_state);
                    let out = card.io(contacts, &msg.data);
                    NetMessage {
                        cont_state: out.contacts.bits(),
                        buf_len_exp: out.rx_expected as u32,
                        ctrl: ctrl::SUCCESS,
                        data: out.tx,
                    }
                }
                ctrl::KEEPALIVE => NetMessage {
                    cont_state: card.driven_contacts().bits(),
                    buf_len_exp: card.requested_rx() as u32,
                    ctrl: ctrl::SUCCESS,
                    data: Vec::new(),
                },
                ctrl::MOCK_RESET_COLD_PPS_Y
                | ctrl::MOCK_RESET_WARM_PPS_Y
                | ctrl::MOCK_RESET_COLD_PPS_N
                | ctrl::MOCK_RESET_WARM_PPS_N => {
                    let with_pps = matches!(
                        msg.ctrl,
                        ctrl::MOCK_RESET_COLD_PPS_Y | ctrl::MOCK_RESET_WARM_PPS_Y
                    );
                    let warm = matches!(
                        msg.ctrl,
                        ctrl::MOCK_RESET_WARM_PPS_Y | ctrl::MOCK_RESET_WARM_PPS_N
                    );
                    let outcome = if warm {
                        card.mock_reset_warm(with_pps)
                    } else {
                        card.mock_reset_cold(with_pps)
                    };
                    match outcome {
                        Ok(atr) => NetMessage {
                            cont_state: card.driven_contacts().bits(),
                            buf_len_exp: card.requested_rx() as u32,
                            ctrl: ctrl::SUCCESS,
                            data: atr,
                        },
                        Err(err) => {
                            log::warn!("mock reset failed: {err}");
                            NetMessage {
                                cont_state: card.driven_contacts().bits(),
                                buf_len_exp: card.requested_rx() as u32,
                                ctrl: ctrl::FAILURE,
                                data: Vec::new(),
                            }
                        }
                    }
                }
                other => {
                    log::warn!("unknown control code {other:#04x}");
                    NetMessage::control(ctrl::FAILURE)
                }
            };

            if reply.ctrl != ctrl::SUCCESS || msg.ctrl != ctrl::KEEPALIVE {
                log::debug!(
                    "tx ctrl={:#04x} expect={} data={}",
                    reply.ctrl,
                    reply.buf_len_exp,
                    hex::encode(&reply.data)
                );
            }
            reply.write_to(&mut self.stream)?;
        }
    }
}

/// Bridge-side server: accepts card clients and exchanges messages with
/// them. The accept socket is non-blocking so a poll loop can interleave
/// card connections with its other work.
pub struct NetServer {
    listener: TcpListener,
}

impl NetServer {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> IccResult<NetServer> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        log::info!("bridge listening on {}", listener.local_addr()?);
        Ok(NetServer { listener })
    }

    pub fn local_addr(&self) -> IccResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one pending card connection. The returned stream is
    /// blocking; `NetQueueEmpty` means no client was waiting.
    pub fn accept(&self) -> IccResult<TcpStream> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                log::info!("card connected from {peer}");
                Ok(stream)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(IccError::NetQueueEmpty),
            Err(err) => Err(err.into()),
        }
    }
}
