//! The NET/ROM network layer: packet format, NODES broadcasts, routing
//! and circuits.
//!
//! A NET/ROM packet rides in the information field of an AX.25 I frame
//! with PID 0xCF. The fixed header is source and destination node calls,
//! a TTL, the circuit index/id pair, the two sequence numbers and the op
//! byte; a short tail varies with the opcode.

use core::fmt;

use modular_bitfield::prelude::*;
use thiserror::Error;

use crate::frame::{FrameRole, UiFrame};
use crate::{AX25Call, L3Protocol};

pub mod circuit;
pub mod network;
pub mod router;

/// Fixed header: two calls, ttl, circuit idx/id, tx/rx seq, op byte.
const HEADER: usize = 7 + 7 + 1 + 1 + 1 + 1 + 1 + 1;

/// NODES records fit 11 to a frame before the UI payload outgrows what
/// small TNCs will pass.
const NODES_PER_FRAME: usize = 11;

/// Destination callsign of every NODES broadcast.
pub fn nodes_call() -> AX25Call {
    AX25Call::new("NODES", 0).expect("static call")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetRomDecodeError {
    #[error("packet too short: have {have} bytes, need {need}")]
    TooShort { have: usize, need: usize },
    #[error("bad address encoding: {0}")]
    BadAddress(#[from] crate::CallParseError),
    #[error("NODES broadcast starts with {byte:#04x}, not 0xff")]
    BadNodesMarker { byte: u8 },
}

/// The op byte: opcode in the low nibble, flags in the high bits.
#[bitfield]
#[derive(Debug, Clone, Copy)]
struct OpByte {
    opcode: B4,
    reserved: B1,
    more_follows: bool,
    nak: bool,
    choke: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    ConnectRequest,
    ConnectAcknowledge,
    DisconnectRequest,
    DisconnectAcknowledge,
    Information,
    InformationAcknowledge,
    Unknown,
}

impl OpType {
    pub fn from_op_byte(op_byte: u8) -> Self {
        match op_byte & 0x0F {
            0x01 => OpType::ConnectRequest,
            0x02 => OpType::ConnectAcknowledge,
            0x03 => OpType::DisconnectRequest,
            0x04 => OpType::DisconnectAcknowledge,
            0x05 => OpType::Information,
            0x06 => OpType::InformationAcknowledge,
            _ => OpType::Unknown,
        }
    }

    fn opcode(&self) -> u8 {
        match self {
            OpType::ConnectRequest => 0x01,
            OpType::ConnectAcknowledge => 0x02,
            OpType::DisconnectRequest => 0x03,
            OpType::DisconnectAcknowledge => 0x04,
            OpType::Information => 0x05,
            OpType::InformationAcknowledge => 0x06,
            OpType::Unknown => 0x00,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpType::ConnectRequest => "ConnReq",
            OpType::ConnectAcknowledge => "ConnAck",
            OpType::DisconnectRequest => "DiscReq",
            OpType::DisconnectAcknowledge => "DiscAck",
            OpType::Information => "Info",
            OpType::InformationAcknowledge => "InfoAck",
            OpType::Unknown => "???",
        };
        f.write_str(s)
    }
}

/// Opcode-specific tail of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    ConnectRequest {
        proposed_window: u8,
        origin_user: AX25Call,
        origin_node: AX25Call,
    },
    ConnectAcknowledge {
        accept_window: u8,
    },
    Information {
        info: Vec<u8>,
    },
    /// DiscReq, DiscAck and InfoAck carry nothing past the header.
    Bare,
    /// Unknown opcode; the tail is preserved so the packet still
    /// round-trips when forwarded.
    Unknown {
        tail: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetRomPacket {
    pub source: AX25Call,
    pub dest: AX25Call,
    pub ttl: u8,
    pub circuit_idx: u8,
    pub circuit_id: u8,
    pub tx_seq: u8,
    pub rx_seq: u8,
    pub op_byte: u8,
    pub body: PacketBody,
}

impl NetRomPacket {
    pub fn op_type(&self) -> OpType {
        OpType::from_op_byte(self.op_byte)
    }

    pub fn choke(&self) -> bool {
        self.op_byte & 0x80 != 0
    }

    pub fn nak(&self) -> bool {
        self.op_byte & 0x40 != 0
    }

    pub fn more_follows(&self) -> bool {
        self.op_byte & 0x20 != 0
    }

    fn op_byte_for(op: OpType, choke: bool, nak: bool, more_follows: bool) -> u8 {
        OpByte::new()
            .with_opcode(op.opcode())
            .with_more_follows(more_follows)
            .with_nak(nak)
            .with_choke(choke)
            .into_bytes()[0]
    }

    #[allow(clippy::too_many_arguments)]
    pub fn connect_request(
        source: AX25Call,
        dest: AX25Call,
        ttl: u8,
        circuit_idx: u8,
        circuit_id: u8,
        proposed_window: u8,
        origin_user: AX25Call,
        origin_node: AX25Call,
    ) -> Self {
        Self {
            source,
            dest,
            ttl,
            circuit_idx,
            circuit_id,
            tx_seq: 0,
            rx_seq: 0,
            op_byte: Self::op_byte_for(OpType::ConnectRequest, false, false, false),
            body: PacketBody::ConnectRequest {
                proposed_window,
                origin_user,
                origin_node,
            },
        }
    }

    /// A ConnAck. The accepting side's own circuit index and id travel
    /// in the `tx_seq`/`rx_seq` fields; a set choke bit refuses the
    /// connection.
    #[allow(clippy::too_many_arguments)]
    pub fn connect_ack(
        source: AX25Call,
        dest: AX25Call,
        ttl: u8,
        circuit_idx: u8,
        circuit_id: u8,
        my_idx: u8,
        my_id: u8,
        accept_window: u8,
        refused: bool,
    ) -> Self {
        Self {
            source,
            dest,
            ttl,
            circuit_idx,
            circuit_id,
            tx_seq: my_idx,
            rx_seq: my_id,
            op_byte: Self::op_byte_for(OpType::ConnectAcknowledge, refused, false, false),
            body: PacketBody::ConnectAcknowledge { accept_window },
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn information(
        source: AX25Call,
        dest: AX25Call,
        ttl: u8,
        circuit_idx: u8,
        circuit_id: u8,
        tx_seq: u8,
        rx_seq: u8,
        more_follows: bool,
        info: Vec<u8>,
    ) -> Self {
        Self {
            source,
            dest,
            ttl,
            circuit_idx,
            circuit_id,
            tx_seq,
            rx_seq,
            op_byte: Self::op_byte_for(OpType::Information, false, false, more_follows),
            body: PacketBody::Information { info },
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn information_ack(
        source: AX25Call,
        dest: AX25Call,
        ttl: u8,
        circuit_idx: u8,
        circuit_id: u8,
        rx_seq: u8,
        choke: bool,
        nak: bool,
    ) -> Self {
        Self {
            source,
            dest,
            ttl,
            circuit_idx,
            circuit_id,
            tx_seq: 0,
            rx_seq,
            op_byte: Self::op_byte_for(OpType::InformationAcknowledge, choke, nak, false),
            body: PacketBody::Bare,
        }
    }

    pub fn disconnect_request(
        source: AX25Call,
        dest: AX25Call,
        ttl: u8,
        circuit_idx: u8,
        circuit_id: u8,
    ) -> Self {
        Self {
            source,
            dest,
            ttl,
            circuit_idx,
            circuit_id,
            tx_seq: 0,
            rx_seq: 0,
            op_byte: Self::op_byte_for(OpType::DisconnectRequest, false, false, false),
            body: PacketBody::Bare,
        }
    }

    pub fn disconnect_ack(
        source: AX25Call,
        dest: AX25Call,
        ttl: u8,
        circuit_idx: u8,
        circuit_id: u8,
    ) -> Self {
        Self {
            source,
            dest,
            ttl,
            circuit_idx,
            circuit_id,
            tx_seq: 0,
            rx_seq: 0,
            op_byte: Self::op_byte_for(OpType::DisconnectAcknowledge, false, false, false),
            body: PacketBody::Bare,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetRomDecodeError> {
        let have = bytes.len();
        if have < HEADER {
            return Err(NetRomDecodeError::TooShort { have, need: HEADER });
        }
        let (source, _) = AX25Call::read(bytes[0..7].try_into().unwrap())?;
        let (dest, _) = AX25Call::read(bytes[7..14].try_into().unwrap())?;
        let ttl = bytes[14];
        let circuit_idx = bytes[15];
        let circuit_id = bytes[16];
        let tx_seq = bytes[17];
        let rx_seq = bytes[18];
        let op_byte = bytes[19];
        let tail = &bytes[HEADER..];

        let body = match OpType::from_op_byte(op_byte) {
            OpType::ConnectRequest => {
                let need = HEADER + 1 + 7 + 7;
                if have < need {
                    return Err(NetRomDecodeError::TooShort { have, need });
                }
                let (origin_user, _) = AX25Call::read(tail[1..8].try_into().unwrap())?;
                let (origin_node, _) = AX25Call::read(tail[8..15].try_into().unwrap())?;
                PacketBody::ConnectRequest {
                    proposed_window: tail[0],
                    origin_user,
                    origin_node,
                }
            }
            OpType::ConnectAcknowledge => {
                let need = HEADER + 1;
                if have < need {
                    return Err(NetRomDecodeError::TooShort { have, need });
                }
                PacketBody::ConnectAcknowledge {
                    accept_window: tail[0],
                }
            }
            OpType::Information => PacketBody::Information {
                info: tail.to_vec(),
            },
            OpType::DisconnectRequest
            | OpType::DisconnectAcknowledge
            | OpType::InformationAcknowledge => PacketBody::Bare,
            OpType::Unknown => PacketBody::Unknown {
                tail: tail.to_vec(),
            },
        };

        Ok(Self {
            source,
            dest,
            ttl,
            circuit_idx,
            circuit_id,
            tx_seq,
            rx_seq,
            op_byte,
            body,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER + 16);
        self.source.write(&mut out, false, false);
        self.dest.write(&mut out, false, false);
        out.push(self.ttl);
        out.push(self.circuit_idx);
        out.push(self.circuit_id);
        out.push(self.tx_seq);
        out.push(self.rx_seq);
        out.push(self.op_byte);
        match &self.body {
            PacketBody::ConnectRequest {
                proposed_window,
                origin_user,
                origin_node,
            } => {
                out.push(*proposed_window);
                origin_user.write(&mut out, false, false);
                origin_node.write(&mut out, false, false);
            }
            PacketBody::ConnectAcknowledge { accept_window } => out.push(*accept_window),
            PacketBody::Information { info } => out.extend_from_slice(info),
            PacketBody::Bare => {}
            PacketBody::Unknown { tail } => out.extend_from_slice(tail),
        }
        out
    }
}

impl fmt::Display for NetRomPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}>{} C={}/{} TX={} RX={} TTL={}",
            self.op_type(),
            self.source,
            self.dest,
            self.circuit_idx,
            self.circuit_id,
            self.tx_seq,
            self.rx_seq,
            self.ttl
        )?;
        if self.choke() {
            f.write_str(" CHOKE")?;
        }
        if self.nak() {
            f.write_str(" NAK")?;
        }
        if self.more_follows() {
            f.write_str(" MORE")?;
        }
        Ok(())
    }
}

/// One destination record of a NODES broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDestination {
    pub dest_node: AX25Call,
    pub dest_alias: String,
    pub best_neighbor: AX25Call,
    pub quality: u8,
}

/// A NODES routing advertisement: `0xff`, the sender's alias, then a
/// record per advertised destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetRomNodes {
    pub sending_alias: String,
    pub destinations: Vec<NodeDestination>,
}

/// Aliases are six bytes, space padded on the wire.
fn write_alias(out: &mut Vec<u8>, alias: &str) {
    let mut bytes = [b' '; 6];
    for (i, b) in alias.bytes().take(6).enumerate() {
        bytes[i] = b;
    }
    out.extend_from_slice(&bytes);
}

/// Strip padding, replacing non-ASCII rather than failing: these come
/// off the air.
fn read_alias(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii() && !b.is_ascii_control() {
                b as char
            } else {
                char::REPLACEMENT_CHARACTER
            }
        })
        .collect::<String>()
        .trim_end_matches(' ')
        .to_string()
}

impl NetRomNodes {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetRomDecodeError> {
        let have = bytes.len();
        if have < 7 {
            return Err(NetRomDecodeError::TooShort { have, need: 7 });
        }
        if bytes[0] != 0xFF {
            return Err(NetRomDecodeError::BadNodesMarker { byte: bytes[0] });
        }
        let sending_alias = read_alias(&bytes[1..7]);
        let mut destinations = Vec::new();
        let mut rem = &bytes[7..];
        // a trailing partial record is dropped, not an error
        while rem.len() >= 7 + 6 + 7 + 1 {
            let (dest_node, _) = AX25Call::read(rem[0..7].try_into().unwrap())?;
            let dest_alias = read_alias(&rem[7..13]);
            let (best_neighbor, _) = AX25Call::read(rem[13..20].try_into().unwrap())?;
            destinations.push(NodeDestination {
                dest_node,
                dest_alias,
                best_neighbor,
                quality: rem[20],
            });
            rem = &rem[21..];
        }
        Ok(Self {
            sending_alias,
            destinations,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.destinations.len() * 21);
        out.push(0xFF);
        write_alias(&mut out, &self.sending_alias);
        for dest in &self.destinations {
            dest.dest_node.write(&mut out, false, false);
            write_alias(&mut out, &dest.dest_alias);
            dest.best_neighbor.write(&mut out, false, false);
            out.push(dest.quality);
        }
        out
    }

    /// Split the advertisement into UI frames addressed to `NODES`, at
    /// most [`NODES_PER_FRAME`] records apiece.
    pub fn to_frames(&self, source: &AX25Call) -> Vec<UiFrame> {
        let mut frames = Vec::new();
        let mut emit = |chunk: &[NodeDestination]| {
            let part = NetRomNodes {
                sending_alias: self.sending_alias.clone(),
                destinations: chunk.to_vec(),
            };
            frames.push(UiFrame {
                dest: nodes_call(),
                source: *source,
                repeaters: Vec::new(),
                role: FrameRole::Command,
                poll_final: false,
                protocol: L3Protocol::NetRom,
                info: part.to_bytes(),
            });
        };
        if self.destinations.is_empty() {
            // an empty broadcast still announces our alias
            emit(&[]);
        } else {
            for chunk in self.destinations.chunks(NODES_PER_FRAME) {
                emit(chunk);
            }
        }
        frames
    }
}
