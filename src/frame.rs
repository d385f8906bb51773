//! The AX.25 v2.2 frame format, providing encoding and decoding.
//!
//! Covers the address field (shifted callsigns, C bits, digipeater list
//! terminated by the end-of-address marker), the modulo-8 control byte
//! for I, S and U frames, the PID byte and the information field. The
//! FCS is not handled here; the framing layer (KISS) owns it.

use core::fmt;

use modular_bitfield::prelude::*;
use thiserror::Error;

use crate::{AX25Call, L3Protocol};

/// Frames shorter than dest + source + control can never be valid.
const MIN_FRAME: usize = 7 + 7 + 1;

/// AX.25 v2.0 allowed up to eight digipeaters; v2.2 shrank the limit but
/// old TNCs still emit long paths.
const MAX_REPEATERS: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("frame too short: have {have} bytes, need {need}")]
    TooShort { have: usize, need: usize },
    #[error("address field does not terminate within {max} digipeaters")]
    UnterminatedAddress { max: usize },
    #[error("bad address encoding: {0}")]
    BadAddress(#[from] crate::CallParseError),
    #[error("unknown control byte {control:#04x}")]
    UnknownControl { control: u8 },
}

/// Whether the frame is a command or a response, taken from the C bits
/// of the address field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRole {
    Command,
    Response,
}

/// I frame control field, modulo 8: `nr | p | ns | 0`.
#[bitfield]
#[derive(Debug, Clone, Copy)]
struct InfoControl {
    i_tag: B1,
    ns: B3,
    poll: bool,
    nr: B3,
}

/// S frame control field, modulo 8: `nr | p/f | ss | 01`.
#[bitfield]
#[derive(Debug, Clone, Copy)]
struct SupervisoryControl {
    s_tag: B2,
    #[bits = 2]
    kind: SupervisoryKind,
    poll_final: bool,
    nr: B3,
}

/// SS bits of a supervisory frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Specifier)]
#[bits = 2]
pub enum SupervisoryKind {
    /// RR
    ReceiveReady = 0b00,
    /// RNR
    ReceiveNotReady = 0b01,
    /// REJ
    Reject = 0b10,
    /// SREJ
    SelectiveReject = 0b11,
}

/// Unnumbered frame modifiers. UI is modeled separately because it
/// carries a PID and an information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnnumberedKind {
    Sabm,
    Sabme,
    Disc,
    Dm,
    Ua,
    Frmr,
    Xid,
    Test,
}

impl UnnumberedKind {
    /// Control byte with the P/F bit cleared.
    fn base_control(&self) -> u8 {
        match self {
            UnnumberedKind::Sabm => 0x2F,
            UnnumberedKind::Sabme => 0x6F,
            UnnumberedKind::Disc => 0x43,
            UnnumberedKind::Dm => 0x0F,
            UnnumberedKind::Ua => 0x63,
            UnnumberedKind::Frmr => 0x87,
            UnnumberedKind::Xid => 0xAF,
            UnnumberedKind::Test => 0xE3,
        }
    }
}

const UI_CONTROL: u8 = 0x03;
const PF_BIT: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IFrame {
    pub dest: AX25Call,
    pub source: AX25Call,
    pub repeaters: Vec<AX25Call>,
    pub role: FrameRole,
    pub poll: bool,
    pub ns: u8,
    pub nr: u8,
    pub protocol: L3Protocol,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SFrame {
    pub dest: AX25Call,
    pub source: AX25Call,
    pub repeaters: Vec<AX25Call>,
    pub role: FrameRole,
    pub kind: SupervisoryKind,
    pub poll_final: bool,
    pub nr: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UFrame {
    pub dest: AX25Call,
    pub source: AX25Call,
    pub repeaters: Vec<AX25Call>,
    pub role: FrameRole,
    pub kind: UnnumberedKind,
    pub poll_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiFrame {
    pub dest: AX25Call,
    pub source: AX25Call,
    pub repeaters: Vec<AX25Call>,
    pub role: FrameRole,
    pub poll_final: bool,
    pub protocol: L3Protocol,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ax25Frame {
    I(IFrame),
    S(SFrame),
    U(UFrame),
    Ui(UiFrame),
}

struct AddressField {
    dest: AX25Call,
    source: AX25Call,
    repeaters: Vec<AX25Call>,
    role: FrameRole,
    /// Offset of the control byte.
    control_at: usize,
}

fn read_address_field(bytes: &[u8]) -> Result<AddressField, FrameDecodeError> {
    let have = bytes.len();
    if have < MIN_FRAME {
        return Err(FrameDecodeError::TooShort {
            have,
            need: MIN_FRAME,
        });
    }

    let (dest, dest_ssid) = AX25Call::read(bytes[0..7].try_into().unwrap())?;
    let (source, source_ssid) = AX25Call::read(bytes[7..14].try_into().unwrap())?;

    // Frames predating v2.0 set both C bits the same; treat those as
    // commands like everything else does.
    let role = if dest_ssid & 0x80 != 0 {
        FrameRole::Command
    } else {
        FrameRole::Response
    };

    let mut repeaters = Vec::new();
    let mut at = 14;
    let mut last = source_ssid & 0x01 != 0;
    while !last {
        if repeaters.len() == MAX_REPEATERS {
            return Err(FrameDecodeError::UnterminatedAddress { max: MAX_REPEATERS });
        }
        // one more address plus the control byte
        if have < at + 7 + 1 {
            return Err(FrameDecodeError::TooShort {
                have,
                need: at + 7 + 1,
            });
        }
        let (repeater, ssid) = AX25Call::read(bytes[at..at + 7].try_into().unwrap())?;
        repeaters.push(repeater);
        last = ssid & 0x01 != 0;
        at += 7;
    }

    Ok(AddressField {
        dest,
        source,
        repeaters,
        role,
        control_at: at,
    })
}

fn write_address_field(out: &mut Vec<u8>, frame: &Ax25Frame) {
    let (dest, source, repeaters, role) = match frame {
        Ax25Frame::I(f) => (&f.dest, &f.source, &f.repeaters, f.role),
        Ax25Frame::S(f) => (&f.dest, &f.source, &f.repeaters, f.role),
        Ax25Frame::U(f) => (&f.dest, &f.source, &f.repeaters, f.role),
        Ax25Frame::Ui(f) => (&f.dest, &f.source, &f.repeaters, f.role),
    };
    let command = matches!(role, FrameRole::Command);
    dest.write(out, command, false);
    source.write(out, !command, repeaters.is_empty());
    for (i, repeater) in repeaters.iter().enumerate() {
        repeater.write(out, false, i + 1 == repeaters.len());
    }
}

impl Ax25Frame {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameDecodeError> {
        let address = read_address_field(bytes)?;
        let AddressField {
            dest,
            source,
            repeaters,
            role,
            control_at,
        } = address;

        let have = bytes.len();
        if have < control_at + 1 {
            return Err(FrameDecodeError::TooShort {
                have,
                need: control_at + 1,
            });
        }
        let control = bytes[control_at];
        let tail = &bytes[control_at + 1..];

        if control & 0x01 == 0 {
            // I frame: PID is mandatory
            if tail.is_empty() {
                return Err(FrameDecodeError::TooShort {
                    have,
                    need: control_at + 2,
                });
            }
            let c = InfoControl::from_bytes([control]);
            return Ok(Ax25Frame::I(IFrame {
                dest,
                source,
                repeaters,
                role,
                poll: c.poll(),
                ns: c.ns(),
                nr: c.nr(),
                protocol: L3Protocol::from_byte(tail[0]),
                info: tail[1..].to_vec(),
            }));
        }

        if control & 0x03 == 0x01 {
            let c = SupervisoryControl::from_bytes([control]);
            return Ok(Ax25Frame::S(SFrame {
                dest,
                source,
                repeaters,
                role,
                kind: c.kind(),
                poll_final: c.poll_final(),
                nr: c.nr(),
            }));
        }

        if control & !PF_BIT == UI_CONTROL {
            if tail.is_empty() {
                return Err(FrameDecodeError::TooShort {
                    have,
                    need: control_at + 2,
                });
            }
            return Ok(Ax25Frame::Ui(UiFrame {
                dest,
                source,
                repeaters,
                role,
                poll_final: control & PF_BIT != 0,
                protocol: L3Protocol::from_byte(tail[0]),
                info: tail[1..].to_vec(),
            }));
        }

        let kind = match control & !PF_BIT {
            0x2F => UnnumberedKind::Sabm,
            0x6F => UnnumberedKind::Sabme,
            0x43 => UnnumberedKind::Disc,
            0x0F => UnnumberedKind::Dm,
            0x63 => UnnumberedKind::Ua,
            // FRMR carries a three byte status field; nothing here acts
            // on it, so it is not retained
            0x87 => UnnumberedKind::Frmr,
            0xAF => UnnumberedKind::Xid,
            0xE3 => UnnumberedKind::Test,
            _ => return Err(FrameDecodeError::UnknownControl { control }),
        };
        Ok(Ax25Frame::U(UFrame {
            dest,
            source,
            repeaters,
            role,
            kind,
            poll_final: control & PF_BIT != 0,
        }))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_FRAME + 64);
        write_address_field(&mut out, self);
        match self {
            Ax25Frame::I(f) => {
                out.push(
                    InfoControl::new()
                        .with_i_tag(0)
                        .with_ns(f.ns & 0x07)
                        .with_poll(f.poll)
                        .with_nr(f.nr & 0x07)
                        .into_bytes()[0],
                );
                out.push(f.protocol.as_byte());
                out.extend_from_slice(&f.info);
            }
            Ax25Frame::S(f) => {
                out.push(
                    SupervisoryControl::new()
                        .with_s_tag(0b01)
                        .with_kind(f.kind)
                        .with_poll_final(f.poll_final)
                        .with_nr(f.nr & 0x07)
                        .into_bytes()[0],
                );
            }
            Ax25Frame::U(f) => {
                out.push(f.kind.base_control() | if f.poll_final { PF_BIT } else { 0 });
            }
            Ax25Frame::Ui(f) => {
                out.push(UI_CONTROL | if f.poll_final { PF_BIT } else { 0 });
                out.push(f.protocol.as_byte());
                out.extend_from_slice(&f.info);
            }
        }
        out
    }

    pub fn dest(&self) -> &AX25Call {
        match self {
            Ax25Frame::I(f) => &f.dest,
            Ax25Frame::S(f) => &f.dest,
            Ax25Frame::U(f) => &f.dest,
            Ax25Frame::Ui(f) => &f.dest,
        }
    }

    pub fn source(&self) -> &AX25Call {
        match self {
            Ax25Frame::I(f) => &f.source,
            Ax25Frame::S(f) => &f.source,
            Ax25Frame::U(f) => &f.source,
            Ax25Frame::Ui(f) => &f.source,
        }
    }
}

impl fmt::Display for Ax25Frame {
    /// Compact one-line form for the packet log.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ax25Frame::I(i) => write!(
                f,
                "I {}>{} NS={} NR={}{} {}b",
                i.source,
                i.dest,
                i.ns,
                i.nr,
                if i.poll { " P" } else { "" },
                i.info.len()
            ),
            Ax25Frame::S(s) => {
                let kind = match s.kind {
                    SupervisoryKind::ReceiveReady => "RR",
                    SupervisoryKind::ReceiveNotReady => "RNR",
                    SupervisoryKind::Reject => "REJ",
                    SupervisoryKind::SelectiveReject => "SREJ",
                };
                write!(
                    f,
                    "{} {}>{} NR={}{}",
                    kind,
                    s.source,
                    s.dest,
                    s.nr,
                    if s.poll_final { " P/F" } else { "" }
                )
            }
            Ax25Frame::U(u) => {
                let kind = match u.kind {
                    UnnumberedKind::Sabm => "SABM",
                    UnnumberedKind::Sabme => "SABME",
                    UnnumberedKind::Disc => "DISC",
                    UnnumberedKind::Dm => "DM",
                    UnnumberedKind::Ua => "UA",
                    UnnumberedKind::Frmr => "FRMR",
                    UnnumberedKind::Xid => "XID",
                    UnnumberedKind::Test => "TEST",
                };
                write!(
                    f,
                    "{} {}>{}{}",
                    kind,
                    u.source,
                    u.dest,
                    if u.poll_final { " P/F" } else { "" }
                )
            }
            Ax25Frame::Ui(u) => write!(
                f,
                "UI {}>{} PID={:#04x} {}b",
                u.source,
                u.dest,
                u.protocol.as_byte(),
                u.info.len()
            ),
        }
    }
}
