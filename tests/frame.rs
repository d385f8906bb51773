use netrom::frame::{
    Ax25Frame, FrameDecodeError, FrameRole, IFrame, SFrame, SupervisoryKind, UFrame, UiFrame,
    UnnumberedKind,
};
use netrom::{AX25Call, L3Protocol};

fn call(s: &str) -> AX25Call {
    AX25Call::parse(s).unwrap()
}

/// SABM N0CALL-0 > N1CALL-0 with P=1.
///
/// Addresses are the callsign characters shifted left one bit; the
/// destination SSID byte carries the C bit (0xE0), the source SSID byte
/// the end-of-address marker (0x61). 0x3F is SABM with the P bit.
#[test]
fn sabm_decodes_from_wire_bytes() {
    let bytes = hex::decode("9c6286829898e09c6086829898613f").unwrap();

    let frame = Ax25Frame::from_bytes(&bytes).unwrap();
    let Ax25Frame::U(u) = &frame else {
        panic!("expected U frame, got {frame:?}");
    };
    assert_eq!(u.dest, call("N1CALL"));
    assert_eq!(u.source, call("N0CALL"));
    assert_eq!(u.kind, UnnumberedKind::Sabm);
    assert_eq!(u.role, FrameRole::Command);
    assert!(u.poll_final);

    assert_eq!(frame.to_bytes(), bytes);
}

/// UI CQ < N0CALL-7 via WIDE2-1, PID 0xF0 (no layer 3), info "hi".
#[test]
fn ui_with_digipeater_decodes() {
    let bytes =
        hex::decode("86a240404040e09c60868298986eae92888a64406303f06869").unwrap();

    let frame = Ax25Frame::from_bytes(&bytes).unwrap();
    let Ax25Frame::Ui(ui) = &frame else {
        panic!("expected UI frame, got {frame:?}");
    };
    assert_eq!(ui.dest, call("CQ"));
    assert_eq!(ui.source, call("N0CALL-7"));
    assert_eq!(ui.repeaters, vec![call("WIDE2-1")]);
    assert_eq!(ui.protocol, L3Protocol::NoLayer3);
    assert_eq!(ui.info, b"hi");

    assert_eq!(frame.to_bytes(), bytes);
}

#[test]
fn i_frame_control_byte_layout() {
    let frame = Ax25Frame::I(IFrame {
        dest: call("N1CALL"),
        source: call("N0CALL"),
        repeaters: Vec::new(),
        role: FrameRole::Command,
        poll: true,
        ns: 5,
        nr: 3,
        protocol: L3Protocol::NetRom,
        info: b"data".to_vec(),
    });
    let bytes = frame.to_bytes();
    // control: N(R)=3 << 5 | P | N(S)=5 << 1 | 0
    assert_eq!(bytes[14], 0x7A);
    assert_eq!(bytes[15], 0xCF);
    assert_eq!(&bytes[16..], b"data");
    assert_eq!(Ax25Frame::from_bytes(&bytes).unwrap(), frame);
}

#[test]
fn supervisory_control_bytes() {
    for (kind, nr, pf, expect) in [
        (SupervisoryKind::ReceiveReady, 2, false, 0x41),
        (SupervisoryKind::ReceiveNotReady, 0, false, 0x05),
        (SupervisoryKind::Reject, 0, false, 0x09),
        (SupervisoryKind::Reject, 7, true, 0xF9),
        (SupervisoryKind::SelectiveReject, 1, false, 0x2D),
    ] {
        let frame = Ax25Frame::S(SFrame {
            dest: call("N1CALL"),
            source: call("N0CALL"),
            repeaters: Vec::new(),
            role: FrameRole::Response,
            kind,
            poll_final: pf,
            nr,
        });
        let bytes = frame.to_bytes();
        assert_eq!(bytes[14], expect, "{kind:?} NR={nr} PF={pf}");
        assert_eq!(Ax25Frame::from_bytes(&bytes).unwrap(), frame);
    }
}

#[test]
fn decode_encode_identity_across_frame_types() {
    let frames = vec![
        Ax25Frame::U(UFrame {
            dest: call("N1CALL-2"),
            source: call("N0CALL"),
            repeaters: Vec::new(),
            role: FrameRole::Response,
            kind: UnnumberedKind::Dm,
            poll_final: false,
        }),
        Ax25Frame::U(UFrame {
            dest: call("N1CALL"),
            source: call("N0CALL"),
            repeaters: vec![call("RELAY-1"), call("WIDE2-2")],
            role: FrameRole::Command,
            kind: UnnumberedKind::Disc,
            poll_final: true,
        }),
        Ax25Frame::S(SFrame {
            dest: call("N1CALL"),
            source: call("N0CALL-15"),
            repeaters: Vec::new(),
            role: FrameRole::Command,
            kind: SupervisoryKind::ReceiveReady,
            poll_final: true,
            nr: 6,
        }),
        Ax25Frame::I(IFrame {
            dest: call("K4DBZ-2"),
            source: call("N0CALL"),
            repeaters: Vec::new(),
            role: FrameRole::Command,
            poll: false,
            ns: 7,
            nr: 0,
            protocol: L3Protocol::NetRom,
            info: vec![0x00, 0xFF, 0x7E],
        }),
        Ax25Frame::Ui(UiFrame {
            dest: call("NODES"),
            source: call("N0CALL"),
            repeaters: Vec::new(),
            role: FrameRole::Command,
            poll_final: false,
            protocol: L3Protocol::NetRom,
            info: vec![0xFF],
        }),
    ];
    for frame in frames {
        let decoded = Ax25Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(decoded, frame);
    }
}

#[test]
fn truncated_frames_are_rejected() {
    let err = Ax25Frame::from_bytes(&[0x9C, 0x62]).unwrap_err();
    assert!(matches!(err, FrameDecodeError::TooShort { have: 2, .. }));

    // source SSID byte says "more addresses follow" but the frame ends
    let bytes = hex::decode("9c6286829898e09c6086829898603f").unwrap();
    assert!(matches!(
        Ax25Frame::from_bytes(&bytes),
        Err(FrameDecodeError::TooShort { .. })
    ));

    // an I frame needs a PID byte after the control
    let headerless = hex::decode("9c6286829898e09c60868298986100").unwrap();
    assert!(matches!(
        Ax25Frame::from_bytes(&headerless),
        Err(FrameDecodeError::TooShort { .. })
    ));
}

#[test]
fn unknown_control_is_rejected() {
    // 0x33 is not a defined unnumbered control
    let bytes = hex::decode("9c6286829898e09c60868298986133").unwrap();
    assert!(matches!(
        Ax25Frame::from_bytes(&bytes),
        Err(FrameDecodeError::UnknownControl { control: 0x33 })
    ));
}

#[test]
fn bad_address_bytes_are_rejected() {
    // 0x42 >> 1 = '!', not a callsign character
    let bytes = hex::decode("4242424242424042424242424261f3").unwrap();
    assert!(matches!(
        Ax25Frame::from_bytes(&bytes),
        Err(FrameDecodeError::BadAddress(_))
    ));
}
