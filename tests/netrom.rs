use netrom::netrom::{
    nodes_call, NetRomNodes, NetRomPacket, NodeDestination, OpType, PacketBody,
};
use netrom::{AX25Call, L3Protocol};

fn call(s: &str) -> AX25Call {
    AX25Call::parse(s).unwrap()
}

#[test]
fn connect_request_round_trips_with_field_layout() {
    let packet = NetRomPacket::connect_request(
        call("N0DE-1"),
        call("N1DE-1"),
        7,
        1,
        1,
        4,
        call("USER-0"),
        call("N0DE-1"),
    );
    let bytes = packet.to_bytes();

    // 7B source, 7B dest, then the fixed scalar header
    assert_eq!(bytes[14], 7, "ttl");
    assert_eq!(bytes[15], 1, "circuit idx");
    assert_eq!(bytes[16], 1, "circuit id");
    assert_eq!(bytes[17], 0, "tx seq");
    assert_eq!(bytes[18], 0, "rx seq");
    assert_eq!(bytes[19], 0x01, "op byte: ConnReq, no flags");
    // window plus the two origin calls
    assert_eq!(bytes.len(), 20 + 1 + 7 + 7);
    assert_eq!(bytes[20], 4, "proposed window");

    assert_eq!(NetRomPacket::from_bytes(&bytes).unwrap(), packet);
}

#[test]
fn op_byte_flags() {
    let ack = NetRomPacket::information_ack(
        call("N0DE-1"),
        call("N1DE-1"),
        7,
        2,
        2,
        5,
        true,
        false,
    );
    assert_eq!(ack.op_byte, 0x86, "InfoAck with choke");
    assert!(ack.choke());
    assert!(!ack.nak());
    assert!(!ack.more_follows());
    assert_eq!(ack.op_type(), OpType::InformationAcknowledge);

    let nak = NetRomPacket::information_ack(
        call("N0DE-1"),
        call("N1DE-1"),
        7,
        2,
        2,
        5,
        false,
        true,
    );
    assert_eq!(nak.op_byte, 0x46, "InfoAck with nak");
    assert!(nak.nak());
}

#[test]
fn information_round_trip() {
    let packet = NetRomPacket::information(
        call("N0DE-1"),
        call("N1DE-1"),
        7,
        2,
        3,
        4,
        5,
        true,
        b"73 de n0de".to_vec(),
    );
    assert!(packet.more_follows());
    let decoded = NetRomPacket::from_bytes(&packet.to_bytes()).unwrap();
    assert_eq!(decoded, packet);
    let PacketBody::Information { info } = &decoded.body else {
        panic!("wrong body {:?}", decoded.body);
    };
    assert_eq!(info, b"73 de n0de");
}

#[test]
fn unknown_opcode_survives_a_round_trip() {
    let packet = NetRomPacket::information(
        call("N0DE-1"),
        call("N1DE-1"),
        7,
        2,
        3,
        4,
        5,
        false,
        vec![0xAA, 0xBB],
    );
    let mut bytes = packet.to_bytes();
    bytes[19] = 0x0B; // an opcode this stack does not know

    let decoded = NetRomPacket::from_bytes(&bytes).unwrap();
    assert_eq!(decoded.op_type(), OpType::Unknown);
    assert_eq!(decoded.op_byte, 0x0B);
    assert!(matches!(&decoded.body, PacketBody::Unknown { tail } if tail == &vec![0xAA, 0xBB]));
    // forwarding an unknown packet must not mangle it
    assert_eq!(decoded.to_bytes(), bytes);
}

#[test]
fn truncated_packet_is_rejected() {
    let packet =
        NetRomPacket::disconnect_request(call("N0DE-1"), call("N1DE-1"), 7, 1, 1);
    let bytes = packet.to_bytes();
    assert!(NetRomPacket::from_bytes(&bytes[..12]).is_err());

    // ConnReq promises a window and two calls after the header
    let mut short = NetRomPacket::connect_request(
        call("N0DE-1"),
        call("N1DE-1"),
        7,
        1,
        1,
        4,
        call("USER-0"),
        call("N0DE-1"),
    )
    .to_bytes();
    short.truncate(22);
    assert!(NetRomPacket::from_bytes(&short).is_err());
}

#[test]
fn nodes_round_trip() {
    let nodes = NetRomNodes {
        sending_alias: "ALPHA".into(),
        destinations: vec![
            NodeDestination {
                dest_node: call("N2DE-1"),
                dest_alias: "BETA".into(),
                best_neighbor: call("N3DE-1"),
                quality: 192,
            },
            NodeDestination {
                dest_node: call("N4DE-2"),
                dest_alias: "GAMMA".into(),
                best_neighbor: call("N3DE-1"),
                quality: 100,
            },
        ],
    };
    let bytes = nodes.to_bytes();
    assert_eq!(bytes[0], 0xFF);
    // marker + 6B alias + 2 records of 21B
    assert_eq!(bytes.len(), 7 + 2 * 21);
    assert_eq!(&bytes[1..7], b"ALPHA ");
    assert_eq!(NetRomNodes::from_bytes(&bytes).unwrap(), nodes);
}

#[test]
fn nodes_decoding_is_tolerant() {
    let nodes = NetRomNodes {
        sending_alias: "ALPHA".into(),
        destinations: vec![NodeDestination {
            dest_node: call("N2DE-1"),
            dest_alias: "BETA".into(),
            best_neighbor: call("N3DE-1"),
            quality: 192,
        }],
    };
    let mut bytes = nodes.to_bytes();

    // non-ASCII alias bytes are replaced, not fatal
    bytes[1] = 0xC0;
    let decoded = NetRomNodes::from_bytes(&bytes).unwrap();
    assert_eq!(
        decoded.sending_alias,
        format!("{}LPHA", char::REPLACEMENT_CHARACTER)
    );

    // a trailing partial record is dropped
    bytes.extend_from_slice(&[0x9C, 0x60, 0x86]);
    let decoded = NetRomNodes::from_bytes(&bytes).unwrap();
    assert_eq!(decoded.destinations.len(), 1);

    // but the marker is mandatory
    bytes[0] = 0x00;
    assert!(NetRomNodes::from_bytes(&bytes).is_err());
}

#[test]
fn nodes_split_eleven_records_per_frame() {
    let destinations: Vec<NodeDestination> = (0..25)
        .map(|n| NodeDestination {
            dest_node: AX25Call::new("N2DE", (n % 16) as u8).unwrap(),
            dest_alias: format!("AL{n}"),
            best_neighbor: call("N3DE-1"),
            quality: 200,
        })
        .collect();
    let nodes = NetRomNodes {
        sending_alias: "ALPHA".into(),
        destinations,
    };

    let frames = nodes.to_frames(&call("N0DE-1"));
    assert_eq!(frames.len(), 3);
    let counts: Vec<usize> = frames
        .iter()
        .map(|f| {
            NetRomNodes::from_bytes(&f.info)
                .unwrap()
                .destinations
                .len()
        })
        .collect();
    assert_eq!(counts, vec![11, 11, 3]);
    for frame in &frames {
        assert_eq!(frame.dest, nodes_call());
        assert_eq!(frame.source, call("N0DE-1"));
        assert_eq!(frame.protocol, L3Protocol::NetRom);
    }
}

#[test]
fn empty_nodes_broadcast_still_announces_alias() {
    let nodes = NetRomNodes {
        sending_alias: "ALPHA".into(),
        destinations: Vec::new(),
    };
    let frames = nodes.to_frames(&call("N0DE-1"));
    assert_eq!(frames.len(), 1);
    let decoded = NetRomNodes::from_bytes(&frames[0].info).unwrap();
    assert_eq!(decoded.sending_alias, "ALPHA");
    assert!(decoded.destinations.is_empty());
}
