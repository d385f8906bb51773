//! NET/ROM circuit handling.
//!
//! A circuit is the NET/ROM analogue of an AX.25 connection, carried in
//! packets rather than frames. The machine here mirrors [`crate::link`]:
//! events in, actions out, no I/O. ConnAck replies carry the accepting
//! side's circuit index and id in the `tx_seq`/`rx_seq` header fields,
//! which is how the two sides learn to address each other.

use std::collections::{HashMap, VecDeque};

use crate::netrom::{NetRomPacket, OpType, PacketBody};
use crate::AX25Call;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Disconnected,
    AwaitingConnection,
    Connected,
    AwaitingRelease,
}

/// Requests from the layer above plus packets from the network.
#[derive(Debug, Clone)]
pub enum CircuitEvent {
    Packet(NetRomPacket),
    /// NL_CONNECT request
    ConnectRequest {
        origin_user: AX25Call,
        origin_node: AX25Call,
    },
    /// NL_DISCONNECT request
    DisconnectRequest,
    /// NL_DATA request
    DataRequest(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitAction {
    SendPacket(NetRomPacket),
    /// NL_CONNECT indication
    NlConnect { remote: AX25Call, circuit_id: u8 },
    /// NL_DISCONNECT indication
    NlDisconnect { remote: AX25Call, circuit_id: u8 },
    /// NL_DATA indication
    NlData {
        remote: AX25Call,
        circuit_id: u8,
        data: Vec<u8>,
    },
}

#[derive(Debug)]
pub struct Circuit {
    /// Our node call.
    local: AX25Call,
    /// The remote node call.
    remote: AX25Call,
    /// Our circuit index and id, as handed out in our ConnAck (or sent
    /// in our ConnReq).
    idx: u8,
    id: u8,
    /// The remote's circuit index and id, learned from its ConnReq or
    /// ConnAck.
    remote_idx: u8,
    remote_id: u8,
    state: CircuitState,
    /// Negotiated transmit window.
    window: u8,
    /// TTL for packets this circuit originates.
    ttl: u8,
    /// Next tx_seq to assign.
    vs: u8,
    /// Next tx_seq expected from the peer.
    vr: u8,
    /// Oldest unacknowledged tx_seq.
    va: u8,
    send_queue: VecDeque<Vec<u8>>,
    outstanding: VecDeque<(u8, Vec<u8>)>,
    /// Peer asked us to hold off.
    choked: bool,
}

impl Circuit {
    fn new(local: AX25Call, remote: AX25Call, idx: u8, id: u8, window: u8, ttl: u8) -> Self {
        Self {
            local,
            remote,
            idx,
            id,
            remote_idx: 0,
            remote_id: 0,
            state: CircuitState::Disconnected,
            window,
            ttl,
            vs: 0,
            vr: 0,
            va: 0,
            send_queue: VecDeque::new(),
            outstanding: VecDeque::new(),
            choked: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn remote(&self) -> &AX25Call {
        &self.remote
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    fn outstanding_count(&self) -> u8 {
        self.vs.wrapping_sub(self.va)
    }

    fn nl_connect(&self) -> CircuitAction {
        CircuitAction::NlConnect {
            remote: self.remote,
            circuit_id: self.id,
        }
    }

    fn nl_disconnect(&self) -> CircuitAction {
        CircuitAction::NlDisconnect {
            remote: self.remote,
            circuit_id: self.id,
        }
    }

    /// Ack everything up to (but not including) `rx_seq`.
    fn apply_ack(&mut self, rx_seq: u8) {
        let offset = rx_seq.wrapping_sub(self.va);
        if offset > self.outstanding_count() {
            log::warn!(
                "{}: circuit {} acked {} outside window, ignoring",
                self.local,
                self.id,
                rx_seq
            );
            return;
        }
        for _ in 0..offset {
            self.outstanding.pop_front();
        }
        self.va = rx_seq;
    }

    /// Send queued data while the peer allows it.
    fn pump(&mut self, actions: &mut Vec<CircuitAction>) {
        while !self.choked && self.outstanding_count() < self.window {
            let Some(data) = self.send_queue.pop_front() else {
                break;
            };
            let packet = NetRomPacket::information(
                self.local,
                self.remote,
                self.ttl,
                self.remote_idx,
                self.remote_id,
                self.vs,
                self.vr,
                false,
                data.clone(),
            );
            self.outstanding.push_back((self.vs, data));
            self.vs = self.vs.wrapping_add(1);
            actions.push(CircuitAction::SendPacket(packet));
        }
    }

    fn retransmit_from(&mut self, rx_seq: u8, actions: &mut Vec<CircuitAction>) {
        let frames: Vec<NetRomPacket> = self
            .outstanding
            .iter()
            .filter(|(seq, _)| seq.wrapping_sub(rx_seq) < self.window)
            .map(|(seq, data)| {
                NetRomPacket::information(
                    self.local,
                    self.remote,
                    self.ttl,
                    self.remote_idx,
                    self.remote_id,
                    *seq,
                    self.vr,
                    false,
                    data.clone(),
                )
            })
            .collect();
        for packet in frames {
            actions.push(CircuitAction::SendPacket(packet));
        }
    }

    fn info_ack(&self, nak: bool) -> NetRomPacket {
        NetRomPacket::information_ack(
            self.local,
            self.remote,
            self.ttl,
            self.remote_idx,
            self.remote_id,
            self.vr,
            false,
            nak,
        )
    }

    fn disc_ack(&self, idx: u8, id: u8) -> NetRomPacket {
        NetRomPacket::disconnect_ack(self.local, self.remote, self.ttl, idx, id)
    }

    pub fn handle_event(&mut self, event: CircuitEvent) -> Vec<CircuitAction> {
        let mut actions = Vec::new();
        match self.state {
            CircuitState::Disconnected => self.disconnected(event, &mut actions),
            CircuitState::AwaitingConnection => self.awaiting_connection(event, &mut actions),
            CircuitState::Connected => self.connected(event, &mut actions),
            CircuitState::AwaitingRelease => self.awaiting_release(event, &mut actions),
        }
        actions
    }

    fn disconnected(&mut self, event: CircuitEvent, actions: &mut Vec<CircuitAction>) {
        match event {
            CircuitEvent::ConnectRequest {
                origin_user,
                origin_node,
            } => {
                self.state = CircuitState::AwaitingConnection;
                actions.push(CircuitAction::SendPacket(NetRomPacket::connect_request(
                    self.local,
                    self.remote,
                    self.ttl,
                    self.idx,
                    self.id,
                    self.window,
                    origin_user,
                    origin_node,
                )));
            }
            CircuitEvent::Packet(packet) => match (packet.op_type(), &packet.body) {
                (
                    OpType::ConnectRequest,
                    PacketBody::ConnectRequest {
                        proposed_window, ..
                    },
                ) => {
                    self.remote_idx = packet.circuit_idx;
                    self.remote_id = packet.circuit_id;
                    if *proposed_window > 0 {
                        self.window = self.window.min(*proposed_window);
                    }
                    self.state = CircuitState::Connected;
                    actions.push(CircuitAction::SendPacket(NetRomPacket::connect_ack(
                        self.local,
                        self.remote,
                        self.ttl,
                        self.remote_idx,
                        self.remote_id,
                        self.idx,
                        self.id,
                        self.window,
                        false,
                    )));
                    actions.push(self.nl_connect());
                }
                (OpType::DisconnectRequest, _) => {
                    actions.push(CircuitAction::SendPacket(
                        self.disc_ack(packet.circuit_idx, packet.circuit_id),
                    ));
                }
                _ => log::debug!("{}: {} for closed circuit, dropping", self.local, packet),
            },
            CircuitEvent::DataRequest(_) | CircuitEvent::DisconnectRequest => {
                log::warn!("{}: request on closed circuit {}", self.local, self.id);
            }
        }
    }

    fn awaiting_connection(&mut self, event: CircuitEvent, actions: &mut Vec<CircuitAction>) {
        match event {
            CircuitEvent::Packet(packet) => match (packet.op_type(), &packet.body) {
                (OpType::ConnectAcknowledge, PacketBody::ConnectAcknowledge { accept_window }) => {
                    if packet.choke() {
                        // choke on a ConnAck is a refusal
                        self.state = CircuitState::Disconnected;
                        actions.push(self.nl_disconnect());
                        return;
                    }
                    self.remote_idx = packet.tx_seq;
                    self.remote_id = packet.rx_seq;
                    if *accept_window > 0 {
                        self.window = self.window.min(*accept_window);
                    }
                    self.state = CircuitState::Connected;
                    actions.push(self.nl_connect());
                    self.pump(actions);
                }
                (OpType::DisconnectRequest, _) => {
                    actions.push(CircuitAction::SendPacket(
                        self.disc_ack(packet.circuit_idx, packet.circuit_id),
                    ));
                    self.state = CircuitState::Disconnected;
                    actions.push(self.nl_disconnect());
                }
                _ => log::debug!("{}: unexpected {} while connecting", self.local, packet),
            },
            CircuitEvent::DataRequest(data) => self.send_queue.push_back(data),
            CircuitEvent::DisconnectRequest => {
                self.state = CircuitState::Disconnected;
                actions.push(self.nl_disconnect());
            }
            CircuitEvent::ConnectRequest { .. } => {}
        }
    }

    fn connected(&mut self, event: CircuitEvent, actions: &mut Vec<CircuitAction>) {
        match event {
            CircuitEvent::DataRequest(data) => {
                self.send_queue.push_back(data);
                self.pump(actions);
            }
            CircuitEvent::DisconnectRequest => {
                self.send_queue.clear();
                self.outstanding.clear();
                self.state = CircuitState::AwaitingRelease;
                actions.push(CircuitAction::SendPacket(NetRomPacket::disconnect_request(
                    self.local,
                    self.remote,
                    self.ttl,
                    self.remote_idx,
                    self.remote_id,
                )));
            }
            CircuitEvent::ConnectRequest { .. } => {}
            CircuitEvent::Packet(packet) => {
                match (packet.op_type(), packet.body.clone()) {
                    (OpType::ConnectRequest, _) => {
                        // our ConnAck was lost; repeat it
                        actions.push(CircuitAction::SendPacket(NetRomPacket::connect_ack(
                            self.local,
                            self.remote,
                            self.ttl,
                            self.remote_idx,
                            self.remote_id,
                            self.idx,
                            self.id,
                            self.window,
                            false,
                        )));
                    }
                    (OpType::Information, PacketBody::Information { info }) => {
                        self.choked = packet.choke();
                        self.apply_ack(packet.rx_seq);
                        if packet.tx_seq == self.vr {
                            self.vr = self.vr.wrapping_add(1);
                            actions.push(CircuitAction::NlData {
                                remote: self.remote,
                                circuit_id: self.id,
                                data: info,
                            });
                            actions.push(CircuitAction::SendPacket(self.info_ack(false)));
                        } else {
                            // out of sequence: ask for a resend from V(R)
                            log::debug!(
                                "{}: circuit {} expected TX={} got {}",
                                self.local,
                                self.id,
                                self.vr,
                                packet.tx_seq
                            );
                            actions.push(CircuitAction::SendPacket(self.info_ack(true)));
                        }
                        if !self.choked {
                            self.pump(actions);
                        }
                    }
                    (OpType::InformationAcknowledge, _) => {
                        self.choked = packet.choke();
                        self.apply_ack(packet.rx_seq);
                        if packet.nak() {
                            self.retransmit_from(packet.rx_seq, actions);
                        }
                        if !self.choked {
                            self.pump(actions);
                        }
                    }
                    (OpType::DisconnectRequest, _) => {
                        actions.push(CircuitAction::SendPacket(
                            self.disc_ack(packet.circuit_idx, packet.circuit_id),
                        ));
                        self.send_queue.clear();
                        self.outstanding.clear();
                        self.state = CircuitState::Disconnected;
                        actions.push(self.nl_disconnect());
                    }
                    _ => log::debug!("{}: unexpected {} on circuit {}", self.local, packet, self.id),
                }
            }
        }
    }

    fn awaiting_release(&mut self, event: CircuitEvent, actions: &mut Vec<CircuitAction>) {
        match event {
            CircuitEvent::Packet(packet) => match packet.op_type() {
                OpType::DisconnectAcknowledge => {
                    self.state = CircuitState::Disconnected;
                    actions.push(self.nl_disconnect());
                }
                OpType::DisconnectRequest => {
                    actions.push(CircuitAction::SendPacket(
                        self.disc_ack(packet.circuit_idx, packet.circuit_id),
                    ));
                    self.state = CircuitState::Disconnected;
                    actions.push(self.nl_disconnect());
                }
                _ => {}
            },
            _ => {}
        }
    }
}

/// All circuits terminating at this node, keyed by our circuit id.
pub struct NetRomStateMachine {
    local: AX25Call,
    window: u8,
    ttl: u8,
    circuits: HashMap<u8, Circuit>,
    next_id: u8,
}

impl NetRomStateMachine {
    pub fn new(local: AX25Call, window: u8, ttl: u8) -> Self {
        Self {
            local,
            window,
            ttl,
            circuits: HashMap::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> u8 {
        // id 0 is avoided so a zeroed header never addresses a live
        // circuit by accident
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.circuits.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    pub fn circuit(&self, id: u8) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn circuit_ids(&self) -> Vec<u8> {
        self.circuits.keys().copied().collect()
    }

    /// The open circuit to `remote`, if any.
    pub fn circuit_for_remote(&self, remote: &AX25Call) -> Option<u8> {
        self.circuits
            .values()
            .find(|c| c.remote() == remote && c.state() != CircuitState::Disconnected)
            .map(|c| c.id())
    }

    /// NL_CONNECT request: open a circuit towards `remote`.
    pub fn connect_request(
        &mut self,
        remote: AX25Call,
        origin_user: AX25Call,
        origin_node: AX25Call,
    ) -> (u8, Vec<CircuitAction>) {
        let id = self.allocate_id();
        let mut circuit = Circuit::new(self.local, remote, id, id, self.window, self.ttl);
        let actions = circuit.handle_event(CircuitEvent::ConnectRequest {
            origin_user,
            origin_node,
        });
        self.circuits.insert(id, circuit);
        (id, actions)
    }

    /// NL_DATA request on an open circuit.
    pub fn data_request(&mut self, circuit_id: u8, data: Vec<u8>) -> Vec<CircuitAction> {
        match self.circuits.get_mut(&circuit_id) {
            Some(circuit) => circuit.handle_event(CircuitEvent::DataRequest(data)),
            None => {
                log::warn!("{}: data request for unknown circuit {circuit_id}", self.local);
                Vec::new()
            }
        }
    }

    /// NL_DISCONNECT request.
    pub fn disconnect_request(&mut self, circuit_id: u8) -> Vec<CircuitAction> {
        match self.circuits.get_mut(&circuit_id) {
            Some(circuit) => circuit.handle_event(CircuitEvent::DisconnectRequest),
            None => Vec::new(),
        }
    }

    /// Dispatch a packet addressed to this node.
    pub fn handle_packet(&mut self, packet: NetRomPacket) -> Vec<CircuitAction> {
        let actions = match packet.op_type() {
            OpType::ConnectRequest => {
                // a repeated ConnReq must land on the same circuit
                let existing = self
                    .circuits
                    .values()
                    .find(|c| {
                        c.remote() == &packet.source
                            && c.remote_idx == packet.circuit_idx
                            && c.remote_id == packet.circuit_id
                            && c.state() != CircuitState::Disconnected
                    })
                    .map(|c| c.id());
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = self.allocate_id();
                        self.circuits.insert(
                            id,
                            Circuit::new(self.local, packet.source, id, id, self.window, self.ttl),
                        );
                        id
                    }
                };
                self.circuits
                    .get_mut(&id)
                    .map(|c| c.handle_event(CircuitEvent::Packet(packet)))
            }
            OpType::Unknown => {
                log::warn!(
                    "{}: unknown NET/ROM opcode {:#04x} from {}, dropping",
                    self.local,
                    packet.op_byte,
                    packet.source
                );
                return Vec::new();
            }
            _ => {
                // everything else addresses our circuit id directly
                match self.circuits.get_mut(&packet.circuit_id) {
                    Some(circuit) => Some(circuit.handle_event(CircuitEvent::Packet(packet))),
                    None => {
                        log::debug!("{}: {} for unknown circuit, dropping", self.local, packet);
                        None
                    }
                }
            }
        };
        self.reap_closed();
        actions.unwrap_or_default()
    }

    /// Disconnected circuits are gone for good; their ids can be reused.
    fn reap_closed(&mut self) {
        self.circuits
            .retain(|_, c| c.state() != CircuitState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(s: &str) -> AX25Call {
        AX25Call::parse(s).unwrap()
    }

    fn machines() -> (NetRomStateMachine, NetRomStateMachine) {
        (
            NetRomStateMachine::new(call("N0DE-1"), 4, 7),
            NetRomStateMachine::new(call("N1DE-1"), 4, 7),
        )
    }

    fn packets(actions: &[CircuitAction]) -> Vec<NetRomPacket> {
        actions
            .iter()
            .filter_map(|a| match a {
                CircuitAction::SendPacket(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn delivered(actions: &[CircuitAction]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                CircuitAction::NlData { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Open a circuit from a to b, returning (a_circuit_id, b actions).
    fn open(a: &mut NetRomStateMachine, b: &mut NetRomStateMachine) -> u8 {
        let (id, actions) = a.connect_request(call("N1DE-1"), call("USER-0"), call("N0DE-1"));
        let conn_req = &packets(&actions)[0];
        let b_actions = b.handle_packet(conn_req.clone());
        assert!(b_actions
            .iter()
            .any(|a| matches!(a, CircuitAction::NlConnect { .. })));
        let conn_ack = &packets(&b_actions)[0];
        let a_actions = a.handle_packet(conn_ack.clone());
        assert!(a_actions
            .iter()
            .any(|a| matches!(a, CircuitAction::NlConnect { .. })));
        id
    }

    #[test]
    fn connect_exchange() {
        let (mut a, mut b) = machines();
        let id = open(&mut a, &mut b);
        let circuit = a.circuit(id).unwrap();
        assert_eq!(circuit.state(), CircuitState::Connected);
        assert_eq!(circuit.remote(), &call("N1DE-1"));
        // the accepting side's ids came back in tx/rx seq
        assert_eq!(circuit.remote_id, b.circuit_for_remote(&call("N0DE-1")).unwrap());
    }

    #[test]
    fn connect_request_wire_fields() {
        let (mut a, _) = machines();
        let (id, actions) = a.connect_request(call("N1DE-1"), call("USER-0"), call("N0DE-1"));
        let p = &packets(&actions)[0];
        assert_eq!(p.op_type(), OpType::ConnectRequest);
        assert_eq!((p.circuit_idx, p.circuit_id), (id, id));
        assert_eq!(p.ttl, 7);
        let PacketBody::ConnectRequest {
            proposed_window,
            origin_user,
            origin_node,
        } = &p.body
        else {
            panic!("wrong body {:?}", p.body);
        };
        assert_eq!(*proposed_window, 4);
        assert_eq!(origin_user, &call("USER-0"));
        assert_eq!(origin_node, &call("N0DE-1"));
    }

    #[test]
    fn info_exchange_with_acks() {
        let (mut a, mut b) = machines();
        let id = open(&mut a, &mut b);

        let actions = a.data_request(id, b"hello".to_vec());
        let info = &packets(&actions)[0];
        assert_eq!(info.op_type(), OpType::Information);
        assert_eq!(info.tx_seq, 0);

        let b_actions = b.handle_packet(info.clone());
        assert_eq!(delivered(&b_actions), vec![b"hello".to_vec()]);
        let ack = &packets(&b_actions)[0];
        assert_eq!(ack.op_type(), OpType::InformationAcknowledge);
        assert_eq!(ack.rx_seq, 1);

        a.handle_packet(ack.clone());
        let circuit = a.circuit(id).unwrap();
        assert_eq!(circuit.va, 1);
        assert!(circuit.outstanding.is_empty());
    }

    #[test]
    fn out_of_sequence_info_draws_a_nak() {
        let (mut a, mut b) = machines();
        let id = open(&mut a, &mut b);

        // "one" is transmitted but never arrives
        let _lost = packets(&a.data_request(id, b"one".to_vec()));
        let second = packets(&a.data_request(id, b"two".to_vec()))[0].clone();

        // "two" arrives first
        let b_actions = b.handle_packet(second);
        assert!(delivered(&b_actions).is_empty());
        let nak = &packets(&b_actions)[0];
        assert!(nak.nak());
        assert_eq!(nak.rx_seq, 0);

        // the nak retransmits from seq 0
        let resent = packets(&a.handle_packet(nak.clone()));
        assert_eq!(resent.len(), 2);
        assert_eq!(resent[0].tx_seq, 0);
        assert_eq!(resent[1].tx_seq, 1);

        let mut got = Vec::new();
        for p in resent {
            got.extend(delivered(&b.handle_packet(p)));
        }
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn choke_suppresses_sends_until_released() {
        let (mut a, mut b) = machines();
        let id = open(&mut a, &mut b);

        // peer chokes us with an InfoAck
        let choke =
            NetRomPacket::information_ack(call("N1DE-1"), call("N0DE-1"), 7, id, id, 0, true, false);
        assert!(choke.choke());
        a.handle_packet(choke);

        // nothing goes out while choked
        let held = a.data_request(id, b"held".to_vec());
        assert!(packets(&held).is_empty());

        // a non-choked frame from the peer reopens the window
        let release =
            NetRomPacket::information_ack(call("N1DE-1"), call("N0DE-1"), 7, id, id, 0, false, false);
        let resumed = packets(&a.handle_packet(release));
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].op_type(), OpType::Information);
    }

    #[test]
    fn disconnect_exchange() {
        let (mut a, mut b) = machines();
        let id = open(&mut a, &mut b);
        let b_id = b.circuit_for_remote(&call("N0DE-1")).unwrap();

        let disc = packets(&a.disconnect_request(id))[0].clone();
        assert_eq!(disc.op_type(), OpType::DisconnectRequest);

        let b_actions = b.handle_packet(disc);
        assert!(b_actions
            .iter()
            .any(|a| matches!(a, CircuitAction::NlDisconnect { .. })));
        assert!(b.circuit(b_id).is_none(), "closed circuits are reaped");

        let ack = packets(&b_actions)[0].clone();
        let a_actions = a.handle_packet(ack);
        assert!(a_actions
            .iter()
            .any(|a| matches!(a, CircuitAction::NlDisconnect { .. })));
        assert!(a.circuit(id).is_none());
    }

    #[test]
    fn refused_connection_reports_disconnect() {
        let (mut a, _) = machines();
        let (id, actions) = a.connect_request(call("N1DE-1"), call("USER-0"), call("N0DE-1"));
        let req = &packets(&actions)[0];
        // refusal: ConnAck with the choke bit
        let refusal = NetRomPacket::connect_ack(
            call("N1DE-1"),
            call("N0DE-1"),
            7,
            req.circuit_idx,
            req.circuit_id,
            0,
            0,
            0,
            true,
        );
        let a_actions = a.handle_packet(refusal);
        assert!(a_actions
            .iter()
            .any(|a| matches!(a, CircuitAction::NlDisconnect { .. })));
        assert!(a.circuit(id).is_none());
    }

    #[test]
    fn unknown_opcode_is_dropped_not_fatal() {
        let (mut a, _) = machines();
        let mut packet = NetRomPacket::disconnect_ack(call("N1DE-1"), call("N0DE-1"), 7, 1, 1);
        packet.op_byte = 0x0F; // unknown opcode, flags clear
        packet.body = PacketBody::Unknown { tail: vec![] };
        assert!(a.handle_packet(packet).is_empty());
    }
}
