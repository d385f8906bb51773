//! The NET/ROM network: packet handling, forwarding, and the periodic
//! NODES broadcast.
//!
//! [`NetRomNetwork`] sits behind each data link as an [`L3Handler`]. It
//! intercepts NODES broadcasts to feed the routing table, terminates
//! packets addressed to this node in the circuit machine, and forwards
//! the rest along the best-quality next hop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkConfig;
use crate::datalink::{Application, Context, ContextEvent, DataLinkEvent, L3Handler};
use crate::frame::Ax25Frame;
use crate::netrom::circuit::{CircuitAction, NetRomStateMachine};
use crate::netrom::router::{save_nodes, RoutingTable};
use crate::netrom::{nodes_call, NetRomPacket};
use crate::{AX25Call, CallParseError, L3Protocol};

/// Delay before the first NODES broadcast, so neighbors get a chance to
/// be heard first.
const INITIAL_BROADCAST_DELAY: Duration = Duration::from_secs(10);

/// Spacing between consecutive NODES frames on one link.
const INTER_FRAME_GAP: Duration = Duration::from_millis(30);

/// How the network reaches one data link: the port's local call and the
/// manager's event queue.
#[derive(Clone)]
pub struct DataLinkHandle {
    pub port: u16,
    pub link_call: AX25Call,
    pub events: mpsc::Sender<DataLinkEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct NetRomNetwork {
    node_call: AX25Call,
    nodes_interval: Duration,
    snapshot_path: PathBuf,
    sm: Mutex<NetRomStateMachine>,
    router: Mutex<RoutingTable>,
    data_links: Mutex<HashMap<u16, DataLinkHandle>>,
    app: Mutex<Option<Arc<dyn Application>>>,
    ctx_tx: mpsc::Sender<ContextEvent>,
    ctx_rx: Mutex<Option<mpsc::Receiver<ContextEvent>>>,
    cancel: CancellationToken,
}

impl NetRomNetwork {
    pub fn new(
        config: &NetworkConfig,
        snapshot_path: PathBuf,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, CallParseError> {
        let node_call = AX25Call::parse(&config.node_call)?;
        let (ctx_tx, ctx_rx) = mpsc::channel(64);
        Ok(Arc::new(Self {
            node_call,
            nodes_interval: Duration::from_secs(config.nodes_interval),
            snapshot_path,
            sm: Mutex::new(NetRomStateMachine::new(
                node_call,
                config.window_size,
                config.ttl,
            )),
            router: Mutex::new(RoutingTable::new(config)),
            data_links: Mutex::new(HashMap::new()),
            app: Mutex::new(None),
            ctx_tx,
            ctx_rx: Mutex::new(Some(ctx_rx)),
            cancel,
        }))
    }

    /// Spawn the background tasks: application context pump and the
    /// NODES broadcaster.
    pub fn start(self: &Arc<Self>) {
        if let Some(ctx_rx) = lock(&self.ctx_rx).take() {
            tokio::spawn(Arc::clone(self).pump_contexts(ctx_rx));
        }
        tokio::spawn(Arc::clone(self).broadcast_nodes());
    }

    pub fn node_call(&self) -> &AX25Call {
        &self.node_call
    }

    /// Attach a data link so packets can be routed out of its port. The
    /// link's call becomes one of ours for loop detection.
    pub fn bind_data_link(&self, handle: DataLinkHandle) {
        lock(&self.router).our_calls.push(handle.link_call);
        lock(&self.data_links).insert(handle.port, handle);
    }

    /// Bind the L4 application receiving circuit events.
    pub fn bind_application(&self, app: Arc<dyn Application>) {
        *lock(&self.app) = Some(app);
    }

    fn context(&self, remote: AX25Call) -> Context {
        Context::new(self.node_call, remote, self.ctx_tx.clone())
    }

    // --- NL requests (the L4-facing interface) ----------------------------

    /// NL_CONNECT request: open a circuit to `remote`.
    pub fn nl_connect_request(
        &self,
        remote: AX25Call,
        origin_user: AX25Call,
        origin_node: AX25Call,
    ) -> u8 {
        let (id, actions) = lock(&self.sm).connect_request(remote, origin_user, origin_node);
        self.apply_actions(actions);
        id
    }

    /// NL_DATA request on the open circuit to `remote`.
    pub fn nl_data_request(&self, remote: &AX25Call, data: Vec<u8>) {
        let actions = {
            let mut sm = lock(&self.sm);
            match sm.circuit_for_remote(remote) {
                Some(id) => sm.data_request(id, data),
                None => {
                    log::warn!("no open circuit to {remote}, dropping data");
                    Vec::new()
                }
            }
        };
        self.apply_actions(actions);
    }

    /// NL_DISCONNECT request.
    pub fn nl_disconnect_request(&self, remote: &AX25Call) {
        let actions = {
            let mut sm = lock(&self.sm);
            match sm.circuit_for_remote(remote) {
                Some(id) => sm.disconnect_request(id),
                None => Vec::new(),
            }
        };
        self.apply_actions(actions);
    }

    fn apply_actions(&self, actions: Vec<CircuitAction>) {
        for action in actions {
            match action {
                CircuitAction::SendPacket(packet) => {
                    self.write_packet(&packet);
                }
                CircuitAction::NlConnect { remote, .. } => {
                    if let Some(app) = lock(&self.app).clone() {
                        app.on_connect(&self.context(remote));
                    }
                }
                CircuitAction::NlDisconnect { remote, .. } => {
                    if let Some(app) = lock(&self.app).clone() {
                        app.on_disconnect(&self.context(remote));
                    }
                }
                CircuitAction::NlData { remote, data, .. } => {
                    if let Some(app) = lock(&self.app).clone() {
                        app.read(&self.context(remote), &data);
                    }
                }
            }
        }
    }

    /// Route a packet towards its destination. Candidates are tried
    /// best-quality first; the first data link that accepts the DL_DATA
    /// event wins.
    pub fn write_packet(&self, packet: &NetRomPacket) -> bool {
        let hops = lock(&self.router).route(&packet.dest);
        for (hop, port) in &hops {
            let Some(handle) = lock(&self.data_links).get(port).cloned() else {
                continue;
            };
            let event = DataLinkEvent::Data {
                remote: *hop,
                protocol: L3Protocol::NetRom,
                data: packet.to_bytes(),
            };
            if handle.events.try_send(event).is_ok() {
                log::debug!("routed {packet} via {hop} on port {port}");
                return true;
            }
        }
        log::warn!(
            "could not route {} to {}, candidates were {:?}",
            packet,
            packet.dest,
            hops.iter().map(|(hop, _)| hop).collect::<Vec<_>>()
        );
        false
    }

    async fn pump_contexts(self: Arc<Self>, mut ctx_rx: mpsc::Receiver<ContextEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = ctx_rx.recv() => match event {
                    Some(ContextEvent::Write { remote, data, .. }) => {
                        self.nl_data_request(&remote, data)
                    }
                    Some(ContextEvent::Close { remote, .. }) => {
                        self.nl_disconnect_request(&remote)
                    }
                    None => break,
                },
            }
        }
    }

    // --- NODES broadcast --------------------------------------------------

    async fn broadcast_nodes(self: Arc<Self>) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(INITIAL_BROADCAST_DELAY) => {}
        }
        loop {
            self.broadcast_once().await;
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.nodes_interval) => {}
            }
        }
    }

    /// Prune, snapshot, persist, and advertise. Only the prune and the
    /// snapshot happen under the routing lock; the disk write and the
    /// frame emission work on the copy.
    pub async fn broadcast_once(&self) {
        let nodes = {
            let mut router = lock(&self.router);
            router.prune_routes();
            router.get_nodes()
        };
        if let Err(err) = save_nodes(&nodes, &self.snapshot_path) {
            log::warn!("could not persist {}: {err}", self.snapshot_path.display());
        }
        let handles: Vec<DataLinkHandle> = lock(&self.data_links).values().cloned().collect();
        for handle in handles {
            for frame in nodes.to_frames(&self.node_call) {
                let event = DataLinkEvent::WriteFrame(Ax25Frame::Ui(frame));
                if handle.events.try_send(event).is_err() {
                    log::warn!("port {}: queue full, dropping NODES frame", handle.port);
                }
                tokio::time::sleep(INTER_FRAME_GAP).await;
            }
        }
    }
}

impl L3Handler for NetRomNetwork {
    fn can_handle(&self, protocol: L3Protocol) -> bool {
        protocol == L3Protocol::NetRom
    }

    /// NODES broadcasts are consumed here and never reach a session.
    fn maybe_handle_special(&self, port: u16, frame: &Ax25Frame) -> bool {
        let Ax25Frame::Ui(ui) = frame else {
            return true;
        };
        if ui.protocol != L3Protocol::NetRom || ui.dest != nodes_call() {
            return true;
        }
        match crate::netrom::NetRomNodes::from_bytes(&ui.info) {
            Ok(nodes) => {
                log::info!("NODES from {} with {} records", ui.source, nodes.destinations.len());
                lock(&self.router).update_routes(&ui.source, port, &nodes);
            }
            Err(err) => log::warn!("undecodable NODES from {}: {err}", ui.source),
        }
        false
    }

    fn handle(&self, _port: u16, remote: &AX25Call, data: &[u8]) {
        let packet = match NetRomPacket::from_bytes(data) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("undecodable NET/ROM packet from {remote}: {err}");
                return;
            }
        };
        log::debug!("NET/ROM < {packet}");

        if packet.dest == self.node_call {
            let actions = lock(&self.sm).handle_packet(packet);
            self.apply_actions(actions);
        } else if packet.ttl <= 1 {
            log::warn!("TTL expired forwarding {packet}");
        } else {
            let mut forwarded = packet;
            forwarded.ttl -= 1;
            self.write_packet(&forwarded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameRole, UiFrame};
    use crate::netrom::{NetRomNodes, NodeDestination, OpType};

    fn call(s: &str) -> AX25Call {
        AX25Call::parse(s).unwrap()
    }

    fn network() -> (Arc<NetRomNetwork>, mpsc::Receiver<DataLinkEvent>) {
        let config = NetworkConfig {
            node_call: "N0DE-1".into(),
            node_alias: "OURS".into(),
            ..NetworkConfig::default()
        };
        let path = std::env::temp_dir().join(format!(
            "netrom-network-test-{}.json",
            std::process::id()
        ));
        let network = NetRomNetwork::new(&config, path, CancellationToken::new()).unwrap();
        let (events_tx, events_rx) = mpsc::channel(16);
        network.bind_data_link(DataLinkHandle {
            port: 0,
            link_call: call("N0CALL"),
            events: events_tx,
        });
        (network, events_rx)
    }

    fn nodes_ui(from: &str, nodes: &NetRomNodes) -> Ax25Frame {
        Ax25Frame::Ui(UiFrame {
            dest: nodes_call(),
            source: call(from),
            repeaters: Vec::new(),
            role: FrameRole::Command,
            poll_final: false,
            protocol: L3Protocol::NetRom,
            info: nodes.to_bytes(),
        })
    }

    fn hear_neighbor(network: &NetRomNetwork, neighbor: &str) {
        let nodes = NetRomNodes {
            sending_alias: "PEER".into(),
            destinations: Vec::new(),
        };
        assert!(!network.maybe_handle_special(0, &nodes_ui(neighbor, &nodes)));
    }

    #[tokio::test]
    async fn nodes_broadcast_is_consumed_and_learned() {
        let (network, _events) = network();
        let nodes = NetRomNodes {
            sending_alias: "ALPHA".into(),
            destinations: vec![NodeDestination {
                dest_node: call("N2DE-1"),
                dest_alias: "BETA".into(),
                best_neighbor: call("N3DE-1"),
                quality: 192,
            }],
        };
        assert!(!network.maybe_handle_special(0, &nodes_ui("N1DE-1", &nodes)));

        let router = lock(&network.router);
        assert!(router.neighbor(&call("N1DE-1")).is_some());
        assert_eq!(
            router.destination(&call("N2DE-1")).unwrap().sorted_routes()[0].quality,
            191
        );
    }

    #[tokio::test]
    async fn non_nodes_traffic_passes_through() {
        let (network, _events) = network();
        let ui = Ax25Frame::Ui(UiFrame {
            dest: call("N0CALL"),
            source: call("N1DE-1"),
            repeaters: Vec::new(),
            role: FrameRole::Command,
            poll_final: false,
            protocol: L3Protocol::NoLayer3,
            info: b"chat".to_vec(),
        });
        assert!(network.maybe_handle_special(0, &ui));
    }

    #[tokio::test]
    async fn forwarding_decrements_ttl_and_drops_expired() {
        let (network, mut events) = network();
        hear_neighbor(&network, "N9DE-1");

        let packet = NetRomPacket::disconnect_request(call("N1DE-1"), call("N9DE-1"), 3, 1, 1);
        network.handle(0, &call("N1DE-1"), &packet.to_bytes());

        let Some(DataLinkEvent::Data { remote, data, .. }) = events.recv().await else {
            panic!("expected a forwarded packet");
        };
        assert_eq!(remote, call("N9DE-1"));
        let forwarded = NetRomPacket::from_bytes(&data).unwrap();
        assert_eq!(forwarded.ttl, 2);

        // at TTL 1 the packet dies here
        let dying = NetRomPacket::disconnect_request(call("N1DE-1"), call("N9DE-1"), 1, 1, 1);
        network.handle(0, &call("N1DE-1"), &dying.to_bytes());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_connect_request_answers_conn_ack() {
        let (network, mut events) = network();
        hear_neighbor(&network, "N1DE-1");

        let conn_req = NetRomPacket::connect_request(
            call("N1DE-1"),
            call("N0DE-1"),
            7,
            1,
            1,
            4,
            call("USER-0"),
            call("N1DE-1"),
        );
        network.handle(0, &call("N1DE-1"), &conn_req.to_bytes());

        let Some(DataLinkEvent::Data { remote, data, .. }) = events.recv().await else {
            panic!("expected a ConnAck");
        };
        assert_eq!(remote, call("N1DE-1"));
        let ack = NetRomPacket::from_bytes(&data).unwrap();
        assert_eq!(ack.op_type(), OpType::ConnectAcknowledge);
        assert_eq!((ack.circuit_idx, ack.circuit_id), (1, 1));
    }

    #[tokio::test]
    async fn no_route_reports_failure() {
        let (network, _events) = network();
        let packet = NetRomPacket::disconnect_request(call("N0DE-1"), call("N8DE-1"), 7, 1, 1);
        assert!(!network.write_packet(&packet));
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_emits_frames_and_snapshot() {
        let (network, mut events) = network();
        hear_neighbor(&network, "N1DE-1");

        network.broadcast_once().await;

        let Some(DataLinkEvent::WriteFrame(Ax25Frame::Ui(ui))) = events.recv().await else {
            panic!("expected a NODES frame");
        };
        assert_eq!(ui.dest, nodes_call());
        assert_eq!(ui.protocol, L3Protocol::NetRom);
        let nodes = NetRomNodes::from_bytes(&ui.info).unwrap();
        assert_eq!(nodes.sending_alias, "OURS");
        assert_eq!(nodes.destinations.len(), 1);

        let snapshot = std::fs::read_to_string(&network.snapshot_path).unwrap();
        assert!(snapshot.contains("\"nodeAlias\": \"OURS\""));
        let _ = std::fs::remove_file(&network.snapshot_path);
    }
}
