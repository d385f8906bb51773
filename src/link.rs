//! The AX.25 data-link state machine, one instance per (local, remote)
//! connection.
//!
//! A [`LinkSession`] is a plain value: events go in, state variables
//! move, and a list of [`LinkAction`]s comes out for the owner to carry
//! out (frames to transmit, DL indications to raise, timers to arm).
//! Nothing here does I/O or takes locks, which keeps the transition
//! matrix testable frame by frame.
//!
//! The matrix follows the 1998 AX.25 v2.2 specification with modulo-8
//! sequencing. SABME (modulo 128) is answered with DM.

use std::collections::VecDeque;

use crate::frame::{
    Ax25Frame, FrameRole, IFrame, SFrame, SupervisoryKind, UFrame, UiFrame, UnnumberedKind,
};
use crate::{AX25Call, L3Protocol};

/// Modulo-8 sequence space.
const MODULO: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    AwaitingConnection,
    Connected,
    TimerRecovery,
    AwaitingRelease,
}

/// Why a session reported `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We asked for the release and the peer confirmed (or timed out).
    Requested,
    /// The peer refused our SABM with DM.
    RemoteRefused,
    /// Retries exhausted with no sign of the peer.
    PeerBusyOrGone,
    /// The peer sent DISC.
    PeerRequested,
}

/// Everything a session reacts to: inbound frames, DL requests from the
/// layer above, and timer expiries.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Frame(Ax25Frame),
    /// DL_CONNECT request
    Connect,
    /// DL_DISCONNECT request
    Disconnect,
    /// DL_DATA request
    Data { protocol: L3Protocol, data: Vec<u8> },
    /// DL_UNIT_DATA request
    UnitData { protocol: L3Protocol, data: Vec<u8> },
    T1Expired,
    T3Expired,
}

/// What the owner must do after an event is handled, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    SendFrame(Ax25Frame),
    /// DL_DATA indication
    DeliverData { protocol: L3Protocol, data: Vec<u8> },
    /// DL_UNIT_DATA indication
    DeliverUnitData { protocol: L3Protocol, data: Vec<u8> },
    /// DL_CONNECT indication
    Connected,
    /// DL_DISCONNECT indication
    Disconnected(DisconnectReason),
    /// DL_ERROR indication with a code from the AX.25 catalogue
    Error(char),
    StartT1,
    StopT1,
    StartT3,
    StopT3,
}

/// The AX.25 error catalogue, appendix C4 of the v2.2 specification.
pub fn error_message(code: char) -> &'static str {
    match code {
        'A' => "F=1 received but P=1 not outstanding",
        'B' => "unexpected DM with F=1 in connected state",
        'C' => "unexpected UA in connected state",
        'D' => "UA received without F=1 when SABM or DISC was sent P=1",
        'E' => "DM received in connected state",
        'F' => "data link reset by SABM",
        'G' => "connection retries exceeded",
        'H' => "disconnect retries exceeded",
        'I' => "retries exceeded with unacknowledged data",
        'J' => "N(R) sequence error",
        'K' => "frame reject received",
        'L' => "control field invalid or not implemented",
        'M' => "information field not permitted in this frame",
        'N' => "incorrect frame length for frame type",
        'O' => "I frame exceeded maximum allowed length",
        'P' => "N(S) out of the window",
        'Q' => "UI response received, or UI command with P=1",
        'R' => "UI frame exceeded maximum allowed length",
        'S' => "I response received",
        'T' => "retries exceeded with no response to enquiry",
        'U' => "retries exceeded while peer busy",
        'V' => "no data link available",
        _ => "unknown error",
    }
}

/// An I frame we have sent but not yet seen acknowledged.
#[derive(Debug, Clone)]
struct Outstanding {
    ns: u8,
    protocol: L3Protocol,
    data: Vec<u8>,
}

pub struct LinkSession {
    local: AX25Call,
    remote: AX25Call,
    state: LinkState,
    /// Send state variable: N(S) of the next new I frame.
    vs: u8,
    /// Receive state variable: N(S) expected next from the peer.
    vr: u8,
    /// Acknowledge state variable: oldest unacknowledged N(S).
    va: u8,
    /// Window size k.
    window: u8,
    /// Retry limit N2.
    n2: u8,
    retries: u8,
    outstanding: VecDeque<Outstanding>,
    send_queue: VecDeque<(L3Protocol, Vec<u8>)>,
    peer_busy: bool,
    /// A REJ has been sent and not yet cleared by an in-sequence frame.
    reject_sent: bool,
}

impl LinkSession {
    pub fn new(local: AX25Call, remote: AX25Call, window: u8, n2: u8) -> Self {
        Self {
            local,
            remote,
            state: LinkState::Disconnected,
            vs: 0,
            vr: 0,
            va: 0,
            window,
            n2,
            retries: 0,
            outstanding: VecDeque::new(),
            send_queue: VecDeque::new(),
            peer_busy: false,
            reject_sent: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn remote(&self) -> &AX25Call {
        &self.remote
    }

    pub fn local(&self) -> &AX25Call {
        &self.local
    }

    /// Number of I frames sent but unacknowledged: V(S) - V(A) mod 8.
    fn outstanding_count(&self) -> u8 {
        self.vs.wrapping_sub(self.va) & (MODULO - 1)
    }

    pub fn handle_event(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        let mut actions = Vec::new();
        match event {
            // UI traffic is connectionless and state-independent
            LinkEvent::UnitData { protocol, data } => {
                actions.push(LinkAction::SendFrame(self.ui_frame(protocol, data)));
            }
            LinkEvent::Frame(Ax25Frame::Ui(ui)) => {
                actions.push(LinkAction::DeliverUnitData {
                    protocol: ui.protocol,
                    data: ui.info,
                });
            }
            LinkEvent::Frame(Ax25Frame::U(u))
                if matches!(u.kind, UnnumberedKind::Xid | UnnumberedKind::Test) =>
            {
                log::debug!("{}: ignoring {:?} from {}", self.local, u.kind, self.remote);
            }
            event => match self.state {
                LinkState::Disconnected => self.disconnected(event, &mut actions),
                LinkState::AwaitingConnection => self.awaiting_connection(event, &mut actions),
                LinkState::Connected => self.connected(event, &mut actions),
                LinkState::TimerRecovery => self.timer_recovery(event, &mut actions),
                LinkState::AwaitingRelease => self.awaiting_release(event, &mut actions),
            },
        }
        actions
    }

    // --- frame builders ---------------------------------------------------

    fn u_frame(&self, kind: UnnumberedKind, role: FrameRole, poll_final: bool) -> Ax25Frame {
        Ax25Frame::U(UFrame {
            dest: self.remote,
            source: self.local,
            repeaters: Vec::new(),
            role,
            kind,
            poll_final,
        })
    }

    fn s_frame(&self, kind: SupervisoryKind, role: FrameRole, poll_final: bool) -> Ax25Frame {
        Ax25Frame::S(SFrame {
            dest: self.remote,
            source: self.local,
            repeaters: Vec::new(),
            role,
            kind,
            poll_final,
            nr: self.vr,
        })
    }

    fn i_frame(&self, ns: u8, poll: bool, protocol: L3Protocol, data: Vec<u8>) -> Ax25Frame {
        Ax25Frame::I(IFrame {
            dest: self.remote,
            source: self.local,
            repeaters: Vec::new(),
            role: FrameRole::Command,
            poll,
            ns,
            nr: self.vr,
            protocol,
            info: data,
        })
    }

    fn ui_frame(&self, protocol: L3Protocol, data: Vec<u8>) -> Ax25Frame {
        Ax25Frame::Ui(UiFrame {
            dest: self.remote,
            source: self.local,
            repeaters: Vec::new(),
            role: FrameRole::Command,
            poll_final: false,
            protocol,
            info: data,
        })
    }

    // --- shared pieces ----------------------------------------------------

    fn reset_variables(&mut self) {
        self.vs = 0;
        self.vr = 0;
        self.va = 0;
        self.retries = 0;
        self.peer_busy = false;
        self.reject_sent = false;
    }

    fn clear_queues(&mut self) {
        self.outstanding.clear();
        self.send_queue.clear();
    }

    fn enter_disconnected(&mut self, actions: &mut Vec<LinkAction>, reason: DisconnectReason) {
        self.clear_queues();
        self.reset_variables();
        self.state = LinkState::Disconnected;
        actions.push(LinkAction::StopT1);
        actions.push(LinkAction::StopT3);
        actions.push(LinkAction::Disconnected(reason));
    }

    fn enter_connected(&mut self, actions: &mut Vec<LinkAction>) {
        self.reset_variables();
        self.outstanding.clear();
        self.state = LinkState::Connected;
        actions.push(LinkAction::StopT1);
        actions.push(LinkAction::StartT3);
        actions.push(LinkAction::Connected);
    }

    fn send_sabm(&mut self, actions: &mut Vec<LinkAction>) {
        actions.push(LinkAction::SendFrame(self.u_frame(
            UnnumberedKind::Sabm,
            FrameRole::Command,
            true,
        )));
        actions.push(LinkAction::StartT1);
    }

    /// Tear down and try to establish again after a protocol violation.
    fn re_establish(&mut self, actions: &mut Vec<LinkAction>) {
        self.clear_queues();
        self.reset_variables();
        self.state = LinkState::AwaitingConnection;
        actions.push(LinkAction::StopT3);
        self.send_sabm(actions);
    }

    /// Apply an incoming N(R). Returns `Ok(advanced)` or `Err(())` when
    /// N(R) falls outside [V(A), V(S)].
    fn apply_ack(&mut self, nr: u8) -> Result<bool, ()> {
        let span = self.outstanding_count();
        let offset = nr.wrapping_sub(self.va) & (MODULO - 1);
        if offset > span {
            return Err(());
        }
        for _ in 0..offset {
            self.outstanding.pop_front();
        }
        self.va = nr;
        Ok(offset > 0)
    }

    /// Transmit queued data while the window has room.
    fn pump(&mut self, actions: &mut Vec<LinkAction>) {
        let mut sent = false;
        loop {
            if self.peer_busy || self.outstanding_count() >= self.window {
                break;
            }
            let Some((protocol, data)) = self.send_queue.pop_front() else {
                break;
            };
            let frame = self.i_frame(self.vs, false, protocol, data.clone());
            self.outstanding.push_back(Outstanding {
                ns: self.vs,
                protocol,
                data,
            });
            self.vs = (self.vs + 1) % MODULO;
            actions.push(LinkAction::SendFrame(frame));
            sent = true;
        }
        if sent {
            actions.push(LinkAction::StopT3);
            actions.push(LinkAction::StartT1);
        }
    }

    /// Retransmit everything still outstanding, oldest first.
    fn retransmit_outstanding(&mut self, actions: &mut Vec<LinkAction>) {
        let frames: Vec<Ax25Frame> = self
            .outstanding
            .iter()
            .map(|o| self.i_frame(o.ns, false, o.protocol, o.data.clone()))
            .collect();
        let any = !frames.is_empty();
        for frame in frames {
            actions.push(LinkAction::SendFrame(frame));
        }
        if any {
            actions.push(LinkAction::StartT1);
        }
    }

    fn nr_error(&mut self, actions: &mut Vec<LinkAction>) {
        actions.push(LinkAction::Error('J'));
        self.re_establish(actions);
    }

    /// Restart the right timer after traffic in Connected: T1 while
    /// anything is outstanding, T3 once everything is acknowledged.
    fn settle_timers(&mut self, advanced: bool, actions: &mut Vec<LinkAction>) {
        if self.outstanding.is_empty() {
            actions.push(LinkAction::StopT1);
            actions.push(LinkAction::StartT3);
        } else if advanced {
            actions.push(LinkAction::StartT1);
        }
    }

    // --- Disconnected -----------------------------------------------------

    fn disconnected(&mut self, event: LinkEvent, actions: &mut Vec<LinkAction>) {
        match event {
            LinkEvent::Connect => {
                self.reset_variables();
                self.state = LinkState::AwaitingConnection;
                self.send_sabm(actions);
            }
            LinkEvent::Data { protocol, data } => {
                // the layer above wants a connection; raise one
                self.send_queue.push_back((protocol, data));
                self.reset_variables();
                self.state = LinkState::AwaitingConnection;
                self.send_sabm(actions);
            }
            LinkEvent::Frame(Ax25Frame::U(u)) => match u.kind {
                UnnumberedKind::Sabm => {
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Ua,
                        FrameRole::Response,
                        u.poll_final,
                    )));
                    self.enter_connected(actions);
                }
                UnnumberedKind::Sabme => {
                    // modulo-128 not supported
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Dm,
                        FrameRole::Response,
                        u.poll_final,
                    )));
                }
                UnnumberedKind::Disc => {
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Dm,
                        FrameRole::Response,
                        u.poll_final,
                    )));
                }
                UnnumberedKind::Dm | UnnumberedKind::Ua | UnnumberedKind::Frmr => {}
                UnnumberedKind::Xid | UnnumberedKind::Test => {}
            },
            LinkEvent::Frame(Ax25Frame::I(f)) => {
                if f.poll {
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Dm,
                        FrameRole::Response,
                        true,
                    )));
                }
            }
            LinkEvent::Frame(Ax25Frame::S(s)) => {
                if s.poll_final {
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Dm,
                        FrameRole::Response,
                        true,
                    )));
                }
            }
            LinkEvent::Disconnect
            | LinkEvent::T1Expired
            | LinkEvent::T3Expired
            | LinkEvent::Frame(Ax25Frame::Ui(_))
            | LinkEvent::UnitData { .. } => {}
        }
    }

    // --- AwaitingConnection -----------------------------------------------

    fn awaiting_connection(&mut self, event: LinkEvent, actions: &mut Vec<LinkAction>) {
        match event {
            LinkEvent::Frame(Ax25Frame::U(u)) => match u.kind {
                UnnumberedKind::Ua => {
                    // queued DL_DATA survives establishment
                    self.enter_connected(actions);
                    self.pump(actions);
                }
                UnnumberedKind::Dm => {
                    actions.push(LinkAction::StopT1);
                    self.enter_disconnected(actions, DisconnectReason::RemoteRefused);
                }
                UnnumberedKind::Sabm => {
                    // Simultaneous SABM. The station with the smaller
                    // callsign wins and keeps waiting for UA; the other
                    // abandons its attempt and answers as responder.
                    if self.local < self.remote {
                        log::debug!("{}: SABM collision with {}, holding", self.local, self.remote);
                    } else {
                        actions.push(LinkAction::SendFrame(self.u_frame(
                            UnnumberedKind::Ua,
                            FrameRole::Response,
                            u.poll_final,
                        )));
                        self.enter_connected(actions);
                        self.pump(actions);
                    }
                }
                UnnumberedKind::Disc => {
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Dm,
                        FrameRole::Response,
                        u.poll_final,
                    )));
                }
                _ => {}
            },
            LinkEvent::Data { protocol, data } => {
                // held until the UA arrives
                self.send_queue.push_back((protocol, data));
            }
            LinkEvent::Disconnect => {
                self.clear_queues();
                self.retries = 0;
                self.state = LinkState::AwaitingRelease;
                actions.push(LinkAction::SendFrame(self.u_frame(
                    UnnumberedKind::Disc,
                    FrameRole::Command,
                    true,
                )));
                actions.push(LinkAction::StartT1);
            }
            LinkEvent::T1Expired => {
                if self.retries < self.n2 {
                    self.retries += 1;
                    self.send_sabm(actions);
                } else {
                    actions.push(LinkAction::Error('G'));
                    self.enter_disconnected(actions, DisconnectReason::PeerBusyOrGone);
                }
            }
            _ => {}
        }
    }

    // --- Connected --------------------------------------------------------

    fn connected(&mut self, event: LinkEvent, actions: &mut Vec<LinkAction>) {
        match event {
            LinkEvent::Data { protocol, data } => {
                self.send_queue.push_back((protocol, data));
                self.pump(actions);
            }
            LinkEvent::Disconnect => {
                self.clear_queues();
                self.retries = 0;
                self.state = LinkState::AwaitingRelease;
                actions.push(LinkAction::SendFrame(self.u_frame(
                    UnnumberedKind::Disc,
                    FrameRole::Command,
                    true,
                )));
                actions.push(LinkAction::StopT3);
                actions.push(LinkAction::StartT1);
            }
            LinkEvent::Frame(Ax25Frame::I(f)) => self.on_i_frame(f, actions),
            LinkEvent::Frame(Ax25Frame::S(s)) => self.on_s_frame(s, actions),
            LinkEvent::Frame(Ax25Frame::U(u)) => self.on_u_frame_connected(u.kind, u.poll_final, actions),
            LinkEvent::T1Expired => {
                // no ack in time: poll the peer for its state
                self.retries = 1;
                self.state = LinkState::TimerRecovery;
                actions.push(LinkAction::SendFrame(self.s_frame(
                    SupervisoryKind::ReceiveReady,
                    FrameRole::Command,
                    true,
                )));
                actions.push(LinkAction::StartT1);
            }
            LinkEvent::T3Expired => {
                // idle too long: keep-alive probe
                self.retries = 0;
                self.state = LinkState::TimerRecovery;
                actions.push(LinkAction::SendFrame(self.s_frame(
                    SupervisoryKind::ReceiveReady,
                    FrameRole::Command,
                    true,
                )));
                actions.push(LinkAction::StartT1);
            }
            LinkEvent::Connect | LinkEvent::UnitData { .. } | LinkEvent::Frame(Ax25Frame::Ui(_)) => {}
        }
    }

    fn on_i_frame(&mut self, f: IFrame, actions: &mut Vec<LinkAction>) {
        let advanced = match self.apply_ack(f.nr) {
            Ok(advanced) => advanced,
            Err(()) => {
                self.nr_error(actions);
                return;
            }
        };
        if f.ns == self.vr {
            self.vr = (self.vr + 1) % MODULO;
            self.reject_sent = false;
            actions.push(LinkAction::DeliverData {
                protocol: f.protocol,
                data: f.info,
            });
            actions.push(LinkAction::SendFrame(self.s_frame(
                SupervisoryKind::ReceiveReady,
                FrameRole::Response,
                f.poll,
            )));
        } else if !self.reject_sent {
            self.reject_sent = true;
            actions.push(LinkAction::SendFrame(self.s_frame(
                SupervisoryKind::Reject,
                FrameRole::Response,
                f.poll,
            )));
        } else if f.poll {
            actions.push(LinkAction::SendFrame(self.s_frame(
                SupervisoryKind::ReceiveReady,
                FrameRole::Response,
                true,
            )));
        }
        self.settle_timers(advanced, actions);
        self.pump(actions);
    }

    fn on_s_frame(&mut self, s: SFrame, actions: &mut Vec<LinkAction>) {
        match s.kind {
            SupervisoryKind::ReceiveReady | SupervisoryKind::Reject => self.peer_busy = false,
            SupervisoryKind::ReceiveNotReady => self.peer_busy = true,
            SupervisoryKind::SelectiveReject => {}
        }
        let advanced = match self.apply_ack(s.nr) {
            Ok(advanced) => advanced,
            Err(()) => {
                self.nr_error(actions);
                return;
            }
        };
        match s.kind {
            SupervisoryKind::Reject => self.retransmit_outstanding(actions),
            SupervisoryKind::SelectiveReject => {
                if let Some(o) = self.outstanding.iter().find(|o| o.ns == s.nr) {
                    let frame = self.i_frame(o.ns, false, o.protocol, o.data.clone());
                    actions.push(LinkAction::SendFrame(frame));
                    actions.push(LinkAction::StartT1);
                }
            }
            _ => {}
        }
        if s.role == FrameRole::Command && s.poll_final {
            actions.push(LinkAction::SendFrame(self.s_frame(
                SupervisoryKind::ReceiveReady,
                FrameRole::Response,
                true,
            )));
        }
        self.settle_timers(advanced, actions);
        self.pump(actions);
    }

    fn on_u_frame_connected(
        &mut self,
        kind: UnnumberedKind,
        poll_final: bool,
        actions: &mut Vec<LinkAction>,
    ) {
        match kind {
            UnnumberedKind::Sabm => {
                // peer reset the link under us
                actions.push(LinkAction::Error('F'));
                actions.push(LinkAction::SendFrame(self.u_frame(
                    UnnumberedKind::Ua,
                    FrameRole::Response,
                    poll_final,
                )));
                self.clear_queues();
                self.reset_variables();
                self.state = LinkState::Connected;
                actions.push(LinkAction::StopT1);
                actions.push(LinkAction::StartT3);
            }
            UnnumberedKind::Sabme => {
                actions.push(LinkAction::SendFrame(self.u_frame(
                    UnnumberedKind::Dm,
                    FrameRole::Response,
                    poll_final,
                )));
            }
            UnnumberedKind::Disc => {
                actions.push(LinkAction::SendFrame(self.u_frame(
                    UnnumberedKind::Ua,
                    FrameRole::Response,
                    poll_final,
                )));
                self.enter_disconnected(actions, DisconnectReason::PeerRequested);
            }
            UnnumberedKind::Dm => {
                actions.push(LinkAction::Error('E'));
                self.enter_disconnected(actions, DisconnectReason::PeerBusyOrGone);
            }
            UnnumberedKind::Ua => actions.push(LinkAction::Error('C')),
            UnnumberedKind::Frmr => {
                actions.push(LinkAction::Error('K'));
                self.re_establish(actions);
            }
            UnnumberedKind::Xid | UnnumberedKind::Test => {}
        }
    }

    // --- TimerRecovery ----------------------------------------------------

    fn timer_recovery(&mut self, event: LinkEvent, actions: &mut Vec<LinkAction>) {
        match event {
            LinkEvent::Data { protocol, data } => {
                // hold until the link is known good again
                self.send_queue.push_back((protocol, data));
            }
            LinkEvent::Disconnect => {
                self.clear_queues();
                self.retries = 0;
                self.state = LinkState::AwaitingRelease;
                actions.push(LinkAction::SendFrame(self.u_frame(
                    UnnumberedKind::Disc,
                    FrameRole::Command,
                    true,
                )));
                actions.push(LinkAction::StartT1);
            }
            LinkEvent::Frame(Ax25Frame::I(f)) => {
                if self.apply_ack(f.nr).is_err() {
                    self.nr_error(actions);
                    return;
                }
                if f.ns == self.vr {
                    self.vr = (self.vr + 1) % MODULO;
                    self.reject_sent = false;
                    actions.push(LinkAction::DeliverData {
                        protocol: f.protocol,
                        data: f.info,
                    });
                    actions.push(LinkAction::SendFrame(self.s_frame(
                        SupervisoryKind::ReceiveReady,
                        FrameRole::Response,
                        f.poll,
                    )));
                } else if !self.reject_sent {
                    self.reject_sent = true;
                    actions.push(LinkAction::SendFrame(self.s_frame(
                        SupervisoryKind::Reject,
                        FrameRole::Response,
                        f.poll,
                    )));
                }
                // stay in recovery until the enquiry is answered
            }
            LinkEvent::Frame(Ax25Frame::S(s)) => {
                match s.kind {
                    SupervisoryKind::ReceiveReady | SupervisoryKind::Reject => {
                        self.peer_busy = false
                    }
                    SupervisoryKind::ReceiveNotReady => self.peer_busy = true,
                    SupervisoryKind::SelectiveReject => {}
                }
                if self.apply_ack(s.nr).is_err() {
                    self.nr_error(actions);
                    return;
                }
                if s.role == FrameRole::Response && s.poll_final {
                    // enquiry answered: resynchronize
                    self.retries = 0;
                    self.state = LinkState::Connected;
                    if self.outstanding.is_empty() {
                        actions.push(LinkAction::StopT1);
                        actions.push(LinkAction::StartT3);
                    } else {
                        self.retransmit_outstanding(actions);
                    }
                    self.pump(actions);
                } else if s.role == FrameRole::Command && s.poll_final {
                    actions.push(LinkAction::SendFrame(self.s_frame(
                        SupervisoryKind::ReceiveReady,
                        FrameRole::Response,
                        true,
                    )));
                }
            }
            LinkEvent::Frame(Ax25Frame::U(u)) => {
                self.on_u_frame_connected(u.kind, u.poll_final, actions)
            }
            LinkEvent::T1Expired => {
                if self.retries >= self.n2 {
                    let code = if self.outstanding.is_empty() { 'T' } else { 'I' };
                    actions.push(LinkAction::Error(code));
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Dm,
                        FrameRole::Response,
                        false,
                    )));
                    self.enter_disconnected(actions, DisconnectReason::PeerBusyOrGone);
                } else {
                    self.retries += 1;
                    if self.outstanding.is_empty() {
                        actions.push(LinkAction::SendFrame(self.s_frame(
                            SupervisoryKind::ReceiveReady,
                            FrameRole::Command,
                            true,
                        )));
                        actions.push(LinkAction::StartT1);
                    } else {
                        // resend from V(A)
                        self.retransmit_outstanding(actions);
                    }
                }
            }
            _ => {}
        }
    }

    // --- AwaitingRelease --------------------------------------------------

    fn awaiting_release(&mut self, event: LinkEvent, actions: &mut Vec<LinkAction>) {
        match event {
            LinkEvent::Frame(Ax25Frame::U(u)) => match u.kind {
                UnnumberedKind::Ua | UnnumberedKind::Dm => {
                    actions.push(LinkAction::StopT1);
                    self.enter_disconnected(actions, DisconnectReason::Requested);
                }
                UnnumberedKind::Disc => {
                    // both sides let go at once
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Ua,
                        FrameRole::Response,
                        u.poll_final,
                    )));
                    actions.push(LinkAction::StopT1);
                    self.enter_disconnected(actions, DisconnectReason::Requested);
                }
                UnnumberedKind::Sabm => {
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Dm,
                        FrameRole::Response,
                        u.poll_final,
                    )));
                }
                _ => {}
            },
            LinkEvent::Frame(Ax25Frame::I(f)) => {
                if f.poll {
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Dm,
                        FrameRole::Response,
                        true,
                    )));
                }
            }
            LinkEvent::Frame(Ax25Frame::S(s)) => {
                if s.poll_final {
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Dm,
                        FrameRole::Response,
                        true,
                    )));
                }
            }
            LinkEvent::T1Expired => {
                if self.retries < self.n2 {
                    self.retries += 1;
                    actions.push(LinkAction::SendFrame(self.u_frame(
                        UnnumberedKind::Disc,
                        FrameRole::Command,
                        true,
                    )));
                    actions.push(LinkAction::StartT1);
                } else {
                    actions.push(LinkAction::Error('H'));
                    self.enter_disconnected(actions, DisconnectReason::Requested);
                }
            }
            _ => {}
        }
    }
}
