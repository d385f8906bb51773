//! Per-device AX.25 demultiplexing and the DL service interface.
//!
//! A [`DataLinkManager`] owns one device port: it drains the device's
//! inbound frame queue, offers each decoded frame to the registered L3
//! special handlers, and otherwise dispatches it to the state machine
//! for that (local, remote) pair. Upcalls to the bound application go
//! through a [`Context`] whose `write`/`close` post events back into
//! this manager's queue, so everything for one connection stays
//! serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkConfig;
use crate::frame::Ax25Frame;
use crate::link::{error_message, LinkAction, LinkEvent, LinkSession};
use crate::timer::Timer;
use crate::{AX25Call, L3Protocol};

/// Raw framed bytes handed in by a device driver.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub port: u16,
    pub data: Vec<u8>,
    /// Device-specific address (e.g. the KISS TNC port), when there is
    /// one.
    pub hardware_addr: Option<u16>,
}

/// An encoded frame headed back out to a device driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLinkFrame {
    pub port: u16,
    pub data: Vec<u8>,
    pub cost: u32,
}

/// A network layer that wants a look at L2 traffic.
pub trait L3Handler: Send + Sync {
    fn can_handle(&self, protocol: L3Protocol) -> bool;

    /// Inspect a decoded frame before normal dispatch. Returning `false`
    /// consumes the frame.
    fn maybe_handle_special(&self, port: u16, frame: &Ax25Frame) -> bool;

    /// Connected-mode L3 data addressed to this station.
    fn handle(&self, port: u16, remote: &AX25Call, data: &[u8]);
}

/// Callbacks for an application bound to a data link.
pub trait Application: Send + Sync {
    fn on_connect(&self, ctx: &Context);
    fn on_disconnect(&self, ctx: &Context);
    fn on_error(&self, ctx: &Context, message: &str);
    fn read(&self, ctx: &Context, data: &[u8]);
}

/// What a [`Context`] posts back to whichever layer handed it out. The
/// data link maps these onto DL primitives; the NET/ROM network maps
/// them onto NL primitives.
#[derive(Debug, Clone)]
pub enum ContextEvent {
    Write {
        local: AX25Call,
        remote: AX25Call,
        data: Vec<u8>,
    },
    Close {
        local: AX25Call,
        remote: AX25Call,
    },
}

/// Handed to the application with every upcall. `write` and `close` do
/// not touch any state machine directly; they enqueue events on the
/// owning layer, which applies them in order with everything else.
#[derive(Clone)]
pub struct Context {
    local: AX25Call,
    remote: AX25Call,
    events: mpsc::Sender<ContextEvent>,
}

impl Context {
    pub fn new(local: AX25Call, remote: AX25Call, events: mpsc::Sender<ContextEvent>) -> Self {
        Self {
            local,
            remote,
            events,
        }
    }

    pub fn local(&self) -> &AX25Call {
        &self.local
    }

    pub fn remote(&self) -> &AX25Call {
        &self.remote
    }

    pub fn write(&self, data: Vec<u8>) {
        let event = ContextEvent::Write {
            local: self.local,
            remote: self.remote,
            data,
        };
        if self.events.try_send(event).is_err() {
            log::warn!("dropping application write to {}, event queue full", self.remote);
        }
    }

    pub fn close(&self) {
        let event = ContextEvent::Close {
            local: self.local,
            remote: self.remote,
        };
        if self.events.try_send(event).is_err() {
            log::warn!("dropping close of {}, event queue full", self.remote);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    T1,
    T3,
}

/// Everything that can land on a manager's internal queue: DL requests,
/// raw frames to transmit, and timer expiries.
#[derive(Debug, Clone)]
pub enum DataLinkEvent {
    Connect {
        remote: AX25Call,
    },
    Disconnect {
        remote: AX25Call,
    },
    Data {
        remote: AX25Call,
        protocol: L3Protocol,
        data: Vec<u8>,
    },
    UnitData {
        remote: AX25Call,
        protocol: L3Protocol,
        data: Vec<u8>,
    },
    /// A prebuilt frame (NODES broadcasts) that bypasses any session.
    WriteFrame(Ax25Frame),
    Timer {
        remote: AX25Call,
        kind: TimerKind,
    },
}

struct SessionTimers {
    t1: Timer<DataLinkEvent>,
    t3: Timer<DataLinkEvent>,
}

pub struct DataLinkManager {
    link_call: AX25Call,
    link_port: u16,
    window: u8,
    n2: u8,
    t1_delay: Duration,
    t3_delay: Duration,
    inbound: mpsc::Receiver<FrameData>,
    outbound: mpsc::Sender<DataLinkFrame>,
    events_tx: mpsc::Sender<DataLinkEvent>,
    events_rx: mpsc::Receiver<DataLinkEvent>,
    ctx_tx: mpsc::Sender<ContextEvent>,
    ctx_rx: mpsc::Receiver<ContextEvent>,
    /// Sessions keyed by the (local, remote) pair. The local half is
    /// this manager's `link_call` today; keeping it in the key means a
    /// port can grow additional local calls without rekeying.
    sessions: HashMap<(AX25Call, AX25Call), LinkSession>,
    timers: HashMap<(AX25Call, AX25Call), SessionTimers>,
    l3: Vec<Arc<dyn L3Handler>>,
    app: Arc<dyn Application>,
    cancel: CancellationToken,
}

impl DataLinkManager {
    pub fn new(
        config: &NetworkConfig,
        link_call: AX25Call,
        link_port: u16,
        inbound: mpsc::Receiver<FrameData>,
        outbound: mpsc::Sender<DataLinkFrame>,
        app: Arc<dyn Application>,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (ctx_tx, ctx_rx) = mpsc::channel(64);
        Self {
            link_call,
            link_port,
            window: config.window_size,
            n2: config.n2,
            t1_delay: Duration::from_secs(config.t1),
            t3_delay: Duration::from_secs(config.t3),
            inbound,
            outbound,
            events_tx,
            events_rx,
            ctx_tx,
            ctx_rx,
            sessions: HashMap::new(),
            timers: HashMap::new(),
            l3: Vec::new(),
            app,
            cancel,
        }
    }

    pub fn link_call(&self) -> &AX25Call {
        &self.link_call
    }

    pub fn link_port(&self) -> u16 {
        self.link_port
    }

    /// Handle for posting events from outside the manager task (the
    /// network layer, applications, timers).
    pub fn event_sender(&self) -> mpsc::Sender<DataLinkEvent> {
        self.events_tx.clone()
    }

    /// Handlers are offered inbound frames in registration order.
    pub fn add_l3_handler(&mut self, handler: Arc<dyn L3Handler>) {
        self.l3.push(handler);
    }

    /// Drain the inbound and event queues until cancelled.
    pub async fn run(mut self) {
        log::info!("data link up on port {} as {}", self.link_port, self.link_call);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = self.inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => break,
                },
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                ctx = self.ctx_rx.recv() => match ctx {
                    Some(ContextEvent::Write { remote, data, .. }) => self.dispatch(
                        remote,
                        LinkEvent::Data {
                            protocol: L3Protocol::NoLayer3,
                            data,
                        },
                    ),
                    Some(ContextEvent::Close { remote, .. }) => {
                        self.dispatch(remote, LinkEvent::Disconnect)
                    }
                    None => break,
                },
            }
        }
        log::info!("data link on port {} stopped", self.link_port);
    }

    fn handle_frame(&mut self, frame: FrameData) {
        let packet = match Ax25Frame::from_bytes(&frame.data) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("port {}: dropping undecodable frame: {err}", frame.port);
                return;
            }
        };
        log::debug!("< {packet}");

        for l3 in &self.l3 {
            if !l3.maybe_handle_special(frame.port, &packet) {
                return;
            }
        }

        if packet.dest() != &self.link_call {
            log::warn!(
                "discarding {packet}, not addressed to {}",
                self.link_call
            );
            return;
        }

        let remote = *packet.source();
        self.dispatch(remote, LinkEvent::Frame(packet));
    }

    fn handle_event(&mut self, event: DataLinkEvent) {
        match event {
            DataLinkEvent::Connect { remote } => self.dispatch(remote, LinkEvent::Connect),
            DataLinkEvent::Disconnect { remote } => self.dispatch(remote, LinkEvent::Disconnect),
            DataLinkEvent::Data {
                remote,
                protocol,
                data,
            } => self.dispatch(remote, LinkEvent::Data { protocol, data }),
            DataLinkEvent::UnitData {
                remote,
                protocol,
                data,
            } => self.dispatch(remote, LinkEvent::UnitData { protocol, data }),
            DataLinkEvent::WriteFrame(frame) => {
                if !self.write_packet(&frame) {
                    log::warn!("outbound queue full, dropping {frame}");
                }
            }
            DataLinkEvent::Timer { remote, kind } => {
                let event = match kind {
                    TimerKind::T1 => LinkEvent::T1Expired,
                    TimerKind::T3 => LinkEvent::T3Expired,
                };
                self.dispatch(remote, event);
            }
        }
    }

    fn dispatch(&mut self, remote: AX25Call, event: LinkEvent) {
        let key = (self.link_call, remote);
        if !self.sessions.contains_key(&key) {
            self.sessions.insert(
                key,
                LinkSession::new(self.link_call, remote, self.window, self.n2),
            );
            self.timers.insert(
                key,
                SessionTimers {
                    t1: Timer::new(
                        self.t1_delay,
                        self.events_tx.clone(),
                        DataLinkEvent::Timer {
                            remote,
                            kind: TimerKind::T1,
                        },
                    ),
                    t3: Timer::new(
                        self.t3_delay,
                        self.events_tx.clone(),
                        DataLinkEvent::Timer {
                            remote,
                            kind: TimerKind::T3,
                        },
                    ),
                },
            );
        }
        let actions = match self.sessions.get_mut(&key) {
            Some(session) => session.handle_event(event),
            None => return,
        };
        self.apply_actions(remote, actions);
    }

    fn apply_actions(&mut self, remote: AX25Call, actions: Vec<LinkAction>) {
        let key = (self.link_call, remote);
        for action in actions {
            match action {
                LinkAction::SendFrame(frame) => {
                    if !self.write_packet(&frame) {
                        log::warn!("outbound queue full, dropping {frame}");
                    }
                }
                LinkAction::DeliverData { protocol, data }
                | LinkAction::DeliverUnitData { protocol, data } => {
                    self.deliver(remote, protocol, &data);
                }
                LinkAction::Connected => self.app.on_connect(&self.context(remote)),
                LinkAction::Disconnected(reason) => {
                    log::info!("{} disconnected from {remote}: {reason:?}", self.link_call);
                    self.app.on_disconnect(&self.context(remote));
                }
                LinkAction::Error(code) => {
                    self.app.on_error(&self.context(remote), error_message(code));
                }
                LinkAction::StartT1 => {
                    if let Some(timers) = self.timers.get(&key) {
                        timers.t1.start();
                    }
                }
                LinkAction::StopT1 => {
                    if let Some(timers) = self.timers.get(&key) {
                        timers.t1.cancel();
                    }
                }
                LinkAction::StartT3 => {
                    if let Some(timers) = self.timers.get(&key) {
                        timers.t3.start();
                    }
                }
                LinkAction::StopT3 => {
                    if let Some(timers) = self.timers.get(&key) {
                        timers.t3.cancel();
                    }
                }
            }
        }
    }

    fn deliver(&self, remote: AX25Call, protocol: L3Protocol, data: &[u8]) {
        match protocol {
            L3Protocol::NoLayer3 => self.app.read(&self.context(remote), data),
            protocol => match self.l3.iter().find(|h| h.can_handle(protocol)) {
                Some(handler) => handler.handle(self.link_port, &remote, data),
                None => {
                    log::warn!("no handler for protocol {protocol:?}, discarding")
                }
            },
        }
    }

    fn context(&self, remote: AX25Call) -> Context {
        Context::new(self.link_call, remote, self.ctx_tx.clone())
    }

    /// Encode and offer a frame to the device queue without blocking;
    /// `false` when the queue is full.
    pub fn write_packet(&self, frame: &Ax25Frame) -> bool {
        log::debug!("> {frame}");
        self.outbound
            .try_send(DataLinkFrame {
                port: self.link_port,
                data: frame.to_bytes(),
                cost: 0,
            })
            .is_ok()
    }
}
