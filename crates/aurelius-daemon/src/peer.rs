use crate::{
    env::Environment,
    error::{
        Notify,
        SessionError,
    },
    listener::Incoming,
    neighbor::Neighbor,
    process::SharedBridge,
    proto::{
        Direction,
        Protocol,
        UpdateBatch,
    },
    timer::SessionTimer,
};
use aurelius_bgp::{
    rfc3392::{
        Capability,
        CAPABILITY_GRACEFUL_RESTART,
    },
    rfc4271::{
        OpenMessage,
        OptionalParameter,
    },
    rfc4724::{
        GracefulRestartCapability,
        RestartFamily,
        FORWARDING_STATE,
    },
    rfc4760::MultiprotocolExtensionsCapability,
    BGPMessage,
};
use log::{
    debug,
    error,
    info,
    warn,
};
use std::{
    mem,
    net::IpAddr,
    os::fd::RawFd,
    time::{
        Duration,
        Instant,
    },
};

// As we can not know whether this is our first start or not, this flag makes the daemon always act like it is recovering from a failure:
// the restart bit is set in the graceful restart capability of the first OPEN an incarnation sends.
const FORCE_GRACEFUL: bool = true;

/// The restart time advertised in our graceful restart capability, in seconds.
const RESTART_TIME: u16 = 120;

/// This enum contains all connection states defined by the BGP base RFC for the BGP FSM (Finite State Machine). These states are kept per
/// half-session: each peer tracks one for the inbound-accepted and one for the outbound-initiated direction.
#[derive(Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Debug, Default)]
pub enum SessionState {
    /// This is the initial state of a half-session: nothing is allocated for this direction.
    #[default]
    Idle,

    /// In this state, the half-session waits for the handshake to make progress, a.e. for the pre-buffered OPEN of an accepted
    /// connection to be replayed.
    Active,

    /// In this state, the BGP router initiated a TCP connection to the remote peer and waits for it to be established.
    Connect,

    /// In this state, the TCP connection is established and this router's open message has been sent; the router is waiting for the
    /// peer's open message.
    OpenSent,

    /// In this state, the half-session waits for an incoming keep-alive (or notification) from the BGP peer.
    OpenConfirm,

    /// In this state, the session exchanges updates, notifications and keep-alive messages with the peer.
    Established,
}

/// Scheduling intent a peer reports back to the reactor after one cooperative step.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Intent {
    /// More work is immediately pending; schedule this peer again as soon as possible.
    Urgent,
    /// Nothing urgent; the next regular tick is fine.
    Idle,
    /// The peer unregistered itself; the reactor drops it.
    Done,
}

/// Lifecycle of one half-session task slot.
enum Slot {
    /// No task is wanted in this direction, a.e. the outbound direction of a passive peer.
    Absent,
    /// The task must be (re)created on the next step.
    PendingStart,
    /// A live task, resumed once per step.
    Running(Task),
}

/// The establishment and steady-state phases of one direction, stepped by `poll` once per scheduler tick.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Stage {
    AcceptReadOpen,
    AcceptSendOpen,
    AcceptSendKeepalive,
    AcceptReadKeepalive,
    ConnectSendOpen,
    ConnectReadOpen,
    ConnectReadKeepalive,
    ConnectSendKeepalive,
    Established,
}

struct Task {
    stage: Stage,
    open_timer: Option<SessionTimer>,
    steady: Steady,
}

impl Task {
    fn accept(open_wait: Duration, now: Instant) -> Self {
        Self {
            stage: Stage::AcceptReadOpen,
            open_timer: Some(open_wait_timer(open_wait, now)),
            steady: Steady::default(),
        }
    }

    fn connect() -> Self {
        Self {
            stage: Stage::ConnectSendOpen,
            open_timer: None,
            steady: Steady::default(),
        }
    }
}

fn open_wait_timer(open_wait: Duration, now: Instant) -> SessionTimer {
    SessionTimer::new(now, open_wait, 1, 1, "waited for open too long, we do not like stuck in active")
}

/// Bookkeeping of the established loop.
#[derive(Default)]
struct Steady {
    announced: bool,
    first_completion_pending: bool,
    routes_seen: u64,
    updates: Option<UpdateBatch>,
    eors: Option<UpdateBatch>,
}

/// The outcome of resuming one task for one tick.
enum Step {
    /// Progress was made; resume again as soon as possible.
    Again,
    /// Waiting on the socket or a timer; nothing urgent.
    Wait,
    /// The session ended cleanly without a notification (graceful restart).
    Closed,
    /// The session ended with the given error; the settle handler takes over.
    Failed(SessionError),
}

/// One configured neighbor relationship. A peer drives up to two concurrent half-sessions (the inbound-accepted and the
/// outbound-initiated one), collapses to the single direction that wins establishment and then runs the steady-state keepalive/update
/// loop until it is stopped, restarted or torn down.
pub struct Peer {
    neighbor: Neighbor,
    /// The replacement neighbor definition applied at the next restart boundary.
    replacement: Option<Neighbor>,
    once: bool,
    open_wait: Duration,
    bridge: SharedBridge,

    in_proto: Option<Protocol>,
    out_proto: Option<Protocol>,
    /// The direction that won establishment, while one did.
    chosen: Option<Direction>,

    in_slot: Slot,
    out_slot: Slot,

    in_state: SessionState,
    out_state: SessionState,

    /// The session should keep processing messages.
    running: bool,
    /// The session should be re-established after a stop.
    restart: bool,
    /// This incarnation advertises recovering-restart semantics in its OPEN.
    restarted: bool,
    /// An initial or reload-pending route set exists.
    have_routes: bool,
    /// The cease subcode to raise out of the established loop, when a teardown was armed.
    teardown: Option<u8>,

    /// Outbound connect attempts are suppressed until this point in time.
    skip_until: Option<Instant>,
    /// The next back-off interval in seconds.
    next_skip: u64,

    /// The hold timer of the winning direction, armed at openconfirm.
    hold: Option<SessionTimer>,
}

impl Peer {
    pub fn new(neighbor: Neighbor, environment: &Environment, bridge: SharedBridge) -> Self {
        Self {
            neighbor,
            replacement: None,
            once: environment.tcp_once,
            open_wait: environment.open_wait,
            bridge,
            in_proto: None,
            out_proto: None,
            chosen: None,
            in_slot: Slot::Absent,
            out_slot: Slot::PendingStart,
            in_state: SessionState::Idle,
            out_state: SessionState::Idle,
            running: true,
            restart: true,
            restarted: FORCE_GRACEFUL,
            have_routes: true,
            teardown: None,
            skip_until: None,
            next_skip: 0,
            hold: None,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.neighbor.peer_address
    }

    /// The (inbound, outbound) half-session states.
    pub fn session_states(&self) -> (SessionState, SessionState) {
        (self.in_state, self.out_state)
    }

    /// Arm terminal shutdown: the session winds down and the peer unregisters once both directions are done.
    pub fn stop(&mut self) {
        self.running = false;
        self.restart = false;
        self.restarted = false;
        self.reset_skip();
    }

    /// Install a new neighbor definition in place and re-arm the route push. The running session is kept.
    pub fn reload(&mut self, neighbor: Neighbor) {
        self.neighbor = neighbor;
        self.have_routes = true;
        self.reset_skip();
    }

    /// Tear the session down and re-establish it, optionally with a replacement neighbor definition applied at the boundary.
    pub fn restart(&mut self, replacement: Option<Neighbor>) {
        self.running = false;
        self.restart = true;
        self.restarted = true;
        self.replacement = replacement;
        self.reset_skip();
    }

    /// Arm a graceful shutdown that raises a cease notification with the given subcode out of the established loop.
    pub fn teardown(&mut self, code: u8, restart: bool) {
        self.running = false;
        self.restart = restart;
        self.teardown = Some(code);
        self.reset_skip();
    }

    /// The live I/O handles of this peer for reactor-level readiness selection.
    pub fn descriptors(&self) -> Vec<RawFd> {
        [self.in_proto.as_ref(), self.out_proto.as_ref()]
            .into_iter()
            .flatten()
            .map(Protocol::descriptor)
            .collect()
    }

    /// Offer a pre-validated incoming OPEN to this peer. It is taken only while the outbound direction has not established and the
    /// inbound direction is idle; a refused offer drops (and thereby closes) the connection.
    pub fn incoming(&mut self, incoming: Incoming) -> bool {
        if self.out_state != SessionState::Established && self.in_state == SessionState::Idle {
            self.in_proto = Some(Protocol::accept(incoming));
            self.in_slot = Slot::PendingStart;
            true
        } else {
            debug!("refused incoming connection from {}", incoming.address);
            false
        }
    }

    fn reset_skip(&mut self) {
        self.skip_until = None;
        self.next_skip = 0;
    }

    /// Grow the back-off after a failed connection attempt: 0, 1, 2, 3, 4, 5, 7, ... capped at sixty seconds.
    fn more_skip(&mut self, now: Instant) {
        self.skip_until = Some(now + Duration::from_secs(self.next_skip));
        self.next_skip = ((1.0 + self.next_skip as f64 * 1.2) as u64).min(60);
    }

    fn skipping(&self, now: Instant) -> bool {
        self.skip_until.map(|until| now < until).unwrap_or(false)
    }

    fn proto_mut(&mut self, direction: Direction) -> Option<&mut Protocol> {
        match direction {
            Direction::In => self.in_proto.as_mut(),
            Direction::Out => self.out_proto.as_mut(),
        }
    }

    fn other_state(&self, direction: Direction) -> SessionState {
        match direction {
            Direction::In => self.out_state,
            Direction::Out => self.in_state,
        }
    }

    /// The OPEN message this speaker sends, derived from the neighbor definition and the restart bookkeeping.
    fn local_open(&self) -> OpenMessage {
        let mut capabilities: Vec<Capability> = self
            .neighbor
            .families
            .iter()
            .map(|family| Capability::MultiprotocolExtensions(MultiprotocolExtensionsCapability { family: *family }))
            .collect();

        if self.neighbor.graceful_restart {
            capabilities.push(Capability::GracefulRestart(GracefulRestartCapability {
                restart_state: self.restarted,
                restart_time: RESTART_TIME,
                families: self
                    .neighbor
                    .families
                    .iter()
                    .map(|family| {
                        RestartFamily {
                            family: *family,
                            flags: FORWARDING_STATE,
                        }
                    })
                    .collect(),
            }));
        }

        OpenMessage {
            version: 4,
            autonomous_system: self.neighbor.local_as,
            hold_time: self.neighbor.hold_time,
            bgp_identifier: u32::from(self.neighbor.router_id),
            optional_parameters: vec![OptionalParameter::Capabilities(capabilities)],
        }
    }

    /// One cooperative step: resume whichever half-session is due and report the combined scheduling intent.
    pub fn step(&mut self) -> Intent {
        self.step_at(Instant::now())
    }

    fn step_at(&mut self, now: Instant) -> Intent {
        let mut urgent = false;

        match mem::replace(&mut self.in_slot, Slot::Absent) {
            Slot::Running(mut task) => {
                match self.poll(&mut task, Direction::In, now) {
                    Step::Again => {
                        self.in_slot = Slot::Running(task);
                        urgent = true;
                    }
                    Step::Wait => self.in_slot = Slot::Running(task),
                    Step::Closed => self.settle_closed(),
                    Step::Failed(session_error) => self.settle(Direction::In, session_error, now),
                }
            }
            Slot::PendingStart if self.running => {
                self.in_state = SessionState::Active;
                self.in_slot = Slot::Running(Task::accept(self.open_wait, now));
                urgent = true;
            }
            Slot::PendingStart => self.in_slot = Slot::PendingStart,
            Slot::Absent => {}
        }

        match mem::replace(&mut self.out_slot, Slot::Absent) {
            Slot::Running(mut task) => {
                if self.skipping(now) {
                    // inside the back-off window the task stays alive but is not resumed
                    self.out_slot = Slot::Running(task);
                } else {
                    match self.poll(&mut task, Direction::Out, now) {
                        Step::Again => {
                            self.out_slot = Slot::Running(task);
                            urgent = true;
                        }
                        Step::Wait => self.out_slot = Slot::Running(task),
                        Step::Closed => self.settle_closed(),
                        Step::Failed(session_error) => self.settle(Direction::Out, session_error, now),
                    }
                }
            }
            Slot::PendingStart if self.running && !self.neighbor.passive => {
                if self.skipping(now) {
                    self.out_slot = Slot::PendingStart;
                } else if self.bridge.borrow().broken(self.neighbor.peer_address) {
                    error!("lost the helper process for {}, stopping the peer", self.neighbor);
                    self.running = false;
                } else {
                    match Protocol::connect(&self.neighbor) {
                        Ok(proto) => {
                            debug!("{} trying to establish our own connection", self.neighbor);
                            self.out_proto = Some(proto);
                            self.out_state = SessionState::Connect;
                            self.out_slot = Slot::Running(Task::connect());
                            urgent = true;
                        }
                        Err(network_error) => self.settle(Direction::Out, SessionError::Network(network_error), now),
                    }
                }
            }
            Slot::PendingStart if self.neighbor.passive => {}
            Slot::PendingStart => self.out_slot = Slot::PendingStart,
            Slot::Absent => {}
        }

        let in_down = !matches!(self.in_slot, Slot::Running(_));
        let out_down = !matches!(self.out_slot, Slot::Running(_));
        if in_down && out_down {
            if self.restart {
                // a restart boundary: apply any queued replacement definition and go again
                if let Some(replacement) = self.replacement.take() {
                    info!("swapping in the replacement definition for {}", replacement);
                    self.neighbor = replacement;
                }
                self.running = true;
            } else {
                if let Some(proto) = self.out_proto.as_mut() {
                    proto.close("safety shutdown before unregistering peer");
                }
                if let Some(proto) = self.in_proto.as_mut() {
                    proto.close("safety shutdown before unregistering peer");
                }
                return Intent::Done;
            }
        }

        if urgent {
            Intent::Urgent
        } else {
            Intent::Idle
        }
    }

    /// Resume one task. Every wait point checks `running` so a stop poisons the task at its next suspension.
    fn poll(&mut self, task: &mut Task, direction: Direction, now: Instant) -> Step {
        if task.stage != Stage::Established && !self.running {
            return Step::Failed(SessionError::Interrupted);
        }

        match task.stage {
            Stage::AcceptReadOpen | Stage::ConnectReadOpen => self.poll_read_open(task, direction, now),
            Stage::AcceptSendOpen => {
                match self.flush(direction) {
                    Err(step) => step,
                    Ok(false) => Step::Wait,
                    Ok(true) => {
                        if let Err(notify) = self.validate(direction) {
                            return Step::Failed(notify.into());
                        }
                        if let Some(proto) = self.proto_mut(direction) {
                            proto.new_keepalive();
                        }
                        task.stage = Stage::AcceptSendKeepalive;
                        Step::Again
                    }
                }
            }
            Stage::AcceptSendKeepalive => {
                match self.flush(direction) {
                    Err(step) => step,
                    Ok(false) => Step::Wait,
                    Ok(true) => {
                        self.in_state = SessionState::OpenConfirm;
                        self.arm_hold_timer(direction, now);
                        task.stage = Stage::AcceptReadKeepalive;
                        Step::Again
                    }
                }
            }
            Stage::AcceptReadKeepalive | Stage::ConnectReadKeepalive => self.poll_read_keepalive(task, direction, now),
            Stage::ConnectSendOpen => {
                if self.proto_mut(direction).map(|proto| proto.negotiated.sent.is_none()).unwrap_or(false) {
                    let open = self.local_open();
                    if let Some(proto) = self.proto_mut(direction) {
                        proto.new_open(open);
                    }
                }
                match self.flush(direction) {
                    Err(step) => step,
                    Ok(false) => Step::Wait,
                    Ok(true) => {
                        // the OPEN left the socket, so the TCP connection is established
                        self.out_state = SessionState::OpenSent;
                        self.reset_skip();
                        task.open_timer = Some(open_wait_timer(self.open_wait, now));
                        task.stage = Stage::ConnectReadOpen;
                        Step::Again
                    }
                }
            }
            Stage::ConnectSendKeepalive => {
                match self.flush(direction) {
                    Err(step) => step,
                    Ok(false) => Step::Wait,
                    Ok(true) => {
                        self.establish(direction, task);
                        Step::Again
                    }
                }
            }
            Stage::Established => self.poll_established(task, direction, now),
        }
    }

    fn flush(&mut self, direction: Direction) -> Result<bool, Step> {
        match self.proto_mut(direction) {
            Some(proto) => proto.flush().map_err(|network_error| Step::Failed(network_error.into())),
            None => Err(Step::Failed(SessionError::Interrupted)),
        }
    }

    fn validate(&mut self, direction: Direction) -> Result<(), Notify> {
        let peer_as = self.neighbor.peer_as;
        let other = self.other_state(direction);
        let other_ahead = other >= SessionState::OpenSent;
        let other_established = other == SessionState::Established;
        match self.proto_mut(direction) {
            Some(proto) => proto.validate_open(peer_as, other_ahead, other_established),
            None => Err(Notify::new(5, 0, "no connection to validate")),
        }
    }

    fn arm_hold_timer(&mut self, direction: Direction, now: Instant) {
        let holdtime = self
            .proto_mut(direction)
            .map(|proto| proto.negotiated.holdtime)
            .unwrap_or_default();
        self.hold = Some(SessionTimer::new(now, Duration::from_secs(holdtime as u64), 4, 0, "hold timer expired"));
    }

    fn establish(&mut self, direction: Direction, task: &mut Task) {
        match direction {
            Direction::In => self.in_state = SessionState::Established,
            Direction::Out => self.out_state = SessionState::Established,
        }
        self.chosen = Some(direction);
        task.steady = Steady {
            first_completion_pending: true,
            ..Steady::default()
        };
        task.stage = Stage::Established;
        info!("connected to {} over the {} direction", self.neighbor, direction);
    }

    fn poll_read_open(&mut self, task: &mut Task, direction: Direction, now: Instant) -> Step {
        let message = match self.proto_mut(direction) {
            Some(proto) => proto.next_message(),
            None => return Step::Failed(SessionError::Interrupted),
        };

        match message {
            Err(session_error) => Step::Failed(session_error),
            Ok(None) => {
                if let Some(timer) = task.open_timer.as_mut() {
                    if let Err(notify) = timer.tick(false, now) {
                        return Step::Failed(notify.into());
                    }
                }
                Step::Wait
            }
            Ok(Some(BGPMessage::Open(open))) => {
                if let Some(timer) = task.open_timer.as_mut() {
                    let _ = timer.tick(true, now);
                }
                if let Some(proto) = self.proto_mut(direction) {
                    proto.negotiated.received = Some(open);
                }

                match direction {
                    Direction::In => {
                        // reply with our own OPEN; validation runs once it is flushed
                        let open = self.local_open();
                        if let Some(proto) = self.proto_mut(direction) {
                            proto.new_open(open);
                        }
                        task.stage = Stage::AcceptSendOpen;
                    }
                    Direction::Out => {
                        if let Err(notify) = self.validate(direction) {
                            return Step::Failed(notify.into());
                        }
                        self.out_state = SessionState::OpenConfirm;
                        self.arm_hold_timer(direction, now);
                        task.stage = Stage::ConnectReadKeepalive;
                    }
                }
                Step::Again
            }
            Ok(Some(message)) => {
                warn!("{} sent an unexpected message (type {}) instead of an OPEN", self.neighbor, message.kind());
                Step::Failed(Notify::new(5, 0, "unexpected message while waiting for OPEN").into())
            }
        }
    }

    fn poll_read_keepalive(&mut self, task: &mut Task, direction: Direction, now: Instant) -> Step {
        let message = match self.proto_mut(direction) {
            Some(proto) => proto.next_message(),
            None => return Step::Failed(SessionError::Interrupted),
        };

        match message {
            Err(session_error) => Step::Failed(session_error),
            Ok(None) => {
                if let Some(hold) = self.hold.as_mut() {
                    if let Err(notify) = hold.tick(false, now) {
                        return Step::Failed(notify.into());
                    }
                }
                Step::Wait
            }
            Ok(Some(BGPMessage::KeepAlive)) => {
                if let Some(hold) = self.hold.as_mut() {
                    let _ = hold.tick(true, now);
                }
                match direction {
                    Direction::In => {
                        self.establish(direction, task);
                    }
                    Direction::Out => {
                        if let Some(proto) = self.proto_mut(direction) {
                            proto.new_keepalive();
                        }
                        task.stage = Stage::ConnectSendKeepalive;
                    }
                }
                Step::Again
            }
            Ok(Some(message)) => {
                warn!(
                    "{} sent an unexpected message (type {}) instead of a KEEPALIVE",
                    self.neighbor,
                    message.kind()
                );
                Step::Failed(Notify::new(5, 0, "unexpected message while waiting for KEEPALIVE").into())
            }
        }
    }

    /// One iteration of the steady-state loop: read zero or one message, feed the hold timer, answer its keepalive demand, and push at
    /// most one chunk of any in-flight UPDATE or End-of-RIB batch.
    fn poll_established(&mut self, task: &mut Task, direction: Direction, now: Instant) -> Step {
        if !self.running {
            if self.neighbor.graceful_restart
                && self
                    .proto_mut(direction)
                    .map(|proto| proto.negotiated.announced(CAPABILITY_GRACEFUL_RESTART))
                    .unwrap_or(false)
            {
                error!("closing the session with {} without notification", self.neighbor);
                return Step::Closed;
            }
            if let Some(code) = self.teardown.take() {
                return Step::Failed(Notify::new(6, code, "session torn down").into());
            }
            return Step::Failed(Notify::new(6, 3, "peer de-configured").into());
        }

        let steady = &mut task.steady;
        if !steady.announced {
            steady.announced = true;
            if self.neighbor.api.neighbor_changes {
                if let Err(process_error) = self.bridge.borrow_mut().up(self.neighbor.peer_address) {
                    return Step::Failed(SessionError::Process(process_error));
                }
            }
        }

        let message = match self.proto_mut(direction) {
            Some(proto) => proto.next_message(),
            None => return Step::Failed(SessionError::Interrupted),
        };
        let message = match message {
            Ok(message) => message,
            Err(session_error) => return Step::Failed(session_error),
        };

        let alive = message.is_some();
        let mut urgent = alive;
        match message {
            Some(BGPMessage::Update(update)) => {
                steady.routes_seen += update.route_count() as u64;
                debug!(
                    "{} announced {} routes in one update ({} seen over this session)",
                    self.neighbor,
                    update.route_count(),
                    steady.routes_seen
                );
            }
            Some(BGPMessage::KeepAlive) | None => {}
            Some(message) => {
                warn!("{} sent an unexpected message (type {}) while established", self.neighbor, message.kind());
                return Step::Failed(Notify::new(5, 0, "unexpected message while established").into());
            }
        }

        let mut keepalive_due = false;
        if let Some(hold) = self.hold.as_mut() {
            if let Err(notify) = hold.tick(alive, now) {
                return Step::Failed(notify.into());
            }
            keepalive_due = hold.keepalive_due(now);
        }
        if keepalive_due {
            if let Some(proto) = self.proto_mut(direction) {
                proto.new_keepalive();
                urgent = true;
            }
        }

        if self.have_routes && steady.updates.is_none() {
            self.have_routes = false;
            steady.updates = Some(UpdateBatch::new(self.neighbor.updates()));
        }

        if steady.updates.is_some() || steady.eors.is_some() {
            urgent = true;
        }

        // advance at most one in-flight producer per tick to bound per-peer latency
        if let Some(batch) = steady.updates.as_mut() {
            let Some(proto) = self.proto_mut(direction) else {
                return Step::Failed(SessionError::Interrupted);
            };
            match batch.advance(proto) {
                Err(network_error) => return Step::Failed(network_error.into()),
                Ok(true) => {
                    steady.updates = None;
                    if steady.first_completion_pending {
                        // the first complete push ends with End-of-RIB markers, or a keepalive standing in for them when no
                        // family was negotiated
                        steady.first_completion_pending = false;
                        if proto.negotiated.families.is_empty() {
                            proto.new_keepalive();
                        } else {
                            steady.eors = Some(proto.new_eors());
                        }
                    }
                }
                Ok(false) => {}
            }
        } else if let Some(batch) = steady.eors.as_mut() {
            let Some(proto) = self.proto_mut(direction) else {
                return Step::Failed(SessionError::Interrupted);
            };
            match batch.advance(proto) {
                Err(network_error) => return Step::Failed(network_error.into()),
                Ok(true) => steady.eors = None,
                Ok(false) => {}
            }
        }

        if let Err(step) = self.flush(direction) {
            return step;
        }

        if urgent {
            Step::Again
        } else {
            Step::Wait
        }
    }

    /// The clean end of an established session: graceful restart was negotiated, so both directions close without a notification.
    fn settle_closed(&mut self) {
        self.reset_both("graceful restart negotiated, closing without sending any notification", None);
    }

    /// The central close-and-reset bookkeeping. Every way a half-session can end funnels through here; when the opposite direction
    /// already carries an established session only the failing direction is reset, otherwise the whole peer falls back to idle.
    fn settle(&mut self, direction: Direction, session_error: SessionError, now: Instant) {
        let other_established = self.other_state(direction) == SessionState::Established;

        match session_error {
            SessionError::Network(network_error) => {
                warn!("{} connection issue => {}", self.neighbor, network_error);
                // we most likely failed to connect, so the back-off grows
                self.more_skip(now);
                self.reset_both(&format!("connection failure => {}", network_error), None);
                if self.once {
                    info!("only one attempt to connect is allowed, stopping {}", self.neighbor);
                    self.stop();
                }
            }
            SessionError::Notify(notify) => {
                debug!("{} raising ({},{}) => {}", self.neighbor, notify.code, notify.subcode, notify.diagnostic);
                let reason = format!("notification sent ({},{}) => {}", notify.code, notify.subcode, notify.diagnostic);
                if other_established {
                    self.reset_direction(direction, &reason, Some(&notify));
                } else {
                    self.reset_both(&reason, Some(&notify));
                }
            }
            SessionError::Notification(notification) => {
                warn!(
                    "{} received notification ({},{}) {}",
                    self.neighbor,
                    notification.error_code,
                    notification.error_subcode,
                    notification.diagnostic()
                );
                let reason = format!("notification received ({},{})", notification.error_code, notification.error_subcode);
                if other_established {
                    self.reset_direction(direction, &reason, None);
                } else {
                    self.reset_both(&reason, None);
                }
            }
            SessionError::Process(process_error) => {
                error!("{} => {}", self.neighbor, process_error);
                // no better cease subcode exists for a broken helper
                let notify = Notify::new(6, 0, "internal error");
                self.reset_both(&format!("failure => {}", process_error), Some(&notify));
            }
            SessionError::Interrupted => {
                debug!("{} session interrupted", self.neighbor);
                if other_established {
                    self.reset_direction(direction, "interrupted", None);
                } else {
                    self.reset_both("interrupted", None);
                }
            }
        }
    }

    /// Reset one direction only; the opposite established session keeps running untouched.
    fn reset_direction(&mut self, direction: Direction, reason: &str, notify: Option<&Notify>) {
        let proto = match direction {
            Direction::In => &mut self.in_proto,
            Direction::Out => &mut self.out_proto,
        };
        if let Some(proto) = proto.as_mut() {
            if let Some(notify) = notify {
                proto.new_notification(notify);
            }
            proto.close(reason);
        }
        *proto = None;

        match direction {
            Direction::In => {
                self.in_state = SessionState::Idle;
                self.in_slot = Slot::Absent;
            }
            Direction::Out => {
                self.out_state = SessionState::Idle;
                self.out_slot = Slot::PendingStart;
            }
        }
        if self.chosen == Some(direction) {
            self.chosen = None;
            self.hold = None;
        }
    }

    /// Reset the whole peer to idle: both adapters closed, both half-session states idle, the inbound slot waiting for a connection and
    /// the outbound slot pending re-creation.
    fn reset_both(&mut self, reason: &str, notify: Option<&Notify>) {
        for proto in [self.out_proto.as_mut(), self.in_proto.as_mut()].into_iter().flatten() {
            if let Some(notify) = notify {
                proto.new_notification(notify);
            }
            proto.close(reason);
        }
        self.in_proto = None;
        self.out_proto = None;

        self.in_state = SessionState::Idle;
        self.out_state = SessionState::Idle;
        self.in_slot = Slot::Absent;
        self.out_slot = Slot::PendingStart;
        self.chosen = None;
        self.hold = None;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Intent,
        Peer,
        SessionState,
        Slot,
    };
    use crate::{
        env::Environment,
        listener::Incoming,
        neighbor::Neighbor,
        process::{
            NullBridge,
            SharedBridge,
        },
    };
    use std::{
        cell::RefCell,
        net::{
            IpAddr,
            Ipv4Addr,
            TcpListener,
        },
        rc::Rc,
        time::{
            Duration,
            Instant,
        },
    };

    fn bridge() -> SharedBridge {
        Rc::new(RefCell::new(NullBridge))
    }

    fn passive_neighbor() -> Neighbor {
        let mut neighbor = Neighbor::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 65002, 65001, Ipv4Addr::new(10, 0, 0, 1));
        neighbor.passive = true;
        neighbor
    }

    fn connected_incoming() -> (Incoming, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, address) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let incoming = Incoming {
            stream: mio::net::TcpStream::from_std(accepted),
            open: Vec::new(),
            address: address.ip(),
        };
        (incoming, client)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut peer = Peer::new(passive_neighbor(), &Environment::default(), bridge());
        let now = Instant::now();

        let mut series = Vec::new();
        for _ in 0..3 {
            peer.more_skip(now);
            series.push(peer.next_skip);
        }
        assert_eq!(series, vec![1, 2, 3]);

        for _ in 0..40 {
            peer.more_skip(now);
        }
        assert_eq!(peer.next_skip, 60);
        assert_eq!(peer.skip_until, Some(now + Duration::from_secs(60)));

        peer.reset_skip();
        assert_eq!(peer.next_skip, 0);
        assert!(peer.skip_until.is_none());
    }

    #[test]
    fn test_stop_then_step_terminates_in_bounded_steps() {
        let mut peer = Peer::new(passive_neighbor(), &Environment::default(), bridge());
        peer.stop();

        assert_eq!(peer.step(), Intent::Done);
        // terminating is idempotent
        assert_eq!(peer.step(), Intent::Done);
        assert_eq!(peer.session_states(), (SessionState::Idle, SessionState::Idle));
    }

    #[test]
    fn test_incoming_is_rejected_outside_idle() {
        let mut peer = Peer::new(passive_neighbor(), &Environment::default(), bridge());

        let (incoming, _client) = connected_incoming();
        assert!(peer.incoming(incoming));
        assert!(matches!(peer.in_slot, Slot::PendingStart));

        // an inbound half-session that already left idle refuses the offer
        peer.in_state = SessionState::Active;
        let (incoming, _client) = connected_incoming();
        assert!(!peer.incoming(incoming));

        // and so does a peer whose outbound direction is established
        peer.in_state = SessionState::Idle;
        peer.out_state = SessionState::Established;
        let (incoming, _client) = connected_incoming();
        assert!(!peer.incoming(incoming));
    }

    #[test]
    fn test_backoff_window_suppresses_outbound_creation() {
        let mut neighbor = passive_neighbor();
        neighbor.passive = false;
        let mut peer = Peer::new(neighbor, &Environment::default(), bridge());

        let now = Instant::now();
        peer.skip_until = Some(now + Duration::from_secs(30));
        peer.next_skip = 1;

        assert_eq!(peer.step_at(now), Intent::Idle);
        assert!(matches!(peer.out_slot, Slot::PendingStart));
        assert!(peer.out_proto.is_none());
    }

    #[test]
    fn test_restart_boundary_applies_replacement_neighbor() {
        let mut peer = Peer::new(passive_neighbor(), &Environment::default(), bridge());

        let mut replacement = passive_neighbor();
        replacement.peer_as = 64999;
        peer.restart(Some(replacement));

        assert_eq!(peer.step(), Intent::Idle);
        assert!(peer.running);
        assert_eq!(peer.neighbor.peer_as, 64999);
        assert!(peer.replacement.is_none());
    }

    #[test]
    fn test_failed_outbound_attempt_stops_peer_with_tcp_once() {
        let mut neighbor = passive_neighbor();
        neighbor.passive = false;
        // nothing listens on this port, so the attempt dies on the first flush
        neighbor.port = 9;
        neighbor.peer_address = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let environment = Environment {
            tcp_once: true,
            ..Environment::default()
        };
        let mut peer = Peer::new(neighbor, &environment, bridge());

        for _ in 0..400 {
            if peer.step() == Intent::Done {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!peer.running);
        assert!(!peer.restart);
        assert_eq!(peer.step(), Intent::Done);
    }
}
