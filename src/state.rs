//! The link state machine.
//!
//! Five states: Disconnected, AwaitingConnection, Connected, TimerRecovery,
//! AwaitingRelease. Everything per-link lives in [`Data`] (the link control
//! block); the states themselves are stateless trait objects. [`handle`] is
//! the single entry point: one event in, zero or one state change plus a
//! list of [`ReturnEvent`]s out.
//!
//! Nothing in here blocks, sleeps, or talks to a device. Timers are
//! deadline records; the driver notices expiry and feeds back `Event::T1`
//! and friends. That keeps every transition synchronous run-to-completion
//! and makes the whole machine testable without a clock.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::debug;

use crate::{
    Addr, Disc, Dm, Frame, FrameType, Frmr, Iframe, LinkConfig, Rej, Rnr, Rr, Sabm, Sabme, Test,
    Ua, Ui, Xid, PID_NO_L3,
};

/// One-shot deadline timer.
///
/// Arm, disarm, query. Disarming an idle timer is a no-op. The timer never
/// calls anybody; owners poll `expired()` or sleep on `remaining()`.
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// Arm, replacing any pending deadline.
    pub fn start(&mut self, d: Duration) {
        self.deadline = Some(Instant::now() + d);
    }
    /// Disarm. Idempotent.
    pub fn stop(&mut self) {
        self.deadline = None;
    }
    #[must_use]
    pub fn running(&self) -> bool {
        self.deadline.is_some()
    }
    #[must_use]
    pub fn expired(&self) -> bool {
        match self.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }
    /// Time until the deadline, or None if not armed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// Local connect request to the given peer.
    Connect(Addr),
    /// Local disconnect request.
    Disconnect,
    /// Local payload to send.
    Data(Vec<u8>),
    /// Local receive buffer filled up; advertise busy.
    ReceiveBusy,
    /// Local receive buffer dropped below the low water mark.
    ReceiveReady,
    T1,
    T2,
    T3,
    Idle,
    Sabm(Sabm, Addr),
    Sabme(Sabme, Addr),
    Ua(Ua),
    Dm(Dm),
    Disc(Disc),
    /// Supervisory and I frames carry the command/response distinction.
    Rr(Rr, bool),
    Rnr(Rnr, bool),
    Rej(Rej, bool),
    Iframe(Iframe, bool),
    Ui(Ui, bool),
    Frmr(Frmr),
    Test(Test),
    Xid(Xid),
}

/// Why the link went down.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Retry budget exhausted without a peer response.
    Timeout,
    /// Peer refused the connection attempt.
    Refused,
    /// Peer reset or aborted an established link.
    Reset,
    /// Orderly release, local or remote.
    Closed,
}

/// Protocol anomaly codes, the LAPB SDL error letters.
///
/// These are diagnostics, not failures: the machine logs them and carries
/// on, since tolerating stray control frames is what keeps links alive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DlError {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
    N,
    O,
    P,
    Q,
    R,
    S,
    T,
    U,
    V,
}

/// What a transition wants done. `State` changes the current state; the
/// rest are translated into [`ReturnEvent`]s by [`handle`].
pub enum Action {
    State(Box<dyn State>),
    DlError(DlError),
    /// SABM or SABME depending on the current modulus.
    SendConnectRequest { poll: bool },
    SendUa { final_: bool },
    SendDm { final_: bool },
    SendDisc { poll: bool },
    SendRr { pf: bool, command: bool },
    SendRnr { pf: bool, command: bool },
    SendRej { pf: bool },
    SendIframe { ns: u8, poll: bool, payload: Vec<u8> },
    Deliver(Vec<u8>),
    LinkUp,
    LinkDown(DisconnectReason),
}

/// What the driver gets back: frames to put on the wire, payload for the
/// upper layer, and the three milestone notifications.
#[derive(Debug, PartialEq, Eq)]
pub enum ReturnEvent {
    Packet(Frame),
    DlError(DlError),
    Data(Vec<u8>),
    LinkUp,
    LinkDown(DisconnectReason),
}

impl ReturnEvent {
    /// Wire bytes for frame events, None for local ones.
    #[must_use]
    pub fn serialize(&self, ext: bool) -> Option<Vec<u8>> {
        match self {
            ReturnEvent::Packet(p) => Some(p.serialize(ext)),
            _ => None,
        }
    }
}

const BASIC_MODULUS: u8 = 8;
const EXTENDED_MODULUS: u8 = 128;
const BASIC_WINDOW: u8 = 4;
const EXTENDED_WINDOW: u8 = 32;

/// Max octets in an I frame information field.
const N1_DEFAULT: usize = 65000;

/// The link control block. One per link, owned by exactly one driver;
/// nothing here is shared or locked.
#[derive(Debug)]
pub struct Data {
    pub me: Addr,
    pub(crate) peer: Option<Addr>,
    config: LinkConfig,

    pub(crate) t1: Timer,
    pub(crate) t2: Timer,
    pub(crate) t3: Timer,
    pub(crate) idle: Timer,

    /// Smoothed round trip estimate feeding the T1 backoff.
    srt: Duration,
    /// Current T1 duration, recomputed on every expiry.
    t1v: Duration,

    vs: u8,
    va: u8,
    vr: u8,
    modulus: u8,
    window: u8,
    n1: usize,
    n2: u8,
    rc: u8,

    peer_busy: bool,
    local_busy: bool,
    reject_exception: bool,
    ack_pending: bool,
    /// Block kept alive after Disconnected until the upper layer lets go.
    draining: bool,

    iframe_queue: VecDeque<Vec<u8>>,
    /// Sent but unacked payloads, keyed by N(S). Front is oldest.
    resend_queue: VecDeque<(u8, Vec<u8>)>,
}

impl Data {
    #[must_use]
    pub fn new(me: Addr, config: LinkConfig) -> Self {
        let modulus = if config.extended {
            EXTENDED_MODULUS
        } else {
            BASIC_MODULUS
        };
        // k must leave one sequence number free or the window arithmetic
        // cannot tell full from empty.
        let window = config
            .window
            .unwrap_or(if config.extended {
                EXTENDED_WINDOW
            } else {
                BASIC_WINDOW
            })
            .min(modulus - 1);
        let srt = config.srt;
        Self {
            me,
            peer: None,
            t1: Timer::default(),
            t2: Timer::default(),
            t3: Timer::default(),
            idle: Timer::default(),
            srt,
            t1v: 2 * srt,
            vs: 0,
            va: 0,
            vr: 0,
            modulus,
            window,
            n1: N1_DEFAULT,
            n2: config.retry_limit,
            rc: 0,
            peer_busy: false,
            local_busy: false,
            reject_exception: false,
            ack_pending: false,
            draining: false,
            iframe_queue: VecDeque::new(),
            resend_queue: VecDeque::new(),
            config,
        }
    }

    #[must_use]
    pub fn ext(&self) -> bool {
        self.modulus == EXTENDED_MODULUS
    }
    #[must_use]
    pub fn modulus(&self) -> u8 {
        self.modulus
    }
    #[must_use]
    pub fn window(&self) -> u8 {
        self.window
    }
    #[must_use]
    pub fn retry_count(&self) -> u8 {
        self.rc
    }
    #[must_use]
    pub fn retry_limit(&self) -> u8 {
        self.n2
    }
    #[must_use]
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }
    #[must_use]
    pub fn peer_busy(&self) -> bool {
        self.peer_busy
    }
    #[must_use]
    pub fn local_busy(&self) -> bool {
        self.local_busy
    }

    /// Keep the block alive after disconnect until the upper layer has
    /// collected everything it still holds.
    pub fn set_draining(&mut self, on: bool) {
        self.draining = on;
    }
    #[must_use]
    pub fn draining(&self) -> bool {
        self.draining
    }

    pub fn t1_expired(&self) -> bool {
        self.t1.expired()
    }
    pub fn t2_expired(&self) -> bool {
        self.t2.expired()
    }
    pub fn t3_expired(&self) -> bool {
        self.t3.expired()
    }
    pub fn idle_expired(&self) -> bool {
        self.idle.expired()
    }

    /// Shortest remaining time across all armed timers, for drivers that
    /// sleep between events.
    #[must_use]
    pub fn next_timer_remaining(&self) -> Option<Duration> {
        [&self.t1, &self.t2, &self.t3, &self.idle]
            .iter()
            .filter_map(|t| t.remaining())
            .min()
    }

    fn seq_next(&self, n: u8) -> u8 {
        (n + 1) % self.modulus
    }

    /// Frames outstanding, i.e. sent but not acked.
    fn outstanding(&self) -> u8 {
        (self.vs + self.modulus - self.va) % self.modulus
    }

    fn window_full(&self) -> bool {
        self.outstanding() >= self.window
    }

    /// An N(R) is valid iff it acknowledges between zero and all
    /// outstanding frames: `va <= nr <= vs` in modulus arithmetic.
    fn nr_valid(&self, nr: u8) -> bool {
        if nr >= self.modulus {
            return false;
        }
        (nr + self.modulus - self.va) % self.modulus <= self.outstanding()
    }

    /// Advance V(A) to `nr`, dropping acked frames from the resend queue.
    /// Returns false (and does nothing) on an invalid N(R).
    fn check_ack(&mut self, nr: u8) -> bool {
        if !self.nr_valid(nr) {
            return false;
        }
        self.touch_idle();
        while self.va != nr {
            self.resend_queue.pop_front();
            self.va = self.seq_next(self.va);
        }
        true
    }

    fn clear_iframe_queue(&mut self) {
        self.iframe_queue.clear();
        self.resend_queue.clear();
    }

    fn clear_exception_conditions(&mut self) {
        self.peer_busy = false;
        self.reject_exception = false;
        self.local_busy = false;
        self.ack_pending = false;
    }

    fn stop_all_timers(&mut self) {
        self.t1.stop();
        self.t2.stop();
        self.t3.stop();
        self.idle.stop();
    }

    /// Arm T1, which implies T3 off. At most one of the two runs.
    fn arm_t1(&mut self) {
        self.t3.stop();
        self.t1.start(self.t1v);
    }

    /// Arm T3, which implies T1 off.
    fn arm_t3(&mut self) {
        self.t1.stop();
        self.t3.start(self.config.t3);
    }

    /// Link activity defers the inactivity teardown. No-op unless the
    /// idle timer is armed, so dead states stay dead.
    fn touch_idle(&mut self) {
        if self.idle.running() {
            self.idle.start(self.config.idle);
        }
    }

    /// Next T1 duration: exponential-style backoff on the round trip
    /// estimate, doubling per retry up to a cap. Tunable policy, not
    /// protocol.
    fn next_t1(&self) -> Duration {
        let shift = u32::from(self.rc.min(5));
        self.srt * 2u32.pow(shift + 1)
    }

    fn set_basic(&mut self) {
        self.modulus = BASIC_MODULUS;
        self.window = self
            .config
            .window
            .unwrap_or(BASIC_WINDOW)
            .min(BASIC_MODULUS - 1);
    }

    fn set_extended(&mut self) {
        self.modulus = EXTENDED_MODULUS;
        self.window = self
            .config
            .window
            .unwrap_or(EXTENDED_WINDOW)
            .min(EXTENDED_MODULUS - 1);
    }

    fn reset_sequence(&mut self) {
        self.vs = 0;
        self.va = 0;
        self.vr = 0;
    }

    /// Start (or restart) connection establishment: SABM/SABME with P set,
    /// fresh retry budget, T1 running.
    fn establish_data_link(&mut self) -> Action {
        self.clear_exception_conditions();
        self.clear_iframe_queue();
        self.rc = 0;
        self.t1v = 2 * self.srt;
        self.t2.stop();
        self.arm_t1();
        Action::SendConnectRequest { poll: true }
    }

    /// Probe the peer: RR (or RNR when busy) command with P set, T1
    /// running. The "transmit enquiry" primitive.
    fn transmit_enquiry(&mut self) -> Action {
        self.ack_pending = false;
        self.t2.stop();
        self.arm_t1();
        if self.local_busy {
            Action::SendRnr {
                pf: true,
                command: true,
            }
        } else {
            Action::SendRr {
                pf: true,
                command: true,
            }
        }
    }

    /// Answer a poll: RR/RNR response, folding in any deferred ack.
    fn enquiry_response(&mut self, final_: bool) -> Action {
        self.ack_pending = false;
        self.t2.stop();
        if self.local_busy {
            Action::SendRnr {
                pf: final_,
                command: false,
            }
        } else {
            Action::SendRr {
                pf: final_,
                command: false,
            }
        }
    }

    /// Post-ack timer housekeeping for the connected states: everything
    /// acked means keepalive mode (T3), anything outstanding means T1.
    fn ack_housekeeping(&mut self) {
        if self.va == self.vs {
            self.rc = 0;
            self.arm_t3();
        } else {
            self.arm_t1();
        }
    }

    /// Hand as many queued payloads to the wire as window and peer allow.
    fn flush_iframes(&mut self) -> Vec<Action> {
        let mut acts = Vec::new();
        while !self.window_full() && !self.peer_busy {
            let Some(payload) = self.iframe_queue.pop_front() else {
                break;
            };
            let ns = self.vs;
            self.vs = self.seq_next(self.vs);
            self.resend_queue.push_back((ns, payload.clone()));
            // The I frame carries the ack, so the deferred one is moot.
            self.ack_pending = false;
            self.t2.stop();
            acts.push(Action::SendIframe {
                ns,
                poll: false,
                payload,
            });
        }
        if !acts.is_empty() {
            self.touch_idle();
            self.arm_t1();
        }
        acts
    }

    /// Resend everything still outstanding, oldest first.
    fn invoke_retransmission(&mut self) -> Vec<Action> {
        let mut acts = Vec::new();
        for (ns, payload) in &self.resend_queue {
            acts.push(Action::SendIframe {
                ns: *ns,
                poll: false,
                payload: payload.clone(),
            });
        }
        if !acts.is_empty() {
            self.arm_t1();
        }
        acts
    }
}

/// The state interface. Defaults ignore the event, which is the correct
/// permissive handling for most stray frames; states override what they
/// care about.
///
/// `Send` so a boxed state can live inside a spawned task.
pub trait State: Send {
    fn name(&self) -> &'static str;
    fn is_state_connected(&self) -> bool {
        false
    }
    fn is_state_disconnected(&self) -> bool {
        false
    }

    fn connect(&self, _data: &mut Data, _addr: &Addr) -> Vec<Action> {
        debug!("ignoring connect request in this state");
        vec![]
    }
    fn disconnect(&self, _data: &mut Data) -> Vec<Action> {
        debug!("ignoring disconnect request in this state");
        vec![]
    }
    fn data(&self, data: &mut Data, payload: &[u8]) -> Vec<Action> {
        // Queue for after establishment.
        data.iframe_queue.push_back(payload.to_vec());
        vec![]
    }
    fn receive_busy(&self, data: &mut Data) -> Vec<Action> {
        data.local_busy = true;
        vec![]
    }
    fn receive_ready(&self, data: &mut Data) -> Vec<Action> {
        data.local_busy = false;
        vec![]
    }
    // Stray timer fires disarm the timer so a deadline-polling driver
    // does not see the same expiry forever.
    fn t1(&self, data: &mut Data) -> Vec<Action> {
        data.t1.stop();
        vec![]
    }
    fn t2(&self, data: &mut Data) -> Vec<Action> {
        data.t2.stop();
        vec![]
    }
    fn t3(&self, data: &mut Data) -> Vec<Action> {
        data.t3.stop();
        vec![]
    }
    fn idle(&self, data: &mut Data) -> Vec<Action> {
        data.idle.stop();
        vec![]
    }
    fn sabm(&self, _data: &mut Data, _src: &Addr, _packet: &Sabm) -> Vec<Action> {
        vec![]
    }
    fn sabme(&self, _data: &mut Data, _src: &Addr, _packet: &Sabme) -> Vec<Action> {
        vec![]
    }
    fn ua(&self, _data: &mut Data, _packet: &Ua) -> Vec<Action> {
        vec![Action::DlError(DlError::C)]
    }
    fn dm(&self, _data: &mut Data, _packet: &Dm) -> Vec<Action> {
        vec![]
    }
    fn disc(&self, _data: &mut Data, _packet: &Disc) -> Vec<Action> {
        vec![]
    }
    fn rr(&self, _data: &mut Data, _packet: &Rr, _command: bool) -> Vec<Action> {
        vec![]
    }
    fn rnr(&self, _data: &mut Data, _packet: &Rnr, _command: bool) -> Vec<Action> {
        vec![]
    }
    fn rej(&self, _data: &mut Data, _packet: &Rej, _command: bool) -> Vec<Action> {
        vec![]
    }
    fn iframe(&self, _data: &mut Data, _packet: &Iframe, _command: bool) -> Vec<Action> {
        vec![]
    }
    fn ui(&self, _data: &mut Data, _command: bool, _packet: &Ui) -> Vec<Action> {
        vec![]
    }
    fn frmr(&self, _data: &mut Data, _packet: &Frmr) -> Vec<Action> {
        vec![]
    }
    fn test(&self, _data: &mut Data, _packet: &Test) -> Vec<Action> {
        vec![]
    }
    fn xid(&self, _data: &mut Data, _packet: &Xid) -> Vec<Action> {
        vec![]
    }
}

// UI frames carry no state; just sanity checks.
fn ui_check(command: bool) -> Vec<Action> {
    if !command {
        return vec![Action::DlError(DlError::Q)];
    }
    vec![]
}

/// No link. Initial and terminal.
struct Disconnected {}

impl Disconnected {
    fn new() -> Self {
        Self {}
    }

    /// Passive accept, mode already chosen by the caller.
    fn accept(&self, data: &mut Data, src: Addr, poll: bool) -> Vec<Action> {
        data.clear_exception_conditions();
        data.clear_iframe_queue();
        data.reset_sequence();
        data.rc = 0;
        data.t1v = 2 * data.srt;
        data.peer = Some(src);
        data.draining = false;
        data.arm_t3();
        data.idle.start(data.config.idle);
        vec![
            Action::SendUa { final_: poll },
            Action::LinkUp,
            Action::State(Box::new(Connected::new())),
        ]
    }
}

impl State for Disconnected {
    fn name(&self) -> &'static str {
        "Disconnected"
    }
    fn is_state_disconnected(&self) -> bool {
        true
    }

    fn connect(&self, data: &mut Data, addr: &Addr) -> Vec<Action> {
        data.peer = Some(addr.clone());
        data.draining = false;
        if data.config.extended {
            data.set_extended();
        } else {
            data.set_basic();
        }
        vec![
            data.establish_data_link(),
            Action::State(Box::new(AwaitingConnection::new())),
        ]
    }

    // Already down. No-op, by design.
    fn disconnect(&self, _data: &mut Data) -> Vec<Action> {
        vec![]
    }

    fn sabm(&self, data: &mut Data, src: &Addr, p: &Sabm) -> Vec<Action> {
        data.set_basic();
        self.accept(data, src.clone(), p.poll)
    }

    fn sabme(&self, data: &mut Data, src: &Addr, p: &Sabme) -> Vec<Action> {
        data.set_extended();
        self.accept(data, src.clone(), p.poll)
    }

    fn disc(&self, _data: &mut Data, p: &Disc) -> Vec<Action> {
        vec![Action::SendDm { final_: p.poll }]
    }

    fn rr(&self, _data: &mut Data, p: &Rr, command: bool) -> Vec<Action> {
        if command && p.poll {
            vec![Action::SendDm { final_: true }]
        } else {
            vec![]
        }
    }

    fn iframe(&self, _data: &mut Data, p: &Iframe, command: bool) -> Vec<Action> {
        if command && p.poll {
            vec![Action::SendDm { final_: true }]
        } else {
            vec![]
        }
    }

    fn ui(&self, _data: &mut Data, command: bool, p: &Ui) -> Vec<Action> {
        let mut ret = ui_check(command);
        if p.push {
            ret.push(Action::SendDm { final_: true });
        }
        ret
    }

    fn ua(&self, _data: &mut Data, _packet: &Ua) -> Vec<Action> {
        vec![Action::DlError(DlError::C)]
    }
}

/// SABM/SABME sent, waiting for the peer to take it.
struct AwaitingConnection {}

impl AwaitingConnection {
    fn new() -> Self {
        Self {}
    }
}

impl State for AwaitingConnection {
    fn name(&self) -> &'static str {
        "AwaitingConnection"
    }

    fn t1(&self, data: &mut Data) -> Vec<Action> {
        if data.rc >= data.n2 {
            if data.ext() {
                // One graceful fallback: the peer may simply not speak
                // extended mode. Fresh budget, basic SABM, not a failure.
                debug!("connect retries exhausted, downgrading to basic mode");
                data.set_basic();
                data.rc = 0;
                data.t1v = 2 * data.srt;
                data.arm_t1();
                vec![Action::SendConnectRequest { poll: true }]
            } else {
                debug!("connect retries exhausted, giving up");
                data.stop_all_timers();
                data.clear_iframe_queue();
                vec![
                    Action::LinkDown(DisconnectReason::Timeout),
                    Action::State(Box::new(Disconnected::new())),
                ]
            }
        } else {
            data.rc += 1;
            data.t1v = data.next_t1();
            data.arm_t1();
            vec![Action::SendConnectRequest { poll: true }]
        }
    }

    fn ua(&self, data: &mut Data, _p: &Ua) -> Vec<Action> {
        data.reset_sequence();
        data.rc = 0;
        data.t1v = 2 * data.srt;
        data.arm_t3();
        data.idle.start(data.config.idle);
        let mut ret = vec![Action::LinkUp];
        ret.extend(data.flush_iframes());
        ret.push(Action::State(Box::new(Connected::new())));
        ret
    }

    fn dm(&self, data: &mut Data, p: &Dm) -> Vec<Action> {
        if !p.poll {
            return vec![];
        }
        data.stop_all_timers();
        data.clear_iframe_queue();
        vec![
            Action::LinkDown(DisconnectReason::Refused),
            Action::State(Box::new(Disconnected::new())),
        ]
    }

    fn frmr(&self, data: &mut Data, _p: &Frmr) -> Vec<Action> {
        if !data.ext() {
            return vec![Action::DlError(DlError::K)];
        }
        // Peer rejects extended addressing outright; downgrade without
        // burning the rest of the retry budget.
        data.set_basic();
        data.rc = 0;
        data.t1v = 2 * data.srt;
        data.arm_t1();
        vec![Action::SendConnectRequest { poll: true }]
    }

    fn sabm(&self, _data: &mut Data, _src: &Addr, p: &Sabm) -> Vec<Action> {
        // Connect collision; accept theirs, keep waiting for our UA.
        vec![Action::SendUa { final_: p.poll }]
    }

    fn disc(&self, _data: &mut Data, p: &Disc) -> Vec<Action> {
        vec![Action::SendDm { final_: p.poll }]
    }

    fn disconnect(&self, data: &mut Data) -> Vec<Action> {
        data.stop_all_timers();
        data.clear_iframe_queue();
        vec![
            Action::LinkDown(DisconnectReason::Closed),
            Action::State(Box::new(Disconnected::new())),
        ]
    }
}

/// DISC sent, waiting for the peer to confirm release.
struct AwaitingRelease {}

impl AwaitingRelease {
    fn new() -> Self {
        Self {}
    }

    fn released(&self, data: &mut Data) -> Vec<Action> {
        data.stop_all_timers();
        vec![
            Action::LinkDown(DisconnectReason::Closed),
            Action::State(Box::new(Disconnected::new())),
        ]
    }
}

impl State for AwaitingRelease {
    fn name(&self) -> &'static str {
        "AwaitingRelease"
    }

    fn t1(&self, data: &mut Data) -> Vec<Action> {
        if data.rc >= data.n2 {
            debug!("release retries exhausted, giving up");
            data.stop_all_timers();
            vec![
                Action::LinkDown(DisconnectReason::Timeout),
                Action::State(Box::new(Disconnected::new())),
            ]
        } else {
            data.rc += 1;
            data.t1v = data.next_t1();
            data.arm_t1();
            vec![Action::SendDisc { poll: true }]
        }
    }

    fn ua(&self, data: &mut Data, _p: &Ua) -> Vec<Action> {
        self.released(data)
    }

    fn dm(&self, data: &mut Data, _p: &Dm) -> Vec<Action> {
        self.released(data)
    }

    fn disc(&self, _data: &mut Data, p: &Disc) -> Vec<Action> {
        // Release collision. Confirm theirs, keep waiting for ours.
        vec![Action::SendUa { final_: p.poll }]
    }

    fn sabm(&self, _data: &mut Data, _src: &Addr, p: &Sabm) -> Vec<Action> {
        vec![Action::SendDm { final_: p.poll }]
    }

    fn data(&self, _data: &mut Data, _payload: &[u8]) -> Vec<Action> {
        // Tearing down; new data has nowhere to go.
        vec![]
    }

    fn disconnect(&self, _data: &mut Data) -> Vec<Action> {
        vec![]
    }
}

// Shared between Connected and TimerRecovery.

fn common_iframe(data: &mut Data, p: &Iframe, command: bool) -> Vec<Action> {
    if !command {
        return vec![Action::DlError(DlError::S)];
    }
    if p.payload.len() > data.n1 {
        return vec![
            Action::DlError(DlError::O),
            data.establish_data_link(),
            Action::State(Box::new(AwaitingConnection::new())),
        ];
    }
    if !data.check_ack(p.nr) {
        return nr_error_recovery(data);
    }
    let mut ret = Vec::new();
    if data.local_busy {
        // Can't take it; the busy condition was already advertised.
        if p.poll {
            ret.push(data.enquiry_response(true));
        }
        return ret;
    }
    if p.ns == data.vr {
        data.vr = data.seq_next(data.vr);
        data.reject_exception = false;
        ret.push(Action::Deliver(p.payload.clone()));
        if p.poll {
            ret.push(data.enquiry_response(true));
        } else {
            // Defer the ack; T2 or the next outbound I frame carries it.
            data.ack_pending = true;
            data.t2.start(data.config.t2);
        }
    } else if data.reject_exception {
        if p.poll {
            ret.push(data.enquiry_response(true));
        }
    } else {
        data.reject_exception = true;
        data.ack_pending = false;
        data.t2.stop();
        ret.push(Action::SendRej { pf: p.poll });
    }
    ret
}

fn nr_error_recovery(data: &mut Data) -> Vec<Action> {
    vec![
        Action::DlError(DlError::J),
        data.establish_data_link(),
        Action::State(Box::new(AwaitingConnection::new())),
    ]
}

fn common_disc(data: &mut Data, p: &Disc) -> Vec<Action> {
    data.clear_iframe_queue();
    data.stop_all_timers();
    vec![
        Action::SendUa { final_: p.poll },
        Action::LinkDown(DisconnectReason::Closed),
        Action::State(Box::new(Disconnected::new())),
    ]
}

fn common_dm(data: &mut Data, _p: &Dm) -> Vec<Action> {
    data.clear_iframe_queue();
    data.stop_all_timers();
    vec![
        Action::DlError(DlError::E),
        Action::LinkDown(DisconnectReason::Reset),
        Action::State(Box::new(Disconnected::new())),
    ]
}

fn common_frmr(data: &mut Data, _p: &Frmr) -> Vec<Action> {
    vec![
        Action::DlError(DlError::K),
        data.establish_data_link(),
        Action::State(Box::new(AwaitingConnection::new())),
    ]
}

fn common_disconnect(data: &mut Data) -> Vec<Action> {
    data.clear_iframe_queue();
    data.clear_exception_conditions();
    data.rc = 0;
    data.t2.stop();
    data.idle.stop();
    data.arm_t1();
    vec![
        Action::SendDisc { poll: true },
        Action::State(Box::new(AwaitingRelease::new())),
    ]
}

fn common_idle(data: &mut Data) -> Vec<Action> {
    debug!("inactivity timeout, releasing the link");
    common_disconnect(data)
}

fn common_t2(data: &mut Data) -> Vec<Action> {
    data.t2.stop();
    if !data.ack_pending {
        return vec![];
    }
    data.ack_pending = false;
    vec![Action::SendRr {
        pf: false,
        command: false,
    }]
}

fn link_reset(data: &mut Data, poll: bool) -> Vec<Action> {
    data.clear_exception_conditions();
    data.clear_iframe_queue();
    data.reset_sequence();
    data.rc = 0;
    data.t2.stop();
    data.arm_t3();
    vec![
        Action::DlError(DlError::F),
        Action::SendUa { final_: poll },
        Action::State(Box::new(Connected::new())),
    ]
}

/// Link up, flowing normally. T3 runs when nothing is outstanding, T1 when
/// something is.
struct Connected {}

impl Connected {
    fn new() -> Self {
        Self {}
    }
}

impl State for Connected {
    fn name(&self) -> &'static str {
        "Connected"
    }
    fn is_state_connected(&self) -> bool {
        true
    }

    fn data(&self, data: &mut Data, payload: &[u8]) -> Vec<Action> {
        data.iframe_queue.push_back(payload.to_vec());
        data.flush_iframes()
    }

    fn disconnect(&self, data: &mut Data) -> Vec<Action> {
        common_disconnect(data)
    }

    fn t1(&self, data: &mut Data) -> Vec<Action> {
        // Outstanding I frames went unacked for a full T1. Probe. The
        // first probe burns a retry unless there is no budget at all.
        data.rc = data.n2.min(1);
        data.t1v = data.next_t1();
        vec![
            data.transmit_enquiry(),
            Action::State(Box::new(TimerRecovery::new())),
        ]
    }

    fn t2(&self, data: &mut Data) -> Vec<Action> {
        common_t2(data)
    }

    fn t3(&self, data: &mut Data) -> Vec<Action> {
        // Quiet too long; make sure the peer is still there.
        data.rc = data.n2.min(1);
        data.t1v = 2 * data.srt;
        vec![
            data.transmit_enquiry(),
            Action::State(Box::new(TimerRecovery::new())),
        ]
    }

    fn idle(&self, data: &mut Data) -> Vec<Action> {
        common_idle(data)
    }

    fn receive_ready(&self, data: &mut Data) -> Vec<Action> {
        if !data.local_busy {
            return vec![];
        }
        // Buffer drained below the low water mark; tell the peer without
        // waiting to be asked.
        data.local_busy = false;
        data.ack_pending = false;
        data.t2.stop();
        vec![Action::SendRr {
            pf: false,
            command: false,
        }]
    }

    fn iframe(&self, data: &mut Data, p: &Iframe, command: bool) -> Vec<Action> {
        let mut ret = common_iframe(data, p, command);
        if !ret.iter().any(|a| matches!(a, Action::State(_))) {
            data.ack_housekeeping_if_acked();
            ret.extend(data.flush_iframes());
        }
        ret
    }

    fn rr(&self, data: &mut Data, p: &Rr, command: bool) -> Vec<Action> {
        data.peer_busy = false;
        if !data.check_ack(p.nr) {
            return nr_error_recovery(data);
        }
        let mut ret = Vec::new();
        if command && p.poll {
            ret.push(data.enquiry_response(true));
        }
        data.ack_housekeeping();
        ret.extend(data.flush_iframes());
        ret
    }

    fn rnr(&self, data: &mut Data, p: &Rnr, command: bool) -> Vec<Action> {
        data.peer_busy = true;
        if !data.check_ack(p.nr) {
            return nr_error_recovery(data);
        }
        let mut ret = Vec::new();
        if command && p.poll {
            ret.push(data.enquiry_response(true));
        }
        // Busy peer: keep T1 running so we eventually probe for relief.
        data.arm_t1();
        ret
    }

    fn rej(&self, data: &mut Data, p: &Rej, command: bool) -> Vec<Action> {
        data.peer_busy = false;
        if !data.check_ack(p.nr) {
            return nr_error_recovery(data);
        }
        let mut ret = Vec::new();
        if command && p.poll {
            ret.push(data.enquiry_response(true));
        }
        ret.extend(data.invoke_retransmission());
        if data.resend_queue.is_empty() {
            data.ack_housekeeping();
        }
        ret
    }

    fn ua(&self, _data: &mut Data, _p: &Ua) -> Vec<Action> {
        vec![Action::DlError(DlError::C)]
    }

    fn dm(&self, data: &mut Data, p: &Dm) -> Vec<Action> {
        common_dm(data, p)
    }

    fn disc(&self, data: &mut Data, p: &Disc) -> Vec<Action> {
        common_disc(data, p)
    }

    fn sabm(&self, data: &mut Data, _src: &Addr, p: &Sabm) -> Vec<Action> {
        if data.ext() {
            return vec![Action::DlError(DlError::F)];
        }
        link_reset(data, p.poll)
    }

    fn sabme(&self, data: &mut Data, _src: &Addr, p: &Sabme) -> Vec<Action> {
        if !data.ext() {
            return vec![Action::DlError(DlError::F)];
        }
        link_reset(data, p.poll)
    }

    fn frmr(&self, data: &mut Data, p: &Frmr) -> Vec<Action> {
        common_frmr(data, p)
    }

    fn ui(&self, _data: &mut Data, command: bool, p: &Ui) -> Vec<Action> {
        let mut ret = ui_check(command);
        if command {
            ret.push(Action::Deliver(p.payload.clone()));
        }
        ret
    }
}

/// A poll is in flight; every T1 expiry burns one retry until the peer
/// answers with F set or the budget runs out.
struct TimerRecovery {}

impl TimerRecovery {
    fn new() -> Self {
        Self {}
    }

    fn recover(&self, data: &mut Data) -> Vec<Action> {
        data.rc = 0;
        data.t1v = 2 * data.srt;
        if data.va == data.vs {
            data.arm_t3();
            vec![Action::State(Box::new(Connected::new()))]
        } else {
            let mut ret = data.invoke_retransmission();
            ret.push(Action::State(Box::new(Connected::new())));
            ret
        }
    }
}

impl State for TimerRecovery {
    fn name(&self) -> &'static str {
        "TimerRecovery"
    }
    fn is_state_connected(&self) -> bool {
        true
    }

    fn t1(&self, data: &mut Data) -> Vec<Action> {
        if data.rc >= data.n2 {
            debug!("recovery retries exhausted, giving up");
            data.stop_all_timers();
            data.clear_iframe_queue();
            // Best effort courtesy to the peer; not retried.
            vec![
                Action::SendDm { final_: true },
                Action::LinkDown(DisconnectReason::Timeout),
                Action::State(Box::new(Disconnected::new())),
            ]
        } else {
            data.rc += 1;
            data.t1v = data.next_t1();
            vec![data.transmit_enquiry()]
        }
    }

    fn t2(&self, data: &mut Data) -> Vec<Action> {
        common_t2(data)
    }

    fn idle(&self, data: &mut Data) -> Vec<Action> {
        common_idle(data)
    }

    fn data(&self, data: &mut Data, payload: &[u8]) -> Vec<Action> {
        // Queue; nothing goes out until recovery resolves.
        data.iframe_queue.push_back(payload.to_vec());
        vec![]
    }

    fn disconnect(&self, data: &mut Data) -> Vec<Action> {
        common_disconnect(data)
    }

    fn rr(&self, data: &mut Data, p: &Rr, command: bool) -> Vec<Action> {
        data.peer_busy = false;
        if !data.check_ack(p.nr) {
            return nr_error_recovery(data);
        }
        if command {
            let mut ret = Vec::new();
            if p.poll {
                ret.push(data.enquiry_response(true));
            }
            return ret;
        }
        if p.poll {
            // The final we were waiting for.
            self.recover(data)
        } else {
            vec![]
        }
    }

    fn rnr(&self, data: &mut Data, p: &Rnr, command: bool) -> Vec<Action> {
        data.peer_busy = true;
        if !data.check_ack(p.nr) {
            return nr_error_recovery(data);
        }
        if command {
            let mut ret = Vec::new();
            if p.poll {
                ret.push(data.enquiry_response(true));
            }
            return ret;
        }
        if p.poll {
            // Peer is alive, just busy. Back to Connected; T1 stays armed
            // until the busy condition clears.
            data.rc = 0;
            data.arm_t1();
            vec![Action::State(Box::new(Connected::new()))]
        } else {
            vec![]
        }
    }

    fn rej(&self, data: &mut Data, p: &Rej, command: bool) -> Vec<Action> {
        data.peer_busy = false;
        if !data.check_ack(p.nr) {
            return nr_error_recovery(data);
        }
        if command {
            let mut ret = Vec::new();
            if p.poll {
                ret.push(data.enquiry_response(true));
            }
            ret.extend(data.invoke_retransmission());
            return ret;
        }
        if p.poll {
            self.recover(data)
        } else {
            data.invoke_retransmission()
        }
    }

    fn iframe(&self, data: &mut Data, p: &Iframe, command: bool) -> Vec<Action> {
        common_iframe(data, p, command)
    }

    fn ua(&self, _data: &mut Data, _p: &Ua) -> Vec<Action> {
        vec![Action::DlError(DlError::C)]
    }

    fn dm(&self, data: &mut Data, p: &Dm) -> Vec<Action> {
        common_dm(data, p)
    }

    fn disc(&self, data: &mut Data, p: &Disc) -> Vec<Action> {
        common_disc(data, p)
    }

    fn sabm(&self, data: &mut Data, _src: &Addr, p: &Sabm) -> Vec<Action> {
        if data.ext() {
            return vec![Action::DlError(DlError::F)];
        }
        link_reset(data, p.poll)
    }

    fn sabme(&self, data: &mut Data, _src: &Addr, p: &Sabme) -> Vec<Action> {
        if !data.ext() {
            return vec![Action::DlError(DlError::F)];
        }
        link_reset(data, p.poll)
    }

    fn frmr(&self, data: &mut Data, p: &Frmr) -> Vec<Action> {
        common_frmr(data, p)
    }
}

impl Data {
    /// Like `ack_housekeeping`, but leaves the timers alone when nothing
    /// changed; used on the I frame receive path where T2 may be running.
    fn ack_housekeeping_if_acked(&mut self) {
        if self.va == self.vs && self.t1.running() {
            self.rc = 0;
            self.arm_t3();
        } else if self.va != self.vs {
            self.arm_t1();
        }
    }
}

/// Fresh machine in the initial state.
#[must_use]
pub fn new() -> Box<dyn State> {
    Box::new(Disconnected::new())
}

/// Map a received frame to its machine event.
#[must_use]
pub fn frame_event(packet: &Frame) -> Event {
    match &packet.frame_type {
        FrameType::Sabm(p) => Event::Sabm(p.clone(), packet.src.clone()),
        FrameType::Sabme(p) => Event::Sabme(p.clone(), packet.src.clone()),
        FrameType::Ua(p) => Event::Ua(p.clone()),
        FrameType::Dm(p) => Event::Dm(p.clone()),
        FrameType::Disc(p) => Event::Disc(p.clone()),
        FrameType::Rr(p) => Event::Rr(p.clone(), packet.command),
        FrameType::Rnr(p) => Event::Rnr(p.clone(), packet.command),
        FrameType::Rej(p) => Event::Rej(p.clone(), packet.command),
        FrameType::Iframe(p) => Event::Iframe(p.clone(), packet.command),
        FrameType::Ui(p) => Event::Ui(p.clone(), packet.command),
        FrameType::Frmr(p) => Event::Frmr(p.clone()),
        FrameType::Test(p) => Event::Test(p.clone()),
        FrameType::Xid(p) => Event::Xid(p.clone()),
    }
}

/// Run one event against the machine. Returns the new state, if it
/// changed, and everything the driver must do.
pub fn handle(
    state: &dyn State,
    data: &mut Data,
    event: &Event,
) -> (Option<Box<dyn State>>, Vec<ReturnEvent>) {
    let actions = match event {
        Event::Connect(addr) => state.connect(data, addr),
        Event::Disconnect => state.disconnect(data),
        Event::Data(payload) => state.data(data, payload),
        Event::ReceiveBusy => state.receive_busy(data),
        Event::ReceiveReady => state.receive_ready(data),
        Event::T1 => state.t1(data),
        Event::T2 => state.t2(data),
        Event::T3 => state.t3(data),
        Event::Idle => state.idle(data),
        Event::Sabm(p, src) => state.sabm(data, src, p),
        Event::Sabme(p, src) => state.sabme(data, src, p),
        Event::Ua(p) => state.ua(data, p),
        Event::Dm(p) => state.dm(data, p),
        Event::Disc(p) => state.disc(data, p),
        Event::Rr(p, command) => state.rr(data, p, *command),
        Event::Rnr(p, command) => state.rnr(data, p, *command),
        Event::Rej(p, command) => state.rej(data, p, *command),
        Event::Iframe(p, command) => state.iframe(data, p, *command),
        Event::Ui(p, command) => state.ui(data, *command, p),
        Event::Frmr(p) => state.frmr(data, p),
        Event::Test(p) => state.test(data, p),
        Event::Xid(p) => state.xid(data, p),
    };
    let mut ret = Vec::new();
    for act in &actions {
        let frame_type = match act {
            Action::State(_) => None,
            Action::DlError(code) => {
                debug!("DL error {code:?} in {}", state.name());
                ret.push(ReturnEvent::DlError(*code));
                None
            }
            Action::Deliver(payload) => {
                ret.push(ReturnEvent::Data(payload.clone()));
                None
            }
            Action::LinkUp => {
                ret.push(ReturnEvent::LinkUp);
                None
            }
            Action::LinkDown(reason) => {
                ret.push(ReturnEvent::LinkDown(*reason));
                None
            }
            Action::SendConnectRequest { poll } => Some((
                if data.ext() {
                    FrameType::Sabme(Sabme { poll: *poll })
                } else {
                    FrameType::Sabm(Sabm { poll: *poll })
                },
                true,
            )),
            Action::SendUa { final_ } => Some((FrameType::Ua(Ua { poll: *final_ }), false)),
            Action::SendDm { final_ } => Some((FrameType::Dm(Dm { poll: *final_ }), false)),
            Action::SendDisc { poll } => Some((FrameType::Disc(Disc { poll: *poll }), true)),
            Action::SendRr { pf, command } => Some((
                FrameType::Rr(Rr {
                    poll: *pf,
                    nr: data.vr,
                }),
                *command,
            )),
            Action::SendRnr { pf, command } => Some((
                FrameType::Rnr(Rnr {
                    poll: *pf,
                    nr: data.vr,
                }),
                *command,
            )),
            Action::SendRej { pf } => Some((
                FrameType::Rej(Rej {
                    poll: *pf,
                    nr: data.vr,
                }),
                false,
            )),
            Action::SendIframe { ns, poll, payload } => Some((
                FrameType::Iframe(Iframe {
                    nr: data.vr,
                    ns: *ns,
                    poll: *poll,
                    pid: PID_NO_L3,
                    payload: payload.clone(),
                }),
                true,
            )),
        };
        if let Some((frame_type, command)) = frame_type {
            match &data.peer {
                Some(peer) => ret.push(ReturnEvent::Packet(Frame {
                    src: data.me.clone(),
                    dst: peer.clone(),
                    command,
                    frame_type,
                })),
                None => debug!("no peer address, dropping outbound frame"),
            }
        }
    }
    for act in actions {
        if let Action::State(new_state) = act {
            debug!("state {} -> {}", state.name(), new_state.name());
            return (Some(new_state), ret);
        }
    }
    (None, ret)
}
