//! Synchronous per-link driver.
//!
//! One [`Client`] owns one link: its control block, its state, and the
//! [`FramePort`] it talks through. All events for the link — inbound
//! frames, local requests, timer expiries — are fed through this one
//! struct, which is what makes the machine's single-threaded,
//! run-to-completion model hold. Run many links by making many clients;
//! they share nothing.
//!
//! # Examples
//!
//! ```no_run
//! use balink::{Addr, Client, LinkConfig, mem::MemPort};
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! let done = Arc::new(AtomicBool::new(false));
//! let (port, _peer) = MemPort::pair();
//! let mut client = Client::new(Addr::new("M0THC-1")?, LinkConfig::default(), Box::new(port));
//! client.connect(&Addr::new("M0THC-2")?)?;
//! client.write(b"Hello\r")?;
//! println!("{:?}", client.read_until(done.clone()));
//! # Ok::<(), anyhow::Error>(())
//! ```
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use log::{debug, error};

use crate::state::{self, DisconnectReason, Event, ReturnEvent};
use crate::{Addr, Frame, FramePort, FrameType, LinkConfig};

/// A connected mode link endpoint, either side.
///
/// `read_until()` must be called often enough to answer peer polls (how
/// often depends on both ends' T1/T3), or the peer will tear the link
/// down as dead.
#[must_use]
pub struct Client {
    port: Box<dyn FramePort>,
    pub(crate) data: state::Data,
    state: Box<dyn state::State>,
    eof: bool,
    closed: Option<DisconnectReason>,

    incoming: VecDeque<u8>,
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            error!("Error disconnecting on drop: {e}");
        }
    }
}

impl Client {
    /// New idle link with the given local address and channel.
    pub fn new(me: Addr, config: LinkConfig, port: Box<dyn FramePort>) -> Self {
        Self {
            port,
            eof: false,
            closed: None,
            data: state::Data::new(me, config),
            state: state::new(),
            incoming: VecDeque::new(),
        }
    }

    /// Connect to a remote node. Blocks until established or the retry
    /// budget (including a possible extended-to-basic downgrade) runs out.
    pub fn connect(&mut self, addr: &Addr) -> Result<()> {
        self.actions(Event::Connect(addr.clone()))?;
        loop {
            let dead = self.data.next_timer_remaining();
            let packet = self
                .port
                .recv_timeout(dead.unwrap_or(Duration::from_secs(60)))?;
            if let Some(packet) = packet {
                if let Some(packet) = self.parse_for_us(&packet) {
                    self.actions(state::frame_event(&packet))?;
                    if self.state.is_state_connected() {
                        debug!("Connection successful");
                        return Ok(());
                    }
                }
            }
            self.pump_timers()?;
            if self.state.is_state_disconnected() {
                debug!("Connection failed: {:?}", self.closed);
                return Err(Error::msg("connection timeout"));
            }
        }
    }

    /// Wait for an incoming connection on this link, until the deadline.
    ///
    /// Returns true when a peer connected.
    pub fn accept(&mut self, until: Instant) -> Result<bool> {
        loop {
            let now = Instant::now();
            if until < now {
                return Ok(false);
            }
            let packet = self
                .port
                .recv_timeout(until.saturating_duration_since(now))?;
            let Some(packet) = packet else {
                continue;
            };
            let Ok(packet) = Frame::parse(&packet, self.data.ext()) else {
                continue;
            };
            if packet.dst.call() != self.data.me.call() {
                continue;
            }
            if matches!(packet.frame_type, FrameType::Sabm(_) | FrameType::Sabme(_)) {
                self.actions(state::frame_event(&packet))?;
                return Ok(self.state.is_state_connected());
            }
        }
    }

    /// Disconnect an ongoing connection. Idempotent; a no-op when the
    /// link is already down.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.state.is_state_disconnected() {
            self.actions(Event::Disconnect)?;
        }
        Ok(())
    }

    /// Queue data on an established connection. Goes out immediately if
    /// window and peer allow, otherwise when an ack opens the window.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.actions(Event::Data(data.to_vec()))
    }

    /// True once the link is down, for whatever reason.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Why the link went down, if it did.
    #[must_use]
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.closed
    }

    /// Advertise receive-buffer pressure to the peer.
    pub fn set_busy(&mut self, busy: bool) -> Result<()> {
        self.actions(if busy {
            Event::ReceiveBusy
        } else {
            Event::ReceiveReady
        })
    }

    /// Read data, pumping the link while waiting.
    ///
    /// Returns Some data, or None once the remote end disconnected and
    /// everything delivered has been drained.
    pub fn read_until(&mut self, done: Arc<AtomicBool>) -> Result<Option<Vec<u8>>> {
        while self.incoming.is_empty() {
            if self.eof {
                self.data.set_draining(false);
                return Ok(None);
            }
            if done.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(p) = self.try_read()? {
                self.actions(state::frame_event(&p))?;
            }
            self.pump_timers()?;
        }
        let ret: Vec<_> = self.incoming.iter().cloned().collect();
        self.incoming.clear();
        if self.eof {
            // Last buffered delivery handed over; block no longer needed.
            self.data.set_draining(false);
        }
        Ok(Some(ret))
    }

    fn parse_for_us(&self, bytes: &[u8]) -> Option<Frame> {
        let packet = match Frame::parse(bytes, self.data.ext()) {
            Ok(p) => p,
            Err(e) => {
                debug!("Dropping unparseable frame: {e}");
                return None;
            }
        };
        if packet.dst.call() != self.data.me.call() {
            return None;
        }
        if let Some(peer) = &self.data.peer {
            if packet.src.call() != peer.call() {
                return None;
            }
        }
        Some(packet)
    }

    fn try_read(&mut self) -> Result<Option<Frame>> {
        let deadline = self
            .data
            .next_timer_remaining()
            .unwrap_or(Duration::from_millis(100))
            .min(Duration::from_millis(100));
        let Some(bytes) = self.port.recv_timeout(deadline)? else {
            return Ok(None);
        };
        Ok(self.parse_for_us(&bytes))
    }

    /// Feed expiry events for every timer past its deadline.
    fn pump_timers(&mut self) -> Result<()> {
        if self.data.t1_expired() {
            self.actions(Event::T1)?;
        }
        if self.data.t2_expired() {
            self.actions(Event::T2)?;
        }
        if self.data.t3_expired() {
            self.actions(Event::T3)?;
        }
        if self.data.idle_expired() {
            self.actions(Event::Idle)?;
        }
        Ok(())
    }

    /// Run one event through the machine and carry out what it asks:
    /// transmit frames, buffer delivered data, record notifications.
    fn actions(&mut self, event: Event) -> Result<()> {
        let (state, actions) = state::handle(&*self.state, &mut self.data, &event);
        if let Some(state) = state {
            self.state = state;
        }
        for act in actions {
            match &act {
                ReturnEvent::DlError(e) => debug!("DL error: {e:?}"),
                ReturnEvent::LinkUp => debug!("Link established"),
                ReturnEvent::LinkDown(reason) => {
                    debug!("Link down: {reason:?}");
                    self.eof = true;
                    self.closed = Some(*reason);
                    if !self.incoming.is_empty() {
                        // Keep the block around until the data is read.
                        self.data.set_draining(true);
                    }
                }
                ReturnEvent::Data(d) => {
                    debug!("Delivering {} bytes", d.len());
                    self.incoming.extend(d);
                }
                ReturnEvent::Packet(_) => {}
            }
            if let Some(frame) = act.serialize(self.data.ext()) {
                self.port.send(&frame)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemPort;
    use crate::{Dm, Iframe, Rr, Sabm, Ua, PID_NO_L3};

    fn addr(s: &str) -> Addr {
        Addr::new(s).unwrap()
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            retry_limit: 2,
            srt: Duration::from_millis(5),
            t2: Duration::from_millis(2),
            ..LinkConfig::default()
        }
    }

    // Scripted peer: parses what the client sends and replies per frame
    // type, without running a machine of its own.
    struct FakePeer {
        port: MemPort,
        me: Addr,
        them: Addr,
    }

    impl FakePeer {
        fn reply(&mut self, frame_type: FrameType) {
            let command = matches!(frame_type, FrameType::Iframe(_));
            self.reply_as(frame_type, command);
        }

        fn reply_as(&mut self, frame_type: FrameType, command: bool) {
            let f = Frame {
                src: self.me.clone(),
                dst: self.them.clone(),
                command,
                frame_type,
            };
            self.port.send(&f.serialize(false)).unwrap();
        }

        fn expect(&mut self) -> FrameType {
            let bytes = self
                .port
                .recv_timeout(Duration::from_secs(1))
                .unwrap()
                .expect("peer expected a frame");
            Frame::parse(&bytes, false).unwrap().frame_type
        }
    }

    fn pair() -> (Client, FakePeer) {
        let (a, b) = MemPort::pair();
        let me = addr("M0THC-1");
        let peer = addr("M0THC-2");
        (
            Client::new(me.clone(), fast_config(), Box::new(a)),
            FakePeer {
                port: b,
                me: peer,
                them: me,
            },
        )
    }

    #[test]
    fn connect_write_read() -> Result<()> {
        let (mut c, mut peer) = pair();
        // Answer the SABM from another thread so connect() can block.
        let t = std::thread::spawn(move || {
            assert!(matches!(peer.expect(), FrameType::Sabm(_)));
            peer.reply(FrameType::Ua(Ua { poll: true }));
            peer
        });
        c.connect(&addr("M0THC-2"))?;
        let mut peer = t.join().unwrap();

        c.write(&[1, 2, 3])?;
        match peer.expect() {
            FrameType::Iframe(i) => {
                assert_eq!(i.payload, vec![1, 2, 3]);
                assert_eq!(i.ns, 0);
            }
            other => panic!("expected I frame, got {other:?}"),
        }

        peer.reply(FrameType::Iframe(Iframe {
            nr: 1,
            ns: 0,
            poll: false,
            pid: PID_NO_L3,
            payload: vec![9, 8],
        }));
        let done = Arc::new(AtomicBool::new(false));
        assert_eq!(c.read_until(done)?, Some(vec![9, 8]));
        Ok(())
    }

    #[test]
    fn connect_times_out() {
        let (mut c, _peer) = pair();
        let err = c.connect(&addr("M0THC-2")).unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert!(c.eof());
        assert_eq!(c.close_reason(), Some(DisconnectReason::Timeout));
    }

    #[test]
    fn connect_refused() {
        let (mut c, mut peer) = pair();
        let t = std::thread::spawn(move || {
            peer.expect();
            peer.reply(FrameType::Dm(Dm { poll: true }));
        });
        assert!(c.connect(&addr("M0THC-2")).is_err());
        t.join().unwrap();
        assert_eq!(c.close_reason(), Some(DisconnectReason::Refused));
    }

    #[test]
    fn accept_timeout() -> Result<()> {
        let (mut c, _peer) = pair();
        assert!(!c.accept(Instant::now() + Duration::from_millis(5))?);
        Ok(())
    }

    #[test]
    fn accept_wrong_dst_ignored() -> Result<()> {
        let (mut c, mut peer) = pair();
        let f = Frame {
            src: addr("M0THC-2"),
            dst: addr("M0THC-9"),
            command: true,
            frame_type: FrameType::Sabm(Sabm { poll: true }),
        };
        peer.port.send(&f.serialize(false))?;
        assert!(!c.accept(Instant::now() + Duration::from_millis(10))?);
        Ok(())
    }

    #[test]
    fn accept_connects() -> Result<()> {
        let (mut c, mut peer) = pair();
        let f = Frame {
            src: peer.me.clone(),
            dst: peer.them.clone(),
            command: true,
            frame_type: FrameType::Sabm(Sabm { poll: true }),
        };
        peer.port.send(&f.serialize(false))?;
        assert!(c.accept(Instant::now() + Duration::from_millis(100))?);
        assert!(matches!(peer.expect(), FrameType::Ua(_)));
        Ok(())
    }

    #[test]
    fn remote_disconnect_gives_eof_after_drain() -> Result<()> {
        let (mut c, mut peer) = pair();
        let t = std::thread::spawn(move || {
            peer.expect();
            peer.reply(FrameType::Ua(Ua { poll: true }));
            peer
        });
        c.connect(&addr("M0THC-2"))?;
        let mut peer = t.join().unwrap();

        peer.reply(FrameType::Iframe(Iframe {
            nr: 0,
            ns: 0,
            poll: false,
            pid: PID_NO_L3,
            payload: vec![42],
        }));
        peer.reply(FrameType::Disc(crate::Disc { poll: true }));

        let done = Arc::new(AtomicBool::new(false));
        // Data delivered before the close is still readable, then EOF.
        assert_eq!(c.read_until(done.clone())?, Some(vec![42]));
        assert_eq!(c.read_until(done)?, None);
        assert!(c.eof());
        assert_eq!(c.close_reason(), Some(DisconnectReason::Closed));
        assert!(!c.data.draining());
        Ok(())
    }

    #[test]
    fn keepalive_probe_answered() -> Result<()> {
        let (mut c, mut peer) = pair();
        let t = std::thread::spawn(move || {
            peer.expect();
            peer.reply(FrameType::Ua(Ua { poll: true }));
            peer
        });
        c.connect(&addr("M0THC-2"))?;
        let mut peer = t.join().unwrap();

        // Peer polls; a read pass must answer with RR final.
        peer.reply_as(FrameType::Rr(Rr { nr: 0, poll: true }), true);
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            d.store(true, Ordering::SeqCst);
        });
        let _ = c.read_until(done)?;
        match peer.expect() {
            FrameType::Rr(rr) => assert!(rr.poll),
            other => panic!("expected RR, got {other:?}"),
        }
        Ok(())
    }
}
