//! Balanced connected-mode data link layer.
//!
//! This crate implements a LAPB/AX.25-style link layer entity: a five-state
//! machine with windowed acknowledgement, four per-link timers, and
//! retry-budgeted recovery. The entity itself is in [`state`]; [`client`]
//! and [`r#async`] drive one link each over a [`FramePort`].
//!
//! The physical channel (KISS, serial, whatever) is not part of this crate.
//! Implement [`FramePort`] for it and hand it to a driver.
use anyhow::{Error, Result};

pub mod client;
pub mod mem;
pub mod state;

#[path = "async.rs"]
pub mod r#async;

pub use client::Client;

/// Source or destination address: an uppercase callsign with optional
/// `-<ssid>` suffix, plus the per-copy control bits carried in the address
/// field of every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    call: String,
    c_bit: bool,
    last: bool,
    res_ext: bool,
    res_dama: bool,
}

impl Addr {
    pub fn new(s: &str) -> Result<Self> {
        let s = s.to_uppercase();
        let re = regex::Regex::new(r"^[A-Z0-9]{3,6}(?:-(?:[0-9]|1[0-5]))?$")
            .expect("can't happen: Regex compile fail");
        if !re.is_match(&s) {
            return Err(Error::msg(format!("invalid callsign: {s}")));
        }
        Ok(Self {
            call: s,
            c_bit: false,
            last: false,
            res_ext: false,
            res_dama: false,
        })
    }

    pub fn new_bits(s: &str, last: bool, c_bit: bool, res_ext: bool, res_dama: bool) -> Result<Self> {
        let mut a = Self::new(s)?;
        a.last = last;
        a.c_bit = c_bit;
        a.res_ext = res_ext;
        a.res_dama = res_dama;
        Ok(a)
    }

    #[must_use]
    pub fn call(&self) -> &str {
        &self.call
    }

    /// Parse one 7-byte shifted address block.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 7 {
            return Err(Error::msg(format!("invalid serialized address: {bytes:?}")));
        }
        let call = {
            let base = bytes
                .iter()
                .take(6)
                .map(|&c| (c >> 1) as char)
                .collect::<String>()
                .trim_end()
                .to_string();
            let ssid = (bytes[6] >> 1) & 15;
            if ssid > 0 {
                base + "-" + &ssid.to_string()
            } else {
                base
            }
        };
        Self::new_bits(
            &call,
            bytes[6] & 1 != 0,
            bytes[6] & 0x80 != 0,
            bytes[6] & 0b0100_0000 == 0,
            bytes[6] & 0b0010_0000 == 0,
        )
    }

    #[must_use]
    pub fn serialize(&self, last: bool, c_bit: bool, res_ext: bool, res_dama: bool) -> Vec<u8> {
        let mut ret = vec![b' ' << 1; 7];
        for (i, ch) in self.call.chars().take(6).enumerate() {
            if ch == '-' {
                break;
            }
            ret[i] = (ch as u8) << 1;
        }
        let ssid = match self.call.split_once('-') {
            None => 0,
            Some((_, s)) => s.parse::<u8>().expect("can't happen: validated ssid"),
        };
        ret[6] = (ssid << 1)
            | (if res_ext { 0 } else { 0b0100_0000 })
            | (if res_dama { 0 } else { 0b0010_0000 })
            | (if last { 1 } else { 0 })
            | (if c_bit { 0x80 } else { 0 });
        ret
    }
}

// Unnumbered frames. Low two bits 11.
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_SABM: u8 = 0b001_0_11_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_SABME: u8 = 0b011_0_11_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_UI: u8 = 0b000_0_00_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_DISC: u8 = 0b010_0_00_11;
pub const CONTROL_DM: u8 = 0b0000_1111;
pub const CONTROL_UA: u8 = 0b0110_0011;
pub const CONTROL_TEST: u8 = 0b1110_0011;
pub const CONTROL_XID: u8 = 0b1010_1111;
pub const CONTROL_FRMR: u8 = 0b1000_0111;

// Supervisory frames. Low two bits 01.
pub const CONTROL_RR: u8 = 0b0000_0001;
pub const CONTROL_RNR: u8 = 0b0000_0101;
pub const CONTROL_REJ: u8 = 0b0000_1001;

// Masks, basic (mod-8) control byte.
pub const CONTROL_POLL: u8 = 0b0001_0000;
pub const NR_MASK: u8 = 0b1110_0000;
pub const NS_MASK: u8 = 0b0000_1110;
pub const TYPE_MASK: u8 = 0b0000_0011;

/// PID for "no layer 3".
pub const PID_NO_L3: u8 = 0xF0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sabm {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sabme {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ua {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dm {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disc {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rr {
    pub poll: bool,
    pub nr: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rnr {
    pub poll: bool,
    pub nr: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rej {
    pub poll: bool,
    pub nr: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Iframe {
    pub nr: u8,
    pub ns: u8,
    pub poll: bool,
    pub pid: u8,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ui {
    pub push: bool,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frmr {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Test {
    pub poll: bool,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Xid {
    pub poll: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameType {
    Sabm(Sabm),
    Sabme(Sabme),
    Ua(Ua),
    Dm(Dm),
    Disc(Disc),
    Rr(Rr),
    Rnr(Rnr),
    Rej(Rej),
    Iframe(Iframe),
    Ui(Ui),
    Frmr(Frmr),
    Test(Test),
    Xid(Xid),
}

/// One link-layer frame, addresses plus control.
///
/// `command` is the C-bit pair collapsed to one flag: commands carry C=1 in
/// the destination copy, responses C=1 in the source copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src: Addr,
    pub dst: Addr,
    pub command: bool,
    pub frame_type: FrameType,
}

impl Frame {
    /// Serialize to wire bytes. `ext` selects two-byte (mod-128) control
    /// fields for I and S frames; U frames are one byte either way.
    #[must_use]
    pub fn serialize(&self, ext: bool) -> Vec<u8> {
        let mut ret = Vec::with_capacity(
            14 + 2
                + if let FrameType::Iframe(i) = &self.frame_type {
                    i.payload.len() + 1
                } else {
                    0
                },
        );
        ret.extend(self.dst.serialize(false, self.command, false, false));
        ret.extend(self.src.serialize(true, !self.command, ext, false));
        let pf = |b: bool| if b { CONTROL_POLL } else { 0 };
        let pf_ext = u8::from;
        match &self.frame_type {
            FrameType::Sabm(s) => ret.push(CONTROL_SABM | pf(s.poll)),
            FrameType::Sabme(s) => ret.push(CONTROL_SABME | pf(s.poll)),
            FrameType::Ua(s) => ret.push(CONTROL_UA | pf(s.poll)),
            FrameType::Dm(s) => ret.push(CONTROL_DM | pf(s.poll)),
            FrameType::Disc(s) => ret.push(CONTROL_DISC | pf(s.poll)),
            FrameType::Frmr(s) => ret.push(CONTROL_FRMR | pf(s.poll)),
            FrameType::Xid(s) => ret.push(CONTROL_XID | pf(s.poll)),
            FrameType::Ui(s) => {
                ret.push(CONTROL_UI | pf(s.push));
                ret.push(PID_NO_L3);
                ret.extend(&s.payload);
            }
            FrameType::Test(s) => {
                ret.push(CONTROL_TEST | pf(s.poll));
                ret.extend(&s.payload);
            }
            FrameType::Rr(s) => {
                if ext {
                    ret.push(CONTROL_RR);
                    ret.push((s.nr << 1) | pf_ext(s.poll));
                } else {
                    ret.push(CONTROL_RR | pf(s.poll) | ((s.nr << 5) & NR_MASK));
                }
            }
            FrameType::Rnr(s) => {
                if ext {
                    ret.push(CONTROL_RNR);
                    ret.push((s.nr << 1) | pf_ext(s.poll));
                } else {
                    ret.push(CONTROL_RNR | pf(s.poll) | ((s.nr << 5) & NR_MASK));
                }
            }
            FrameType::Rej(s) => {
                if ext {
                    ret.push(CONTROL_REJ);
                    ret.push((s.nr << 1) | pf_ext(s.poll));
                } else {
                    ret.push(CONTROL_REJ | pf(s.poll) | ((s.nr << 5) & NR_MASK));
                }
            }
            FrameType::Iframe(i) => {
                if ext {
                    ret.push(i.ns << 1);
                    ret.push((i.nr << 1) | pf_ext(i.poll));
                } else {
                    ret.push(pf(i.poll) | ((i.nr << 5) & NR_MASK) | ((i.ns << 1) & NS_MASK));
                }
                ret.push(i.pid);
                ret.extend(&i.payload);
            }
        }
        ret
    }

    /// Parse wire bytes. `ext` must match the negotiated modulus; basic and
    /// extended I/S control fields are not self-describing.
    pub fn parse(bytes: &[u8], ext: bool) -> Result<Self> {
        if bytes.len() < 15 {
            return Err(Error::msg(format!("frame too short: {} bytes", bytes.len())));
        }
        let dst = Addr::parse(&bytes[0..7])?;
        let src = Addr::parse(&bytes[7..14])?;
        let control = bytes[14];
        let command = dst.c_bit;
        let frame_type = match control & TYPE_MASK {
            0 | 2 if !ext => {
                let nr = (control >> 5) & 7;
                let ns = (control >> 1) & 7;
                let poll = control & CONTROL_POLL != 0;
                if bytes.len() < 16 {
                    return Err(Error::msg("I frame missing PID"));
                }
                FrameType::Iframe(Iframe {
                    nr,
                    ns,
                    poll,
                    pid: bytes[15],
                    payload: bytes[16..].to_vec(),
                })
            }
            0 | 2 => {
                // Extended I frame, two control bytes.
                if bytes.len() < 17 {
                    return Err(Error::msg("extended I frame too short"));
                }
                let ns = (control >> 1) & 0x7F;
                let nr = (bytes[15] >> 1) & 0x7F;
                let poll = bytes[15] & 1 != 0;
                FrameType::Iframe(Iframe {
                    nr,
                    ns,
                    poll,
                    pid: bytes[16],
                    payload: bytes[17..].to_vec(),
                })
            }
            1 => {
                let (nr, poll) = if ext {
                    if bytes.len() < 16 {
                        return Err(Error::msg("extended S frame too short"));
                    }
                    ((bytes[15] >> 1) & 0x7F, bytes[15] & 1 != 0)
                } else {
                    ((control >> 5) & 7, control & CONTROL_POLL != 0)
                };
                let s = if ext {
                    control
                } else {
                    control & !NR_MASK & !CONTROL_POLL
                };
                match s {
                    CONTROL_RR => FrameType::Rr(Rr { nr, poll }),
                    CONTROL_RNR => FrameType::Rnr(Rnr { nr, poll }),
                    CONTROL_REJ => FrameType::Rej(Rej { nr, poll }),
                    other => return Err(Error::msg(format!("unknown S frame {other:#b}"))),
                }
            }
            _ => {
                let poll = control & CONTROL_POLL != 0;
                match control & !CONTROL_POLL {
                    CONTROL_SABME => FrameType::Sabme(Sabme { poll }),
                    CONTROL_SABM => FrameType::Sabm(Sabm { poll }),
                    CONTROL_UA => FrameType::Ua(Ua { poll }),
                    CONTROL_DISC => FrameType::Disc(Disc { poll }),
                    CONTROL_DM => FrameType::Dm(Dm { poll }),
                    CONTROL_FRMR => FrameType::Frmr(Frmr { poll }),
                    CONTROL_XID => FrameType::Xid(Xid { poll }),
                    CONTROL_UI => FrameType::Ui(Ui {
                        push: poll,
                        payload: bytes.get(16..).unwrap_or(&[]).to_vec(),
                    }),
                    CONTROL_TEST => FrameType::Test(Test {
                        poll,
                        payload: bytes[15..].to_vec(),
                    }),
                    other => return Err(Error::msg(format!("unknown U frame {other:#b}"))),
                }
            }
        };
        Ok(Frame {
            src,
            dst,
            command,
            frame_type,
        })
    }
}

/// The channel the link runs over. KISS TNC, serial port, TCP tunnel; all
/// out of scope here, all behind this trait.
///
/// `send` is fire and forget; the entity never waits on it and never holds
/// any lock across it.
pub trait FramePort {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
    fn recv_timeout(&mut self, timeout: std::time::Duration) -> Result<Option<Vec<u8>>>;
}

/// Per-link tunables, read-only to the state machine.
///
/// `srt` seeds the round-trip estimate; the first T1 is `2 * srt` and later
/// ones are recomputed with backoff after every expiry.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Retry budget N2.
    pub retry_limit: u8,
    /// Initial smoothed round trip estimate.
    pub srt: std::time::Duration,
    /// Acknowledgement delay T2.
    pub t2: std::time::Duration,
    /// Idle keepalive T3.
    pub t3: std::time::Duration,
    /// Inactivity disconnect.
    pub idle: std::time::Duration,
    /// Max outstanding I frames; `None` derives from the modulus.
    pub window: Option<u8>,
    /// Start with extended (mod-128) addressing.
    pub extended: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retry_limit: 10,
            srt: std::time::Duration::from_millis(3000),
            t2: std::time::Duration::from_millis(3000),
            t3: std::time::Duration::from_secs(300),
            idle: std::time::Duration::from_secs(20 * 60),
            window: None,
            extended: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_serial() -> Result<()> {
        let a = Addr::new("M0THC")?.serialize(true, false, false, false);
        assert_eq!(a, vec![154, 96, 168, 144, 134, 64, 97]);
        assert_eq!(Addr::parse(&a)?.call(), "M0THC");

        let a = Addr::new("M0THC-0")?.serialize(true, false, false, false);
        assert_eq!(a, vec![154, 96, 168, 144, 134, 64, 97]);
        assert_eq!(Addr::parse(&a)?.call(), "M0THC");

        let a = Addr::new("M0THC-1")?.serialize(true, false, false, false);
        assert_eq!(a, vec![154, 96, 168, 144, 134, 64, 99]);
        assert_eq!(Addr::parse(&a)?.call(), "M0THC-1");

        let a = Addr::new("M0THC-2")?.serialize(false, true, false, false);
        assert_eq!(a, vec![154, 96, 168, 144, 134, 64, 100 + 0x80]);
        assert_eq!(Addr::parse(&a)?.call(), "M0THC-2");

        let a = Addr::new("M0THC-3")?.serialize(false, false, true, false);
        assert_eq!(a, vec![154, 96, 168, 144, 134, 64, 38]);
        assert_eq!(Addr::parse(&a)?.call(), "M0THC-3");
        Ok(())
    }

    #[test]
    fn addr_invalid() {
        assert!(Addr::new("M").is_err());
        assert!(Addr::new("TOOLONGCALL").is_err());
        assert!(Addr::new("M0THC-16").is_err());
        assert!(Addr::new("M0 THC").is_err());
    }

    #[test]
    fn serialize_sabm() -> Result<()> {
        let src = Addr::new("M0THC-1")?;
        let dst = Addr::new("M0THC-2")?;
        assert_eq!(
            Frame {
                src: src.clone(),
                dst: dst.clone(),
                command: true,
                frame_type: FrameType::Sabm(Sabm { poll: true }),
            }
            .serialize(false),
            vec![154, 96, 168, 144, 134, 64, 228, 154, 96, 168, 144, 134, 64, 99, 63],
        );
        assert_eq!(
            Frame {
                src,
                dst,
                command: true,
                frame_type: FrameType::Sabm(Sabm { poll: false }),
            }
            .serialize(false),
            vec![154, 96, 168, 144, 134, 64, 228, 154, 96, 168, 144, 134, 64, 99, 47],
        );
        Ok(())
    }

    #[test]
    fn roundtrip_basic_iframe() -> Result<()> {
        let f = Frame {
            src: Addr::new("M0THC-1")?,
            dst: Addr::new("M0THC-2")?,
            command: true,
            frame_type: FrameType::Iframe(Iframe {
                nr: 3,
                ns: 5,
                poll: false,
                pid: PID_NO_L3,
                payload: vec![1, 2, 3],
            }),
        };
        let parsed = Frame::parse(&f.serialize(false), false)?;
        assert_eq!(parsed.frame_type, f.frame_type);
        assert!(parsed.command);
        Ok(())
    }

    #[test]
    fn roundtrip_extended_controls() -> Result<()> {
        let src = Addr::new("M0THC-1")?;
        let dst = Addr::new("M0THC-2")?;
        let f = Frame {
            src: src.clone(),
            dst: dst.clone(),
            command: true,
            frame_type: FrameType::Iframe(Iframe {
                nr: 100,
                ns: 127,
                poll: true,
                pid: PID_NO_L3,
                payload: vec![9],
            }),
        };
        assert_eq!(Frame::parse(&f.serialize(true), true)?.frame_type, f.frame_type);

        let f = Frame {
            src,
            dst,
            command: false,
            frame_type: FrameType::Rr(Rr { nr: 127, poll: true }),
        };
        let parsed = Frame::parse(&f.serialize(true), true)?;
        assert_eq!(parsed.frame_type, f.frame_type);
        assert!(!parsed.command);
        Ok(())
    }

    #[test]
    fn parse_too_short() {
        assert!(Frame::parse(&[0; 14], false).is_err());
    }
}
