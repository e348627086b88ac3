//! In-memory frame channel.
//!
//! Two [`MemPort`]s cross-wired over std mpsc channels. One per link end;
//! whatever one end sends, the other receives. Used by the demos and the
//! driver tests; real deployments implement [`FramePort`] for their TNC or
//! tunnel instead.
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use anyhow::{Error, Result};

use crate::FramePort;

pub struct MemPort {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl MemPort {
    /// A connected pair of ports, one for each end of the link.
    #[must_use]
    pub fn pair() -> (MemPort, MemPort) {
        let (atx, arx) = channel();
        let (btx, brx) = channel();
        (MemPort { tx: atx, rx: brx }, MemPort { tx: btx, rx: arx })
    }
}

impl FramePort for MemPort {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| Error::msg("peer end closed"))
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::msg("peer end closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_crosses_over() -> Result<()> {
        let (mut a, mut b) = MemPort::pair();
        a.send(&[1, 2, 3])?;
        assert_eq!(
            b.recv_timeout(Duration::from_millis(10))?,
            Some(vec![1, 2, 3])
        );
        assert_eq!(a.recv_timeout(Duration::from_millis(1))?, None);
        Ok(())
    }

    #[test]
    fn closed_peer_errors() {
        let (mut a, b) = MemPort::pair();
        drop(b);
        assert!(a.send(&[0]).is_err());
    }
}
