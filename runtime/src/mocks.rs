//! In-process message pipes for exercising request/reply paths without a
//! network.
//!
//! [`duplex`] returns two connected halves, each a ([`Sink`], [`Stream`])
//! pair: messages sent on one half's sink arrive on the other half's
//! stream, in order. Dropping a sink closes the direction; the peer's
//! stream drains any buffered messages and then reports [`Error::Closed`].

use crate::Error;
use bytes::Bytes;
use std::sync::mpsc;

/// Sending half of one pipe direction.
pub struct Sink {
    sender: mpsc::Sender<Bytes>,
}

impl Sink {
    /// Send a message. Fails if the peer's stream is gone.
    pub fn send(&mut self, msg: Bytes) -> Result<(), Error> {
        self.sender.send(msg).map_err(|_| Error::Closed)
    }
}

/// Receiving half of one pipe direction.
pub struct Stream {
    receiver: mpsc::Receiver<Bytes>,
}

impl Stream {
    /// Receive the next message, blocking until one arrives. Fails once the
    /// peer's sink is gone and the buffer is drained.
    pub fn recv(&mut self) -> Result<Bytes, Error> {
        self.receiver.recv().map_err(|_| Error::Closed)
    }
}

/// Create a connected pair of duplex endpoints.
pub fn duplex() -> ((Sink, Stream), (Sink, Stream)) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        (Sink { sender: a_tx }, Stream { receiver: a_rx }),
        (Sink { sender: b_tx }, Stream { receiver: b_rx }),
    )
}
