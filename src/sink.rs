//! Subscriber seam.
//!
//! A sink is the per-subscriber output interface the broadcast task
//! feeds. Transports (WebSocket handlers, game-engine bridges) implement
//! [`FrameSink`]; the core only knows that a send may fail, in which case
//! the subscriber is dropped without affecting the others.

use async_trait::async_trait;
use std::io;
use tokio::sync::mpsc;

#[async_trait]
pub trait FrameSink: Send {
    /// Deliver one frame. The slice is a view into shared memory and is
    /// only valid for the duration of the call; copy if you must keep it.
    async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// The session is going away (close, failure); flush and say goodbye.
    async fn closed(&mut self) {}
}

/// Sink bridging frames into an in-process byte queue, one `Vec<u8>` per
/// frame. This is the shape a WebSocket collaborator wraps: the receiver
/// half lives in the connection task, and a dropped receiver unsubscribes
/// naturally through the send error.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        tx.send(frame.to_vec())
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn closed(&mut self) {
        // Dropping the sender closes the receiver cleanly.
        self.tx.take();
    }
}
