//! Per-session background tasks: the stdout demux and the broadcast
//! fan-out. Both are cooperative loops owned by the session and stopped
//! on `close()` or when the engine is lost.

use crate::ipc;
use crate::protocol::{Reply, decode_slot_index};
use crate::session::{Lifecycle, SharedState};
use crate::shm::ShmRing;
use crate::sink::FrameSink;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::process::ChildStdout;
use tokio::sync::mpsc;

/// Subscriber-set mutations; the broadcast task owns the set, so all
/// mutation arrives as messages from the session.
pub(crate) enum SubscriberOp {
    Add(u64, Box<dyn FrameSink>),
    Remove(u64),
    Shutdown,
}

/// Single reader of the engine's stdout: slot indices go to the bounded
/// frame queue, control replies are drained, EOF means the engine is
/// gone.
///
/// When the frame queue is full the incoming index is dropped: the
/// stream is live and the queue already holds newer indices than the
/// broadcast side has consumed.
pub(crate) async fn demux_loop(
    session_id: String,
    mut reader: BufReader<ChildStdout>,
    slot_tx: mpsc::Sender<u32>,
    state: SharedState,
    ring: Arc<ShmRing>,
) {
    loop {
        match ipc::read_frame(&mut reader).await {
            Ok((ipc::CHAN_FRAMES, payload)) => {
                let Some(slot) = decode_slot_index(&payload) else {
                    tracing::warn!("[Session:{}] malformed slot index", session_id);
                    continue;
                };
                if (slot as usize) >= ring.slots() {
                    tracing::warn!("[Session:{}] slot {} out of range", session_id, slot);
                    continue;
                }
                match slot_tx.try_send(slot) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::trace!("[Session:{}] broadcast lagging, frame skipped", session_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Ok((ipc::CHAN_CONTROL, payload)) => match serde_json::from_slice::<Reply>(&payload) {
                Ok(Reply::Ack { command_kind }) => {
                    tracing::debug!("[Session:{}] engine acked {}", session_id, command_kind);
                }
                Ok(other) => {
                    tracing::warn!("[Session:{}] unexpected reply {:?}", session_id, other);
                }
                Err(e) => {
                    tracing::warn!("[Session:{}] malformed reply: {}", session_id, e);
                }
            },
            Ok((chan, _)) => {
                tracing::warn!("[Session:{}] unknown channel {}", session_id, chan);
            }
            Err(_) => break,
        }
    }

    // EOF outside of a deliberate close means the engine died under us.
    let lost = {
        let mut st = state.lock().unwrap();
        match *st {
            Lifecycle::Closing | Lifecycle::Closed => false,
            _ => {
                *st = Lifecycle::Failed;
                true
            }
        }
    };
    if lost {
        tracing::warn!("[Session:{}] engine lost, session failed", session_id);
        ring.unlink();
    }
    // Dropping slot_tx lets the broadcast loop finish and close the sinks.
}

/// Fan-out loop: wait for the next published slot, form a zero-copy view
/// of it and hand the bytes to every sink. Failing sinks are removed
/// without affecting the others; with no subscribers the queue is still
/// drained so the producer side never backs up.
pub(crate) async fn broadcast_loop(
    session_id: String,
    ring: Arc<ShmRing>,
    mut slot_rx: mpsc::Receiver<u32>,
    mut ops_rx: mpsc::UnboundedReceiver<SubscriberOp>,
) {
    let mut sinks: Vec<(u64, Box<dyn FrameSink>)> = Vec::new();

    loop {
        tokio::select! {
            // Subscriber changes apply before the next delivery.
            biased;
            op = ops_rx.recv() => match op {
                Some(SubscriberOp::Add(id, sink)) => sinks.push((id, sink)),
                Some(SubscriberOp::Remove(id)) => sinks.retain(|(sid, _)| *sid != id),
                Some(SubscriberOp::Shutdown) | None => break,
            },
            slot = slot_rx.recv() => match slot {
                Some(slot) => {
                    if sinks.is_empty() {
                        continue;
                    }
                    let frame = ring.slot(slot as usize);
                    deliver(&session_id, frame, &mut sinks).await;
                }
                None => break,
            },
        }
    }

    for (_, mut sink) in sinks.drain(..) {
        sink.closed().await;
    }
    tracing::debug!("[Session:{}] broadcast stopped", session_id);
}

async fn deliver(session_id: &str, frame: &[u8], sinks: &mut Vec<(u64, Box<dyn FrameSink>)>) {
    let mut i = 0;
    while i < sinks.len() {
        match sinks[i].1.send_frame(frame).await {
            Ok(()) => i += 1,
            Err(e) => {
                let (id, _) = sinks.swap_remove(i);
                tracing::debug!("[Session:{}] dropping subscriber {}: {}", session_id, id, e);
            }
        }
    }
}
