//! Session control plane.
//!
//! A session owns one engine process, the shared-memory ring the engine
//! writes into, the command channel towards the engine and the broadcast
//! fan-out towards subscribers. Everything here runs on the cooperative
//! scheduler; the engine is the only CPU-bound party.

mod broadcast;
mod manager;

pub use self::manager::SessionManager;

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::ipc;
use crate::protocol::{Command, CommandFrame, Reply};
use crate::shm::{self, ShmRing};
use crate::sink::FrameSink;
use crate::skeleton::SkeletonDescriptor;
use self::broadcast::SubscriberOp;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Session lifecycle. `Failed` is reachable from every state before
/// `Closing`; `close()` is the only way into `Closing`/`Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Initializing,
    Ready,
    Streaming,
    Closing,
    Closed,
    Failed,
}

pub(crate) type SharedState = Arc<StdMutex<Lifecycle>>;

/// Handshake data cached for `describe()`; immutable once published.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub skeleton: SkeletonDescriptor,
    pub frame_bytes: u32,
}

/// Handle returned by `subscribe`, used for idempotent removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Session ids become shared-memory name suffixes, so the alphabet is
/// restricted to alphanumerics, hyphen and underscore.
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    if id.is_empty() || id.len() > 64 {
        return Err(SessionError::InvalidInput(format!(
            "session id must be 1..=64 characters, got {}",
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SessionError::InvalidInput(format!(
            "session id {id:?} contains characters outside [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

/// Serialized writer over the engine's stdin. Guarded by an async mutex
/// on the session; commands are fire-and-forget from the caller's view.
#[derive(Debug)]
struct CommandWriter {
    stdin: ChildStdin,
}

impl CommandWriter {
    async fn send(&mut self, command: Command, reply_required: bool) -> std::io::Result<()> {
        let frame = CommandFrame {
            command,
            reply_required,
        };
        let payload = serde_json::to_vec(&frame).expect("command serialization is infallible");
        ipc::write_frame(&mut self.stdin, ipc::CHAN_CONTROL, &payload).await
    }
}

/// Process handle and task handles consumed exactly once by teardown.
#[derive(Debug)]
struct Teardown {
    child: Option<Child>,
    demux: Option<JoinHandle<()>>,
    broadcast: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    info: SessionInfo,
    ring: Arc<ShmRing>,
    state: SharedState,
    writer: Mutex<CommandWriter>,
    ops_tx: mpsc::UnboundedSender<SubscriberOp>,
    teardown: Mutex<Teardown>,
    engine_pid: Option<u32>,
    next_subscriber: AtomicU64,
    shutdown_timeout: Duration,
}

impl Session {
    /// Spawn an engine for `(kind, source)`, run the init handshake and
    /// bring the session to `Ready`. On any failure the engine is reaped
    /// and no shared memory is left behind.
    pub async fn create(
        cfg: &ServerConfig,
        id: &str,
        kind: &str,
        source: &str,
    ) -> Result<Self, SessionError> {
        validate_session_id(id)?;
        if crate::animator::build(kind).is_none() {
            return Err(SessionError::InvalidInput(format!(
                "unknown animator kind {kind:?} (known: {})",
                crate::animator::known_kinds().join(", ")
            )));
        }

        let mut child = spawn_engine(cfg, id, kind, source)?;
        let stdin = child.stdin.take().expect("engine stdin is piped");
        let stdout = child.stdout.take().expect("engine stdout is piped");
        let mut stdout = BufReader::new(stdout);
        let engine_pid = child.id();

        let info = match timeout(cfg.init_timeout(), read_init_reply(&mut stdout)).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                reap(&mut child, cfg.shutdown_timeout()).await;
                return Err(e);
            }
            Err(_) => {
                reap(&mut child, Duration::ZERO).await;
                return Err(SessionError::InitTimeout);
            }
        };

        let ring = match create_ring(cfg, id, info.frame_bytes as usize) {
            Ok(ring) => Arc::new(ring),
            Err(e) => {
                reap(&mut child, Duration::ZERO).await;
                return Err(e.into());
            }
        };

        let mut writer = CommandWriter { stdin };
        if let Err(e) = writer
            .send(
                Command::SetShm {
                    name: ring.name().to_string(),
                },
                false,
            )
            .await
        {
            ring.unlink();
            reap(&mut child, Duration::ZERO).await;
            return Err(e.into());
        }

        let state: SharedState = Arc::new(StdMutex::new(Lifecycle::Initializing));
        let (slot_tx, slot_rx) = mpsc::channel(cfg.slots());
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();

        let demux = tokio::spawn(broadcast::demux_loop(
            id.to_string(),
            stdout,
            slot_tx,
            state.clone(),
            ring.clone(),
        ));
        let bcast = tokio::spawn(broadcast::broadcast_loop(
            id.to_string(),
            ring.clone(),
            slot_rx,
            ops_rx,
        ));

        *state.lock().unwrap() = Lifecycle::Ready;
        tracing::info!(
            "[Session:{}] ready: {} bones, {} bytes/frame, shm {}",
            id,
            info.skeleton.num_bones(),
            info.frame_bytes,
            ring.name()
        );

        Ok(Self {
            id: id.to_string(),
            info,
            ring,
            state,
            writer: Mutex::new(writer),
            ops_tx,
            teardown: Mutex::new(Teardown {
                child: Some(child),
                demux: Some(demux),
                broadcast: Some(bcast),
            }),
            engine_pid,
            next_subscriber: AtomicU64::new(1),
            shutdown_timeout: cfg.shutdown_timeout(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.lock().unwrap()
    }

    /// Cached handshake data; never changes after `Ready`.
    pub fn describe(&self) -> &SessionInfo {
        &self.info
    }

    /// OS pid of the engine process, while it was alive at spawn time.
    pub fn engine_pid(&self) -> Option<u32> {
        self.engine_pid
    }

    /// Add a subscriber. The first one moves the session to `Streaming`;
    /// frames start arriving within one production tick.
    pub fn subscribe(&self, sink: Box<dyn FrameSink>) -> Result<SubscriberId, SessionError> {
        self.check_live()?;
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.ops_tx
            .send(SubscriberOp::Add(id.0, sink))
            .map_err(|_| SessionError::EngineLost)?;
        let mut st = self.state.lock().unwrap();
        if *st == Lifecycle::Ready {
            *st = Lifecycle::Streaming;
        }
        Ok(id)
    }

    /// Idempotent removal; unknown handles are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.ops_tx.send(SubscriberOp::Remove(id.0));
    }

    pub async fn set_speed(&self, value: f32) -> Result<(), SessionError> {
        self.send_command(Command::SetSpeed { value }).await
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.send_command(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.send_command(Command::Resume).await
    }

    pub async fn seek(&self, time: f32) -> Result<(), SessionError> {
        self.send_command(Command::Seek { time }).await
    }

    /// Stop the engine, the background tasks and the subscribers, and
    /// remove the shared-memory name. Safe to call any number of times.
    pub async fn close(&self) -> Result<(), SessionError> {
        {
            let mut st = self.state.lock().unwrap();
            match *st {
                Lifecycle::Closing | Lifecycle::Closed => return Ok(()),
                _ => *st = Lifecycle::Closing,
            }
        }
        tracing::info!("[Session:{}] closing", self.id);

        // Best effort: the engine may already be gone.
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Command::Shutdown, false).await;
        }

        let mut t = self.teardown.lock().await;
        if let Some(mut child) = t.child.take() {
            reap(&mut child, self.shutdown_timeout).await;
        }
        if let Some(handle) = t.demux.take() {
            handle.abort();
        }
        if let Some(mut handle) = t.broadcast.take() {
            let _ = self.ops_tx.send(SubscriberOp::Shutdown);
            if timeout(Duration::from_millis(500), &mut handle).await.is_err() {
                tracing::warn!("[Session:{}] broadcast did not stop in time", self.id);
                handle.abort();
            }
        }

        self.ring.unlink();
        *self.state.lock().unwrap() = Lifecycle::Closed;
        tracing::info!("[Session:{}] closed", self.id);
        Ok(())
    }

    async fn send_command(&self, command: Command) -> Result<(), SessionError> {
        self.check_live()?;
        let mut writer = self.writer.lock().await;
        writer
            .send(command, false)
            .await
            .map_err(|_| SessionError::EngineLost)
    }

    fn check_live(&self) -> Result<(), SessionError> {
        match self.state() {
            Lifecycle::Ready | Lifecycle::Streaming => Ok(()),
            Lifecycle::Failed => Err(SessionError::EngineLost),
            _ => Err(SessionError::ClosedSession),
        }
    }
}

fn spawn_engine(
    cfg: &ServerConfig,
    id: &str,
    kind: &str,
    source: &str,
) -> Result<Child, SessionError> {
    let binary = cfg.engine_binary();
    let mut command = tokio::process::Command::new(&binary);
    command
        .arg("--session-id")
        .arg(id)
        .arg("--kind")
        .arg(kind)
        .arg("--source")
        .arg(source)
        .arg("--fps")
        .arg(cfg.target_fps().to_string())
        .arg("--slots")
        .arg(cfg.slots().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    command.spawn().map_err(|e| {
        SessionError::Io(std::io::Error::new(
            e.kind(),
            format!("cannot spawn engine {}: {e}", binary.display()),
        ))
    })
}

/// Read control frames until the init reply arrives.
async fn read_init_reply(
    stdout: &mut BufReader<ChildStdout>,
) -> Result<SessionInfo, SessionError> {
    loop {
        let (chan, payload) = ipc::read_frame(stdout).await.map_err(|_| {
            SessionError::InitFailure("engine exited before completing the handshake".into())
        })?;
        if chan != ipc::CHAN_CONTROL {
            continue;
        }
        let reply: Reply = serde_json::from_slice(&payload).map_err(|e| {
            SessionError::InitFailure(format!("malformed handshake reply: {e}"))
        })?;
        return match reply {
            Reply::InitSuccess {
                skeleton,
                frame_bytes,
            } => {
                if frame_bytes == 0 {
                    return Err(SessionError::InitFailure(
                        "engine advertised a zero frame size".into(),
                    ));
                }
                Ok(SessionInfo {
                    skeleton,
                    frame_bytes,
                })
            }
            Reply::InitFailure { reason } => Err(SessionError::InitFailure(reason)),
            Reply::Ack { command_kind } => Err(SessionError::InitFailure(format!(
                "unexpected ack for {command_kind} during handshake"
            ))),
        };
    }
}

fn create_ring(cfg: &ServerConfig, id: &str, frame_bytes: usize) -> std::io::Result<ShmRing> {
    let name = shm::region_name(cfg.shm_prefix(), id);
    match ShmRing::create(&name, cfg.slots(), frame_bytes) {
        Ok(ring) => Ok(ring),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // Stale region from a crashed predecessor; ids are unique per
            // live server, so reclaiming is safe.
            tracing::warn!("[Session:{}] reclaiming stale shm {}", id, name);
            let _ = nix::sys::mman::shm_unlink(name.as_str());
            ShmRing::create(&name, cfg.slots(), frame_bytes)
        }
        Err(e) => Err(e),
    }
}

/// Wait for the child within the grace period, then force-terminate.
async fn reap(child: &mut Child, grace: Duration) {
    if grace.is_zero() {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return;
    }
    match timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!("engine did not exit within {:?}, killing", grace);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}
