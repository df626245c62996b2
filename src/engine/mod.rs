//! Engine process: one per session, CPU-bound, single hot loop.
//!
//! The engine talks to its parent over stdio: framed control messages on
//! stdin, framed replies and slot indices on stdout. Each loop iteration
//! drains pending commands, writes the next pose into the cursor slot of
//! shared memory and publishes the slot index; a stdin pump thread is the
//! only other thread and exists solely to turn the blocking pipe read
//! into a non-blocking queue for the loop.

use crate::animator::{self, Animator};
use crate::io::{self, RingReceiver, RingSender};
use crate::ipc::{self, FrameReader, FrameWriter};
use crate::protocol::{Command, CommandFrame, Reply, encode_slot_index};
use crate::shm::ShmRing;
use std::io::{StdoutLock, Write};
use std::thread;
use std::time::{Duration, Instant};

/// Clean shutdown, acknowledged or parent-requested.
pub const EXIT_OK: i32 = 0;
/// Animator initialization failed.
pub const EXIT_INIT_FAILURE: i32 = 1;
/// Unexpected error (protocol violation, handshake timeout, shm attach).
pub const EXIT_UNEXPECTED: i32 = 2;
/// Parent channel lost before shutdown was requested.
pub const EXIT_PARENT_LOST: i32 = 3;

/// Deadline for the parent to send `set_shm` after `init_success`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pending commands applied per iteration before producing a frame.
const MAX_COMMANDS_DRAIN: usize = 64;
/// Command queue depth between the pump thread and the loop.
const COMMAND_QUEUE_CAP: usize = 256;
/// Wall-clock dt is clamped to this many target periods after a stall.
const MAX_DT_PERIODS: f32 = 4.0;

#[derive(Debug, Clone)]
pub struct EngineOpts {
    pub session_id: String,
    pub kind: String,
    pub source: String,
    pub target_fps: f64,
    pub slots: usize,
}

/// Inputs reaching the hot loop from the pump thread.
enum EngineInput {
    Command(CommandFrame),
    ParentLost,
}

/// Mutable playback state owned by the loop.
struct Playback {
    speed: f32,
    paused: bool,
    pending_seek: Option<f32>,
    shutdown: bool,
}

impl Playback {
    fn new() -> Self {
        Self {
            speed: 1.0,
            paused: false,
            pending_seek: None,
            shutdown: false,
        }
    }
}

/// Run the engine to completion; the returned value is the process exit
/// code (see the `EXIT_*` constants).
pub fn run(opts: &EngineOpts) -> i32 {
    let stdout = std::io::stdout();
    let mut writer = FrameWriter::new(stdout.lock());

    let mut animator = match animator::build(&opts.kind) {
        Some(a) => a,
        None => {
            send_init_failure(&mut writer, format!("unknown animator kind {:?}", opts.kind));
            return EXIT_INIT_FAILURE;
        }
    };

    tracing::info!(
        "[Engine:{}] initializing {} animator from {:?}",
        opts.session_id,
        opts.kind,
        opts.source
    );
    if let Err(e) = animator.initialize(&opts.source) {
        send_init_failure(&mut writer, format!("{e:#}"));
        return EXIT_INIT_FAILURE;
    }

    let skeleton = animator.skeleton();
    let frame_bytes = animator.frame_bytes();
    if frame_bytes == 0 {
        send_init_failure(&mut writer, "animator advertised a zero frame size".into());
        return EXIT_INIT_FAILURE;
    }

    let reply = Reply::InitSuccess {
        skeleton,
        frame_bytes: frame_bytes as u32,
    };
    if send_reply(&mut writer, &reply).is_err() {
        return EXIT_PARENT_LOST;
    }

    let (tx, mut rx) = io::bounded(COMMAND_QUEUE_CAP);
    spawn_stdin_pump(tx);

    let mut playback = Playback::new();

    // The parent allocates shared memory sized from our frame_bytes and
    // binds us to it; nothing to produce until then.
    let shm_name = match await_shm_binding(&mut rx, &mut writer, &mut playback) {
        Ok(Some(name)) => name,
        Ok(None) => return if playback.shutdown { EXIT_OK } else { EXIT_PARENT_LOST },
        Err(code) => return code,
    };

    let mut ring = match ShmRing::attach(&shm_name, opts.slots, frame_bytes) {
        Ok(ring) => ring,
        Err(e) => {
            tracing::error!("[Engine:{}] shm attach failed: {}", opts.session_id, e);
            return EXIT_UNEXPECTED;
        }
    };
    tracing::info!(
        "[Engine:{}] attached to {} ({} slots x {} bytes)",
        opts.session_id,
        shm_name,
        opts.slots,
        frame_bytes
    );

    run_loop(opts, &mut *animator, &mut ring, &mut rx, &mut writer, &mut playback)
}

fn run_loop(
    opts: &EngineOpts,
    animator: &mut dyn Animator,
    ring: &mut ShmRing,
    rx: &mut RingReceiver<EngineInput>,
    writer: &mut FrameWriter<StdoutLock<'static>>,
    playback: &mut Playback,
) -> i32 {
    let target_dt = Duration::from_secs_f64(1.0 / opts.target_fps);
    let max_dt = MAX_DT_PERIODS * target_dt.as_secs_f32();
    let mut cursor: usize = 0;
    let mut last = Instant::now();

    loop {
        let iter_start = Instant::now();

        match drain_commands(rx, writer, playback) {
            Ok(()) => {}
            Err(code) => return code,
        }
        if playback.shutdown {
            tracing::info!("[Engine:{}] shutdown acknowledged", opts.session_id);
            return EXIT_OK;
        }

        if let Some(time) = playback.pending_seek.take() {
            animator.seek(time);
        }

        let now = Instant::now();
        let mut dt = (now - last).as_secs_f32().clamp(0.0, max_dt);
        last = now;
        if playback.paused {
            dt = 0.0;
        }

        animator.write_frame(ring.slot_mut(cursor), dt, playback.speed);

        if writer
            .write(ipc::CHAN_FRAMES, &encode_slot_index(cursor as u32))
            .is_err()
        {
            tracing::warn!("[Engine:{}] parent pipe closed", opts.session_id);
            return EXIT_PARENT_LOST;
        }
        cursor = (cursor + 1) % ring.slots();

        let elapsed = iter_start.elapsed();
        if elapsed < target_dt {
            thread::sleep(target_dt - elapsed);
        } else {
            // Behind schedule; give the pump thread a chance and carry on.
            thread::yield_now();
        }
    }
}

/// Apply all pending commands; acks are sent within the same iteration.
fn drain_commands(
    rx: &mut RingReceiver<EngineInput>,
    writer: &mut FrameWriter<StdoutLock<'static>>,
    playback: &mut Playback,
) -> Result<(), i32> {
    for _ in 0..MAX_COMMANDS_DRAIN {
        match rx.try_recv() {
            Some(EngineInput::Command(frame)) => {
                apply_command(&frame.command, playback);
                if frame.reply_required {
                    let ack = Reply::Ack {
                        command_kind: frame.command.kind().to_string(),
                    };
                    if send_reply(writer, &ack).is_err() {
                        return Err(EXIT_PARENT_LOST);
                    }
                }
                if playback.shutdown {
                    return Ok(());
                }
            }
            Some(EngineInput::ParentLost) => return Err(EXIT_PARENT_LOST),
            None => return Ok(()),
        }
    }
    Ok(())
}

fn apply_command(command: &Command, playback: &mut Playback) {
    match command {
        Command::SetSpeed { value } => playback.speed = *value,
        Command::Pause => playback.paused = true,
        Command::Resume => playback.paused = false,
        Command::Seek { time } => playback.pending_seek = Some(*time),
        Command::Shutdown => playback.shutdown = true,
        // Binding is a handshake-phase command; a second one is a
        // protocol violation we log and ignore rather than die on.
        Command::SetShm { name } => {
            tracing::warn!("[Engine] unexpected set_shm {:?} after binding", name);
        }
    }
}

/// Handshake tail: wait (bounded) for `set_shm`, applying any state
/// commands that arrive ahead of it.
///
/// `Ok(Some(name))` = bound; `Ok(None)` = clean stop or parent loss
/// before binding (inspect `playback.shutdown`); `Err(code)` = fatal.
fn await_shm_binding(
    rx: &mut RingReceiver<EngineInput>,
    writer: &mut FrameWriter<StdoutLock<'static>>,
    playback: &mut Playback,
) -> Result<Option<String>, i32> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::error!("[Engine] no set_shm within {:?}", HANDSHAKE_TIMEOUT);
            return Err(EXIT_UNEXPECTED);
        }
        match rx.recv_timeout(remaining) {
            Some(EngineInput::Command(frame)) => {
                if let Command::SetShm { name } = &frame.command {
                    let name = name.clone();
                    if frame.reply_required {
                        let ack = Reply::Ack {
                            command_kind: "set_shm".to_string(),
                        };
                        if send_reply(writer, &ack).is_err() {
                            return Ok(None);
                        }
                    }
                    return Ok(Some(name));
                }
                apply_command(&frame.command, playback);
                if playback.shutdown {
                    return Ok(None);
                }
            }
            Some(EngineInput::ParentLost) => return Ok(None),
            None => {
                tracing::error!("[Engine] no set_shm within {:?}", HANDSHAKE_TIMEOUT);
                return Err(EXIT_UNEXPECTED);
            }
        }
    }
}

/// Read framed commands off stdin until EOF, feeding the loop's queue.
fn spawn_stdin_pump(mut tx: RingSender<EngineInput>) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut reader = FrameReader::new(stdin.lock());
        loop {
            match reader.read() {
                Ok((ipc::CHAN_CONTROL, payload)) => {
                    match serde_json::from_slice::<CommandFrame>(&payload) {
                        Ok(frame) => tx.send(EngineInput::Command(frame)),
                        Err(e) => tracing::warn!("[Engine] malformed command: {}", e),
                    }
                }
                Ok((chan, _)) => {
                    tracing::warn!("[Engine] unexpected frame on channel {}", chan);
                }
                Err(_) => {
                    tx.send(EngineInput::ParentLost);
                    return;
                }
            }
        }
    });
}

fn send_reply(writer: &mut FrameWriter<impl Write>, reply: &Reply) -> std::io::Result<()> {
    let payload = serde_json::to_vec(reply).expect("reply serialization is infallible");
    writer.write(ipc::CHAN_CONTROL, &payload)
}

fn send_init_failure(writer: &mut FrameWriter<impl Write>, reason: String) {
    tracing::error!("[Engine] init failure: {}", reason);
    let _ = send_reply(writer, &Reply::InitFailure { reason });
}
