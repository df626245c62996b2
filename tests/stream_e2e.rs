//! End-to-end scenarios against the real engine binary.
//!
//! Each test creates sessions with machine-unique ids so shared-memory
//! names never collide across concurrently running test binaries.

use posecast::prelude::*;
use posecast::shm::{self, ShmRing};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

fn engine_cfg() -> ServerConfig {
    ServerConfig {
        engine_binary: Some(PathBuf::from(env!("CARGO_BIN_EXE_posecast-engine"))),
        init_timeout_ms: Some(5_000),
        ..Default::default()
    }
}

fn uid(tag: &str) -> String {
    format!("e2e-{}-{tag}", std::process::id())
}

/// The clock animator stamps its playback time into the first float.
fn clock_value(frame: &[u8]) -> f32 {
    f32::from_le_bytes(frame[0..4].try_into().unwrap())
}

async fn recv_frame(rx: &mut Receiver<Vec<u8>>) -> Vec<u8> {
    timeout(FRAME_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("frame stream closed unexpectedly")
}

fn drain(rx: &mut Receiver<Vec<u8>>) {
    while rx.try_recv().is_ok() {}
}

async fn wait_for_state(session: &Session, want: Lifecycle, within: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < within {
        if session.state() == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Measure how fast the clock advances relative to wall time.
async fn measure_rate(rx: &mut Receiver<Vec<u8>>, over: Duration) -> f32 {
    drain(rx);
    let first = clock_value(&recv_frame(rx).await);
    let t0 = Instant::now();
    tokio::time::sleep(over).await;
    drain(rx);
    let last = clock_value(&recv_frame(rx).await);
    (last - first) / t0.elapsed().as_secs_f32()
}

#[tokio::test]
async fn happy_path_delivers_sized_frames() {
    let manager = SessionManager::new(engine_cfg());
    let id = uid("happy");
    let session = manager.create(&id, "clock", "24").await.unwrap();

    let info = session.describe();
    assert_eq!(info.skeleton.num_bones(), 24);
    assert_eq!(info.frame_bytes, 24 * 64);
    assert_eq!(session.state(), Lifecycle::Ready);

    let (sink, mut rx) = ChannelSink::new(64);
    session.subscribe(Box::new(sink)).unwrap();
    assert_eq!(session.state(), Lifecycle::Streaming);

    let mut values = Vec::new();
    for _ in 0..5 {
        let frame = recv_frame(&mut rx).await;
        assert_eq!(frame.len(), 24 * 64);
        values.push(clock_value(&frame));
    }
    // Frames may be skipped under lag but never reordered.
    for pair in values.windows(2) {
        assert!(pair[1] >= pair[0], "time went backwards: {values:?}");
    }

    manager.delete(&id).await.unwrap();
    // Clean close: the sink's stream ends rather than erroring.
    assert!(timeout(FRAME_TIMEOUT, async {
        loop {
            if rx.recv().await.is_none() {
                break;
            }
        }
    })
    .await
    .is_ok());
}

#[tokio::test]
async fn speed_changes_take_effect_and_compose_fifo() {
    let manager = SessionManager::new(engine_cfg());
    let id = uid("speed");
    let session = manager.create(&id, "clock", "4").await.unwrap();
    let (sink, mut rx) = ChannelSink::new(256);
    session.subscribe(Box::new(sink)).unwrap();

    let rate_normal = measure_rate(&mut rx, Duration::from_millis(600)).await;
    assert!(
        (0.3..1.7).contains(&rate_normal),
        "normal rate {rate_normal} out of range"
    );

    session.set_speed(2.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rate_double = measure_rate(&mut rx, Duration::from_millis(600)).await;
    let ratio = rate_double / rate_normal;
    assert!(
        (1.4..2.9).contains(&ratio),
        "speed 2.0 ratio {ratio} out of range ({rate_normal} -> {rate_double})"
    );

    // Last write wins: 5.0 then 1.0 must land on 1.0.
    session.set_speed(5.0).await.unwrap();
    session.set_speed(1.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rate_reset = measure_rate(&mut rx, Duration::from_millis(600)).await;
    let ratio = rate_reset / rate_normal;
    assert!(
        (0.4..1.8).contains(&ratio),
        "reset ratio {ratio} out of range"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn pause_freezes_and_resume_restores() {
    let manager = SessionManager::new(engine_cfg());
    let id = uid("pause");
    let session = manager.create(&id, "clock", "2").await.unwrap();
    let (sink, mut rx) = ChannelSink::new(256);
    session.subscribe(Box::new(sink)).unwrap();
    recv_frame(&mut rx).await;

    manager.pause(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    drain(&mut rx);
    let frozen_a = clock_value(&recv_frame(&mut rx).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    drain(&mut rx);
    let frozen_b = clock_value(&recv_frame(&mut rx).await);
    assert_eq!(frozen_a, frozen_b, "clock advanced while paused");

    manager.resume(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    drain(&mut rx);
    let resumed = clock_value(&recv_frame(&mut rx).await);
    assert!(resumed > frozen_b, "clock did not advance after resume");

    manager.shutdown().await;
}

#[tokio::test]
async fn seek_moves_the_cursor() {
    let manager = SessionManager::new(engine_cfg());
    let id = uid("seek");
    let session = manager.create(&id, "clock", "2").await.unwrap();
    let (sink, mut rx) = ChannelSink::new(64);
    session.subscribe(Box::new(sink)).unwrap();
    recv_frame(&mut rx).await;

    session.seek(500.0).await.unwrap();
    let deadline = Instant::now() + FRAME_TIMEOUT;
    loop {
        let value = clock_value(&recv_frame(&mut rx).await);
        if value >= 500.0 {
            break;
        }
        assert!(Instant::now() < deadline, "seek never took effect");
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn init_failure_reports_and_leaves_no_shm() {
    let manager = SessionManager::new(engine_cfg());
    let id = uid("initfail");
    let start = Instant::now();
    let err = manager.create(&id, "clock", "banana").await.unwrap_err();
    assert!(
        matches!(err, SessionError::InitFailure(_)),
        "unexpected error: {err}"
    );
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "init failure took {:?}",
        start.elapsed()
    );

    let name = shm::region_name("posecast", &id);
    assert!(ShmRing::attach(&name, 3, 64).is_err(), "stale shm left at {name}");
    assert!(manager.get(&id).await.is_none());
}

#[tokio::test]
async fn invalid_inputs_are_rejected_before_spawn() {
    let manager = SessionManager::new(engine_cfg());

    let err = manager.create("bad id!", "clock", "4").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidInput(_)));

    let err = manager
        .create(&uid("kind"), "motion-matching", "4")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidInput(_)));

    let err = manager.delete("never-created").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}

#[tokio::test]
async fn duplicate_ids_are_rejected_until_deleted() {
    let manager = SessionManager::new(engine_cfg());
    let id = uid("dup");
    manager.create(&id, "clock", "2").await.unwrap();

    let err = manager.create(&id, "clock", "2").await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyExists(_)));

    manager.delete(&id).await.unwrap();
    manager.create(&id, "clock", "2").await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn late_subscriber_starts_within_a_tick() {
    let manager = SessionManager::new(engine_cfg());
    let id = uid("late");
    let session = manager.create(&id, "clock", "2").await.unwrap();

    // Engine has been producing unobserved for a while.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.state(), Lifecycle::Ready);

    let (sink, mut rx) = ChannelSink::new(64);
    session.subscribe(Box::new(sink)).unwrap();
    let start = Instant::now();
    let frame = recv_frame(&mut rx).await;
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "first frame took {:?}",
        start.elapsed()
    );
    // The counter gap from the unobserved period is fine; monotonic from here.
    let first = clock_value(&frame);
    let second = clock_value(&recv_frame(&mut rx).await);
    assert!(second >= first);

    manager.shutdown().await;
}

#[tokio::test]
async fn engine_crash_fails_the_session_cleanly() {
    let manager = SessionManager::new(engine_cfg());
    let id = uid("crash");
    let session = manager.create(&id, "clock", "2").await.unwrap();
    let (sink, mut rx) = ChannelSink::new(64);
    session.subscribe(Box::new(sink)).unwrap();
    recv_frame(&mut rx).await;

    let pid = session.engine_pid().expect("engine pid");
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    assert!(
        wait_for_state(&session, Lifecycle::Failed, Duration::from_secs(2)).await,
        "session did not fail after engine kill"
    );

    // Subscribers get a clean close, not an error.
    assert!(timeout(FRAME_TIMEOUT, async {
        loop {
            if rx.recv().await.is_none() {
                break;
            }
        }
    })
    .await
    .is_ok());

    // Shared memory is gone.
    let name = shm::region_name("posecast", &id);
    assert!(ShmRing::attach(&name, 3, 128).is_err());

    // Control ops on a failed session report the loss; close stays ok.
    let err = session.pause().await.unwrap_err();
    assert!(matches!(err, SessionError::EngineLost));
    session.close().await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn close_and_unsubscribe_are_idempotent() {
    let manager = SessionManager::new(engine_cfg());
    let id = uid("idem");
    let session = manager.create(&id, "clock", "2").await.unwrap();

    let (sink, mut rx) = ChannelSink::new(64);
    let handle = session.subscribe(Box::new(sink)).unwrap();
    recv_frame(&mut rx).await;

    session.unsubscribe(handle);
    session.unsubscribe(handle);

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(session.state(), Lifecycle::Closed);

    // Past Closing, operations are rejected.
    let err = session.set_speed(1.5).await.unwrap_err();
    assert!(matches!(err, SessionError::ClosedSession));
    let (sink2, _rx2) = ChannelSink::new(4);
    assert!(matches!(
        session.subscribe(Box::new(sink2)),
        Err(SessionError::ClosedSession)
    ));

    // Close released the shared memory.
    let name = shm::region_name("posecast", &id);
    assert!(ShmRing::attach(&name, 3, 128).is_err());

    manager.delete(&id).await.unwrap();
}

#[tokio::test]
async fn wave_animator_streams_rig_frames() {
    use std::io::Write;

    let rig_path = std::env::temp_dir().join(format!("posecast-e2e-rig-{}.json", std::process::id()));
    let mut f = std::fs::File::create(&rig_path).unwrap();
    f.write_all(
        br#"{
            "bone_names": ["root", "spine", "head"],
            "parents": [-1, 0, 1],
            "bind_pose": {
                "positions": [[0,0,0],[0,1,0],[0,2,0]],
                "rotations": [[0,0,0,1],[0,0,0,1],[0,0,0,1]],
                "scales": [[1,1,1],[1,1,1],[1,1,1]]
            }
        }"#,
    )
    .unwrap();
    drop(f);

    let manager = SessionManager::new(engine_cfg());
    let id = uid("wave");
    let session = manager
        .create(&id, "wave", rig_path.to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(session.describe().skeleton.bone_names[0], "root");
    assert_eq!(session.describe().frame_bytes, 3 * 64);

    let (sink, mut rx) = ChannelSink::new(64);
    session.subscribe(Box::new(sink)).unwrap();
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.len(), 3 * 64);
    // Bone 2 carries its bind translation in the fourth matrix row.
    let at = 2 * 64 + 13 * 4;
    let y = f32::from_le_bytes(frame[at..at + 4].try_into().unwrap());
    assert_eq!(y, 2.0);

    manager.shutdown().await;
    std::fs::remove_file(rig_path).ok();
}
