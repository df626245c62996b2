//! Per-session compute worker. Spawned by the session control plane with
//! piped stdio: commands arrive on stdin, replies and published slot
//! indices leave on stdout, logs go to stderr.

use clap::Parser;
use posecast::engine::{self, EngineOpts};
use posecast::logger::LoggerConfig;

#[derive(Parser, Debug)]
#[command(name = "posecast-engine", about = "posecast animation engine worker")]
struct Args {
    /// Session id this worker belongs to (used for logging only).
    #[arg(long)]
    session_id: String,

    /// Animator kind to instantiate.
    #[arg(long)]
    kind: String,

    /// Motion source reference handed to the animator.
    #[arg(long)]
    source: String,

    /// Target production cadence in frames per second.
    #[arg(long, default_value_t = 60.0)]
    fps: f64,

    /// Shared-memory slot count the parent allocated.
    #[arg(long, default_value_t = 3)]
    slots: usize,
}

fn main() {
    let _log_guard = LoggerConfig::from_env().init().ok().flatten();

    let args = Args::parse();
    let opts = EngineOpts {
        session_id: args.session_id,
        kind: args.kind,
        source: args.source,
        target_fps: if args.fps.is_finite() && args.fps > 0.0 {
            args.fps
        } else {
            60.0
        },
        slots: args.slots.max(2),
    };

    std::process::exit(engine::run(&opts));
}
