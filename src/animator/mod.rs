//! Animator plug-in seam.
//!
//! Animators live inside the engine process and are the only component
//! that knows how a pose is computed. The core treats them as infinite
//! producers: after a successful `initialize` every other operation is
//! infallible.

mod clock;
mod wave;

pub use self::clock::ClockAnimator;
pub use self::wave::WaveAnimator;

use crate::skeleton::SkeletonDescriptor;

/// Bytes per bone in the default layout: a 4x4 matrix of f32.
pub const BONE_MATRIX_BYTES: usize = 64;

pub trait Animator: Send {
    /// All heavy loading happens here; blocking is permitted here and
    /// only here. The only fallible operation on the interface.
    fn initialize(&mut self, source: &str) -> anyhow::Result<()>;

    /// Pure after `initialize`.
    fn skeleton(&self) -> SkeletonDescriptor;

    /// Per-frame byte size; stable for the session lifetime.
    fn frame_bytes(&self) -> usize;

    /// Advance the playback cursor by `dt * speed` seconds and write
    /// exactly `frame_bytes()` bytes into `frame`. Must not perform I/O
    /// or allocate; an animator that cannot produce writes a defined
    /// pose and logs instead of failing.
    fn write_frame(&mut self, frame: &mut [u8], dt: f32, speed: f32);

    /// Move the playback cursor to an absolute time.
    fn seek(&mut self, time: f32);
}

/// Build an animator by kind. Kinds are opaque strings chosen by the
/// caller; unknown kinds are rejected before any process is spawned.
pub fn build(kind: &str) -> Option<Box<dyn Animator>> {
    match kind {
        "wave" => Some(Box::new(WaveAnimator::new())),
        "clock" => Some(Box::new(ClockAnimator::new())),
        _ => None,
    }
}

pub fn known_kinds() -> &'static [&'static str] {
    &["wave", "clock"]
}

/// Write one row-major 4x4 matrix into the frame at the given bone index.
#[inline]
pub(crate) fn write_mat4(frame: &mut [u8], bone: usize, m: &[f32; 16]) {
    let base = bone * BONE_MATRIX_BYTES;
    for (i, v) in m.iter().enumerate() {
        let at = base + i * 4;
        frame[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
}

/// Identity matrices for every bone: the defined fallback pose.
pub(crate) fn write_identity_pose(frame: &mut [u8]) {
    const IDENTITY: [f32; 16] = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ];
    let bones = frame.len() / BONE_MATRIX_BYTES;
    for bone in 0..bones {
        write_mat4(frame, bone, &IDENTITY);
    }
}
