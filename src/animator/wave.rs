use super::{Animator, BONE_MATRIX_BYTES, write_mat4};
use crate::skeleton::SkeletonDescriptor;
use anyhow::Context;
use std::f32::consts::TAU;

/// Swing frequency in cycles per second.
const SWING_HZ: f32 = 0.5;
/// Swing amplitude in radians.
const AMPLITUDE: f32 = 0.6;
/// Phase offset between consecutive bones, for a travelling-wave look.
const BONE_PHASE: f32 = 0.4;

/// Procedural animator over a skeleton rig loaded from a JSON file.
///
/// The source reference is a path to a rig file holding a serialized
/// [`SkeletonDescriptor`]. Playback swings each bone around the Y axis
/// with a per-bone phase offset; motion is periodic, so the playback
/// cursor effectively loops.
///
/// Frame layout: row-major 4x4 f32 matrices, translation in the fourth
/// row, one matrix per bone in rig order.
pub struct WaveAnimator {
    rig: Option<SkeletonDescriptor>,
    t: f32,
}

impl WaveAnimator {
    pub fn new() -> Self {
        Self { rig: None, t: 0.0 }
    }

    fn rig(&self) -> &SkeletonDescriptor {
        self.rig.as_ref().expect("animator not initialized")
    }
}

impl Default for WaveAnimator {
    fn default() -> Self {
        Self::new()
    }
}

impl Animator for WaveAnimator {
    fn initialize(&mut self, source: &str) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(source)
            .with_context(|| format!("cannot read rig file {source}"))?;
        let rig: SkeletonDescriptor =
            serde_json::from_str(&raw).with_context(|| format!("cannot parse rig file {source}"))?;
        rig.validate().map_err(anyhow::Error::msg)?;
        self.rig = Some(rig);
        Ok(())
    }

    fn skeleton(&self) -> SkeletonDescriptor {
        self.rig().clone()
    }

    fn frame_bytes(&self) -> usize {
        self.rig().num_bones() * BONE_MATRIX_BYTES
    }

    fn write_frame(&mut self, frame: &mut [u8], dt: f32, speed: f32) {
        self.t += dt * speed;

        let Some(rig) = self.rig.as_ref() else {
            // Cannot produce: fall back to the defined pose.
            tracing::error!("wave animator driven before initialize");
            super::write_identity_pose(frame);
            return;
        };
        debug_assert_eq!(frame.len(), rig.num_bones() * BONE_MATRIX_BYTES);
        let bind = rig.bind_pose.as_ref();
        for bone in 0..rig.num_bones() {
            let angle = (self.t * SWING_HZ * TAU + bone as f32 * BONE_PHASE).sin() * AMPLITUDE;
            let (sin, cos) = angle.sin_cos();
            let pos = bind
                .map(|b| b.positions[bone])
                .unwrap_or([0.0, bone as f32, 0.0]);

            // Rotation about Y, translation in the fourth row.
            let m: [f32; 16] = [
                cos, 0.0, -sin, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                sin, 0.0, cos, 0.0, //
                pos[0], pos[1], pos[2], 1.0,
            ];
            write_mat4(frame, bone, &m);
        }
    }

    fn seek(&mut self, time: f32) {
        self.t = time;
    }
}
