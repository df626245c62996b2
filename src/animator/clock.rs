use super::{Animator, BONE_MATRIX_BYTES, write_identity_pose};
use crate::skeleton::SkeletonDescriptor;
use anyhow::bail;

const MAX_BONES: usize = 1024;

/// Diagnostic animator: identity pose for every bone, with the
/// accumulated playback time stamped into element [0][0] of bone 0.
///
/// The source reference is the bone count as a decimal string. Useful as
/// a latency/pacing probe and as the measurable animator the end-to-end
/// suite drives. Playback time grows without bound (no looping).
pub struct ClockAnimator {
    bones: usize,
    t: f32,
}

impl ClockAnimator {
    pub fn new() -> Self {
        Self { bones: 0, t: 0.0 }
    }

    #[cfg(test)]
    pub(crate) fn time(&self) -> f32 {
        self.t
    }
}

impl Default for ClockAnimator {
    fn default() -> Self {
        Self::new()
    }
}

impl Animator for ClockAnimator {
    fn initialize(&mut self, source: &str) -> anyhow::Result<()> {
        let bones: usize = match source.trim().parse() {
            Ok(n) => n,
            Err(_) => bail!("clock source must be a bone count, got {source:?}"),
        };
        if bones == 0 || bones > MAX_BONES {
            bail!("clock bone count must be in 1..={MAX_BONES}, got {bones}");
        }
        self.bones = bones;
        Ok(())
    }

    fn skeleton(&self) -> SkeletonDescriptor {
        SkeletonDescriptor {
            bone_names: (0..self.bones).map(|i| format!("bone_{i}")).collect(),
            parents: (0..self.bones).map(|i| i as i32 - 1).collect(),
            bind_pose: None,
        }
    }

    fn frame_bytes(&self) -> usize {
        self.bones * BONE_MATRIX_BYTES
    }

    fn write_frame(&mut self, frame: &mut [u8], dt: f32, speed: f32) {
        debug_assert_eq!(frame.len(), self.frame_bytes());
        self.t += dt * speed;
        write_identity_pose(frame);
        frame[0..4].copy_from_slice(&self.t.to_le_bytes());
    }

    fn seek(&mut self, time: f32) {
        self.t = time;
    }
}
