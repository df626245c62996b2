use serde::{Deserialize, Serialize};

/// Static skeleton structure, produced once per session during the init
/// handshake and immutable afterwards. Clients need it before they can
/// interpret any pose frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkeletonDescriptor {
    /// Bone names, in the order bones appear inside a frame.
    pub bone_names: Vec<String>,
    /// Parent index per bone; -1 marks the root.
    pub parents: Vec<i32>,
    /// Optional rest pose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_pose: Option<BindPose>,
}

/// Rest pose of a skeleton: one position/rotation/scale triple per bone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindPose {
    pub positions: Vec<[f32; 3]>,
    /// Quaternions, `[x, y, z, w]`.
    pub rotations: Vec<[f32; 4]>,
    pub scales: Vec<[f32; 3]>,
}

impl SkeletonDescriptor {
    pub fn num_bones(&self) -> usize {
        self.bone_names.len()
    }

    /// Structural sanity check: parents array matches the bone count and
    /// every parent index is either -1 or a valid bone index.
    pub fn validate(&self) -> Result<(), String> {
        if self.bone_names.is_empty() {
            return Err("skeleton has no bones".to_string());
        }
        if self.parents.len() != self.bone_names.len() {
            return Err(format!(
                "parents length {} does not match bone count {}",
                self.parents.len(),
                self.bone_names.len()
            ));
        }
        for (i, &p) in self.parents.iter().enumerate() {
            if p != -1 && (p < 0 || p as usize >= self.bone_names.len()) {
                return Err(format!("bone {i} has out-of-range parent {p}"));
            }
        }
        if let Some(bind) = &self.bind_pose {
            let n = self.bone_names.len();
            if bind.positions.len() != n || bind.rotations.len() != n || bind.scales.len() != n {
                return Err("bind pose arrays do not match bone count".to_string());
            }
        }
        Ok(())
    }
}
