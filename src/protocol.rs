use crate::skeleton::SkeletonDescriptor;
use serde::{Deserialize, Serialize};

/// Control command sent from the session to its engine process.
///
/// Commands are lossless and FIFO; the engine drains all pending commands
/// at the start of each loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Bind the engine to a named shared-memory region.
    SetShm { name: String },
    /// Change playback speed (1.0 = normal, may be negative).
    SetSpeed { value: f32 },
    /// Freeze the playback cursor; frames keep flowing with dt = 0.
    Pause,
    /// Resume at the pre-pause speed.
    Resume,
    /// Move the playback cursor to an absolute time.
    Seek { time: f32 },
    /// Detach and exit cleanly.
    Shutdown,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::SetShm { .. } => "set_shm",
            Command::SetSpeed { .. } => "set_speed",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Seek { .. } => "seek",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Envelope carried on the control channel: the command plus whether the
/// engine must acknowledge it within the same iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub command: Command,
    pub reply_required: bool,
}

impl CommandFrame {
    pub fn fire_and_forget(command: Command) -> Self {
        Self {
            command,
            reply_required: false,
        }
    }
}

/// Engine-to-session message on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// Handshake success: skeleton metadata and per-frame byte size.
    InitSuccess {
        skeleton: SkeletonDescriptor,
        frame_bytes: u32,
    },
    /// Handshake failure; the engine exits right after sending this.
    InitFailure { reason: String },
    /// Acknowledgement for a command with `reply_required = true`.
    Ack { command_kind: String },
}

/// Encode a published slot index for the frame channel.
#[inline]
pub fn encode_slot_index(slot: u32) -> [u8; 4] {
    slot.to_le_bytes()
}

/// Decode a slot index payload; `None` on malformed length.
#[inline]
pub fn decode_slot_index(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_round_trip() {
        let frame = CommandFrame {
            command: Command::SetSpeed { value: 2.5 },
            reply_required: true,
        };
        let json = serde_json::to_vec(&frame).unwrap();
        let back: CommandFrame = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn commands_are_tagged_by_kind() {
        let json = serde_json::to_value(Command::SetShm {
            name: "/posecast-s1".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "set_shm");
        assert_eq!(json["name"], "/posecast-s1");
        for cmd in [
            Command::Pause,
            Command::Resume,
            Command::Shutdown,
            Command::Seek { time: 1.0 },
        ] {
            let v = serde_json::to_value(&cmd).unwrap();
            assert_eq!(v["kind"], cmd.kind());
        }
    }

    #[test]
    fn reply_round_trip() {
        let reply = Reply::InitFailure {
            reason: "no such file".into(),
        };
        let json = serde_json::to_vec(&reply).unwrap();
        let back: Reply = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn slot_index_round_trip() {
        for slot in [0u32, 1, 2, 4_000_000] {
            assert_eq!(decode_slot_index(&encode_slot_index(slot)), Some(slot));
        }
        assert_eq!(decode_slot_index(&[1, 2, 3]), None);
    }
}
